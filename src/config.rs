use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_COMPILER_COMMAND: &str = "javac -encoding UTF-8 -d {out} -cp {classpath} {source}";
pub const DEFAULT_JUDGE_COMMAND: &str = "java -cp {classpath} org.junit.runner.JUnitCore {test_class}";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Engine settings. Every field has a default so a config file only needs the
/// values it changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Root of the per-submission build directories.
    pub workspace_root: PathBuf,
    pub compiler_command: String,
    pub judge_command: String,
    /// Extra classpath entries, e.g. the JUnit jars.
    pub classpath: Vec<PathBuf>,
    pub compile_timeout_ms: u64,
    pub judge_timeout_ms: u64,
    /// Upper bound on tests run when validating an equivalence verdict. Zero
    /// turns validation off.
    pub duel_validation_max_tests: usize,
    /// Seed for the validation test sample; random when absent.
    pub validation_seed: Option<u64>,
    /// Parallel judge runs within one kill-map build.
    pub workers: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            workspace_root: std::env::temp_dir().join("mutduel"),
            compiler_command: DEFAULT_COMPILER_COMMAND.to_string(),
            judge_command: DEFAULT_JUDGE_COMMAND.to_string(),
            classpath: Vec::new(),
            compile_timeout_ms: 60_000,
            judge_timeout_ms: 10_000,
            duel_validation_max_tests: 10,
            validation_seed: None,
            workers: 1,
        }
    }
}

impl EngineConfig {
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: EngineConfig = serde_json::from_str(&data).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.compiler_command.trim().is_empty() {
            return Err(ConfigError::Invalid("compiler_command is empty".into()));
        }
        if self.judge_command.trim().is_empty() {
            return Err(ConfigError::Invalid("judge_command is empty".into()));
        }
        if self.compile_timeout_ms == 0 || self.judge_timeout_ms == 0 {
            return Err(ConfigError::Invalid("timeouts must be greater than zero".into()));
        }
        if self.workers == 0 {
            return Err(ConfigError::Invalid("workers must be at least 1".into()));
        }
        Ok(())
    }

    pub fn compile_timeout(&self) -> Duration {
        Duration::from_millis(self.compile_timeout_ms)
    }

    pub fn judge_timeout(&self) -> Duration {
        Duration::from_millis(self.judge_timeout_ms)
    }
}
