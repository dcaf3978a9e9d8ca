use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::error::InfraError;
use crate::runner::{self, CommandTemplate, ProcessOutcome};

/// Compiled classes of one submission.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactHandle {
    pub class_name: String,
    /// Directory holding the class files; a classpath root.
    pub dir: PathBuf,
    /// SHA-256 over the class files, in path order.
    pub digest: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineDiagnostic {
    pub line: u32,
    pub message: String,
}

/// Raw compiler output plus the error lines parsed out of it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostics {
    pub raw: String,
    pub errors: Vec<LineDiagnostic>,
}

impl Diagnostics {
    pub fn from_output(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        let errors = extract_error_lines(&raw);
        Diagnostics { raw, errors }
    }

    pub fn error_lines(&self) -> Vec<u32> {
        self.errors.iter().map(|e| e.line).collect()
    }
}

fn error_line_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^\s*(?:\[javac\]\s*)?.*\.java:([0-9]+):\s*error:\s*(.*)$")
            .expect("error line pattern is valid")
    })
}

/// Pulls `(line, message)` pairs out of javac-shaped output such as
/// `[javac] /tmp/x/Foo.java:12: error: ';' expected`.
pub fn extract_error_lines(output: &str) -> Vec<LineDiagnostic> {
    output
        .lines()
        .filter_map(|line| {
            let caps = error_line_pattern().captures(line)?;
            let line_no = caps.get(1)?.as_str().parse().ok()?;
            Some(LineDiagnostic {
                line: line_no,
                message: caps.get(2).map(|m| m.as_str().trim().to_string()).unwrap_or_default(),
            })
        })
        .collect()
}

/// Name of the first class declared in `source`.
pub fn class_name_of(source: &str) -> Option<String> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = PATTERN.get_or_init(|| {
        Regex::new(r"\bclass\s+([A-Za-z_$][A-Za-z0-9_$]*)").expect("class pattern is valid")
    });
    pattern
        .captures(source)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

pub fn sha256_hex(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Hashes every regular file under `dir`, relative path included, in sorted
/// order so the digest does not depend on directory iteration order.
pub fn digest_dir(dir: &Path) -> Result<String, InfraError> {
    let mut files = Vec::new();
    collect_files(dir, dir, &mut files)?;
    files.sort();
    let mut hasher = Sha256::new();
    for rel in &files {
        let path = dir.join(rel);
        let bytes = fs::read(&path).map_err(|e| InfraError::io(&path, e))?;
        hasher.update(rel.to_string_lossy().as_bytes());
        hasher.update([0u8]);
        hasher.update(&bytes);
    }
    Ok(hasher.finalize().iter().map(|b| format!("{:02x}", b)).collect())
}

fn collect_files(root: &Path, dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), InfraError> {
    let entries = fs::read_dir(dir).map_err(|e| InfraError::io(dir, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| InfraError::io(dir, e))?;
        let path = entry.path();
        let ft = entry.file_type().map_err(|e| InfraError::io(&path, e))?;
        if ft.is_dir() {
            collect_files(root, &path, out)?;
        } else if ft.is_file() {
            if let Ok(rel) = path.strip_prefix(root) {
                out.push(rel.to_path_buf());
            }
        }
    }
    Ok(())
}

/// A single class to compile.
#[derive(Debug, Clone, Copy)]
pub struct CompileUnit<'a> {
    pub class_name: &'a str,
    pub source: &'a str,
}

#[derive(Debug, Clone)]
pub enum CompileResult {
    Compiled(ArtifactHandle),
    Failed(Diagnostics),
}

pub trait Compiler: Send + Sync {
    /// Compiles `unit` into `out_dir`, with `reference` (the compiled class
    /// under test) on the classpath when given. Compiling the same unit into
    /// the same directory again yields the same artifact.
    fn compile(
        &self,
        unit: &CompileUnit<'_>,
        reference: Option<&ArtifactHandle>,
        out_dir: &Path,
    ) -> Result<CompileResult, InfraError>;
}

/// Runs an external compiler described by a command template.
///
/// Placeholders: `{source}` (the written source file), `{out}` (class output
/// directory), `{classpath}`.
#[derive(Debug, Clone)]
pub struct CommandCompiler {
    template: CommandTemplate,
    classpath: Vec<PathBuf>,
    timeout: Duration,
}

impl CommandCompiler {
    pub fn new(template: &str, classpath: Vec<PathBuf>, timeout: Duration) -> Result<Self, InfraError> {
        Ok(CommandCompiler {
            template: CommandTemplate::parse(template)?,
            classpath,
            timeout,
        })
    }
}

impl Compiler for CommandCompiler {
    fn compile(
        &self,
        unit: &CompileUnit<'_>,
        reference: Option<&ArtifactHandle>,
        out_dir: &Path,
    ) -> Result<CompileResult, InfraError> {
        let src_dir = out_dir.join("src");
        let classes_dir = out_dir.join("classes");
        fs::create_dir_all(&src_dir).map_err(|e| InfraError::io(&src_dir, e))?;
        if classes_dir.exists() {
            fs::remove_dir_all(&classes_dir).map_err(|e| InfraError::io(&classes_dir, e))?;
        }
        fs::create_dir_all(&classes_dir).map_err(|e| InfraError::io(&classes_dir, e))?;

        let source_file = src_dir.join(format!("{}.java", unit.class_name));
        fs::write(&source_file, unit.source).map_err(|e| InfraError::io(&source_file, e))?;

        let mut entries: Vec<&Path> = Vec::new();
        if let Some(reference) = reference {
            entries.push(&reference.dir);
        }
        entries.extend(self.classpath.iter().map(PathBuf::as_path));
        let classpath = if entries.is_empty() {
            ".".to_string()
        } else {
            runner::join_classpath(entries)?
        };

        let source_arg = source_file.to_string_lossy().to_string();
        let out_arg = classes_dir.to_string_lossy().to_string();
        let (program, args) = self.template.render(&[
            ("source", &source_arg),
            ("out", &out_arg),
            ("classpath", &classpath),
        ]);

        debug!(class = unit.class_name, dir = %out_dir.display(), "compiling");
        let outcome = runner::run_with_timeout(&program, &args, out_dir, &[], self.timeout)?;
        match outcome {
            ProcessOutcome::TimedOut { .. } => Err(InfraError::CompileTimeout {
                timeout_ms: self.timeout.as_millis() as u64,
            }),
            ProcessOutcome::Exited { success: true, .. } => {
                let digest = digest_dir(&classes_dir)?;
                info!(class = unit.class_name, digest = %digest, "compiled");
                Ok(CompileResult::Compiled(ArtifactHandle {
                    class_name: unit.class_name.to_string(),
                    dir: classes_dir,
                    digest,
                }))
            }
            ProcessOutcome::Exited { .. } => {
                let diagnostics = Diagnostics::from_output(outcome.combined_output());
                info!(
                    class = unit.class_name,
                    errors = diagnostics.errors.len(),
                    "compilation failed"
                );
                Ok(CompileResult::Failed(diagnostics))
            }
        }
    }
}
