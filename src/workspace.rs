use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::InfraError;
use crate::{GameId, PlayerId};

const MAX_ATTEMPTS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionKind {
    Mutant,
    Test,
}

impl SubmissionKind {
    fn dir_name(self) -> &'static str {
        match self {
            SubmissionKind::Mutant => "mutants",
            SubmissionKind::Test => "tests",
        }
    }
}

/// Directory layout for compiled submissions:
///
/// ```text
/// <root>/classes/<Name>/...
/// <root>/game-<id>/{mutants,tests}/<player>/<stamp>-<suffix>/...
/// ```
///
/// Every submission gets a directory of its own, so concurrent compiles never
/// share output.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Workspace { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Build directory of a class under test, reused when the same class is
    /// registered again.
    pub fn class_dir(&self, name: &str) -> Result<PathBuf, InfraError> {
        let dir = self.root.join("classes").join(name);
        fs::create_dir_all(&dir).map_err(|e| InfraError::io(&dir, e))?;
        Ok(dir)
    }

    /// A fresh, empty directory for one submission.
    pub fn submission_dir(
        &self,
        game: GameId,
        kind: SubmissionKind,
        player: PlayerId,
    ) -> Result<PathBuf, InfraError> {
        let parent = self
            .root
            .join(format!("game-{}", game))
            .join(kind.dir_name())
            .join(player.to_string());
        fs::create_dir_all(&parent).map_err(|e| InfraError::io(&parent, e))?;

        for _ in 0..MAX_ATTEMPTS {
            let dir = parent.join(format!("{}-{:08x}", crate::now_ms(), fastrand::u32(..)));
            match fs::create_dir(&dir) {
                Ok(()) => {
                    debug!(dir = %dir.display(), "submission directory created");
                    return Ok(dir);
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(InfraError::io(&dir, e)),
            }
        }
        Err(InfraError::Sandbox(format!(
            "could not allocate a submission directory under {}",
            parent.display()
        )))
    }

    /// Removes the directory of a rejected submission. Failures are logged.
    pub fn discard(&self, dir: &Path) {
        if !dir.starts_with(&self.root) {
            warn!(dir = %dir.display(), "refusing to remove a directory outside the workspace");
            return;
        }
        if let Err(e) = fs::remove_dir_all(dir) {
            warn!(dir = %dir.display(), error = %e, "failed to remove submission directory");
        }
    }
}
