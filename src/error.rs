use std::path::PathBuf;

use thiserror::Error;

use crate::compiler::Diagnostics;
use crate::game::{Action, GameState};
use crate::{GameId, MutantId, PlayerId, Role};

/// Faults of the compiler or sandbox. These are never judging outcomes.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum InfraError {
    #[error("command template is empty")]
    EmptyCommand,

    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("lost track of {program} while waiting for it: {source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("compiler did not finish within {timeout_ms} ms")]
    CompileTimeout { timeout_ms: u64 },

    #[error("workspace I/O failed at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("classpath entry {} contains the path separator", .path.display())]
    Classpath { path: PathBuf },

    #[error("sandbox failure: {0}")]
    Sandbox(String),
}

impl InfraError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        InfraError::Io {
            path: path.into(),
            source,
        }
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    #[error("store lock poisoned")]
    Poisoned,

    #[error("{kind} {id} not found")]
    Missing { kind: &'static str, id: u32 },

    #[error("mutant {id} cannot move from {from:?} to {to:?}")]
    IllegalTransition {
        id: MutantId,
        from: crate::mutants::MutantState,
        to: crate::mutants::MutantState,
    },

    #[error("game {game} already holds an identical mutant {existing}")]
    DuplicateMutant { game: GameId, existing: MutantId },

    #[error("failed to persist snapshot to {}: {source}", .path.display())]
    Persist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt snapshot at {}: {source}", .path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Everything an engine operation can fail with.
///
/// `Compile`, `Validation`, `Duplicate`, `FailsOnOriginal`, `DuelConflict` and
/// `NotClaimable` are recoverable and meant to be shown to the acting player.
/// `Infra` means a verdict could not be produced at all.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EngineError {
    #[error("submission does not compile ({} error line(s))", .0.errors.len())]
    Compile(Diagnostics),

    #[error("submission rejected: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("an identical mutant already exists (mutant {existing})")]
    Duplicate {
        existing: MutantId,
        diagnostics: Option<Diagnostics>,
    },

    #[error("test does not pass on the original class")]
    FailsOnOriginal { evidence: String },

    #[error("equivalence duel on mutant {mutant}: {reason}")]
    DuelConflict { mutant: MutantId, reason: String },

    #[error("no mutant of another attacker touches a covered line among the selected ones")]
    NotClaimable,

    #[error("cannot {action} while game {game} is {state}")]
    IllegalAction {
        game: GameId,
        action: Action,
        state: GameState,
    },

    #[error("game {game} cannot move from {from} to {to}")]
    GameTransition {
        game: GameId,
        from: GameState,
        to: GameState,
    },

    #[error("player {player} does not play as {expected} in this game")]
    WrongRole { player: PlayerId, expected: Role },

    #[error("player {player} does not take part in game {game}")]
    NotInGame { player: PlayerId, game: GameId },

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: u32 },

    #[error(transparent)]
    Infra(#[from] InfraError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl EngineError {
    pub(crate) fn conflict(mutant: MutantId, reason: impl Into<String>) -> Self {
        EngineError::DuelConflict {
            mutant,
            reason: reason.into(),
        }
    }

    /// Whether the error is a normal rejection of the player's input rather
    /// than a fault of the engine or its collaborators.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, EngineError::Infra(_) | EngineError::Store(_))
    }
}
