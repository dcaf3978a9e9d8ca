pub mod compiler;
pub mod config;
pub mod duel;
pub mod engine;
pub mod error;
pub mod events;
pub mod game;
pub mod judge;
pub mod killmap;
pub mod mutants;
pub mod orchestrator;
pub mod output;
pub mod runner;
pub mod selection;
pub mod state;
pub mod store;
pub mod test_case;
pub mod validation;
pub mod workspace;

use serde::{Deserialize, Serialize};

pub type ClassId = u32;
pub type GameId = u32;
pub type PlayerId = u32;
pub type MutantId = u32;
pub type TestId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Attacker,
    Defender,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Attacker => f.write_str("attacker"),
            Role::Defender => f.write_str("defender"),
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "attacker" | "a" => Ok(Role::Attacker),
            "defender" | "d" => Ok(Role::Defender),
            other => Err(format!("unknown role '{}', expected attacker or defender", other)),
        }
    }
}

/// Who performed an action. Automatic equivalence claims are made by the
/// engine itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Actor {
    System,
    Player(PlayerId),
}

impl Actor {
    pub fn player(self) -> Option<PlayerId> {
        match self {
            Actor::System => None,
            Actor::Player(id) => Some(id),
        }
    }
}

/// Milliseconds since the unix epoch, saturating at zero on a skewed clock.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
