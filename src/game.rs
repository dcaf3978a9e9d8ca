use serde::{Deserialize, Serialize};

use crate::compiler::ArtifactHandle;
use crate::{ClassId, GameId, PlayerId, Role};

/// Lifecycle of a match. `Finished` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GameState {
    Created,
    Active,
    GraceOne,
    GraceTwo,
    Finished,
}

/// Player actions gated by the game state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    Join,
    SubmitMutant,
    SubmitTest,
    ClaimEquivalence,
    ResolveEquivalence,
}

impl std::fmt::Display for GameState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            GameState::Created => "created",
            GameState::Active => "active",
            GameState::GraceOne => "in grace period one",
            GameState::GraceTwo => "in grace period two",
            GameState::Finished => "finished",
        };
        f.write_str(name)
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Action::Join => "join",
            Action::SubmitMutant => "submit a mutant",
            Action::SubmitTest => "submit a test",
            Action::ClaimEquivalence => "claim equivalence",
            Action::ResolveEquivalence => "resolve an equivalence duel",
        };
        f.write_str(name)
    }
}

impl GameState {
    pub fn permits(self, action: Action) -> bool {
        use GameState::*;
        match action {
            Action::Join => matches!(self, Created | Active),
            Action::SubmitMutant | Action::SubmitTest => self == Active,
            Action::ClaimEquivalence => matches!(self, Active | GraceOne),
            Action::ResolveEquivalence => matches!(self, Active | GraceOne | GraceTwo),
        }
    }

    pub fn can_transition_to(self, next: GameState) -> bool {
        use GameState::*;
        matches!(
            (self, next),
            (Created, Active)
                | (Active, GraceOne)
                | (GraceOne, GraceTwo)
                | (Created, Finished)
                | (Active, Finished)
                | (GraceOne, Finished)
                | (GraceTwo, Finished)
        )
    }

    pub fn is_finished(self) -> bool {
        self == GameState::Finished
    }
}

/// Per-game rules fixed at creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GameRules {
    /// Number of covering tests, submitted after a mutant, that trigger an
    /// automatic equivalence claim. Zero disables the feature.
    pub auto_equivalence_threshold: u32,
    /// Submissions (valid or not) after which an active game enters grace.
    pub round_limit: Option<u32>,
    /// Zero means unlimited.
    pub max_assertions_per_test: u32,
    pub capture_intentions: bool,
}

impl Default for GameRules {
    fn default() -> Self {
        GameRules {
            auto_equivalence_threshold: 0,
            round_limit: None,
            max_assertions_per_test: 2,
            capture_intentions: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Game {
    pub id: GameId,
    pub class_id: ClassId,
    pub state: GameState,
    /// Starts at one and advances with every submission.
    pub round: u32,
    pub valid_submissions: u32,
    pub invalid_submissions: u32,
    pub rules: GameRules,
    pub created_at: u64,
}

impl Game {
    pub fn submissions(&self) -> u32 {
        self.valid_submissions + self.invalid_submissions
    }

    pub fn round_limit_reached(&self) -> bool {
        self.rules
            .round_limit
            .is_some_and(|limit| self.submissions() >= limit)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Player {
    pub id: PlayerId,
    pub game_id: GameId,
    pub name: String,
    pub role: Role,
    pub points: i32,
}

/// A compiled class under test shared by every game played on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameClass {
    pub id: ClassId,
    pub name: String,
    pub source: String,
    pub artifact: ArtifactHandle,
}
