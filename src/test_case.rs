use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::compiler::{ArtifactHandle, Diagnostics};
use crate::mutants::Mutant;
use crate::{ClassId, GameId, PlayerId, TestId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TestState {
    /// Compiles and passes on the unmodified class under test.
    Valid,
    Invalid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    pub id: TestId,
    pub game_id: GameId,
    pub class_id: ClassId,
    pub player_id: PlayerId,
    pub class_name: String,
    pub source: String,
    pub artifact: Option<ArtifactHandle>,
    pub diagnostics: Option<Diagnostics>,
    pub passes_on_original: bool,
    pub state: TestState,
    pub score: i32,
    /// Lines of the class under test executed when run on the original.
    pub covered_lines: BTreeSet<u32>,
    /// Lines the defender declared they meant to cover.
    pub target_lines: BTreeSet<u32>,
    pub created_at: u64,
}

impl TestCase {
    pub fn is_valid(&self) -> bool {
        self.state == TestState::Valid && self.artifact.is_some()
    }

    pub fn covers_line(&self, line: u32) -> bool {
        self.covered_lines.contains(&line)
    }

    pub fn covers(&self, mutant: &Mutant) -> bool {
        !self.covered_lines.is_disjoint(&mutant.lines)
    }
}

#[derive(Debug, Clone)]
pub struct NewTest {
    pub game_id: GameId,
    pub class_id: ClassId,
    pub player_id: PlayerId,
    pub class_name: String,
    pub source: String,
    pub artifact: Option<ArtifactHandle>,
    pub diagnostics: Option<Diagnostics>,
    pub passes_on_original: bool,
    pub covered_lines: BTreeSet<u32>,
    pub target_lines: BTreeSet<u32>,
}

impl NewTest {
    pub fn state(&self) -> TestState {
        if self.passes_on_original && self.artifact.is_some() {
            TestState::Valid
        } else {
            TestState::Invalid
        }
    }
}
