use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use similar::{ChangeTag, DiffOp, TextDiff};

use crate::compiler::{ArtifactHandle, Diagnostics};
use crate::{ClassId, GameId, MutantId, PlayerId, TestId};

/// Mutant lifecycle. States only move forward; nothing returns to `Alive`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MutantState {
    Alive,
    Killed,
    /// Under a pending equivalence duel. Frozen until the duel resolves.
    FlaggedEquivalent,
    DeclaredEquivalent,
    /// Killed by the test that resolved an equivalence duel.
    ProvenNonEquivalent,
}

impl MutantState {
    pub fn can_transition_to(self, next: MutantState) -> bool {
        use MutantState::*;
        matches!(
            (self, next),
            (Alive, Killed)
                | (Alive, FlaggedEquivalent)
                | (FlaggedEquivalent, DeclaredEquivalent)
                | (FlaggedEquivalent, ProvenNonEquivalent)
        )
    }

    pub fn is_killed(self) -> bool {
        matches!(self, MutantState::Killed | MutantState::ProvenNonEquivalent)
    }

    pub fn is_final(self) -> bool {
        matches!(
            self,
            MutantState::Killed | MutantState::DeclaredEquivalent | MutantState::ProvenNonEquivalent
        )
    }
}

/// What the attacker expects their mutant to do, when the game collects it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttackerIntention {
    Kill,
    Survive,
    Equivalent,
}

impl std::str::FromStr for AttackerIntention {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "kill" | "killed" => Ok(AttackerIntention::Kill),
            "survive" | "survived" => Ok(AttackerIntention::Survive),
            "equivalent" => Ok(AttackerIntention::Equivalent),
            other => Err(format!("unknown intention '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mutant {
    pub id: MutantId,
    pub game_id: GameId,
    pub class_id: ClassId,
    pub player_id: PlayerId,
    pub source: String,
    pub source_digest: String,
    pub diff: String,
    /// Lines of the class under test this mutant touches.
    pub lines: BTreeSet<u32>,
    /// Absent when the mutant did not compile.
    pub artifact: Option<ArtifactHandle>,
    pub diagnostics: Option<Diagnostics>,
    pub state: MutantState,
    pub killed_by: Option<TestId>,
    pub score: i32,
    pub intention: Option<AttackerIntention>,
    pub created_at: u64,
}

impl Mutant {
    pub fn is_viable(&self) -> bool {
        self.artifact.is_some()
    }

    /// Alive and judgeable.
    pub fn is_live(&self) -> bool {
        self.state == MutantState::Alive && self.is_viable()
    }

    pub fn touches_any(&self, lines: &BTreeSet<u32>) -> bool {
        !self.lines.is_disjoint(lines)
    }
}

/// Row data for a mutant about to be stored; the store assigns id and stamp.
#[derive(Debug, Clone)]
pub struct NewMutant {
    pub game_id: GameId,
    pub class_id: ClassId,
    pub player_id: PlayerId,
    pub source: String,
    pub source_digest: String,
    pub diff: String,
    pub lines: BTreeSet<u32>,
    pub artifact: Option<ArtifactHandle>,
    pub diagnostics: Option<Diagnostics>,
    pub intention: Option<AttackerIntention>,
}

/// One-based line numbers of `original` changed by `mutated`.
///
/// Replaced and deleted lines count directly. Pure insertions are attributed
/// to the original line they were inserted before, or the last line when
/// appended at the end.
pub fn touched_lines(original: &str, mutated: &str) -> BTreeSet<u32> {
    let diff = TextDiff::from_lines(original, mutated);
    let total = original.lines().count();
    let mut lines = BTreeSet::new();
    for op in diff.ops() {
        match *op {
            DiffOp::Equal { .. } => {}
            DiffOp::Delete {
                old_index, old_len, ..
            }
            | DiffOp::Replace {
                old_index, old_len, ..
            } => {
                for idx in old_index..old_index + old_len {
                    lines.insert(idx as u32 + 1);
                }
            }
            DiffOp::Insert { old_index, .. } => {
                let line = if old_index < total { old_index + 1 } else { total.max(1) };
                lines.insert(line as u32);
            }
        }
    }
    lines
}

pub fn generate_diff(original: &str, mutated: &str) -> String {
    let diff = TextDiff::from_lines(original, mutated);
    let mut output = String::new();
    for change in diff.iter_all_changes() {
        let sign = match change.tag() {
            ChangeTag::Delete => "- ",
            ChangeTag::Insert => "+ ",
            ChangeTag::Equal => continue,
        };
        output.push_str(sign);
        output.push_str(change.value());
        if change.missing_newline() {
            output.push('\n');
        }
    }
    output
}
