//! Mutant and test submissions.
//!
//! A submission is validated, compiled into its own directory, stored, and
//! then judged against every valid counterpart in the game. Kills and
//! survivals are scored, long-surviving mutants are put up for an automatic
//! equivalence duel, and the round counter may push the game into grace.

use std::collections::BTreeSet;

use serde::Serialize;
use tracing::{info, warn};

use crate::compiler::{CompileResult, CompileUnit, class_name_of, sha256_hex};
use crate::engine::{Engine, ensure_permits};
use crate::error::{EngineError, StoreError};
use crate::events::{Event, EventCategory, Visibility};
use crate::game::{Action, Game, GameClass, GameState, Player};
use crate::judge::{Target, Verdict};
use crate::killmap::{KillMap, KillStatus};
use crate::mutants::{AttackerIntention, Mutant, MutantState, NewMutant, generate_diff, touched_lines};
use crate::test_case::{NewTest, TestCase};
use crate::workspace::SubmissionKind;
use crate::{Actor, GameId, MutantId, PlayerId, Role, TestId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Kill {
    pub mutant: MutantId,
    pub test: TestId,
}

/// Whether the kill map for a submission could be built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Judging {
    Complete { executed: usize },
    /// The sandbox failed; the submission is stored but nothing was judged.
    Unavailable { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct MutantSubmission {
    pub mutant: Mutant,
    pub kill: Option<Kill>,
    /// Judged by at least one test and not killed.
    pub survived: bool,
    pub judging: Judging,
    pub auto_claimed: Vec<MutantId>,
    /// Set when this submission moved the game into grace.
    pub game_state: Option<GameState>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TestSubmission {
    pub test: TestCase,
    pub smells: Vec<String>,
    pub killed: Vec<Kill>,
    pub survived: Vec<MutantId>,
    pub judging: Judging,
    pub auto_claimed: Vec<MutantId>,
    pub game_state: Option<GameState>,
}

#[derive(Debug, Default)]
pub(crate) struct RoundResult {
    pub killed: Vec<Kill>,
    pub survived: Vec<MutantId>,
}

impl Engine {
    pub fn submit_mutant(
        &self,
        game_id: GameId,
        player_id: PlayerId,
        source: &str,
        intention: Option<AttackerIntention>,
    ) -> Result<MutantSubmission, EngineError> {
        let game = self.load_game(game_id)?;
        ensure_permits(&game, Action::SubmitMutant)?;
        let player = self.require_player(&game, player_id, Role::Attacker)?;
        let class = self.load_class(game.class_id)?;

        let mutant = match self.admit_mutant(&game, &class, &player, source, intention) {
            Ok(mutant) => mutant,
            Err(e) => return Err(self.reject_submission(game_id, e)),
        };
        self.store.record_submission(game_id, true)?;
        info!(game = game_id, mutant = mutant.id, player = player_id, "mutant accepted");
        self.notify(Event::new(
            game_id,
            Actor::Player(player_id),
            EventCategory::AttackerMutantCreated,
            Visibility::Game,
            format!("Attacker {} created a mutant.", player.name),
        ));

        let tests: Vec<TestCase> = self
            .store
            .tests_for_game(game_id)?
            .into_iter()
            .filter(TestCase::is_valid)
            .collect();
        let (judging, round) = self.judge_round(&tests, std::slice::from_ref(&mutant))?;

        let auto_claimed = self.check_automatic_equivalence(game_id)?;
        let game_state = self.maybe_enter_grace(game_id)?;
        Ok(MutantSubmission {
            mutant: self.load_mutant(mutant.id)?,
            kill: round.killed.first().copied(),
            survived: round.survived.contains(&mutant.id),
            judging,
            auto_claimed,
            game_state,
        })
    }

    pub fn submit_test(
        &self,
        game_id: GameId,
        player_id: PlayerId,
        source: &str,
        target_lines: BTreeSet<u32>,
    ) -> Result<TestSubmission, EngineError> {
        let game = self.load_game(game_id)?;
        ensure_permits(&game, Action::SubmitTest)?;
        let player = self.require_player(&game, player_id, Role::Defender)?;
        let class = self.load_class(game.class_id)?;

        let admitted = if game.rules.capture_intentions && target_lines.is_empty() {
            Err(EngineError::Validation(vec![
                "name at least one line the test is meant to cover".to_string(),
            ]))
        } else {
            self.admit_test(&game, &class, &player, source, target_lines)
        };
        let test = match admitted {
            Ok(test) => test,
            Err(e) => return Err(self.reject_submission(game_id, e)),
        };
        self.store.record_submission(game_id, true)?;
        info!(game = game_id, test = test.id, player = player_id, "test accepted");
        self.notify(Event::new(
            game_id,
            Actor::Player(player_id),
            EventCategory::DefenderTestCreated,
            Visibility::Game,
            format!("Defender {} created a test.", player.name),
        ));
        let smells = self.smells.detect(&test);

        let mutants: Vec<Mutant> = self
            .store
            .mutants_for_game(game_id)?
            .into_iter()
            .filter(Mutant::is_live)
            .collect();
        let (judging, round) = self.judge_round(std::slice::from_ref(&test), &mutants)?;

        let auto_claimed = self.check_automatic_equivalence(game_id)?;
        let game_state = self.maybe_enter_grace(game_id)?;
        Ok(TestSubmission {
            test: self.store.test(test.id)?.unwrap_or(test),
            smells,
            killed: round.killed,
            survived: round.survived,
            judging,
            auto_claimed,
            game_state,
        })
    }

    /// Counts a rejected submission against the game and hands the error back.
    fn reject_submission(&self, game_id: GameId, error: EngineError) -> EngineError {
        if !error.is_recoverable() {
            return error;
        }
        info!(game = game_id, error = %error, "submission rejected");
        match self.store.record_submission(game_id, false) {
            Ok(_) => error,
            Err(e) => e.into(),
        }
    }

    fn admit_mutant(
        &self,
        game: &Game,
        class: &GameClass,
        player: &Player,
        source: &str,
        intention: Option<AttackerIntention>,
    ) -> Result<Mutant, EngineError> {
        if game.rules.capture_intentions && intention.is_none() {
            return Err(EngineError::Validation(vec![
                "state whether the mutant should be killed, survive or be equivalent".to_string(),
            ]));
        }
        self.validator
            .validate_mutant(&class.source, source)
            .map_err(EngineError::Validation)?;

        let existing = self.store.mutants_for_game(game.id)?;
        let source_digest = sha256_hex(source.as_bytes());
        if let Some(dup) = existing.iter().find(|m| m.source_digest == source_digest) {
            return Err(duplicate_of(dup));
        }

        let dir = self
            .workspace
            .submission_dir(game.id, SubmissionKind::Mutant, player.id)?;
        let unit = CompileUnit {
            class_name: &class.name,
            source,
        };
        let compiled = match self.compiler.compile(&unit, None, &dir) {
            Ok(result) => result,
            Err(e) => {
                self.workspace.discard(&dir);
                return Err(e.into());
            }
        };

        let mut new = NewMutant {
            game_id: game.id,
            class_id: class.id,
            player_id: player.id,
            source: source.to_string(),
            source_digest,
            diff: generate_diff(&class.source, source),
            lines: touched_lines(&class.source, source),
            artifact: None,
            diagnostics: None,
            intention,
        };
        match compiled {
            CompileResult::Failed(diagnostics) => {
                self.workspace.discard(&dir);
                // Kept so a resubmission of the same source can show these.
                new.diagnostics = Some(diagnostics.clone());
                match self.store.insert_mutant(new) {
                    Ok(_) | Err(StoreError::DuplicateMutant { .. }) => {}
                    Err(e) => return Err(e.into()),
                }
                Err(EngineError::Compile(diagnostics))
            }
            CompileResult::Compiled(artifact) => {
                let same_bytecode = existing
                    .iter()
                    .find(|m| m.artifact.as_ref().is_some_and(|a| a.digest == artifact.digest));
                if let Some(dup) = same_bytecode {
                    self.workspace.discard(&dir);
                    return Err(duplicate_of(dup));
                }
                new.artifact = Some(artifact);
                match self.store.insert_mutant(new) {
                    Ok(mutant) => Ok(mutant),
                    Err(StoreError::DuplicateMutant { existing, .. }) => {
                        self.workspace.discard(&dir);
                        let diagnostics = self.store.mutant(existing)?.and_then(|m| m.diagnostics);
                        Err(EngineError::Duplicate { existing, diagnostics })
                    }
                    Err(e) => {
                        self.workspace.discard(&dir);
                        Err(e.into())
                    }
                }
            }
        }
    }

    /// Validates, compiles and runs a test on the original class, then stores
    /// it. A test that compiles but fails on the original is stored as invalid.
    pub(crate) fn admit_test(
        &self,
        game: &Game,
        class: &GameClass,
        player: &Player,
        source: &str,
        target_lines: BTreeSet<u32>,
    ) -> Result<TestCase, EngineError> {
        self.validator
            .validate_test(source, &game.rules)
            .map_err(EngineError::Validation)?;
        let class_name = class_name_of(source)
            .ok_or_else(|| EngineError::Validation(vec!["no test class declaration found".to_string()]))?;

        let dir = self
            .workspace
            .submission_dir(game.id, SubmissionKind::Test, player.id)?;
        let unit = CompileUnit {
            class_name: &class_name,
            source,
        };
        let artifact = match self.compiler.compile(&unit, Some(&class.artifact), &dir) {
            Ok(CompileResult::Compiled(artifact)) => artifact,
            Ok(CompileResult::Failed(diagnostics)) => {
                self.workspace.discard(&dir);
                return Err(EngineError::Compile(diagnostics));
            }
            Err(e) => {
                self.workspace.discard(&dir);
                return Err(e.into());
            }
        };

        let execution = match self
            .judge
            .run(&artifact, Target::Original(&class.artifact), self.config.judge_timeout())
        {
            Ok(execution) => execution,
            Err(e) => {
                self.workspace.discard(&dir);
                return Err(e.into());
            }
        };
        let passes = execution.verdict == Verdict::Pass;
        let test = self.store.insert_test(NewTest {
            game_id: game.id,
            class_id: class.id,
            player_id: player.id,
            class_name,
            source: source.to_string(),
            artifact: Some(artifact),
            diagnostics: None,
            passes_on_original: passes,
            covered_lines: execution.covered_lines,
            target_lines,
        })?;
        if !passes {
            warn!(test = test.id, verdict = ?execution.verdict, "test fails on the original class");
            return Err(EngineError::FailsOnOriginal {
                evidence: execution.evidence,
            });
        }
        Ok(test)
    }

    /// Builds the kill map for `tests` × `mutants` and applies it. A sandbox
    /// failure is reported through [`Judging`] instead of failing the
    /// submission that is already stored.
    fn judge_round(&self, tests: &[TestCase], mutants: &[Mutant]) -> Result<(Judging, RoundResult), EngineError> {
        if tests.is_empty() || mutants.is_empty() {
            return Ok((Judging::Complete { executed: 0 }, RoundResult::default()));
        }
        match self.kill_map_builder().build_or_extend(tests, mutants) {
            Ok(map) => {
                let round = self.apply_verdicts(&map, tests, mutants)?;
                Ok((
                    Judging::Complete {
                        executed: map.executed(),
                    },
                    round,
                ))
            }
            Err(EngineError::Infra(e)) => {
                warn!(error = %e, "kill map unavailable, verdicts not applied");
                Ok((
                    Judging::Unavailable {
                        reason: e.to_string(),
                    },
                    RoundResult::default(),
                ))
            }
            Err(e) => Err(e),
        }
    }

    /// Kills flip alive mutants to killed and credit the test and its owner.
    /// A mutant that was run and not killed earns a point for its owner.
    pub(crate) fn apply_verdicts(
        &self,
        map: &KillMap,
        tests: &[TestCase],
        mutants: &[Mutant],
    ) -> Result<RoundResult, EngineError> {
        let mut round = RoundResult::default();
        for mutant in mutants {
            if let Some(&test_id) = map.killers_of(mutant.id).first() {
                let won = self.store.compare_and_set_mutant_state(
                    mutant.id,
                    MutantState::Alive,
                    MutantState::Killed,
                    Some(test_id),
                )?;
                if !won {
                    continue;
                }
                self.store.add_test_score(test_id, 1)?;
                if let Some(test) = tests.iter().find(|t| t.id == test_id) {
                    self.store.add_player_points(test.player_id, 1)?;
                }
                info!(mutant = mutant.id, test = test_id, "mutant killed");
                self.notify(Event::new(
                    mutant.game_id,
                    Actor::System,
                    EventCategory::MutantKilled,
                    Visibility::Player(mutant.player_id),
                    format!("Your mutant {} was killed by test {}.", mutant.id, test_id),
                ));
                round.killed.push(Kill {
                    mutant: mutant.id,
                    test: test_id,
                });
            } else {
                let ran = map
                    .entries()
                    .any(|e| e.mutant_id == mutant.id && e.status == KillStatus::NoKill);
                if ran {
                    self.store.add_mutant_score(mutant.id, 1)?;
                    self.store.add_player_points(mutant.player_id, 1)?;
                    round.survived.push(mutant.id);
                }
            }
        }
        Ok(round)
    }
}

fn duplicate_of(existing: &Mutant) -> EngineError {
    EngineError::Duplicate {
        existing: existing.id,
        diagnostics: existing.diagnostics.clone(),
    }
}
