//! Equivalence duels.
//!
//! A defender (or the engine, once a mutant has outlived enough covering
//! tests) claims that a mutant is equivalent to the original. The mutant is
//! frozen until its owner either accepts the claim or rejects it with a test
//! that kills it. Opening and resolving a duel are single atomic store
//! operations, so a mutant never has two pending duels.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::engine::{Engine, ensure_permits};
use crate::error::EngineError;
use crate::events::{Event, EventCategory, Visibility};
use crate::game::{Action, Game, Player};
use crate::killmap::KillMapEntry;
use crate::mutants::{Mutant, MutantState};
use crate::test_case::TestCase;
use crate::{Actor, GameId, MutantId, PlayerId, Role, TestId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DuelState {
    Pending,
    Resolved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DuelOutcome {
    DeclaredEquivalent,
    ProvenNonEquivalent,
    Unresolved,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EquivalenceDuel {
    pub id: u32,
    pub mutant_id: MutantId,
    pub game_id: GameId,
    pub claimant: Actor,
    pub state: DuelState,
    pub outcome: DuelOutcome,
    pub killing_test: Option<TestId>,
    /// Verdicts of the advisory killability check, if one ran.
    pub validation: Vec<KillMapEntry>,
    pub opened_at: u64,
    pub resolved_at: Option<u64>,
}

/// How a pending duel ends.
#[derive(Debug, Clone)]
pub struct DuelResolution {
    pub outcome: DuelOutcome,
    pub killing_test: Option<TestId>,
    pub validation: Vec<KillMapEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Killability {
    /// Some test from another game kills the mutant.
    Killable,
    NotKillable,
    /// The check could not run.
    Unknown,
    Disabled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KillabilityReport {
    pub verdict: Killability,
    pub entries: Vec<KillMapEntry>,
}

/// Appended to duel announcements when the advisory check found a killer.
const KILLABLE_NOTE: &str = " However, the mutant was killable!";

impl KillabilityReport {
    pub fn is_killable(&self) -> bool {
        self.verdict == Killability::Killable
    }

    fn without_entries(verdict: Killability) -> Self {
        KillabilityReport {
            verdict,
            entries: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ClaimOutcome {
    pub duels: Vec<EquivalenceDuel>,
    /// The requested lines that some valid test covers.
    pub covered_lines: BTreeSet<u32>,
}

impl ClaimOutcome {
    pub fn claimed(&self) -> Vec<MutantId> {
        self.duels.iter().map(|d| d.mutant_id).collect()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AcceptOutcome {
    pub duel: EquivalenceDuel,
    pub killability: KillabilityReport,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResolvedMutant {
    pub mutant: MutantId,
    pub outcome: DuelOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct RejectOutcome {
    pub test: TestCase,
    /// One entry per pending duel this reject settled, claimed mutant first.
    pub resolved: Vec<ResolvedMutant>,
    /// Advisory check on the claimed mutant when the test did not kill it.
    pub killability: Option<KillabilityReport>,
}

impl RejectOutcome {
    pub fn outcome_of(&self, mutant: MutantId) -> Option<DuelOutcome> {
        self.resolved.iter().find(|r| r.mutant == mutant).map(|r| r.outcome)
    }
}

/// Parses a list of line numbers such as `"3, 5 8"`.
pub fn parse_lines(text: &str) -> Result<BTreeSet<u32>, EngineError> {
    let mut lines = BTreeSet::new();
    let mut errors = Vec::new();
    for part in text.split(|c: char| c == ',' || c.is_whitespace()).filter(|s| !s.is_empty()) {
        match part.parse::<u32>() {
            Ok(n) if n > 0 => {
                lines.insert(n);
            }
            _ => errors.push(format!("'{}' is not a line number", part)),
        }
    }
    if !errors.is_empty() {
        return Err(EngineError::Validation(errors));
    }
    if lines.is_empty() {
        return Err(EngineError::Validation(vec!["no lines selected".to_string()]));
    }
    Ok(lines)
}

impl Engine {
    /// Claims every live mutant touching one of `lines` (restricted to lines
    /// covered by a valid test) as equivalent. Fails with
    /// [`EngineError::NotClaimable`] when no mutant of another attacker
    /// touches those lines, and with [`EngineError::DuelConflict`] when every
    /// such mutant is already under a duel or dead. Neither changes anything.
    pub fn claim_equivalent(
        &self,
        game_id: GameId,
        player_id: PlayerId,
        lines: &BTreeSet<u32>,
    ) -> Result<ClaimOutcome, EngineError> {
        let game = self.load_game(game_id)?;
        ensure_permits(&game, Action::ClaimEquivalence)?;
        let player = self.require_player(&game, player_id, Role::Defender)?;

        let tests: Vec<TestCase> = self
            .store
            .tests_for_game(game_id)?
            .into_iter()
            .filter(TestCase::is_valid)
            .collect();
        let covered_lines: BTreeSet<u32> = lines
            .iter()
            .copied()
            .filter(|line| tests.iter().any(|t| t.covers_line(*line)))
            .collect();

        let touching: Vec<Mutant> = self
            .store
            .mutants_for_game(game_id)?
            .into_iter()
            .filter(|m| m.is_viable() && m.player_id != player_id && m.touches_any(&covered_lines))
            .collect();
        if touching.is_empty() {
            return Err(EngineError::NotClaimable);
        }

        let mut duels = Vec::new();
        for mutant in touching.iter().filter(|m| m.is_live()) {
            let Some(duel) = self.store.open_duel(mutant.id, Actor::Player(player_id))? else {
                continue;
            };
            info!(game = game_id, mutant = mutant.id, claimant = player_id, "equivalence claimed");
            self.notify(Event::new(
                game_id,
                Actor::Player(player_id),
                EventCategory::DefenderMutantClaimedEquivalent,
                Visibility::Player(mutant.player_id),
                format!("Defender {} claimed your mutant {} as equivalent.", player.name, mutant.id),
            ));
            duels.push(duel);
        }
        if duels.is_empty() {
            return Err(EngineError::conflict(
                touching[0].id,
                "every mutant on these lines is already claimed or killed",
            ));
        }

        let ids: Vec<String> = duels.iter().map(|d| d.mutant_id.to_string()).collect();
        self.notify(Event::new(
            game_id,
            Actor::Player(player_id),
            EventCategory::GameMessageDefender,
            Visibility::Game,
            format!("Defender {} claimed mutant(s) {} as equivalent.", player.name, ids.join(", ")),
        ));
        Ok(ClaimOutcome {
            duels,
            covered_lines,
        })
    }

    /// The owner concedes: the mutant is declared equivalent and the claiming
    /// defender scores a point.
    pub fn accept_equivalence(
        &self,
        game_id: GameId,
        player_id: PlayerId,
        mutant_id: MutantId,
    ) -> Result<AcceptOutcome, EngineError> {
        let (game, player, mutant) = self.duel_participants(game_id, player_id, mutant_id)?;

        let killability = self.validate_killability(&mutant)?;
        if killability.verdict == Killability::Killable {
            warn!(mutant = mutant_id, "mutant accepted as equivalent is killable");
        }
        let resolution = DuelResolution {
            outcome: DuelOutcome::DeclaredEquivalent,
            killing_test: None,
            validation: killability.entries.clone(),
        };
        let duel = self
            .store
            .resolve_duel(mutant_id, resolution)?
            .ok_or_else(|| EngineError::conflict(mutant_id, "the duel was already resolved"))?;
        if let Some(claimant) = duel.claimant.player() {
            self.store.add_player_points(claimant, 1)?;
        }
        info!(game = game.id, mutant = mutant_id, "equivalence accepted");
        let mut message = format!("Attacker {} accepted that mutant {} is equivalent.", player.name, mutant_id);
        if killability.is_killable() {
            message.push_str(KILLABLE_NOTE);
            self.tell_claimant_killable(&player, &duel, "accepted");
        }
        self.notify(Event::new(
            game.id,
            Actor::Player(player_id),
            EventCategory::DefenderMutantEquivalent,
            Visibility::Game,
            message,
        ));
        Ok(AcceptOutcome { duel, killability })
    }

    /// The owner answers the claim with a test. The test is judged against
    /// every pending mutant of the game; each one it kills is proven
    /// non-equivalent, the rest are declared equivalent.
    pub fn reject_equivalence(
        &self,
        game_id: GameId,
        player_id: PlayerId,
        mutant_id: MutantId,
        test_source: &str,
    ) -> Result<RejectOutcome, EngineError> {
        let (game, player, _) = self.duel_participants(game_id, player_id, mutant_id)?;
        let class = self.load_class(game.class_id)?;
        let test = self.admit_test(&game, &class, &player, test_source, BTreeSet::new())?;

        let mut pending: Vec<Mutant> = Vec::new();
        for duel in self.store.pending_duels_for_game(game_id)? {
            if let Some(m) = self.store.mutant(duel.mutant_id)? {
                if m.state == MutantState::FlaggedEquivalent && m.is_viable() {
                    pending.push(m);
                }
            }
        }
        pending.sort_by_key(|m| (m.id != mutant_id, m.id));
        let map = self
            .kill_map_builder()
            .build_or_extend(std::slice::from_ref(&test), &pending)?;

        let mut resolved = Vec::new();
        let mut killability = None;
        for mutant in &pending {
            if map.is_killed(mutant.id) {
                let resolution = DuelResolution {
                    outcome: DuelOutcome::ProvenNonEquivalent,
                    killing_test: Some(test.id),
                    validation: Vec::new(),
                };
                if self.store.resolve_duel(mutant.id, resolution)?.is_none() {
                    continue;
                }
                self.store.add_player_points(player_id, 1)?;
                self.store.add_test_score(test.id, 1)?;
                info!(mutant = mutant.id, test = test.id, "mutant proven non-equivalent");
                self.notify(Event::new(
                    game_id,
                    Actor::Player(player_id),
                    EventCategory::AttackerMutantKilledEquivalent,
                    Visibility::Game,
                    format!("Attacker {} killed mutant {} in an equivalence duel.", player.name, mutant.id),
                ));
                resolved.push(ResolvedMutant {
                    mutant: mutant.id,
                    outcome: DuelOutcome::ProvenNonEquivalent,
                });
            } else {
                let claimed = mutant.id == mutant_id;
                let report = if claimed {
                    Some(self.validate_killability(mutant)?)
                } else {
                    None
                };
                let resolution = DuelResolution {
                    outcome: DuelOutcome::DeclaredEquivalent,
                    killing_test: None,
                    validation: report.as_ref().map(|r| r.entries.clone()).unwrap_or_default(),
                };
                let Some(duel) = self.store.resolve_duel(mutant.id, resolution)? else {
                    continue;
                };
                if let Some(claimant) = duel.claimant.player() {
                    self.store.add_player_points(claimant, 1)?;
                }
                info!(mutant = mutant.id, "mutant declared equivalent");
                if claimed {
                    let mut message = format!(
                        "Attacker {} lost an equivalence duel. Mutant {} is assumed equivalent.",
                        player.name, mutant.id
                    );
                    if report.as_ref().is_some_and(KillabilityReport::is_killable) {
                        warn!(mutant = mutant.id, "mutant assumed equivalent is killable");
                        message.push_str(KILLABLE_NOTE);
                        self.tell_claimant_killable(&player, &duel, "lost the duel on");
                    }
                    self.notify(Event::new(
                        game_id,
                        Actor::Player(player_id),
                        EventCategory::DefenderMutantEquivalent,
                        Visibility::Game,
                        message,
                    ));
                    killability = report;
                }
                resolved.push(ResolvedMutant {
                    mutant: mutant.id,
                    outcome: DuelOutcome::DeclaredEquivalent,
                });
            }
        }

        Ok(RejectOutcome {
            test: self.store.test(test.id)?.unwrap_or(test),
            resolved,
            killability,
        })
    }

    /// Opens a system duel on every live mutant that has survived at least
    /// the game's threshold of covering tests created after it. Returns the
    /// mutants newly put up for a duel.
    pub fn check_automatic_equivalence(&self, game_id: GameId) -> Result<Vec<MutantId>, EngineError> {
        let game = self.load_game(game_id)?;
        let threshold = game.rules.auto_equivalence_threshold;
        if threshold == 0 || !game.state.permits(Action::ClaimEquivalence) {
            return Ok(Vec::new());
        }
        let tests: Vec<TestCase> = self
            .store
            .tests_for_game(game_id)?
            .into_iter()
            .filter(TestCase::is_valid)
            .collect();

        let mut claimed = Vec::new();
        for mutant in self.store.mutants_for_game(game_id)? {
            if !mutant.is_live() {
                continue;
            }
            let covering = tests
                .iter()
                .filter(|t| t.created_at > mutant.created_at && t.covers(&mutant))
                .count();
            if covering < threshold as usize {
                continue;
            }
            if self.store.open_duel(mutant.id, Actor::System)?.is_none() {
                continue;
            }
            info!(game = game_id, mutant = mutant.id, covering, "mutant automatically claimed");
            self.notify(Event::new(
                game_id,
                Actor::System,
                EventCategory::DefenderMutantClaimedEquivalent,
                Visibility::Player(mutant.player_id),
                format!(
                    "One of your mutants survived {}{} tests so it was automatically claimed as equivalent.",
                    if covering > threshold as usize { "more than " } else { "" },
                    threshold
                ),
            ));
            self.notify(Event::new(
                game_id,
                Actor::System,
                EventCategory::GameMessageDefender,
                Visibility::Game,
                format!("Mutant {} was automatically claimed as equivalent.", mutant.id),
            ));
            claimed.push(mutant.id);
        }
        Ok(claimed)
    }

    /// Runs a sample of valid tests written for the same class in other games
    /// against `mutant`. Advisory: a sandbox failure yields
    /// [`Killability::Unknown`] rather than an error.
    pub fn validate_killability(&self, mutant: &Mutant) -> Result<KillabilityReport, EngineError> {
        let max = self.config.duel_validation_max_tests;
        if max == 0 {
            return Ok(KillabilityReport::without_entries(Killability::Disabled));
        }
        let foreign: Vec<TestCase> = self
            .store
            .valid_tests_for_class(mutant.class_id)?
            .into_iter()
            .filter(|t| t.game_id != mutant.game_id && t.is_valid())
            .collect();
        let selected = self.selector.select(foreign, max);
        if selected.is_empty() {
            return Ok(KillabilityReport::without_entries(Killability::NotKillable));
        }

        match self
            .kill_map_builder()
            .build_or_extend(&selected, std::slice::from_ref(mutant))
        {
            Ok(map) => {
                let entries: Vec<KillMapEntry> = map.entries().cloned().collect();
                let verdict = if map.is_killed(mutant.id) {
                    Killability::Killable
                } else {
                    Killability::NotKillable
                };
                info!(mutant = mutant.id, tests = selected.len(), ?verdict, "killability validated");
                Ok(KillabilityReport { verdict, entries })
            }
            Err(EngineError::Infra(e)) => {
                warn!(mutant = mutant.id, error = %e, "killability unknown");
                Ok(KillabilityReport::without_entries(Killability::Unknown))
            }
            Err(e) => Err(e),
        }
    }

    /// Lets the defender who won the duel know that a test from another game
    /// kills the mutant anyway. System claims have nobody to tell.
    fn tell_claimant_killable(&self, owner: &Player, duel: &EquivalenceDuel, how: &str) {
        let Some(claimant) = duel.claimant.player() else {
            return;
        };
        self.notify(Event::new(
            duel.game_id,
            Actor::Player(owner.id),
            EventCategory::GameMessageDefender,
            Visibility::Player(claimant),
            format!(
                "Attacker {} {} mutant {} that you claimed equivalent, but that mutant was killable.",
                owner.name, how, duel.mutant_id
            ),
        ));
    }

    /// Checks that `player_id` is the attacker owning `mutant_id` and that
    /// the mutant has a pending duel.
    fn duel_participants(
        &self,
        game_id: GameId,
        player_id: PlayerId,
        mutant_id: MutantId,
    ) -> Result<(Game, Player, Mutant), EngineError> {
        let game = self.load_game(game_id)?;
        ensure_permits(&game, Action::ResolveEquivalence)?;
        let player = self.require_player(&game, player_id, Role::Attacker)?;
        let mutant = self.load_mutant(mutant_id)?;
        if mutant.game_id != game_id {
            return Err(EngineError::NotFound {
                kind: "mutant",
                id: mutant_id,
            });
        }
        if mutant.player_id != player_id {
            return Err(EngineError::conflict(mutant_id, "only the owner can answer this claim"));
        }
        if self.store.pending_duel(mutant_id)?.is_none() {
            return Err(EngineError::conflict(mutant_id, "no pending duel"));
        }
        Ok((game, player, mutant))
    }
}
