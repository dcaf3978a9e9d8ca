//! Persistence boundary.
//!
//! The engine never caches rows; it reads through a [`Store`] on every
//! operation. The two shared-state invariants, one pending duel per mutant and
//! one kill-map entry per pair, are enforced here with compare-and-set and
//! insert-if-absent operations rather than by callers.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::compiler::ArtifactHandle;
use crate::duel::{DuelOutcome, DuelResolution, DuelState, EquivalenceDuel};
use crate::error::StoreError;
use crate::game::{Game, GameClass, GameRules, GameState, Player};
use crate::killmap::KillMapEntry;
use crate::mutants::{Mutant, MutantState, NewMutant};
use crate::test_case::{NewTest, TestCase, TestState};
use crate::{Actor, ClassId, GameId, MutantId, PlayerId, Role, TestId, state};

pub trait Store: Send + Sync {
    fn insert_class(&self, name: &str, source: &str, artifact: ArtifactHandle) -> Result<GameClass, StoreError>;
    fn class(&self, id: ClassId) -> Result<Option<GameClass>, StoreError>;

    fn insert_game(&self, class_id: ClassId, rules: GameRules) -> Result<Game, StoreError>;
    fn game(&self, id: GameId) -> Result<Option<Game>, StoreError>;
    /// Moves the game to `next` only if it is still in `expected`.
    fn compare_and_set_game_state(&self, id: GameId, expected: GameState, next: GameState)
        -> Result<bool, StoreError>;
    /// Advances the round and bumps the valid or invalid counter.
    fn record_submission(&self, id: GameId, valid: bool) -> Result<Game, StoreError>;

    fn insert_player(&self, game_id: GameId, name: &str, role: Role) -> Result<Player, StoreError>;
    fn player(&self, id: PlayerId) -> Result<Option<Player>, StoreError>;
    fn players_for_game(&self, game_id: GameId) -> Result<Vec<Player>, StoreError>;
    fn add_player_points(&self, id: PlayerId, delta: i32) -> Result<(), StoreError>;

    /// Fails with [`StoreError::DuplicateMutant`] when the game already holds a
    /// mutant with the same source digest.
    fn insert_mutant(&self, mutant: NewMutant) -> Result<Mutant, StoreError>;
    fn mutant(&self, id: MutantId) -> Result<Option<Mutant>, StoreError>;
    fn mutants_for_game(&self, game_id: GameId) -> Result<Vec<Mutant>, StoreError>;
    fn compare_and_set_mutant_state(
        &self,
        id: MutantId,
        expected: MutantState,
        next: MutantState,
        killed_by: Option<TestId>,
    ) -> Result<bool, StoreError>;
    fn add_mutant_score(&self, id: MutantId, delta: i32) -> Result<(), StoreError>;

    fn insert_test(&self, test: NewTest) -> Result<TestCase, StoreError>;
    fn test(&self, id: TestId) -> Result<Option<TestCase>, StoreError>;
    fn tests_for_game(&self, game_id: GameId) -> Result<Vec<TestCase>, StoreError>;
    fn valid_tests_for_class(&self, class_id: ClassId) -> Result<Vec<TestCase>, StoreError>;
    fn add_test_score(&self, id: TestId, delta: i32) -> Result<(), StoreError>;

    fn kill_map_entry(&self, test: TestId, mutant: MutantId) -> Result<Option<KillMapEntry>, StoreError>;
    /// Stores `entry` unless the pair already has one. Returns the entry that
    /// is stored afterwards, which is the earlier one on conflict.
    fn insert_kill_map_entry(&self, entry: KillMapEntry) -> Result<KillMapEntry, StoreError>;
    fn kill_map_for_mutant(&self, mutant: MutantId) -> Result<Vec<KillMapEntry>, StoreError>;

    /// Atomically flags an alive mutant and opens a pending duel for it.
    /// Returns `None` when the mutant is not alive or already disputed.
    fn open_duel(&self, mutant: MutantId, claimant: Actor) -> Result<Option<EquivalenceDuel>, StoreError>;
    fn pending_duel(&self, mutant: MutantId) -> Result<Option<EquivalenceDuel>, StoreError>;
    fn pending_duels_for_game(&self, game_id: GameId) -> Result<Vec<EquivalenceDuel>, StoreError>;
    fn duels_for_mutant(&self, mutant: MutantId) -> Result<Vec<EquivalenceDuel>, StoreError>;
    /// Atomically closes the pending duel of `mutant` and moves the mutant to
    /// the matching final state. Returns `None` if no duel was pending.
    fn resolve_duel(&self, mutant: MutantId, resolution: DuelResolution)
        -> Result<Option<EquivalenceDuel>, StoreError>;
}

/// All rows, as persisted in a snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Tables {
    pub classes: BTreeMap<ClassId, GameClass>,
    pub games: BTreeMap<GameId, Game>,
    pub players: BTreeMap<PlayerId, Player>,
    pub mutants: BTreeMap<MutantId, Mutant>,
    pub tests: BTreeMap<TestId, TestCase>,
    /// test id -> mutant id -> entry
    pub kill_map: BTreeMap<TestId, BTreeMap<MutantId, KillMapEntry>>,
    pub duels: BTreeMap<u32, EquivalenceDuel>,
    next_id: u32,
    clock: u64,
}

impl Tables {
    fn next_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    /// Strictly increasing millisecond stamp, so creation order is total even
    /// when two rows land in the same millisecond.
    fn stamp(&mut self) -> u64 {
        self.clock = crate::now_ms().max(self.clock + 1);
        self.clock
    }

    fn mutant_mut(&mut self, id: MutantId) -> Result<&mut Mutant, StoreError> {
        self.mutants
            .get_mut(&id)
            .ok_or(StoreError::Missing { kind: "mutant", id })
    }

    fn pending_duel_id(&self, mutant: MutantId) -> Option<u32> {
        self.duels
            .values()
            .find(|d| d.mutant_id == mutant && d.state == DuelState::Pending)
            .map(|d| d.id)
    }
}

/// Mutex-guarded tables, optionally backed by a JSON snapshot file.
///
/// With a snapshot, the file is the source of truth: every read reloads it
/// under a shared file lock, and every write reloads, applies and saves it
/// under an exclusive one. Separate processes on the same file therefore see
/// each other's compare-and-set outcomes.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    snapshot: Option<PathBuf>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }

    /// Opens a store backed by `path`, loading it if it exists.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let tables = {
            let _lock = state::lock_snapshot(&path, false)?;
            state::load_snapshot(&path)?.unwrap_or_default()
        };
        Ok(MemoryStore {
            tables: Mutex::new(tables),
            snapshot: Some(path),
        })
    }

    pub fn snapshot(&self) -> Result<Tables, StoreError> {
        self.read(Tables::clone)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tables>, StoreError> {
        self.tables.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Replaces the in-memory tables with the file's, if there is one.
    fn reload(path: &Path, tables: &mut Tables) -> Result<(), StoreError> {
        if let Some(fresh) = state::load_snapshot(path)? {
            *tables = fresh;
        }
        Ok(())
    }

    fn read<T>(&self, f: impl FnOnce(&Tables) -> T) -> Result<T, StoreError> {
        let mut tables = self.lock()?;
        if let Some(path) = &self.snapshot {
            let _lock = state::lock_snapshot(path, false)?;
            Self::reload(path, &mut tables)?;
        }
        Ok(f(&*tables))
    }

    fn write<T>(&self, f: impl FnOnce(&mut Tables) -> Result<T, StoreError>) -> Result<T, StoreError> {
        let mut tables = self.lock()?;
        let Some(path) = &self.snapshot else {
            return f(&mut *tables);
        };
        let _lock = state::lock_snapshot(path, true)?;
        Self::reload(path, &mut tables)?;
        let value = f(&mut *tables)?;
        state::save_snapshot(&tables, path)?;
        Ok(value)
    }
}

impl Store for MemoryStore {
    fn insert_class(&self, name: &str, source: &str, artifact: ArtifactHandle) -> Result<GameClass, StoreError> {
        self.write(|t| {
            let class = GameClass {
                id: t.next_id(),
                name: name.to_string(),
                source: source.to_string(),
                artifact,
            };
            t.classes.insert(class.id, class.clone());
            Ok(class)
        })
    }

    fn class(&self, id: ClassId) -> Result<Option<GameClass>, StoreError> {
        self.read(|t| t.classes.get(&id).cloned())
    }

    fn insert_game(&self, class_id: ClassId, rules: GameRules) -> Result<Game, StoreError> {
        self.write(|t| {
            if !t.classes.contains_key(&class_id) {
                return Err(StoreError::Missing {
                    kind: "class",
                    id: class_id,
                });
            }
            let game = Game {
                id: t.next_id(),
                class_id,
                state: GameState::Created,
                round: 1,
                valid_submissions: 0,
                invalid_submissions: 0,
                rules,
                created_at: t.stamp(),
            };
            t.games.insert(game.id, game.clone());
            Ok(game)
        })
    }

    fn game(&self, id: GameId) -> Result<Option<Game>, StoreError> {
        self.read(|t| t.games.get(&id).cloned())
    }

    fn compare_and_set_game_state(
        &self,
        id: GameId,
        expected: GameState,
        next: GameState,
    ) -> Result<bool, StoreError> {
        self.write(|t| {
            let game = t.games.get_mut(&id).ok_or(StoreError::Missing { kind: "game", id })?;
            if game.state != expected {
                return Ok(false);
            }
            game.state = next;
            Ok(true)
        })
    }

    fn record_submission(&self, id: GameId, valid: bool) -> Result<Game, StoreError> {
        self.write(|t| {
            let game = t.games.get_mut(&id).ok_or(StoreError::Missing { kind: "game", id })?;
            game.round += 1;
            if valid {
                game.valid_submissions += 1;
            } else {
                game.invalid_submissions += 1;
            }
            Ok(game.clone())
        })
    }

    fn insert_player(&self, game_id: GameId, name: &str, role: Role) -> Result<Player, StoreError> {
        self.write(|t| {
            if !t.games.contains_key(&game_id) {
                return Err(StoreError::Missing {
                    kind: "game",
                    id: game_id,
                });
            }
            let player = Player {
                id: t.next_id(),
                game_id,
                name: name.to_string(),
                role,
                points: 0,
            };
            t.players.insert(player.id, player.clone());
            Ok(player)
        })
    }

    fn player(&self, id: PlayerId) -> Result<Option<Player>, StoreError> {
        self.read(|t| t.players.get(&id).cloned())
    }

    fn players_for_game(&self, game_id: GameId) -> Result<Vec<Player>, StoreError> {
        self.read(|t| t.players.values().filter(|p| p.game_id == game_id).cloned().collect())
    }

    fn add_player_points(&self, id: PlayerId, delta: i32) -> Result<(), StoreError> {
        self.write(|t| {
            let player = t.players.get_mut(&id).ok_or(StoreError::Missing { kind: "player", id })?;
            player.points += delta;
            Ok(())
        })
    }

    fn insert_mutant(&self, new: NewMutant) -> Result<Mutant, StoreError> {
        self.write(|t| {
            let duplicate = t.mutants.values().find(|m| {
                m.game_id == new.game_id
                    && (m.source_digest == new.source_digest
                        || matches!((&m.artifact, &new.artifact), (Some(a), Some(b)) if a.digest == b.digest))
            });
            if let Some(existing) = duplicate {
                return Err(StoreError::DuplicateMutant {
                    game: new.game_id,
                    existing: existing.id,
                });
            }
            let mutant = Mutant {
                id: t.next_id(),
                game_id: new.game_id,
                class_id: new.class_id,
                player_id: new.player_id,
                source: new.source,
                source_digest: new.source_digest,
                diff: new.diff,
                lines: new.lines,
                artifact: new.artifact,
                diagnostics: new.diagnostics,
                state: MutantState::Alive,
                killed_by: None,
                score: 0,
                intention: new.intention,
                created_at: t.stamp(),
            };
            t.mutants.insert(mutant.id, mutant.clone());
            Ok(mutant)
        })
    }

    fn mutant(&self, id: MutantId) -> Result<Option<Mutant>, StoreError> {
        self.read(|t| t.mutants.get(&id).cloned())
    }

    fn mutants_for_game(&self, game_id: GameId) -> Result<Vec<Mutant>, StoreError> {
        self.read(|t| t.mutants.values().filter(|m| m.game_id == game_id).cloned().collect())
    }

    fn compare_and_set_mutant_state(
        &self,
        id: MutantId,
        expected: MutantState,
        next: MutantState,
        killed_by: Option<TestId>,
    ) -> Result<bool, StoreError> {
        if !expected.can_transition_to(next) {
            return Err(StoreError::IllegalTransition {
                id,
                from: expected,
                to: next,
            });
        }
        self.write(|t| {
            let mutant = t.mutant_mut(id)?;
            if mutant.state != expected {
                return Ok(false);
            }
            mutant.state = next;
            if killed_by.is_some() {
                mutant.killed_by = killed_by;
            }
            Ok(true)
        })
    }

    fn add_mutant_score(&self, id: MutantId, delta: i32) -> Result<(), StoreError> {
        self.write(|t| {
            t.mutant_mut(id)?.score += delta;
            Ok(())
        })
    }

    fn insert_test(&self, new: NewTest) -> Result<TestCase, StoreError> {
        self.write(|t| {
            let test = TestCase {
                id: t.next_id(),
                state: new.state(),
                game_id: new.game_id,
                class_id: new.class_id,
                player_id: new.player_id,
                class_name: new.class_name,
                source: new.source,
                artifact: new.artifact,
                diagnostics: new.diagnostics,
                passes_on_original: new.passes_on_original,
                score: 0,
                covered_lines: new.covered_lines,
                target_lines: new.target_lines,
                created_at: t.stamp(),
            };
            t.tests.insert(test.id, test.clone());
            Ok(test)
        })
    }

    fn test(&self, id: TestId) -> Result<Option<TestCase>, StoreError> {
        self.read(|t| t.tests.get(&id).cloned())
    }

    fn tests_for_game(&self, game_id: GameId) -> Result<Vec<TestCase>, StoreError> {
        self.read(|t| t.tests.values().filter(|x| x.game_id == game_id).cloned().collect())
    }

    fn valid_tests_for_class(&self, class_id: ClassId) -> Result<Vec<TestCase>, StoreError> {
        self.read(|t| {
            t.tests
                .values()
                .filter(|x| x.class_id == class_id && x.state == TestState::Valid)
                .cloned()
                .collect()
        })
    }

    fn add_test_score(&self, id: TestId, delta: i32) -> Result<(), StoreError> {
        self.write(|t| {
            let test = t.tests.get_mut(&id).ok_or(StoreError::Missing { kind: "test", id })?;
            test.score += delta;
            Ok(())
        })
    }

    fn kill_map_entry(&self, test: TestId, mutant: MutantId) -> Result<Option<KillMapEntry>, StoreError> {
        self.read(|t| t.kill_map.get(&test).and_then(|row| row.get(&mutant)).cloned())
    }

    fn insert_kill_map_entry(&self, entry: KillMapEntry) -> Result<KillMapEntry, StoreError> {
        self.write(|t| {
            let row = t.kill_map.entry(entry.test_id).or_default();
            if let Some(existing) = row.get(&entry.mutant_id) {
                debug!(test = entry.test_id, mutant = entry.mutant_id, "kill map entry already present");
                return Ok(existing.clone());
            }
            row.insert(entry.mutant_id, entry.clone());
            Ok(entry)
        })
    }

    fn kill_map_for_mutant(&self, mutant: MutantId) -> Result<Vec<KillMapEntry>, StoreError> {
        self.read(|t| {
            t.kill_map
                .values()
                .filter_map(|row| row.get(&mutant))
                .cloned()
                .collect()
        })
    }

    fn open_duel(&self, mutant: MutantId, claimant: Actor) -> Result<Option<EquivalenceDuel>, StoreError> {
        self.write(|t| {
            if t.pending_duel_id(mutant).is_some() {
                return Ok(None);
            }
            let m = t.mutant_mut(mutant)?;
            if m.state != MutantState::Alive {
                return Ok(None);
            }
            m.state = MutantState::FlaggedEquivalent;
            let game_id = m.game_id;
            let duel = EquivalenceDuel {
                id: t.next_id(),
                mutant_id: mutant,
                game_id,
                claimant,
                state: DuelState::Pending,
                outcome: DuelOutcome::Unresolved,
                killing_test: None,
                validation: Vec::new(),
                opened_at: t.stamp(),
                resolved_at: None,
            };
            t.duels.insert(duel.id, duel.clone());
            Ok(Some(duel))
        })
    }

    fn pending_duel(&self, mutant: MutantId) -> Result<Option<EquivalenceDuel>, StoreError> {
        self.read(|t| t.pending_duel_id(mutant).and_then(|id| t.duels.get(&id).cloned()))
    }

    fn pending_duels_for_game(&self, game_id: GameId) -> Result<Vec<EquivalenceDuel>, StoreError> {
        self.read(|t| {
            t.duels
                .values()
                .filter(|d| d.game_id == game_id && d.state == DuelState::Pending)
                .cloned()
                .collect()
        })
    }

    fn duels_for_mutant(&self, mutant: MutantId) -> Result<Vec<EquivalenceDuel>, StoreError> {
        self.read(|t| t.duels.values().filter(|d| d.mutant_id == mutant).cloned().collect())
    }

    fn resolve_duel(
        &self,
        mutant: MutantId,
        resolution: DuelResolution,
    ) -> Result<Option<EquivalenceDuel>, StoreError> {
        let next = match resolution.outcome {
            DuelOutcome::DeclaredEquivalent => MutantState::DeclaredEquivalent,
            DuelOutcome::ProvenNonEquivalent => MutantState::ProvenNonEquivalent,
            DuelOutcome::Unresolved => {
                return Err(StoreError::IllegalTransition {
                    id: mutant,
                    from: MutantState::FlaggedEquivalent,
                    to: MutantState::FlaggedEquivalent,
                });
            }
        };
        self.write(|t| {
            let Some(duel_id) = t.pending_duel_id(mutant) else {
                return Ok(None);
            };
            let stamp = t.stamp();
            let m = t.mutant_mut(mutant)?;
            if m.state != MutantState::FlaggedEquivalent {
                return Err(StoreError::IllegalTransition {
                    id: mutant,
                    from: m.state,
                    to: next,
                });
            }
            m.state = next;
            if resolution.killing_test.is_some() {
                m.killed_by = resolution.killing_test;
            }
            let duel = t
                .duels
                .get_mut(&duel_id)
                .ok_or(StoreError::Missing { kind: "duel", id: duel_id })?;
            duel.state = DuelState::Resolved;
            duel.outcome = resolution.outcome;
            duel.killing_test = resolution.killing_test;
            duel.validation = resolution.validation;
            duel.resolved_at = Some(stamp);
            Ok(Some(duel.clone()))
        })
    }
}
