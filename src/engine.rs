//! The engine handle and game administration.
//!
//! An [`Engine`] owns no game data. Every operation reads what it needs from
//! the store, so several engines (or threads sharing one) can serve the same
//! games concurrently.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use crate::compiler::{CommandCompiler, CompileResult, CompileUnit, Compiler, class_name_of};
use crate::config::EngineConfig;
use crate::duel::EquivalenceDuel;
use crate::error::EngineError;
use crate::events::{Event, EventCategory, LogNotifier, Notifier, Visibility};
use crate::game::{Action, Game, GameClass, GameRules, GameState, Player};
use crate::judge::{Judge, ProcessJudge};
use crate::killmap::KillMapBuilder;
use crate::mutants::Mutant;
use crate::selection::{RandomSelector, TestSelector};
use crate::store::{MemoryStore, Store};
use crate::test_case::TestCase;
use crate::validation::{BasicValidator, NoSmells, SmellDetector, SubmissionValidator};
use crate::workspace::Workspace;
use crate::{Actor, ClassId, GameId, PlayerId, Role};

pub struct Engine {
    pub(crate) store: Arc<dyn Store>,
    pub(crate) compiler: Arc<dyn Compiler>,
    pub(crate) judge: Arc<dyn Judge>,
    pub(crate) notifier: Arc<dyn Notifier>,
    pub(crate) validator: Arc<dyn SubmissionValidator>,
    pub(crate) smells: Arc<dyn SmellDetector>,
    pub(crate) selector: Arc<dyn TestSelector>,
    pub(crate) workspace: Workspace,
    pub(crate) config: EngineConfig,
}

/// Assembles an [`Engine`]. Collaborators left unset are built from the
/// config: process compiler and judge, an in-memory store, log notifications.
pub struct EngineBuilder {
    config: EngineConfig,
    store: Option<Arc<dyn Store>>,
    compiler: Option<Arc<dyn Compiler>>,
    judge: Option<Arc<dyn Judge>>,
    notifier: Option<Arc<dyn Notifier>>,
    validator: Option<Arc<dyn SubmissionValidator>>,
    smells: Option<Arc<dyn SmellDetector>>,
    selector: Option<Arc<dyn TestSelector>>,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        EngineBuilder {
            config,
            store: None,
            compiler: None,
            judge: None,
            notifier: None,
            validator: None,
            smells: None,
            selector: None,
        }
    }

    pub fn store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn compiler(mut self, compiler: Arc<dyn Compiler>) -> Self {
        self.compiler = Some(compiler);
        self
    }

    pub fn judge(mut self, judge: Arc<dyn Judge>) -> Self {
        self.judge = Some(judge);
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn validator(mut self, validator: Arc<dyn SubmissionValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn smells(mut self, smells: Arc<dyn SmellDetector>) -> Self {
        self.smells = Some(smells);
        self
    }

    pub fn selector(mut self, selector: Arc<dyn TestSelector>) -> Self {
        self.selector = Some(selector);
        self
    }

    pub fn build(self) -> Result<Engine, EngineError> {
        let config = self.config;
        let compiler: Arc<dyn Compiler> = match self.compiler {
            Some(c) => c,
            None => Arc::new(CommandCompiler::new(
                &config.compiler_command,
                config.classpath.clone(),
                config.compile_timeout(),
            )?),
        };
        let judge: Arc<dyn Judge> = match self.judge {
            Some(j) => j,
            None => Arc::new(ProcessJudge::new(&config.judge_command, config.classpath.clone())?),
        };
        Ok(Engine {
            store: self.store.unwrap_or_else(|| Arc::new(MemoryStore::new())),
            compiler,
            judge,
            notifier: self.notifier.unwrap_or_else(|| Arc::new(LogNotifier)),
            validator: self.validator.unwrap_or_else(|| Arc::new(BasicValidator)),
            smells: self.smells.unwrap_or_else(|| Arc::new(NoSmells)),
            selector: self
                .selector
                .unwrap_or_else(|| Arc::new(RandomSelector::new(config.validation_seed))),
            workspace: Workspace::new(&config.workspace_root),
            config,
        })
    }
}

/// Read-only view of one game.
#[derive(Debug, Clone, Serialize)]
pub struct GameSummary {
    pub game: Game,
    pub players: Vec<Player>,
    /// Mutants that compiled and take part in the game.
    pub mutants: Vec<Mutant>,
    /// Submissions that failed to compile. They keep the initial state but
    /// are never judged, so they are not counted as alive.
    pub unviable_mutants: Vec<Mutant>,
    pub tests: Vec<TestCase>,
    pub pending_duels: Vec<EquivalenceDuel>,
}

impl Engine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    pub fn store(&self) -> &dyn Store {
        self.store.as_ref()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Compiles a class under test and makes it available to new games.
    pub fn register_class(&self, source: &str) -> Result<GameClass, EngineError> {
        let name = class_name_of(source)
            .ok_or_else(|| EngineError::Validation(vec!["no class declaration found".to_string()]))?;
        let dir = self.workspace.class_dir(&name)?;
        let unit = CompileUnit {
            class_name: &name,
            source,
        };
        match self.compiler.compile(&unit, None, &dir)? {
            CompileResult::Compiled(artifact) => {
                let class = self.store.insert_class(&name, source, artifact)?;
                info!(class = class.id, name = %class.name, "class registered");
                Ok(class)
            }
            CompileResult::Failed(diagnostics) => Err(EngineError::Compile(diagnostics)),
        }
    }

    pub fn create_game(&self, class_id: ClassId, rules: GameRules) -> Result<Game, EngineError> {
        self.load_class(class_id)?;
        let game = self.store.insert_game(class_id, rules)?;
        info!(game = game.id, class = class_id, "game created");
        Ok(game)
    }

    pub fn join_game(&self, game_id: GameId, name: &str, role: Role) -> Result<Player, EngineError> {
        let game = self.load_game(game_id)?;
        ensure_permits(&game, Action::Join)?;
        let player = self.store.insert_player(game_id, name, role)?;
        info!(game = game_id, player = player.id, %role, "player joined");
        Ok(player)
    }

    /// Opens the game for submissions. Needs at least one attacker and one
    /// defender.
    pub fn start_game(&self, game_id: GameId) -> Result<Game, EngineError> {
        let game = self.load_game(game_id)?;
        let players = self.store.players_for_game(game_id)?;
        let has = |role| players.iter().any(|p| p.role == role);
        if game.state == GameState::Created && !(has(Role::Attacker) && has(Role::Defender)) {
            return Err(EngineError::Validation(vec![
                "a game needs at least one attacker and one defender".to_string(),
            ]));
        }
        self.transition(&game, GameState::Active)
    }

    /// Active goes to the first grace period, which goes to the second.
    pub fn enter_grace(&self, game_id: GameId) -> Result<Game, EngineError> {
        let game = self.load_game(game_id)?;
        let next = match game.state {
            GameState::Active => GameState::GraceOne,
            GameState::GraceOne => GameState::GraceTwo,
            other => {
                return Err(EngineError::GameTransition {
                    game: game_id,
                    from: other,
                    to: GameState::GraceOne,
                });
            }
        };
        self.transition(&game, next)
    }

    pub fn finish_game(&self, game_id: GameId) -> Result<Game, EngineError> {
        let game = self.load_game(game_id)?;
        self.transition(&game, GameState::Finished)
    }

    pub fn game_summary(&self, game_id: GameId) -> Result<GameSummary, EngineError> {
        let (mutants, unviable_mutants): (Vec<Mutant>, Vec<Mutant>) = self
            .store
            .mutants_for_game(game_id)?
            .into_iter()
            .partition(Mutant::is_viable);
        Ok(GameSummary {
            game: self.load_game(game_id)?,
            players: self.store.players_for_game(game_id)?,
            mutants,
            unviable_mutants,
            tests: self.store.tests_for_game(game_id)?,
            pending_duels: self.store.pending_duels_for_game(game_id)?,
        })
    }

    fn transition(&self, game: &Game, next: GameState) -> Result<Game, EngineError> {
        let illegal = |from| EngineError::GameTransition {
            game: game.id,
            from,
            to: next,
        };
        if !game.state.can_transition_to(next) {
            return Err(illegal(game.state));
        }
        if !self.store.compare_and_set_game_state(game.id, game.state, next)? {
            let current = self.load_game(game.id)?;
            return Err(illegal(current.state));
        }
        info!(game = game.id, from = %game.state, to = %next, "game state changed");
        self.notify(Event::new(
            game.id,
            Actor::System,
            EventCategory::GameStateChanged,
            Visibility::Game,
            format!("The game is now {}.", next),
        ));
        self.load_game(game.id)
    }

    /// Moves an active game into grace once its round limit is used up.
    /// Returns the new state when a transition happened.
    pub(crate) fn maybe_enter_grace(&self, game_id: GameId) -> Result<Option<GameState>, EngineError> {
        let game = self.load_game(game_id)?;
        if game.state != GameState::Active || !game.round_limit_reached() {
            return Ok(None);
        }
        match self.transition(&game, GameState::GraceOne) {
            Ok(game) => Ok(Some(game.state)),
            // Someone else moved the game on first.
            Err(EngineError::GameTransition { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub(crate) fn load_game(&self, id: GameId) -> Result<Game, EngineError> {
        self.store
            .game(id)?
            .ok_or(EngineError::NotFound { kind: "game", id })
    }

    pub(crate) fn load_class(&self, id: ClassId) -> Result<GameClass, EngineError> {
        self.store
            .class(id)?
            .ok_or(EngineError::NotFound { kind: "class", id })
    }

    pub(crate) fn load_mutant(&self, id: crate::MutantId) -> Result<Mutant, EngineError> {
        self.store
            .mutant(id)?
            .ok_or(EngineError::NotFound { kind: "mutant", id })
    }

    /// The player, checked to be in `game` with `role`.
    pub(crate) fn require_player(
        &self,
        game: &Game,
        player_id: PlayerId,
        role: Role,
    ) -> Result<Player, EngineError> {
        let player = self.store.player(player_id)?.ok_or(EngineError::NotFound {
            kind: "player",
            id: player_id,
        })?;
        if player.game_id != game.id {
            return Err(EngineError::NotInGame {
                player: player_id,
                game: game.id,
            });
        }
        if player.role != role {
            return Err(EngineError::WrongRole {
                player: player_id,
                expected: role,
            });
        }
        Ok(player)
    }

    pub(crate) fn kill_map_builder(&self) -> KillMapBuilder<'_> {
        KillMapBuilder::new(self.store.as_ref(), self.judge.as_ref(), self.config.judge_timeout())
            .workers(self.config.workers)
    }

    pub(crate) fn notify(&self, event: Event) {
        debug!(game = event.game_id, category = ?event.category, "event raised");
        self.notifier.notify(event);
    }
}

pub(crate) fn ensure_permits(game: &Game, action: Action) -> Result<(), EngineError> {
    if game.state.permits(action) {
        Ok(())
    } else {
        Err(EngineError::IllegalAction {
            game: game.id,
            action,
            state: game.state,
        })
    }
}
