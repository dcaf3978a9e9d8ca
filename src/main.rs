use mutduel::config::EngineConfig;
use mutduel::duel;
use mutduel::engine::Engine;
use mutduel::error::EngineError;
use mutduel::events::LogNotifier;
use mutduel::game::GameRules;
use mutduel::judge::parse_lines_list;
use mutduel::mutants::AttackerIntention;
use mutduel::output;
use mutduel::store::MemoryStore;
use mutduel::{GameId, MutantId, PlayerId, Role, state};

use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mutduel", version, about = "Judge a mutation testing game between attackers and defenders")]
struct Cli {
    /// Game state file
    #[arg(long, global = true, env = "MUTDUEL_STATE")]
    state: Option<PathBuf>,
    /// Engine config file (JSON)
    #[arg(long, global = true, env = "MUTDUEL_CONFIG")]
    config: Option<PathBuf>,
    /// Directory for compiled submissions (overrides the config)
    #[arg(long, global = true)]
    workspace: Option<PathBuf>,
    /// Compiler command template (overrides the config)
    #[arg(long, global = true)]
    compiler_cmd: Option<String>,
    /// Test runner command template (overrides the config)
    #[arg(long, global = true)]
    judge_cmd: Option<String>,
    /// Output JSON instead of human-readable text
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile and register a class under test
    Class {
        /// Java source of the class
        file: PathBuf,
    },
    /// Create a game on a registered class
    NewGame {
        #[arg(long)]
        class: u32,
        /// Covering tests a mutant must survive before it is claimed automatically (0 = off)
        #[arg(long, default_value = "0")]
        threshold: u32,
        /// Submissions after which the game enters grace
        #[arg(long)]
        round_limit: Option<u32>,
        /// Assertions allowed per test method (0 = unlimited)
        #[arg(long, default_value = "2")]
        max_assertions: u32,
        /// Require attackers and defenders to state their intention
        #[arg(long)]
        intentions: bool,
    },
    /// Join a game as attacker or defender
    Join {
        #[arg(long)]
        game: GameId,
        #[arg(long)]
        name: String,
        #[arg(long)]
        role: Role,
    },
    /// Open a game for submissions
    Start {
        #[arg(long)]
        game: GameId,
    },
    /// Move a game into its next grace period
    Grace {
        #[arg(long)]
        game: GameId,
    },
    /// End a game
    Finish {
        #[arg(long)]
        game: GameId,
    },
    /// Submit a mutant of the class under test
    SubmitMutant {
        #[arg(long)]
        game: GameId,
        #[arg(long)]
        player: PlayerId,
        file: PathBuf,
        /// kill, survive or equivalent
        #[arg(long)]
        intention: Option<AttackerIntention>,
    },
    /// Submit a test
    SubmitTest {
        #[arg(long)]
        game: GameId,
        #[arg(long)]
        player: PlayerId,
        file: PathBuf,
        /// Lines the test is meant to cover, e.g. "3,4"
        #[arg(long, default_value = "")]
        lines: String,
    },
    /// Claim the mutants on some lines as equivalent
    Claim {
        #[arg(long)]
        game: GameId,
        #[arg(long)]
        player: PlayerId,
        /// Lines of the class under test, e.g. "3,4"
        #[arg(long)]
        lines: String,
    },
    /// Accept an equivalence claim on your mutant
    Accept {
        #[arg(long)]
        game: GameId,
        #[arg(long)]
        player: PlayerId,
        #[arg(long)]
        mutant: MutantId,
    },
    /// Reject an equivalence claim with a test that kills your mutant
    Reject {
        #[arg(long)]
        game: GameId,
        #[arg(long)]
        player: PlayerId,
        #[arg(long)]
        mutant: MutantId,
        file: PathBuf,
    },
    /// Show players, mutants, tests and pending duels of a game
    Status {
        #[arg(long)]
        game: GameId,
    },
}

fn main() {
    let filter = EnvFilter::try_from_env("MUTDUEL_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let json = cli.json;
    let engine = match build_engine(&cli) {
        Ok(engine) => engine,
        Err(code) => process::exit(code),
    };

    let exit_code = match cli.command {
        Commands::Class { file } => match read_source(&file) {
            Ok(source) => finish(engine.register_class(&source), json, |c| {
                output::print_success(&format!("Class {} registered as #{}", c.name, c.id))
            }),
            Err(code) => code,
        },
        Commands::NewGame {
            class,
            threshold,
            round_limit,
            max_assertions,
            intentions,
        } => {
            let rules = GameRules {
                auto_equivalence_threshold: threshold,
                round_limit,
                max_assertions_per_test: max_assertions,
                capture_intentions: intentions,
            };
            finish(engine.create_game(class, rules), json, |g| {
                output::print_success(&format!("Game #{} created", g.id))
            })
        }
        Commands::Join { game, name, role } => finish(engine.join_game(game, &name, role), json, |p| {
            output::print_success(&format!("{} joined as {} (player #{})", p.name, p.role, p.id))
        }),
        Commands::Start { game } => finish(engine.start_game(game), json, print_game_state),
        Commands::Grace { game } => finish(engine.enter_grace(game), json, print_game_state),
        Commands::Finish { game } => finish(engine.finish_game(game), json, print_game_state),
        Commands::SubmitMutant {
            game,
            player,
            file,
            intention,
        } => match read_source(&file) {
            Ok(source) => finish(
                engine.submit_mutant(game, player, &source, intention),
                json,
                output::print_mutant_submission,
            ),
            Err(code) => code,
        },
        Commands::SubmitTest {
            game,
            player,
            file,
            lines,
        } => match read_source(&file) {
            Ok(source) => finish(
                engine.submit_test(game, player, &source, parse_lines_list(&lines)),
                json,
                output::print_test_submission,
            ),
            Err(code) => code,
        },
        Commands::Claim { game, player, lines } => {
            let result = duel::parse_lines(&lines).and_then(|lines| engine.claim_equivalent(game, player, &lines));
            finish(result, json, output::print_claim)
        }
        Commands::Accept { game, player, mutant } => {
            finish(engine.accept_equivalence(game, player, mutant), json, output::print_accept)
        }
        Commands::Reject {
            game,
            player,
            mutant,
            file,
        } => match read_source(&file) {
            Ok(source) => finish(
                engine.reject_equivalence(game, player, mutant, &source),
                json,
                output::print_reject,
            ),
            Err(code) => code,
        },
        Commands::Status { game } => finish(engine.game_summary(game), json, output::print_summary),
    };

    process::exit(exit_code);
}

fn build_engine(cli: &Cli) -> Result<Engine, i32> {
    let mut config = match &cli.config {
        Some(path) => EngineConfig::from_path(path).map_err(|e| {
            output::print_error(&e.to_string());
            2
        })?,
        None => EngineConfig::default(),
    };
    if let Some(ws) = &cli.workspace {
        config.workspace_root = ws.clone();
    }
    if let Some(cmd) = &cli.compiler_cmd {
        config.compiler_command = cmd.clone();
    }
    if let Some(cmd) = &cli.judge_cmd {
        config.judge_command = cmd.clone();
    }
    if let Err(e) = config.validate() {
        output::print_error(&e.to_string());
        return Err(2);
    }

    let state_path = cli.state.clone().unwrap_or_else(state::default_state_path);
    let store = MemoryStore::open(&state_path).map_err(|e| {
        output::print_error(&e.to_string());
        3
    })?;
    Engine::builder(config)
        .store(Arc::new(store))
        .notifier(Arc::new(LogNotifier))
        .build()
        .map_err(|e| report_error(&e, cli.json))
}

fn read_source(path: &Path) -> Result<String, i32> {
    std::fs::read_to_string(path).map_err(|e| {
        output::print_error(&format!(
            "Cannot read {}: {}. Check the path and try again.",
            path.display(),
            e
        ));
        2
    })
}

fn print_game_state(game: &mutduel::game::Game) {
    output::print_success(&format!("Game #{} is now {}", game.id, game.state));
}

fn finish<T: Serialize>(result: Result<T, EngineError>, json: bool, print: impl FnOnce(&T)) -> i32 {
    match result {
        Ok(value) => {
            if json {
                match serde_json::to_string_pretty(&value) {
                    Ok(text) => println!("{}", text),
                    Err(e) => {
                        output::print_error(&format!("Failed to encode result: {}", e));
                        return 3;
                    }
                }
            } else {
                print(&value);
            }
            0
        }
        Err(e) => report_error(&e, json),
    }
}

fn report_error(error: &EngineError, json: bool) -> i32 {
    if json {
        let body = serde_json::json!({ "error": error.to_string(), "recoverable": error.is_recoverable() });
        println!("{}", body);
    } else {
        output::print_error(&error.to_string());
        match error {
            EngineError::Compile(diagnostics) => output::print_diagnostics(diagnostics),
            EngineError::Duplicate {
                diagnostics: Some(diagnostics),
                ..
            } => output::print_diagnostics(diagnostics),
            EngineError::Validation(messages) => {
                for m in messages {
                    eprintln!("  {}", m);
                }
            }
            EngineError::FailsOnOriginal { evidence } if !evidence.is_empty() => eprintln!("  {}", evidence),
            _ => {}
        }
    }
    exit_code(error)
}

fn exit_code(error: &EngineError) -> i32 {
    match error {
        EngineError::Infra(_) | EngineError::Store(_) => 3,
        EngineError::NotFound { .. }
        | EngineError::WrongRole { .. }
        | EngineError::NotInGame { .. }
        | EngineError::IllegalAction { .. }
        | EngineError::GameTransition { .. } => 2,
        _ => 1,
    }
}
