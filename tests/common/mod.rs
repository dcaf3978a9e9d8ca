#![allow(dead_code)]

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

use mutduel::compiler::{
    ArtifactHandle, CompileResult, CompileUnit, Compiler, Diagnostics, sha256_hex,
};
use mutduel::config::EngineConfig;
use mutduel::engine::Engine;
use mutduel::error::InfraError;
use mutduel::events::MemoryNotifier;
use mutduel::game::{Game, GameClass, GameRules, Player};
use mutduel::judge::{Execution, Judge, Target, Verdict};
use mutduel::mutants::Mutant;
use mutduel::selection::OldestFirstSelector;
use mutduel::store::{MemoryStore, Store};
use mutduel::Role;
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

pub const COUNTER: &str = "public class Counter {
    private int count;
    public void increment() {
        count = count + 1;
    }
    public int get() {
        return count;
    }
}
";

pub fn init_test_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_env("MUTDUEL_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// `COUNTER` with line `line` (one-based) replaced and tagged, so the
/// scripted judge can tell mutants apart.
pub fn mutant_source(line: usize, replacement: &str, tag: &str) -> String {
    COUNTER
        .lines()
        .enumerate()
        .map(|(i, l)| {
            if i + 1 == line {
                format!("{} // tag: {}\n", replacement, tag)
            } else {
                format!("{}\n", l)
            }
        })
        .collect()
}

/// Mutant touching line 4.
pub fn mutant_a() -> String {
    mutant_source(4, "        count = count + 2;", "a")
}

/// Mutant touching line 7.
pub fn mutant_b() -> String {
    mutant_source(7, "        return count + 1;", "b")
}

/// Mutant touching line 2.
pub fn mutant_c() -> String {
    mutant_source(2, "    private int count = 0;", "c")
}

/// A JUnit-shaped test the scripted judge understands. `extra` holds marker
/// comments such as `// kills: a` or `// fails-original`.
pub fn test_source(name: &str, covers: &[u32], extra: &[&str]) -> String {
    let covers: Vec<String> = covers.iter().map(u32::to_string).collect();
    let mut src = String::from("import org.junit.Test;\n");
    src.push_str(&format!("// covers: {}\n", covers.join(",")));
    for line in extra {
        src.push_str(line);
        src.push('\n');
    }
    src.push_str(&format!(
        "public class {} {{\n    @Test\n    public void test() {{\n        assertEquals(1, new Counter().get() + 1);\n    }}\n}}\n",
        name
    ));
    src
}

/// Writes the source next to where class files would go. Sources containing
/// `DOES_NOT_COMPILE` fail with javac-shaped output. The artifact digest
/// ignores whitespace, standing in for identical bytecode.
#[derive(Default)]
pub struct FakeCompiler {
    pub compiles: AtomicUsize,
}

impl Compiler for FakeCompiler {
    fn compile(
        &self,
        unit: &CompileUnit<'_>,
        _reference: Option<&ArtifactHandle>,
        out_dir: &Path,
    ) -> Result<CompileResult, InfraError> {
        self.compiles.fetch_add(1, Ordering::SeqCst);
        if let Some(idx) = unit.source.lines().position(|l| l.contains("DOES_NOT_COMPILE")) {
            let output = format!(
                "{}/src/{}.java:{}: error: cannot find symbol\n1 error\n",
                out_dir.display(),
                unit.class_name,
                idx + 1
            );
            return Ok(CompileResult::Failed(Diagnostics::from_output(output)));
        }
        let classes = out_dir.join("classes");
        std::fs::create_dir_all(&classes).map_err(|e| InfraError::Sandbox(e.to_string()))?;
        std::fs::write(classes.join(format!("{}.src", unit.class_name)), unit.source)
            .map_err(|e| InfraError::Sandbox(e.to_string()))?;
        let normalized: String = unit.source.chars().filter(|c| !c.is_whitespace()).collect();
        Ok(CompileResult::Compiled(ArtifactHandle {
            class_name: unit.class_name.to_string(),
            dir: classes,
            digest: sha256_hex(normalized.as_bytes()),
        }))
    }
}

/// Decides verdicts from marker comments in the test source:
/// `// covers: 3,4`, `// fails-original`, and `// kills:`, `// errors:`,
/// `// hangs:`, `// crashes:` followed by mutant tags.
#[derive(Default)]
pub struct ScriptedJudge {
    pub runs: AtomicUsize,
}

impl ScriptedJudge {
    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

fn read_artifact(artifact: &ArtifactHandle) -> Result<String, InfraError> {
    std::fs::read_to_string(artifact.dir.join(format!("{}.src", artifact.class_name)))
        .map_err(|e| InfraError::Sandbox(e.to_string()))
}

fn marker<'a>(source: &'a str, name: &str) -> Vec<&'a str> {
    let prefix = format!("// {}:", name);
    source
        .lines()
        .filter_map(|l| l.trim().strip_prefix(prefix.as_str()))
        .flat_map(|rest| rest.split(|c: char| c == ',' || c.is_whitespace()))
        .filter(|s| !s.is_empty())
        .collect()
}

fn tag_of(source: &str) -> Option<String> {
    source
        .lines()
        .find_map(|l| l.split("// tag: ").nth(1))
        .map(|t| t.trim().to_string())
}

impl Judge for ScriptedJudge {
    fn run(&self, test: &ArtifactHandle, target: Target<'_>, _timeout: Duration) -> Result<Execution, InfraError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        let source = read_artifact(test)?;
        let covered_lines: BTreeSet<u32> = marker(&source, "covers")
            .into_iter()
            .filter_map(|s| s.parse().ok())
            .collect();
        let execution = |verdict, evidence: &str| Execution {
            verdict,
            evidence: evidence.to_string(),
            duration_ms: 1,
            covered_lines: covered_lines.clone(),
        };

        match target {
            Target::Original(_) => {
                if source.contains("// fails-original") {
                    Ok(execution(Verdict::Fail, "java.lang.AssertionError: expected:<1> but was:<0>"))
                } else {
                    Ok(execution(Verdict::Pass, ""))
                }
            }
            Target::Mutant(artifact) => {
                let tag = tag_of(&read_artifact(artifact)?).unwrap_or_default();
                let has = |name| marker(&source, name).contains(&tag.as_str());
                if has("crashes") {
                    Err(InfraError::Sandbox(format!("runner crashed on {}", tag)))
                } else if has("hangs") {
                    Ok(execution(Verdict::Timeout, "no result"))
                } else if has("errors") {
                    Ok(execution(Verdict::Error, "java.lang.NullPointerException"))
                } else if has("kills") {
                    Ok(execution(Verdict::Fail, "java.lang.AssertionError"))
                } else {
                    Ok(execution(Verdict::Pass, ""))
                }
            }
        }
    }
}

pub struct Fixture {
    pub tmp: TempDir,
    pub engine: Engine,
    pub store: Arc<MemoryStore>,
    pub judge: Arc<ScriptedJudge>,
    pub compiler: Arc<FakeCompiler>,
    pub notifier: Arc<MemoryNotifier>,
    pub class: GameClass,
    pub game: Game,
    pub attacker: Player,
    pub defender: Player,
}

impl Fixture {
    /// An active game on `COUNTER` with one attacker and one defender.
    pub fn new(rules: GameRules) -> Self {
        Fixture::with_config(rules, |_| {})
    }

    pub fn with_config(rules: GameRules, tweak: impl FnOnce(&mut EngineConfig)) -> Self {
        init_test_logging();
        let tmp = TempDir::new().unwrap();
        let mut config = EngineConfig {
            workspace_root: tmp.path().join("ws"),
            validation_seed: Some(7),
            ..EngineConfig::default()
        };
        tweak(&mut config);

        let store = Arc::new(MemoryStore::new());
        let judge = Arc::new(ScriptedJudge::default());
        let compiler = Arc::new(FakeCompiler::default());
        let notifier = Arc::new(MemoryNotifier::new());
        let engine = Engine::builder(config)
            .store(store.clone())
            .compiler(compiler.clone())
            .judge(judge.clone())
            .notifier(notifier.clone())
            .selector(Arc::new(OldestFirstSelector))
            .build()
            .unwrap();

        let class = engine.register_class(COUNTER).unwrap();
        let game = engine.create_game(class.id, rules).unwrap();
        let attacker = engine.join_game(game.id, "alice", Role::Attacker).unwrap();
        let defender = engine.join_game(game.id, "bob", Role::Defender).unwrap();
        let game = engine.start_game(game.id).unwrap();

        Fixture {
            tmp,
            engine,
            store,
            judge,
            compiler,
            notifier,
            class,
            game,
            attacker,
            defender,
        }
    }

    /// Another active game on the same class.
    pub fn second_game(&self, rules: GameRules) -> (Game, Player, Player) {
        let game = self.engine.create_game(self.class.id, rules).unwrap();
        let attacker = self.engine.join_game(game.id, "carol", Role::Attacker).unwrap();
        let defender = self.engine.join_game(game.id, "dave", Role::Defender).unwrap();
        let game = self.engine.start_game(game.id).unwrap();
        (game, attacker, defender)
    }

    pub fn submit_mutant(&self, source: &str) -> Mutant {
        self.engine
            .submit_mutant(self.game.id, self.attacker.id, source, None)
            .unwrap()
            .mutant
    }

    pub fn submit_test(&self, source: &str) -> mutduel::test_case::TestCase {
        self.engine
            .submit_test(self.game.id, self.defender.id, source, BTreeSet::new())
            .unwrap()
            .test
    }

    pub fn mutant(&self, id: u32) -> Mutant {
        self.engine.store().mutant(id).unwrap().unwrap()
    }

    pub fn points(&self, player: u32) -> i32 {
        self.engine.store().player(player).unwrap().unwrap().points
    }

    pub fn game(&self) -> Game {
        self.engine.store().game(self.game.id).unwrap().unwrap()
    }
}
