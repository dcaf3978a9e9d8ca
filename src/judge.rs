use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::compiler::ArtifactHandle;
use crate::error::InfraError;
use crate::runner::{self, CommandTemplate, ProcessOutcome};

/// Environment variable naming the file a test runner may write covered
/// line numbers of the class under test into.
pub const COVERAGE_FILE_ENV: &str = "MUTDUEL_COVERAGE_FILE";

const EVIDENCE_LIMIT: usize = 2000;

const ASSERTION_MARKERS: &[&str] = &[
    "AssertionError",
    "AssertionFailedError",
    "ComparisonFailure",
    "expected:<",
];

/// Outcome of running one test against one target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Verdict {
    Pass,
    /// An assertion failed.
    Fail,
    /// The test crashed for another reason.
    Error,
    /// Killed after exceeding the wall-clock budget.
    Timeout,
}

impl Verdict {
    /// Whether the test detected the target. Only meaningful for mutants.
    pub fn detects(self) -> bool {
        match self {
            Verdict::Pass => false,
            Verdict::Fail | Verdict::Error | Verdict::Timeout => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub verdict: Verdict,
    /// Short summary of the failure, empty on a pass.
    pub evidence: String,
    pub duration_ms: u64,
    pub covered_lines: BTreeSet<u32>,
}

/// What a test runs against.
#[derive(Debug, Clone, Copy)]
pub enum Target<'a> {
    Original(&'a ArtifactHandle),
    Mutant(&'a ArtifactHandle),
}

impl<'a> Target<'a> {
    pub fn artifact(self) -> &'a ArtifactHandle {
        match self {
            Target::Original(a) | Target::Mutant(a) => a,
        }
    }
}

pub trait Judge: Send + Sync {
    /// Runs `test` against `target` in isolation. Errors are reserved for
    /// sandbox faults; a crashing or hanging test is a verdict.
    fn run(&self, test: &ArtifactHandle, target: Target<'_>, timeout: Duration) -> Result<Execution, InfraError>;
}

/// Runs each test in a fresh process built from a command template.
///
/// Placeholders: `{classpath}` (test classes, then target classes, then the
/// configured extra entries), `{test_class}`, `{test_dir}`, `{target_dir}`.
#[derive(Debug, Clone)]
pub struct ProcessJudge {
    template: CommandTemplate,
    classpath: Vec<PathBuf>,
}

impl ProcessJudge {
    pub fn new(template: &str, classpath: Vec<PathBuf>) -> Result<Self, InfraError> {
        Ok(ProcessJudge {
            template: CommandTemplate::parse(template)?,
            classpath,
        })
    }
}

impl Judge for ProcessJudge {
    fn run(&self, test: &ArtifactHandle, target: Target<'_>, timeout: Duration) -> Result<Execution, InfraError> {
        let target_dir = &target.artifact().dir;
        let scratch = tempfile::Builder::new()
            .prefix("mutduel-run-")
            .tempdir()
            .map_err(|e| InfraError::io(std::env::temp_dir(), e))?;
        let coverage_file = scratch.path().join("coverage.txt");

        let mut entries: Vec<&Path> = vec![test.dir.as_path(), target_dir.as_path()];
        entries.extend(self.classpath.iter().map(PathBuf::as_path));
        let classpath = runner::join_classpath(entries)?;
        let test_dir = test.dir.to_string_lossy().to_string();
        let target_dir_arg = target_dir.to_string_lossy().to_string();
        let (program, args) = self.template.render(&[
            ("classpath", &classpath),
            ("test_class", &test.class_name),
            ("test_dir", &test_dir),
            ("target_dir", &target_dir_arg),
        ]);

        let outcome = runner::run_with_timeout(
            &program,
            &args,
            scratch.path(),
            &[(COVERAGE_FILE_ENV, coverage_file.as_path())],
            timeout,
        )?;
        let covered_lines = read_coverage(&coverage_file);
        let duration_ms = outcome.duration_ms();
        let output = outcome.combined_output();

        let verdict = match &outcome {
            ProcessOutcome::TimedOut { .. } => Verdict::Timeout,
            ProcessOutcome::Exited { success: true, .. } => Verdict::Pass,
            ProcessOutcome::Exited { .. } if is_assertion_failure(&output) => Verdict::Fail,
            ProcessOutcome::Exited { .. } => Verdict::Error,
        };
        let evidence = match verdict {
            Verdict::Pass => String::new(),
            Verdict::Timeout => format!("no result within {} ms", timeout.as_millis()),
            Verdict::Fail | Verdict::Error => summarize(&output),
        };
        debug!(test = %test.class_name, ?verdict, duration_ms, "judged");

        Ok(Execution {
            verdict,
            evidence,
            duration_ms,
            covered_lines,
        })
    }
}

fn is_assertion_failure(output: &str) -> bool {
    ASSERTION_MARKERS.iter().any(|m| output.contains(m))
}

/// The first line that names an exception or assertion, falling back to the
/// tail of the output.
pub fn summarize(output: &str) -> String {
    let headline = output
        .lines()
        .map(str::trim)
        .find(|l| l.contains("Exception") || l.contains("Error") || l.contains("expected"));
    let text = match headline {
        Some(line) => line.to_string(),
        None => {
            let lines: Vec<&str> = output.lines().collect();
            let start = lines.len().saturating_sub(5);
            lines[start..].join("\n")
        }
    };
    truncate(text, EVIDENCE_LIMIT)
}

fn truncate(mut text: String, limit: usize) -> String {
    if text.len() > limit {
        let mut cut = limit;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
        text.push_str("...");
    }
    text
}

/// Parses covered line numbers separated by commas or whitespace. A missing
/// or unreadable file means no coverage was reported.
pub fn read_coverage(path: &Path) -> BTreeSet<u32> {
    std::fs::read_to_string(path)
        .map(|text| parse_lines_list(&text))
        .unwrap_or_default()
}

pub fn parse_lines_list(text: &str) -> BTreeSet<u32> {
    text.split(|c: char| c == ',' || c.is_whitespace())
        .filter_map(|s| s.trim().parse().ok())
        .collect()
}
