use std::sync::OnceLock;

use regex::Regex;

use crate::game::GameRules;
use crate::test_case::TestCase;

const BANNED_CONSTRUCTS: &[&str] = &[
    "System.exit",
    "Runtime.getRuntime",
    "ProcessBuilder",
    "Thread.sleep",
    "new Thread",
    "java.lang.reflect",
    "Class.forName",
];

/// Static checks run before anything is compiled. Errors are messages meant
/// for the submitting player.
pub trait SubmissionValidator: Send + Sync {
    fn validate_mutant(&self, original: &str, mutant: &str) -> Result<(), Vec<String>>;
    fn validate_test(&self, source: &str, rules: &GameRules) -> Result<(), Vec<String>>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BasicValidator;

impl SubmissionValidator for BasicValidator {
    fn validate_mutant(&self, original: &str, mutant: &str) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        if strip_whitespace(original) == strip_whitespace(mutant) {
            errors.push("mutant is identical to the original class".to_string());
        }
        errors.extend(banned_constructs(original, mutant));
        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }

    fn validate_test(&self, source: &str, rules: &GameRules) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        if !source.contains("@Test") {
            errors.push("test class has no @Test method".to_string());
        }
        errors.extend(banned_constructs("", source));
        let limit = rules.max_assertions_per_test;
        if limit > 0 {
            let most = assertions_per_test(source).into_iter().max().unwrap_or(0);
            if most > limit as usize {
                errors.push(format!(
                    "a test method has {} assertions, at most {} are allowed",
                    most, limit
                ));
            }
        }
        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }
}

fn strip_whitespace(s: &str) -> String {
    s.chars().filter(|c| !c.is_whitespace()).collect()
}

/// Constructs present in `submitted` that `original` does not already use.
fn banned_constructs(original: &str, submitted: &str) -> Vec<String> {
    BANNED_CONSTRUCTS
        .iter()
        .filter(|c| submitted.contains(**c) && !original.contains(**c))
        .map(|c| format!("use of {} is not allowed", c))
        .collect()
}

/// Assertion count of each `@Test` method, in source order.
pub fn assertions_per_test(source: &str) -> Vec<usize> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern =
        PATTERN.get_or_init(|| Regex::new(r"\bassert\w*\s*\(").expect("assertion pattern is valid"));
    source
        .split("@Test")
        .skip(1)
        .map(|method| pattern.find_iter(method).count())
        .collect()
}

/// Labels test smells on an accepted test. Opaque to the engine.
pub trait SmellDetector: Send + Sync {
    fn detect(&self, test: &TestCase) -> Vec<String>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoSmells;

impl SmellDetector for NoSmells {
    fn detect(&self, _test: &TestCase) -> Vec<String> {
        Vec::new()
    }
}
