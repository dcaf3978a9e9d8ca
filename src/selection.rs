use crate::test_case::TestCase;

/// Picks which tests to run when validating an equivalence verdict.
pub trait TestSelector: Send + Sync {
    /// Returns at most `max` tests.
    fn select(&self, tests: Vec<TestCase>, max: usize) -> Vec<TestCase>;
}

/// Uniform random sample. A fixed seed makes the sample reproducible.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomSelector {
    pub seed: Option<u64>,
}

impl RandomSelector {
    pub fn new(seed: Option<u64>) -> Self {
        RandomSelector { seed }
    }
}

impl TestSelector for RandomSelector {
    fn select(&self, mut tests: Vec<TestCase>, max: usize) -> Vec<TestCase> {
        if tests.len() > max {
            let mut rng = match self.seed {
                Some(seed) => fastrand::Rng::with_seed(seed),
                None => fastrand::Rng::new(),
            };
            // Sorting first keeps a seeded sample independent of input order.
            tests.sort_by_key(|t| t.id);
            rng.shuffle(&mut tests);
            tests.truncate(max);
        }
        tests
    }
}

/// The `max` earliest-created tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct OldestFirstSelector;

impl TestSelector for OldestFirstSelector {
    fn select(&self, mut tests: Vec<TestCase>, max: usize) -> Vec<TestCase> {
        tests.sort_by_key(|t| (t.created_at, t.id));
        tests.truncate(max);
        tests
    }
}
