//! The test × mutant verdict matrix.
//!
//! Verdicts are memoized globally by `(test, mutant)`: a pair that already has
//! an entry is never executed again, whichever game asked for it. New entries
//! go to the store one by one as soon as their run finishes, so a crash
//! part-way through a build loses at most the runs still in flight.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::EngineError;
use crate::judge::{Judge, Target, Verdict};
use crate::mutants::Mutant;
use crate::store::Store;
use crate::test_case::TestCase;
use crate::{MutantId, TestId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KillStatus {
    Kill,
    NoKill,
    Error,
    Timeout,
    /// Not executed: the test never reaches any line the mutant touches.
    Unknown,
}

impl KillStatus {
    pub fn from_verdict(verdict: Verdict) -> Self {
        match verdict {
            Verdict::Pass => KillStatus::NoKill,
            Verdict::Fail => KillStatus::Kill,
            Verdict::Error => KillStatus::Error,
            Verdict::Timeout => KillStatus::Timeout,
        }
    }

    /// Errors and timeouts count as kills.
    pub fn is_kill(self) -> bool {
        match self {
            KillStatus::Kill | KillStatus::Error | KillStatus::Timeout => true,
            KillStatus::NoKill | KillStatus::Unknown => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KillMapEntry {
    pub test_id: TestId,
    pub mutant_id: MutantId,
    pub status: KillStatus,
    pub evidence: String,
}

#[derive(Debug, Clone, Default)]
pub struct KillMap {
    entries: BTreeMap<(TestId, MutantId), KillMapEntry>,
    executed: usize,
}

impl KillMap {
    pub fn get(&self, test: TestId, mutant: MutantId) -> Option<&KillMapEntry> {
        self.entries.get(&(test, mutant))
    }

    pub fn entries(&self) -> impl Iterator<Item = &KillMapEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of cells that were actually run by this build.
    pub fn executed(&self) -> usize {
        self.executed
    }

    pub fn killers_of(&self, mutant: MutantId) -> Vec<TestId> {
        self.entries
            .values()
            .filter(|e| e.mutant_id == mutant && e.status.is_kill())
            .map(|e| e.test_id)
            .collect()
    }

    pub fn is_killed(&self, mutant: MutantId) -> bool {
        self.entries
            .values()
            .any(|e| e.mutant_id == mutant && e.status.is_kill())
    }

    fn insert(&mut self, entry: KillMapEntry) {
        self.entries.insert((entry.test_id, entry.mutant_id), entry);
    }
}

pub struct KillMapBuilder<'a> {
    store: &'a dyn Store,
    judge: &'a dyn Judge,
    timeout: Duration,
    workers: usize,
}

impl<'a> KillMapBuilder<'a> {
    pub fn new(store: &'a dyn Store, judge: &'a dyn Judge, timeout: Duration) -> Self {
        KillMapBuilder {
            store,
            judge,
            timeout,
            workers: 1,
        }
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Returns the verdict of every judgeable `(test, mutant)` pair, running
    /// only the pairs with no stored entry.
    ///
    /// Invalid tests and uncompiled mutants are skipped. If any run fails at
    /// the infrastructure level the whole build fails; callers must then
    /// treat killability as unknown.
    pub fn build_or_extend(&self, tests: &[TestCase], mutants: &[Mutant]) -> Result<KillMap, EngineError> {
        let mut map = KillMap::default();
        let mut missing: Vec<(&TestCase, &Mutant)> = Vec::new();

        for test in tests {
            if !test.is_valid() {
                warn!(test = test.id, "skipping test that is not valid");
                continue;
            }
            for mutant in mutants {
                if !mutant.is_viable() {
                    continue;
                }
                if let Some(existing) = self.store.kill_map_entry(test.id, mutant.id)? {
                    map.insert(existing);
                    continue;
                }
                if !test.covered_lines.is_empty() && !mutant.lines.is_empty() && !test.covers(mutant) {
                    let entry = self.store.insert_kill_map_entry(KillMapEntry {
                        test_id: test.id,
                        mutant_id: mutant.id,
                        status: KillStatus::Unknown,
                        evidence: "test does not reach the mutated lines".to_string(),
                    })?;
                    map.insert(entry);
                    continue;
                }
                missing.push((test, mutant));
            }
        }

        let reused = map.len();
        let fresh = if self.workers <= 1 || missing.len() <= 1 {
            missing
                .iter()
                .map(|(t, m)| self.judge_pair(t, m))
                .collect::<Result<Vec<_>, _>>()?
        } else {
            self.judge_parallel(&missing)?
        };
        map.executed = fresh.len();
        for entry in fresh {
            map.insert(entry);
        }

        info!(reused, executed = map.executed, total = map.len(), "kill map built");
        Ok(map)
    }

    fn judge_pair(&self, test: &TestCase, mutant: &Mutant) -> Result<KillMapEntry, EngineError> {
        let (Some(test_artifact), Some(mutant_artifact)) = (&test.artifact, &mutant.artifact) else {
            return Err(EngineError::NotFound {
                kind: "artifact",
                id: mutant.id,
            });
        };
        let execution = self
            .judge
            .run(test_artifact, Target::Mutant(mutant_artifact), self.timeout)?;
        let candidate = KillMapEntry {
            test_id: test.id,
            mutant_id: mutant.id,
            status: KillStatus::from_verdict(execution.verdict),
            evidence: execution.evidence,
        };
        // A concurrent build may have stored this pair first; its entry wins.
        let stored = self.store.insert_kill_map_entry(candidate)?;
        debug!(test = test.id, mutant = mutant.id, status = ?stored.status, "pair judged");
        Ok(stored)
    }

    fn judge_parallel(&self, missing: &[(&TestCase, &Mutant)]) -> Result<Vec<KillMapEntry>, EngineError> {
        let next = AtomicUsize::new(0);
        let failed = AtomicBool::new(false);
        let results: Mutex<Vec<Result<KillMapEntry, EngineError>>> = Mutex::new(Vec::new());

        std::thread::scope(|scope| {
            for _ in 0..self.workers.min(missing.len()) {
                scope.spawn(|| {
                    loop {
                        if failed.load(Ordering::SeqCst) {
                            break;
                        }
                        let idx = next.fetch_add(1, Ordering::SeqCst);
                        let Some((test, mutant)) = missing.get(idx) else {
                            break;
                        };
                        let result = self.judge_pair(test, mutant);
                        if result.is_err() {
                            failed.store(true, Ordering::SeqCst);
                        }
                        if let Ok(mut guard) = results.lock() {
                            guard.push(result);
                        }
                    }
                });
            }
        });

        let results = results
            .into_inner()
            .map_err(|_| EngineError::Store(crate::error::StoreError::Poisoned))?;
        results.into_iter().collect()
    }
}
