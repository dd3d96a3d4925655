use mdstest_core::TestOutcome;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use tracing::warn;

/// Outcomes of one run, keyed by test id.
///
/// Recording is additive: a second outcome for the same test id replaces the
/// first, nothing is ever removed. Completion order does not matter.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunReport {
    run_id: String,
    /// Test ids in the order they were planned.
    tests: Vec<String>,
    outcomes: BTreeMap<String, TestOutcome>,
    #[serde(skip)]
    planned: HashSet<String>,
}

impl RunReport {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self::with_tests(run_id, Vec::new())
    }

    /// Duplicate ids in `tests` are kept once, first occurrence wins.
    pub fn with_tests(run_id: impl Into<String>, tests: Vec<String>) -> Self {
        let mut planned = HashSet::with_capacity(tests.len());
        let tests = tests.into_iter().filter(|t| planned.insert(t.clone())).collect();
        RunReport { run_id: run_id.into(), tests, outcomes: BTreeMap::new(), planned }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Store `outcome` for `test_id`. Outcomes for another run are refused.
    pub fn record(&mut self, run_id: &str, test_id: &str, outcome: TestOutcome) -> bool {
        if run_id != self.run_id {
            warn!(expected = %self.run_id, got = run_id, test_id, "outcome for another run ignored");
            return false;
        }
        if self.planned.insert(test_id.to_string()) {
            self.tests.push(test_id.to_string());
        }
        self.outcomes.insert(test_id.to_string(), outcome);
        true
    }

    pub fn is_complete(&self, test_id: &str) -> bool {
        self.outcomes.contains_key(test_id)
    }

    pub fn outcome(&self, test_id: &str) -> Option<&TestOutcome> {
        self.outcomes.get(test_id)
    }

    pub fn outcomes(&self) -> &BTreeMap<String, TestOutcome> {
        &self.outcomes
    }

    /// Planned test ids with their outcome so far, in plan order.
    pub fn iter_planned(&self) -> impl Iterator<Item = (&str, Option<&TestOutcome>)> {
        self.tests.iter().map(|t| (t.as_str(), self.outcomes.get(t)))
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    pub fn passed(&self) -> usize {
        self.outcomes.values().filter(|o| o.passed()).count()
    }

    pub fn failed(&self) -> usize {
        self.len() - self.passed()
    }

    /// Every planned test has an outcome.
    pub fn all_complete(&self) -> bool {
        self.tests.iter().all(|t| self.is_complete(t))
    }

    pub fn into_report(self) -> BTreeMap<String, TestOutcome> {
        self.outcomes
    }
}
