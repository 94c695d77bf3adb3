//! Named response assertions ("checks").
//!
//! A step runs a set of named boolean predicates against its response and
//! records every outcome. Evaluation never short-circuits: all predicates in
//! a set run even after one fails, so every assertion result is observable
//! in the final report. A predicate that panics counts as a failed
//! assertion, not a crashed VU.
//!
//! The result log is the only check state shared across virtual users; it is
//! append-only behind a mutex, so concurrent VUs never lose entries.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Mutex;

use tracing::{debug, warn};

use crate::client::HttpResponse;

/// One recorded assertion outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckRecord {
    /// Label of the step/outcome the assertion ran against.
    pub label: String,
    /// Assertion name, e.g. "Login status is 200".
    pub name: String,
    pub passed: bool,
}

/// Shared, append-only assertion log.
#[derive(Debug, Default)]
pub struct CheckEvaluator {
    log: Mutex<Vec<CheckRecord>>,
}

impl CheckEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a check set for `label`.
    ///
    /// `response` is `None` when the HTTP call itself failed; in that case
    /// every assertion in the set is recorded as failed without running its
    /// predicate, since there is no response to assert against.
    pub fn check<'a>(&'a self, label: &str, response: Option<&'a HttpResponse>) -> CheckSet<'a> {
        CheckSet {
            evaluator: self,
            label: label.to_string(),
            response,
            all_passed: true,
            results: Vec::new(),
        }
    }

    fn record(&self, record: CheckRecord) {
        self.log.lock().expect("check log poisoned").push(record);
    }

    /// Snapshot of every assertion recorded so far, in append order.
    pub fn records(&self) -> Vec<CheckRecord> {
        self.log.lock().expect("check log poisoned").clone()
    }

    /// (passed, failed) counts over the whole log.
    pub fn counts(&self) -> (usize, usize) {
        let log = self.log.lock().expect("check log poisoned");
        let passed = log.iter().filter(|record| record.passed).count();
        (passed, log.len() - passed)
    }

    pub fn all_passed(&self) -> bool {
        self.log
            .lock()
            .expect("check log poisoned")
            .iter()
            .all(|record| record.passed)
    }
}

/// Builder over one response: each `assert` call evaluates and records
/// immediately, preserving declaration order.
pub struct CheckSet<'a> {
    evaluator: &'a CheckEvaluator,
    label: String,
    response: Option<&'a HttpResponse>,
    all_passed: bool,
    results: Vec<(String, bool)>,
}

impl<'a> CheckSet<'a> {
    pub fn assert(
        mut self,
        name: &str,
        predicate: impl FnOnce(&HttpResponse) -> bool,
    ) -> CheckSet<'a> {
        let passed = match self.response {
            // A panicking predicate is a failed assertion, never a fault.
            Some(response) => {
                catch_unwind(AssertUnwindSafe(|| predicate(response))).unwrap_or(false)
            }
            None => false,
        };

        if passed {
            debug!(label = %self.label, check = name, "check passed");
        } else {
            warn!(label = %self.label, check = name, "check failed");
        }

        self.evaluator.record(CheckRecord {
            label: self.label.clone(),
            name: name.to_string(),
            passed,
        });
        self.results.push((name.to_string(), passed));
        self.all_passed &= passed;
        self
    }

    /// Logical AND over every assertion in this set.
    pub fn passed(&self) -> bool {
        self.all_passed
    }

    /// Consume the set, yielding ordered (name, passed) pairs.
    pub fn into_results(self) -> Vec<(String, bool)> {
        self.results
    }
}
