// Copyright (c) The spectree Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Run outcomes and reports.
//!
//! A [`SpecReport`] records what happened to one spec inside one worker; a
//! [`SuiteReport`] accumulates them. Suite reports are the payloads of the
//! coordinator protocol, and their [`merge`](SuiteReport::merge) is
//! associative and commutative over the fields that matter, so per-worker
//! summaries can be folded together in whatever order they arrive.

use crate::{location::CodeLocation, node::NodeKind};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Terminal state of a node or spec run.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionOutcome {
    /// Ran to completion without failing.
    Passed,
    /// An explicit assertion failure was raised.
    Failed,
    /// The body panicked.
    Panicked,
    /// An asynchronous body exceeded its budget.
    TimedOut,
    /// An external abort or suite timeout arrived mid-run.
    Interrupted,
    /// Skipped by focus/skip policy or by an earlier failure.
    Skipped,
    /// Declared pending; reported but never run.
    Pending,
}

impl ExecutionOutcome {
    /// True for outcomes that fail the owning spec.
    pub fn is_failure(self) -> bool {
        matches!(
            self,
            ExecutionOutcome::Failed
                | ExecutionOutcome::Panicked
                | ExecutionOutcome::TimedOut
                | ExecutionOutcome::Interrupted
        )
    }
}

/// A recorded failure: what went wrong and where.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Failure {
    /// Human-readable cause.
    pub message: String,
    /// Where the failure was raised (or the owning node for raw panics).
    pub location: CodeLocation,
    /// The kind of node that failed.
    pub node_kind: NodeKind,
}

impl Failure {
    /// Creates a failure record.
    pub fn new(message: impl Into<String>, location: CodeLocation, node_kind: NodeKind) -> Self {
        Self {
            message: message.into(),
            location,
            node_kind,
        }
    }
}

/// The report for one spec (or one suite-level node) in one worker.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SpecReport {
    /// The container/assertion texts, outermost first.
    pub texts: Vec<String>,
    /// The terminal node's kind: assertion, suite-setup, or suite-teardown.
    pub leaf_kind: NodeKind,
    /// The terminal node's declaration site.
    pub leaf_location: CodeLocation,
    /// The folded outcome: the first non-passing node outcome wins.
    pub outcome: ExecutionOutcome,
    /// The first recorded failure, if any.
    pub failure: Option<Failure>,
    /// How many attempts were made (>1 means flake retries happened).
    pub num_attempts: u32,
    /// Wall-clock time spent across all attempts.
    #[serde(with = "humantime_serde")]
    pub run_time: Duration,
}

impl SpecReport {
    /// Creates a fresh, passing report for the given leaf node.
    pub fn new(texts: Vec<String>, leaf_kind: NodeKind, leaf_location: CodeLocation) -> Self {
        Self {
            texts,
            leaf_kind,
            leaf_location,
            outcome: ExecutionOutcome::Passed,
            failure: None,
            num_attempts: 0,
            run_time: Duration::ZERO,
        }
    }

    /// The spec's full text: its node texts joined with spaces.
    pub fn full_text(&self) -> String {
        self.texts.join(" ")
    }

    /// Records an outcome, honoring first-failure-wins: once the report
    /// has left `Passed`, later outcomes are discarded.
    pub fn fold_outcome(&mut self, outcome: ExecutionOutcome, failure: Option<Failure>) {
        if self.outcome == ExecutionOutcome::Passed {
            self.outcome = outcome;
            self.failure = failure;
        }
    }
}

/// Aggregate counts derived from a suite report.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SuiteCounts {
    /// Total specs reported.
    pub total: usize,
    /// Specs that passed.
    pub passed: usize,
    /// Specs that failed, panicked, timed out, or were interrupted.
    pub failed: usize,
    /// Specs skipped by policy.
    pub skipped: usize,
    /// Specs declared pending.
    pub pending: usize,
    /// Specs that passed only after retries.
    pub flaked: usize,
}

/// The converged report for a suite run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SuiteReport {
    /// The suite description.
    pub description: String,
    /// Earliest worker start time.
    pub start_time: DateTime<Local>,
    /// Latest worker end time.
    pub end_time: DateTime<Local>,
    /// True only if every contributing worker succeeded.
    pub suite_succeeded: bool,
    /// Every spec report contributed so far.
    pub spec_reports: Vec<SpecReport>,
}

impl SuiteReport {
    /// Creates an empty, succeeding report starting now.
    pub fn new(description: impl Into<String>) -> Self {
        let now = Local::now();
        Self {
            description: description.into(),
            start_time: now,
            end_time: now,
            suite_succeeded: true,
            spec_reports: Vec::new(),
        }
    }

    /// Merges another worker's report into this one.
    ///
    /// `start_time = min`, `end_time = max`, `suite_succeeded = AND`,
    /// `spec_reports = concat` — associative and commutative over
    /// everything except spec-report order, which no consumer relies on.
    pub fn merge(mut self, other: SuiteReport) -> SuiteReport {
        self.start_time = self.start_time.min(other.start_time);
        self.end_time = self.end_time.max(other.end_time);
        self.suite_succeeded = self.suite_succeeded && other.suite_succeeded;
        self.spec_reports.extend(other.spec_reports);
        self
    }

    /// Derives aggregate counts from the spec reports.
    pub fn counts(&self) -> SuiteCounts {
        let mut counts = SuiteCounts {
            total: self.spec_reports.len(),
            ..SuiteCounts::default()
        };
        for report in &self.spec_reports {
            match report.outcome {
                ExecutionOutcome::Passed => {
                    counts.passed += 1;
                    if report.num_attempts > 1 {
                        counts.flaked += 1;
                    }
                }
                ExecutionOutcome::Skipped => counts.skipped += 1,
                ExecutionOutcome::Pending => counts.pending += 1,
                _ => counts.failed += 1,
            }
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn report(description: &str, offset_secs: i64, succeeded: bool, specs: usize) -> SuiteReport {
        let base = Local::now();
        let mut r = SuiteReport::new(description);
        r.start_time = base + TimeDelta::seconds(offset_secs);
        r.end_time = base + TimeDelta::seconds(offset_secs + 10);
        r.suite_succeeded = succeeded;
        r.spec_reports = (0..specs)
            .map(|i| {
                SpecReport::new(
                    vec![format!("spec {i}")],
                    NodeKind::Assertion,
                    CodeLocation::new("report.rs", i as u32),
                )
            })
            .collect();
        r
    }

    #[test]
    fn merge_is_order_independent() {
        let a = report("s", 0, true, 2);
        let b = report("s", -5, false, 3);
        let c = report("s", 3, true, 1);

        let abc = a.clone().merge(b.clone()).merge(c.clone());
        let cba = c.clone().merge(b.clone()).merge(a.clone());
        let bac = b.clone().merge(a.clone().merge(c.clone()));

        for merged in [&abc, &cba, &bac] {
            assert_eq!(merged.start_time, b.start_time);
            assert_eq!(merged.end_time, c.end_time);
            assert!(!merged.suite_succeeded);
            assert_eq!(merged.spec_reports.len(), 6);
        }
    }

    #[test]
    fn fold_outcome_first_failure_wins() {
        let mut report = SpecReport::new(
            vec!["spec".to_owned()],
            NodeKind::Assertion,
            CodeLocation::new("report.rs", 1),
        );
        report.fold_outcome(
            ExecutionOutcome::Failed,
            Some(Failure::new(
                "failure A",
                CodeLocation::new("report.rs", 2),
                NodeKind::Assertion,
            )),
        );
        report.fold_outcome(
            ExecutionOutcome::Panicked,
            Some(Failure::new(
                "failure B",
                CodeLocation::new("report.rs", 3),
                NodeKind::AfterEach,
            )),
        );
        assert_eq!(report.outcome, ExecutionOutcome::Failed);
        assert_eq!(report.failure.as_ref().map(|f| f.message.as_str()), Some("failure A"));
    }

    #[test]
    fn counts_classify_outcomes() {
        let mut suite = report("s", 0, true, 4);
        suite.spec_reports[0].outcome = ExecutionOutcome::Failed;
        suite.spec_reports[1].outcome = ExecutionOutcome::Skipped;
        suite.spec_reports[2].outcome = ExecutionOutcome::Pending;
        suite.spec_reports[3].num_attempts = 3;
        let counts = suite.counts();
        assert_eq!(counts.total, 4);
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.skipped, 1);
        assert_eq!(counts.pending, 1);
        assert_eq!(counts.passed, 1);
        assert_eq!(counts.flaked, 1);
    }

    #[test]
    fn reports_round_trip_through_json() {
        let mut suite = report("round-trip", 0, false, 1);
        suite.spec_reports[0].failure = Some(Failure::new(
            "boom",
            CodeLocation::new("report.rs", 9),
            NodeKind::Assertion,
        ));
        let encoded = serde_json::to_string(&suite).expect("serializes");
        let decoded: SuiteReport = serde_json::from_str(&encoded).expect("deserializes");
        assert_eq!(decoded.suite_succeeded, suite.suite_succeeded);
        assert_eq!(decoded.spec_reports.len(), 1);
        assert_eq!(
            decoded.spec_reports[0].failure,
            suite.spec_reports[0].failure
        );
    }
}
