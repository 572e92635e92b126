// Copyright (c) The spectree Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Reporting hooks driven by the suite runner.
//!
//! A [`Reporter`] observes the run as it happens: once before any spec
//! executes, once per finished spec, and once with the final suite report.
//! In a parallel run each worker drives its own reporter with its own
//! slice of the suite; the aggregated view is delivered separately to
//! worker 1 after the run converges.

use crate::report::{SpecReport, SuiteReport};
use std::sync::Mutex;
use tracing::{info, warn};

/// Observes suite execution.
///
/// Hooks take `&self`; reporters that accumulate state use interior
/// mutability since the runner may hand the reporter to worker tasks.
pub trait Reporter: Send + Sync {
    /// Called once, after ordering and filtering, before the first spec.
    fn suite_will_begin(&self, description: &str, total_specs: usize) {
        let _ = (description, total_specs);
    }

    /// Called after each spec finishes (or is skipped).
    fn spec_did_complete(&self, report: &SpecReport) {
        let _ = report;
    }

    /// Called once with this worker's completed suite report.
    fn suite_did_end(&self, report: &SuiteReport) {
        let _ = report;
    }
}

/// A reporter that ignores everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopReporter;

impl Reporter for NoopReporter {}

/// Emits the run as structured log events.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingReporter;

impl Reporter for TracingReporter {
    fn suite_will_begin(&self, description: &str, total_specs: usize) {
        info!(suite = description, total_specs, "suite starting");
    }

    fn spec_did_complete(&self, report: &SpecReport) {
        if report.outcome.is_failure() {
            warn!(
                spec = %report.full_text(),
                outcome = ?report.outcome,
                attempts = report.num_attempts,
                "spec failed"
            );
        } else {
            info!(
                spec = %report.full_text(),
                outcome = ?report.outcome,
                "spec finished"
            );
        }
    }

    fn suite_did_end(&self, report: &SuiteReport) {
        let counts = report.counts();
        info!(
            suite = report.description,
            succeeded = report.suite_succeeded,
            passed = counts.passed,
            failed = counts.failed,
            skipped = counts.skipped,
            pending = counts.pending,
            "suite finished"
        );
    }
}

/// Collects every spec report. Used by tests and by callers that want to
/// post-process the run.
#[derive(Debug, Default)]
pub struct CollectingReporter {
    specs: Mutex<Vec<SpecReport>>,
    suite: Mutex<Option<SuiteReport>>,
}

impl CollectingReporter {
    /// Creates an empty collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// The spec reports observed so far, in completion order.
    pub fn spec_reports(&self) -> Vec<SpecReport> {
        self.specs.lock().expect("collector lock poisoned").clone()
    }

    /// The final suite report, if the run has ended.
    pub fn suite_report(&self) -> Option<SuiteReport> {
        self.suite.lock().expect("collector lock poisoned").clone()
    }
}

impl Reporter for CollectingReporter {
    fn spec_did_complete(&self, report: &SpecReport) {
        self.specs
            .lock()
            .expect("collector lock poisoned")
            .push(report.clone());
    }

    fn suite_did_end(&self, report: &SuiteReport) {
        *self.suite.lock().expect("collector lock poisoned") = Some(report.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        location::CodeLocation,
        node::NodeKind,
        report::ExecutionOutcome,
    };

    #[test]
    fn collector_accumulates_in_completion_order() {
        let collector = CollectingReporter::new();
        for text in ["first", "second"] {
            let report = SpecReport::new(
                vec![text.to_owned()],
                NodeKind::Assertion,
                CodeLocation::new("reporter.rs", 1),
            );
            collector.spec_did_complete(&report);
        }
        let texts: Vec<String> = collector
            .spec_reports()
            .iter()
            .map(|r| r.full_text())
            .collect();
        assert_eq!(texts, vec!["first", "second"]);
        assert!(collector.suite_report().is_none());
    }

    #[test]
    fn collector_stores_the_suite_report() {
        let collector = CollectingReporter::new();
        let mut suite = SuiteReport::new("demo");
        suite.suite_succeeded = true;
        collector.suite_did_end(&suite);
        let stored = collector.suite_report().expect("stored");
        assert!(stored.suite_succeeded);
        assert_eq!(
            stored
                .spec_reports
                .iter()
                .filter(|r| r.outcome == ExecutionOutcome::Failed)
                .count(),
            0
        );
    }
}
