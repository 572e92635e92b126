// Copyright (c) The spectree Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Transport-independent coordinator state machine.
//!
//! Every barrier and counter the coordinator offers is implemented here,
//! behind one mutex; the TCP server is a thin shell around
//! [`ServerHandler::handle`]. Liveness probes are registered by whatever
//! orchestrates the worker processes — the handler itself only asks
//! "is worker K still alive" when deciding whether a blocked poll can
//! ever resolve.

use crate::{
    coordinator::protocol::{BeforeSuiteState, Request, Response, ResponsePayload, Status},
    report::{SpecReport, SuiteReport},
    reporter::Reporter,
};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Tells the coordinator whether a given worker process is still alive.
pub type AliveProbe = Box<dyn Fn() -> bool + Send + Sync>;

#[derive(Default)]
struct HandlerState {
    begin_count: usize,
    description: String,
    total_specs: usize,
    held_reports: Vec<SpecReport>,
    before_suite: Option<BeforeSuiteState>,
    end_reports: HashMap<usize, SuiteReport>,
    counter: usize,
    abort: bool,
    alive_probes: HashMap<usize, AliveProbe>,
}

impl HandlerState {
    // Workers without a registered probe are presumed alive; a worker
    // that cannot be probed must not be declared gone.
    fn worker_is_alive(&self, worker: usize) -> bool {
        self.alive_probes.get(&worker).is_none_or(|probe| probe())
    }

    fn before_suite(&self) -> BeforeSuiteState {
        self.before_suite
            .clone()
            .unwrap_or(BeforeSuiteState::Pending)
    }
}

/// The coordinator's shared state machine.
pub struct ServerHandler {
    parallel_total: usize,
    reporter: Arc<dyn Reporter>,
    state: Mutex<HandlerState>,
    done: CancellationToken,
}

impl ServerHandler {
    /// Creates a handler for a run of `parallel_total` workers, with the
    /// aggregate report sink the begin/end barriers forward into.
    pub fn new(parallel_total: usize, reporter: Arc<dyn Reporter>) -> Self {
        Self {
            parallel_total,
            reporter,
            state: Mutex::new(HandlerState::default()),
            done: CancellationToken::new(),
        }
    }

    /// Registers a liveness probe for a worker. Without one the worker is
    /// presumed alive forever, so disappearance detection requires the
    /// orchestrator to register probes.
    pub fn register_alive_probe(&self, worker: usize, probe: AliveProbe) {
        self.state
            .lock()
            .expect("coordinator state lock poisoned")
            .alive_probes
            .insert(worker, probe);
    }

    /// Cancelled once every worker has posted its end-of-run summary.
    pub fn done(&self) -> CancellationToken {
        self.done.clone()
    }

    /// Handles one request.
    pub fn handle(&self, request: Request) -> Response {
        match request {
            Request::SuiteWillBegin {
                worker,
                description,
                total_specs,
            } => self.suite_will_begin(worker, description, total_specs),
            Request::DidRun { report } => self.did_run(report),
            Request::SuiteDidEnd { worker, report } => self.suite_did_end(worker, report),
            Request::PostBeforeSuiteState { state } => self.post_before_suite_state(state),
            Request::BeforeSuiteState => self.before_suite_state(),
            Request::AfterSuiteState => self.after_suite_state(),
            Request::AggregatedNonprimaryReport => self.aggregated_nonprimary_report(),
            Request::Counter => self.counter(),
            Request::Up => Response::ok(),
            Request::PostAbort => self.post_abort(),
            Request::ShouldAbort => self.should_abort(),
        }
    }

    /// Begin barrier: the begin event is forwarded to the report sink only
    /// once every worker has checked in, and spec reports that raced ahead
    /// of the barrier are replayed right after it.
    fn suite_will_begin(&self, worker: usize, description: String, total_specs: usize) -> Response {
        let mut state = self.state.lock().expect("coordinator state lock poisoned");
        if worker < 1 || worker > self.parallel_total || state.begin_count >= self.parallel_total {
            return Response::status(Status::BadRequest);
        }
        state.begin_count += 1;
        if state.begin_count == 1 {
            state.description = description;
            state.total_specs = total_specs;
        }
        debug!(
            worker,
            begin_count = state.begin_count,
            total = self.parallel_total,
            "worker checked in"
        );
        if state.begin_count == self.parallel_total {
            self.reporter
                .suite_will_begin(&state.description, state.total_specs);
            for report in state.held_reports.drain(..) {
                self.reporter.spec_did_complete(&report);
            }
        }
        Response::ok()
    }

    fn did_run(&self, report: SpecReport) -> Response {
        let mut state = self.state.lock().expect("coordinator state lock poisoned");
        if state.begin_count < self.parallel_total {
            state.held_reports.push(report);
        } else {
            self.reporter.spec_did_complete(&report);
        }
        Response::ok()
    }

    fn suite_did_end(&self, worker: usize, report: SuiteReport) -> Response {
        let mut state = self.state.lock().expect("coordinator state lock poisoned");
        if worker < 1 || worker > self.parallel_total || state.end_reports.contains_key(&worker) {
            return Response::status(Status::BadRequest);
        }
        state.end_reports.insert(worker, report);
        if state.end_reports.len() == self.parallel_total {
            let merged = merge_reports(state.end_reports.values().cloned());
            if let Some(merged) = merged {
                self.reporter.suite_did_end(&merged);
            }
            self.done.cancel();
        }
        Response::ok()
    }

    fn post_before_suite_state(&self, posted: BeforeSuiteState) -> Response {
        let mut state = self.state.lock().expect("coordinator state lock poisoned");
        let resolvable = matches!(
            posted,
            BeforeSuiteState::Passed { .. } | BeforeSuiteState::Failed
        );
        // One-way transition out of Pending only.
        if !resolvable || state.before_suite.is_some() {
            return Response::status(Status::BadRequest);
        }
        state.before_suite = Some(posted);
        Response::ok()
    }

    fn before_suite_state(&self) -> Response {
        let mut state = self.state.lock().expect("coordinator state lock poisoned");
        match state.before_suite() {
            BeforeSuiteState::Pending => {
                if state.worker_is_alive(1) {
                    Response::status(Status::TooEarly)
                } else {
                    state.before_suite = Some(BeforeSuiteState::Disappeared);
                    Response::status(Status::Gone)
                }
            }
            BeforeSuiteState::Disappeared => Response::status(Status::Gone),
            BeforeSuiteState::Failed => Response::status(Status::FailedDependency),
            passed @ BeforeSuiteState::Passed { .. } => {
                Response::with_payload(ResponsePayload::BeforeSuite { state: passed })
            }
        }
    }

    /// A nonprimary worker counts as finished once it has posted its
    /// summary; a dead one can never run anything more, so it counts too.
    fn after_suite_state(&self) -> Response {
        let state = self.state.lock().expect("coordinator state lock poisoned");
        let can_run = (2..=self.parallel_total)
            .all(|worker| state.end_reports.contains_key(&worker) || !state.worker_is_alive(worker));
        Response::with_payload(ResponsePayload::AfterSuite { can_run })
    }

    fn aggregated_nonprimary_report(&self) -> Response {
        let state = self.state.lock().expect("coordinator state lock poisoned");
        for worker in 2..=self.parallel_total {
            if !state.end_reports.contains_key(&worker) {
                return if state.worker_is_alive(worker) {
                    Response::status(Status::TooEarly)
                } else {
                    Response::status(Status::Gone)
                };
            }
        }
        let merged = merge_reports(
            (2..=self.parallel_total).filter_map(|worker| state.end_reports.get(&worker).cloned()),
        );
        match merged {
            Some(report) => Response::with_payload(ResponsePayload::Aggregated { report }),
            // parallel_total == 1: there are no nonprimary workers.
            None => Response::status(Status::BadRequest),
        }
    }

    fn counter(&self) -> Response {
        let mut state = self.state.lock().expect("coordinator state lock poisoned");
        let index = state.counter;
        state.counter += 1;
        Response::with_payload(ResponsePayload::Counter { index })
    }

    fn post_abort(&self) -> Response {
        self.state
            .lock()
            .expect("coordinator state lock poisoned")
            .abort = true;
        Response::ok()
    }

    fn should_abort(&self) -> Response {
        let abort = self
            .state
            .lock()
            .expect("coordinator state lock poisoned")
            .abort;
        Response::with_payload(ResponsePayload::Abort { abort })
    }
}

fn merge_reports(reports: impl IntoIterator<Item = SuiteReport>) -> Option<SuiteReport> {
    reports.into_iter().reduce(SuiteReport::merge)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        location::CodeLocation,
        node::NodeKind,
        reporter::CollectingReporter,
    };
    use pretty_assertions::assert_eq;

    fn spec_report(text: &str) -> SpecReport {
        SpecReport::new(
            vec![text.to_owned()],
            NodeKind::Assertion,
            CodeLocation::new("handler.rs", 1),
        )
    }

    fn begin(handler: &ServerHandler, worker: usize) -> Response {
        handler.handle(Request::SuiteWillBegin {
            worker,
            description: "demo".to_owned(),
            total_specs: 4,
        })
    }

    #[test]
    fn begin_barrier_holds_reports_until_all_workers_check_in() {
        let reporter = Arc::new(CollectingReporter::new());
        let handler = ServerHandler::new(3, Arc::clone(&reporter) as Arc<dyn Reporter>);

        assert_eq!(begin(&handler, 1).status, Status::Ok);
        assert_eq!(begin(&handler, 2).status, Status::Ok);
        handler.handle(Request::DidRun {
            report: spec_report("raced ahead"),
        });
        assert!(reporter.spec_reports().is_empty(), "report forwarded early");

        assert_eq!(begin(&handler, 3).status, Status::Ok);
        let texts: Vec<String> = reporter
            .spec_reports()
            .iter()
            .map(|r| r.full_text())
            .collect();
        assert_eq!(texts, vec!["raced ahead"]);

        // Post-barrier reports flow straight through.
        handler.handle(Request::DidRun {
            report: spec_report("after barrier"),
        });
        assert_eq!(reporter.spec_reports().len(), 2);
    }

    #[test]
    fn before_suite_state_distinguishes_early_gone_and_failed() {
        let handler = ServerHandler::new(2, Arc::new(CollectingReporter::new()));
        assert_eq!(
            handler.handle(Request::BeforeSuiteState).status,
            Status::TooEarly
        );

        handler.register_alive_probe(1, Box::new(|| false));
        assert_eq!(
            handler.handle(Request::BeforeSuiteState).status,
            Status::Gone
        );
        // Disappearance is sticky even if the probe would flip back.
        handler.register_alive_probe(1, Box::new(|| true));
        assert_eq!(
            handler.handle(Request::BeforeSuiteState).status,
            Status::Gone
        );

        let handler = ServerHandler::new(2, Arc::new(CollectingReporter::new()));
        handler.handle(Request::PostBeforeSuiteState {
            state: BeforeSuiteState::Failed,
        });
        assert_eq!(
            handler.handle(Request::BeforeSuiteState).status,
            Status::FailedDependency
        );
    }

    #[test]
    fn before_suite_state_returns_the_posted_data() {
        let handler = ServerHandler::new(2, Arc::new(CollectingReporter::new()));
        assert_eq!(
            handler
                .handle(Request::PostBeforeSuiteState {
                    state: BeforeSuiteState::Passed { data: vec![7, 8] },
                })
                .status,
            Status::Ok
        );
        let response = handler.handle(Request::BeforeSuiteState);
        assert_eq!(response.status, Status::Ok);
        match response.payload {
            Some(ResponsePayload::BeforeSuite {
                state: BeforeSuiteState::Passed { data },
            }) => assert_eq!(data, vec![7, 8]),
            other => panic!("unexpected payload: {other:?}"),
        }

        // Resolved state cannot be overwritten.
        assert_eq!(
            handler
                .handle(Request::PostBeforeSuiteState {
                    state: BeforeSuiteState::Failed,
                })
                .status,
            Status::BadRequest
        );
    }

    #[test]
    fn counter_hands_out_gap_free_indices() {
        let handler = ServerHandler::new(1, Arc::new(CollectingReporter::new()));
        let mut seen = Vec::new();
        for _ in 0..5 {
            match handler.handle(Request::Counter).payload {
                Some(ResponsePayload::Counter { index }) => seen.push(index),
                other => panic!("unexpected payload: {other:?}"),
            }
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn after_suite_state_waits_for_nonprimary_workers() {
        let handler = ServerHandler::new(3, Arc::new(CollectingReporter::new()));
        let can_run = |handler: &ServerHandler| match handler.handle(Request::AfterSuiteState).payload
        {
            Some(ResponsePayload::AfterSuite { can_run }) => can_run,
            other => panic!("unexpected payload: {other:?}"),
        };
        assert!(!can_run(&handler));

        handler.handle(Request::SuiteDidEnd {
            worker: 2,
            report: SuiteReport::new("demo"),
        });
        assert!(!can_run(&handler));

        // A dead worker counts as finished.
        handler.register_alive_probe(3, Box::new(|| false));
        assert!(can_run(&handler));
    }

    #[test]
    fn end_barrier_merges_and_signals_completion() {
        let reporter = Arc::new(CollectingReporter::new());
        let handler = ServerHandler::new(2, Arc::clone(&reporter) as Arc<dyn Reporter>);
        let done = handler.done();

        let mut failing = SuiteReport::new("demo");
        failing.suite_succeeded = false;
        failing.spec_reports.push(spec_report("a"));

        handler.handle(Request::SuiteDidEnd {
            worker: 1,
            report: SuiteReport::new("demo"),
        });
        assert!(!done.is_cancelled());
        handler.handle(Request::SuiteDidEnd {
            worker: 2,
            report: failing,
        });
        assert!(done.is_cancelled());

        let merged = reporter.suite_report().expect("forwarded");
        assert!(!merged.suite_succeeded);
        assert_eq!(merged.spec_reports.len(), 1);

        // Duplicate end posts are rejected.
        assert_eq!(
            handler
                .handle(Request::SuiteDidEnd {
                    worker: 2,
                    report: SuiteReport::new("demo"),
                })
                .status,
            Status::BadRequest
        );
    }

    #[test]
    fn abort_flag_is_broadcast() {
        let handler = ServerHandler::new(2, Arc::new(CollectingReporter::new()));
        let abort = |handler: &ServerHandler| match handler.handle(Request::ShouldAbort).payload {
            Some(ResponsePayload::Abort { abort }) => abort,
            other => panic!("unexpected payload: {other:?}"),
        };
        assert!(!abort(&handler));
        handler.handle(Request::PostAbort);
        assert!(abort(&handler));
    }
}
