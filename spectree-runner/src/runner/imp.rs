// Copyright (c) The spectree Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The suite runner: drives one worker's share of a suite run.
//!
//! The pipeline per worker: validate config, install the interrupt
//! handler, apply the focus policy, order the specs, run suite setup
//! (synchronized across workers when declared so), execute specs, run
//! suite teardown, and post the end-of-run summary. Parallel workers pull
//! spec indices from the coordinator's shared counter; worker 1
//! additionally owns the serial group and the privileged halves of the
//! synchronized suite nodes.

use crate::{
    config::SuiteConfig,
    coordinator::client::CoordinatorClient,
    errors::{RunError, SuiteSyncError, TreeError},
    failer::Failer,
    interrupt::{InterruptCause, InterruptHandler, InterruptHandlerKind, InterruptLevel},
    node::{Node, NodeBody, NodeId, NodeKind},
    ordering::{apply_focus, apply_nested_focus_policy, order_specs},
    report::{ExecutionOutcome, Failure, SpecReport, SuiteReport},
    reporter::{Reporter, TracingReporter},
    runner::executor::{run_node, run_sync_body},
    spec::{Spec, Specs},
    time::stopwatch,
    tree::SuitePlan,
};
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};
use tracing::{debug, info, warn};

/// Runs one suite within one worker process.
pub struct SuiteRunner {
    description: String,
    specs: Specs,
    suite_setup: Option<Node>,
    suite_teardown: Option<Node>,
    config: SuiteConfig,
    reporter: Arc<dyn Reporter>,
    interrupt_kind: InterruptHandlerKind,
}

impl SuiteRunner {
    /// Creates a runner from a finished suite plan. The nested-focus
    /// policy is applied and the tree flattened here; malformed trees
    /// fail fast.
    pub fn new(
        description: impl Into<String>,
        plan: SuitePlan,
        config: SuiteConfig,
    ) -> Result<Self, TreeError> {
        let tree = apply_nested_focus_policy(plan.tree);
        let specs = crate::tree::generate_specs(&tree)?;
        Ok(Self {
            description: description.into(),
            specs,
            suite_setup: plan.suite_setup,
            suite_teardown: plan.suite_teardown,
            config,
            reporter: Arc::new(TracingReporter),
            interrupt_kind: InterruptHandlerKind::Standard,
        })
    }

    /// Replaces the default tracing reporter.
    pub fn with_reporter(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Selects the interrupt handling. Tests use the noop kind so a run
    /// never installs signal listeners.
    pub fn with_interrupt_kind(mut self, kind: InterruptHandlerKind) -> Self {
        self.interrupt_kind = kind;
        self
    }

    /// Runs this worker's share of the suite to completion and returns
    /// its suite report. The primary worker of a parallel run waits for
    /// the rest of the fleet and returns the converged report instead.
    ///
    /// Per-spec failures land in the report; `Err` is reserved for
    /// conditions fatal to the worker itself (bad config, interrupt setup,
    /// coordinator transport failure).
    pub async fn run(self) -> Result<SuiteReport, RunError> {
        self.config.validate()?;
        let interrupt = InterruptHandler::new(self.interrupt_kind, self.config.suite_timeout)?;

        let (specs, has_programmatic_focus) =
            apply_focus(self.specs, &self.description, &self.config).map_err(RunError::Config)?;
        if has_programmatic_focus {
            info!("programmatic focus detected, unfocused specs will be skipped");
        }
        let ordered = order_specs(specs, &self.config);

        let client = match (&self.config.coordinator_address, self.config.is_parallel()) {
            (Some(address), true) => {
                Some(CoordinatorClient::new(address, self.config.parallel_index))
            }
            _ => None,
        };

        let watch = stopwatch();
        let mut report = SuiteReport::new(&self.description);
        report.start_time = watch.start_time();

        let total_specs =
            ordered.parallelizable.count_without_skip() + ordered.serial.count_without_skip();
        self.reporter.suite_will_begin(&self.description, total_specs);
        if let Some(client) = &client {
            client
                .post_suite_will_begin(&self.description, total_specs)
                .await?;
        }

        let mut driver = Driver {
            config: &self.config,
            reporter: &self.reporter,
            interrupt: &interrupt,
            client: client.clone(),
            failer: Failer::new(),
            report,
            ran_before_all: HashSet::new(),
            remaining_in_ordered: HashMap::new(),
            started_ordered: HashSet::new(),
            halted: false,
        };

        if let Some(setup) = &self.suite_setup {
            driver.run_suite_setup(setup).await?;
        }

        match &client {
            None => {
                driver.count_ordered_members(&ordered.parallelizable.0);
                for spec in &ordered.parallelizable.0 {
                    driver.run_spec(spec).await?;
                }
            }
            Some(client) => {
                loop {
                    let index = client.next_counter_index().await?;
                    let Some(spec) = ordered.parallelizable.0.get(index) else {
                        break;
                    };
                    driver.run_spec(spec).await?;
                }
                if self.config.is_primary_worker() && !ordered.serial.0.is_empty() {
                    // The serial group must not overlap with anything, so
                    // it waits out the rest of the fleet.
                    client.block_until_nonprimary_workers_finished().await?;
                    driver.count_ordered_members(&ordered.serial.0);
                    for spec in &ordered.serial.0 {
                        driver.run_spec(spec).await?;
                    }
                }
            }
        }

        if let Some(teardown) = &self.suite_teardown {
            driver.run_suite_teardown(teardown).await?;
        }

        let mut report = driver.report;
        let snapshot = watch.snapshot();
        report.end_time = snapshot.end_time();
        report.suite_succeeded = suite_succeeded(&report, &self.config);

        if let Some(client) = &client {
            client.post_suite_did_end(&report).await?;
            if self.config.is_primary_worker() {
                // The caller of the primary worker gets the converged
                // end-of-run report, not just this worker's slice.
                match client.block_until_aggregated_nonprimary_report().await {
                    Ok(nonprimary) => report = report.merge(nonprimary),
                    Err(SuiteSyncError::Protocol(err)) => return Err(err.into()),
                    Err(err) => {
                        warn!(%err, "returning this worker's report only");
                    }
                }
            }
        }
        self.reporter.suite_did_end(&report);
        Ok(report)
    }
}

fn suite_succeeded(report: &SuiteReport, config: &SuiteConfig) -> bool {
    let any_failure = report
        .spec_reports
        .iter()
        .any(|spec| spec.outcome.is_failure());
    let pending_fails = config.fail_on_pending
        && report
            .spec_reports
            .iter()
            .any(|spec| spec.outcome == ExecutionOutcome::Pending);
    !any_failure && !pending_fails
}

/// Per-worker execution state shared across specs.
struct Driver<'a> {
    config: &'a SuiteConfig,
    reporter: &'a Arc<dyn Reporter>,
    interrupt: &'a InterruptHandler,
    client: Option<CoordinatorClient>,
    failer: Failer,
    report: SuiteReport,
    /// Before-all nodes that already ran in this worker.
    ran_before_all: HashSet<NodeId>,
    /// Ordered-container id -> specs of it not yet handled here.
    remaining_in_ordered: HashMap<NodeId, usize>,
    /// Ordered containers in which at least one spec actually ran.
    started_ordered: HashSet<NodeId>,
    halted: bool,
}

impl Driver<'_> {
    fn count_ordered_members(&mut self, specs: &[Spec]) {
        for spec in specs {
            if let Some(container) = spec.ordered_container() {
                *self.remaining_in_ordered.entry(container.id).or_insert(0) += 1;
            }
        }
    }

    async fn emit(&mut self, report: SpecReport) -> Result<(), RunError> {
        self.reporter.spec_did_complete(&report);
        if let Some(client) = &self.client {
            client.post_did_run(&report).await?;
        }
        self.report.spec_reports.push(report);
        Ok(())
    }

    fn interrupted(&self) -> bool {
        self.interrupt.status().interrupted()
    }

    async fn observe_external_abort(&mut self) -> Result<(), RunError> {
        if self.halted || self.client.is_none() {
            return Ok(());
        }
        let client = self.client.as_ref().expect("checked above");
        if client.should_abort().await? {
            self.interrupt.trigger(InterruptCause::ExternalAbort);
            self.halted = true;
        }
        Ok(())
    }

    async fn run_spec(&mut self, spec: &Spec) -> Result<(), RunError> {
        self.observe_external_abort().await?;

        let assertion = spec.assertion_node();
        let mut report = SpecReport::new(
            spec.nodes.texts(),
            NodeKind::Assertion,
            assertion.code_location.clone(),
        );

        if spec.skip || self.halted || self.interrupted() {
            let outcome = if spec.skip && spec.nodes.has_node_marked_pending() {
                ExecutionOutcome::Pending
            } else {
                ExecutionOutcome::Skipped
            };
            report.outcome = outcome;
            self.finish_spec(spec, report, false).await?;
            return Ok(());
        }

        if self.config.dry_run {
            report.num_attempts = 1;
            self.finish_spec(spec, report, false).await?;
            return Ok(());
        }

        let watch = stopwatch();
        let must_pass_repeatedly = spec.must_pass_repeatedly();
        let flake_budget = match spec.flake_attempts() {
            0 => self.config.flake_attempts,
            node_level => node_level,
        };

        let mut attempts = 0;
        if must_pass_repeatedly > 0 {
            // Every run must pass; the first failure is terminal.
            for _ in 0..must_pass_repeatedly {
                report = self.fresh_report(spec);
                attempts += 1;
                self.run_attempt(spec, &mut report).await;
                if report.outcome != ExecutionOutcome::Passed {
                    break;
                }
            }
        } else {
            let max_attempts = flake_budget.max(1);
            for attempt in 1..=max_attempts {
                report = self.fresh_report(spec);
                attempts = attempt;
                self.run_attempt(spec, &mut report).await;
                if report.outcome == ExecutionOutcome::Passed || self.interrupted() {
                    break;
                }
                if attempt < max_attempts {
                    debug!(
                        spec = %spec.text(),
                        attempt,
                        max_attempts,
                        "spec failed, retrying"
                    );
                }
            }
        }
        report.num_attempts = attempts;
        report.run_time = watch.snapshot().duration;

        if report.outcome.is_failure() && self.config.fail_fast {
            self.halted = true;
            if let Some(client) = &self.client {
                client.post_abort().await?;
            }
        }

        self.finish_spec(spec, report, true).await
    }

    fn fresh_report(&self, spec: &Spec) -> SpecReport {
        SpecReport::new(
            spec.nodes.texts(),
            NodeKind::Assertion,
            spec.assertion_node().code_location.clone(),
        )
    }

    /// Runs the trailing after-all cleanup and report hooks, then emits.
    async fn finish_spec(
        &mut self,
        spec: &Spec,
        mut report: SpecReport,
        ran: bool,
    ) -> Result<(), RunError> {
        if ran {
            if let Some(container) = spec.ordered_container() {
                self.started_ordered.insert(container.id);
            }
        }
        if let Some(container) = spec.ordered_container() {
            if let Some(remaining) = self.remaining_in_ordered.get_mut(&container.id) {
                *remaining = remaining.saturating_sub(1);
                if *remaining == 0 && self.started_ordered.contains(&container.id) {
                    self.run_after_alls(spec, &mut report).await;
                }
            }
        }
        self.run_report_hooks(spec, &mut report).await;
        self.emit(report).await
    }

    /// One full pass through the spec's stage pipeline, folding the first
    /// non-passing outcome into the report while still running cleanup.
    async fn run_attempt(&mut self, spec: &Spec, report: &mut SpecReport) {
        let token = self.interrupt.status().token.clone();
        let mut deepest = 0i32;

        // Setup stages, outermost first. A failure or interrupt stops
        // further setup but never the cleanup below.
        'setup: for kinds in [
            &[NodeKind::BeforeAll][..],
            &[NodeKind::BeforeEach][..],
            &[NodeKind::JustBeforeEach][..],
        ] {
            for node in spec.nodes.with_kind(kinds).iter() {
                if report.outcome != ExecutionOutcome::Passed {
                    break 'setup;
                }
                if self.interrupted() {
                    report.fold_outcome(
                        ExecutionOutcome::Interrupted,
                        Some(Failure::new(
                            "interrupted before the spec completed",
                            node.code_location.clone(),
                            node.kind,
                        )),
                    );
                    break 'setup;
                }
                if node.kind == NodeKind::BeforeAll && !self.ran_before_all.insert(node.id) {
                    continue;
                }
                deepest = deepest.max(node.nesting_level);
                let (outcome, failure) =
                    run_node(node, &self.failer, node.timeout, Some(token.clone())).await;
                report.fold_outcome(outcome, failure);
            }
        }

        if report.outcome == ExecutionOutcome::Passed && !self.interrupted() {
            let assertion = spec.assertion_node();
            deepest = deepest.max(assertion.nesting_level);
            let (outcome, failure) =
                run_node(assertion, &self.failer, spec.timeout(), Some(token.clone())).await;
            report.fold_outcome(outcome, failure);
        }

        // Cleanup always runs, innermost first, limited to the deepest
        // nesting level actually attained. Its failures fold in but never
        // displace an earlier one.
        for node in spec
            .nodes
            .with_kind(&[NodeKind::AfterEach])
            .sorted_by_descending_nesting()
            .iter()
            .filter(|node| node.nesting_level <= deepest)
        {
            if self.interrupt.status().level >= InterruptLevel::ReportOnly {
                break;
            }
            let (outcome, failure) =
                run_node(node, &self.failer, node.timeout, Some(token.clone())).await;
            report.fold_outcome(outcome, failure);
        }
    }

    async fn run_after_alls(&mut self, spec: &Spec, report: &mut SpecReport) {
        let token = self.interrupt.status().token.clone();
        for node in spec
            .nodes
            .with_kind(&[NodeKind::AfterAll])
            .sorted_by_descending_nesting()
            .iter()
        {
            if self.interrupt.status().level >= InterruptLevel::ReportOnly {
                break;
            }
            let (outcome, failure) =
                run_node(node, &self.failer, node.timeout, Some(token.clone())).await;
            report.fold_outcome(outcome, failure);
        }
    }

    /// Report hooks observe the finished report; a panicking hook fails
    /// the spec only if it was passing.
    async fn run_report_hooks(&mut self, spec: &Spec, report: &mut SpecReport) {
        for node in spec.nodes.with_kind(&[NodeKind::ReportHook]).iter() {
            let NodeBody::ReportHook(hook) = &node.body else {
                continue;
            };
            let hook = Arc::clone(hook);
            let snapshot = report.clone();
            let handle = tokio::task::spawn_blocking(move || hook(&snapshot));
            if let Err(join_error) = handle.await {
                if join_error.is_panic() {
                    let message = crate::failer::panic_message(join_error.into_panic().as_ref());
                    report.fold_outcome(
                        ExecutionOutcome::Panicked,
                        Some(Failure::new(
                            message,
                            node.code_location.clone(),
                            NodeKind::ReportHook,
                        )),
                    );
                }
            }
        }
    }

    async fn run_suite_setup(&mut self, node: &Node) -> Result<(), RunError> {
        let mut report = SpecReport::new(
            vec!["suite setup".to_owned()],
            NodeKind::SuiteSetup,
            node.code_location.clone(),
        );
        if self.config.dry_run {
            report.num_attempts = 1;
            return self.emit(report).await;
        }
        let watch = stopwatch();
        report.num_attempts = 1;

        match &node.body {
            NodeBody::Sync(_) => {
                let (outcome, failure) = run_node(node, &self.failer, node.timeout, None).await;
                report.fold_outcome(outcome, failure);
            }
            NodeBody::SynchronizedSuiteSetup {
                primary,
                all_workers,
            } => {
                if self.config.is_primary_worker() {
                    let primary = Arc::clone(primary);
                    let (outcome, failure, data) =
                        run_sync_body(node, &self.failer, move |context| primary(context)).await;
                    report.fold_outcome(outcome, failure);
                    let data = match (report.outcome, data) {
                        (ExecutionOutcome::Passed, Some(data)) => Some(data),
                        _ => None,
                    };
                    if let Some(client) = &self.client {
                        match &data {
                            Some(data) => client.post_before_suite_succeeded(data.clone()).await?,
                            None => client.post_before_suite_failed().await?,
                        }
                    }
                    if let Some(data) = data {
                        let all_workers = Arc::clone(all_workers);
                        let (outcome, failure, _) =
                            run_sync_body(node, &self.failer, move |context| {
                                all_workers(context, &data)
                            })
                            .await;
                        report.fold_outcome(outcome, failure);
                    }
                } else {
                    let client = self
                        .client
                        .as_ref()
                        .expect("nonprimary workers always have a coordinator client");
                    match client.block_until_before_suite_data().await {
                        Ok(data) => {
                            let all_workers = Arc::clone(all_workers);
                            let (outcome, failure, _) =
                                run_sync_body(node, &self.failer, move |context| {
                                    all_workers(context, &data)
                                })
                                .await;
                            report.fold_outcome(outcome, failure);
                        }
                        Err(err @ (SuiteSyncError::SetupFailed
                        | SuiteSyncError::SetupDisappeared)) => {
                            report.fold_outcome(
                                ExecutionOutcome::Failed,
                                Some(Failure::new(
                                    err.to_string(),
                                    node.code_location.clone(),
                                    NodeKind::SuiteSetup,
                                )),
                            );
                        }
                        Err(SuiteSyncError::ReportUnavailable) => {
                            unreachable!("before-suite polling never reports ReportUnavailable")
                        }
                        Err(SuiteSyncError::Protocol(err)) => return Err(err.into()),
                    }
                }
            }
            _ => {}
        }

        report.run_time = watch.snapshot().duration;
        if report.outcome.is_failure() {
            // Specs cannot run without their suite setup; they are
            // reported as skipped. Teardown still runs.
            self.halted = true;
        }
        self.emit(report).await
    }

    async fn run_suite_teardown(&mut self, node: &Node) -> Result<(), RunError> {
        let mut report = SpecReport::new(
            vec!["suite teardown".to_owned()],
            NodeKind::SuiteTeardown,
            node.code_location.clone(),
        );
        if self.config.dry_run {
            report.num_attempts = 1;
            return self.emit(report).await;
        }
        if self.interrupt.status().level >= InterruptLevel::BailOut {
            report.outcome = ExecutionOutcome::Skipped;
            return self.emit(report).await;
        }
        let watch = stopwatch();
        report.num_attempts = 1;

        match &node.body {
            NodeBody::Sync(_) => {
                let (outcome, failure) = run_node(node, &self.failer, node.timeout, None).await;
                report.fold_outcome(outcome, failure);
            }
            NodeBody::SynchronizedSuiteTeardown {
                all_workers,
                primary,
            } => {
                let all_workers = Arc::clone(all_workers);
                let (outcome, failure, _) =
                    run_sync_body(node, &self.failer, move |context| all_workers(context)).await;
                report.fold_outcome(outcome, failure);

                if self.config.is_primary_worker() {
                    if let Some(client) = &self.client {
                        client.block_until_nonprimary_workers_finished().await?;
                    }
                    let primary = Arc::clone(primary);
                    let (outcome, failure, _) =
                        run_sync_body(node, &self.failer, move |context| primary(context)).await;
                    report.fold_outcome(outcome, failure);
                }
            }
            _ => {}
        }

        report.run_time = watch.snapshot().duration;
        self.emit(report).await
    }
}
