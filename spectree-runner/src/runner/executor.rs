// Copyright (c) The spectree Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The node runner: executes one node body and classifies what happened.
//!
//! Synchronous bodies run on the blocking pool; a panic surfaces through
//! the join error and is classified as an explicit assertion failure (the
//! failer's marker payload) or a genuine panic. Asynchronous bodies are
//! raced against a timer and the interrupt token; the race is decided by
//! an [`OutcomeCell`] that is written at most once, so a panic landing
//! after the timer has fired cannot overwrite `TimedOut`.
//!
//! A timed-out body is abandoned, never cancelled: the runner stops
//! waiting but the body may keep running in the background. The interrupt
//! handler mitigates truly stuck bodies at the process level.

use crate::{
    failer::{AssertionPanic, Failer, SpecContext, panic_message},
    node::{Node, NodeBody},
    report::{ExecutionOutcome, Failure},
};
use std::{
    any::Any,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Wait budget for asynchronous bodies that declare no timeout of their
/// own.
pub const DEFAULT_ASYNC_NODE_TIMEOUT: Duration = Duration::from_secs(60);

/// Write-at-most-once slot deciding the async-body race.
#[derive(Debug, Default)]
pub(crate) struct OutcomeCell {
    slot: Mutex<Option<(ExecutionOutcome, Option<Failure>)>>,
    notify: Notify,
}

impl OutcomeCell {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Records the race winner. Returns false if the race was already
    /// decided; the value is discarded in that case.
    pub(crate) fn try_set(&self, outcome: ExecutionOutcome, failure: Option<Failure>) -> bool {
        let mut slot = self.slot.lock().expect("outcome cell lock poisoned");
        if slot.is_some() {
            return false;
        }
        *slot = Some((outcome, failure));
        drop(slot);
        self.notify.notify_waiters();
        true
    }

    /// Waits until the race is decided.
    pub(crate) async fn wait(&self) -> (ExecutionOutcome, Option<Failure>) {
        loop {
            // Register interest before checking, otherwise a try_set
            // between the check and the await would be lost.
            let notified = self.notify.notified();
            if let Some(decided) = self
                .slot
                .lock()
                .expect("outcome cell lock poisoned")
                .clone()
            {
                return decided;
            }
            notified.await;
        }
    }
}

/// Completion handle for asynchronous node bodies. Signaling marks the
/// body complete; dropping without signaling leaves the runner waiting
/// for the node's timeout.
#[derive(Clone, Debug)]
pub struct Done {
    cell: Arc<OutcomeCell>,
}

impl Done {
    pub(crate) fn new(cell: Arc<OutcomeCell>) -> Self {
        Self { cell }
    }

    /// Marks the body complete. Later signals are ignored.
    pub fn signal(&self) {
        self.cell.try_set(ExecutionOutcome::Passed, None);
    }
}

/// Classifies a recovered panic payload: the failer marker means an
/// explicit assertion failure was already recorded, anything else is a
/// genuine panic located at the owning node.
fn classify_panic(
    payload: Box<dyn Any + Send>,
    failer: &Failer,
    node: &Node,
) -> (ExecutionOutcome, Option<Failure>) {
    if payload.downcast_ref::<AssertionPanic>().is_some() {
        failer.drain()
    } else {
        // Clear any failure recorded before the panic; the panic decided
        // this node and the failer must not leak into the next one.
        let _ = failer.drain();
        (
            ExecutionOutcome::Panicked,
            Some(Failure::new(
                panic_message(payload.as_ref()),
                node.code_location.clone(),
                node.kind,
            )),
        )
    }
}

/// Runs a synchronous body to completion on the blocking pool, returning
/// its value when it neither panicked nor recorded a failure.
pub(crate) async fn run_sync_body<T, F>(
    node: &Node,
    failer: &Failer,
    body: F,
) -> (ExecutionOutcome, Option<Failure>, Option<T>)
where
    T: Send + 'static,
    F: FnOnce(&SpecContext) -> T + Send + 'static,
{
    let context = SpecContext::new(failer.clone(), node.kind);
    let handle = tokio::task::spawn_blocking(move || body(&context));
    match handle.await {
        Ok(value) => {
            let (outcome, failure) = failer.drain();
            (outcome, failure, Some(value))
        }
        Err(join_error) => {
            let payload = join_error.into_panic();
            let (outcome, failure) = classify_panic(payload, failer, node);
            (outcome, failure, None)
        }
    }
}

/// Runs an asynchronous body, racing completion against the timeout and
/// the interrupt token.
async fn run_async_body(
    node: &Node,
    failer: &Failer,
    timeout: Duration,
    interrupt: Option<CancellationToken>,
) -> (ExecutionOutcome, Option<Failure>) {
    let NodeBody::Async(body) = &node.body else {
        unreachable!("run_async_body is only called for async bodies");
    };
    let cell = Arc::new(OutcomeCell::new());
    let done = Done::new(Arc::clone(&cell));
    let context = SpecContext::new(failer.clone(), node.kind);

    let body = Arc::clone(body);
    let handle = tokio::task::spawn_blocking(move || body(&context, done));

    // Watch the body itself: its return is not a completion (only the
    // Done handle is), but its panic decides the race.
    {
        let cell = Arc::clone(&cell);
        let failer = failer.clone();
        let node = node.clone();
        tokio::spawn(async move {
            if let Err(join_error) = handle.await {
                if join_error.is_panic() {
                    let (outcome, failure) =
                        classify_panic(join_error.into_panic(), &failer, &node);
                    cell.try_set(outcome, failure);
                }
            }
        });
    }

    let timer = {
        let cell = Arc::clone(&cell);
        let node = node.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            cell.try_set(
                ExecutionOutcome::TimedOut,
                Some(Failure::new(
                    format!("timed out after {timeout:?}"),
                    node.code_location.clone(),
                    node.kind,
                )),
            );
        })
    };

    let watcher = interrupt.map(|token| {
        let cell = Arc::clone(&cell);
        let node = node.clone();
        tokio::spawn(async move {
            token.cancelled().await;
            cell.try_set(
                ExecutionOutcome::Interrupted,
                Some(Failure::new(
                    "interrupted while waiting for the body to complete",
                    node.code_location.clone(),
                    node.kind,
                )),
            );
        })
    });

    let (outcome, failure) = cell.wait().await;
    timer.abort();
    if let Some(watcher) = watcher {
        watcher.abort();
    }

    // A completion signal still defers to failures the body recorded.
    if outcome == ExecutionOutcome::Passed {
        failer.drain()
    } else {
        let _ = failer.drain();
        (outcome, failure)
    }
}

/// Runs one node body and returns its outcome.
pub(crate) async fn run_node(
    node: &Node,
    failer: &Failer,
    timeout: Option<Duration>,
    interrupt: Option<CancellationToken>,
) -> (ExecutionOutcome, Option<Failure>) {
    match &node.body {
        NodeBody::None => (ExecutionOutcome::Passed, None),
        NodeBody::Sync(body) => {
            let body = Arc::clone(body);
            let (outcome, failure, _) =
                run_sync_body(node, failer, move |context| body(context)).await;
            (outcome, failure)
        }
        NodeBody::Async(_) => {
            let timeout = timeout
                .or(node.timeout)
                .unwrap_or(DEFAULT_ASYNC_NODE_TIMEOUT);
            run_async_body(node, failer, timeout, interrupt).await
        }
        // Suite-level bodies are driven by the suite runner, which knows
        // which half runs on which worker.
        NodeBody::SynchronizedSuiteSetup { .. }
        | NodeBody::SynchronizedSuiteTeardown { .. }
        | NodeBody::ReportHook(_) => (ExecutionOutcome::Passed, None),
    }
}
