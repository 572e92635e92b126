// Copyright (c) The spectree Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Explicit assertion failures.
//!
//! Node bodies receive a [`SpecContext`]; calling [`SpecContext::fail`]
//! records a failure on the shared [`Failer`] and unwinds with a private
//! marker payload. The node runner catches the unwind, recognizes the
//! marker, and reports `Failed` rather than `Panicked`. The first recorded
//! failure wins; later ones in the same node run are discarded.

use crate::{
    location::CodeLocation,
    node::NodeKind,
    report::{ExecutionOutcome, Failure},
};
use std::sync::{Arc, Mutex};

/// Marker payload distinguishing an explicit failure unwind from a raw
/// panic. Private to the crate: only the node runner looks for it.
pub(crate) struct AssertionPanic;

/// Renders a panic payload for failure messages. Panics raised through
/// `panic!` carry a `&str` or `String`; anything else is opaque.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "panicked with a non-string payload".to_owned()
    }
}

/// Shared first-failure-wins failure slot for one node run.
#[derive(Clone, Debug, Default)]
pub struct Failer {
    inner: Arc<Mutex<Option<Failure>>>,
}

impl Failer {
    /// Creates an empty failer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a failure if none has been recorded yet.
    pub fn fail(&self, failure: Failure) {
        let mut slot = self.inner.lock().expect("failer lock poisoned");
        if slot.is_none() {
            *slot = Some(failure);
        }
    }

    /// Takes the recorded state, resetting the failer for the next node.
    pub fn drain(&self) -> (ExecutionOutcome, Option<Failure>) {
        let mut slot = self.inner.lock().expect("failer lock poisoned");
        match slot.take() {
            Some(failure) => (ExecutionOutcome::Failed, Some(failure)),
            None => (ExecutionOutcome::Passed, None),
        }
    }
}

/// Handle passed to every node body.
#[derive(Clone, Debug)]
pub struct SpecContext {
    failer: Failer,
    node_kind: NodeKind,
}

impl SpecContext {
    pub(crate) fn new(failer: Failer, node_kind: NodeKind) -> Self {
        Self { failer, node_kind }
    }

    /// Fails the current node and unwinds. The call site is captured as
    /// the failure location.
    #[track_caller]
    pub fn fail(&self, message: impl Into<String>) -> ! {
        self.record_failure(message);
        std::panic::panic_any(AssertionPanic);
    }

    /// Fails the current node if `condition` is false.
    #[track_caller]
    pub fn expect(&self, condition: bool, message: impl Into<String>) {
        if !condition {
            self.record_failure(message);
            std::panic::panic_any(AssertionPanic);
        }
    }

    /// Records a failure without unwinding; the node keeps running but
    /// its outcome is already decided.
    #[track_caller]
    pub fn record_failure(&self, message: impl Into<String>) {
        self.failer.fail(Failure::new(
            message,
            CodeLocation::caller(),
            self.node_kind,
        ));
    }

    pub(crate) fn failer(&self) -> &Failer {
        &self.failer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_of_empty_failer_is_passed() {
        let failer = Failer::new();
        let (outcome, failure) = failer.drain();
        assert_eq!(outcome, ExecutionOutcome::Passed);
        assert!(failure.is_none());
    }

    #[test]
    fn first_failure_wins() {
        let failer = Failer::new();
        failer.fail(Failure::new(
            "first",
            CodeLocation::new("failer.rs", 1),
            NodeKind::Assertion,
        ));
        failer.fail(Failure::new(
            "second",
            CodeLocation::new("failer.rs", 2),
            NodeKind::AfterEach,
        ));
        let (outcome, failure) = failer.drain();
        assert_eq!(outcome, ExecutionOutcome::Failed);
        assert_eq!(failure.map(|f| f.message), Some("first".to_owned()));
    }

    #[test]
    fn drain_resets_state() {
        let failer = Failer::new();
        failer.fail(Failure::new(
            "boom",
            CodeLocation::new("failer.rs", 3),
            NodeKind::Assertion,
        ));
        let _ = failer.drain();
        let (outcome, _) = failer.drain();
        assert_eq!(outcome, ExecutionOutcome::Passed);
    }
}
