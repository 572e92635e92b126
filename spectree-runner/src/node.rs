// Copyright (c) The spectree Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Nodes: the atomic units of suite behavior.
//!
//! A [`Node`] is either a container, a setup/cleanup step, an assertion, a
//! suite-level setup/teardown, or a report hook. Nodes are immutable once
//! constructed and identified only by their [`NodeId`] — never by pointer
//! identity — so they can be copied freely and re-sorted deterministically.

use crate::{
    failer::SpecContext,
    location::CodeLocation,
    report::SpecReport,
    runner::Done,
};
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    ops::Deref,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

/// Unique identity of a node within one suite.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Hands out monotonically increasing [`NodeId`]s.
///
/// Owned by the tree-building context and passed down explicitly; there is
/// no process-global registry.
#[derive(Debug, Default)]
pub struct NodeIdCounter {
    next: AtomicU64,
}

impl NodeIdCounter {
    /// Creates a counter starting at id 1.
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Returns the next unique id.
    pub fn next_id(&self) -> NodeId {
        NodeId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

/// The declared kind of a node.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeKind {
    /// A grouping node. Never executed itself.
    Container,
    /// Setup that runs before every descendant assertion, outer to inner.
    BeforeEach,
    /// Setup that runs after all before-eaches, just before the assertion.
    JustBeforeEach,
    /// Cleanup that runs after the assertion, inner to outer, always.
    AfterEach,
    /// One-time setup for an ordered container, run with its first spec.
    BeforeAll,
    /// One-time cleanup for an ordered container, run with its last spec.
    AfterAll,
    /// The terminal assertion body of a spec.
    Assertion,
    /// One-time suite setup, synchronized across workers.
    SuiteSetup,
    /// One-time suite teardown, synchronized across workers.
    SuiteTeardown,
    /// A hook invoked with the finished spec report.
    ReportHook,
}

impl NodeKind {
    /// Kinds that form the spec skeleton: containers and assertions.
    pub const CONTAINER_AND_ASSERTION: &'static [NodeKind] =
        &[NodeKind::Container, NodeKind::Assertion];

    /// True for container and assertion nodes.
    pub fn is_container_or_assertion(self) -> bool {
        matches!(self, NodeKind::Container | NodeKind::Assertion)
    }

    /// True for the per-spec setup/cleanup kinds.
    pub fn is_setup(self) -> bool {
        matches!(
            self,
            NodeKind::BeforeEach
                | NodeKind::JustBeforeEach
                | NodeKind::AfterEach
                | NodeKind::BeforeAll
                | NodeKind::AfterAll
        )
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeKind::Container => "container",
            NodeKind::BeforeEach => "before-each",
            NodeKind::JustBeforeEach => "just-before-each",
            NodeKind::AfterEach => "after-each",
            NodeKind::BeforeAll => "before-all",
            NodeKind::AfterAll => "after-all",
            NodeKind::Assertion => "assertion",
            NodeKind::SuiteSetup => "suite-setup",
            NodeKind::SuiteTeardown => "suite-teardown",
            NodeKind::ReportHook => "report-hook",
        };
        f.write_str(s)
    }
}

/// A synchronous node body.
pub type SyncBody = Arc<dyn Fn(&SpecContext) + Send + Sync>;

/// An asynchronous node body. The body signals completion through the
/// [`Done`] handle; returning without signaling keeps the runner waiting
/// until the node's timeout fires.
pub type AsyncBody = Arc<dyn Fn(&SpecContext, Done) + Send + Sync>;

/// The primary worker's half of a synchronized suite setup. Its returned
/// bytes are distributed to every worker.
pub type SuiteSetupPrimaryBody = Arc<dyn Fn(&SpecContext) -> Vec<u8> + Send + Sync>;

/// A body that receives the suite-setup data on every worker.
pub type SuiteDataBody = Arc<dyn Fn(&SpecContext, &[u8]) + Send + Sync>;

/// A report hook body.
pub type ReportHookBody = Arc<dyn Fn(&SpecReport) + Send + Sync>;

/// The body shapes a node can carry. The shapes are mutually exclusive,
/// so they are enum variants switched on by tag — a node is never more
/// than one shape at once.
#[derive(Clone)]
pub enum NodeBody {
    /// No body: containers and pending placeholders.
    None,
    /// A synchronous body; runs to completion or panics.
    Sync(SyncBody),
    /// An asynchronous body raced against the node timeout.
    Async(AsyncBody),
    /// A synchronized suite-setup pair.
    SynchronizedSuiteSetup {
        /// Runs on the primary worker only.
        primary: SuiteSetupPrimaryBody,
        /// Runs on every worker with the primary's data.
        all_workers: SuiteDataBody,
    },
    /// A synchronized suite-teardown pair.
    SynchronizedSuiteTeardown {
        /// Runs on every worker.
        all_workers: SyncBody,
        /// Runs on the primary worker after all others have finished.
        primary: SyncBody,
    },
    /// A hook receiving the finished spec report.
    ReportHook(ReportHookBody),
}

impl fmt::Debug for NodeBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            NodeBody::None => "None",
            NodeBody::Sync(_) => "Sync",
            NodeBody::Async(_) => "Async",
            NodeBody::SynchronizedSuiteSetup { .. } => "SynchronizedSuiteSetup",
            NodeBody::SynchronizedSuiteTeardown { .. } => "SynchronizedSuiteTeardown",
            NodeBody::ReportHook(_) => "ReportHook",
        };
        f.write_str(tag)
    }
}

/// Optional markers applied to a node at declaration time.
#[derive(Clone, Debug, Default)]
pub struct Decorations {
    /// Focus this node: when any node is focused, unfocused specs are
    /// skipped.
    pub focus: bool,
    /// Mark the node pending: its specs are reported but never run.
    pub pending: bool,
    /// Exclude this node's specs from parallel distribution.
    pub serial: bool,
    /// Container only: run member specs in source order, contiguously.
    pub ordered: bool,
    /// Retry the spec this many times before reporting failure.
    pub flake_attempts: u32,
    /// Run the spec this many times and require every run to pass.
    pub must_pass_repeatedly: u32,
    /// Budget for asynchronous bodies.
    pub timeout: Option<Duration>,
    /// Labels for label filtering.
    pub labels: Vec<String>,
}

impl Decorations {
    /// No decorations.
    pub fn none() -> Self {
        Self::default()
    }

    /// Marks the node focused.
    pub fn focus(mut self) -> Self {
        self.focus = true;
        self
    }

    /// Marks the node pending.
    pub fn pending(mut self) -> Self {
        self.pending = true;
        self
    }

    /// Marks the node serial.
    pub fn serial(mut self) -> Self {
        self.serial = true;
        self
    }

    /// Marks a container ordered.
    pub fn ordered(mut self) -> Self {
        self.ordered = true;
        self
    }

    /// Sets the flake-retry budget.
    pub fn flake_attempts(mut self, attempts: u32) -> Self {
        self.flake_attempts = attempts;
        self
    }

    /// Requires the spec to pass `count` consecutive times.
    pub fn must_pass_repeatedly(mut self, count: u32) -> Self {
        self.must_pass_repeatedly = count;
        self
    }

    /// Sets the async-body timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Adds a label.
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.labels.push(label.into());
        self
    }
}

/// One node of the spec tree.
#[derive(Clone, Debug)]
pub struct Node {
    /// Unique id, the only identity used for tree operations.
    pub id: NodeId,
    /// Declared kind.
    pub kind: NodeKind,
    /// Human-readable text (containers and assertions).
    pub text: String,
    /// The body to execute.
    pub body: NodeBody,
    /// Where the node was declared.
    pub code_location: CodeLocation,
    /// Depth in the container tree; assigned during spec generation.
    pub nesting_level: i32,
    /// Focus marker.
    pub marked_focus: bool,
    /// Pending marker.
    pub marked_pending: bool,
    /// Serial marker.
    pub marked_serial: bool,
    /// Ordered-container marker.
    pub marked_ordered: bool,
    /// Per-node flake-retry budget; 0 defers to the suite default.
    pub flake_attempts: u32,
    /// Repeat-until-proven count; 0 disables.
    pub must_pass_repeatedly: u32,
    /// Async-body timeout; `None` means the runner default.
    pub timeout: Option<Duration>,
    /// Labels for label filtering.
    pub labels: Vec<String>,
}

impl Node {
    /// Creates a node from its parts. Decoration validity is checked by
    /// the tree builder, which knows the node's position in the tree.
    pub fn new(
        id: NodeId,
        kind: NodeKind,
        text: impl Into<String>,
        body: NodeBody,
        code_location: CodeLocation,
        decorations: Decorations,
    ) -> Self {
        Self {
            id,
            kind,
            text: text.into(),
            body,
            code_location,
            nesting_level: -1,
            marked_focus: decorations.focus,
            marked_pending: decorations.pending,
            marked_serial: decorations.serial,
            marked_ordered: decorations.ordered,
            flake_attempts: decorations.flake_attempts,
            must_pass_repeatedly: decorations.must_pass_repeatedly,
            timeout: decorations.timeout,
            labels: decorations.labels,
        }
    }
}

/// An ordered collection of nodes with the query helpers the compiler,
/// ordering engine, and runner need.
#[derive(Clone, Debug, Default)]
pub struct Nodes(pub Vec<Node>);

impl Deref for Nodes {
    type Target = [Node];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl FromIterator<Node> for Nodes {
    fn from_iter<T: IntoIterator<Item = Node>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl Nodes {
    /// Returns a new collection holding these nodes followed by `nodes`.
    pub fn copy_append(&self, nodes: impl IntoIterator<Item = Node>) -> Nodes {
        let mut out = self.0.clone();
        out.extend(nodes);
        Nodes(out)
    }

    /// Nodes whose kind is in `kinds`, in order.
    pub fn with_kind(&self, kinds: &[NodeKind]) -> Nodes {
        self.0
            .iter()
            .filter(|node| kinds.contains(&node.kind))
            .cloned()
            .collect()
    }

    /// Nodes whose kind is not in `kinds`, in order.
    pub fn without_kind(&self, kinds: &[NodeKind]) -> Nodes {
        self.0
            .iter()
            .filter(|node| !kinds.contains(&node.kind))
            .cloned()
            .collect()
    }

    /// The first node whose kind is in `kinds`.
    pub fn first_node_with_kind(&self, kinds: &[NodeKind]) -> Option<&Node> {
        self.0.iter().find(|node| kinds.contains(&node.kind))
    }

    /// Stable-sorted copy, outermost (lowest nesting) first.
    pub fn sorted_by_ascending_nesting(&self) -> Nodes {
        let mut out = self.0.clone();
        out.sort_by_key(|node| node.nesting_level);
        Nodes(out)
    }

    /// Stable-sorted copy, innermost (highest nesting) first.
    pub fn sorted_by_descending_nesting(&self) -> Nodes {
        let mut out = self.0.clone();
        out.sort_by_key(|node| std::cmp::Reverse(node.nesting_level));
        Nodes(out)
    }

    /// Nodes at or above (shallower than) the given nesting level.
    pub fn within_nesting_level(&self, level: i32) -> Nodes {
        self.0
            .iter()
            .filter(|node| node.nesting_level <= level)
            .cloned()
            .collect()
    }

    /// True if any node is marked focused.
    pub fn has_node_marked_focus(&self) -> bool {
        self.0.iter().any(|node| node.marked_focus)
    }

    /// True if any node is marked pending.
    pub fn has_node_marked_pending(&self) -> bool {
        self.0.iter().any(|node| node.marked_pending)
    }

    /// True if any node is marked serial or belongs to an ordered
    /// container chain.
    pub fn has_node_marked_serial_or_ordered(&self) -> bool {
        self.0
            .iter()
            .any(|node| node.marked_serial || node.marked_ordered)
    }

    /// The non-empty texts of these nodes, in order.
    pub fn texts(&self) -> Vec<String> {
        self.0
            .iter()
            .filter(|node| !node.text.is_empty())
            .map(|node| node.text.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: u64, kind: NodeKind, nesting: i32) -> Node {
        let mut n = Node::new(
            NodeId(id),
            kind,
            format!("node-{id}"),
            NodeBody::None,
            CodeLocation::new("nodes.rs", id as u32),
            Decorations::none(),
        );
        n.nesting_level = nesting;
        n
    }

    #[test]
    fn id_counter_is_monotonic_and_unique() {
        let counter = NodeIdCounter::new();
        let ids: Vec<_> = (0..100).map(|_| counter.next_id()).collect();
        for pair in ids.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }

    #[test]
    fn sorting_by_nesting_is_stable() {
        let nodes = Nodes(vec![
            node(1, NodeKind::BeforeEach, 1),
            node(2, NodeKind::BeforeEach, 0),
            node(3, NodeKind::BeforeEach, 1),
        ]);
        let asc: Vec<_> = nodes
            .sorted_by_ascending_nesting()
            .iter()
            .map(|n| n.id.0)
            .collect();
        assert_eq!(asc, vec![2, 1, 3]);

        let desc: Vec<_> = nodes
            .sorted_by_descending_nesting()
            .iter()
            .map(|n| n.id.0)
            .collect();
        assert_eq!(desc, vec![1, 3, 2]);
    }

    #[test]
    fn kind_queries() {
        let nodes = Nodes(vec![
            node(1, NodeKind::Container, 0),
            node(2, NodeKind::BeforeEach, 1),
            node(3, NodeKind::Assertion, 1),
        ]);
        assert_eq!(
            nodes
                .first_node_with_kind(NodeKind::CONTAINER_AND_ASSERTION)
                .map(|n| n.id.0),
            Some(1)
        );
        assert_eq!(nodes.with_kind(&[NodeKind::Assertion]).len(), 1);
        assert_eq!(nodes.without_kind(&[NodeKind::Container]).len(), 2);
    }
}
