// Copyright (c) The spectree Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Flattened specs.
//!
//! A [`Spec`] is one fully-resolved executable test case: the chain of
//! inherited container and setup nodes plus one terminal assertion node.
//! Specs are produced by the spec compiler ([`crate::tree`]), reordered by
//! the ordering engine ([`crate::ordering`]), and executed by the runner.

use crate::node::{Node, NodeKind, Nodes};
use std::time::Duration;

/// One executable spec: an inherited node chain ending in an assertion.
#[derive(Clone, Debug)]
pub struct Spec {
    /// The chain, root-to-leaf: containers and setup nodes, then the
    /// assertion.
    pub nodes: Nodes,
    /// Set by focus/skip policy; skipped specs are reported but not run.
    pub skip: bool,
}

impl Spec {
    /// Creates a runnable (not-skipped) spec from a node chain.
    pub fn new(nodes: Nodes) -> Self {
        Self { nodes, skip: false }
    }

    /// The spec's full text: every non-empty node text joined with spaces.
    pub fn text(&self) -> String {
        self.nodes.texts().join(" ")
    }

    /// The first node in the chain with one of the given kinds.
    pub fn first_node_with_kind(&self, kinds: &[NodeKind]) -> Option<&Node> {
        self.nodes.first_node_with_kind(kinds)
    }

    /// The terminal assertion node.
    pub fn assertion_node(&self) -> &Node {
        self.nodes
            .first_node_with_kind(&[NodeKind::Assertion])
            .expect("a spec always contains exactly one assertion node")
    }

    /// The effective flake-attempt budget: the innermost non-zero
    /// declaration along the chain wins.
    pub fn flake_attempts(&self) -> u32 {
        self.nodes
            .iter()
            .filter(|node| node.flake_attempts > 0)
            .map(|node| node.flake_attempts)
            .next_back()
            .unwrap_or(0)
    }

    /// The effective must-pass-repeatedly count, innermost wins.
    pub fn must_pass_repeatedly(&self) -> u32 {
        self.nodes
            .iter()
            .filter(|node| node.must_pass_repeatedly > 0)
            .map(|node| node.must_pass_repeatedly)
            .next_back()
            .unwrap_or(0)
    }

    /// The assertion's timeout, if declared anywhere along the chain
    /// (innermost wins).
    pub fn timeout(&self) -> Option<Duration> {
        self.nodes
            .iter()
            .filter_map(|node| node.timeout)
            .next_back()
    }

    /// True if the chain carries a serial or ordered marker, excluding
    /// this spec from parallel distribution.
    pub fn is_serial_or_ordered(&self) -> bool {
        self.nodes.has_node_marked_serial_or_ordered()
    }

    /// The ordered container this spec belongs to, if any. Membership in
    /// an ordered container must stay contiguous and in source order.
    pub fn ordered_container(&self) -> Option<&Node> {
        self.nodes
            .iter()
            .find(|node| node.kind == NodeKind::Container && node.marked_ordered)
    }
}

/// An ordered list of specs.
#[derive(Clone, Debug, Default)]
pub struct Specs(pub Vec<Spec>);

impl Specs {
    /// Number of specs that will actually run.
    pub fn count_without_skip(&self) -> usize {
        self.0.iter().filter(|spec| !spec.skip).count()
    }

    /// True if any spec carries a pending node.
    pub fn has_any_pending(&self) -> bool {
        self.0
            .iter()
            .any(|spec| spec.nodes.has_node_marked_pending())
    }

    /// True if any runnable spec carries a focus marker.
    pub fn has_programmatic_focus(&self) -> bool {
        self.0.iter().any(|spec| {
            spec.nodes.has_node_marked_focus() && !spec.nodes.has_node_marked_pending()
        })
    }
}

impl FromIterator<Spec> for Specs {
    fn from_iter<T: IntoIterator<Item = Spec>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}
