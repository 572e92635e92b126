// Copyright (c) The spectree Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The spec compiler: declarative tree construction and flattening.
//!
//! A suite is declared by driving a [`TreeBuilder`]: containers nest,
//! setup/cleanup nodes attach to the container they're declared in, and
//! assertions terminate specs. [`generate_specs`] then flattens the tree so
//! that every assertion appears in exactly one [`Spec`], preceded by every
//! setup node on the path from the root, in root-to-leaf order. The tree is
//! build-time-only; nothing holds it once specs are generated.
//!
//! Malformed trees fail fast here, at build time, never at run time.

use crate::{
    errors::TreeError,
    failer::{SpecContext, panic_message},
    location::CodeLocation,
    node::{Decorations, Node, NodeBody, NodeIdCounter, NodeKind, Nodes},
    report::SpecReport,
    runner::Done,
    spec::{Spec, Specs},
};
use std::{panic::AssertUnwindSafe, sync::Arc};

/// A node plus its ordered children. Used only during construction.
#[derive(Clone, Debug)]
pub struct TreeNode {
    /// The node itself.
    pub node: Node,
    /// Ordered child subtrees.
    pub children: Vec<TreeNode>,
}

impl TreeNode {
    fn new(node: Node) -> Self {
        Self {
            node,
            children: Vec::new(),
        }
    }
}

/// The finished output of tree construction: the container tree plus the
/// suite-level nodes that live outside it.
#[derive(Clone, Debug)]
pub struct SuitePlan {
    /// The root of the container tree. The root node itself is a
    /// synthetic container and never executes.
    pub tree: TreeNode,
    /// The suite-setup node, if declared.
    pub suite_setup: Option<Node>,
    /// The suite-teardown node, if declared.
    pub suite_teardown: Option<Node>,
}

/// Builds a spec tree.
///
/// The builder owns the [`NodeIdCounter`] that hands out node identities,
/// so two builders never share id space and nothing is process-global.
#[derive(Debug)]
pub struct TreeBuilder {
    counter: NodeIdCounter,
    // stack[0] is the synthetic root; the last entry is the container
    // currently being populated.
    stack: Vec<TreeNode>,
    suite_setup: Option<Node>,
    suite_teardown: Option<Node>,
}

impl Default for TreeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TreeBuilder {
    /// Creates an empty builder.
    pub fn new() -> Self {
        let counter = NodeIdCounter::new();
        let root = Node::new(
            counter.next_id(),
            NodeKind::Container,
            "",
            NodeBody::None,
            CodeLocation::new("<root>", 0),
            Decorations::none(),
        );
        Self {
            counter,
            stack: vec![TreeNode::new(root)],
            suite_setup: None,
            suite_teardown: None,
        }
    }

    fn at_top_level(&self) -> bool {
        self.stack.len() == 1
    }

    fn current_container(&self) -> &Node {
        &self
            .stack
            .last()
            .expect("builder stack always holds the root")
            .node
    }

    fn append(&mut self, node: Node) {
        self.stack
            .last_mut()
            .expect("builder stack always holds the root")
            .children
            .push(TreeNode::new(node));
    }

    fn validate(
        &self,
        kind: NodeKind,
        decorations: &Decorations,
        location: &CodeLocation,
    ) -> Result<(), TreeError> {
        let spec_kind = kind.is_container_or_assertion();
        if decorations.focus && decorations.pending {
            return Err(TreeError::FocusedAndPending {
                location: location.clone(),
            });
        }
        let invalid = |decoration: &'static str| TreeError::InvalidDecoration {
            decoration,
            kind,
            location: location.clone(),
        };
        if decorations.focus && !spec_kind {
            return Err(invalid("focus"));
        }
        if decorations.pending && !spec_kind {
            return Err(invalid("pending"));
        }
        if decorations.serial && !spec_kind {
            return Err(invalid("serial"));
        }
        if decorations.ordered && kind != NodeKind::Container {
            return Err(invalid("ordered"));
        }
        if decorations.flake_attempts > 0 && !spec_kind {
            return Err(invalid("flake_attempts"));
        }
        if decorations.must_pass_repeatedly > 0 && !spec_kind {
            return Err(invalid("must_pass_repeatedly"));
        }
        if decorations.timeout.is_some() && kind == NodeKind::Container {
            return Err(invalid("timeout"));
        }
        Ok(())
    }

    /// Declares a container and populates it through `body`.
    ///
    /// A panic inside `body` is caught and converted into
    /// [`TreeError::ContainerPanicked`]; tree construction never takes the
    /// process down.
    #[track_caller]
    pub fn container(
        &mut self,
        text: impl Into<String>,
        decorations: Decorations,
        body: impl FnOnce(&mut Self) -> Result<(), TreeError>,
    ) -> Result<(), TreeError> {
        let location = CodeLocation::caller();
        self.validate(NodeKind::Container, &decorations, &location)?;
        let node = Node::new(
            self.counter.next_id(),
            NodeKind::Container,
            text,
            NodeBody::None,
            location.clone(),
            decorations,
        );
        self.stack.push(TreeNode::new(node));
        let result = std::panic::catch_unwind(AssertUnwindSafe(|| body(self)));
        let subtree = self
            .stack
            .pop()
            .expect("container frame pushed above is still present");
        match result {
            Ok(Ok(())) => {
                self.stack
                    .last_mut()
                    .expect("builder stack always holds the root")
                    .children
                    .push(subtree);
                Ok(())
            }
            Ok(Err(err)) => Err(err),
            Err(payload) => Err(TreeError::ContainerPanicked {
                location,
                message: panic_message(payload.as_ref()),
            }),
        }
    }

    /// Declares an assertion with a synchronous body.
    #[track_caller]
    pub fn it(
        &mut self,
        text: impl Into<String>,
        decorations: Decorations,
        body: impl Fn(&SpecContext) + Send + Sync + 'static,
    ) -> Result<(), TreeError> {
        let location = CodeLocation::caller();
        self.leaf(
            NodeKind::Assertion,
            text,
            NodeBody::Sync(Arc::new(body)),
            decorations,
            location,
        )
    }

    /// Declares an assertion with an asynchronous body. The body must
    /// signal the [`Done`] handle; the node's timeout bounds the wait.
    #[track_caller]
    pub fn it_async(
        &mut self,
        text: impl Into<String>,
        decorations: Decorations,
        body: impl Fn(&SpecContext, Done) + Send + Sync + 'static,
    ) -> Result<(), TreeError> {
        let location = CodeLocation::caller();
        self.leaf(
            NodeKind::Assertion,
            text,
            NodeBody::Async(Arc::new(body)),
            decorations,
            location,
        )
    }

    /// Declares a pending assertion with no body.
    #[track_caller]
    pub fn it_pending(
        &mut self,
        text: impl Into<String>,
        decorations: Decorations,
    ) -> Result<(), TreeError> {
        let location = CodeLocation::caller();
        self.leaf(
            NodeKind::Assertion,
            text,
            NodeBody::None,
            decorations.pending(),
            location,
        )
    }

    /// Declares setup that runs before every descendant assertion.
    #[track_caller]
    pub fn before_each(
        &mut self,
        body: impl Fn(&SpecContext) + Send + Sync + 'static,
    ) -> Result<(), TreeError> {
        let location = CodeLocation::caller();
        self.leaf(
            NodeKind::BeforeEach,
            "",
            NodeBody::Sync(Arc::new(body)),
            Decorations::none(),
            location,
        )
    }

    /// Declares an asynchronous before-each with a timeout budget.
    #[track_caller]
    pub fn before_each_async(
        &mut self,
        decorations: Decorations,
        body: impl Fn(&SpecContext, Done) + Send + Sync + 'static,
    ) -> Result<(), TreeError> {
        let location = CodeLocation::caller();
        self.leaf(
            NodeKind::BeforeEach,
            "",
            NodeBody::Async(Arc::new(body)),
            decorations,
            location,
        )
    }

    /// Declares setup that runs after all before-eaches, just before the
    /// assertion.
    #[track_caller]
    pub fn just_before_each(
        &mut self,
        body: impl Fn(&SpecContext) + Send + Sync + 'static,
    ) -> Result<(), TreeError> {
        let location = CodeLocation::caller();
        self.leaf(
            NodeKind::JustBeforeEach,
            "",
            NodeBody::Sync(Arc::new(body)),
            Decorations::none(),
            location,
        )
    }

    /// Declares cleanup that runs after every descendant assertion,
    /// failure or not.
    #[track_caller]
    pub fn after_each(
        &mut self,
        body: impl Fn(&SpecContext) + Send + Sync + 'static,
    ) -> Result<(), TreeError> {
        let location = CodeLocation::caller();
        self.leaf(
            NodeKind::AfterEach,
            "",
            NodeBody::Sync(Arc::new(body)),
            Decorations::none(),
            location,
        )
    }

    /// Declares one-time setup for the enclosing ordered container.
    #[track_caller]
    pub fn before_all(
        &mut self,
        body: impl Fn(&SpecContext) + Send + Sync + 'static,
    ) -> Result<(), TreeError> {
        let location = CodeLocation::caller();
        if !self.current_container().marked_ordered {
            return Err(TreeError::SetupAllOutsideOrderedContainer {
                kind: NodeKind::BeforeAll,
                location,
            });
        }
        self.leaf(
            NodeKind::BeforeAll,
            "",
            NodeBody::Sync(Arc::new(body)),
            Decorations::none(),
            location,
        )
    }

    /// Declares one-time cleanup for the enclosing ordered container.
    #[track_caller]
    pub fn after_all(
        &mut self,
        body: impl Fn(&SpecContext) + Send + Sync + 'static,
    ) -> Result<(), TreeError> {
        let location = CodeLocation::caller();
        if !self.current_container().marked_ordered {
            return Err(TreeError::SetupAllOutsideOrderedContainer {
                kind: NodeKind::AfterAll,
                location,
            });
        }
        self.leaf(
            NodeKind::AfterAll,
            "",
            NodeBody::Sync(Arc::new(body)),
            Decorations::none(),
            location,
        )
    }

    /// Declares a hook invoked with each descendant spec's finished
    /// report. A failure in the hook fails the spec only if it was
    /// passing.
    #[track_caller]
    pub fn report_after_each(
        &mut self,
        body: impl Fn(&SpecReport) + Send + Sync + 'static,
    ) -> Result<(), TreeError> {
        let location = CodeLocation::caller();
        self.leaf(
            NodeKind::ReportHook,
            "",
            NodeBody::ReportHook(Arc::new(body)),
            Decorations::none(),
            location,
        )
    }

    /// Declares suite setup that runs once per worker, before any specs.
    #[track_caller]
    pub fn before_suite(
        &mut self,
        body: impl Fn(&SpecContext) + Send + Sync + 'static,
    ) -> Result<(), TreeError> {
        let location = CodeLocation::caller();
        self.suite_node(NodeKind::SuiteSetup, NodeBody::Sync(Arc::new(body)), location)
    }

    /// Declares synchronized suite setup: `primary` runs on worker 1
    /// alone and its returned bytes are handed to `all_workers` on every
    /// worker (worker 1 included).
    #[track_caller]
    pub fn synchronized_before_suite(
        &mut self,
        primary: impl Fn(&SpecContext) -> Vec<u8> + Send + Sync + 'static,
        all_workers: impl Fn(&SpecContext, &[u8]) + Send + Sync + 'static,
    ) -> Result<(), TreeError> {
        let location = CodeLocation::caller();
        self.suite_node(
            NodeKind::SuiteSetup,
            NodeBody::SynchronizedSuiteSetup {
                primary: Arc::new(primary),
                all_workers: Arc::new(all_workers),
            },
            location,
        )
    }

    /// Declares suite teardown that runs once per worker, after its specs.
    #[track_caller]
    pub fn after_suite(
        &mut self,
        body: impl Fn(&SpecContext) + Send + Sync + 'static,
    ) -> Result<(), TreeError> {
        let location = CodeLocation::caller();
        self.suite_node(
            NodeKind::SuiteTeardown,
            NodeBody::Sync(Arc::new(body)),
            location,
        )
    }

    /// Declares synchronized suite teardown: `all_workers` runs on every
    /// worker; `primary` runs on worker 1 once every other worker is
    /// confirmed finished.
    #[track_caller]
    pub fn synchronized_after_suite(
        &mut self,
        all_workers: impl Fn(&SpecContext) + Send + Sync + 'static,
        primary: impl Fn(&SpecContext) + Send + Sync + 'static,
    ) -> Result<(), TreeError> {
        let location = CodeLocation::caller();
        self.suite_node(
            NodeKind::SuiteTeardown,
            NodeBody::SynchronizedSuiteTeardown {
                all_workers: Arc::new(all_workers),
                primary: Arc::new(primary),
            },
            location,
        )
    }

    fn suite_node(
        &mut self,
        kind: NodeKind,
        body: NodeBody,
        location: CodeLocation,
    ) -> Result<(), TreeError> {
        if !self.at_top_level() {
            return Err(TreeError::SuiteNodeInContainer { kind, location });
        }
        let slot = match kind {
            NodeKind::SuiteSetup => &mut self.suite_setup,
            NodeKind::SuiteTeardown => &mut self.suite_teardown,
            _ => unreachable!("suite_node is only called with suite kinds"),
        };
        if let Some(previous) = slot {
            return Err(TreeError::DuplicateSuiteNode {
                kind,
                previous: previous.code_location.clone(),
                location,
            });
        }
        *slot = Some(Node::new(
            self.counter.next_id(),
            kind,
            "",
            body,
            location,
            Decorations::none(),
        ));
        Ok(())
    }

    fn leaf(
        &mut self,
        kind: NodeKind,
        text: impl Into<String>,
        body: NodeBody,
        decorations: Decorations,
        location: CodeLocation,
    ) -> Result<(), TreeError> {
        self.validate(kind, &decorations, &location)?;
        let node = Node::new(
            self.counter.next_id(),
            kind,
            text,
            body,
            location,
            decorations,
        );
        self.append(node);
        Ok(())
    }

    /// Finishes construction and returns the plan.
    pub fn finish(mut self) -> SuitePlan {
        let tree = self
            .stack
            .pop()
            .expect("builder stack always holds the root");
        SuitePlan {
            tree,
            suite_setup: self.suite_setup,
            suite_teardown: self.suite_teardown,
        }
    }
}

/// Flattens a tree into specs.
///
/// Every assertion in the tree appears in exactly one spec, preceded by
/// every setup node on the path from the root, in root-to-leaf order;
/// cleanup unwinding order is recovered later from the nesting levels
/// stamped here. Containers without assertion descendants contribute
/// nothing.
pub fn generate_specs(root: &TreeNode) -> Result<Specs, TreeError> {
    fn walk(
        nesting: i32,
        l_nodes: &Nodes,
        r_nodes: &Nodes,
        children: &[TreeNode],
    ) -> Result<Vec<Spec>, TreeError> {
        let mut specs = Vec::new();

        let nodes: Vec<Node> = children
            .iter()
            .map(|tree| {
                let mut node = tree.node.clone();
                node.nesting_level = nesting;
                node
            })
            .collect();

        for (idx, node) in nodes.iter().enumerate() {
            if !node.kind.is_container_or_assertion() {
                continue;
            }

            let siblings_before: Vec<Node> = nodes[..idx]
                .iter()
                .filter(|n| !n.kind.is_container_or_assertion())
                .cloned()
                .collect();
            let siblings_after: Vec<Node> = nodes[idx + 1..]
                .iter()
                .filter(|n| !n.kind.is_container_or_assertion())
                .cloned()
                .collect();

            let left = l_nodes.copy_append(siblings_before);
            let right = Nodes(siblings_after).copy_append(r_nodes.iter().cloned());

            if node.kind == NodeKind::Assertion {
                if !children[idx].children.is_empty() {
                    return Err(TreeError::AssertionWithChildren {
                        location: node.code_location.clone(),
                    });
                }
                let chain = left
                    .copy_append([node.clone()])
                    .copy_append(right.iter().cloned());
                specs.push(Spec::new(chain));
            } else {
                specs.extend(walk(
                    nesting + 1,
                    &left.copy_append([node.clone()]),
                    &right,
                    &children[idx].children,
                )?);
            }
        }

        Ok(specs)
    }

    walk(0, &Nodes::default(), &Nodes::default(), &root.children).map(Specs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn noop(_: &SpecContext) {}

    #[test]
    fn assertion_inherits_setup_chain_in_root_to_leaf_order() {
        let mut builder = TreeBuilder::new();
        builder
            .container("outer", Decorations::none(), |b| {
                b.before_each(noop)?;
                b.container("inner", Decorations::none(), |b| {
                    b.before_each(noop)?;
                    b.after_each(noop)?;
                    b.it("works", Decorations::none(), noop)
                })?;
                b.after_each(noop)
            })
            .expect("builds");
        let plan = builder.finish();
        let specs = generate_specs(&plan.tree).expect("generates");
        assert_eq!(specs.0.len(), 1);

        let kinds: Vec<NodeKind> = specs.0[0].nodes.iter().map(|n| n.kind).collect();
        assert_eq!(
            kinds,
            vec![
                NodeKind::Container,
                NodeKind::BeforeEach,
                NodeKind::Container,
                NodeKind::BeforeEach,
                NodeKind::Assertion,
                NodeKind::AfterEach,
                NodeKind::AfterEach,
            ]
        );

        let levels: Vec<i32> = specs.0[0].nodes.iter().map(|n| n.nesting_level).collect();
        assert_eq!(levels, vec![0, 1, 1, 2, 2, 2, 1]);
    }

    #[test]
    fn containers_without_assertions_contribute_no_specs() {
        let mut builder = TreeBuilder::new();
        builder
            .container("empty", Decorations::none(), |b| b.before_each(noop))
            .expect("builds");
        let plan = builder.finish();
        let specs = generate_specs(&plan.tree).expect("generates");
        assert!(specs.0.is_empty());
    }

    #[test]
    fn each_assertion_gets_its_own_spec() {
        let mut builder = TreeBuilder::new();
        builder
            .container("group", Decorations::none(), |b| {
                b.it("one", Decorations::none(), noop)?;
                b.it("two", Decorations::none(), noop)?;
                b.it("three", Decorations::none(), noop)
            })
            .expect("builds");
        let specs = generate_specs(&builder.finish().tree).expect("generates");
        let texts: Vec<String> = specs.0.iter().map(|s| s.text()).collect();
        assert_eq!(texts, vec!["group one", "group two", "group three"]);
    }

    #[test]
    fn container_panic_fails_at_build_time() {
        let mut builder = TreeBuilder::new();
        let err = builder
            .container("explodes", Decorations::none(), |_| {
                panic!("boom during construction")
            })
            .expect_err("panic is converted");
        assert!(matches!(err, TreeError::ContainerPanicked { .. }));
        assert!(err.to_string().contains("boom during construction"));
    }

    #[test]
    fn before_all_requires_ordered_container() {
        let mut builder = TreeBuilder::new();
        let err = builder
            .container("plain", Decorations::none(), |b| b.before_all(noop))
            .expect_err("rejected");
        assert!(matches!(
            err,
            TreeError::SetupAllOutsideOrderedContainer {
                kind: NodeKind::BeforeAll,
                ..
            }
        ));

        let mut builder = TreeBuilder::new();
        builder
            .container("ordered", Decorations::none().ordered(), |b| {
                b.before_all(noop)?;
                b.it("works", Decorations::none(), noop)
            })
            .expect("ordered container accepts before_all");
    }

    #[test]
    fn duplicate_suite_nodes_are_rejected() {
        let mut builder = TreeBuilder::new();
        builder.before_suite(noop).expect("first accepted");
        let err = builder.before_suite(noop).expect_err("second rejected");
        assert!(matches!(
            err,
            TreeError::DuplicateSuiteNode {
                kind: NodeKind::SuiteSetup,
                ..
            }
        ));
    }

    #[test]
    fn suite_nodes_must_be_top_level() {
        let mut builder = TreeBuilder::new();
        let err = builder
            .container("group", Decorations::none(), |b| b.before_suite(noop))
            .expect_err("rejected");
        assert!(matches!(err, TreeError::SuiteNodeInContainer { .. }));
    }

    #[test]
    fn focused_and_pending_is_rejected() {
        let mut builder = TreeBuilder::new();
        let err = builder
            .it("confused", Decorations::none().focus().pending(), noop)
            .expect_err("rejected");
        assert!(matches!(err, TreeError::FocusedAndPending { .. }));
    }

    #[test]
    fn ordered_decoration_is_container_only() {
        let mut builder = TreeBuilder::new();
        let err = builder
            .it("leaf", Decorations::none().ordered(), noop)
            .expect_err("rejected");
        assert!(matches!(
            err,
            TreeError::InvalidDecoration {
                decoration: "ordered",
                ..
            }
        ));
    }
}
