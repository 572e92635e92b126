// Copyright (c) The spectree Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Errors produced by spectree.

use crate::{coordinator::protocol::Status, location::CodeLocation, node::NodeKind};
use std::io;
use thiserror::Error;

/// An error in the suite configuration, reported before anything runs.
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// `parallel_index` fell outside `1..=parallel_total`.
    #[error("parallel index {index} must be between 1 and parallel total {total}, inclusive")]
    InvalidParallelIndex {
        /// The offending 1-based worker index.
        index: usize,
        /// The configured number of workers.
        total: usize,
    },

    /// `parallel_total` was zero.
    #[error("parallel total must be at least 1")]
    ZeroParallelTotal,

    /// A parallel run was configured without a coordinator address.
    #[error("parallel total is {total} but no coordinator address was provided")]
    MissingCoordinatorAddress {
        /// The configured number of workers.
        total: usize,
    },

    /// A focus/skip pattern failed to compile.
    #[error("invalid filter pattern `{pattern}`")]
    InvalidFilterPattern {
        /// The pattern as given.
        pattern: String,
        /// The regex compile error.
        #[source]
        source: regex::Error,
    },
}

/// A malformed spec tree, reported at build time rather than at run time.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TreeError {
    /// A suite-setup or suite-teardown node was declared inside a
    /// container instead of at the suite's top level.
    #[error("{kind} node at {location} must be declared at the suite's top level")]
    SuiteNodeInContainer {
        /// The offending node kind.
        kind: NodeKind,
        /// Where the node was declared.
        location: CodeLocation,
    },

    /// An assertion node ended up with children — a malformed tree.
    #[error("assertion node at {location} may not contain other nodes")]
    AssertionWithChildren {
        /// The assertion's declaration site.
        location: CodeLocation,
    },

    /// Before-all/after-all nodes are only meaningful inside an ordered
    /// container.
    #[error("{kind} node at {location} must be declared inside an ordered container")]
    SetupAllOutsideOrderedContainer {
        /// The offending node kind.
        kind: NodeKind,
        /// Where the node was declared.
        location: CodeLocation,
    },

    /// A second suite-setup or suite-teardown node was declared.
    #[error("only one {kind} node may be declared per suite; first was at {previous}, second at {location}")]
    DuplicateSuiteNode {
        /// The duplicated kind.
        kind: NodeKind,
        /// Location of the first declaration.
        previous: CodeLocation,
        /// Location of the duplicate.
        location: CodeLocation,
    },

    /// A decoration was applied to a node kind it doesn't apply to.
    #[error("the {decoration} decoration is not valid for a {kind} node at {location}")]
    InvalidDecoration {
        /// The decoration name.
        decoration: &'static str,
        /// The decorated node's kind.
        kind: NodeKind,
        /// Where the node was declared.
        location: CodeLocation,
    },

    /// A node was marked both focused and pending.
    #[error("node at {location} cannot be marked both focused and pending")]
    FocusedAndPending {
        /// Where the node was declared.
        location: CodeLocation,
    },

    /// A container body panicked while the tree was being built.
    #[error("container at {location} panicked during tree construction: {message}")]
    ContainerPanicked {
        /// The container's declaration site.
        location: CodeLocation,
        /// The rendered panic payload.
        message: String,
    },
}

/// A failure to reach or understand the coordinator.
///
/// These are transport-level problems. Protocol-level outcomes that a
/// worker must react to (setup failed on the primary worker, primary
/// worker disappeared) are [`SuiteSyncError`]s instead, so callers can
/// report a meaningful cause rather than a bare network error.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProtocolError {
    /// Could not connect to the coordinator.
    #[error("failed to connect to coordinator at {address}")]
    Connect {
        /// The coordinator address.
        address: String,
        /// The underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// An I/O error while talking to the coordinator.
    #[error("I/O error while talking to the coordinator")]
    Io(#[from] io::Error),

    /// A request or response failed to encode or decode.
    #[error("failed to encode or decode a coordinator message")]
    Codec(#[from] serde_json::Error),

    /// The coordinator closed the connection without responding.
    #[error("coordinator closed the connection without responding")]
    ConnectionClosed,

    /// A response carried a status that the method does not produce.
    #[error("coordinator returned unexpected status {status:?}")]
    UnexpectedStatus {
        /// The status received.
        status: Status,
    },

    /// A response was missing its expected payload.
    #[error("coordinator response was missing its payload")]
    MissingPayload,
}

/// A cross-worker synchronization step that resolved to a terminal,
/// non-retryable condition.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SuiteSyncError {
    /// The primary worker ran the suite-setup body and it failed.
    #[error("suite setup failed on the primary worker; this worker cannot proceed")]
    SetupFailed,

    /// The primary worker exited before reporting its suite-setup outcome.
    #[error("the primary worker exited before completing suite setup")]
    SetupDisappeared,

    /// A nonprimary worker exited before posting its end-of-run summary,
    /// so the aggregated report can never converge.
    #[error("aggregated report unavailable: a worker exited before reporting")]
    ReportUnavailable,

    /// The coordinator could not be reached or understood.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// An error setting up the process-wide interrupt handler.
#[derive(Debug, Error)]
#[error("error setting up the interrupt handler")]
pub struct InterruptSetupError(#[from] pub(crate) io::Error);

/// A fatal error driving a suite run.
///
/// Per-spec failures never surface here; they are recorded on the owning
/// spec's report. `RunError` is reserved for conditions that stop the
/// worker itself.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RunError {
    /// The suite configuration was invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The interrupt handler could not be installed.
    #[error(transparent)]
    InterruptSetup(#[from] InterruptSetupError),

    /// A coordinator exchange failed at the transport level.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}
