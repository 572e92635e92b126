// Copyright (c) The spectree Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Cross-worker coordination for parallel suite runs.
//!
//! A parallel run consists of `parallel_total` worker processes, each
//! running a disjoint slice of the suite, plus one coordinator service
//! reachable by all of them. The coordinator implements three barriers
//! (suite-begin, suite-setup data, end-of-run), a shared spec counter,
//! report aggregation, and an out-of-band abort flag. Workers never share
//! memory; everything crosses the [`protocol`] wire.
//!
//! The business logic lives in the transport-independent
//! [`handler::ServerHandler`]; [`server::CoordinatorServer`] exposes it
//! over newline-delimited JSON frames on TCP, one request/response pair
//! per connection, and [`client::CoordinatorClient`] is the worker-side
//! counterpart.

pub mod client;
pub mod handler;
pub mod protocol;
pub mod server;
