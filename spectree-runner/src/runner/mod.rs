// Copyright (c) The spectree Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Spec execution: the node runner and the per-worker suite runner.

mod executor;
mod imp;

pub use executor::{DEFAULT_ASYNC_NODE_TIMEOUT, Done};
pub use imp::SuiteRunner;
