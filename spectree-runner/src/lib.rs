// Copyright (c) The spectree Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

#![warn(missing_docs)]

//! A spec-tree test-suite execution engine.
//!
//! Suites are declared as a tree of containers, setup/cleanup nodes, and
//! assertions ([`tree::TreeBuilder`]), compiled into flat specs, ordered
//! with a deterministic seeded shuffle ([`ordering`]), and executed by a
//! per-worker [`runner::SuiteRunner`]. Parallel runs span multiple worker
//! processes synchronized through a small TCP coordinator
//! ([`coordinator`]).

pub mod config;
pub mod coordinator;
pub mod errors;
mod failer;
pub mod interrupt;
pub mod location;
pub mod node;
pub mod ordering;
pub mod report;
pub mod reporter;
pub mod runner;
pub mod spec;
mod time;
pub mod tree;

pub use config::SuiteConfig;
pub use failer::{Failer, SpecContext};
pub use location::CodeLocation;
pub use report::{ExecutionOutcome, SpecReport, SuiteReport};
pub use runner::{Done, SuiteRunner};
pub use tree::TreeBuilder;
