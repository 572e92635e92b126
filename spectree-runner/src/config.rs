// Copyright (c) The spectree Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Suite configuration.
//!
//! A [`SuiteConfig`] describes one run of one suite within one worker
//! process: the shuffle seed, the worker's position in the parallel fleet,
//! and the focus/skip filters. The same configuration (apart from
//! `parallel_index`) must be handed to every worker of a parallel run or
//! the workers will disagree about the spec order.

use crate::errors::ConfigError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for a single suite run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SuiteConfig {
    /// Seed for the deterministic shuffle. The same seed produces the same
    /// order on every machine.
    pub random_seed: u64,

    /// Shuffle every spec individually rather than keeping top-level
    /// container groups together. Ordered containers stay contiguous
    /// either way.
    pub randomize_all_specs: bool,

    /// Total number of worker processes participating in this run.
    pub parallel_total: usize,

    /// This worker's 1-based index. Worker 1 is the primary worker: it
    /// runs the synchronized suite setup/teardown bodies and the serial
    /// group.
    pub parallel_index: usize,

    /// Address of the coordinator, required whenever `parallel_total > 1`.
    pub coordinator_address: Option<String>,

    /// Regex patterns; a spec runs only if its full text matches at least
    /// one of them (when non-empty).
    pub focus_strings: Vec<String>,

    /// Regex patterns; a spec is skipped if its full text matches any of
    /// them.
    pub skip_strings: Vec<String>,

    /// Regex patterns matched against the assertion node's `file:line`;
    /// a spec runs only if one matches (when non-empty).
    pub focus_files: Vec<String>,

    /// Regex patterns matched against the assertion node's `file:line`;
    /// a spec is skipped if one matches.
    pub skip_files: Vec<String>,

    /// Labels to select. When non-empty, a spec runs only if any of its
    /// nodes carries any of these labels.
    pub label_filter: Vec<String>,

    /// Stop scheduling new specs after the first failure.
    pub fail_fast: bool,

    /// Treat a suite containing pending specs as failed.
    pub fail_on_pending: bool,

    /// Walk the full pipeline and report every spec as passed without
    /// executing any bodies.
    pub dry_run: bool,

    /// Default number of attempts for failing specs. Node-level
    /// `flake_attempts` decorations override this.
    pub flake_attempts: u32,

    /// Overall deadline for the run; the interrupt handler fires when it
    /// elapses.
    #[serde(default, with = "humantime_serde")]
    pub suite_timeout: Option<Duration>,
}

impl Default for SuiteConfig {
    fn default() -> Self {
        Self {
            random_seed: 17,
            randomize_all_specs: false,
            parallel_total: 1,
            parallel_index: 1,
            coordinator_address: None,
            focus_strings: Vec::new(),
            skip_strings: Vec::new(),
            focus_files: Vec::new(),
            skip_files: Vec::new(),
            label_filter: Vec::new(),
            fail_fast: false,
            fail_on_pending: false,
            dry_run: false,
            flake_attempts: 0,
            suite_timeout: None,
        }
    }
}

impl SuiteConfig {
    /// Returns a single-worker configuration with the given seed.
    pub fn with_seed(random_seed: u64) -> Self {
        Self {
            random_seed,
            ..Self::default()
        }
    }

    /// True when this run spans more than one worker process.
    pub fn is_parallel(&self) -> bool {
        self.parallel_total > 1
    }

    /// True when this worker is the primary (index 1) worker.
    pub fn is_primary_worker(&self) -> bool {
        self.parallel_index == 1
    }

    /// Validates the cross-field invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.parallel_total == 0 {
            return Err(ConfigError::ZeroParallelTotal);
        }
        if self.parallel_index < 1 || self.parallel_index > self.parallel_total {
            return Err(ConfigError::InvalidParallelIndex {
                index: self.parallel_index,
                total: self.parallel_total,
            });
        }
        if self.is_parallel() && self.coordinator_address.is_none() {
            return Err(ConfigError::MissingCoordinatorAddress {
                total: self.parallel_total,
            });
        }
        for pattern in self
            .focus_strings
            .iter()
            .chain(&self.skip_strings)
            .chain(&self.focus_files)
            .chain(&self.skip_files)
        {
            regex::Regex::new(pattern).map_err(|source| ConfigError::InvalidFilterPattern {
                pattern: pattern.clone(),
                source,
            })?;
        }
        Ok(())
    }
}
