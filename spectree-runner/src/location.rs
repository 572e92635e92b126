// Copyright (c) The spectree Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Source locations for nodes and failures.
//!
//! Every node records where it was declared so that reports, the ordering
//! engine's stable sort, and failure messages can all point back at real
//! source lines. Locations are captured automatically through
//! `#[track_caller]` on the tree-builder methods; `code_location!()` exists
//! for the rare spot where a caller wants to capture one by hand.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A `file:line` pair identifying where a node or failure originated.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct CodeLocation {
    /// Source file path, as produced by `file!()`.
    pub file: String,
    /// 1-based line number.
    pub line: u32,
}

impl CodeLocation {
    /// Creates a new location.
    pub fn new(file: impl Into<String>, line: u32) -> Self {
        Self {
            file: file.into(),
            line,
        }
    }

    /// Captures the location of the caller.
    #[track_caller]
    pub fn caller() -> Self {
        let loc = std::panic::Location::caller();
        Self::new(loc.file(), loc.line())
    }
}

impl fmt::Display for CodeLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

/// Captures the [`CodeLocation`] of the invocation site.
#[macro_export]
macro_rules! code_location {
    () => {
        $crate::location::CodeLocation::new(file!(), line!())
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_file_colon_line() {
        let loc = CodeLocation::new("src/lib.rs", 42);
        assert_eq!(loc.to_string(), "src/lib.rs:42");
    }

    #[test]
    fn caller_points_at_this_file() {
        let loc = CodeLocation::caller();
        assert!(loc.file.ends_with("location.rs"), "got {}", loc.file);
    }
}
