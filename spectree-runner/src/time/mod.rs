// Copyright (c) The spectree Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Time tracking for suite and spec runs.

mod stopwatch;

pub(crate) use stopwatch::*;
