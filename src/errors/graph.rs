// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Errors raised while building or repairing the dependency graph.

use thiserror::Error;
use uuid::Uuid;

/// Graph construction and cycle-repair failures.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GraphError {
    /// An edge references an atom that is not part of the build set. The
    /// graph refuses to build rather than dropping the edge silently.
    #[error("edge {src} -> {dst} references unknown atom {unknown}")]
    InvalidEdge { src: Uuid, dst: Uuid, unknown: Uuid },

    /// The residual graph still contains a cycle after breaking. This is an
    /// internal invariant breach, not an input problem.
    #[error("graph is not acyclic after cycle breaking: {remaining} atoms unplaced")]
    NonAcyclic { remaining: usize },
}
