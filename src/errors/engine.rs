// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Run-level errors for the execution service and its components.

use thiserror::Error;
use uuid::Uuid;

use crate::errors::{CostError, GraphError, StoreError};

/// Errors surfaced to callers of the execution service.
///
/// Component-local failures are classified at their source; what reaches this
/// enum is either a caller mistake (`InvalidInput`), an internal invariant
/// breach, or a run-level condition the operator must act on.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Bad atoms, edges, or configuration. Fatal; resumption is not possible
    /// until the input is fixed.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Cost(#[from] CostError),

    /// Admission refused after a hard-cap breach; remaining atoms in the wave
    /// transition to skipped.
    #[error("hard cost cap exceeded for masterplan {masterplan_id}")]
    HardCostExceeded { masterplan_id: Uuid },

    /// The wave's queue stayed saturated past the bounded retry budget. The
    /// run is marked degraded and the wave can be retried later.
    #[error("backpressure: wave {wave_index} could not enqueue within its retry budget")]
    Backpressure { wave_index: usize },

    #[error("run {0} not found")]
    RunNotFound(Uuid),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("internal error: {0}")]
    Internal(String),
}
