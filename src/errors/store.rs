// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

use thiserror::Error;
use uuid::Uuid;

/// Persistence failures surfaced by `StateStore` implementations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    /// Optimistic-concurrency guard tripped: another driver advanced the run.
    #[error("run {run_id} state version conflict: expected {expected}, found {found}")]
    VersionConflict {
        run_id: Uuid,
        expected: u64,
        found: u64,
    },

    #[error("run {0} not found")]
    RunNotFound(Uuid),

    /// Backend failure; retried with bounded backoff before halting the wave.
    #[error("storage backend error: {0}")]
    Backend(String),
}
