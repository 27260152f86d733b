// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

use thiserror::Error;

/// Cost guardrail configuration failures.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CostError {
    /// Caps must satisfy `0 < soft <= hard`; per-atom caps must be positive.
    #[error("invalid cost limits: soft={soft}, hard={hard}")]
    InvalidLimits { soft: f64, hard: f64 },
}
