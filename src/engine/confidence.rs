// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Confidence scoring for terminal atoms.
//!
//! Single formula, applied uniformly:
//!
//! `s = 0.40·validation_pass_rate + 0.30·(1 − attempts_used_ratio)
//!    + 0.20·(1 − complexity_ratio) + 0.10·integration_pass_rate`
//!
//! clamped to [0, 1]. Atoms scoring below 0.70 are flagged for human review;
//! the review queue itself lives outside the engine.

use crate::model::Complexity;

/// Atoms below this score are tagged `needs_review`.
pub const REVIEW_THRESHOLD: f64 = 0.70;

#[derive(Debug, Clone)]
pub struct ConfidenceInputs {
    /// Fraction of attempts whose output passed validation.
    pub validation_pass_rate: f64,
    pub attempts_used: u32,
    pub max_attempts: u32,
    pub complexity: Complexity,
    /// Pass rate of the masterplan's latest acceptance snapshot; 1.0 when no
    /// results exist yet.
    pub integration_pass_rate: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfidenceBand {
    High,
    Medium,
    Low,
    Critical,
}

pub fn score(inputs: &ConfidenceInputs) -> f64 {
    let attempts_ratio = if inputs.max_attempts == 0 {
        1.0
    } else {
        f64::from(inputs.attempts_used) / f64::from(inputs.max_attempts)
    };
    let raw = 0.40 * inputs.validation_pass_rate
        + 0.30 * (1.0 - attempts_ratio)
        + 0.20 * (1.0 - inputs.complexity.ratio())
        + 0.10 * inputs.integration_pass_rate;
    raw.clamp(0.0, 1.0)
}

pub fn band(score: f64) -> ConfidenceBand {
    if score >= 0.85 {
        ConfidenceBand::High
    } else if score >= 0.70 {
        ConfidenceBand::Medium
    } else if score >= 0.50 {
        ConfidenceBand::Low
    } else {
        ConfidenceBand::Critical
    }
}

pub fn needs_review(score: f64) -> bool {
    score < REVIEW_THRESHOLD
}
