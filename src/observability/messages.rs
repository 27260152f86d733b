// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Message types for engine lifecycle logging.
//!
//! Each message implements `Display` for the human-readable line and
//! `StructuredLog` for machine-readable fields, so operational strings are
//! defined once instead of scattered through the executors.

use std::fmt::{Display, Formatter};
use tracing::Span;
use uuid::Uuid;

/// Messages that support structured logging and span creation.
pub trait StructuredLog {
    /// Emit a log event with structured fields at the level appropriate to
    /// the message.
    fn log(&self);

    /// Create a span carrying this message's fields as attributes.
    fn span(&self, name: &str) -> Span;
}

/// A run started executing its plan.
pub struct RunStarted {
    pub run_id: Uuid,
    pub atom_count: usize,
    pub wave_count: usize,
    pub parallelism: usize,
}

impl Display for RunStarted {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(
            f,
            "Starting run {}: {} atoms across {} waves, parallelism={}",
            self.run_id, self.atom_count, self.wave_count, self.parallelism
        )
    }
}

impl StructuredLog for RunStarted {
    fn log(&self) {
        tracing::info!(
            run_id = %self.run_id,
            atom_count = self.atom_count,
            wave_count = self.wave_count,
            parallelism = self.parallelism,
            "{}", self
        );
    }

    fn span(&self, name: &str) -> Span {
        tracing::info_span!(
            "run",
            span_name = name,
            run_id = %self.run_id,
            atom_count = self.atom_count,
            wave_count = self.wave_count,
        )
    }
}

/// A wave finished, successfully or otherwise.
pub struct WaveFinished {
    pub run_id: Uuid,
    pub wave_index: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub duration: std::time::Duration,
}

impl Display for WaveFinished {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(
            f,
            "Wave {} finished: {} succeeded, {} failed, {} skipped in {:?}",
            self.wave_index, self.succeeded, self.failed, self.skipped, self.duration
        )
    }
}

impl StructuredLog for WaveFinished {
    fn log(&self) {
        tracing::info!(
            run_id = %self.run_id,
            wave_index = self.wave_index,
            succeeded = self.succeeded,
            failed = self.failed,
            skipped = self.skipped,
            duration_ms = self.duration.as_millis() as u64,
            "{}", self
        );
    }

    fn span(&self, name: &str) -> Span {
        tracing::info_span!(
            "wave",
            span_name = name,
            run_id = %self.run_id,
            wave_index = self.wave_index,
        )
    }
}

/// The acceptance gate refused to let the run advance.
pub struct GateBlockedRun {
    pub run_id: Uuid,
    pub wave_index: Option<usize>,
    pub must_rate: f64,
    pub should_rate: f64,
}

impl Display for GateBlockedRun {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(
            f,
            "Acceptance gate blocked run {}: must_rate={:.3}, should_rate={:.3}",
            self.run_id, self.must_rate, self.should_rate
        )
    }
}

impl StructuredLog for GateBlockedRun {
    fn log(&self) {
        tracing::warn!(
            run_id = %self.run_id,
            wave_index = self.wave_index,
            must_rate = self.must_rate,
            should_rate = self.should_rate,
            "{}", self
        );
    }

    fn span(&self, name: &str) -> Span {
        tracing::warn_span!(
            "gate_blocked",
            span_name = name,
            run_id = %self.run_id,
            must_rate = self.must_rate,
            should_rate = self.should_rate,
        )
    }
}

/// A cost cap was crossed while recording actuals.
pub struct CostCapCrossed {
    pub masterplan_id: Uuid,
    pub kind: &'static str,
    pub accumulated: f64,
    pub cap: f64,
}

impl Display for CostCapCrossed {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(
            f,
            "Masterplan {} crossed {} cost cap: accumulated ${:.2} against cap ${:.2}",
            self.masterplan_id, self.kind, self.accumulated, self.cap
        )
    }
}

impl StructuredLog for CostCapCrossed {
    fn log(&self) {
        tracing::warn!(
            masterplan_id = %self.masterplan_id,
            kind = self.kind,
            accumulated = self.accumulated,
            cap = self.cap,
            "{}", self
        );
    }

    fn span(&self, name: &str) -> Span {
        tracing::warn_span!(
            "cost_cap",
            span_name = name,
            masterplan_id = %self.masterplan_id,
            kind = self.kind,
        )
    }
}
