// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! The structured event contract.
//!
//! Every component emits `EngineEvent`s to an abstract sink. Emission is
//! monotonic per `(run_id, wave_index)`: events for earlier waves always
//! precede those for later waves, and each terminal atom transition emits
//! exactly one of `AtomSucceeded | AtomFailed | AtomSkipped`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ExecutionStarted,
    WaveStarted,
    AtomStarted,
    AtomSucceeded,
    AtomFailed,
    AtomSkipped,
    WaveCompleted,
    GateChecked,
    GateFailed,
    ExecutionCompleted,
    ExecutionCancelled,
    CostSoftExceeded,
    CostHardExceeded,
    CacheHit,
    CacheMiss,
    BatchFlushed,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::ExecutionStarted => "execution_started",
            EventKind::WaveStarted => "wave_started",
            EventKind::AtomStarted => "atom_started",
            EventKind::AtomSucceeded => "atom_succeeded",
            EventKind::AtomFailed => "atom_failed",
            EventKind::AtomSkipped => "atom_skipped",
            EventKind::WaveCompleted => "wave_completed",
            EventKind::GateChecked => "gate_checked",
            EventKind::GateFailed => "gate_failed",
            EventKind::ExecutionCompleted => "execution_completed",
            EventKind::ExecutionCancelled => "execution_cancelled",
            EventKind::CostSoftExceeded => "cost_soft_exceeded",
            EventKind::CostHardExceeded => "cost_hard_exceeded",
            EventKind::CacheHit => "cache_hit",
            EventKind::CacheMiss => "cache_miss",
            EventKind::BatchFlushed => "batch_flushed",
        }
    }
}

/// One structured event. The payload is freeform JSON scoped to the kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub run_id: Uuid,
    pub masterplan_id: Uuid,
    #[serde(default)]
    pub atom_id: Option<Uuid>,
    #[serde(default)]
    pub wave_index: Option<usize>,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub ts: DateTime<Utc>,
}

impl EngineEvent {
    pub fn new(kind: EventKind, run_id: Uuid, masterplan_id: Uuid) -> Self {
        Self {
            kind,
            run_id,
            masterplan_id,
            atom_id: None,
            wave_index: None,
            payload: serde_json::Value::Null,
            ts: Utc::now(),
        }
    }

    pub fn with_atom(mut self, atom_id: Uuid) -> Self {
        self.atom_id = Some(atom_id);
        self
    }

    pub fn with_wave(mut self, wave_index: usize) -> Self {
        self.wave_index = Some(wave_index);
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}
