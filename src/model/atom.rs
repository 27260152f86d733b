// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One unit of code generation scheduled by the engine.
///
/// Atoms are produced by an external atomizer and consumed here as-is. The
/// engine owns the `status`, retry bookkeeping, confidence score, and
/// timestamps; everything else (provenance links, target files, estimated
/// cost) is read-only input.
///
/// # Lifecycle
///
/// `Pending → Ready → InProgress → {Succeeded | Failed | Skipped | Cancelled}`
///
/// An atom becomes `Ready` only when every predecessor is `Succeeded` or
/// `Skipped`. Once terminal within a run, the status is never rewritten; a
/// later run may reset failed atoms back to `Pending` for re-execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Atom {
    /// Stable 128-bit identifier, unique within a masterplan.
    pub id: Uuid,
    /// Grouping identifier scoping cost caps, cache tags, and gates.
    pub masterplan_id: Uuid,
    /// Provenance: the task this atom was split from.
    #[serde(default)]
    pub task_id: Option<Uuid>,
    /// Provenance: the atom this one was re-split from, if any.
    #[serde(default)]
    pub parent_atom_id: Option<Uuid>,
    /// Drives parallelism weighting, queue priority, and retry temperature.
    pub complexity: Complexity,
    /// Non-negative USD estimate used by cost admission.
    pub estimated_cost: f64,
    /// Assembled prompt context handed to the generator verbatim.
    pub prompt: String,
    /// Output paths the generator is expected to produce.
    #[serde(default)]
    pub target_files: Vec<String>,
    /// Acceptance-test ids gating release of this atom's masterplan.
    #[serde(default)]
    pub acceptance_refs: Vec<Uuid>,
    #[serde(default)]
    pub status: AtomStatus,
    #[serde(default)]
    pub attempt_count: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub last_error_kind: Option<String>,
    /// Set on terminal status by the confidence scorer; in [0, 1].
    #[serde(default)]
    pub confidence_score: Option<f64>,
    /// Flagged when the confidence score falls below the review threshold.
    /// The review queue itself is external; the engine only tags.
    #[serde(default)]
    pub needs_review: bool,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
}

impl Atom {
    /// Minimal constructor for an atom awaiting execution.
    pub fn new(masterplan_id: Uuid, complexity: Complexity, estimated_cost: f64) -> Self {
        Self {
            id: Uuid::new_v4(),
            masterplan_id,
            task_id: None,
            parent_atom_id: None,
            complexity,
            estimated_cost,
            prompt: String::new(),
            target_files: Vec::new(),
            acceptance_refs: Vec::new(),
            status: AtomStatus::Pending,
            attempt_count: 0,
            last_error: None,
            last_error_kind: None,
            confidence_score: None,
            needs_review: false,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
        }
    }
}

/// Atom lifecycle states.
///
/// The engine writes `Succeeded`, `Failed`, `Skipped`, and `Cancelled` as
/// terminal states. `NeedsReview` exists for the external review queue to
/// apply after a run; the engine never sets it itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AtomStatus {
    Pending,
    Ready,
    InProgress,
    Succeeded,
    Failed,
    Skipped,
    Cancelled,
    NeedsReview,
}

impl Default for AtomStatus {
    fn default() -> Self {
        AtomStatus::Pending
    }
}

impl AtomStatus {
    /// Terminal states are immutable for the remainder of the run.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AtomStatus::Succeeded | AtomStatus::Failed | AtomStatus::Skipped | AtomStatus::Cancelled
        )
    }
}

/// Complexity classes assigned by the atomizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Low,
    Medium,
    High,
    Critical,
}

impl Complexity {
    /// Queue priority: lower numeric value dequeues first, so critical work
    /// jumps the line.
    pub fn priority_rank(&self) -> u8 {
        match self {
            Complexity::Critical => 0,
            Complexity::High => 1,
            Complexity::Medium => 2,
            Complexity::Low => 3,
        }
    }

    /// Normalized weight in [0, 1] used by the confidence scorer.
    pub fn ratio(&self) -> f64 {
        match self {
            Complexity::Low => 0.0,
            Complexity::Medium => 1.0 / 3.0,
            Complexity::High => 2.0 / 3.0,
            Complexity::Critical => 1.0,
        }
    }
}
