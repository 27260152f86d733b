// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::DependencyEdge;

/// A level-partitioned execution plan: ordered waves of atoms whose
/// predecessors all live in strictly lower-indexed waves.
///
/// Plans are immutable after build and snapshot to storage verbatim so a run
/// can resume against the exact shape it started with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub waves: Vec<Wave>,
    /// Cardinality across waves; equals the graph's node count after any
    /// cycle-break removals.
    pub total_atoms: usize,
    /// Edges removed to make the graph acyclic, kept for audit.
    #[serde(default)]
    pub cycle_broken_edges: Vec<BrokenEdge>,
}

impl ExecutionPlan {
    /// Find the atom count of the largest wave, for telemetry.
    pub fn widest_wave(&self) -> usize {
        self.waves.iter().map(|w| w.atom_ids.len()).max().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.total_atoms == 0
    }
}

/// One topological level of the plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Wave {
    /// Zero-based wave number; waves execute strictly in index order.
    pub index: usize,
    /// Atoms in deterministic order: complexity descending, then id ascending.
    pub atom_ids: Vec<Uuid>,
    /// Soft parallelism cap, usually `min(global cap, wave size)`.
    pub max_parallel: usize,
    /// Optional duration hint, for telemetry only.
    #[serde(default)]
    pub expected_duration_hint_ms: Option<u64>,
}

/// An edge removed during cycle breaking, with the reason it was chosen.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokenEdge {
    pub edge: DependencyEdge,
    pub reason: String,
}
