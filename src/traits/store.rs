// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Persistence contract for runs, atoms, costs, acceptance data, and the
//! event outbox.
//!
//! The engine reads and writes these logical tables; the storage layer owns
//! the schema beyond them. `record_atom_terminal` is the transactional seam:
//! an atom's terminal state, its cost record, and the corresponding event
//! must land together or not at all.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::cost::{CostViolation, LedgerSnapshot};
use crate::errors::StoreError;
use crate::model::{AcceptanceResult, AcceptanceTest, Atom, DependencyEdge, ExecutionPlan};
use crate::observability::EngineEvent;

/// One row of the `runs` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub masterplan_id: Uuid,
    pub status: RunStatus,
    /// Bumped on every transition; duplicate drivers lose the compare-and-set.
    pub state_version: u64,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Paused,
    /// Stopped by the acceptance gate; resumable after tests are fixed.
    Blocked,
    /// Completed with failures, backpressure aborts, or cost skips.
    Degraded,
    Completed,
    Cancelled,
    Failed,
}

impl RunStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, RunStatus::Running | RunStatus::Paused)
    }
}

#[async_trait]
pub trait StateStore: Send + Sync {
    // -- masterplan inputs --
    async fn load_atoms(&self, masterplan_id: Uuid) -> Result<Vec<Atom>, StoreError>;
    async fn load_edges(&self, masterplan_id: Uuid) -> Result<Vec<DependencyEdge>, StoreError>;
    async fn load_acceptance_tests(
        &self,
        masterplan_id: Uuid,
    ) -> Result<Vec<AcceptanceTest>, StoreError>;

    // -- runs --
    async fn find_active_run(&self, masterplan_id: Uuid) -> Result<Option<RunRecord>, StoreError>;
    async fn get_run(&self, run_id: Uuid) -> Result<Option<RunRecord>, StoreError>;
    async fn insert_run(&self, run: RunRecord) -> Result<(), StoreError>;
    /// Compare-and-set on `state_version`; the stored version must equal
    /// `expected_version` and is bumped by one on success.
    async fn update_run(&self, run: RunRecord, expected_version: u64) -> Result<(), StoreError>;

    // -- atoms --
    async fn update_atom(&self, atom: &Atom) -> Result<(), StoreError>;
    /// Persist a terminal atom transition, its cost record, and the emitted
    /// event in a single transaction (outbox pattern). Returns the outbox id
    /// so the caller can publish and mark it.
    async fn record_atom_terminal(
        &self,
        atom: &Atom,
        cost: f64,
        event: &EngineEvent,
    ) -> Result<u64, StoreError>;

    // -- cost ledger --
    async fn save_ledger(&self, snapshot: &LedgerSnapshot) -> Result<(), StoreError>;
    async fn append_violation(&self, violation: &CostViolation) -> Result<(), StoreError>;

    // -- acceptance --
    async fn append_acceptance_result(&self, result: &AcceptanceResult) -> Result<(), StoreError>;
    async fn load_acceptance_results(
        &self,
        masterplan_id: Uuid,
    ) -> Result<Vec<AcceptanceResult>, StoreError>;

    // -- plan snapshots --
    async fn save_plan(&self, run_id: Uuid, plan: &ExecutionPlan) -> Result<(), StoreError>;
    async fn load_plan(&self, run_id: Uuid) -> Result<Option<ExecutionPlan>, StoreError>;

    // -- event outbox --
    async fn append_outbox(&self, event: &EngineEvent) -> Result<u64, StoreError>;
    async fn mark_published(&self, outbox_id: u64) -> Result<(), StoreError>;
    async fn unpublished_events(&self, run_id: Uuid) -> Result<Vec<(u64, EngineEvent)>, StoreError>;
}
