// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! In-memory `StateStore` for tests and the CLI demo harness.
//!
//! One mutex over all tables makes every method a transaction, which is
//! exactly what `record_atom_terminal` and the versioned run row need. A
//! production deployment swaps this for a database-backed implementation of
//! the same trait.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use uuid::Uuid;

use crate::config::Workload;
use crate::engine::cost::{CostViolation, LedgerSnapshot};
use crate::errors::StoreError;
use crate::model::{AcceptanceResult, AcceptanceTest, Atom, DependencyEdge, ExecutionPlan};
use crate::observability::EngineEvent;
use crate::traits::{RunRecord, StateStore};

struct OutboxRow {
    id: u64,
    run_id: Uuid,
    event: EngineEvent,
    published: bool,
}

#[derive(Default)]
struct Tables {
    atoms: HashMap<Uuid, Atom>,
    edges: HashMap<Uuid, Vec<DependencyEdge>>,
    tests: HashMap<Uuid, Vec<AcceptanceTest>>,
    runs: HashMap<Uuid, RunRecord>,
    ledgers: HashMap<Uuid, LedgerSnapshot>,
    violations: Vec<CostViolation>,
    acceptance_results: Vec<AcceptanceResult>,
    cost_records: Vec<(Uuid, f64)>,
    outbox: Vec<OutboxRow>,
    next_outbox_id: u64,
    plans: HashMap<Uuid, ExecutionPlan>,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store with a masterplan's inputs (CLI and test harness).
    pub fn seed_workload(&self, workload: &Workload) {
        let mut tables = self.tables.lock().expect("store lock poisoned");
        for atom in &workload.atoms {
            tables.atoms.insert(atom.id, atom.clone());
        }
        tables
            .edges
            .insert(workload.masterplan_id, workload.edges.clone());
        tables
            .tests
            .insert(workload.masterplan_id, workload.acceptance_tests.clone());
    }

    /// Replace the acceptance tests for a masterplan (external test fix
    /// before resumption).
    pub fn replace_acceptance_tests(&self, masterplan_id: Uuid, tests: Vec<AcceptanceTest>) {
        let mut tables = self.tables.lock().expect("store lock poisoned");
        tables.tests.insert(masterplan_id, tests);
    }

    pub fn get_atom(&self, atom_id: Uuid) -> Option<Atom> {
        self.tables
            .lock()
            .expect("store lock poisoned")
            .atoms
            .get(&atom_id)
            .cloned()
    }

    /// Recorded (atom, cost) pairs, for audit and tests.
    pub fn cost_records(&self) -> Vec<(Uuid, f64)> {
        self.tables
            .lock()
            .expect("store lock poisoned")
            .cost_records
            .clone()
    }

    /// Every outbox event for a run, published or not, in append order.
    pub fn events_for_run(&self, run_id: Uuid) -> Vec<EngineEvent> {
        self.tables
            .lock()
            .expect("store lock poisoned")
            .outbox
            .iter()
            .filter(|row| row.run_id == run_id)
            .map(|row| row.event.clone())
            .collect()
    }

    pub fn ledger_snapshot(&self, masterplan_id: Uuid) -> Option<LedgerSnapshot> {
        self.tables
            .lock()
            .expect("store lock poisoned")
            .ledgers
            .get(&masterplan_id)
            .cloned()
    }

    pub fn violations(&self, masterplan_id: Uuid) -> Vec<CostViolation> {
        self.tables
            .lock()
            .expect("store lock poisoned")
            .violations
            .iter()
            .filter(|v| v.masterplan_id == masterplan_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn load_atoms(&self, masterplan_id: Uuid) -> Result<Vec<Atom>, StoreError> {
        let tables = self.tables.lock().expect("store lock poisoned");
        let mut atoms: Vec<Atom> = tables
            .atoms
            .values()
            .filter(|a| a.masterplan_id == masterplan_id)
            .cloned()
            .collect();
        atoms.sort_by_key(|a| a.id);
        Ok(atoms)
    }

    async fn load_edges(&self, masterplan_id: Uuid) -> Result<Vec<DependencyEdge>, StoreError> {
        let tables = self.tables.lock().expect("store lock poisoned");
        Ok(tables.edges.get(&masterplan_id).cloned().unwrap_or_default())
    }

    async fn load_acceptance_tests(
        &self,
        masterplan_id: Uuid,
    ) -> Result<Vec<AcceptanceTest>, StoreError> {
        let tables = self.tables.lock().expect("store lock poisoned");
        Ok(tables.tests.get(&masterplan_id).cloned().unwrap_or_default())
    }

    async fn find_active_run(&self, masterplan_id: Uuid) -> Result<Option<RunRecord>, StoreError> {
        let tables = self.tables.lock().expect("store lock poisoned");
        Ok(tables
            .runs
            .values()
            .find(|run| run.masterplan_id == masterplan_id && run.status.is_active())
            .cloned())
    }

    async fn get_run(&self, run_id: Uuid) -> Result<Option<RunRecord>, StoreError> {
        let tables = self.tables.lock().expect("store lock poisoned");
        Ok(tables.runs.get(&run_id).cloned())
    }

    async fn insert_run(&self, run: RunRecord) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().expect("store lock poisoned");
        tables.runs.insert(run.run_id, run);
        Ok(())
    }

    async fn update_run(&self, run: RunRecord, expected_version: u64) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().expect("store lock poisoned");
        let stored = tables
            .runs
            .get_mut(&run.run_id)
            .ok_or(StoreError::RunNotFound(run.run_id))?;
        if stored.state_version != expected_version {
            return Err(StoreError::VersionConflict {
                run_id: run.run_id,
                expected: expected_version,
                found: stored.state_version,
            });
        }
        let mut updated = run;
        updated.state_version = expected_version + 1;
        *stored = updated;
        Ok(())
    }

    async fn update_atom(&self, atom: &Atom) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().expect("store lock poisoned");
        tables.atoms.insert(atom.id, atom.clone());
        Ok(())
    }

    async fn record_atom_terminal(
        &self,
        atom: &Atom,
        cost: f64,
        event: &EngineEvent,
    ) -> Result<u64, StoreError> {
        // Single lock scope = the transaction: atom state, cost record, and
        // outbox row land together.
        let mut tables = self.tables.lock().expect("store lock poisoned");
        tables.atoms.insert(atom.id, atom.clone());
        tables.cost_records.push((atom.id, cost));
        let id = tables.next_outbox_id;
        tables.next_outbox_id += 1;
        tables.outbox.push(OutboxRow {
            id,
            run_id: event.run_id,
            event: event.clone(),
            published: false,
        });
        Ok(id)
    }

    async fn save_ledger(&self, snapshot: &LedgerSnapshot) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().expect("store lock poisoned");
        tables.ledgers.insert(snapshot.masterplan_id, snapshot.clone());
        Ok(())
    }

    async fn append_violation(&self, violation: &CostViolation) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().expect("store lock poisoned");
        tables.violations.push(violation.clone());
        Ok(())
    }

    async fn append_acceptance_result(&self, result: &AcceptanceResult) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().expect("store lock poisoned");
        tables.acceptance_results.push(result.clone());
        Ok(())
    }

    async fn load_acceptance_results(
        &self,
        masterplan_id: Uuid,
    ) -> Result<Vec<AcceptanceResult>, StoreError> {
        let tables = self.tables.lock().expect("store lock poisoned");
        let test_ids: std::collections::HashSet<Uuid> = tables
            .tests
            .get(&masterplan_id)
            .map(|tests| tests.iter().map(|t| t.id).collect())
            .unwrap_or_default();
        Ok(tables
            .acceptance_results
            .iter()
            .filter(|r| test_ids.contains(&r.test_id))
            .cloned()
            .collect())
    }

    async fn save_plan(&self, run_id: Uuid, plan: &ExecutionPlan) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().expect("store lock poisoned");
        tables.plans.insert(run_id, plan.clone());
        Ok(())
    }

    async fn load_plan(&self, run_id: Uuid) -> Result<Option<ExecutionPlan>, StoreError> {
        let tables = self.tables.lock().expect("store lock poisoned");
        Ok(tables.plans.get(&run_id).cloned())
    }

    async fn append_outbox(&self, event: &EngineEvent) -> Result<u64, StoreError> {
        let mut tables = self.tables.lock().expect("store lock poisoned");
        let id = tables.next_outbox_id;
        tables.next_outbox_id += 1;
        tables.outbox.push(OutboxRow {
            id,
            run_id: event.run_id,
            event: event.clone(),
            published: false,
        });
        Ok(id)
    }

    async fn mark_published(&self, outbox_id: u64) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().expect("store lock poisoned");
        if let Some(row) = tables.outbox.iter_mut().find(|row| row.id == outbox_id) {
            row.published = true;
        }
        Ok(())
    }

    async fn unpublished_events(
        &self,
        run_id: Uuid,
    ) -> Result<Vec<(u64, EngineEvent)>, StoreError> {
        let tables = self.tables.lock().expect("store lock poisoned");
        Ok(tables
            .outbox
            .iter()
            .filter(|row| row.run_id == run_id && !row.published)
            .map(|row| (row.id, row.event.clone()))
            .collect())
    }
}
