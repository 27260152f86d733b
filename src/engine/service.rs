// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Top-level run driver.
//!
//! `start` loads a masterplan's atoms, edges, and acceptance tests, builds
//! and validates the plan, snapshots it, and drives the waves in order. Each
//! wave runs through the wave executor; between waves the service honors
//! pause requests, cancellation, and the acceptance gate. Terminal atom
//! state is persisted transactionally by the executor; run-level transitions
//! go through the versioned run row so a duplicate driver cannot
//! double-apply.
//!
//! A run resumes from the first wave with a non-terminal atom: succeeded
//! atoms are never replayed, failed/skipped/cancelled atoms reset to pending
//! (attempt counters cleared unless configured otherwise).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::cache::{CachedGenerator, PromptCache, DEFAULT_PROMPT_TTL};
use crate::config::{EngineConfig, GatePolicy};
use crate::engine::cost::{CostGuardrails, CostViolation, LedgerSnapshot};
use crate::engine::emit_event;
use crate::engine::gate::{AcceptanceGate, GateReport};
use crate::engine::retry::RetryOrchestrator;
use crate::engine::wave_executor::{AbortReason, WaveExecutor};
use crate::errors::{EngineError, GraphError};
use crate::graph::{break_cycles, validate_plan, AtomGraph, WavePlanner};
use crate::model::{AcceptanceTest, Atom, AtomStatus, ExecutionPlan};
use crate::observability::messages::{GateBlockedRun, RunStarted, StructuredLog, WaveFinished};
use crate::observability::{EngineEvent, EventKind, MetricsRegistry};
use crate::traits::{AcceptanceRunner, EventSink, Generator, RunRecord, RunStatus, StateStore};

/// Result of a `start` or `resume` call.
#[derive(Debug)]
pub enum StartOutcome {
    /// A run for this masterplan is already active; nothing was advanced.
    AlreadyRunning { run_id: Uuid },
    /// The drive loop ran to a stopping point (completed, blocked, paused,
    /// degraded, or cancelled).
    Finished(RunReport),
}

/// Per-status atom counts at reporting time.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AtomCounts {
    pub pending: usize,
    pub ready: usize,
    pub in_progress: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cancelled: usize,
    pub needs_review: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct GateSummary {
    pub gate_passed: bool,
    pub can_release: bool,
    pub must_rate: f64,
    pub should_rate: f64,
    pub summary: String,
}

impl From<&GateReport> for GateSummary {
    fn from(report: &GateReport) -> Self {
        Self {
            gate_passed: report.gate_passed,
            can_release: report.can_release,
            must_rate: report.must_rate,
            should_rate: report.should_rate,
            summary: report.summary.clone(),
        }
    }
}

/// What a failed, blocked, or completed run reports back to the operator.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub masterplan_id: Uuid,
    pub status: RunStatus,
    pub atoms: AtomCounts,
    pub gate: Option<GateSummary>,
    pub ledger: LedgerSnapshot,
    pub violations: Vec<CostViolation>,
}

#[derive(Clone)]
struct RunHandle {
    cancel: CancellationToken,
    pause: Arc<AtomicBool>,
}

pub struct ExecutionService {
    config: Arc<EngineConfig>,
    store: Arc<dyn StateStore>,
    generator: Arc<dyn Generator>,
    runner: Arc<dyn AcceptanceRunner>,
    sink: Arc<dyn EventSink>,
    metrics: MetricsRegistry,
    guardrails: Arc<CostGuardrails>,
    prompt_cache: Arc<PromptCache>,
    handles: Mutex<HashMap<Uuid, RunHandle>>,
}

impl ExecutionService {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn StateStore>,
        generator: Arc<dyn Generator>,
        runner: Arc<dyn AcceptanceRunner>,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let metrics = MetricsRegistry::new();
        let guardrails = Arc::new(CostGuardrails::new(
            config.cost_soft_usd,
            config.cost_hard_usd,
            config.per_atom_cap_usd,
        ));
        let prompt_cache = Arc::new(PromptCache::new(DEFAULT_PROMPT_TTL, metrics.clone()));
        Ok(Self {
            config: Arc::new(config),
            store,
            generator,
            runner,
            sink,
            metrics,
            guardrails,
            prompt_cache,
            handles: Mutex::new(HashMap::new()),
        })
    }

    pub fn metrics(&self) -> &MetricsRegistry {
        &self.metrics
    }

    pub fn guardrails(&self) -> &Arc<CostGuardrails> {
        &self.guardrails
    }

    pub fn prompt_cache(&self) -> &Arc<PromptCache> {
        &self.prompt_cache
    }

    /// Start (and drive) a run for the masterplan. Idempotent: if a run is
    /// already active, its id is returned and nothing advances.
    pub async fn start(&self, masterplan_id: Uuid) -> Result<StartOutcome, EngineError> {
        if let Some(active) = self.store.find_active_run(masterplan_id).await? {
            return Ok(StartOutcome::AlreadyRunning {
                run_id: active.run_id,
            });
        }

        let atoms = self.store.load_atoms(masterplan_id).await?;
        let edges = self.store.load_edges(masterplan_id).await?;
        validate_inputs(&atoms)?;

        self.guardrails.set_limits(
            masterplan_id,
            self.config.cost_soft_usd,
            self.config.cost_hard_usd,
            self.config.per_atom_cap_usd,
        )?;

        let graph = AtomGraph::build(atoms, &edges, self.config.edge_confidence_floor)
            .map_err(|graph_error| match graph_error {
                GraphError::InvalidEdge { .. } => {
                    EngineError::InvalidInput(graph_error.to_string())
                }
                other => EngineError::Graph(other),
            })?;
        let (graph, removed) = break_cycles(graph)?;
        let planner = WavePlanner::new(self.config.max_wave_size, self.config.global_parallelism);
        let plan = planner.create_plan(&graph, removed)?;
        validate_plan(&plan, &graph)?;

        let run = RunRecord {
            run_id: Uuid::new_v4(),
            masterplan_id,
            status: RunStatus::Running,
            state_version: 0,
            started_at: Utc::now(),
            ended_at: None,
        };
        self.store.insert_run(run.clone()).await?;
        self.store.save_plan(run.run_id, &plan).await?;

        let report = self.drive(run, plan).await?;
        Ok(StartOutcome::Finished(report))
    }

    /// Resume a stopped run from the first wave with a non-terminal atom.
    pub async fn resume(&self, run_id: Uuid) -> Result<StartOutcome, EngineError> {
        let mut run = self
            .store
            .get_run(run_id)
            .await?
            .ok_or(EngineError::RunNotFound(run_id))?;
        if run.status == RunStatus::Running {
            return Ok(StartOutcome::AlreadyRunning { run_id });
        }
        if run.status == RunStatus::Completed {
            let report = self.build_report(&run, None).await?;
            return Ok(StartOutcome::Finished(report));
        }

        let plan = self
            .store
            .load_plan(run_id)
            .await?
            .ok_or_else(|| EngineError::Internal(format!("run {} has no plan snapshot", run_id)))?;

        // Failed, skipped, and cancelled atoms go back to pending; succeeded
        // atoms are never replayed.
        let atoms = self.store.load_atoms(run.masterplan_id).await?;
        for mut atom in atoms {
            if matches!(
                atom.status,
                AtomStatus::Failed | AtomStatus::Skipped | AtomStatus::Cancelled | AtomStatus::InProgress
            ) {
                atom.status = AtomStatus::Pending;
                if self.config.reset_attempts_on_resume {
                    atom.attempt_count = 0;
                }
                atom.last_error = None;
                atom.last_error_kind = None;
                atom.confidence_score = None;
                atom.needs_review = false;
                atom.started_at = None;
                atom.ended_at = None;
                self.store.update_atom(&atom).await?;
            }
        }

        run.ended_at = None;
        self.transition(&mut run, RunStatus::Running, false).await?;
        let report = self.drive(run, plan).await?;
        Ok(StartOutcome::Finished(report))
    }

    /// Request a pause: the run finishes its current wave, then stops.
    pub async fn pause(&self, run_id: Uuid) -> Result<(), EngineError> {
        let handles = self.handles.lock().expect("handles lock poisoned");
        let handle = handles.get(&run_id).ok_or(EngineError::RunNotFound(run_id))?;
        handle.pause.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Cooperative cancel: in-flight attempts finish, results are discarded,
    /// and the run returns promptly with partial state.
    pub async fn cancel(&self, run_id: Uuid) -> Result<(), EngineError> {
        let handle = {
            let handles = self.handles.lock().expect("handles lock poisoned");
            handles.get(&run_id).cloned()
        };
        match handle {
            Some(handle) => {
                handle.cancel.cancel();
                Ok(())
            }
            None => {
                // Not driven by this process; flip the stored row if active.
                let mut run = self
                    .store
                    .get_run(run_id)
                    .await?
                    .ok_or(EngineError::RunNotFound(run_id))?;
                if run.status.is_active() {
                    self.transition(&mut run, RunStatus::Cancelled, true).await?;
                    let event = EngineEvent::new(
                        EventKind::ExecutionCancelled,
                        run.run_id,
                        run.masterplan_id,
                    );
                    emit_event(&self.store, &self.sink, &event).await;
                }
                Ok(())
            }
        }
    }

    /// Read-only summary of a run.
    pub async fn status(&self, run_id: Uuid) -> Result<RunReport, EngineError> {
        let run = self
            .store
            .get_run(run_id)
            .await?
            .ok_or(EngineError::RunNotFound(run_id))?;
        let gate = self.gate_summary_from_store(run.masterplan_id).await?;
        self.build_report(&run, gate).await
    }

    async fn drive(
        &self,
        mut run: RunRecord,
        plan: ExecutionPlan,
    ) -> Result<RunReport, EngineError> {
        let run_id = run.run_id;
        let masterplan_id = run.masterplan_id;
        let handle = RunHandle {
            cancel: CancellationToken::new(),
            pause: Arc::new(AtomicBool::new(false)),
        };
        self.handles
            .lock()
            .expect("handles lock poisoned")
            .insert(run_id, handle.clone());

        let result = self.drive_inner(&mut run, &plan, &handle).await;

        self.handles
            .lock()
            .expect("handles lock poisoned")
            .remove(&run_id);

        // Whatever happened, leave a consistent run row behind.
        if let Err(engine_error) = &result {
            tracing::error!(
                run_id = %run_id,
                masterplan_id = %masterplan_id,
                error = %engine_error,
                "run halted with error"
            );
            if run.status.is_active() {
                let _ = self.transition(&mut run, RunStatus::Failed, true).await;
            }
        }

        result
    }

    async fn drive_inner(
        &self,
        run: &mut RunRecord,
        plan: &ExecutionPlan,
        handle: &RunHandle,
    ) -> Result<RunReport, EngineError> {
        let run_id = run.run_id;
        let masterplan_id = run.masterplan_id;
        let tests = self.store.load_acceptance_tests(masterplan_id).await?;

        // Per-run generator stack: cache wrapper, then retry orchestration.
        let cached: Arc<dyn Generator> = Arc::new(CachedGenerator::new(
            self.generator.clone(),
            self.prompt_cache.clone(),
            run_id,
            masterplan_id,
            self.sink.clone(),
            self.metrics.clone(),
        ));
        let orchestrator = Arc::new(RetryOrchestrator::new(self.config.clone(), cached));
        let executor = WaveExecutor::new(
            self.config.clone(),
            self.guardrails.clone(),
            orchestrator,
            self.store.clone(),
            self.sink.clone(),
            self.metrics.clone(),
        );
        let gate = AcceptanceGate::new(
            self.runner.clone(),
            self.config.gate_must_threshold,
            self.config.gate_should_threshold,
            self.metrics.clone(),
        );

        RunStarted {
            run_id,
            atom_count: plan.total_atoms,
            wave_count: plan.waves.len(),
            parallelism: self.config.global_parallelism,
        }
        .log();
        self.emit(
            EngineEvent::new(EventKind::ExecutionStarted, run_id, masterplan_id).with_payload(
                serde_json::json!({
                    "total_atoms": plan.total_atoms,
                    "wave_count": plan.waves.len(),
                    "cycle_broken_edges": plan.cycle_broken_edges.len(),
                }),
            ),
        )
        .await;

        let mut last_gate: Option<GateReport> = None;
        let mut executed_any_wave = false;

        for wave in &plan.waves {
            if handle.pause.load(Ordering::SeqCst) {
                self.transition(run, RunStatus::Paused, false).await?;
                return self.build_report(run, last_gate.as_ref().map(GateSummary::from)).await;
            }
            if handle.cancel.is_cancelled() {
                return self.finish_cancelled(run, last_gate.as_ref()).await;
            }

            let all_atoms = self.store.load_atoms(masterplan_id).await?;
            let by_id: HashMap<Uuid, &Atom> = all_atoms.iter().map(|a| (a.id, a)).collect();
            let pending: Vec<Atom> = wave
                .atom_ids
                .iter()
                .filter_map(|id| by_id.get(id).copied())
                .filter(|a| !a.status.is_terminal())
                .cloned()
                .collect();
            if pending.is_empty() {
                continue;
            }
            executed_any_wave = true;

            self.emit(
                EngineEvent::new(EventKind::WaveStarted, run_id, masterplan_id)
                    .with_wave(wave.index)
                    .with_payload(serde_json::json!({ "atom_count": pending.len() })),
            )
            .await;

            let (failing_names, integration_pass_rate) =
                self.acceptance_context(masterplan_id, &tests).await?;

            let outcome = executor
                .execute_wave(
                    run_id,
                    masterplan_id,
                    wave,
                    pending,
                    failing_names,
                    integration_pass_rate,
                    &handle.cancel,
                )
                .await?;

            WaveFinished {
                run_id,
                wave_index: wave.index,
                succeeded: outcome.succeeded,
                failed: outcome.failed,
                skipped: outcome.skipped,
                duration: std::time::Duration::from_millis(outcome.duration_ms),
            }
            .log();
            self.emit(
                EngineEvent::new(EventKind::WaveCompleted, run_id, masterplan_id)
                    .with_wave(wave.index)
                    .with_payload(serde_json::json!({
                        "succeeded": outcome.succeeded,
                        "failed": outcome.failed,
                        "skipped": outcome.skipped,
                        "cancelled": outcome.cancelled,
                        "duration_ms": outcome.duration_ms,
                        "parallel_peak": outcome.parallel_peak,
                        "cost_delta": outcome.cost_delta,
                    })),
            )
            .await;

            match outcome.aborted {
                Some(AbortReason::Cancelled) => {
                    return self.finish_cancelled(run, last_gate.as_ref()).await;
                }
                Some(AbortReason::Backpressure) | Some(AbortReason::CriticalFailure) => {
                    self.transition(run, RunStatus::Degraded, true).await?;
                    return self
                        .build_report(run, last_gate.as_ref().map(GateSummary::from))
                        .await;
                }
                None => {}
            }

            if self.config.gate_policy == GatePolicy::PerWave {
                let report = self
                    .run_gate(&gate, &tests, Some(wave.index), run_id, masterplan_id)
                    .await?;
                let blocked = !report.gate_passed;
                last_gate = Some(report);
                if blocked {
                    self.transition(run, RunStatus::Blocked, true).await?;
                    return self
                        .build_report(run, last_gate.as_ref().map(GateSummary::from))
                        .await;
                }
            }
        }

        // The completion gate runs when the policy asks for it, or when a
        // resumed run had nothing left to execute (e.g. blocked on tests
        // only) and the per-wave gates never got a chance to re-check.
        if self.config.gate_policy == GatePolicy::OnCompletion
            || (self.config.gate_policy == GatePolicy::PerWave && !executed_any_wave)
        {
            let report = self.run_gate(&gate, &tests, None, run_id, masterplan_id).await?;
            let blocked = !report.gate_passed;
            last_gate = Some(report);
            if blocked {
                self.transition(run, RunStatus::Blocked, true).await?;
                return self
                    .build_report(run, last_gate.as_ref().map(GateSummary::from))
                    .await;
            }
        }

        let report_gate = last_gate.as_ref().map(GateSummary::from);
        let counts = self.atom_counts(masterplan_id).await?;
        let clean = counts.failed == 0 && counts.skipped == 0 && counts.cancelled == 0;
        let final_status = if clean { RunStatus::Completed } else { RunStatus::Degraded };
        self.transition(run, final_status, true).await?;

        self.emit(
            EngineEvent::new(EventKind::ExecutionCompleted, run_id, masterplan_id).with_payload(
                serde_json::json!({
                    "succeeded": counts.succeeded,
                    "failed": counts.failed,
                    "skipped": counts.skipped,
                    "cancelled": counts.cancelled,
                    "accumulated_cost": self.guardrails.snapshot(masterplan_id).accumulated,
                }),
            ),
        )
        .await;

        self.build_report(run, report_gate).await
    }

    async fn run_gate(
        &self,
        gate: &AcceptanceGate,
        tests: &[AcceptanceTest],
        wave_index: Option<usize>,
        run_id: Uuid,
        masterplan_id: Uuid,
    ) -> Result<GateReport, EngineError> {
        let report = gate.check_gate(tests, wave_index).await;
        for result in &report.results {
            self.store.append_acceptance_result(result).await?;
        }
        self.emit(
            EngineEvent::new(EventKind::GateChecked, run_id, masterplan_id).with_payload(
                serde_json::json!({
                    "wave_index": wave_index,
                    "gate_passed": report.gate_passed,
                    "can_release": report.can_release,
                    "must_rate": report.must_rate,
                    "should_rate": report.should_rate,
                }),
            ),
        )
        .await;
        if !report.gate_passed {
            GateBlockedRun {
                run_id,
                wave_index,
                must_rate: report.must_rate,
                should_rate: report.should_rate,
            }
            .log();
            self.emit(
                EngineEvent::new(EventKind::GateFailed, run_id, masterplan_id).with_payload(
                    serde_json::json!({
                        "wave_index": wave_index,
                        "summary": report.summary,
                    }),
                ),
            )
            .await;
        }
        Ok(report)
    }

    async fn finish_cancelled(
        &self,
        run: &mut RunRecord,
        last_gate: Option<&GateReport>,
    ) -> Result<RunReport, EngineError> {
        self.transition(run, RunStatus::Cancelled, true).await?;
        self.emit(EngineEvent::new(
            EventKind::ExecutionCancelled,
            run.run_id,
            run.masterplan_id,
        ))
        .await;
        self.build_report(run, last_gate.map(GateSummary::from)).await
    }

    /// Names of currently failing acceptance tests plus the overall pass
    /// rate of the latest results, feeding retry feedback and confidence.
    async fn acceptance_context(
        &self,
        masterplan_id: Uuid,
        tests: &[AcceptanceTest],
    ) -> Result<(Vec<String>, f64), EngineError> {
        let results = self.store.load_acceptance_results(masterplan_id).await?;
        if results.is_empty() {
            return Ok((Vec::new(), 1.0));
        }
        // Last write per test id wins.
        let mut latest: HashMap<Uuid, &crate::model::AcceptanceResult> = HashMap::new();
        for result in &results {
            latest.insert(result.test_id, result);
        }
        let total = latest.len();
        let passed = latest.values().filter(|r| !r.status.counts_as_fail()).count();
        let by_id: HashMap<Uuid, &AcceptanceTest> = tests.iter().map(|t| (t.id, t)).collect();
        let mut failing: Vec<String> = latest
            .values()
            .filter(|r| r.status.counts_as_fail())
            .filter_map(|r| by_id.get(&r.test_id))
            .map(|t| t.requirement_text.clone())
            .collect();
        failing.sort();
        let rate = if total == 0 { 1.0 } else { passed as f64 / total as f64 };
        Ok((failing, rate))
    }

    async fn gate_summary_from_store(
        &self,
        masterplan_id: Uuid,
    ) -> Result<Option<GateSummary>, EngineError> {
        let tests = self.store.load_acceptance_tests(masterplan_id).await?;
        let results = self.store.load_acceptance_results(masterplan_id).await?;
        if results.is_empty() {
            return Ok(None);
        }
        let mut latest: HashMap<Uuid, &crate::model::AcceptanceResult> = HashMap::new();
        for result in &results {
            latest.insert(result.test_id, result);
        }
        let priority_of: HashMap<Uuid, crate::model::TestPriority> =
            tests.iter().map(|t| (t.id, t.priority)).collect();
        let mut must = (0usize, 0usize);
        let mut should = (0usize, 0usize);
        for (test_id, result) in &latest {
            let bucket = match priority_of.get(test_id) {
                Some(crate::model::TestPriority::Must) => &mut must,
                Some(crate::model::TestPriority::Should) => &mut should,
                None => continue,
            };
            bucket.1 += 1;
            if !result.status.counts_as_fail() {
                bucket.0 += 1;
            }
        }
        let must_rate = if must.1 == 0 { 1.0 } else { must.0 as f64 / must.1 as f64 };
        let should_rate = if should.1 == 0 { 1.0 } else { should.0 as f64 / should.1 as f64 };
        let gate_passed = must_rate >= self.config.gate_must_threshold
            && should_rate >= self.config.gate_should_threshold;
        Ok(Some(GateSummary {
            gate_passed,
            can_release: must_rate >= self.config.gate_must_threshold,
            must_rate,
            should_rate,
            summary: format!(
                "must {}/{}, should {}/{}",
                must.0, must.1, should.0, should.1
            ),
        }))
    }

    async fn atom_counts(&self, masterplan_id: Uuid) -> Result<AtomCounts, EngineError> {
        let atoms = self.store.load_atoms(masterplan_id).await?;
        let mut counts = AtomCounts::default();
        for atom in &atoms {
            match atom.status {
                AtomStatus::Pending => counts.pending += 1,
                AtomStatus::Ready => counts.ready += 1,
                AtomStatus::InProgress => counts.in_progress += 1,
                AtomStatus::Succeeded => counts.succeeded += 1,
                AtomStatus::Failed => counts.failed += 1,
                AtomStatus::Skipped => counts.skipped += 1,
                AtomStatus::Cancelled => counts.cancelled += 1,
                AtomStatus::NeedsReview => {}
            }
            if atom.needs_review {
                counts.needs_review += 1;
            }
        }
        Ok(counts)
    }

    async fn build_report(
        &self,
        run: &RunRecord,
        gate: Option<GateSummary>,
    ) -> Result<RunReport, EngineError> {
        Ok(RunReport {
            run_id: run.run_id,
            masterplan_id: run.masterplan_id,
            status: run.status,
            atoms: self.atom_counts(run.masterplan_id).await?,
            gate,
            ledger: self.guardrails.snapshot(run.masterplan_id),
            violations: self.guardrails.violations(run.masterplan_id),
        })
    }

    async fn transition(
        &self,
        run: &mut RunRecord,
        status: RunStatus,
        ended: bool,
    ) -> Result<(), EngineError> {
        run.status = status;
        if ended {
            run.ended_at = Some(Utc::now());
        }
        let expected = run.state_version;
        self.store.update_run(run.clone(), expected).await?;
        run.state_version = expected + 1;
        Ok(())
    }

    async fn emit(&self, event: EngineEvent) {
        emit_event(&self.store, &self.sink, &event).await;
    }
}

fn validate_inputs(atoms: &[Atom]) -> Result<(), EngineError> {
    let mut seen = std::collections::HashSet::with_capacity(atoms.len());
    for atom in atoms {
        if atom.estimated_cost < 0.0 {
            return Err(EngineError::InvalidInput(format!(
                "atom {} has negative estimated cost",
                atom.id
            )));
        }
        if !seen.insert(atom.id) {
            return Err(EngineError::InvalidInput(format!(
                "duplicate atom id {}",
                atom.id
            )));
        }
    }
    Ok(())
}
