// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Executes one wave of atoms with bounded parallelism.
//!
//! The driver admits atoms through the cost guardrails and feeds them into
//! the backpressure queue; a pool of `min(wave.max_parallel,
//! global_parallelism)` workers pulls from the queue and drives each atom
//! through the retry orchestrator. No ordering is guaranteed inside a wave.
//!
//! Per-atom protocol: admission check (hard breach skips the atom), bounded
//! re-try on queue rejection (persistent rejection aborts the wave with
//! backpressure), retry orchestration, then cost recording, confidence
//! scoring, transactional persistence, and exactly one terminal event.
//!
//! Cancellation is cooperative: workers finish their current atom, the
//! driver stops enqueuing, and partial results are reported, never dropped.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::engine::confidence::{self, ConfidenceInputs};
use crate::engine::cost::{Admission, CostGuardrails, RecordOutcome};
use crate::engine::queue::{BackpressureQueue, Dequeued, RejectReason};
use crate::engine::retry::{AttemptStatus, RetryOrchestrator};
use crate::errors::{EngineError, StoreError};
use crate::model::{Atom, AtomStatus, Complexity, Wave};
use crate::observability::{EngineEvent, EventKind, MetricsRegistry};
use crate::traits::{EventSink, StateStore};

/// Why a wave stopped before finishing its atom list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// The queue stayed saturated past the bounded retry budget.
    Backpressure,
    /// A critical atom failed and policy says stop.
    CriticalFailure,
    /// External cancellation.
    Cancelled,
}

/// Aggregate result of one wave. Idempotent: re-running a finalized wave
/// (no pending atoms) yields an all-zero outcome.
#[derive(Debug, Clone)]
pub struct WaveOutcome {
    pub wave_index: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cancelled: usize,
    pub duration_ms: u64,
    pub parallel_peak: usize,
    pub cost_delta: f64,
    /// A critical atom failed but the wave continued.
    pub degraded: bool,
    pub aborted: Option<AbortReason>,
}

struct Tally {
    succeeded: usize,
    failed: usize,
    skipped: usize,
    cancelled: usize,
    cost_delta: f64,
    degraded: bool,
    halt: Option<StoreError>,
}

/// Everything a worker needs, shared behind one Arc.
struct WaveContext {
    config: Arc<EngineConfig>,
    guardrails: Arc<CostGuardrails>,
    orchestrator: Arc<RetryOrchestrator>,
    store: Arc<dyn StateStore>,
    sink: Arc<dyn EventSink>,
    metrics: MetricsRegistry,
    queue: BackpressureQueue<Atom>,
    cancel: CancellationToken,
    run_id: Uuid,
    masterplan_id: Uuid,
    wave_index: usize,
    failing_acceptance: Vec<String>,
    integration_pass_rate: f64,
    tally: Mutex<Tally>,
    in_flight: AtomicUsize,
    parallel_peak: AtomicUsize,
}

pub struct WaveExecutor {
    config: Arc<EngineConfig>,
    guardrails: Arc<CostGuardrails>,
    orchestrator: Arc<RetryOrchestrator>,
    store: Arc<dyn StateStore>,
    sink: Arc<dyn EventSink>,
    metrics: MetricsRegistry,
}

impl WaveExecutor {
    pub fn new(
        config: Arc<EngineConfig>,
        guardrails: Arc<CostGuardrails>,
        orchestrator: Arc<RetryOrchestrator>,
        store: Arc<dyn StateStore>,
        sink: Arc<dyn EventSink>,
        metrics: MetricsRegistry,
    ) -> Self {
        Self {
            config,
            guardrails,
            orchestrator,
            store,
            sink,
            metrics,
        }
    }

    /// Run the wave's pending atoms to their terminal states.
    ///
    /// `atoms` must already be filtered to non-terminal atoms; terminal ones
    /// are the resumption path's concern.
    pub async fn execute_wave(
        &self,
        run_id: Uuid,
        masterplan_id: Uuid,
        wave: &Wave,
        atoms: Vec<Atom>,
        failing_acceptance: Vec<String>,
        integration_pass_rate: f64,
        cancel: &CancellationToken,
    ) -> Result<WaveOutcome, EngineError> {
        let started = Instant::now();
        let ctx = Arc::new(WaveContext {
            config: self.config.clone(),
            guardrails: self.guardrails.clone(),
            orchestrator: self.orchestrator.clone(),
            store: self.store.clone(),
            sink: self.sink.clone(),
            metrics: self.metrics.clone(),
            queue: BackpressureQueue::new(
                self.config.queue_capacity,
                self.config.queue_threshold_pct,
            ),
            cancel: cancel.child_token(),
            run_id,
            masterplan_id,
            wave_index: wave.index,
            failing_acceptance,
            integration_pass_rate,
            tally: Mutex::new(Tally {
                succeeded: 0,
                failed: 0,
                skipped: 0,
                cancelled: 0,
                cost_delta: 0.0,
                degraded: false,
                halt: None,
            }),
            in_flight: AtomicUsize::new(0),
            parallel_peak: AtomicUsize::new(0),
        });

        let worker_count = wave
            .max_parallel
            .min(self.config.global_parallelism)
            .max(1);
        let mut workers = Vec::with_capacity(worker_count);
        for _ in 0..worker_count {
            let ctx = ctx.clone();
            workers.push(tokio::spawn(async move { worker_loop(ctx).await }));
        }

        let feed_abort = feed_queue(&ctx, atoms).await;
        ctx.queue.close();

        for worker in workers {
            if let Err(join_error) = worker.await {
                return Err(EngineError::Internal(format!(
                    "wave worker panicked: {}",
                    join_error
                )));
            }
        }

        let stats = ctx.queue.stats();
        ctx.metrics.add("queue_enqueued_total", &[], stats.enqueued as f64);
        ctx.metrics.add("queue_dequeued_total", &[], stats.dequeued as f64);
        ctx.metrics.add("queue_rejected_total", &[], stats.rejected as f64);
        ctx.metrics.add("queue_expired_total", &[], stats.expired as f64);

        let tally = ctx.tally.lock().expect("tally lock poisoned");
        if let Some(store_error) = tally.halt.clone() {
            return Err(EngineError::Store(store_error));
        }
        // Classify why the wave stopped early, if it did. The child token
        // trips for internal aborts too, so external cancellation is judged
        // by the parent token alone.
        let aborted = if cancel.is_cancelled() {
            Some(AbortReason::Cancelled)
        } else if feed_abort == Some(AbortReason::Backpressure) {
            Some(AbortReason::Backpressure)
        } else if tally.degraded && self.config.abort_on_critical_failure {
            Some(AbortReason::CriticalFailure)
        } else {
            None
        };

        let duration = started.elapsed();
        self.metrics
            .observe("wave_duration_ms", &[], duration.as_millis() as f64);

        Ok(WaveOutcome {
            wave_index: wave.index,
            succeeded: tally.succeeded,
            failed: tally.failed,
            skipped: tally.skipped,
            cancelled: tally.cancelled,
            duration_ms: duration.as_millis() as u64,
            parallel_peak: ctx.parallel_peak.load(Ordering::Relaxed),
            cost_delta: tally.cost_delta,
            degraded: tally.degraded,
            aborted,
        })
    }
}

/// Driver side: admission, then enqueue with bounded retry on rejection.
async fn feed_queue(ctx: &Arc<WaveContext>, atoms: Vec<Atom>) -> Option<AbortReason> {
    let mut hard_event_emitted = false;

    for mut atom in atoms {
        if ctx.cancel.is_cancelled() {
            return Some(AbortReason::Cancelled);
        }

        match ctx
            .guardrails
            .check_before_execution(ctx.masterplan_id, atom.estimated_cost)
        {
            Admission::HardExceeded { accumulated, hard_cap } => {
                if !hard_event_emitted {
                    hard_event_emitted = true;
                    emit(
                        ctx,
                        EngineEvent::new(EventKind::CostHardExceeded, ctx.run_id, ctx.masterplan_id)
                            .with_wave(ctx.wave_index)
                            .with_payload(serde_json::json!({
                                "accumulated": accumulated,
                                "hard_cap": hard_cap,
                            })),
                    )
                    .await;
                }
                if let Err(store_error) = skip_atom(ctx, atom, "hard_cost_exceeded").await {
                    record_halt(ctx, store_error);
                    ctx.cancel.cancel();
                    return None;
                }
                continue;
            }
            Admission::SoftExceeded { accumulated, soft_cap } => {
                tracing::warn!(
                    masterplan_id = %ctx.masterplan_id,
                    accumulated,
                    soft_cap,
                    "admission past soft cost cap"
                );
            }
            Admission::Ok => {}
        }

        // All predecessors live in earlier waves and are terminal by now.
        atom.status = AtomStatus::Ready;
        let priority = atom.complexity.priority_rank();
        let deadline =
            Instant::now() + Duration::from_millis(ctx.config.request_age_timeout_ms);
        // Ease off once the queue crosses its threshold, before rejection
        // forces the issue.
        if ctx.queue.at_capacity() {
            tokio::time::sleep(Duration::from_millis(ctx.config.enqueue_retry_backoff_ms)).await;
        }
        let mut rejections = 0u32;
        loop {
            match ctx.queue.enqueue(atom.clone(), priority, deadline) {
                Ok(()) => break,
                Err(RejectReason::Closed) => return Some(AbortReason::Cancelled),
                Err(RejectReason::Full) => {
                    rejections += 1;
                    if rejections > ctx.config.enqueue_retry_attempts {
                        tracing::error!(
                            wave_index = ctx.wave_index,
                            rejections,
                            "queue saturated, aborting wave"
                        );
                        ctx.cancel.cancel();
                        ctx.queue.close();
                        return Some(AbortReason::Backpressure);
                    }
                    tokio::time::sleep(Duration::from_millis(
                        ctx.config.enqueue_retry_backoff_ms,
                    ))
                    .await;
                }
            }
        }
    }
    None
}

/// Worker side: pull atoms until the queue drains or the wave cancels.
async fn worker_loop(ctx: Arc<WaveContext>) {
    loop {
        if ctx.cancel.is_cancelled() {
            return;
        }
        match ctx
            .queue
            .dequeue(Duration::from_millis(ctx.config.dequeue_wait_ms))
            .await
        {
            Dequeued::Item(atom) => {
                let current = ctx.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                ctx.parallel_peak.fetch_max(current, Ordering::SeqCst);
                let result = process_atom(&ctx, atom).await;
                ctx.in_flight.fetch_sub(1, Ordering::SeqCst);
                if let Err(store_error) = result {
                    record_halt(&ctx, store_error);
                    ctx.cancel.cancel();
                    return;
                }
            }
            Dequeued::Timeout => continue,
            Dequeued::Drained => return,
        }
    }
}

async fn process_atom(ctx: &Arc<WaveContext>, mut atom: Atom) -> Result<(), StoreError> {
    atom.status = AtomStatus::InProgress;
    atom.started_at = Some(Utc::now());
    persist_atom_with_retry(ctx, &atom).await?;
    emit(
        ctx,
        EngineEvent::new(EventKind::AtomStarted, ctx.run_id, ctx.masterplan_id)
            .with_atom(atom.id)
            .with_wave(ctx.wave_index),
    )
    .await;

    let outcome = ctx
        .orchestrator
        .run(&atom, &ctx.failing_acceptance, &ctx.cancel)
        .await;

    ctx.metrics
        .add("attempts_total", &[], f64::from(outcome.attempt_count));
    ctx.metrics.add(
        "retries_total",
        &[],
        f64::from(outcome.attempt_count.saturating_sub(1)),
    );
    ctx.metrics
        .observe("attempts_per_atom", &[], f64::from(outcome.attempt_count));
    ctx.metrics
        .observe("atom_duration_ms", &[], outcome.total_duration_ms as f64);

    // Cost incurred is real regardless of the terminal status.
    if outcome.total_cost > 0.0 {
        let record = ctx
            .guardrails
            .record(ctx.masterplan_id, atom.id, outcome.total_cost);
        ctx.metrics
            .add("cost_usd_total", &[("layer", "generator")], outcome.total_cost);
        {
            let mut tally = ctx.tally.lock().expect("tally lock poisoned");
            tally.cost_delta += outcome.total_cost;
        }
        publish_cost_crossings(ctx, &record).await;
        let snapshot = ctx.guardrails.snapshot(ctx.masterplan_id);
        if let Err(store_error) = ctx.store.save_ledger(&snapshot).await {
            tracing::warn!(error = %store_error, "ledger snapshot persist failed");
        }
        for violation in &record.new_violations {
            if let Err(store_error) = ctx.store.append_violation(violation).await {
                tracing::warn!(error = %store_error, "violation persist failed");
            }
        }
    }

    atom.attempt_count = outcome.attempt_count;
    atom.ended_at = Some(Utc::now());

    match outcome.status {
        AttemptStatus::Succeeded => {
            let score = confidence::score(&ConfidenceInputs {
                validation_pass_rate: outcome.validation_pass_rate(),
                attempts_used: outcome.attempt_count,
                max_attempts: ctx.config.max_attempts,
                complexity: atom.complexity,
                integration_pass_rate: ctx.integration_pass_rate,
            });
            atom.status = AtomStatus::Succeeded;
            atom.last_error = None;
            atom.last_error_kind = None;
            atom.confidence_score = Some(score);
            atom.needs_review = confidence::needs_review(score);

            let event = EngineEvent::new(EventKind::AtomSucceeded, ctx.run_id, ctx.masterplan_id)
                .with_atom(atom.id)
                .with_wave(ctx.wave_index)
                .with_payload(serde_json::json!({
                    "attempts": outcome.attempt_count,
                    "cost_usd": outcome.total_cost,
                    "confidence": score,
                    "needs_review": atom.needs_review,
                    "target_files": atom.target_files,
                }));
            record_terminal_with_retry(ctx, &atom, outcome.total_cost, &event).await?;
            ctx.metrics.incr("atoms_total", &[("status", "succeeded")]);
            let mut tally = ctx.tally.lock().expect("tally lock poisoned");
            tally.succeeded += 1;
        }
        AttemptStatus::Failed => {
            let score = confidence::score(&ConfidenceInputs {
                validation_pass_rate: outcome.validation_pass_rate(),
                attempts_used: outcome.attempt_count,
                max_attempts: ctx.config.max_attempts,
                complexity: atom.complexity,
                integration_pass_rate: ctx.integration_pass_rate,
            });
            atom.status = AtomStatus::Failed;
            atom.last_error = outcome.last_error.clone();
            atom.last_error_kind = outcome.last_error_kind.map(|k| k.as_str().to_string());
            atom.confidence_score = Some(score);
            atom.needs_review = true;

            let event = EngineEvent::new(EventKind::AtomFailed, ctx.run_id, ctx.masterplan_id)
                .with_atom(atom.id)
                .with_wave(ctx.wave_index)
                .with_payload(serde_json::json!({
                    "attempts": outcome.attempt_count,
                    "cost_usd": outcome.total_cost,
                    "error_kind": atom.last_error_kind,
                    "error": atom.last_error,
                }));
            record_terminal_with_retry(ctx, &atom, outcome.total_cost, &event).await?;
            ctx.metrics.incr("atoms_total", &[("status", "failed")]);

            let mut tally = ctx.tally.lock().expect("tally lock poisoned");
            tally.failed += 1;
            if atom.complexity == Complexity::Critical {
                tally.degraded = true;
                if ctx.config.abort_on_critical_failure {
                    drop(tally);
                    ctx.cancel.cancel();
                }
            }
        }
        AttemptStatus::Cancelled => {
            atom.status = AtomStatus::Cancelled;
            persist_atom_with_retry(ctx, &atom).await?;
            ctx.metrics.incr("atoms_total", &[("status", "cancelled")]);
            let mut tally = ctx.tally.lock().expect("tally lock poisoned");
            tally.cancelled += 1;
        }
    }

    Ok(())
}

/// Driver-side skip for atoms refused by cost admission: terminal state,
/// zero cost, one `atom_skipped` event.
async fn skip_atom(ctx: &Arc<WaveContext>, mut atom: Atom, reason: &str) -> Result<(), StoreError> {
    atom.status = AtomStatus::Skipped;
    atom.ended_at = Some(Utc::now());
    atom.confidence_score = Some(0.0);
    let event = EngineEvent::new(EventKind::AtomSkipped, ctx.run_id, ctx.masterplan_id)
        .with_atom(atom.id)
        .with_wave(ctx.wave_index)
        .with_payload(serde_json::json!({ "reason": reason }));
    record_terminal_with_retry(ctx, &atom, 0.0, &event).await?;
    ctx.metrics.incr("atoms_total", &[("status", "skipped")]);
    let mut tally = ctx.tally.lock().expect("tally lock poisoned");
    tally.skipped += 1;
    Ok(())
}

async fn publish_cost_crossings(ctx: &Arc<WaveContext>, record: &RecordOutcome) {
    if record.crossed_soft {
        emit(
            ctx,
            EngineEvent::new(EventKind::CostSoftExceeded, ctx.run_id, ctx.masterplan_id)
                .with_wave(ctx.wave_index)
                .with_payload(serde_json::json!({ "accumulated": record.accumulated })),
        )
        .await;
    }
    if record.crossed_hard {
        emit(
            ctx,
            EngineEvent::new(EventKind::CostHardExceeded, ctx.run_id, ctx.masterplan_id)
                .with_wave(ctx.wave_index)
                .with_payload(serde_json::json!({ "accumulated": record.accumulated })),
        )
        .await;
    }
}

fn record_halt(ctx: &Arc<WaveContext>, store_error: StoreError) {
    let mut tally = ctx.tally.lock().expect("tally lock poisoned");
    if tally.halt.is_none() {
        tally.halt = Some(store_error);
    }
}

async fn emit(ctx: &Arc<WaveContext>, event: EngineEvent) {
    crate::engine::emit_event(&ctx.store, &ctx.sink, &event).await;
}

const PERSIST_RETRIES: u32 = 3;
const PERSIST_BACKOFF: Duration = Duration::from_millis(50);

async fn persist_atom_with_retry(ctx: &Arc<WaveContext>, atom: &Atom) -> Result<(), StoreError> {
    let mut delay = PERSIST_BACKOFF;
    for attempt in 1..=PERSIST_RETRIES {
        match ctx.store.update_atom(atom).await {
            Ok(()) => return Ok(()),
            Err(store_error) if attempt == PERSIST_RETRIES => return Err(store_error),
            Err(store_error) => {
                tracing::warn!(attempt, error = %store_error, "atom persist failed, retrying");
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
        }
    }
    unreachable!("retry loop always returns")
}

async fn record_terminal_with_retry(
    ctx: &Arc<WaveContext>,
    atom: &Atom,
    cost: f64,
    event: &EngineEvent,
) -> Result<(), StoreError> {
    let mut delay = PERSIST_BACKOFF;
    for attempt in 1..=PERSIST_RETRIES {
        match ctx.store.record_atom_terminal(atom, cost, event).await {
            Ok(outbox_id) => {
                ctx.sink.publish(event).await;
                if let Err(store_error) = ctx.store.mark_published(outbox_id).await {
                    tracing::warn!(error = %store_error, "failed to mark event published");
                }
                return Ok(());
            }
            Err(store_error) if attempt == PERSIST_RETRIES => return Err(store_error),
            Err(store_error) => {
                tracing::warn!(attempt, error = %store_error, "terminal persist failed, retrying");
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
        }
    }
    unreachable!("retry loop always returns")
}
