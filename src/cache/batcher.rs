// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Tumbling-window prompt batcher.
//!
//! Concurrent submissions inside one window are concatenated with a sentinel
//! separator and dispatched as a single generator call; the response is
//! split along the sentinel and routed back to the waiters in arrival
//! order. One submit always produces exactly one completion.
//!
//! A batch only ever mixes requests with the same model and quantized
//! temperature; a submission with different parameters flushes the open
//! batch and starts a new one. A response that does not split into exactly
//! the batch size fails every waiter: routing a misaligned split would
//! hand atoms each other's code.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, Mutex};
use uuid::Uuid;

use crate::observability::{EngineEvent, EventKind, MetricsRegistry};
use crate::traits::{EventSink, FailureKind, Generator, GeneratorFailure, GeneratorOutput, GeneratorRequest, TokenUsage};

/// Separator between batched prompts and between answer sections.
pub const BATCH_SENTINEL: &str = "\n=====8<===== SECTION BREAK =====8<=====\n";

struct Pending {
    prompt: String,
    tx: oneshot::Sender<Result<GeneratorOutput, GeneratorFailure>>,
}

struct OpenBatch {
    pending: Vec<Pending>,
    model: String,
    quantized_temperature: i64,
    temperature: f64,
    deadline: Duration,
}

struct State {
    open: Option<OpenBatch>,
    epoch: u64,
}

struct EventContext {
    sink: Arc<dyn EventSink>,
    run_id: Uuid,
    masterplan_id: Uuid,
}

pub struct RequestBatcher {
    generator: Arc<dyn Generator>,
    window: Duration,
    max_size: usize,
    state: Mutex<State>,
    metrics: MetricsRegistry,
    events: Option<EventContext>,
}

impl RequestBatcher {
    pub fn new(
        generator: Arc<dyn Generator>,
        window: Duration,
        max_size: usize,
        metrics: MetricsRegistry,
    ) -> Arc<Self> {
        Arc::new(Self {
            generator,
            window,
            max_size: max_size.max(1),
            state: Mutex::new(State { open: None, epoch: 0 }),
            metrics,
            events: None,
        })
    }

    /// Attach a run identity so flushes publish `batch_flushed` events.
    pub fn with_events(
        generator: Arc<dyn Generator>,
        window: Duration,
        max_size: usize,
        metrics: MetricsRegistry,
        sink: Arc<dyn EventSink>,
        run_id: Uuid,
        masterplan_id: Uuid,
    ) -> Arc<Self> {
        Arc::new(Self {
            generator,
            window,
            max_size: max_size.max(1),
            state: Mutex::new(State { open: None, epoch: 0 }),
            metrics,
            events: Some(EventContext {
                sink,
                run_id,
                masterplan_id,
            }),
        })
    }

    /// Join the current window (or open a new one) and wait for this
    /// request's share of the batched response.
    pub async fn submit(
        self: &Arc<Self>,
        request: GeneratorRequest,
    ) -> Result<GeneratorOutput, GeneratorFailure> {
        let (tx, rx) = oneshot::channel();
        let quantized = (request.temperature * 100.0).round() as i64;

        let ready_to_flush = {
            let mut state = self.state.lock().await;

            // Parameter change closes the open window early.
            let mismatched = state
                .open
                .as_ref()
                .map(|open| open.model != request.model || open.quantized_temperature != quantized)
                .unwrap_or(false);
            let mut to_flush = None;
            if mismatched {
                to_flush = state.open.take();
                state.epoch += 1;
            }

            if state.open.is_none() {
                state.open = Some(OpenBatch {
                    pending: Vec::new(),
                    model: request.model.clone(),
                    quantized_temperature: quantized,
                    temperature: request.temperature,
                    deadline: request.deadline,
                });
                state.epoch += 1;
                let epoch = state.epoch;
                let batcher = self.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(batcher.window).await;
                    batcher.flush_epoch(epoch).await;
                });
            }

            let open = state.open.as_mut().expect("batch was just opened");
            open.deadline = open.deadline.max(request.deadline);
            open.pending.push(Pending {
                prompt: request.prompt,
                tx,
            });

            if open.pending.len() >= self.max_size {
                let full = state.open.take();
                state.epoch += 1;
                match (to_flush, full) {
                    (Some(a), Some(b)) => Some(vec![a, b]),
                    (Some(a), None) => Some(vec![a]),
                    (None, Some(b)) => Some(vec![b]),
                    (None, None) => None,
                }
            } else {
                to_flush.map(|b| vec![b])
            }
        };

        if let Some(batches) = ready_to_flush {
            for batch in batches {
                let batcher = self.clone();
                tokio::spawn(async move { batcher.flush(batch).await });
            }
        }

        rx.await.unwrap_or_else(|_| {
            Err(GeneratorFailure::new(
                FailureKind::TransportError,
                "batch was dropped before completion",
            ))
        })
    }

    /// Window timer: flush only if the batch it armed for is still open.
    async fn flush_epoch(self: &Arc<Self>, epoch: u64) {
        let batch = {
            let mut state = self.state.lock().await;
            if state.epoch != epoch {
                return;
            }
            state.epoch += 1;
            state.open.take()
        };
        if let Some(batch) = batch {
            self.flush(batch).await;
        }
    }

    async fn flush(&self, batch: OpenBatch) {
        let size = batch.pending.len();
        if size == 0 {
            return;
        }
        self.metrics.observe("batch_size", &[], size as f64);
        if let Some(events) = &self.events {
            let event =
                EngineEvent::new(EventKind::BatchFlushed, events.run_id, events.masterplan_id)
                    .with_payload(serde_json::json!({ "batch_size": size }));
            events.sink.publish(&event).await;
        }

        let combined = batch
            .pending
            .iter()
            .map(|p| p.prompt.as_str())
            .collect::<Vec<_>>()
            .join(BATCH_SENTINEL);
        let request = GeneratorRequest {
            prompt: combined,
            model: batch.model,
            temperature: batch.temperature,
            deadline: batch.deadline,
        };

        match self.generator.invoke(request).await {
            Ok(output) => {
                let parts: Vec<&str> = output.text.split(BATCH_SENTINEL).collect();
                if parts.len() != size {
                    let failure = GeneratorFailure::new(
                        FailureKind::ContractMismatch,
                        format!("batched response split into {} parts for {} prompts", parts.len(), size),
                    );
                    for pending in batch.pending {
                        let mut each = failure.clone();
                        each.cost_usd = output.cost_usd / size as f64;
                        let _ = pending.tx.send(Err(each));
                    }
                    return;
                }
                tracing::debug!(batch_size = size, "batch flushed");
                let share = output.cost_usd / size as f64;
                let usage_share = TokenUsage {
                    in_tokens: output.usage.in_tokens / size as u64,
                    out_tokens: output.usage.out_tokens / size as u64,
                };
                for (pending, part) in batch.pending.into_iter().zip(parts) {
                    let _ = pending.tx.send(Ok(GeneratorOutput {
                        text: part.trim_matches('\n').to_string(),
                        usage: usage_share,
                        cost_usd: share,
                    }));
                }
            }
            Err(failure) => {
                let share = failure.cost_usd / size as f64;
                for pending in batch.pending {
                    let mut each = failure.clone();
                    each.cost_usd = share;
                    let _ = pending.tx.send(Err(each));
                }
            }
        }
    }
}
