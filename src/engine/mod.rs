// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

pub mod confidence;
pub mod cost;
pub mod gate;
pub mod queue;
pub mod retry;
pub mod service;
pub mod wave_executor;

#[cfg(test)]
mod integration_tests;

pub use gate::{AcceptanceGate, GateReport};
pub use service::{ExecutionService, RunReport, StartOutcome};
pub use wave_executor::{WaveExecutor, WaveOutcome};

use std::sync::Arc;

use crate::observability::EngineEvent;
use crate::traits::{EventSink, StateStore};

/// Emit one event through the outbox: append, publish, mark published.
/// If the outbox append fails the event is still published best-effort.
pub(crate) async fn emit_event(
    store: &Arc<dyn StateStore>,
    sink: &Arc<dyn EventSink>,
    event: &EngineEvent,
) {
    match store.append_outbox(event).await {
        Ok(outbox_id) => {
            sink.publish(event).await;
            if let Err(store_error) = store.mark_published(outbox_id).await {
                tracing::warn!(error = %store_error, "failed to mark event published");
            }
        }
        Err(store_error) => {
            tracing::warn!(error = %store_error, "event outbox append failed");
            sink.publish(event).await;
        }
    }
}
