// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Observability: the structured event contract, in-process metrics, and
//! message types for diagnostic logging.
//!
//! Events are the engine's public telemetry surface and flow through the
//! `EventSink` trait plus the persistence outbox. Metrics are in-process
//! counters and histograms. Log messages follow a struct-with-`Display`
//! pattern so operational strings live in one place.

pub mod events;
pub mod messages;
pub mod metrics;

pub use events::{EngineEvent, EventKind};
pub use metrics::MetricsRegistry;
