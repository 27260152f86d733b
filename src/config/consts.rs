// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

/// Default worker parallelism across a run.
pub const DEFAULT_GLOBAL_PARALLELISM: usize = 16;
/// Waves larger than this are split into consecutive chunks.
pub const DEFAULT_MAX_WAVE_SIZE: usize = 100;
/// Retry budget per atom, including the first attempt.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
/// Annealing schedule; attempt k uses entry k-1 (last entry repeats).
pub const DEFAULT_TEMPERATURE_SCHEDULE: [f64; 3] = [0.7, 0.5, 0.3];
/// Backoff between attempts: base * 2^(attempt-1), jittered, capped.
pub const DEFAULT_BACKOFF_BASE_MS: u64 = 1_000;
pub const DEFAULT_BACKOFF_MAX_MS: u64 = 30_000;
/// Backpressure queue sizing.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;
pub const DEFAULT_QUEUE_THRESHOLD_PCT: u8 = 80;
/// Prompt batching window.
pub const DEFAULT_BATCH_WINDOW_MS: u64 = 500;
pub const DEFAULT_BATCH_MAX_SIZE: usize = 5;
/// Cost caps in USD.
pub const DEFAULT_COST_SOFT_USD: f64 = 50.0;
pub const DEFAULT_COST_HARD_USD: f64 = 100.0;
/// Acceptance gate thresholds.
pub const DEFAULT_GATE_MUST_THRESHOLD: f64 = 1.0;
pub const DEFAULT_GATE_SHOULD_THRESHOLD: f64 = 0.95;
/// Declared edges below this confidence are dropped at graph build.
pub const DEFAULT_EDGE_CONFIDENCE_FLOOR: f64 = 0.3;
/// Per-call generator deadline.
pub const DEFAULT_ATTEMPT_TIMEOUT_MS: u64 = 60_000;
/// How long a queued request may age before it is shed.
pub const DEFAULT_REQUEST_AGE_TIMEOUT_MS: u64 = 30_000;
/// Worker dequeue poll interval.
pub const DEFAULT_DEQUEUE_WAIT_MS: u64 = 500;
/// Bounded producer retry when the queue rejects at capacity.
pub const DEFAULT_ENQUEUE_RETRY_ATTEMPTS: u32 = 3;
pub const DEFAULT_ENQUEUE_RETRY_BACKOFF_MS: u64 = 100;
