// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::cache::prompt_key;
use crate::observability::MetricsRegistry;

/// Prompt responses live a long time; identical prompts at identical
/// temperature are deterministic enough to reuse for a day.
pub const DEFAULT_PROMPT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

struct StoredResponse {
    response: String,
    /// Credited to the savings total every time this entry is served;
    /// set at write time to the cost of the call that produced it.
    cost_saved_on_hit: f64,
    masterplan_id: Uuid,
    stored_at: Instant,
}

/// Exact-match prompt cache, tagged by masterplan for bulk invalidation.
pub struct PromptCache {
    entries: Mutex<HashMap<String, StoredResponse>>,
    ttl: Duration,
    cost_saved: Mutex<f64>,
    metrics: MetricsRegistry,
}

impl PromptCache {
    pub fn new(ttl: Duration, metrics: MetricsRegistry) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
            cost_saved: Mutex::new(0.0),
            metrics,
        }
    }

    /// Look up a response. A hit credits the entry's `cost_saved_on_hit`
    /// to the running total of spend the cache avoided.
    pub fn get(&self, model: &str, temperature: f64, prompt: &str) -> Option<String> {
        let key = prompt_key(model, temperature, prompt);
        let mut entries = self.entries.lock().expect("prompt cache lock poisoned");
        match entries.get(&key) {
            Some(stored) if stored.stored_at.elapsed() < self.ttl => {
                self.metrics.incr("cache_hits_total", &[("layer", "prompt")]);
                *self.cost_saved.lock().expect("cost_saved lock poisoned") +=
                    stored.cost_saved_on_hit;
                Some(stored.response.clone())
            }
            Some(_) => {
                // Expired: drop eagerly and report a miss.
                entries.remove(&key);
                self.metrics.incr("cache_misses_total", &[("layer", "prompt")]);
                None
            }
            None => {
                self.metrics.incr("cache_misses_total", &[("layer", "prompt")]);
                None
            }
        }
    }

    /// Store a response after a successful generator call. Idempotent by
    /// key: re-writing an existing entry refreshes it.
    pub fn put(
        &self,
        model: &str,
        temperature: f64,
        prompt: &str,
        response: String,
        cost_saved_on_hit: f64,
        masterplan_id: Uuid,
    ) {
        let key = prompt_key(model, temperature, prompt);
        self.metrics.incr("cache_writes_total", &[("layer", "prompt")]);
        self.entries
            .lock()
            .expect("prompt cache lock poisoned")
            .insert(
                key,
                StoredResponse {
                    response,
                    cost_saved_on_hit,
                    masterplan_id,
                    stored_at: Instant::now(),
                },
            );
    }

    /// Drop every entry tagged with the masterplan; called when the plan
    /// mutates and cached generations may no longer apply.
    pub fn invalidate_masterplan(&self, masterplan_id: Uuid) {
        self.entries
            .lock()
            .expect("prompt cache lock poisoned")
            .retain(|_, stored| stored.masterplan_id != masterplan_id);
    }

    /// Total estimated spend avoided by hits.
    pub fn cost_saved(&self) -> f64 {
        *self.cost_saved.lock().expect("cost_saved lock poisoned")
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("prompt cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
