// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::cache::retrieval_key;
use crate::observability::MetricsRegistry;

/// Retrieval targets volatile corpora; entries go stale quickly.
pub const DEFAULT_RETRIEVAL_TTL: Duration = Duration::from_secs(60 * 60);

/// Minimum cosine similarity for the fallback lookup to count as a hit.
pub const SIMILARITY_FLOOR: f64 = 0.95;

struct StoredRetrieval {
    results: Vec<String>,
    embedding: Option<Vec<f32>>,
    masterplan_id: Uuid,
    stored_at: Instant,
}

/// Retrieval cache: exact hash lookup first, then a linear cosine scan over
/// the masterplan's stored embeddings. The similarity path only runs on a
/// miss; its cost is O(entries) for that masterplan.
pub struct RetrievalCache {
    entries: Mutex<HashMap<String, StoredRetrieval>>,
    ttl: Duration,
    metrics: MetricsRegistry,
}

impl RetrievalCache {
    pub fn new(ttl: Duration, metrics: MetricsRegistry) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
            metrics,
        }
    }

    pub fn get(
        &self,
        masterplan_id: Uuid,
        query: &str,
        top_k: usize,
        embedding: Option<&[f32]>,
    ) -> Option<Vec<String>> {
        let key = retrieval_key(query, top_k);
        let mut entries = self.entries.lock().expect("retrieval cache lock poisoned");
        entries.retain(|_, stored| stored.stored_at.elapsed() < self.ttl);

        if let Some(stored) = entries.get(&key) {
            self.metrics.incr("cache_hits_total", &[("layer", "retrieval")]);
            return Some(stored.results.clone());
        }

        // Similarity fallback: nearest stored embedding above the floor.
        if let Some(query_embedding) = embedding {
            let mut best: Option<(f64, &StoredRetrieval)> = None;
            for stored in entries.values() {
                if stored.masterplan_id != masterplan_id {
                    continue;
                }
                let Some(stored_embedding) = &stored.embedding else {
                    continue;
                };
                let similarity = cosine(query_embedding, stored_embedding);
                if similarity >= SIMILARITY_FLOOR
                    && best.map(|(s, _)| similarity > s).unwrap_or(true)
                {
                    best = Some((similarity, stored));
                }
            }
            if let Some((_, stored)) = best {
                self.metrics.incr("cache_hits_total", &[("layer", "retrieval")]);
                return Some(stored.results.clone());
            }
        }

        self.metrics.incr("cache_misses_total", &[("layer", "retrieval")]);
        None
    }

    pub fn put(
        &self,
        masterplan_id: Uuid,
        query: &str,
        top_k: usize,
        results: Vec<String>,
        embedding: Option<Vec<f32>>,
    ) {
        let key = retrieval_key(query, top_k);
        self.metrics.incr("cache_writes_total", &[("layer", "retrieval")]);
        self.entries
            .lock()
            .expect("retrieval cache lock poisoned")
            .insert(
                key,
                StoredRetrieval {
                    results,
                    embedding,
                    masterplan_id,
                    stored_at: Instant::now(),
                },
            );
    }

    pub fn invalidate_masterplan(&self, masterplan_id: Uuid) {
        self.entries
            .lock()
            .expect("retrieval cache lock poisoned")
            .retain(|_, stored| stored.masterplan_id != masterplan_id);
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (&x, &y) in a.iter().zip(b.iter()) {
        dot += f64::from(x) * f64::from(y);
        norm_a += f64::from(x) * f64::from(x);
        norm_b += f64::from(y) * f64::from(y);
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}
