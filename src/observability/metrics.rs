// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! In-process counters and histograms.
//!
//! Families published by the engine:
//!
//! * counters: `atoms_total{status}`, `attempts_total`, `retries_total`,
//!   `cost_usd_total{layer}`, `cache_{hits,misses,writes,errors}_total{layer}`,
//!   `queue_{enqueued,dequeued,rejected,expired}_total`,
//!   `acceptance_{pass,fail,timeout,error}_total{priority}`,
//!   `gate_{passed,failed}_total`
//! * histograms: `atom_duration_ms`, `wave_duration_ms`, `attempts_per_atom`,
//!   `batch_size`, `llm_request_duration_ms{cached}`

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Cloneable handle over a shared metrics store. Label sets are folded into
/// the key in deterministic order so `snapshot()` output is stable.
#[derive(Clone, Default)]
pub struct MetricsRegistry {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    counters: HashMap<String, f64>,
    histograms: HashMap<String, Vec<f64>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment a counter by one.
    pub fn incr(&self, name: &str, labels: &[(&str, &str)]) {
        self.add(name, labels, 1.0);
    }

    /// Add an arbitrary non-negative delta to a counter (e.g. cost in USD).
    pub fn add(&self, name: &str, labels: &[(&str, &str)], delta: f64) {
        let key = Self::key(name, labels);
        let mut inner = self.inner.lock().expect("metrics lock poisoned");
        *inner.counters.entry(key).or_insert(0.0) += delta;
    }

    /// Record one observation into a histogram.
    pub fn observe(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        let key = Self::key(name, labels);
        let mut inner = self.inner.lock().expect("metrics lock poisoned");
        inner.histograms.entry(key).or_default().push(value);
    }

    /// Current value of a counter, zero if never touched.
    pub fn counter(&self, name: &str, labels: &[(&str, &str)]) -> f64 {
        let key = Self::key(name, labels);
        let inner = self.inner.lock().expect("metrics lock poisoned");
        inner.counters.get(&key).copied().unwrap_or(0.0)
    }

    /// Number of observations recorded into a histogram.
    pub fn histogram_count(&self, name: &str, labels: &[(&str, &str)]) -> usize {
        let key = Self::key(name, labels);
        let inner = self.inner.lock().expect("metrics lock poisoned");
        inner.histograms.get(&key).map(|v| v.len()).unwrap_or(0)
    }

    /// Sorted dump of all counters, for the status command and tests.
    pub fn snapshot(&self) -> Vec<(String, f64)> {
        let inner = self.inner.lock().expect("metrics lock poisoned");
        let mut out: Vec<(String, f64)> = inner
            .counters
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    fn key(name: &str, labels: &[(&str, &str)]) -> String {
        if labels.is_empty() {
            return name.to_string();
        }
        let mut pairs: Vec<(&str, &str)> = labels.to_vec();
        pairs.sort();
        let rendered: Vec<String> = pairs.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        format!("{}{{{}}}", name, rendered.join(","))
    }
}
