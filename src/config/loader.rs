// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::config::consts::*;
use crate::errors::CostError;
use crate::model::Complexity;

/// Engine configuration, typically loaded from a YAML file.
///
/// Every field has a default, so an empty document is a valid configuration.
///
/// # Example
/// ```yaml
/// global_parallelism: 8
/// max_attempts: 3
/// temperature_schedule: [0.7, 0.5, 0.3]
/// cost_soft_usd: 50
/// cost_hard_usd: 100
/// gate_policy: per_wave
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_global_parallelism")]
    pub global_parallelism: usize,
    #[serde(default = "default_max_wave_size")]
    pub max_wave_size: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_temperature_schedule")]
    pub temperature_schedule: Vec<f64>,
    /// Per-complexity schedule overrides; e.g. start critical atoms cooler.
    #[serde(default)]
    pub temperature_overrides: HashMap<Complexity, Vec<f64>>,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_queue_threshold_pct")]
    pub queue_threshold_pct: u8,
    #[serde(default = "default_batch_window_ms")]
    pub batch_window_ms: u64,
    #[serde(default = "default_batch_max_size")]
    pub batch_max_size: usize,
    #[serde(default = "default_cost_soft_usd")]
    pub cost_soft_usd: f64,
    #[serde(default = "default_cost_hard_usd")]
    pub cost_hard_usd: f64,
    /// Optional per-atom spend cap; exceeding it only warns.
    #[serde(default)]
    pub per_atom_cap_usd: Option<f64>,
    #[serde(default = "default_gate_must_threshold")]
    pub gate_must_threshold: f64,
    #[serde(default = "default_gate_should_threshold")]
    pub gate_should_threshold: f64,
    #[serde(default = "default_edge_confidence_floor")]
    pub edge_confidence_floor: f64,
    #[serde(default)]
    pub abort_on_critical_failure: bool,
    /// Where the acceptance gate runs: after every wave, or once at the end.
    #[serde(default)]
    pub gate_policy: GatePolicy,
    /// Model identifier forwarded to the generator.
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_attempt_timeout_ms")]
    pub attempt_timeout_ms: u64,
    #[serde(default = "default_request_age_timeout_ms")]
    pub request_age_timeout_ms: u64,
    #[serde(default = "default_dequeue_wait_ms")]
    pub dequeue_wait_ms: u64,
    #[serde(default = "default_enqueue_retry_attempts")]
    pub enqueue_retry_attempts: u32,
    #[serde(default = "default_enqueue_retry_backoff_ms")]
    pub enqueue_retry_backoff_ms: u64,
    /// Reset attempt counters when resuming failed atoms.
    #[serde(default = "default_true")]
    pub reset_attempts_on_resume: bool,
}

/// When the acceptance gate is consulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatePolicy {
    /// Gate after every wave; a failed gate stops the next wave.
    PerWave,
    /// Gate once, after the final wave.
    OnCompletion,
}

impl Default for GatePolicy {
    fn default() -> Self {
        GatePolicy::PerWave
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        // serde_yaml fills every field from its default fn.
        serde_yaml::from_str("{}").expect("empty config must deserialize")
    }
}

impl EngineConfig {
    /// Reject configurations the engine cannot honor. Zero caps are legal
    /// and refuse all positive spend.
    pub fn validate(&self) -> Result<(), CostError> {
        if self.cost_soft_usd < 0.0
            || self.cost_hard_usd < 0.0
            || self.cost_soft_usd > self.cost_hard_usd
        {
            return Err(CostError::InvalidLimits {
                soft: self.cost_soft_usd,
                hard: self.cost_hard_usd,
            });
        }
        if let Some(cap) = self.per_atom_cap_usd {
            if cap < 0.0 {
                return Err(CostError::InvalidLimits {
                    soft: cap,
                    hard: self.cost_hard_usd,
                });
            }
        }
        Ok(())
    }

    /// Temperature for a given attempt (1-based), honoring complexity
    /// overrides. The last schedule entry repeats for extra attempts.
    pub fn temperature_for(&self, complexity: Complexity, attempt: u32) -> f64 {
        let schedule = self
            .temperature_overrides
            .get(&complexity)
            .filter(|s| !s.is_empty())
            .unwrap_or(&self.temperature_schedule);
        let idx = (attempt.max(1) as usize - 1).min(schedule.len().saturating_sub(1));
        schedule.get(idx).copied().unwrap_or(0.5)
    }

    /// Queue threshold as an absolute item count.
    pub fn queue_threshold(&self) -> usize {
        ((self.queue_capacity as f64) * (self.queue_threshold_pct as f64) / 100.0).round() as usize
    }
}

fn default_global_parallelism() -> usize {
    DEFAULT_GLOBAL_PARALLELISM
}
fn default_max_wave_size() -> usize {
    DEFAULT_MAX_WAVE_SIZE
}
fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}
fn default_temperature_schedule() -> Vec<f64> {
    DEFAULT_TEMPERATURE_SCHEDULE.to_vec()
}
fn default_backoff_base_ms() -> u64 {
    DEFAULT_BACKOFF_BASE_MS
}
fn default_backoff_max_ms() -> u64 {
    DEFAULT_BACKOFF_MAX_MS
}
fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}
fn default_queue_threshold_pct() -> u8 {
    DEFAULT_QUEUE_THRESHOLD_PCT
}
fn default_batch_window_ms() -> u64 {
    DEFAULT_BATCH_WINDOW_MS
}
fn default_batch_max_size() -> usize {
    DEFAULT_BATCH_MAX_SIZE
}
fn default_cost_soft_usd() -> f64 {
    DEFAULT_COST_SOFT_USD
}
fn default_cost_hard_usd() -> f64 {
    DEFAULT_COST_HARD_USD
}
fn default_gate_must_threshold() -> f64 {
    DEFAULT_GATE_MUST_THRESHOLD
}
fn default_gate_should_threshold() -> f64 {
    DEFAULT_GATE_SHOULD_THRESHOLD
}
fn default_edge_confidence_floor() -> f64 {
    DEFAULT_EDGE_CONFIDENCE_FLOOR
}
fn default_model() -> String {
    "default".to_string()
}
fn default_attempt_timeout_ms() -> u64 {
    DEFAULT_ATTEMPT_TIMEOUT_MS
}
fn default_request_age_timeout_ms() -> u64 {
    DEFAULT_REQUEST_AGE_TIMEOUT_MS
}
fn default_dequeue_wait_ms() -> u64 {
    DEFAULT_DEQUEUE_WAIT_MS
}
fn default_enqueue_retry_attempts() -> u32 {
    DEFAULT_ENQUEUE_RETRY_ATTEMPTS
}
fn default_enqueue_retry_backoff_ms() -> u64 {
    DEFAULT_ENQUEUE_RETRY_BACKOFF_MS
}
fn default_true() -> bool {
    true
}

/// Load an engine config from a YAML file.
pub fn load_config<P: AsRef<Path>>(path: P) -> anyhow::Result<EngineConfig> {
    let content = fs::read_to_string(path)?;
    let cfg: EngineConfig = serde_yaml::from_str(&content)?;
    cfg.validate()?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_spec_defaults() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.global_parallelism, 16);
        assert_eq!(cfg.max_wave_size, 100);
        assert_eq!(cfg.max_attempts, 3);
        assert_eq!(cfg.temperature_schedule, vec![0.7, 0.5, 0.3]);
        assert_eq!(cfg.backoff_base_ms, 1_000);
        assert_eq!(cfg.backoff_max_ms, 30_000);
        assert_eq!(cfg.queue_capacity, 256);
        assert_eq!(cfg.queue_threshold_pct, 80);
        assert_eq!(cfg.batch_window_ms, 500);
        assert_eq!(cfg.batch_max_size, 5);
        assert_eq!(cfg.cost_soft_usd, 50.0);
        assert_eq!(cfg.cost_hard_usd, 100.0);
        assert_eq!(cfg.gate_must_threshold, 1.0);
        assert_eq!(cfg.gate_should_threshold, 0.95);
        assert_eq!(cfg.edge_confidence_floor, 0.3);
        assert!(!cfg.abort_on_critical_failure);
        assert_eq!(cfg.gate_policy, GatePolicy::PerWave);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn queue_threshold_rounds() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.queue_threshold(), 205); // 256 * 0.80 = 204.8
    }

    #[test]
    fn soft_above_hard_is_rejected() {
        let mut cfg = EngineConfig::default();
        cfg.cost_soft_usd = 200.0;
        assert!(matches!(cfg.validate(), Err(CostError::InvalidLimits { .. })));
    }

    #[test]
    fn temperature_schedule_anneals_and_clamps() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.temperature_for(Complexity::Medium, 1), 0.7);
        assert_eq!(cfg.temperature_for(Complexity::Medium, 2), 0.5);
        assert_eq!(cfg.temperature_for(Complexity::Medium, 3), 0.3);
        // Beyond the schedule, the last entry repeats.
        assert_eq!(cfg.temperature_for(Complexity::Medium, 7), 0.3);
    }

    #[test]
    fn critical_override_takes_precedence() {
        let yaml = r#"
temperature_overrides:
  critical: [0.5, 0.3, 0.2]
"#;
        let cfg: EngineConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.temperature_for(Complexity::Critical, 1), 0.5);
        assert_eq!(cfg.temperature_for(Complexity::High, 1), 0.7);
    }

    #[test]
    fn partial_yaml_overrides_only_named_keys() {
        let yaml = "global_parallelism: 4\ncost_hard_usd: 15\ncost_soft_usd: 10\n";
        let cfg: EngineConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.global_parallelism, 4);
        assert_eq!(cfg.cost_soft_usd, 10.0);
        assert_eq!(cfg.cost_hard_usd, 15.0);
        assert_eq!(cfg.max_wave_size, 100);
    }
}
