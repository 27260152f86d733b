// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Acceptance gate: decides whether execution may advance past a checkpoint.
//!
//! Gate math: `gate_passed = must_rate >= must_threshold AND should_rate >=
//! should_threshold` (defaults 1.0 and 0.95). `can_release` is the weaker
//! condition, every `must` passing, which allows release even when `should`
//! coverage falls short. Timeouts and runner errors count as failures.
//!
//! Test execution is parallel across distinct test ids and sequential within
//! a duplicated id. A runner that ignores its timeout budget is cut off here
//! and scored as `Timeout`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use uuid::Uuid;

use crate::model::{AcceptanceResult, AcceptanceTest, TestPriority, TestStatus};
use crate::observability::MetricsRegistry;
use crate::traits::AcceptanceRunner;

/// Full gate verdict plus the per-test evidence behind it.
#[derive(Debug, Clone)]
pub struct GateReport {
    pub gate_passed: bool,
    pub can_release: bool,
    pub must_rate: f64,
    pub should_rate: f64,
    pub results: Vec<AcceptanceResult>,
    pub summary: String,
}

pub struct AcceptanceGate {
    runner: Arc<dyn AcceptanceRunner>,
    must_threshold: f64,
    should_threshold: f64,
    metrics: MetricsRegistry,
}

impl AcceptanceGate {
    pub fn new(
        runner: Arc<dyn AcceptanceRunner>,
        must_threshold: f64,
        should_threshold: f64,
        metrics: MetricsRegistry,
    ) -> Self {
        Self {
            runner,
            must_threshold,
            should_threshold,
            metrics,
        }
    }

    /// Run every registered test and compute the gate verdict.
    ///
    /// An empty test set passes vacuously: both rates are 1.0.
    pub async fn check_gate(
        &self,
        tests: &[AcceptanceTest],
        wave_index: Option<usize>,
    ) -> GateReport {
        let mut groups: HashMap<Uuid, Vec<AcceptanceTest>> = HashMap::new();
        for test in tests {
            groups.entry(test.id).or_default().push(test.clone());
        }

        let mut join_set = JoinSet::new();
        for (_, group) in groups {
            let runner = self.runner.clone();
            join_set.spawn(async move {
                let mut outputs = Vec::with_capacity(group.len());
                // Same test id runs sequentially; distinct ids in parallel.
                for test in group {
                    let budget = Duration::from_secs(test.timeout_seconds.max(1));
                    let output = match tokio::time::timeout(budget, runner.run(&test)).await {
                        Ok(output) => output,
                        Err(_) => crate::traits::RunOutput {
                            status: TestStatus::Timeout,
                            duration_ms: budget.as_millis() as u64,
                            stdout: String::new(),
                            stderr: String::new(),
                            error_message: Some(format!(
                                "test exceeded {}s budget",
                                test.timeout_seconds
                            )),
                        },
                    };
                    outputs.push((test, output));
                }
                outputs
            });
        }

        let mut results = Vec::new();
        let mut priorities: HashMap<Uuid, TestPriority> = HashMap::new();
        while let Some(joined) = join_set.join_next().await {
            let outputs = match joined {
                Ok(outputs) => outputs,
                Err(join_error) => {
                    tracing::error!(error = %join_error, "acceptance test task panicked");
                    continue;
                }
            };
            for (test, output) in outputs {
                priorities.insert(test.id, test.priority);
                self.metrics.incr(
                    status_metric(output.status),
                    &[("priority", priority_label(test.priority))],
                );
                results.push(AcceptanceResult {
                    id: Uuid::new_v4(),
                    test_id: test.id,
                    wave_index,
                    status: output.status,
                    duration_ms: output.duration_ms,
                    stdout: output.stdout,
                    stderr: output.stderr,
                    error_message: output.error_message,
                });
            }
        }

        // Stable ordering for reports and stored results.
        results.sort_by_key(|r| r.test_id);

        let (must_pass, must_total) = rate_for(&results, &priorities, TestPriority::Must);
        let (should_pass, should_total) = rate_for(&results, &priorities, TestPriority::Should);
        let must_rate = if must_total == 0 { 1.0 } else { must_pass as f64 / must_total as f64 };
        let should_rate = if should_total == 0 {
            1.0
        } else {
            should_pass as f64 / should_total as f64
        };

        let gate_passed = must_rate >= self.must_threshold && should_rate >= self.should_threshold;
        let can_release = must_rate >= self.must_threshold;

        self.metrics
            .incr(if gate_passed { "gate_passed_total" } else { "gate_failed_total" }, &[]);

        let summary = format!(
            "{}/{} must passed ({:.1}%), {}/{} should passed ({:.1}%): gate {}{}",
            must_pass,
            must_total,
            must_rate * 100.0,
            should_pass,
            should_total,
            should_rate * 100.0,
            if gate_passed { "PASSED" } else { "BLOCKED" },
            if !gate_passed && can_release { " (releasable: all must tests pass)" } else { "" },
        );

        GateReport {
            gate_passed,
            can_release,
            must_rate,
            should_rate,
            results,
            summary,
        }
    }
}

fn rate_for(
    results: &[AcceptanceResult],
    priorities: &HashMap<Uuid, TestPriority>,
    priority: TestPriority,
) -> (usize, usize) {
    let of_priority: Vec<&AcceptanceResult> = results
        .iter()
        .filter(|r| priorities.get(&r.test_id) == Some(&priority))
        .collect();
    let passed = of_priority.iter().filter(|r| !r.status.counts_as_fail()).count();
    (passed, of_priority.len())
}

fn status_metric(status: TestStatus) -> &'static str {
    match status {
        TestStatus::Pass => "acceptance_pass_total",
        TestStatus::Fail => "acceptance_fail_total",
        TestStatus::Timeout => "acceptance_timeout_total",
        TestStatus::Error => "acceptance_error_total",
    }
}

fn priority_label(priority: TestPriority) -> &'static str {
    match priority {
        TestPriority::Must => "must",
        TestPriority::Should => "should",
    }
}
