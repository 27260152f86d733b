// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Bounded retry of a single atom with temperature annealing and failure
//! feedback.
//!
//! Attempt k uses the k-th entry of the temperature schedule and carries a
//! feedback addendum composed from attempt k-1's failure (kind, truncated
//! stderr, failing acceptance names). Feedback never accumulates across more
//! than one attempt. Between attempts the orchestrator sleeps
//! `base × 2^(attempt-1)` with ±20 % jitter, capped at the configured
//! maximum.
//!
//! Fatal failure kinds stop the loop immediately; every other kind retries
//! until the attempt budget runs out.
//!
//! Cancellation is cooperative: an in-flight generator call is allowed to
//! finish, but its result is discarded, the atom reports `Cancelled`, and
//! any cost already incurred stays recorded.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::model::Atom;
use crate::traits::{FailureKind, Generator, GeneratorFailure, GeneratorOutput, GeneratorRequest};

/// Stderr folded into feedback is truncated to this many bytes.
const FEEDBACK_STDERR_LIMIT: usize = 2_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptStatus {
    Succeeded,
    Failed,
    Cancelled,
}

/// Aggregate result of running one atom through its attempt budget.
#[derive(Debug)]
pub struct RetryOutcome {
    pub status: AttemptStatus,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    pub last_error_kind: Option<FailureKind>,
    pub total_duration_ms: u64,
    /// Cost of every attempt, including failed and discarded ones.
    pub total_cost: f64,
    pub output: Option<GeneratorOutput>,
}

impl RetryOutcome {
    /// Fraction of attempts that passed validation; at most one can.
    pub fn validation_pass_rate(&self) -> f64 {
        if self.attempt_count == 0 {
            return 0.0;
        }
        let passes = if self.status == AttemptStatus::Succeeded { 1.0 } else { 0.0 };
        passes / f64::from(self.attempt_count)
    }
}

pub struct RetryOrchestrator {
    config: Arc<EngineConfig>,
    generator: Arc<dyn Generator>,
}

impl RetryOrchestrator {
    pub fn new(config: Arc<EngineConfig>, generator: Arc<dyn Generator>) -> Self {
        Self { config, generator }
    }

    /// Drive one atom to a terminal attempt status.
    ///
    /// `failing_acceptance` names tests known to be failing for this
    /// masterplan; they ride along in the feedback addendum.
    pub async fn run(
        &self,
        atom: &Atom,
        failing_acceptance: &[String],
        cancel: &CancellationToken,
    ) -> RetryOutcome {
        let started = Instant::now();
        let mut total_cost = 0.0;
        let mut feedback: Option<String> = None;
        let mut last_failure: Option<GeneratorFailure> = None;
        let max_attempts = self.config.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            if cancel.is_cancelled() {
                return self.finish(
                    AttemptStatus::Cancelled,
                    attempt - 1,
                    last_failure,
                    total_cost,
                    started,
                    None,
                );
            }

            let temperature = self.config.temperature_for(atom.complexity, attempt);
            let prompt = match &feedback {
                Some(addendum) => format!("{}\n\n{}", atom.prompt, addendum),
                None => atom.prompt.clone(),
            };
            let request = GeneratorRequest {
                prompt,
                model: self.config.model.clone(),
                temperature,
                deadline: Duration::from_millis(self.config.attempt_timeout_ms),
            };

            let result = self.invoke_with_deadline(request).await;

            match result {
                Ok(output) => {
                    total_cost += output.cost_usd;
                    if cancel.is_cancelled() {
                        // The call was allowed to finish; the result is
                        // discarded but its cost is not.
                        return self.finish(
                            AttemptStatus::Cancelled,
                            attempt,
                            last_failure,
                            total_cost,
                            started,
                            None,
                        );
                    }
                    return self.finish(
                        AttemptStatus::Succeeded,
                        attempt,
                        None,
                        total_cost,
                        started,
                        Some(output),
                    );
                }
                Err(failure) => {
                    total_cost += failure.cost_usd;
                    tracing::debug!(
                        atom_id = %atom.id,
                        attempt,
                        kind = failure.kind.as_str(),
                        "generation attempt failed: {}",
                        failure.message
                    );
                    if failure.kind.is_fatal() || attempt == max_attempts {
                        return self.finish(
                            AttemptStatus::Failed,
                            attempt,
                            Some(failure),
                            total_cost,
                            started,
                            None,
                        );
                    }
                    feedback = Some(compose_feedback(attempt, &failure, failing_acceptance));
                    last_failure = Some(failure);
                }
            }

            let delay = jittered_backoff(
                attempt,
                self.config.backoff_base_ms,
                self.config.backoff_max_ms,
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => {
                    return self.finish(
                        AttemptStatus::Cancelled,
                        attempt,
                        last_failure,
                        total_cost,
                        started,
                        None,
                    );
                }
            }
        }

        // max_attempts >= 1, so the loop always returns before this point.
        self.finish(AttemptStatus::Failed, max_attempts, last_failure, total_cost, started, None)
    }

    /// A generator that ignores its deadline still gets cut off here, and
    /// the overrun is classified as a timeout.
    async fn invoke_with_deadline(
        &self,
        request: GeneratorRequest,
    ) -> Result<GeneratorOutput, GeneratorFailure> {
        let deadline = request.deadline;
        match tokio::time::timeout(deadline, self.generator.invoke(request)).await {
            Ok(result) => result,
            Err(_) => Err(GeneratorFailure::new(
                FailureKind::Timeout,
                format!("generator exceeded {:?} deadline", deadline),
            )),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn finish(
        &self,
        status: AttemptStatus,
        attempt_count: u32,
        last_failure: Option<GeneratorFailure>,
        total_cost: f64,
        started: Instant,
        output: Option<GeneratorOutput>,
    ) -> RetryOutcome {
        RetryOutcome {
            status,
            attempt_count,
            last_error: last_failure.as_ref().map(|f| f.message.clone()),
            last_error_kind: last_failure.map(|f| f.kind),
            total_duration_ms: started.elapsed().as_millis() as u64,
            total_cost,
            output,
        }
    }
}

/// Backoff before the next attempt: `base × 2^(attempt-1)`, ±20 % jitter,
/// capped at `max_ms`.
pub fn jittered_backoff(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    let exponential = base_ms.saturating_mul(1u64 << (attempt.saturating_sub(1)).min(20));
    let capped = exponential.min(max_ms);
    let factor = rand::thread_rng().gen_range(0.8..=1.2);
    let jittered = ((capped as f64) * factor) as u64;
    Duration::from_millis(jittered.min(max_ms))
}

fn compose_feedback(attempt: u32, failure: &GeneratorFailure, failing_acceptance: &[String]) -> String {
    let mut addendum = format!(
        "Previous attempt {} failed ({}): {}",
        attempt,
        failure.kind.as_str(),
        failure.message
    );
    if !failure.stderr.is_empty() {
        let truncated: String = failure.stderr.chars().take(FEEDBACK_STDERR_LIMIT).collect();
        addendum.push_str("\nstderr:\n");
        addendum.push_str(&truncated);
    }
    if !failing_acceptance.is_empty() {
        addendum.push_str("\nFailing acceptance tests: ");
        addendum.push_str(&failing_acceptance.join(", "));
    }
    addendum.push_str("\nAddress the failure above and regenerate the full output.");
    addendum
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Complexity;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use uuid::Uuid;

    /// Scripted generator: pops one canned result per call and records the
    /// requests it saw.
    struct ScriptedGenerator {
        script: Mutex<Vec<Result<GeneratorOutput, GeneratorFailure>>>,
        requests: Mutex<Vec<GeneratorRequest>>,
    }

    impl ScriptedGenerator {
        fn new(script: Vec<Result<GeneratorOutput, GeneratorFailure>>) -> Self {
            let mut reversed = script;
            reversed.reverse();
            Self {
                script: Mutex::new(reversed),
                requests: Mutex::new(Vec::new()),
            }
        }

        fn seen(&self) -> Vec<GeneratorRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Generator for ScriptedGenerator {
        async fn invoke(
            &self,
            request: GeneratorRequest,
        ) -> Result<GeneratorOutput, GeneratorFailure> {
            self.requests.lock().unwrap().push(request);
            self.script
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Err(GeneratorFailure::new(FailureKind::Other, "script empty")))
        }
    }

    fn ok_output(cost: f64) -> GeneratorOutput {
        GeneratorOutput {
            text: "generated".into(),
            usage: Default::default(),
            cost_usd: cost,
        }
    }

    fn transient(message: &str) -> GeneratorFailure {
        GeneratorFailure::new(FailureKind::ValidationFail, message)
    }

    fn fast_config() -> Arc<EngineConfig> {
        let mut cfg = EngineConfig::default();
        cfg.backoff_base_ms = 1;
        cfg.backoff_max_ms = 4;
        Arc::new(cfg)
    }

    fn atom() -> Atom {
        let mut atom = Atom::new(Uuid::new_v4(), Complexity::Medium, 1.0);
        atom.prompt = "write the module".into();
        atom
    }

    #[tokio::test]
    async fn succeeds_first_attempt() {
        let generator = Arc::new(ScriptedGenerator::new(vec![Ok(ok_output(0.5))]));
        let orchestrator = RetryOrchestrator::new(fast_config(), generator.clone());

        let outcome = orchestrator
            .run(&atom(), &[], &CancellationToken::new())
            .await;
        assert_eq!(outcome.status, AttemptStatus::Succeeded);
        assert_eq!(outcome.attempt_count, 1);
        assert_eq!(outcome.total_cost, 0.5);
        assert_eq!(outcome.validation_pass_rate(), 1.0);
        assert_eq!(generator.seen()[0].temperature, 0.7);
    }

    #[tokio::test]
    async fn anneals_temperature_and_succeeds_on_third() {
        let generator = Arc::new(ScriptedGenerator::new(vec![
            Err(transient("bad imports")),
            Err(transient("still bad")),
            Ok(ok_output(0.2)),
        ]));
        let orchestrator = RetryOrchestrator::new(fast_config(), generator.clone());

        let outcome = orchestrator
            .run(&atom(), &[], &CancellationToken::new())
            .await;
        assert_eq!(outcome.status, AttemptStatus::Succeeded);
        assert_eq!(outcome.attempt_count, 3);

        let temps: Vec<f64> = generator.seen().iter().map(|r| r.temperature).collect();
        assert_eq!(temps, vec![0.7, 0.5, 0.3]);
    }

    #[tokio::test]
    async fn feedback_carries_only_latest_failure() {
        let generator = Arc::new(ScriptedGenerator::new(vec![
            Err(transient("first failure")),
            Err(transient("second failure")),
            Ok(ok_output(0.1)),
        ]));
        let orchestrator = RetryOrchestrator::new(fast_config(), generator.clone());

        orchestrator
            .run(&atom(), &["must_compile".into()], &CancellationToken::new())
            .await;

        let requests = generator.seen();
        assert!(!requests[0].prompt.contains("failure"));
        assert!(requests[1].prompt.contains("first failure"));
        assert!(requests[1].prompt.contains("must_compile"));
        // Attempt 3 sees attempt 2's failure, not attempt 1's.
        assert!(requests[2].prompt.contains("second failure"));
        assert!(!requests[2].prompt.contains("first failure"));
    }

    #[tokio::test]
    async fn fatal_failure_stops_immediately() {
        let generator = Arc::new(ScriptedGenerator::new(vec![Err(GeneratorFailure::new(
            FailureKind::SchemaInvalid,
            "schema broken",
        ))]));
        let orchestrator = RetryOrchestrator::new(fast_config(), generator.clone());

        let outcome = orchestrator
            .run(&atom(), &[], &CancellationToken::new())
            .await;
        assert_eq!(outcome.status, AttemptStatus::Failed);
        assert_eq!(outcome.attempt_count, 1);
        assert_eq!(outcome.last_error_kind, Some(FailureKind::SchemaInvalid));
        assert_eq!(generator.seen().len(), 1);
    }

    #[tokio::test]
    async fn transient_failures_exhaust_the_budget() {
        let generator = Arc::new(ScriptedGenerator::new(vec![
            Err(transient("1")),
            Err(transient("2")),
            Err(transient("3")),
        ]));
        let orchestrator = RetryOrchestrator::new(fast_config(), generator.clone());

        let outcome = orchestrator
            .run(&atom(), &[], &CancellationToken::new())
            .await;
        assert_eq!(outcome.status, AttemptStatus::Failed);
        assert_eq!(outcome.attempt_count, 3);
        assert_eq!(outcome.validation_pass_rate(), 0.0);
    }

    #[tokio::test]
    async fn failed_attempt_costs_accumulate() {
        let mut failure = transient("expensive failure");
        failure.cost_usd = 0.3;
        let generator = Arc::new(ScriptedGenerator::new(vec![Err(failure), Ok(ok_output(0.5))]));
        let orchestrator = RetryOrchestrator::new(fast_config(), generator);

        let outcome = orchestrator
            .run(&atom(), &[], &CancellationToken::new())
            .await;
        assert_eq!(outcome.status, AttemptStatus::Succeeded);
        assert!((outcome.total_cost - 0.8).abs() < 1e-9);
    }

    #[tokio::test]
    async fn cancelled_before_start_reports_cancelled() {
        let generator = Arc::new(ScriptedGenerator::new(vec![Ok(ok_output(0.5))]));
        let orchestrator = RetryOrchestrator::new(fast_config(), generator.clone());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = orchestrator.run(&atom(), &[], &cancel).await;
        assert_eq!(outcome.status, AttemptStatus::Cancelled);
        assert!(generator.seen().is_empty());
    }

    #[test]
    fn backoff_doubles_with_jitter_within_bounds() {
        for attempt in 1..=3u32 {
            let nominal = 1_000u64 * (1 << (attempt - 1));
            for _ in 0..20 {
                let delay = jittered_backoff(attempt, 1_000, 30_000).as_millis() as u64;
                assert!(delay >= nominal * 8 / 10, "attempt {}: {} too low", attempt, delay);
                assert!(delay <= nominal * 12 / 10, "attempt {}: {} too high", attempt, delay);
            }
        }
    }

    #[test]
    fn backoff_respects_cap() {
        for _ in 0..20 {
            let delay = jittered_backoff(10, 1_000, 30_000);
            assert!(delay <= Duration::from_millis(30_000));
        }
    }
}
