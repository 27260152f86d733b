// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Stub backends for the demo harness and tests.
//!
//! The engine only ever talks to its trait seams; these implementations let
//! the operator CLI drive a full run without a real generator, test sandbox,
//! or message bus behind it.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::model::{AcceptanceTest, TestStatus};
use crate::observability::EngineEvent;
use crate::traits::{
    AcceptanceRunner, EventSink, FailureKind, Generator, GeneratorFailure, GeneratorOutput,
    GeneratorRequest, RunOutput, TokenUsage,
};

/// Deterministic generator: echoes a stamped version of the prompt and
/// charges a fixed cost. `fail_first` makes the first n calls fail
/// transiently, which exercises the retry path end to end.
pub struct EchoGenerator {
    cost_per_call: f64,
    fail_first: u32,
    calls: AtomicU32,
}

impl EchoGenerator {
    pub fn new(cost_per_call: f64) -> Arc<Self> {
        Arc::new(Self {
            cost_per_call,
            fail_first: 0,
            calls: AtomicU32::new(0),
        })
    }

    pub fn with_transient_failures(cost_per_call: f64, fail_first: u32) -> Arc<Self> {
        Arc::new(Self {
            cost_per_call,
            fail_first,
            calls: AtomicU32::new(0),
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Generator for EchoGenerator {
    async fn invoke(&self, request: GeneratorRequest) -> Result<GeneratorOutput, GeneratorFailure> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.fail_first {
            let mut failure =
                GeneratorFailure::new(FailureKind::ValidationFail, "stub transient failure");
            failure.cost_usd = self.cost_per_call / 2.0;
            return Err(failure);
        }
        let prompt_tokens = request.prompt.split_whitespace().count() as u64;
        Ok(GeneratorOutput {
            text: format!(
                "// generated at temperature {:.2}\n{}",
                request.temperature, request.prompt
            ),
            usage: TokenUsage {
                in_tokens: prompt_tokens,
                out_tokens: prompt_tokens + 8,
            },
            cost_usd: self.cost_per_call,
        })
    }
}

/// Runner that passes everything, or fails tests whose requirement text
/// contains a marker substring.
pub struct ScriptedRunner {
    fail_marker: Option<String>,
}

impl ScriptedRunner {
    pub fn passing() -> Arc<Self> {
        Arc::new(Self { fail_marker: None })
    }

    pub fn failing_marked(marker: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            fail_marker: Some(marker.into()),
        })
    }
}

#[async_trait]
impl AcceptanceRunner for ScriptedRunner {
    async fn run(&self, test: &AcceptanceTest) -> RunOutput {
        let fails = self
            .fail_marker
            .as_ref()
            .map(|marker| test.requirement_text.contains(marker.as_str()))
            .unwrap_or(false);
        RunOutput {
            status: if fails { TestStatus::Fail } else { TestStatus::Pass },
            duration_ms: 2,
            stdout: String::new(),
            stderr: if fails { "assertion failed".into() } else { String::new() },
            error_message: fails.then(|| "assertion failed".to_string()),
        }
    }
}

/// Sink that logs every event through `tracing`.
pub struct TracingSink;

impl TracingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

#[async_trait]
impl EventSink for TracingSink {
    async fn publish(&self, event: &EngineEvent) {
        tracing::info!(
            kind = event.kind.as_str(),
            run_id = %event.run_id,
            masterplan_id = %event.masterplan_id,
            atom_id = ?event.atom_id,
            wave_index = ?event.wave_index,
            "event"
        );
    }
}
