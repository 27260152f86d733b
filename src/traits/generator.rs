// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// One generation request. The prompt arrives fully assembled; the engine
/// only varies temperature and appends failure feedback between attempts.
#[derive(Debug, Clone)]
pub struct GeneratorRequest {
    pub prompt: String,
    pub model: String,
    pub temperature: f64,
    pub deadline: Duration,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokenUsage {
    pub in_tokens: u64,
    pub out_tokens: u64,
}

#[derive(Debug, Clone)]
pub struct GeneratorOutput {
    pub text: String,
    pub usage: TokenUsage,
    pub cost_usd: f64,
}

/// Failure classification driving the retry decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    SchemaInvalid,
    ContractMismatch,
    HardCostExceeded,
    Timeout,
    TransportError,
    ValidationFail,
    GeneratorRefusal,
    Other,
}

impl FailureKind {
    /// Fatal kinds are never retried; everything else defaults to transient.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            FailureKind::SchemaInvalid | FailureKind::ContractMismatch | FailureKind::HardCostExceeded
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::SchemaInvalid => "schema_invalid",
            FailureKind::ContractMismatch => "contract_mismatch",
            FailureKind::HardCostExceeded => "hard_cost_exceeded",
            FailureKind::Timeout => "timeout",
            FailureKind::TransportError => "transport_error",
            FailureKind::ValidationFail => "validation_fail",
            FailureKind::GeneratorRefusal => "generator_refusal",
            FailureKind::Other => "other",
        }
    }
}

/// A failed generator call. Cost incurred before the failure is still real
/// and still gets recorded against the ledger.
#[derive(Error, Debug, Clone)]
#[error("generator failure ({}): {message}", kind.as_str())]
pub struct GeneratorFailure {
    pub kind: FailureKind,
    pub message: String,
    /// Truncated stderr or diagnostic output, folded into retry feedback.
    pub stderr: String,
    pub cost_usd: f64,
}

impl GeneratorFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            stderr: String::new(),
            cost_usd: 0.0,
        }
    }
}

/// The one contract the engine needs from a code generator. Wrappers may add
/// caching, batching, or transport retry around this call; the engine only
/// sees the final outcome.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn invoke(&self, request: GeneratorRequest) -> Result<GeneratorOutput, GeneratorFailure>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_kinds_are_not_retried() {
        assert!(FailureKind::SchemaInvalid.is_fatal());
        assert!(FailureKind::ContractMismatch.is_fatal());
        assert!(FailureKind::HardCostExceeded.is_fatal());
        assert!(!FailureKind::Timeout.is_fatal());
        assert!(!FailureKind::TransportError.is_fatal());
        assert!(!FailureKind::ValidationFail.is_fatal());
        assert!(!FailureKind::GeneratorRefusal.is_fatal());
        assert!(!FailureKind::Other.is_fatal());
    }
}
