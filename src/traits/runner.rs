// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

use async_trait::async_trait;

use crate::model::{AcceptanceTest, TestStatus};

/// Raw outcome of executing one acceptance test. The runner owns sandboxing
/// and enforces the per-test timeout the engine supplies on the test itself.
#[derive(Debug, Clone)]
pub struct RunOutput {
    pub status: TestStatus,
    pub duration_ms: u64,
    pub stdout: String,
    pub stderr: String,
    pub error_message: Option<String>,
}

#[async_trait]
pub trait AcceptanceRunner: Send + Sync {
    async fn run(&self, test: &AcceptanceTest) -> RunOutput;
}
