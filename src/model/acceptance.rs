// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An auto-generated acceptance test gating release of a masterplan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcceptanceTest {
    pub id: Uuid,
    pub masterplan_id: Uuid,
    pub requirement_text: String,
    pub priority: TestPriority,
    pub code: String,
    pub language: TestLanguage,
    pub timeout_seconds: u64,
}

/// Gate weight of a test: every `must` has to pass; `should` tests pass as a
/// rate against a configurable threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestPriority {
    Must,
    Should,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestLanguage {
    Pytest,
    Jest,
    Vitest,
}

/// Outcome of one acceptance-test execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcceptanceResult {
    pub id: Uuid,
    pub test_id: Uuid,
    #[serde(default)]
    pub wave_index: Option<usize>,
    pub status: TestStatus,
    pub duration_ms: u64,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    Pass,
    Fail,
    Timeout,
    Error,
}

impl TestStatus {
    /// Timeouts and runner errors count as failures in gate math.
    pub fn counts_as_fail(&self) -> bool {
        !matches!(self, TestStatus::Pass)
    }
}
