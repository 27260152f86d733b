// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Capability contracts the engine depends on.
//!
//! The engine never calls a language model, runs a test, or touches a
//! database directly; it accepts any implementation of these small, stable
//! contracts at construction time.

mod generator;
mod runner;
mod sink;
mod store;

pub use generator::{FailureKind, Generator, GeneratorFailure, GeneratorOutput, GeneratorRequest, TokenUsage};
pub use runner::{AcceptanceRunner, RunOutput};
pub use sink::EventSink;
pub use store::{RunRecord, RunStatus, StateStore};
