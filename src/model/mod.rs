// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

mod acceptance;
mod atom;
mod edge;
mod plan;

pub use acceptance::{AcceptanceResult, AcceptanceTest, TestLanguage, TestPriority, TestStatus};
pub use atom::{Atom, AtomStatus, Complexity};
pub use edge::{DependencyEdge, EdgeKind};
pub use plan::{BrokenEdge, ExecutionPlan, Wave};
