// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

mod atom_graph;
mod cycle_breaker;
mod wave_planner;

pub use atom_graph::{AtomGraph, GraphEdge};
pub use cycle_breaker::break_cycles;
pub use wave_planner::{validate_plan, WavePlanner};
