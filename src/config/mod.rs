// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

mod consts;
mod loader;
mod workload;

pub use consts::*;
pub use loader::{load_config, EngineConfig, GatePolicy};
pub use workload::{load_workload, Workload};
