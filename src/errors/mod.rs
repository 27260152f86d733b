// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

mod cost;
mod engine;
mod graph;
mod store;

pub use cost::CostError;
pub use engine::EngineError;
pub use graph::GraphError;
pub use store::StoreError;
