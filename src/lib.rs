// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

pub mod cache; // prompt/retrieval caches + request batcher
pub mod config; // engine config + workload loading
pub mod engine; // cost, queue, retry, gate, wave executor, service
pub mod errors; // error handling
pub mod graph; // dependency graph, cycle breaking, wave planning
pub mod model; // atoms, edges, plans, acceptance tests
pub mod observability; // events, metrics, log messages
pub mod storage; // in-memory state store
pub mod stub; // demo generator/runner/sink backends
pub mod traits; // capability contracts
