// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Directed dependency between two atoms: `src → dst` means `dst` consumes
/// something produced by `src`. Edges carry no runtime state; they live with
/// the plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencyEdge {
    pub src: Uuid,
    pub dst: Uuid,
    pub kind: EdgeKind,
    /// Higher weight = stronger evidence; consulted when breaking cycles.
    pub weight: f64,
    /// Detection confidence in [0, 1]; edges below the configured floor are
    /// dropped at graph build.
    pub confidence: f64,
}

impl DependencyEdge {
    pub fn new(src: Uuid, dst: Uuid, kind: EdgeKind) -> Self {
        Self {
            src,
            dst,
            kind,
            weight: 1.0,
            confidence: 1.0,
        }
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }
}

/// What kind of coupling the edge was inferred from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    Import,
    Call,
    Variable,
    Type,
    DataFlow,
}
