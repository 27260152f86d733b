// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Masterplan workload files for the operator CLI.
//!
//! A workload is the external system's hand-off: the finished atoms, their
//! declared dependency edges, and the generated acceptance tests for one
//! masterplan. The CLI seeds the store from this document before starting a
//! run.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use uuid::Uuid;

use crate::model::{AcceptanceTest, Atom, DependencyEdge};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workload {
    pub masterplan_id: Uuid,
    pub atoms: Vec<Atom>,
    #[serde(default)]
    pub edges: Vec<DependencyEdge>,
    #[serde(default)]
    pub acceptance_tests: Vec<AcceptanceTest>,
}

impl Workload {
    /// Basic referential checks before the graph build sees the data.
    pub fn validate(&self) -> Result<(), String> {
        for atom in &self.atoms {
            if atom.masterplan_id != self.masterplan_id {
                return Err(format!(
                    "atom {} belongs to masterplan {}, not {}",
                    atom.id, atom.masterplan_id, self.masterplan_id
                ));
            }
            if atom.estimated_cost < 0.0 {
                return Err(format!("atom {} has negative estimated cost", atom.id));
            }
        }
        for test in &self.acceptance_tests {
            if test.masterplan_id != self.masterplan_id {
                return Err(format!(
                    "acceptance test {} belongs to masterplan {}, not {}",
                    test.id, test.masterplan_id, self.masterplan_id
                ));
            }
        }
        Ok(())
    }
}

/// Load and validate a workload from a YAML file.
pub fn load_workload<P: AsRef<Path>>(path: P) -> anyhow::Result<Workload> {
    let content = fs::read_to_string(path)?;
    let workload: Workload = serde_yaml::from_str(&content)?;
    workload
        .validate()
        .map_err(|message| anyhow::anyhow!(message))?;
    Ok(workload)
}
