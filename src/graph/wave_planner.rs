// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Level-partitioned planning: acyclic graph in, ordered waves out.
//!
//! Kahn's algorithm computes the longest-path depth of every atom in
//! O(V + E); atoms at equal depth form a wave, so every atom's predecessors
//! sit in strictly lower-indexed waves. Intra-wave ordering is
//! `(complexity descending, id ascending)` for deterministic replay.
//!
//! Waves larger than the configured maximum are split into consecutive
//! chunks. Chunking cannot break the level invariant because intra-wave
//! edges do not exist. Small adjacent waves are never merged: downstream
//! observers rely on "strictly increasing depth along every edge".

use std::collections::VecDeque;

use crate::errors::GraphError;
use crate::graph::AtomGraph;
use crate::model::{BrokenEdge, ExecutionPlan, Wave};

/// Turns an acyclic atom graph into an ordered list of execution waves.
///
/// # Examples
///
/// ## A fan-out plans into two waves
/// ```rust
/// use atomwave::graph::{AtomGraph, WavePlanner};
/// use atomwave::model::{Atom, Complexity, DependencyEdge, EdgeKind};
/// use uuid::Uuid;
///
/// let mp = Uuid::new_v4();
/// let root = Atom::new(mp, Complexity::Medium, 0.05);
/// let left = Atom::new(mp, Complexity::Medium, 0.05);
/// let right = Atom::new(mp, Complexity::Medium, 0.05);
/// let edges = vec![
///     DependencyEdge::new(root.id, left.id, EdgeKind::Call),
///     DependencyEdge::new(root.id, right.id, EdgeKind::Call),
/// ];
/// let graph = AtomGraph::build(vec![root.clone(), left, right], &edges, 0.3).unwrap();
///
/// let plan = WavePlanner::new(100, 16).create_plan(&graph, Vec::new()).unwrap();
/// assert_eq!(plan.waves.len(), 2);
/// assert_eq!(plan.waves[0].atom_ids, vec![root.id]);
/// assert_eq!(plan.waves[1].atom_ids.len(), 2);
/// assert_eq!(plan.total_atoms, 3);
/// ```
pub struct WavePlanner {
    max_wave_size: usize,
    global_parallelism: usize,
}

impl WavePlanner {
    pub fn new(max_wave_size: usize, global_parallelism: usize) -> Self {
        Self {
            max_wave_size: max_wave_size.max(1),
            global_parallelism: global_parallelism.max(1),
        }
    }

    /// Build the execution plan. `cycle_broken_edges` from the breaker are
    /// carried into the plan verbatim for audit.
    ///
    /// # Algorithm Complexity
    /// - **Time**: O(V log V + E). Kahn's relaxation visits every live edge
    ///   once; the log factor comes from the deterministic intra-wave sort.
    /// - **Space**: O(V) for depths, in-degrees, and the level buckets.
    pub fn create_plan(
        &self,
        graph: &AtomGraph,
        cycle_broken_edges: Vec<BrokenEdge>,
    ) -> Result<ExecutionPlan, GraphError> {
        let n = graph.atom_count();
        let mut in_degree = graph.in_degrees();
        let mut depth = vec![0usize; n];
        let mut queue: VecDeque<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
        let mut placed = 0usize;

        while let Some(node) = queue.pop_front() {
            placed += 1;
            for edge_idx in graph.out_edge_indices(node) {
                let next = graph.edge(edge_idx).dst;
                depth[next] = depth[next].max(depth[node] + 1);
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    queue.push_back(next);
                }
            }
        }

        if placed != n {
            return Err(GraphError::NonAcyclic { remaining: n - placed });
        }

        let max_depth = depth.iter().copied().max().unwrap_or(0);
        let mut levels: Vec<Vec<usize>> = vec![Vec::new(); if n == 0 { 0 } else { max_depth + 1 }];
        for (node, &d) in depth.iter().enumerate() {
            levels[d].push(node);
        }

        let mut waves = Vec::new();
        for members in levels.iter_mut() {
            members.sort_by_key(|&node| {
                let atom = graph.atom(node);
                (atom.complexity.priority_rank(), atom.id)
            });

            for chunk in members.chunks(self.max_wave_size) {
                let atom_ids = chunk.iter().map(|&node| graph.atom(node).id).collect::<Vec<_>>();
                let max_parallel = self.global_parallelism.min(atom_ids.len().max(1));
                waves.push(Wave {
                    index: waves.len(),
                    atom_ids,
                    max_parallel,
                    expected_duration_hint_ms: None,
                });
            }
        }

        Ok(ExecutionPlan {
            waves,
            total_atoms: n,
            cycle_broken_edges,
        })
    }
}

/// Plan sanity check: every atom appears in exactly one wave and every live
/// edge points to a strictly later wave. O(V + E).
pub fn validate_plan(plan: &ExecutionPlan, graph: &AtomGraph) -> Result<(), GraphError> {
    use std::collections::HashMap;

    let mut wave_of = HashMap::new();
    for wave in &plan.waves {
        for id in &wave.atom_ids {
            if wave_of.insert(*id, wave.index).is_some() {
                return Err(GraphError::NonAcyclic { remaining: 0 });
            }
        }
    }

    if wave_of.len() != graph.atom_count() || plan.total_atoms != graph.atom_count() {
        return Err(GraphError::NonAcyclic {
            remaining: graph.atom_count().saturating_sub(wave_of.len()),
        });
    }

    for edge_idx in 0..graph.edge_count() {
        if !graph.is_alive(edge_idx) {
            continue;
        }
        let edge = graph.edge(edge_idx);
        let src_wave = wave_of[&graph.atom(edge.src).id];
        let dst_wave = wave_of[&graph.atom(edge.dst).id];
        if src_wave >= dst_wave {
            return Err(GraphError::NonAcyclic { remaining: 0 });
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Atom, Complexity, DependencyEdge, EdgeKind};
    use uuid::Uuid;

    fn atom(mp: Uuid, complexity: Complexity) -> Atom {
        Atom::new(mp, complexity, 1.0)
    }

    fn planner() -> WavePlanner {
        WavePlanner::new(100, 16)
    }

    #[test]
    fn diamond_produces_three_waves() {
        let mp = Uuid::new_v4();
        let a = atom(mp, Complexity::Medium);
        let b = atom(mp, Complexity::Medium);
        let c = atom(mp, Complexity::Medium);
        let d = atom(mp, Complexity::Medium);
        let edges = vec![
            DependencyEdge::new(a.id, b.id, EdgeKind::Call),
            DependencyEdge::new(a.id, c.id, EdgeKind::Call),
            DependencyEdge::new(b.id, d.id, EdgeKind::Call),
            DependencyEdge::new(c.id, d.id, EdgeKind::Call),
        ];
        let graph =
            AtomGraph::build(vec![a.clone(), b.clone(), c.clone(), d.clone()], &edges, 0.0).unwrap();

        let plan = planner().create_plan(&graph, Vec::new()).unwrap();
        assert_eq!(plan.waves.len(), 3);
        assert_eq!(plan.waves[0].atom_ids, vec![a.id]);
        assert_eq!(plan.waves[1].atom_ids.len(), 2);
        assert_eq!(plan.waves[2].atom_ids, vec![d.id]);
        assert_eq!(plan.total_atoms, 4);
        validate_plan(&plan, &graph).unwrap();
    }

    #[test]
    fn longest_path_depth_not_shortest() {
        // a -> b -> d and a -> d: d must land at depth 2, not 1.
        let mp = Uuid::new_v4();
        let a = atom(mp, Complexity::Medium);
        let b = atom(mp, Complexity::Medium);
        let d = atom(mp, Complexity::Medium);
        let edges = vec![
            DependencyEdge::new(a.id, b.id, EdgeKind::Call),
            DependencyEdge::new(b.id, d.id, EdgeKind::Call),
            DependencyEdge::new(a.id, d.id, EdgeKind::DataFlow),
        ];
        let graph = AtomGraph::build(vec![a.clone(), b.clone(), d.clone()], &edges, 0.0).unwrap();

        let plan = planner().create_plan(&graph, Vec::new()).unwrap();
        assert_eq!(plan.waves.len(), 3);
        assert_eq!(plan.waves[2].atom_ids, vec![d.id]);
    }

    #[test]
    fn intra_wave_order_puts_critical_first() {
        let mp = Uuid::new_v4();
        let low = atom(mp, Complexity::Low);
        let critical = atom(mp, Complexity::Critical);
        let medium = atom(mp, Complexity::Medium);
        let graph = AtomGraph::build(
            vec![low.clone(), critical.clone(), medium.clone()],
            &[],
            0.0,
        )
        .unwrap();

        let plan = planner().create_plan(&graph, Vec::new()).unwrap();
        assert_eq!(plan.waves.len(), 1);
        assert_eq!(plan.waves[0].atom_ids[0], critical.id);
        assert_eq!(plan.waves[0].atom_ids[2], low.id);
    }

    #[test]
    fn oversized_wave_is_chunked() {
        let mp = Uuid::new_v4();
        let atoms: Vec<Atom> = (0..7).map(|_| atom(mp, Complexity::Medium)).collect();
        let graph = AtomGraph::build(atoms, &[], 0.0).unwrap();

        let plan = WavePlanner::new(3, 16).create_plan(&graph, Vec::new()).unwrap();
        assert_eq!(plan.waves.len(), 3);
        assert_eq!(plan.waves[0].atom_ids.len(), 3);
        assert_eq!(plan.waves[1].atom_ids.len(), 3);
        assert_eq!(plan.waves[2].atom_ids.len(), 1);
        assert_eq!(plan.total_atoms, 7);
        assert!(plan.waves.iter().enumerate().all(|(i, w)| w.index == i));
    }

    #[test]
    fn empty_graph_yields_empty_plan() {
        let graph = AtomGraph::build(Vec::new(), &[], 0.0).unwrap();
        let plan = planner().create_plan(&graph, Vec::new()).unwrap();
        assert!(plan.waves.is_empty());
        assert!(plan.is_empty());
        validate_plan(&plan, &graph).unwrap();
    }

    #[test]
    fn max_parallel_capped_by_global_and_size() {
        let mp = Uuid::new_v4();
        let atoms: Vec<Atom> = (0..5).map(|_| atom(mp, Complexity::Medium)).collect();
        let graph = AtomGraph::build(atoms, &[], 0.0).unwrap();

        let plan = WavePlanner::new(100, 2).create_plan(&graph, Vec::new()).unwrap();
        assert_eq!(plan.waves[0].max_parallel, 2);

        let graph_small = AtomGraph::build(vec![atom(mp, Complexity::Low)], &[], 0.0).unwrap();
        let plan_small = WavePlanner::new(100, 8)
            .create_plan(&graph_small, Vec::new())
            .unwrap();
        assert_eq!(plan_small.waves[0].max_parallel, 1);
    }

    #[test]
    fn plan_is_deterministic() {
        let mp = Uuid::new_v4();
        let atoms: Vec<Atom> = (0..6).map(|_| atom(mp, Complexity::Medium)).collect();
        let edges = vec![
            DependencyEdge::new(atoms[0].id, atoms[3].id, EdgeKind::Call),
            DependencyEdge::new(atoms[1].id, atoms[4].id, EdgeKind::Call),
            DependencyEdge::new(atoms[2].id, atoms[5].id, EdgeKind::Call),
        ];

        let plan_a = {
            let graph = AtomGraph::build(atoms.clone(), &edges, 0.0).unwrap();
            planner().create_plan(&graph, Vec::new()).unwrap()
        };
        let plan_b = {
            let graph = AtomGraph::build(atoms.clone(), &edges, 0.0).unwrap();
            planner().create_plan(&graph, Vec::new()).unwrap()
        };

        let ids = |p: &ExecutionPlan| {
            p.waves.iter().map(|w| w.atom_ids.clone()).collect::<Vec<_>>()
        };
        assert_eq!(ids(&plan_a), ids(&plan_b));
    }
}
