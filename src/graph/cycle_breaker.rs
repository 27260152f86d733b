// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Greedy feedback-arc removal for cyclic dependency declarations.
//!
//! Atomizers over-declare: inferred edges occasionally form cycles that a
//! correct plan cannot contain. Rather than rejecting the masterplan, the
//! breaker removes the cheapest edges until the graph is acyclic, and reports
//! every removal for audit.
//!
//! The heuristic is not a formal minimum feedback arc set. It is
//! deterministic: identical inputs always remove identical edges.
//!
//! Per non-trivial SCC, one shortest cycle is sampled through each member
//! node (BFS over index-ordered adjacency). Each internal edge is scored by
//! `weight / cycles_participated`; the lowest ratio is removed, tie-broken by
//! lower confidence, then lexicographic `(src_id, dst_id)`. SCCs are
//! recomputed after every removal until none remain.

use std::collections::{HashMap, VecDeque};

use crate::errors::GraphError;
use crate::graph::AtomGraph;
use crate::model::BrokenEdge;
use crate::model::DependencyEdge;

/// Remove edges until the graph is acyclic. Returns the repaired graph and
/// the removed edges with reasons.
///
/// Idempotent: running it on its own output removes nothing.
pub fn break_cycles(mut graph: AtomGraph) -> Result<(AtomGraph, Vec<BrokenEdge>), GraphError> {
    let mut removed = Vec::new();

    // Self-dependencies can never be satisfied; drop them first.
    let self_loops: Vec<usize> = (0..graph.edge_count())
        .filter(|&idx| graph.is_alive(idx) && graph.edge(idx).src == graph.edge(idx).dst)
        .collect();
    for idx in self_loops {
        removed.push(broken_edge(&graph, idx, "self-dependency".to_string()));
        graph.remove_edge(idx);
    }

    loop {
        let sccs = graph.cycles();
        if sccs.is_empty() {
            break;
        }

        // One removal per SCC per round, then re-derive the components:
        // removing an edge can split an SCC into several smaller ones.
        for scc in &sccs {
            let candidate = select_edge_to_remove(&graph, scc);
            if let Some((edge_idx, participation)) = candidate {
                let edge = graph.edge(edge_idx);
                let reason = format!(
                    "cycle break: weight {:.3} over {} sampled cycle(s)",
                    edge.weight, participation
                );
                removed.push(broken_edge(&graph, edge_idx, reason));
                graph.remove_edge(edge_idx);
            }
        }
    }

    // The loop above only exits when Tarjan reports no non-trivial SCC, so a
    // residual cycle here means the breaker itself is wrong.
    let placed = kahn_count(&graph);
    if placed != graph.atom_count() {
        return Err(GraphError::NonAcyclic {
            remaining: graph.atom_count() - placed,
        });
    }

    Ok((graph, removed))
}

fn broken_edge(graph: &AtomGraph, edge_idx: usize, reason: String) -> BrokenEdge {
    let edge = graph.edge(edge_idx);
    BrokenEdge {
        edge: DependencyEdge {
            src: graph.atom(edge.src).id,
            dst: graph.atom(edge.dst).id,
            kind: edge.kind,
            weight: edge.weight,
            confidence: edge.confidence,
        },
        reason,
    }
}

/// Pick the edge to remove from one SCC: lowest weight-to-participation
/// ratio, then lowest confidence, then lexicographic `(src_id, dst_id)`.
fn select_edge_to_remove(graph: &AtomGraph, scc: &[usize]) -> Option<(usize, usize)> {
    let internal = graph.internal_edges(scc);
    if internal.is_empty() {
        return None;
    }

    let mut participation: HashMap<usize, usize> = HashMap::new();
    for &node in scc {
        if let Some(cycle_edges) = shortest_cycle_through(graph, node, scc) {
            for edge_idx in cycle_edges {
                *participation.entry(edge_idx).or_insert(0) += 1;
            }
        }
    }

    let mut best: Option<(usize, usize)> = None;
    let mut best_key: Option<(f64, f64, uuid::Uuid, uuid::Uuid)> = None;
    for &edge_idx in &internal {
        let count = match participation.get(&edge_idx) {
            Some(&c) if c > 0 => c,
            // An edge on no sampled cycle is not worth removing.
            _ => continue,
        };
        let edge = graph.edge(edge_idx);
        let ratio = edge.weight / count as f64;
        let key = (
            ratio,
            edge.confidence,
            graph.atom(edge.src).id,
            graph.atom(edge.dst).id,
        );
        let better = match &best_key {
            None => true,
            Some(current) => {
                (key.0, key.1, key.2, key.3) < (current.0, current.1, current.2, current.3)
            }
        };
        if better {
            best = Some((edge_idx, count));
            best_key = Some(key);
        }
    }

    best
}

/// BFS for the shortest cycle through `start` staying inside the SCC.
/// Returns the edge indices along the cycle, or None if no path back exists
/// (possible once earlier removals thinned the component).
fn shortest_cycle_through(graph: &AtomGraph, start: usize, scc: &[usize]) -> Option<Vec<usize>> {
    // predecessor[node] = (prev node, edge used to reach node)
    let mut predecessor: HashMap<usize, (usize, usize)> = HashMap::new();
    let mut queue = VecDeque::new();
    queue.push_back(start);

    while let Some(node) = queue.pop_front() {
        for edge_idx in graph.out_edge_indices(node) {
            let next = graph.edge(edge_idx).dst;
            if scc.binary_search(&next).is_err() {
                continue;
            }
            if next == start {
                // Reconstruct the path back to start.
                let mut edges = vec![edge_idx];
                let mut cursor = node;
                while cursor != start {
                    let (prev, via) = predecessor[&cursor];
                    edges.push(via);
                    cursor = prev;
                }
                edges.reverse();
                return Some(edges);
            }
            if !predecessor.contains_key(&next) {
                predecessor.insert(next, (node, edge_idx));
                queue.push_back(next);
            }
        }
    }

    None
}

/// Count nodes placeable by Kahn's algorithm over live edges; equals the node
/// count exactly when the graph is acyclic.
fn kahn_count(graph: &AtomGraph) -> usize {
    let mut in_degree = graph.in_degrees();
    let mut queue: VecDeque<usize> = (0..graph.atom_count())
        .filter(|&n| in_degree[n] == 0)
        .collect();
    let mut placed = 0;

    while let Some(node) = queue.pop_front() {
        placed += 1;
        for next in graph.successors(node) {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                queue.push_back(next);
            }
        }
    }

    placed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Atom, Complexity, DependencyEdge, EdgeKind};
    use uuid::Uuid;

    fn atoms(n: usize) -> Vec<Atom> {
        let mp = Uuid::new_v4();
        (0..n).map(|_| Atom::new(mp, Complexity::Medium, 1.0)).collect()
    }

    fn edge(src: &Atom, dst: &Atom, weight: f64) -> DependencyEdge {
        DependencyEdge::new(src.id, dst.id, EdgeKind::Call).with_weight(weight)
    }

    #[test]
    fn two_cycle_removes_lower_weight_edge() {
        let a = atoms(2);
        let declared = vec![edge(&a[0], &a[1], 1.0), edge(&a[1], &a[0], 2.0)];
        let graph = AtomGraph::build(a.clone(), &declared, 0.0).unwrap();

        let (repaired, removed) = break_cycles(graph).unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].edge.src, a[0].id);
        assert_eq!(removed[0].edge.dst, a[1].id);
        // The heavier reverse edge survives, so a[1] stays before a[0].
        assert_eq!(repaired.fan_out(a[1].id), Some(1));
        assert!(repaired.cycles().is_empty());
    }

    #[test]
    fn equal_weight_ties_break_on_confidence() {
        let a = atoms(2);
        let declared = vec![
            edge(&a[0], &a[1], 1.0).with_confidence(0.9),
            edge(&a[1], &a[0], 1.0).with_confidence(0.4),
        ];
        let graph = AtomGraph::build(a.clone(), &declared, 0.0).unwrap();

        let (_, removed) = break_cycles(graph).unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].edge.confidence, 0.4);
    }

    #[test]
    fn acyclic_graph_is_untouched() {
        let a = atoms(3);
        let declared = vec![edge(&a[0], &a[1], 1.0), edge(&a[1], &a[2], 1.0)];
        let graph = AtomGraph::build(a, &declared, 0.0).unwrap();

        let (_, removed) = break_cycles(graph).unwrap();
        assert!(removed.is_empty());
    }

    #[test]
    fn breaking_is_idempotent() {
        let a = atoms(3);
        let declared = vec![
            edge(&a[0], &a[1], 1.0),
            edge(&a[1], &a[2], 1.0),
            edge(&a[2], &a[0], 0.5),
        ];
        let graph = AtomGraph::build(a, &declared, 0.0).unwrap();

        let (repaired, removed) = break_cycles(graph).unwrap();
        assert_eq!(removed.len(), 1);

        let (_, removed_again) = break_cycles(repaired).unwrap();
        assert!(removed_again.is_empty());
    }

    #[test]
    fn breaking_is_deterministic() {
        let a = atoms(4);
        let declared = vec![
            edge(&a[0], &a[1], 1.0),
            edge(&a[1], &a[2], 1.0),
            edge(&a[2], &a[0], 1.0),
            edge(&a[2], &a[3], 1.0),
            edge(&a[3], &a[1], 1.0),
        ];

        let first = {
            let graph = AtomGraph::build(a.clone(), &declared, 0.0).unwrap();
            let (_, removed) = break_cycles(graph).unwrap();
            removed
                .iter()
                .map(|b| (b.edge.src, b.edge.dst))
                .collect::<Vec<_>>()
        };
        let second = {
            let graph = AtomGraph::build(a.clone(), &declared, 0.0).unwrap();
            let (_, removed) = break_cycles(graph).unwrap();
            removed
                .iter()
                .map(|b| (b.edge.src, b.edge.dst))
                .collect::<Vec<_>>()
        };

        assert_eq!(first, second);
    }

    #[test]
    fn overlapping_cycles_resolve() {
        // Two cycles sharing an edge: 0->1->0 and 0->1->2->0.
        let a = atoms(3);
        let declared = vec![
            edge(&a[0], &a[1], 5.0),
            edge(&a[1], &a[0], 1.0),
            edge(&a[1], &a[2], 5.0),
            edge(&a[2], &a[0], 1.0),
        ];
        let graph = AtomGraph::build(a, &declared, 0.0).unwrap();

        let (repaired, removed) = break_cycles(graph).unwrap();
        assert!(repaired.cycles().is_empty());
        // The shared forward path is heavy; only the cheap back edges go.
        assert!(removed.len() <= 2);
        for broken in &removed {
            assert_eq!(broken.edge.weight, 1.0);
        }
    }
}
