// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

use std::collections::HashMap;

use uuid::Uuid;

use crate::errors::GraphError;
use crate::model::{Atom, DependencyEdge, EdgeKind};

/// Dependency graph over a masterplan's atoms, stored with dense integer
/// indices and an explicit edge list.
///
/// The graph is built once from the declared atoms and edges, repaired by the
/// cycle breaker, and then shared read-only with the planner and executor.
/// Nothing mutates it after planning.
///
/// Build-time normalization:
/// - edges whose `confidence` falls below the configured floor are dropped,
/// - parallel edges of the same `(src, dst, kind)` are coalesced by summing
///   weights and keeping the highest confidence,
/// - an edge referencing an unknown atom fails the whole build with
///   `GraphError::InvalidEdge`.
///
/// Removal during cycle breaking is a tombstone (`alive` flag) rather than a
/// rebuild, so edge indices stay stable for the breaker's bookkeeping.
///
/// # Algorithm Complexity
///
/// - **Build**: O(V + E log E). Coalescing is one hash pass over the
///   declared edges; the log factor comes from sorting the coalesced edges
///   for deterministic traversal order.
/// - **Space**: O(V + E) for the dense atom array plus per-node adjacency.
/// - **Degree queries** (`fan_in`, `fan_out`): O(deg) over live edges.
/// - **Cycle detection** (`cycles`): O(V + E), see the method documentation.
///
/// # Examples
///
/// ## Building a graph and inspecting degrees
/// ```rust
/// use atomwave::graph::AtomGraph;
/// use atomwave::model::{Atom, Complexity, DependencyEdge, EdgeKind};
/// use uuid::Uuid;
///
/// let mp = Uuid::new_v4();
/// let parser = Atom::new(mp, Complexity::High, 0.08);
/// let eval = Atom::new(mp, Complexity::Medium, 0.05);
/// let edges = vec![DependencyEdge::new(parser.id, eval.id, EdgeKind::Type)];
///
/// let graph = AtomGraph::build(vec![parser.clone(), eval.clone()], &edges, 0.3).unwrap();
/// assert_eq!(graph.atom_count(), 2);
/// assert_eq!(graph.fan_out(parser.id), Some(1));
/// assert_eq!(graph.fan_in(eval.id), Some(1));
/// assert!(graph.cycles().is_empty());
/// ```
///
/// ## Low-confidence edges are filtered at build
/// ```rust
/// use atomwave::graph::AtomGraph;
/// use atomwave::model::{Atom, Complexity, DependencyEdge, EdgeKind};
/// use uuid::Uuid;
///
/// let mp = Uuid::new_v4();
/// let a = Atom::new(mp, Complexity::Low, 0.01);
/// let b = Atom::new(mp, Complexity::Low, 0.01);
/// let weak = DependencyEdge::new(a.id, b.id, EdgeKind::Variable).with_confidence(0.1);
///
/// let graph = AtomGraph::build(vec![a.clone(), b], &[weak], 0.3).unwrap();
/// assert_eq!(graph.fan_out(a.id), Some(0));
/// ```
#[derive(Debug, Clone)]
pub struct AtomGraph {
    atoms: Vec<Atom>,
    index: HashMap<Uuid, usize>,
    edges: Vec<GraphEdge>,
    alive: Vec<bool>,
    out_edges: Vec<Vec<usize>>,
    in_edges: Vec<Vec<usize>>,
}

/// One coalesced edge between dense node indices.
#[derive(Debug, Clone)]
pub struct GraphEdge {
    pub src: usize,
    pub dst: usize,
    pub kind: EdgeKind,
    pub weight: f64,
    pub confidence: f64,
}

impl AtomGraph {
    /// Build a graph from atoms plus declared edges.
    ///
    /// Edges below `confidence_floor` are filtered before endpoint
    /// validation, so a low-confidence edge to a missing atom does not fail
    /// the build.
    ///
    /// O(V + E log E): one coalescing pass, then a sort of the surviving
    /// edges for deterministic traversal order.
    pub fn build(
        atoms: Vec<Atom>,
        declared: &[DependencyEdge],
        confidence_floor: f64,
    ) -> Result<Self, GraphError> {
        let mut index = HashMap::with_capacity(atoms.len());
        for (i, atom) in atoms.iter().enumerate() {
            index.insert(atom.id, i);
        }

        // Coalesce parallel (src, dst, kind) edges: weights sum, the
        // strongest observation sets the confidence.
        let mut coalesced: HashMap<(usize, usize, EdgeKind), (f64, f64)> = HashMap::new();
        for edge in declared {
            if edge.confidence < confidence_floor {
                continue;
            }
            let src = *index.get(&edge.src).ok_or(GraphError::InvalidEdge {
                src: edge.src,
                dst: edge.dst,
                unknown: edge.src,
            })?;
            let dst = *index.get(&edge.dst).ok_or(GraphError::InvalidEdge {
                src: edge.src,
                dst: edge.dst,
                unknown: edge.dst,
            })?;
            let entry = coalesced.entry((src, dst, edge.kind)).or_insert((0.0, 0.0));
            entry.0 += edge.weight;
            entry.1 = entry.1.max(edge.confidence);
        }

        // Deterministic edge ordering keeps every downstream traversal
        // (SCC discovery, cycle sampling, planning) replayable.
        let mut keys: Vec<(usize, usize, EdgeKind)> = coalesced.keys().copied().collect();
        keys.sort_by_key(|(src, dst, kind)| (*src, *dst, *kind as u8));

        let mut edges = Vec::with_capacity(keys.len());
        let mut out_edges = vec![Vec::new(); atoms.len()];
        let mut in_edges = vec![Vec::new(); atoms.len()];
        for (src, dst, kind) in keys {
            let (weight, confidence) = coalesced[&(src, dst, kind)];
            let edge_idx = edges.len();
            edges.push(GraphEdge {
                src,
                dst,
                kind,
                weight,
                confidence,
            });
            out_edges[src].push(edge_idx);
            in_edges[dst].push(edge_idx);
        }

        let alive = vec![true; edges.len()];
        Ok(Self {
            atoms,
            index,
            edges,
            alive,
            out_edges,
            in_edges,
        })
    }

    pub fn atom_count(&self) -> usize {
        self.atoms.len()
    }

    pub fn atoms(&self) -> &[Atom] {
        &self.atoms
    }

    pub fn atom(&self, idx: usize) -> &Atom {
        &self.atoms[idx]
    }

    pub fn index_of(&self, id: Uuid) -> Option<usize> {
        self.index.get(&id).copied()
    }

    pub fn edge(&self, idx: usize) -> &GraphEdge {
        &self.edges[idx]
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn is_alive(&self, edge_idx: usize) -> bool {
        self.alive[edge_idx]
    }

    /// Tombstone an edge. Only the cycle breaker calls this; after planning
    /// the graph is immutable.
    pub(crate) fn remove_edge(&mut self, edge_idx: usize) {
        self.alive[edge_idx] = false;
    }

    /// Live outgoing edge indices for a node, in deterministic order.
    pub fn out_edge_indices(&self, node: usize) -> impl Iterator<Item = usize> + '_ {
        self.out_edges[node]
            .iter()
            .copied()
            .filter(move |&e| self.alive[e])
    }

    /// Live successor node indices.
    pub fn successors(&self, node: usize) -> impl Iterator<Item = usize> + '_ {
        self.out_edge_indices(node).map(move |e| self.edges[e].dst)
    }

    /// Number of live incoming edges, by atom id.
    pub fn fan_in(&self, id: Uuid) -> Option<usize> {
        let node = self.index_of(id)?;
        Some(self.in_edges[node].iter().filter(|&&e| self.alive[e]).count())
    }

    /// Number of live outgoing edges, by atom id.
    pub fn fan_out(&self, id: Uuid) -> Option<usize> {
        let node = self.index_of(id)?;
        Some(self.out_edges[node].iter().filter(|&&e| self.alive[e]).count())
    }

    /// In-degree per node over live edges.
    pub fn in_degrees(&self) -> Vec<usize> {
        let mut degrees = vec![0usize; self.atoms.len()];
        for (idx, edge) in self.edges.iter().enumerate() {
            if self.alive[idx] {
                degrees[edge.dst] += 1;
            }
        }
        degrees
    }

    /// Strongly connected components with more than one node, via Tarjan's
    /// algorithm. Components and their members come back in deterministic
    /// order (discovery over index-ordered adjacency, members sorted).
    ///
    /// # Algorithm Complexity
    /// - **Time**: O(V + E). Each node is pushed onto and popped off the
    ///   component stack exactly once, and each live edge is examined once.
    /// - **Space**: O(V) for the index/lowlink/on-stack bookkeeping plus the
    ///   DFS recursion depth.
    pub fn cycles(&self) -> Vec<Vec<usize>> {
        struct TarjanState {
            index_counter: usize,
            indices: Vec<Option<usize>>,
            lowlinks: Vec<usize>,
            on_stack: Vec<bool>,
            stack: Vec<usize>,
            sccs: Vec<Vec<usize>>,
        }

        fn strongconnect(graph: &AtomGraph, v: usize, state: &mut TarjanState) {
            state.indices[v] = Some(state.index_counter);
            state.lowlinks[v] = state.index_counter;
            state.index_counter += 1;
            state.stack.push(v);
            state.on_stack[v] = true;

            for w in graph.successors(v).collect::<Vec<_>>() {
                if state.indices[w].is_none() {
                    strongconnect(graph, w, state);
                    state.lowlinks[v] = state.lowlinks[v].min(state.lowlinks[w]);
                } else if state.on_stack[w] {
                    state.lowlinks[v] = state.lowlinks[v].min(state.indices[w].unwrap());
                }
            }

            if state.lowlinks[v] == state.indices[v].unwrap() {
                let mut component = Vec::new();
                loop {
                    let w = state.stack.pop().unwrap();
                    state.on_stack[w] = false;
                    component.push(w);
                    if w == v {
                        break;
                    }
                }
                if component.len() > 1 {
                    component.sort_unstable();
                    state.sccs.push(component);
                }
            }
        }

        let n = self.atoms.len();
        let mut state = TarjanState {
            index_counter: 0,
            indices: vec![None; n],
            lowlinks: vec![0; n],
            on_stack: vec![false; n],
            stack: Vec::new(),
            sccs: Vec::new(),
        };

        for v in 0..n {
            if state.indices[v].is_none() {
                strongconnect(self, v, &mut state);
            }
        }

        state.sccs.sort_by_key(|scc| scc[0]);
        state.sccs
    }

    /// Live edges whose endpoints both lie in `members` (given sorted).
    pub fn internal_edges(&self, members: &[usize]) -> Vec<usize> {
        self.edges
            .iter()
            .enumerate()
            .filter(|(idx, edge)| {
                self.alive[*idx]
                    && members.binary_search(&edge.src).is_ok()
                    && members.binary_search(&edge.dst).is_ok()
            })
            .map(|(idx, _)| idx)
            .collect()
    }
}
