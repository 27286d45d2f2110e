// Wattle: Hierarchical Data-Plane Service Broker
// Copyright (C) 2022  The Wattle Developers
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

//! Spanning trees: Prim's minimum spanning tree and the goal-set
//! (Steiner-approximation) spanning tree used by the planner.

use super::paths::shortest_paths;
use super::{opposite, EdgeId, GraphError, PlanGraph, VertexId};
use petgraph::visit::EdgeRef;
use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeSet, BinaryHeap, HashMap, HashSet};

/// Heap entry for Prim's algorithm: an edge leading out of the tree to
/// `vertex`, ordered by `(cost, rank, edge index)`.
#[derive(Debug, PartialEq)]
struct Frontier {
    cost: f64,
    rank: u64,
    edge: EdgeId,
    vertex: VertexId,
}

impl Eq for Frontier {}

impl Ord for Frontier {
    fn cmp(&self, other: &Self) -> Ordering {
        self.cost
            .partial_cmp(&other.cost)
            .unwrap_or(Ordering::Equal)
            .then(self.rank.cmp(&other.rank))
            .then(self.edge.index().cmp(&other.edge.index()))
    }
}

impl PartialOrd for Frontier {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Compute a minimum spanning tree over all vertices reachable from the
/// lowest-indexed vertex, using Prim's algorithm with a binary heap.
///
/// Ties between equal-cost edges are broken by rank, then by edge index, so
/// the tree is unique for a given ranking. An empty graph yields an empty
/// tree.
pub fn minimum_spanning_tree(graph: &PlanGraph) -> Vec<EdgeId> {
    let root = match graph.node_indices().min() {
        Some(v) => v,
        None => return Vec::new(),
    };
    prim(graph, root, None)
}

/// Prim's algorithm from `root`, optionally restricted to a subset of edges.
fn prim(graph: &PlanGraph, root: VertexId, allowed: Option<&BTreeSet<EdgeId>>) -> Vec<EdgeId> {
    let mut in_tree: HashSet<VertexId> = HashSet::new();
    let mut tree = Vec::new();
    let mut heap: BinaryHeap<Reverse<Frontier>> = BinaryHeap::new();

    in_tree.insert(root);
    push_frontier(graph, root, allowed, &mut heap);

    while let Some(Reverse(next)) = heap.pop() {
        if in_tree.contains(&next.vertex) {
            continue;
        }
        in_tree.insert(next.vertex);
        tree.push(next.edge);
        push_frontier(graph, next.vertex, allowed, &mut heap);
    }
    tree
}

fn push_frontier(
    graph: &PlanGraph,
    vertex: VertexId,
    allowed: Option<&BTreeSet<EdgeId>>,
    heap: &mut BinaryHeap<Reverse<Frontier>>,
) {
    for edge_ref in graph.edges(vertex) {
        let edge = edge_ref.id();
        if let Some(allowed) = allowed {
            if !allowed.contains(&edge) {
                continue;
            }
        }
        let weight = graph[edge];
        heap.push(Reverse(Frontier {
            cost: weight.cost,
            rank: weight.rank,
            edge,
            vertex: opposite(graph, vertex, edge),
        }));
    }
}

/// Compute a subtree of `graph` connecting every vertex in `goals`, using
/// only edges whose capacity is at least `min_capacity`, and approximately
/// minimising the total edge cost.
///
/// The construction is the standard 2-approximation of the Steiner tree:
/// drop edges below the capacity gate, compute shortest paths from every
/// goal, build the minimum spanning tree of the metric closure over the goal
/// set, substitute each closure edge with its underlying path, and reduce
/// the union to a tree by re-running Prim on it and pruning non-goal leaves.
///
/// Fails with [`GraphError::Unreachable`] if any goal cannot be reached from
/// the others at the requested capacity. A goal set of zero or one vertices
/// is trivially connected by the empty tree.
pub fn goal_spanning_tree(
    graph: &PlanGraph,
    goals: &BTreeSet<VertexId>,
    min_capacity: f64,
) -> Result<BTreeSet<EdgeId>, GraphError> {
    if goals.len() <= 1 {
        return Ok(BTreeSet::new());
    }

    // (a) capacity gate: remove edges that cannot carry the service
    let mut gated = graph.clone();
    let cut: Vec<EdgeId> = gated
        .edge_indices()
        .filter(|e| gated[*e].capacity < min_capacity)
        .collect();
    for edge in cut {
        gated.remove_edge(edge);
    }

    // (b) shortest paths from every goal, checking mutual reachability
    let goal_list: Vec<VertexId> = goals.iter().copied().collect();
    let mut tables = HashMap::new();
    for &goal in &goal_list {
        let table = shortest_paths(&gated, goal);
        for &other in &goal_list {
            if other != goal && !table.is_reachable(other) {
                return Err(GraphError::Unreachable(other));
            }
        }
        tables.insert(goal, table);
    }

    // (c) minimum spanning tree of the metric closure over the goals
    let mut connected = vec![goal_list[0]];
    let mut closure: Vec<(VertexId, VertexId)> = Vec::new();
    while connected.len() < goal_list.len() {
        let mut best: Option<(f64, VertexId, VertexId)> = None;
        for &from in &connected {
            let table = &tables[&from];
            for &to in &goal_list {
                if connected.contains(&to) {
                    continue;
                }
                // reachability was checked above
                let distance = table.distance(to).unwrap();
                let replace = match best {
                    None => true,
                    Some((b, bf, bt)) => {
                        distance < b || (distance == b && (from, to) < (bf, bt))
                    }
                };
                if replace {
                    best = Some((distance, from, to));
                }
            }
        }
        let (_, from, to) = best.unwrap();
        connected.push(to);
        closure.push((from, to));
    }

    // (d) substitute each closure edge with its underlying path
    let mut union: BTreeSet<EdgeId> = BTreeSet::new();
    for (from, to) in closure {
        let path = tables[&from]
            .edge_path(&gated, to)
            .ok_or(GraphError::Unreachable(to))?;
        union.extend(path);
    }

    // (e) reduce the union to a tree and prune non-goal leaves
    let tree = prim(&gated, goal_list[0], Some(&union));
    let mut keep: BTreeSet<EdgeId> = tree.into_iter().collect();
    loop {
        let mut incident: HashMap<VertexId, Vec<EdgeId>> = HashMap::new();
        for &edge in &keep {
            if let Some((a, b)) = gated.edge_endpoints(edge) {
                incident.entry(a).or_default().push(edge);
                incident.entry(b).or_default().push(edge);
            }
        }
        let leaf = incident
            .iter()
            .filter(|(v, edges)| edges.len() == 1 && !goals.contains(v))
            .map(|(v, edges)| (*v, edges[0]))
            .min();
        match leaf {
            Some((_, edge)) => {
                keep.remove(&edge);
            }
            None => break,
        }
    }
    Ok(keep)
}
