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

//! Distance-vector shortest paths with deterministic tie-breaks.

use super::{opposite, via_rank, EdgeId, PlanGraph, VertexId};
use std::collections::HashMap;

/// A single entry of a [`PathTable`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PathEntry {
    /// Accumulated cost from the source.
    pub distance: f64,
    /// Number of edges on the path. Used as the first tie-break between
    /// equal-cost paths, and rules out predecessor cycles through
    /// zero-cost edges.
    pub hops: u32,
    /// The edge through which the vertex is reached. `None` only at the
    /// source itself.
    pub via: Option<EdgeId>,
}

/// Result of [`shortest_paths`]: per reachable vertex, its distance and
/// predecessor edge. Vertices absent from the table are unreachable.
#[derive(Debug, Clone)]
pub struct PathTable {
    source: VertexId,
    entries: HashMap<VertexId, PathEntry>,
}

impl PathTable {
    /// The source vertex the table was computed from.
    pub fn source(&self) -> VertexId {
        self.source
    }

    /// The table entry for `vertex`, or `None` if it is unreachable.
    pub fn entry(&self, vertex: VertexId) -> Option<PathEntry> {
        self.entries.get(&vertex).copied()
    }

    /// The accumulated cost to `vertex`, or `None` if it is unreachable.
    pub fn distance(&self, vertex: VertexId) -> Option<f64> {
        self.entry(vertex).map(|e| e.distance)
    }

    /// Whether `vertex` can be reached from the source.
    pub fn is_reachable(&self, vertex: VertexId) -> bool {
        self.entries.contains_key(&vertex)
    }

    /// The edges of the path from the source to `to`, in source-to-target
    /// order, obtained by walking the predecessor edges. Returns `None` if
    /// `to` is unreachable.
    pub fn edge_path(&self, graph: &PlanGraph, to: VertexId) -> Option<Vec<EdgeId>> {
        let mut path = Vec::new();
        let mut cursor = to;
        while cursor != self.source {
            let edge = self.entries.get(&cursor)?.via?;
            path.push(edge);
            cursor = opposite(graph, cursor, edge);
        }
        path.reverse();
        Some(path)
    }
}

/// Compute shortest paths from `source` by iterative relaxation until a
/// fixed point is reached.
///
/// Costs are additive and non-negative. Ties between equal-cost paths are
/// broken by hop count, then by the rank of the final edge (lower wins), so
/// the resulting predecessor forest is unique for a given ranking.
pub fn shortest_paths(graph: &PlanGraph, source: VertexId) -> PathTable {
    let mut entries: HashMap<VertexId, PathEntry> = HashMap::new();
    entries.insert(
        source,
        PathEntry {
            distance: 0.0,
            hops: 0,
            via: None,
        },
    );

    let mut changed = true;
    while changed {
        changed = false;
        for edge in graph.edge_indices() {
            let (a, b) = match graph.edge_endpoints(edge) {
                Some(ends) => ends,
                None => continue,
            };
            let weight = graph[edge];
            for (from, to) in [(a, b), (b, a)] {
                let reached = match entries.get(&from) {
                    Some(entry) => *entry,
                    None => continue,
                };
                // never walk back out through the edge we arrived by
                if reached.via == Some(edge) {
                    continue;
                }
                let candidate = PathEntry {
                    distance: reached.distance + weight.cost,
                    hops: reached.hops + 1,
                    via: Some(edge),
                };
                if improves(graph, candidate, entries.get(&to)) {
                    entries.insert(to, candidate);
                    changed = true;
                }
            }
        }
    }

    PathTable { source, entries }
}

fn improves(graph: &PlanGraph, candidate: PathEntry, current: Option<&PathEntry>) -> bool {
    let current = match current {
        Some(entry) => entry,
        None => return true,
    };
    if candidate.distance < current.distance {
        return true;
    }
    if candidate.distance > current.distance {
        return false;
    }
    if candidate.hops != current.hops {
        return candidate.hops < current.hops;
    }
    via_rank(graph, candidate.via) < via_rank(graph, current.via)
}
