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

//! # Graph library
//!
//! Algorithms over an undirected weighted multigraph `G = (V, E, w, c)`,
//! where `w` is an additive cost and `c` a capacity. The planner uses three
//! operations:
//!
//! - [`shortest_paths`]: distance-vector relaxation from a source vertex,
//!   reporting the predecessor edge per vertex.
//! - [`minimum_spanning_tree`]: Prim's algorithm over all vertices.
//! - [`goal_spanning_tree`]: a subtree connecting a designated vertex set,
//!   minimising total cost subject to a per-edge capacity floor. This is the
//!   classic 2-approximation of the Steiner tree (metric closure, MST,
//!   path substitution, reduction). The operational topologies are small, so
//!   the approximation is cheap, deterministic, and predictable.
//!
//! All tie-breaks are deterministic: equal-cost alternatives are decided by
//! hop count and then by the caller-supplied edge rank (lower wins), so that
//! repeated runs over the same topology produce the same plan.

use petgraph::stable_graph::{EdgeIndex, NodeIndex, StableUnGraph};
use thiserror::Error;

mod paths;
mod tree;

pub use paths::{shortest_paths, PathEntry, PathTable};
pub use tree::{goal_spanning_tree, minimum_spanning_tree};

/// Vertex identification (and index into the graph)
pub type VertexId = NodeIndex<u32>;
/// Edge identification (and index into the graph)
pub type EdgeId = EdgeIndex<u32>;

/// Attributes of a single edge in the planning graph.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EdgeWeight {
    /// Additive cost of traversing the edge.
    pub cost: f64,
    /// Capacity of the edge, compared against the capacity gate of
    /// [`goal_spanning_tree`].
    pub capacity: f64,
    /// Caller-supplied total order used for deterministic tie-breaks.
    /// Lower ranks are preferred.
    pub rank: u64,
}

/// The planning graph: an undirected multigraph with [`EdgeWeight`] edges.
pub type PlanGraph = StableUnGraph<(), EdgeWeight>;

/// Errors of the graph algorithms
#[derive(Debug, Error, PartialEq)]
pub enum GraphError {
    /// A vertex of the goal set cannot be reached from the rest of the goal
    /// set at the requested capacity.
    #[error("vertex {0:?} is unreachable at the requested capacity")]
    Unreachable(VertexId),
}

/// Rank of the edge an entry was reached through, with the source anchored
/// at rank zero.
pub(crate) fn via_rank(graph: &PlanGraph, via: Option<EdgeId>) -> u64 {
    via.map(|e| graph[e].rank).unwrap_or(0)
}

/// The endpoint of `edge` that is not `vertex`.
pub(crate) fn opposite(graph: &PlanGraph, vertex: VertexId, edge: EdgeId) -> VertexId {
    let (a, b) = graph
        .edge_endpoints(edge)
        .expect("edge must belong to the graph");
    if a == vertex {
        b
    } else {
        a
    }
}
