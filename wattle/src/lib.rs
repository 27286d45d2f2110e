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

#![deny(missing_docs)]

//! # Wattle: a hierarchical data-plane service broker
//!
//! Wattle provisions and maintains point-to-multipoint layer-2 circuits
//! ("services") across a set of programmable switches interconnected by
//! operator-declared trunks. A tenant names a set of terminal/label end points
//! and a minimum bidirectional bandwidth; the broker plots a least-cost
//! spanning tree over the trunk topology, allocates VLAN labels and bandwidth
//! on every trunk of the tree, commands the underlying switch fabrics to
//! install forwarding state, and reports lifecycle transitions back through
//! listeners.
//!
//! ## Structure
//!
//! - **[`graph`]**: the weighted multigraph algorithms used by the planner:
//!   distance-vector shortest paths, Prim's minimum spanning tree, and the
//!   goal-set spanning tree (a deterministic 2-approximation of the Steiner
//!   tree) with a bandwidth capacity gate.
//!
//! - **[`fabric`]**: the driver contract consumed by switches. A fabric turns
//!   a set of circuits (interface + label, each with per-direction bandwidth)
//!   into a *bridge*, and reports its fate asynchronously. The in-process
//!   [`DummyFabric`](fabric::dummy::DummyFabric) realises the contract for
//!   tests and demonstrations.
//!
//! - **[`network`]**: the composition model. A [`Network`](network::Network)
//!   is either a [`Switch`](network::Switch) (terminals backed by fabric
//!   interfaces, one bridge per service) or an
//!   [`Aggregator`](network::Aggregator) (external terminals aliasing
//!   inferior-network terminals, plus trunks between inferior networks).
//!   Aggregators decompose a tenant request into sub-requests on their
//!   inferior networks and fold the sub-service states back into one
//!   composite lifecycle.
//!
//! - **[`config`]** and **[`agent`]**: TOML configuration of a broker and the
//!   type-keyed factory registry that builds fabrics, switches and
//!   aggregators from it.
//!
//! - **[`persist`]**: serialisable records of every network's terminals,
//!   trunks, label allocations and live service plans, plus the restart
//!   reconciliation that re-adopts fabric bridges and garbage-collects the
//!   rest.
//!
//! ## Example
//!
//! Two terminals on one switch, joined at 100 Mb/s in each direction:
//!
//! ```rust
//! use std::sync::Arc;
//! use wattle::fabric::dummy::DummyFabric;
//! use wattle::network::{ConnectionRequest, EndPoint, Network, ServiceState, Switch};
//!
//! fn main() -> Result<(), wattle::Error> {
//!     let fabric = Arc::new(DummyFabric::new("fab"));
//!     let sw = Switch::new("s1", fabric);
//!     sw.add_terminal("a", "phys:1")?;
//!     sw.add_terminal("b", "phys:2")?;
//!
//!     let net = Arc::new(Network::Switch(sw));
//!     let service = net.new_service();
//!     let request = ConnectionRequest::of([EndPoint::of("a", 10), EndPoint::of("b", 20)], 100.0);
//!     service.initiate(request)?;
//!     assert_eq!(service.status(), ServiceState::Inactive);
//!
//!     service.activate()?;
//!     assert_eq!(service.status(), ServiceState::Active);
//!
//!     service.release()?;
//!     assert_eq!(service.status(), ServiceState::Released);
//!     Ok(())
//! }
//! ```

pub mod agent;
pub mod config;
pub mod fabric;
pub mod graph;
pub mod network;
pub mod persist;

mod error;
pub use error::Error;

// test modules
mod test;
