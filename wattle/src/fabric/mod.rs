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

//! # Fabric driver contract
//!
//! A *fabric* is the switch-specific driver that realises forwarding state in
//! hardware or firmware. The broker consumes fabrics through the [`Fabric`]
//! trait and never learns how a driver talks to its device.
//!
//! A fabric names its ports through [`Interface`] descriptions (purely
//! syntactic), and connects sets of [`Circuit`]s (interface + label, each
//! with a per-direction [`TrafficFlow`]) into a [`Bridge`]. Bridges are
//! asynchronous: the [`BridgeListener`] passed at creation is invoked with
//! `created`, `destroyed` or `error`, possibly from a driver-owned thread.
//! An `error` is irreversible for a bridge; the client must create a fresh
//! one.
//!
//! Bridge creation is idempotent under equal circuit sets: re-submitting the
//! same circuits returns the existing bridge and reinstalls the listener.
//! Together with [`Fabric::retain`], which declares the set of bridges the
//! client still wants and garbage-collects the rest, this is how the broker
//! reconciles with a fabric after a restart.

use crate::network::{Bandwidth, Label};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

pub mod dummy;

/// Fabric-scoped identification of a bridge
pub type BridgeId = u64;

/// A named port (or tagged sub-port) of a fabric. The description is purely
/// syntactic; only the owning fabric interprets it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Interface {
    name: String,
}

impl Interface {
    /// Wrap an interface description.
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self { name: name.into() }
    }

    /// The interface description.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for Interface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// An end point as seen by a fabric: an interface plus the label that
/// subdivides traffic on it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Circuit {
    /// The fabric interface carrying the circuit.
    pub interface: Interface,
    /// The label selecting the circuit's traffic on the interface.
    pub label: Label,
}

impl Circuit {
    /// Create a circuit from an interface and a label.
    pub fn new(interface: Interface, label: Label) -> Self {
        Self { interface, label }
    }
}

impl fmt::Display for Circuit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.interface, self.label)
    }
}

/// Per-direction bandwidth of a circuit within a bridge.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrafficFlow {
    /// Bandwidth of traffic entering the bridge through the circuit.
    pub ingress: Bandwidth,
    /// Bandwidth of traffic leaving the bridge through the circuit.
    pub egress: Bandwidth,
}

impl TrafficFlow {
    /// A flow with the same bandwidth in both directions.
    pub fn symmetric(bandwidth: Bandwidth) -> Self {
        Self {
            ingress: bandwidth,
            egress: bandwidth,
        }
    }
}

/// Receives the asynchronous fate of a bridge. Implementations must not
/// assume any particular calling thread.
pub trait BridgeListener: Send + Sync {
    /// The bridge has been established and carries traffic.
    fn created(&self);

    /// The bridge has been torn down.
    fn destroyed(&self);

    /// The bridge has failed. The failure is irreversible; a client wanting
    /// the connectivity back must create a fresh bridge.
    fn error(&self, reason: FabricError);
}

/// A fabric-level grouping of circuits stitched together for forwarding.
pub trait Bridge: Send + Sync {
    /// The fabric-scoped identity of the bridge.
    fn id(&self) -> BridgeId;

    /// The circuits the bridge connects.
    fn circuits(&self) -> BTreeMap<Circuit, TrafficFlow>;

    /// Tear the bridge down. The listener receives `destroyed` when the
    /// fabric has released the forwarding state.
    fn destroy(&self);
}

/// The driver contract consumed by switches.
pub trait Fabric: Send + Sync {
    /// The fabric's name, for diagnostics.
    fn name(&self) -> &str;

    /// Resolve an interface description. This is purely syntactic; the
    /// fabric rejects descriptions it cannot parse.
    fn interface(&self, desc: &str) -> Result<Interface, FabricError>;

    /// Request a bridge connecting `circuits`. The fabric may return an
    /// existing equivalent bridge (creation is idempotent under equal
    /// circuit sets); in that case `listener` replaces the previous one and
    /// is told the current state.
    fn bridge(
        &self,
        listener: Arc<dyn BridgeListener>,
        circuits: BTreeMap<Circuit, TrafficFlow>,
    ) -> Arc<dyn Bridge>;

    /// Declare the set of bridges the client still wants. The fabric
    /// garbage-collects all others.
    fn retain(&self, keep: &BTreeSet<BridgeId>);
}

/// Errors reported by fabric drivers
#[derive(Debug, Clone, Error, PartialEq)]
pub enum FabricError {
    /// The fabric cannot parse an interface description.
    #[error("unknown interface description: {0}")]
    UnknownInterface(String),
    /// The driver reported a fault while realising a bridge.
    #[error("driver fault: {0}")]
    Driver(String),
}
