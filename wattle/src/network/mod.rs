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

//! # The network composition model
//!
//! A [`Network`] is a point of service: tenants submit a
//! [`ConnectionRequest`] naming a set of the network's terminals (each with
//! a label) and a minimum bidirectional bandwidth, and receive a
//! lifecycle-managed [`Service`](service::Service).
//!
//! Networks come in two variants. A [`Switch`](switch::Switch) owns
//! terminals backed by interfaces of a single fabric, and realises a service
//! as one fabric bridge. An [`Aggregator`](aggregator::Aggregator) composes
//! *inferior* networks (switches or further aggregators, referenced weakly
//! by name) with [trunks](trunk) between their terminals, plans a spanning
//! tree over the trunk topology for each service, allocates trunk labels and
//! bandwidth, and delegates per-inferior sub-requests downwards. State
//! changes propagate back up through listeners.

pub mod aggregator;
pub mod service;
pub mod switch;
pub mod trunk;

pub use aggregator::Aggregator;
pub use service::{Service, ServiceEvent, ServiceId, ServiceListener, ServiceState};
pub use switch::Switch;
pub use trunk::{Trunk, TrunkEnd, TrunkId};

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// A label subdividing traffic on a terminal (a 12-bit VLAN tag, or a 24-bit
/// stacked pair on double-tagged ports).
pub type Label = u32;

/// Bandwidth, in megabits per second.
pub type Bandwidth = f64;

/// A point of access to a network: a terminal name qualified by the owning
/// network's name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Terminal {
    /// Name of the owning network.
    pub network: String,
    /// Local name of the terminal within its network.
    pub name: String,
}

impl fmt::Display for Terminal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.network, self.name)
    }
}

/// A terminal paired with the label that selects a traffic subset on it. The
/// terminal is named locally to the network a request is submitted to.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EndPoint {
    /// Local name of the terminal.
    pub terminal: String,
    /// Label selecting the traffic subset.
    pub label: Label,
}

impl EndPoint {
    /// Create an end point from a terminal name and a label.
    pub fn of<S: Into<String>>(terminal: S, label: Label) -> Self {
        Self {
            terminal: terminal.into(),
            label,
        }
    }
}

impl fmt::Display for EndPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.terminal, self.label)
    }
}

/// Describes a required connection in terms of terminal end points and a
/// minimum bidirectional bandwidth.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionRequest {
    /// The set of end points to be connected.
    pub endpoints: BTreeSet<EndPoint>,
    /// The minimum bandwidth of the connection, in each direction.
    pub bandwidth: Bandwidth,
}

impl ConnectionRequest {
    /// Create a connection request.
    pub fn of<I: IntoIterator<Item = EndPoint>>(endpoints: I, bandwidth: Bandwidth) -> Self {
        Self {
            endpoints: endpoints.into_iter().collect(),
            bandwidth,
        }
    }
}

/// # Network variant
/// A network is either a [`Switch`] or an [`Aggregator`]. The enum behaves
/// like the common management and service surface of both; variant-specific
/// operations (terminal registration, trunk management) live on the concrete
/// types, which are cheap handles and can be cloned before wrapping.
pub enum Network {
    /// A single switch on one fabric.
    Switch(Switch),
    /// A composite of inferior networks joined by trunks.
    Aggregator(Aggregator),
}

impl Network {
    /// The network's name.
    pub fn name(&self) -> &str {
        match self {
            Self::Switch(s) => s.name(),
            Self::Aggregator(a) => a.name(),
        }
    }

    /// Create a new service in the `Dormant` state.
    pub fn new_service(&self) -> Service {
        match self {
            Self::Switch(s) => s.new_service(),
            Self::Aggregator(a) => a.new_service(),
        }
    }

    /// Look up an existing service by id.
    pub fn await_service(&self, id: ServiceId) -> Option<Service> {
        match self {
            Self::Switch(s) => s.await_service(id),
            Self::Aggregator(a) => a.await_service(id),
        }
    }

    /// The ids of all services of this network.
    pub fn list_services(&self) -> Vec<ServiceId> {
        match self {
            Self::Switch(s) => s.list_services(),
            Self::Aggregator(a) => a.list_services(),
        }
    }

    /// Whether the network owns a terminal with the given local name.
    pub fn has_terminal(&self, name: &str) -> bool {
        match self {
            Self::Switch(s) => s.get_terminal(name).is_ok(),
            Self::Aggregator(a) => a.get_terminal(name).is_ok(),
        }
    }

    /// The local names of all terminals of this network.
    pub fn list_terminals(&self) -> Vec<String> {
        match self {
            Self::Switch(s) => s.list_terminals(),
            Self::Aggregator(a) => a.list_terminals(),
        }
    }

    /// Returns the switch, if this network is one.
    pub fn switch(&self) -> Option<&Switch> {
        match self {
            Self::Switch(s) => Some(s),
            Self::Aggregator(_) => None,
        }
    }

    /// Returns the aggregator, if this network is one.
    pub fn aggregator(&self) -> Option<&Aggregator> {
        match self {
            Self::Switch(_) => None,
            Self::Aggregator(a) => Some(a),
        }
    }

    /// Returns the switch or **panics**, if the network is an aggregator.
    pub fn unwrap_switch(&self) -> &Switch {
        match self {
            Self::Switch(s) => s,
            Self::Aggregator(_) => panic!("`unwrap_switch()` called on an aggregator"),
        }
    }

    /// Returns the aggregator or **panics**, if the network is a switch.
    pub fn unwrap_aggregator(&self) -> &Aggregator {
        match self {
            Self::Switch(_) => panic!("`unwrap_aggregator()` called on a switch"),
            Self::Aggregator(a) => a,
        }
    }
}

impl fmt::Debug for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Switch(s) => write!(f, "Network::Switch({})", s.name()),
            Self::Aggregator(a) => write!(f, "Network::Aggregator({})", a.name()),
        }
    }
}
