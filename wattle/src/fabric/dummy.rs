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

//! An in-process fabric driver for tests and demonstrations.
//!
//! The dummy fabric realises the whole [`Fabric`] contract in memory:
//! idempotent bridge creation, listener reinstallation, asynchronous-style
//! callbacks, fault injection per interface or per bridge, and `retain`
//! garbage collection. By default a requested bridge reports `created`
//! before [`Fabric::bridge`] returns; a fabric built with
//! [`DummyFabric::deferred`] holds bridges pending until
//! [`complete_pending`](DummyFabric::complete_pending) is called, which lets
//! tests observe the `Establishing` window.

use super::{Bridge, BridgeId, BridgeListener, Circuit, Fabric, FabricError, Interface, TrafficFlow};
use crate::network::Label;
use log::*;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

/// Interface descriptions are `name` or `name:label`, where `name` is a
/// non-empty run of alphanumerics, `-` and `_`, and `label` is an unsigned
/// integer tagging a sub-port.
fn parse_interface(desc: &str) -> Option<Interface> {
    let (base, label) = match desc.split_once(':') {
        Some((base, label)) => (base, Some(label)),
        None => (desc, None),
    };
    if base.is_empty() || !base.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return None;
    }
    if let Some(label) = label {
        label.parse::<Label>().ok()?;
    }
    Some(Interface::new(desc))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BridgeState {
    Pending,
    Up,
    Down,
    Broken,
}

struct DummyBridge {
    id: BridgeId,
    circuits: BTreeMap<Circuit, TrafficFlow>,
    state: Mutex<BridgeState>,
    listener: Mutex<Arc<dyn BridgeListener>>,
}

impl DummyBridge {
    fn listener(&self) -> Arc<dyn BridgeListener> {
        self.listener.lock().unwrap().clone()
    }

    fn state(&self) -> BridgeState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, state: BridgeState) {
        *self.state.lock().unwrap() = state;
    }
}

impl Bridge for DummyBridge {
    fn id(&self) -> BridgeId {
        self.id
    }

    fn circuits(&self) -> BTreeMap<Circuit, TrafficFlow> {
        self.circuits.clone()
    }

    fn destroy(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if *state == BridgeState::Down {
                return;
            }
            *state = BridgeState::Down;
        }
        self.listener().destroyed();
    }
}

struct Inner {
    auto_complete: bool,
    next_id: BridgeId,
    bridges: BTreeMap<BridgeId, Arc<DummyBridge>>,
    by_circuits: HashMap<BTreeSet<Circuit>, BridgeId>,
    broken_interfaces: BTreeSet<String>,
    pending: Vec<BridgeId>,
    removed: Vec<BridgeId>,
}

/// An in-memory fabric.
pub struct DummyFabric {
    name: String,
    inner: Mutex<Inner>,
}

impl DummyFabric {
    /// Create a fabric whose bridges complete immediately.
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self::with_mode(name, true)
    }

    /// Create a fabric whose bridges stay pending until
    /// [`complete_pending`](Self::complete_pending) is called.
    pub fn deferred<S: Into<String>>(name: S) -> Self {
        Self::with_mode(name, false)
    }

    fn with_mode<S: Into<String>>(name: S, auto_complete: bool) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(Inner {
                auto_complete,
                next_id: 1,
                bridges: BTreeMap::new(),
                by_circuits: HashMap::new(),
                broken_interfaces: BTreeSet::new(),
                pending: Vec::new(),
                removed: Vec::new(),
            }),
        }
    }

    /// Declare an interface faulty: every subsequent bridge using it reports
    /// `error` instead of `created`.
    pub fn break_interface(&self, desc: &str) {
        self.inner
            .lock()
            .unwrap()
            .broken_interfaces
            .insert(desc.to_string());
    }

    /// Inject an irreversible fault into a live bridge, as if the device had
    /// lost it.
    pub fn fail_bridge(&self, id: BridgeId) {
        let bridge = {
            let inner = self.inner.lock().unwrap();
            inner.bridges.get(&id).cloned()
        };
        if let Some(bridge) = bridge {
            if matches!(bridge.state(), BridgeState::Pending | BridgeState::Up) {
                bridge.set_state(BridgeState::Broken);
                bridge
                    .listener()
                    .error(FabricError::Driver(format!("bridge {} lost", id)));
            }
        }
    }

    /// Complete all pending bridges of a deferred fabric, reporting
    /// `created` (or `error` for bridges on broken interfaces).
    pub fn complete_pending(&self) {
        let ready: Vec<Arc<DummyBridge>> = {
            let mut inner = self.inner.lock().unwrap();
            let ids = std::mem::take(&mut inner.pending);
            ids.iter().filter_map(|id| inner.bridges.get(id).cloned()).collect()
        };
        for bridge in ready {
            self.settle(&bridge);
        }
    }

    /// Decide the fate of a pending bridge and notify its listener.
    fn settle(&self, bridge: &Arc<DummyBridge>) {
        if bridge.state() != BridgeState::Pending {
            return;
        }
        let fault = {
            let inner = self.inner.lock().unwrap();
            bridge
                .circuits
                .keys()
                .find(|c| inner.broken_interfaces.contains(c.interface.name()))
                .cloned()
        };
        match fault {
            Some(circuit) => {
                bridge.set_state(BridgeState::Broken);
                bridge
                    .listener()
                    .error(FabricError::Driver(format!("no such port: {}", circuit.interface)));
            }
            None => {
                bridge.set_state(BridgeState::Up);
                bridge.listener().created();
            }
        }
    }

    /// Number of live (pending or established) bridges.
    pub fn bridge_count(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner
            .bridges
            .values()
            .filter(|b| matches!(b.state(), BridgeState::Pending | BridgeState::Up))
            .count()
    }

    /// The identities of all live bridges.
    pub fn live_bridges(&self) -> BTreeSet<BridgeId> {
        let inner = self.inner.lock().unwrap();
        inner
            .bridges
            .values()
            .filter(|b| matches!(b.state(), BridgeState::Pending | BridgeState::Up))
            .map(|b| b.id)
            .collect()
    }

    /// The circuits of a bridge, live or not.
    pub fn bridge_circuits(&self, id: BridgeId) -> Option<BTreeMap<Circuit, TrafficFlow>> {
        let inner = self.inner.lock().unwrap();
        inner.bridges.get(&id).map(|b| b.circuits.clone())
    }

    /// Bridges garbage-collected by [`Fabric::retain`], in collection order.
    pub fn removed_bridges(&self) -> Vec<BridgeId> {
        self.inner.lock().unwrap().removed.clone()
    }
}

impl Fabric for DummyFabric {
    fn name(&self) -> &str {
        &self.name
    }

    fn interface(&self, desc: &str) -> Result<Interface, FabricError> {
        parse_interface(desc).ok_or_else(|| FabricError::UnknownInterface(desc.to_string()))
    }

    fn bridge(
        &self,
        listener: Arc<dyn BridgeListener>,
        circuits: BTreeMap<Circuit, TrafficFlow>,
    ) -> Arc<dyn Bridge> {
        let key: BTreeSet<Circuit> = circuits.keys().cloned().collect();
        let (bridge, refire) = {
            let mut inner = self.inner.lock().unwrap();
            let existing = inner
                .by_circuits
                .get(&key)
                .and_then(|id| inner.bridges.get(id))
                .filter(|b| matches!(b.state(), BridgeState::Pending | BridgeState::Up))
                .cloned();
            match existing {
                Some(bridge) => {
                    debug!("fabric {}: adopting bridge {} for equal circuit set", self.name, bridge.id);
                    *bridge.listener.lock().unwrap() = listener.clone();
                    let refire = bridge.state() == BridgeState::Up;
                    (bridge, refire)
                }
                None => {
                    let id = inner.next_id;
                    inner.next_id += 1;
                    debug!("fabric {}: new bridge {} over {} circuits", self.name, id, circuits.len());
                    let bridge = Arc::new(DummyBridge {
                        id,
                        circuits,
                        state: Mutex::new(BridgeState::Pending),
                        listener: Mutex::new(listener.clone()),
                    });
                    inner.bridges.insert(id, bridge.clone());
                    inner.by_circuits.insert(key, id);
                    if inner.auto_complete {
                        (bridge, false)
                    } else {
                        inner.pending.push(id);
                        (bridge, false)
                    }
                }
            }
        };
        if refire {
            listener.created();
        } else if bridge.state() == BridgeState::Pending {
            let auto = self.inner.lock().unwrap().auto_complete;
            if auto {
                self.settle(&bridge);
            }
        }
        bridge
    }

    fn retain(&self, keep: &BTreeSet<BridgeId>) {
        let dropped: Vec<Arc<DummyBridge>> = {
            let mut inner = self.inner.lock().unwrap();
            let doomed: Vec<Arc<DummyBridge>> = inner
                .bridges
                .values()
                .filter(|b| {
                    !keep.contains(&b.id)
                        && matches!(b.state(), BridgeState::Pending | BridgeState::Up)
                })
                .cloned()
                .collect();
            for bridge in &doomed {
                inner.bridges.remove(&bridge.id);
                inner.by_circuits.retain(|_, id| *id != bridge.id);
                inner.pending.retain(|id| *id != bridge.id);
                inner.removed.push(bridge.id);
            }
            doomed
        };
        for bridge in dropped {
            info!("fabric {}: garbage-collecting bridge {}", self.name, bridge.id);
            bridge.set_state(BridgeState::Down);
        }
    }
}
