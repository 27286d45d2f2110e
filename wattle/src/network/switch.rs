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

//! # Switch
//!
//! A switch owns a set of terminals, each backed by an interface of its
//! fabric, and realises every service as exactly one fabric bridge. The
//! fabric is never called while the switch lock is held: circuits are staged
//! under the lock, the lock is released, the driver is called, and the lock
//! is re-acquired to record the outcome.

use crate::fabric::{
    Bridge, BridgeId, BridgeListener, Circuit, Fabric, FabricError, Interface, TrafficFlow,
};
use crate::network::service::{
    allocate_id, reserve_id, EventOutbox, LifecycleError, Service, ServiceEvent, ServiceId,
    ServiceListener, ServiceState,
};
use crate::network::{ConnectionRequest, Terminal};
use crate::Error;
use log::*;
use std::collections::BTreeMap;
use std::sync::{Arc, Condvar, Mutex, Weak};
use thiserror::Error as ThisError;

/// Switch management errors
#[derive(Debug, ThisError, PartialEq)]
pub enum SwitchError {
    /// The proposed terminal name is already in use.
    #[error("terminal {0} already exists")]
    TerminalExists(String),
    /// No terminal with the given name exists.
    #[error("unknown terminal: {0}")]
    UnknownTerminal(String),
    /// The terminal is referenced by a live service.
    #[error("terminal {0} is used by service {1}")]
    TerminalInUse(String, ServiceId),
    /// The fabric rejected the backing interface description.
    #[error("fabric rejected the backing interface: {0}")]
    UnknownInterface(#[from] FabricError),
}

pub(crate) struct SwitchShared {
    name: String,
    fabric: Arc<dyn Fabric>,
    inner: Mutex<SwitchInner>,
}

struct SwitchInner {
    terminals: BTreeMap<String, Interface>,
    services: BTreeMap<ServiceId, Arc<SwitchService>>,
}

/// A single switch on one fabric. The handle is cheap to clone; clones share
/// the switch's state.
#[derive(Clone)]
pub struct Switch {
    shared: Arc<SwitchShared>,
}

impl Switch {
    /// Create a switch with no terminals on the given fabric.
    pub fn new<S: Into<String>>(name: S, fabric: Arc<dyn Fabric>) -> Self {
        Self {
            shared: Arc::new(SwitchShared {
                name: name.into(),
                fabric,
                inner: Mutex::new(SwitchInner {
                    terminals: BTreeMap::new(),
                    services: BTreeMap::new(),
                }),
            }),
        }
    }

    /// The switch's name.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Register a terminal backed by a fabric interface.
    pub fn add_terminal(&self, name: &str, interface_desc: &str) -> Result<Terminal, SwitchError> {
        // resolve the description first; the fabric is not called under the
        // switch lock
        let interface = self.shared.fabric.interface(interface_desc)?;
        let mut inner = self.shared.inner.lock().unwrap();
        if inner.terminals.contains_key(name) {
            return Err(SwitchError::TerminalExists(name.to_string()));
        }
        inner.terminals.insert(name.to_string(), interface);
        debug!("switch {}: terminal {} -> {}", self.shared.name, name, interface_desc);
        Ok(Terminal {
            network: self.shared.name.clone(),
            name: name.to_string(),
        })
    }

    /// Look up a terminal by name.
    pub fn get_terminal(&self, name: &str) -> Result<Terminal, SwitchError> {
        let inner = self.shared.inner.lock().unwrap();
        if inner.terminals.contains_key(name) {
            Ok(Terminal {
                network: self.shared.name.clone(),
                name: name.to_string(),
            })
        } else {
            Err(SwitchError::UnknownTerminal(name.to_string()))
        }
    }

    /// Remove a terminal. Fails while any live service references it.
    pub fn remove_terminal(&self, name: &str) -> Result<(), SwitchError> {
        let mut inner = self.shared.inner.lock().unwrap();
        if !inner.terminals.contains_key(name) {
            return Err(SwitchError::UnknownTerminal(name.to_string()));
        }
        for (id, service) in &inner.services {
            if service.is_live() && service.uses_terminal(name) {
                return Err(SwitchError::TerminalInUse(name.to_string(), *id));
            }
        }
        inner.terminals.remove(name);
        Ok(())
    }

    /// The local names of all terminals.
    pub fn list_terminals(&self) -> Vec<String> {
        self.shared.inner.lock().unwrap().terminals.keys().cloned().collect()
    }

    /// The interface backing a terminal.
    pub fn terminal_interface(&self, name: &str) -> Result<Interface, SwitchError> {
        let inner = self.shared.inner.lock().unwrap();
        inner
            .terminals
            .get(name)
            .cloned()
            .ok_or_else(|| SwitchError::UnknownTerminal(name.to_string()))
    }

    /// Create a new service in the `Dormant` state.
    pub fn new_service(&self) -> Service {
        let id = allocate_id();
        let service = SwitchService::fresh(id, Arc::downgrade(&self.shared));
        self.shared.inner.lock().unwrap().services.insert(id, service.clone());
        Service::Switch(service)
    }

    /// Look up an existing service by id.
    pub fn await_service(&self, id: ServiceId) -> Option<Service> {
        self.shared
            .inner
            .lock()
            .unwrap()
            .services
            .get(&id)
            .cloned()
            .map(Service::Switch)
    }

    /// The ids of all services of this switch.
    pub fn list_services(&self) -> Vec<ServiceId> {
        self.shared.inner.lock().unwrap().services.keys().copied().collect()
    }

    /// Recreate a persisted service in the `Establishing` state. The caller
    /// attaches listeners and then calls [`SwitchService::resubmit`] to
    /// re-adopt the fabric bridge.
    pub(crate) fn restore_service(
        &self,
        id: ServiceId,
        request: ConnectionRequest,
    ) -> Result<Arc<SwitchService>, Error> {
        reserve_id(id);
        let circuits = {
            let inner = self.shared.inner.lock().unwrap();
            stage_circuits(&inner, &request)?
        };
        let service = SwitchService::fresh(id, Arc::downgrade(&self.shared));
        {
            let mut body = service.body.lock().unwrap();
            body.state = ServiceState::Establishing;
            body.request = Some(request);
            body.circuits = circuits;
        }
        self.shared.inner.lock().unwrap().services.insert(id, service.clone());
        Ok(service)
    }
}

/// Map every end point of `request` to a fabric circuit at the requested
/// per-direction bandwidth.
fn stage_circuits(
    inner: &SwitchInner,
    request: &ConnectionRequest,
) -> Result<BTreeMap<Circuit, TrafficFlow>, SwitchError> {
    let mut circuits = BTreeMap::new();
    for endpoint in &request.endpoints {
        let interface = inner
            .terminals
            .get(&endpoint.terminal)
            .ok_or_else(|| SwitchError::UnknownTerminal(endpoint.terminal.clone()))?;
        circuits.insert(
            Circuit::new(interface.clone(), endpoint.label),
            TrafficFlow::symmetric(request.bandwidth),
        );
    }
    Ok(circuits)
}

struct ServiceBody {
    state: ServiceState,
    request: Option<ConnectionRequest>,
    circuits: BTreeMap<Circuit, TrafficFlow>,
    bridge: Option<Arc<dyn Bridge>>,
}

/// A service of a switch: at most one fabric bridge.
pub struct SwitchService {
    id: ServiceId,
    weak: Weak<SwitchService>,
    switch: Weak<SwitchShared>,
    body: Mutex<ServiceBody>,
    stable: Condvar,
    outbox: EventOutbox,
}

/// Routes bridge callbacks back into the owning service.
struct BridgeTap {
    service: Weak<SwitchService>,
}

impl BridgeListener for BridgeTap {
    fn created(&self) {
        if let Some(service) = self.service.upgrade() {
            service.bridge_created();
        }
    }

    fn destroyed(&self) {
        if let Some(service) = self.service.upgrade() {
            service.bridge_destroyed();
        }
    }

    fn error(&self, reason: FabricError) {
        if let Some(service) = self.service.upgrade() {
            service.bridge_error(reason);
        }
    }
}

impl SwitchService {
    fn fresh(id: ServiceId, switch: Weak<SwitchShared>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            id,
            weak: weak.clone(),
            switch,
            body: Mutex::new(ServiceBody {
                state: ServiceState::Dormant,
                request: None,
                circuits: BTreeMap::new(),
                bridge: None,
            }),
            stable: Condvar::new(),
            outbox: EventOutbox::new(),
        })
    }

    /// The broker-scoped id of the service.
    pub fn id(&self) -> ServiceId {
        self.id
    }

    /// The current state of the service.
    pub fn status(&self) -> ServiceState {
        self.body.lock().unwrap().state
    }

    /// Subscribe a listener to the service's event channel.
    pub fn add_listener(&self, listener: Arc<dyn ServiceListener>) {
        self.outbox.subscribe(listener);
    }

    /// Submit a connection request. All end points must name terminals of
    /// this switch; the request needs at least two end points. Establishment
    /// completes asynchronously through the bridge listener.
    pub fn initiate(&self, request: ConnectionRequest) -> Result<(), Error> {
        let shared = self
            .switch
            .upgrade()
            .ok_or(LifecycleError::NetworkGone(self.id))?;

        // claim the service before staging, so concurrent initiations are
        // serialised by the state machine itself
        let previous = {
            let mut body = self.body.lock().unwrap();
            match body.state {
                ServiceState::Dormant | ServiceState::Released => {}
                state => return Err(LifecycleError::InvalidState(self.id, state).into()),
            }
            if request.endpoints.len() < 2 {
                return Err(LifecycleError::InvalidState(self.id, body.state).into());
            }
            let previous = body.state;
            body.state = ServiceState::Establishing;
            previous
        };

        let circuits = {
            let inner = shared.inner.lock().unwrap();
            match stage_circuits(&inner, &request) {
                Ok(circuits) => circuits,
                Err(e) => {
                    self.body.lock().unwrap().state = previous;
                    return Err(e.into());
                }
            }
        };

        {
            let mut body = self.body.lock().unwrap();
            body.request = Some(request);
            body.circuits = circuits.clone();
            body.bridge = None;
        }

        info!(
            "switch {}: service {} establishing over {} circuits",
            shared.name,
            self.id,
            circuits.len()
        );
        let tap = Arc::new(BridgeTap {
            service: self.weak.clone(),
        });
        let bridge = shared.fabric.bridge(tap, circuits);

        let destroy_now = {
            let mut body = self.body.lock().unwrap();
            let released = matches!(body.state, ServiceState::Releasing | ServiceState::Released);
            if !released {
                body.bridge = Some(bridge.clone());
            }
            released
        };
        if destroy_now {
            // release() overtook us before the handle was recorded
            bridge.destroy();
        }
        self.outbox.deliver(self.id);
        Ok(())
    }

    /// Re-adopt the service's bridge after a restart. Creation is idempotent
    /// under equal circuit sets, so this reinstalls the listener on the
    /// existing bridge (or re-creates it) and returns its id.
    pub(crate) fn resubmit(&self) -> Result<BridgeId, Error> {
        let shared = self
            .switch
            .upgrade()
            .ok_or(LifecycleError::NetworkGone(self.id))?;
        let circuits = self.body.lock().unwrap().circuits.clone();
        let tap = Arc::new(BridgeTap {
            service: self.weak.clone(),
        });
        let bridge = shared.fabric.bridge(tap, circuits);
        let id = bridge.id();
        self.body.lock().unwrap().bridge = Some(bridge);
        self.outbox.deliver(self.id);
        Ok(id)
    }

    /// The request the service was initiated with, if any.
    pub fn request(&self) -> Option<ConnectionRequest> {
        self.body.lock().unwrap().request.clone()
    }

    /// Activate the service. The bridge carries traffic from the moment it
    /// is created, so this is a pure state transition.
    pub fn activate(&self) -> Result<(), LifecycleError> {
        {
            let mut body = self.body.lock().unwrap();
            match body.state {
                ServiceState::Inactive => {
                    body.state = ServiceState::Activating;
                    self.outbox.post(ServiceEvent::Activating);
                    body.state = ServiceState::Active;
                    self.outbox.post(ServiceEvent::Activated);
                }
                ServiceState::Active => {}
                state => return Err(LifecycleError::InvalidState(self.id, state)),
            }
        }
        self.stable.notify_all();
        self.outbox.deliver(self.id);
        Ok(())
    }

    /// Deactivate the service; the mirror of [`activate`](Self::activate).
    pub fn deactivate(&self) -> Result<(), LifecycleError> {
        {
            let mut body = self.body.lock().unwrap();
            match body.state {
                ServiceState::Active => {
                    body.state = ServiceState::Deactivating;
                    self.outbox.post(ServiceEvent::Deactivating);
                    body.state = ServiceState::Inactive;
                    self.outbox.post(ServiceEvent::Deactivated);
                }
                ServiceState::Inactive => {}
                state => return Err(LifecycleError::InvalidState(self.id, state)),
            }
        }
        self.stable.notify_all();
        self.outbox.deliver(self.id);
        Ok(())
    }

    /// Tear down the service's bridge and release the service. Idempotent.
    pub fn release(&self) -> Result<(), LifecycleError> {
        let bridge = {
            let mut body = self.body.lock().unwrap();
            match body.state {
                ServiceState::Releasing | ServiceState::Released => None,
                ServiceState::Dormant => {
                    body.state = ServiceState::Released;
                    self.outbox.post(ServiceEvent::Released);
                    None
                }
                _ => {
                    body.state = ServiceState::Releasing;
                    match body.bridge.take() {
                        Some(bridge) => Some(bridge),
                        None => {
                            body.state = ServiceState::Released;
                            self.outbox.post(ServiceEvent::Released);
                            None
                        }
                    }
                }
            }
        };
        self.stable.notify_all();
        if let Some(bridge) = bridge {
            // the listener turns `destroyed` into Releasing -> Released
            bridge.destroy();
        }
        self.outbox.deliver(self.id);
        Ok(())
    }

    /// Block until the service reaches a stable state, and return it.
    pub fn await_stable(&self) -> ServiceState {
        let mut body = self.body.lock().unwrap();
        while !body.state.is_stable() {
            body = self.stable.wait(body).unwrap();
        }
        body.state
    }

    fn is_live(&self) -> bool {
        !matches!(
            self.status(),
            ServiceState::Dormant | ServiceState::Released
        )
    }

    fn uses_terminal(&self, name: &str) -> bool {
        let body = self.body.lock().unwrap();
        body.request
            .as_ref()
            .map(|r| r.endpoints.iter().any(|ep| ep.terminal == name))
            .unwrap_or(false)
    }

    fn bridge_created(&self) {
        {
            let mut body = self.body.lock().unwrap();
            if body.state != ServiceState::Establishing {
                return;
            }
            body.state = ServiceState::Inactive;
            self.outbox.post(ServiceEvent::Ready);
        }
        self.stable.notify_all();
        self.outbox.deliver(self.id);
    }

    fn bridge_destroyed(&self) {
        {
            let mut body = self.body.lock().unwrap();
            if body.state != ServiceState::Releasing {
                return;
            }
            body.state = ServiceState::Released;
            body.bridge = None;
            self.outbox.post(ServiceEvent::Released);
        }
        self.stable.notify_all();
        self.outbox.deliver(self.id);
    }

    fn bridge_error(&self, reason: FabricError) {
        {
            let mut body = self.body.lock().unwrap();
            match body.state {
                ServiceState::Releasing => {
                    // the bridge is gone either way
                    body.state = ServiceState::Released;
                    body.bridge = None;
                    self.outbox.post(ServiceEvent::Released);
                }
                ServiceState::Dormant | ServiceState::Released | ServiceState::Failed => return,
                _ => {
                    warn!("service {}: bridge failed: {}", self.id, reason);
                    let endpoints = body
                        .request
                        .as_ref()
                        .map(|r| r.endpoints.iter().cloned().collect())
                        .unwrap_or_default();
                    body.state = ServiceState::Failed;
                    self.outbox.post(ServiceEvent::Failed {
                        endpoints,
                        cause: reason.to_string(),
                    });
                }
            }
        }
        self.stable.notify_all();
        self.outbox.deliver(self.id);
    }
}
