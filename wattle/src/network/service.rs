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

//! # Service lifecycle
//!
//! A service is a tenant-facing, lifecycle-managed instantiation of a
//! [`ConnectionRequest`](super::ConnectionRequest). Its state machine runs
//!
//! ```text
//! Dormant -> Establishing -> Inactive <-> (Activating/Deactivating) <-> Active
//!                 |              |                                        |
//!                 v              +------------> Releasing <---------------+
//!               Failed  ------------------------^   |
//!                                                   v
//!                                               Released
//! ```
//!
//! Listeners receive tagged [`ServiceEvent`]s over a single channel per
//! service. Events of one service are delivered in state-machine order; the
//! delivery queue is drained with no internal lock held, so listeners may
//! call back into the broker.

use crate::network::aggregator::AggregatorService;
use crate::network::switch::SwitchService;
use crate::network::{ConnectionRequest, EndPoint};
use crate::Error;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error as ThisError;

/// Broker-scoped service identification
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ServiceId(pub u64);

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate the next broker-scoped service id.
pub(crate) fn allocate_id() -> ServiceId {
    ServiceId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
}

/// Keep the id counter ahead of a restored id.
pub(crate) fn reserve_id(restored: ServiceId) {
    NEXT_ID.fetch_max(restored.0 + 1, Ordering::Relaxed);
}

/// State of a service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceState {
    /// Constructed, no request submitted yet.
    Dormant,
    /// A request has been submitted; the data plane is being prepared.
    Establishing,
    /// Ready to use, not activated.
    Inactive,
    /// Activation in progress.
    Activating,
    /// Active and carrying traffic.
    Active,
    /// Deactivation in progress.
    Deactivating,
    /// Resources are being returned.
    Releasing,
    /// All resources returned. A released service may be re-initiated.
    Released,
    /// Establishment or activation failed; rollback may still be running.
    Failed,
}

impl ServiceState {
    /// Whether the state is stable, i.e. not a transition that completes
    /// asynchronously.
    pub fn is_stable(&self) -> bool {
        matches!(
            self,
            Self::Dormant | Self::Inactive | Self::Active | Self::Released | Self::Failed
        )
    }
}

/// A state transition notification, delivered to service listeners.
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceEvent {
    /// The service has become ready to use, and is inactive.
    Ready,
    /// The service has started to become active.
    Activating,
    /// The service has become active.
    Activated,
    /// The service has started to become inactive.
    Deactivating,
    /// The service has become inactive.
    Deactivated,
    /// The service failed during establishment or activation.
    Failed {
        /// The end points implicated in the failure.
        endpoints: Vec<EndPoint>,
        /// Driver or planner diagnostic.
        cause: String,
    },
    /// The service has been fully released, and can be initiated again.
    Released,
}

/// Receives notifications of changes to the state of a service.
pub trait ServiceListener: Send + Sync {
    /// Called for every state transition of a subscribed service, in
    /// state-machine order, with no broker lock held.
    fn on_event(&self, service: ServiceId, event: ServiceEvent);
}

/// A listener that records every event it receives. Useful in tests and
/// demonstrations.
#[derive(Default)]
pub struct EventLog {
    events: Mutex<Vec<(ServiceId, ServiceEvent)>>,
}

impl EventLog {
    /// Create an empty event log.
    pub fn new() -> Self {
        Self::default()
    }

    /// All events received so far, in delivery order.
    pub fn events(&self) -> Vec<(ServiceId, ServiceEvent)> {
        self.events.lock().unwrap().clone()
    }

    /// The events received for one service, in delivery order.
    pub fn events_for(&self, service: ServiceId) -> Vec<ServiceEvent> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| *id == service)
            .map(|(_, ev)| ev.clone())
            .collect()
    }
}

impl ServiceListener for EventLog {
    fn on_event(&self, service: ServiceId, event: ServiceEvent) {
        self.events.lock().unwrap().push((service, event));
    }
}

/// Per-service event queue. Transitions enqueue events while holding the
/// service's state lock; the queue is drained afterwards with no lock held,
/// and a draining flag keeps concurrent drainers from reordering deliveries.
pub(crate) struct EventOutbox {
    queue: Mutex<OutboxState>,
    listeners: Mutex<Vec<Arc<dyn ServiceListener>>>,
}

struct OutboxState {
    pending: VecDeque<ServiceEvent>,
    draining: bool,
}

impl EventOutbox {
    pub(crate) fn new() -> Self {
        Self {
            queue: Mutex::new(OutboxState {
                pending: VecDeque::new(),
                draining: false,
            }),
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn subscribe(&self, listener: Arc<dyn ServiceListener>) {
        self.listeners.lock().unwrap().push(listener);
    }

    /// Enqueue an event. Safe to call with the service state lock held.
    pub(crate) fn post(&self, event: ServiceEvent) {
        self.queue.lock().unwrap().pending.push_back(event);
    }

    /// Deliver queued events. Must be called with no internal lock held.
    pub(crate) fn deliver(&self, service: ServiceId) {
        loop {
            let event = {
                let mut queue = self.queue.lock().unwrap();
                if queue.draining {
                    return;
                }
                match queue.pending.pop_front() {
                    Some(event) => {
                        queue.draining = true;
                        event
                    }
                    None => return,
                }
            };
            let listeners: Vec<Arc<dyn ServiceListener>> =
                self.listeners.lock().unwrap().clone();
            for listener in &listeners {
                listener.on_event(service, event.clone());
            }
            self.queue.lock().unwrap().draining = false;
        }
    }
}

/// Errors in the service lifecycle
#[derive(Debug, ThisError, PartialEq)]
pub enum LifecycleError {
    /// The requested operation is not valid in the service's current state.
    /// Also reported for requests that can never form a service (fewer than
    /// two end points).
    #[error("operation not valid for service {0} in state {1:?}")]
    InvalidState(ServiceId, ServiceState),
    /// The network owning the service no longer exists.
    #[error("service {0} no longer has an owning network")]
    NetworkGone(ServiceId),
}

/// A handle on a service of either network variant.
#[derive(Clone)]
pub enum Service {
    /// A service of a switch: one fabric bridge.
    Switch(Arc<SwitchService>),
    /// A composite service of an aggregator.
    Aggregator(Arc<AggregatorService>),
}

impl Service {
    /// The broker-scoped id of the service.
    pub fn id(&self) -> ServiceId {
        match self {
            Self::Switch(s) => s.id(),
            Self::Aggregator(s) => s.id(),
        }
    }

    /// The current state of the service.
    pub fn status(&self) -> ServiceState {
        match self {
            Self::Switch(s) => s.status(),
            Self::Aggregator(s) => s.status(),
        }
    }

    /// Subscribe a listener to the service's event channel.
    pub fn add_listener(&self, listener: Arc<dyn ServiceListener>) {
        match self {
            Self::Switch(s) => s.add_listener(listener),
            Self::Aggregator(s) => s.add_listener(listener),
        }
    }

    /// The request the service was initiated with, if any.
    pub fn request(&self) -> Option<ConnectionRequest> {
        match self {
            Self::Switch(s) => s.request(),
            Self::Aggregator(s) => s.request(),
        }
    }

    /// Submit a connection request, moving the service from `Dormant` (or
    /// `Released`) to `Establishing`. On a composite service this blocks
    /// until every sub-service has reached a stable state.
    pub fn initiate(&self, request: ConnectionRequest) -> Result<(), Error> {
        match self {
            Self::Switch(s) => s.initiate(request),
            Self::Aggregator(s) => s.initiate(request),
        }
    }

    /// Activate an inactive service.
    pub fn activate(&self) -> Result<(), LifecycleError> {
        match self {
            Self::Switch(s) => s.activate(),
            Self::Aggregator(s) => s.activate(),
        }
    }

    /// Deactivate an active service.
    pub fn deactivate(&self) -> Result<(), LifecycleError> {
        match self {
            Self::Switch(s) => s.deactivate(),
            Self::Aggregator(s) => s.deactivate(),
        }
    }

    /// Release the service and return all of its resources. Idempotent; on a
    /// composite service this blocks until every sub-service is released.
    pub fn release(&self) -> Result<(), LifecycleError> {
        match self {
            Self::Switch(s) => s.release(),
            Self::Aggregator(s) => s.release(),
        }
    }

    /// Block until the service reaches a stable state, and return it.
    pub fn await_stable(&self) -> ServiceState {
        match self {
            Self::Switch(s) => s.await_stable(),
            Self::Aggregator(s) => s.await_stable(),
        }
    }
}

impl fmt::Debug for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Service({}, {:?})", self.id(), self.status())
    }
}
