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

//! # Aggregator
//!
//! An aggregator is a composite network: a set of *inferior* networks
//! (referenced weakly, by name) plus a set of trunks between their
//! terminals. Its own, external terminals are forwarding aliases of
//! inferior terminals.
//!
//! To satisfy a service request, the aggregator
//!
//! 1. rewrites each external end point to its backing inferior terminal,
//! 2. builds a planning multigraph whose vertices are inferior networks and
//!    whose edges are the trunks that can still carry the requested
//!    bandwidth in both directions (weight = delay; parallel trunks are
//!    kept, ranked by remaining capacity and then by id),
//! 3. computes a goal-set spanning tree over the involved inferiors,
//! 4. allocates a label pair and the bandwidth on every tree trunk, under
//!    the aggregator lock, replanning on contention up to [`MAX_REPLAN`]
//!    times,
//! 5. synthesises one sub-request per inferior network of the tree and
//!    initiates it there, and
//! 6. folds the sub-service states into the composite lifecycle.
//!
//! A failing sub-service drives the composite to `Failed` and triggers an
//! asynchronous rollback that releases the remaining sub-services and
//! returns every trunk reservation.

use crate::graph::{goal_spanning_tree, EdgeId, EdgeWeight, PlanGraph, VertexId};
use crate::network::service::{
    allocate_id, reserve_id, EventOutbox, LifecycleError, Service, ServiceEvent, ServiceId,
    ServiceListener, ServiceState,
};
use crate::network::trunk::{Trunk, TrunkEnd, TrunkError, TrunkId, TrunkState};
use crate::network::{Bandwidth, ConnectionRequest, EndPoint, Label, Network, Terminal};
use crate::Error;
use itertools::Itertools;
use log::*;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread;
use thiserror::Error as ThisError;

/// How many times the planner recomputes a spanning tree after losing an
/// allocation race before giving up with
/// [`AggregatorError::Unroutable`].
pub const MAX_REPLAN: usize = 3;

/// Aggregator management and planning errors
#[derive(Debug, ThisError, PartialEq)]
pub enum AggregatorError {
    /// The proposed terminal name is already in use.
    #[error("terminal {0} already exists")]
    TerminalExists(String),
    /// No terminal with the given name exists.
    #[error("unknown terminal: {0}")]
    UnknownTerminal(String),
    /// One of the aggregator's own terminals was given where an inferior
    /// network's terminal was expected.
    #[error("terminal {0} belongs to this aggregator, not an inferior network")]
    OwnTerminal(String),
    /// No trunk is attached to the given terminal.
    #[error("no trunk at {0}")]
    UnknownTrunk(String),
    /// The named network is not an inferior of this aggregator.
    #[error("unknown inferior network: {0}")]
    UnknownSubnetwork(String),
    /// The terminal is already claimed by a trunk, an alias, or a live
    /// service.
    #[error("terminal {0} is in use")]
    TerminalInUse(String),
    /// No spanning tree over the trunks can connect the requested end
    /// points at the requested bandwidth.
    #[error("no spanning tree at {0} Mb/s connects the requested end points")]
    Unroutable(Bandwidth),
    /// A trunk resource operation failed.
    #[error(transparent)]
    Trunk(#[from] TrunkError),
}

/// An external terminal: a forwarding alias of an inferior terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct OuterTerminal {
    pub(crate) network: String,
    pub(crate) terminal: String,
}

pub(crate) struct AggShared {
    pub(crate) name: String,
    pub(crate) inner: Mutex<AggInner>,
}

pub(crate) struct AggInner {
    pub(crate) terminals: BTreeMap<String, OuterTerminal>,
    pub(crate) inferiors: BTreeMap<String, Weak<Network>>,
    pub(crate) trunks: BTreeMap<TrunkId, TrunkState>,
    next_trunk: u64,
    pub(crate) services: BTreeMap<ServiceId, Arc<AggregatorService>>,
}

/// A composite network built from inferior networks and trunks. The handle
/// is cheap to clone; clones share the aggregator's state.
#[derive(Clone)]
pub struct Aggregator {
    shared: Arc<AggShared>,
}

impl Aggregator {
    /// Create an aggregator with no inferiors, terminals or trunks.
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            shared: Arc::new(AggShared {
                name: name.into(),
                inner: Mutex::new(AggInner {
                    terminals: BTreeMap::new(),
                    inferiors: BTreeMap::new(),
                    trunks: BTreeMap::new(),
                    next_trunk: 1,
                    services: BTreeMap::new(),
                }),
            }),
        }
    }

    /// The aggregator's name.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub(crate) fn shared(&self) -> &Arc<AggShared> {
        &self.shared
    }

    /// Register an inferior network. The aggregator keeps only a weak
    /// reference; the inferior's lifetime is independent. Re-registering a
    /// name replaces the previous reference.
    pub fn add_network(&self, network: &Arc<Network>) {
        let mut inner = self.shared.inner.lock().unwrap();
        inner
            .inferiors
            .insert(network.name().to_string(), Arc::downgrade(network));
        debug!("aggregator {}: inferior {}", self.shared.name, network.name());
    }

    fn inferior(&self, name: &str) -> Result<Arc<Network>, AggregatorError> {
        let inner = self.shared.inner.lock().unwrap();
        inner
            .inferiors
            .get(name)
            .and_then(Weak::upgrade)
            .ok_or_else(|| AggregatorError::UnknownSubnetwork(name.to_string()))
    }

    /// Add an external terminal exposing an inferior network's terminal.
    /// The backing terminal must not participate in any trunk, and must not
    /// back another external terminal.
    pub fn add_terminal(
        &self,
        name: &str,
        subnet: &str,
        subterm: &str,
    ) -> Result<Terminal, AggregatorError> {
        if subnet == self.shared.name {
            return Err(AggregatorError::OwnTerminal(format!("{}:{}", subnet, subterm)));
        }
        let inferior = self.inferior(subnet)?;
        if !inferior.has_terminal(subterm) {
            return Err(AggregatorError::UnknownTerminal(format!("{}:{}", subnet, subterm)));
        }
        let mut inner = self.shared.inner.lock().unwrap();
        if inner.terminals.contains_key(name) {
            return Err(AggregatorError::TerminalExists(name.to_string()));
        }
        let claimed = inner
            .trunks
            .values()
            .any(|t| t.has_terminal(subnet, subterm))
            || inner
                .terminals
                .values()
                .any(|o| o.network == subnet && o.terminal == subterm);
        if claimed {
            return Err(AggregatorError::TerminalInUse(format!("{}:{}", subnet, subterm)));
        }
        inner.terminals.insert(
            name.to_string(),
            OuterTerminal {
                network: subnet.to_string(),
                terminal: subterm.to_string(),
            },
        );
        debug!(
            "aggregator {}: terminal {} -> {}:{}",
            self.shared.name, name, subnet, subterm
        );
        Ok(Terminal {
            network: self.shared.name.clone(),
            name: name.to_string(),
        })
    }

    /// Look up an external terminal by name.
    pub fn get_terminal(&self, name: &str) -> Result<Terminal, AggregatorError> {
        let inner = self.shared.inner.lock().unwrap();
        if inner.terminals.contains_key(name) {
            Ok(Terminal {
                network: self.shared.name.clone(),
                name: name.to_string(),
            })
        } else {
            Err(AggregatorError::UnknownTerminal(name.to_string()))
        }
    }

    /// Remove an external terminal. Fails while any live service references
    /// it.
    pub fn remove_terminal(&self, name: &str) -> Result<(), AggregatorError> {
        let mut inner = self.shared.inner.lock().unwrap();
        if !inner.terminals.contains_key(name) {
            return Err(AggregatorError::UnknownTerminal(name.to_string()));
        }
        for service in inner.services.values() {
            if service.is_live() && service.uses_terminal(name) {
                return Err(AggregatorError::TerminalInUse(name.to_string()));
            }
        }
        inner.terminals.remove(name);
        Ok(())
    }

    /// The local names of all external terminals.
    pub fn list_terminals(&self) -> Vec<String> {
        self.shared.inner.lock().unwrap().terminals.keys().cloned().collect()
    }

    /// Create a trunk between two internal terminals of two inferior
    /// networks. The new trunk carries no labels and no bandwidth until the
    /// operator provides them through the returned handle.
    pub fn add_trunk(
        &self,
        net1: &str,
        term1: &str,
        net2: &str,
        term2: &str,
    ) -> Result<Trunk, AggregatorError> {
        for (net, term) in [(net1, term1), (net2, term2)] {
            if net == self.shared.name {
                return Err(AggregatorError::OwnTerminal(format!("{}:{}", net, term)));
            }
            let inferior = self.inferior(net)?;
            if !inferior.has_terminal(term) {
                return Err(AggregatorError::UnknownTerminal(format!("{}:{}", net, term)));
            }
        }
        let mut inner = self.shared.inner.lock().unwrap();
        for (net, term) in [(net1, term1), (net2, term2)] {
            let claimed = inner.trunks.values().any(|t| t.has_terminal(net, term))
                || inner
                    .terminals
                    .values()
                    .any(|o| o.network == net && o.terminal == term);
            if claimed {
                return Err(AggregatorError::TerminalInUse(format!("{}:{}", net, term)));
            }
        }
        let id = TrunkId(inner.next_trunk);
        inner.next_trunk += 1;
        inner.trunks.insert(
            id,
            TrunkState::new(id, TrunkEnd::of(net1, term1), TrunkEnd::of(net2, term2)),
        );
        info!(
            "aggregator {}: {} between {}:{} and {}:{}",
            self.shared.name, id, net1, term1, net2, term2
        );
        Ok(Trunk {
            agg: Arc::downgrade(&self.shared),
            id,
        })
    }

    /// The ids of all trunks of this aggregator.
    pub fn list_trunks(&self) -> Vec<TrunkId> {
        self.shared.inner.lock().unwrap().trunks.keys().copied().collect()
    }

    /// A handle on a trunk by id, if it still exists.
    pub fn trunk_by_id(&self, id: TrunkId) -> Option<Trunk> {
        let inner = self.shared.inner.lock().unwrap();
        inner.trunks.contains_key(&id).then(|| Trunk {
            agg: Arc::downgrade(&self.shared),
            id,
        })
    }

    /// Find an existing trunk by either of its ends.
    pub fn find_trunk(&self, network: &str, terminal: &str) -> Option<Trunk> {
        let inner = self.shared.inner.lock().unwrap();
        inner
            .trunks
            .values()
            .find(|t| t.has_terminal(network, terminal))
            .map(|t| Trunk {
                agg: Arc::downgrade(&self.shared),
                id: t.id,
            })
    }

    /// Get an existing trunk by either of its ends, failing if there is
    /// none.
    pub fn get_trunk(&self, network: &str, terminal: &str) -> Result<Trunk, AggregatorError> {
        self.find_trunk(network, terminal)
            .ok_or_else(|| AggregatorError::UnknownTrunk(format!("{}:{}", network, terminal)))
    }

    /// Remove a trunk identified by either of its ends. Refused while any
    /// service holds an allocation on it.
    pub fn remove_trunk(&self, network: &str, terminal: &str) -> Result<(), AggregatorError> {
        let mut inner = self.shared.inner.lock().unwrap();
        let id = inner
            .trunks
            .values()
            .find(|t| t.has_terminal(network, terminal))
            .map(|t| t.id)
            .ok_or_else(|| AggregatorError::UnknownTrunk(format!("{}:{}", network, terminal)))?;
        if inner.trunks[&id].in_use() {
            return Err(AggregatorError::TerminalInUse(format!("{}:{}", network, terminal)));
        }
        inner.trunks.remove(&id);
        Ok(())
    }

    /// Create a new composite service in the `Dormant` state.
    pub fn new_service(&self) -> Service {
        let id = allocate_id();
        let service = AggregatorService::fresh(id, Arc::downgrade(&self.shared));
        self.shared.inner.lock().unwrap().services.insert(id, service.clone());
        Service::Aggregator(service)
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
            .map(Service::Aggregator)
    }

    /// The ids of all services of this aggregator.
    pub fn list_services(&self) -> Vec<ServiceId> {
        self.shared.inner.lock().unwrap().services.keys().copied().collect()
    }

    /// Recreate a persisted composite service in the `Establishing` state,
    /// re-attached to its already-restored sub-services. The switch-level
    /// bridge re-adoption drives it back to `Inactive`.
    pub(crate) fn restore_service(
        &self,
        id: ServiceId,
        request: ConnectionRequest,
        plan: Plan,
        subs: Vec<Service>,
    ) -> Arc<AggregatorService> {
        reserve_id(id);
        let service = AggregatorService::fresh(id, Arc::downgrade(&self.shared));
        {
            let mut body = service.body.lock().unwrap();
            body.state = ServiceState::Establishing;
            body.request = Some(request);
            body.plan = Some(plan);
            body.subs = subs
                .iter()
                .map(|s| SubSlot {
                    service: Some(s.clone()),
                    status: ServiceState::Dormant,
                })
                .collect();
        }
        for (index, sub) in subs.iter().enumerate() {
            sub.add_listener(Arc::new(SubTap {
                parent: Arc::downgrade(&service),
                index,
            }));
        }
        self.shared.inner.lock().unwrap().services.insert(id, service.clone());
        service
    }
}

/// The resolved form of a request end point: the inferior network owning
/// the backing terminal, and the end point rewritten into that network's
/// namespace.
type ResolvedEndPoint = (String, EndPoint);

/// Rewrite every external end point of `request` to its backing inferior
/// terminal.
pub(crate) fn resolve_endpoints(
    inner: &AggInner,
    request: &ConnectionRequest,
) -> Result<Vec<ResolvedEndPoint>, AggregatorError> {
    let mut resolved = Vec::new();
    for endpoint in &request.endpoints {
        let outer = inner
            .terminals
            .get(&endpoint.terminal)
            .ok_or_else(|| AggregatorError::UnknownTerminal(endpoint.terminal.clone()))?;
        resolved.push((
            outer.network.clone(),
            EndPoint::of(outer.terminal.clone(), endpoint.label),
        ));
    }
    Ok(resolved)
}

/// Build the planning graph over the current trunk topology and compute a
/// goal-set spanning tree for the involved inferior networks. Returns the
/// tree as trunk ids.
pub(crate) fn plan_tree(
    inner: &AggInner,
    involved: &BTreeSet<String>,
    bandwidth: Bandwidth,
) -> Result<Vec<TrunkId>, AggregatorError> {
    let mut graph = PlanGraph::default();
    let mut vertices: BTreeMap<String, VertexId> = BTreeMap::new();
    let mut vertex = |graph: &mut PlanGraph, name: &str| -> VertexId {
        *vertices
            .entry(name.to_string())
            .or_insert_with(|| graph.add_node(()))
    };

    // candidate trunks: non-loop, enough remaining capacity both ways;
    // ranked by most remaining capacity, then lowest id
    let candidates: Vec<&TrunkState> = inner
        .trunks
        .values()
        .filter(|t| !t.is_loop())
        .filter(|t| {
            let (up, down) = t.remaining();
            up >= bandwidth && down >= bandwidth
        })
        .sorted_by(|a, b| {
            let ra = a.remaining();
            let rb = b.remaining();
            let ka = ra.0.min(ra.1);
            let kb = rb.0.min(rb.1);
            kb.partial_cmp(&ka)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.id.cmp(&b.id))
        })
        .collect();

    let mut edge_trunk: HashMap<EdgeId, TrunkId> = HashMap::new();
    for (rank, trunk) in candidates.iter().enumerate() {
        let a = vertex(&mut graph, &trunk.end_a.network);
        let b = vertex(&mut graph, &trunk.end_b.network);
        let (up, down) = trunk.remaining();
        let edge = graph.add_edge(
            a,
            b,
            EdgeWeight {
                cost: trunk.delay,
                capacity: up.min(down),
                rank: rank as u64,
            },
        );
        edge_trunk.insert(edge, trunk.id);
    }

    let goals: BTreeSet<VertexId> = involved
        .iter()
        .map(|name| vertex(&mut graph, name))
        .collect();

    let tree = goal_spanning_tree(&graph, &goals, bandwidth)
        .map_err(|_| AggregatorError::Unroutable(bandwidth))?;
    let mut trunks: Vec<TrunkId> = tree.iter().map(|e| edge_trunk[e]).collect();
    trunks.sort();
    Ok(trunks)
}

/// Reserve one label pair and the bandwidth on every trunk of a tree. On any
/// failure the reservations already made *for this plan* are released and
/// the error is returned, so the caller can replan against the new
/// remaining-capacity view.
pub(crate) fn allocate_plan(
    inner: &mut AggInner,
    trunks: &[TrunkId],
    bandwidth: Bandwidth,
    service: ServiceId,
) -> Result<Vec<Reservation>, TrunkError> {
    let mut reserved: Vec<Reservation> = Vec::new();
    for &id in trunks {
        let outcome = match inner.trunks.get_mut(&id) {
            Some(state) => state
                .allocate(bandwidth, bandwidth, service)
                .map(|(label_a, label_b)| Reservation {
                    trunk: id,
                    end_a: state.end_a.clone(),
                    end_b: state.end_b.clone(),
                    label_a,
                    label_b,
                    up: bandwidth,
                    down: bandwidth,
                }),
            None => Err(TrunkError::Gone(id)),
        };
        match outcome {
            Ok(reservation) => reserved.push(reservation),
            Err(e) => {
                for r in &reserved {
                    if let Some(state) = inner.trunks.get_mut(&r.trunk) {
                        state.release(r.label_a);
                    }
                }
                return Err(e);
            }
        }
    }
    Ok(reserved)
}

/// Assemble one sub-request per inferior network: the external end points
/// backed there, plus one end point per incident tree trunk carrying the
/// allocated label of that network's side.
pub(crate) fn synthesize_subplans(
    resolved: &[ResolvedEndPoint],
    reservations: &[Reservation],
    bandwidth: Bandwidth,
) -> Vec<SubPlan> {
    let mut per_network: BTreeMap<String, BTreeSet<EndPoint>> = BTreeMap::new();
    for (network, endpoint) in resolved {
        per_network
            .entry(network.clone())
            .or_default()
            .insert(endpoint.clone());
    }
    for r in reservations {
        per_network
            .entry(r.end_a.network.clone())
            .or_default()
            .insert(EndPoint::of(r.end_a.terminal.clone(), r.label_a));
        per_network
            .entry(r.end_b.network.clone())
            .or_default()
            .insert(EndPoint::of(r.end_b.terminal.clone(), r.label_b));
    }
    per_network
        .into_iter()
        .map(|(network, endpoints)| SubPlan {
            network,
            request: ConnectionRequest {
                endpoints,
                bandwidth,
            },
        })
        .collect()
}

/// A trunk reservation held by one composite service.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Reservation {
    pub(crate) trunk: TrunkId,
    pub(crate) end_a: TrunkEnd,
    pub(crate) end_b: TrunkEnd,
    pub(crate) label_a: Label,
    pub(crate) label_b: Label,
    pub(crate) up: Bandwidth,
    pub(crate) down: Bandwidth,
}

/// One sub-request of a composite service's plan.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SubPlan {
    pub(crate) network: String,
    pub(crate) request: ConnectionRequest,
}

/// The computed plan of a composite service: its trunk reservations and its
/// per-inferior sub-requests.
#[derive(Debug, Clone, Default)]
pub(crate) struct Plan {
    pub(crate) reservations: Vec<Reservation>,
    pub(crate) subs: Vec<SubPlan>,
}

struct SubSlot {
    service: Option<Service>,
    status: ServiceState,
}

struct CompositeBody {
    state: ServiceState,
    request: Option<ConnectionRequest>,
    plan: Option<Plan>,
    subs: Vec<SubSlot>,
    rolling_back: bool,
}

/// A composite service of an aggregator: the fold of its sub-services.
pub struct AggregatorService {
    id: ServiceId,
    weak: Weak<AggregatorService>,
    agg: Weak<AggShared>,
    body: Mutex<CompositeBody>,
    stable: Condvar,
    outbox: EventOutbox,
}

/// Routes one sub-service's events into the composite fold.
struct SubTap {
    parent: Weak<AggregatorService>,
    index: usize,
}

impl ServiceListener for SubTap {
    fn on_event(&self, _service: ServiceId, event: ServiceEvent) {
        if let Some(parent) = self.parent.upgrade() {
            parent.sub_event(self.index, event);
        }
    }
}

impl AggregatorService {
    fn fresh(id: ServiceId, agg: Weak<AggShared>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            id,
            weak: weak.clone(),
            agg,
            body: Mutex::new(CompositeBody {
                state: ServiceState::Dormant,
                request: None,
                plan: None,
                subs: Vec::new(),
                rolling_back: false,
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

    /// The request the service was initiated with, if any.
    pub fn request(&self) -> Option<ConnectionRequest> {
        self.body.lock().unwrap().request.clone()
    }

    pub(crate) fn plan(&self) -> Option<Plan> {
        self.body.lock().unwrap().plan.clone()
    }

    pub(crate) fn sub_services(&self) -> Vec<Service> {
        let body = self.body.lock().unwrap();
        body.subs.iter().filter_map(|s| s.service.clone()).collect()
    }

    /// Submit a connection request. Plans a spanning tree, reserves trunk
    /// resources, initiates one sub-service per involved inferior network,
    /// and blocks until every sub-service has reached a stable state.
    ///
    /// Planning failures (`UnknownTerminal`, `Unroutable`) are reported
    /// synchronously and leave no side effects. Failures after resources
    /// were committed drive the service to `Failed` and trigger rollback.
    pub fn initiate(&self, request: ConnectionRequest) -> Result<(), Error> {
        let shared = self
            .agg
            .upgrade()
            .ok_or(LifecycleError::NetworkGone(self.id))?;

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
            body.request = None;
            body.plan = None;
            body.subs = Vec::new();
            body.rolling_back = false;
            previous
        };

        match self.establish(&shared, &request) {
            Ok(()) => {
                // block until the fold reports a stable outcome
                let mut body = self.body.lock().unwrap();
                while body.state == ServiceState::Establishing {
                    body = self.stable.wait(body).unwrap();
                }
                Ok(())
            }
            Err(e) => {
                let committed = {
                    let mut body = self.body.lock().unwrap();
                    let committed = body.subs.iter().any(|s| s.service.is_some())
                        || body
                            .plan
                            .as_ref()
                            .map(|p| !p.reservations.is_empty())
                            .unwrap_or(false);
                    if committed {
                        if body.state != ServiceState::Failed {
                            body.state = ServiceState::Failed;
                            body.rolling_back = true;
                            self.outbox.post(ServiceEvent::Failed {
                                endpoints: request.endpoints.iter().cloned().collect(),
                                cause: e.to_string(),
                            });
                        }
                    } else {
                        body.state = previous;
                        body.request = None;
                        body.plan = None;
                    }
                    committed
                };
                self.stable.notify_all();
                self.outbox.deliver(self.id);
                if committed {
                    self.spawn_rollback();
                }
                Err(e)
            }
        }
    }

    /// Plan, allocate and submit. Runs with the composite already claimed as
    /// `Establishing`.
    fn establish(&self, shared: &Arc<AggShared>, request: &ConnectionRequest) -> Result<(), Error> {
        let bandwidth = request.bandwidth;

        // step 1: rewrite external end points (under the aggregator lock)
        let resolved = {
            let inner = shared.inner.lock().unwrap();
            resolve_endpoints(&inner, request)?
        };
        let involved: BTreeSet<String> = resolved.iter().map(|(n, _)| n.clone()).collect();

        let plan = if let Ok(only) = involved.iter().exactly_one() {
            // all end points share one inferior network: forward the
            // rewritten request unchanged, no trunk resources needed
            let endpoints: BTreeSet<EndPoint> =
                resolved.iter().map(|(_, ep)| ep.clone()).collect();
            Plan {
                reservations: Vec::new(),
                subs: vec![SubPlan {
                    network: only.clone(),
                    request: ConnectionRequest {
                        endpoints,
                        bandwidth,
                    },
                }],
            }
        } else {
            // steps 2-5: plan against the current capacity view, then
            // allocate in a separate critical section; a concurrent service
            // may take labels or bandwidth in between, so replan on failure
            let mut reservations = None;
            for attempt in 0..MAX_REPLAN {
                let tree = {
                    let inner = shared.inner.lock().unwrap();
                    plan_tree(&inner, &involved, bandwidth)?
                };
                let allocated = {
                    let mut inner = shared.inner.lock().unwrap();
                    allocate_plan(&mut inner, &tree, bandwidth, self.id)
                };
                match allocated {
                    Ok(r) => {
                        reservations = Some(r);
                        break;
                    }
                    Err(e) => {
                        warn!(
                            "service {}: allocation lost a race ({}), replanning ({}/{})",
                            self.id,
                            e,
                            attempt + 1,
                            MAX_REPLAN
                        );
                    }
                }
            }
            let reservations = match reservations {
                Some(r) => r,
                None => return Err(AggregatorError::Unroutable(bandwidth).into()),
            };
            let subs = synthesize_subplans(&resolved, &reservations, bandwidth);
            Plan {
                reservations,
                subs,
            }
        };

        info!(
            "aggregator {}: service {} planned over {} trunks, {} sub-requests",
            shared.name,
            self.id,
            plan.reservations.len(),
            plan.subs.len()
        );

        {
            let mut body = self.body.lock().unwrap();
            body.request = Some(request.clone());
            body.subs = plan
                .subs
                .iter()
                .map(|_| SubSlot {
                    service: None,
                    status: ServiceState::Dormant,
                })
                .collect();
            body.plan = Some(plan.clone());
        }

        // step 6: nested initiation on each inferior network
        for (index, sub) in plan.subs.iter().enumerate() {
            let inferior = {
                let inner = shared.inner.lock().unwrap();
                inner.inferiors.get(&sub.network).and_then(Weak::upgrade)
            }
            .ok_or_else(|| AggregatorError::UnknownSubnetwork(sub.network.clone()))?;
            let service = inferior.new_service();
            service.add_listener(Arc::new(SubTap {
                parent: self.weak.clone(),
                index,
            }));
            {
                let mut body = self.body.lock().unwrap();
                if body.state != ServiceState::Establishing {
                    // an earlier sub-service already failed; the rollback
                    // picks up everything recorded so far
                    return Ok(());
                }
                body.subs[index].service = Some(service.clone());
            }
            service.initiate(sub.request.clone())?;
        }
        Ok(())
    }

    /// Activate an inactive composite service by activating every
    /// sub-service; the composite becomes `Active` when all of them report
    /// it.
    pub fn activate(&self) -> Result<(), LifecycleError> {
        let subs = {
            let mut body = self.body.lock().unwrap();
            match body.state {
                ServiceState::Inactive => {
                    body.state = ServiceState::Activating;
                    self.outbox.post(ServiceEvent::Activating);
                }
                ServiceState::Active => return Ok(()),
                state => return Err(LifecycleError::InvalidState(self.id, state)),
            }
            body.subs.iter().filter_map(|s| s.service.clone()).collect::<Vec<_>>()
        };
        self.outbox.deliver(self.id);
        for sub in subs {
            sub.activate()?;
        }
        Ok(())
    }

    /// Deactivate an active composite service; the mirror of
    /// [`activate`](Self::activate).
    pub fn deactivate(&self) -> Result<(), LifecycleError> {
        let subs = {
            let mut body = self.body.lock().unwrap();
            match body.state {
                ServiceState::Active => {
                    body.state = ServiceState::Deactivating;
                    self.outbox.post(ServiceEvent::Deactivating);
                }
                ServiceState::Inactive => return Ok(()),
                state => return Err(LifecycleError::InvalidState(self.id, state)),
            }
            body.subs.iter().filter_map(|s| s.service.clone()).collect::<Vec<_>>()
        };
        self.outbox.deliver(self.id);
        for sub in subs {
            sub.deactivate()?;
        }
        Ok(())
    }

    /// Release the composite service: release every sub-service, wait for
    /// all of them, then return the trunk reservations. Idempotent; blocks
    /// until the service is `Released`. A release requested while the
    /// service is still establishing is honoured as soon as it reaches a
    /// stable or failed state.
    pub fn release(&self) -> Result<(), LifecycleError> {
        let targets = {
            let mut body = self.body.lock().unwrap();
            while !body.state.is_stable() && body.state != ServiceState::Releasing {
                body = self.stable.wait(body).unwrap();
            }
            match body.state {
                ServiceState::Released => return Ok(()),
                ServiceState::Releasing => None,
                ServiceState::Failed if body.rolling_back => None,
                ServiceState::Dormant => {
                    body.state = ServiceState::Released;
                    self.outbox.post(ServiceEvent::Released);
                    None
                }
                _ => {
                    body.state = ServiceState::Releasing;
                    Some(
                        body.subs
                            .iter()
                            .filter(|s| s.status != ServiceState::Released)
                            .filter_map(|s| s.service.clone())
                            .collect::<Vec<_>>(),
                    )
                }
            }
        };
        self.stable.notify_all();
        self.outbox.deliver(self.id);

        if let Some(targets) = targets {
            if targets.is_empty() {
                self.settle();
            } else {
                for sub in targets {
                    let _ = sub.release();
                }
            }
        }

        let mut body = self.body.lock().unwrap();
        while body.state != ServiceState::Released {
            body = self.stable.wait(body).unwrap();
        }
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

    /// Fold one sub-service event into the composite state.
    fn sub_event(&self, index: usize, event: ServiceEvent) {
        let mut start_rollback = false;
        let to_return = {
            let mut body = self.body.lock().unwrap();
            if index >= body.subs.len() {
                return;
            }
            match event {
                ServiceEvent::Ready | ServiceEvent::Deactivated => {
                    body.subs[index].status = ServiceState::Inactive;
                }
                ServiceEvent::Activated => {
                    body.subs[index].status = ServiceState::Active;
                }
                ServiceEvent::Activating | ServiceEvent::Deactivating => {}
                ServiceEvent::Failed { endpoints, cause } => {
                    body.subs[index].status = ServiceState::Failed;
                    if !matches!(
                        body.state,
                        ServiceState::Releasing | ServiceState::Released | ServiceState::Failed
                    ) {
                        warn!("service {}: sub-service failed: {}", self.id, cause);
                        body.state = ServiceState::Failed;
                        body.rolling_back = true;
                        start_rollback = true;
                        self.outbox.post(ServiceEvent::Failed { endpoints, cause });
                    }
                }
                ServiceEvent::Released => {
                    body.subs[index].status = ServiceState::Released;
                    let expected = matches!(body.state, ServiceState::Releasing)
                        || (body.state == ServiceState::Failed && body.rolling_back)
                        || body.state == ServiceState::Released;
                    if !expected {
                        // a sub-service vanished underneath a live composite
                        warn!("service {}: sub-service released prematurely", self.id);
                        body.state = ServiceState::Failed;
                        body.rolling_back = true;
                        start_rollback = true;
                        self.outbox.post(ServiceEvent::Failed {
                            endpoints: Vec::new(),
                            cause: "sub-service released prematurely".to_string(),
                        });
                    }
                }
            }
            self.reconsider(&mut body)
        };
        if let Some(reservations) = to_return {
            self.return_reservations(reservations);
        }
        self.stable.notify_all();
        self.outbox.deliver(self.id);
        if start_rollback {
            self.spawn_rollback();
        }
    }

    /// Re-evaluate the composite state after a sub-service change. Returns
    /// reservations to hand back once the body lock is dropped.
    fn reconsider(&self, body: &mut CompositeBody) -> Option<Vec<Reservation>> {
        let any = !body.subs.is_empty();
        let all_inactive =
            any && body.subs.iter().all(|s| s.status == ServiceState::Inactive);
        let all_active = any && body.subs.iter().all(|s| s.status == ServiceState::Active);
        let all_released = body
            .subs
            .iter()
            .all(|s| s.service.is_none() || s.status == ServiceState::Released);

        match body.state {
            ServiceState::Establishing if all_inactive => {
                body.state = ServiceState::Inactive;
                self.outbox.post(ServiceEvent::Ready);
                None
            }
            ServiceState::Activating if all_active => {
                body.state = ServiceState::Active;
                self.outbox.post(ServiceEvent::Activated);
                None
            }
            ServiceState::Deactivating if all_inactive => {
                body.state = ServiceState::Inactive;
                self.outbox.post(ServiceEvent::Deactivated);
                None
            }
            ServiceState::Releasing if all_released => {
                body.state = ServiceState::Released;
                self.outbox.post(ServiceEvent::Released);
                self.take_reservations(body)
            }
            ServiceState::Failed if body.rolling_back && all_released => {
                body.state = ServiceState::Released;
                body.rolling_back = false;
                self.outbox.post(ServiceEvent::Released);
                self.take_reservations(body)
            }
            _ => None,
        }
    }

    fn take_reservations(&self, body: &mut CompositeBody) -> Option<Vec<Reservation>> {
        let reservations = body
            .plan
            .as_mut()
            .map(|p| std::mem::take(&mut p.reservations))
            .unwrap_or_default();
        if reservations.is_empty() {
            None
        } else {
            Some(reservations)
        }
    }

    /// Hand trunk reservations back to the aggregator. Must be called with
    /// no service lock held.
    fn return_reservations(&self, reservations: Vec<Reservation>) {
        let shared = match self.agg.upgrade() {
            Some(shared) => shared,
            None => return,
        };
        let mut inner = shared.inner.lock().unwrap();
        for r in &reservations {
            if let Some(state) = inner.trunks.get_mut(&r.trunk) {
                state.release(r.label_a);
            }
        }
        debug!(
            "service {}: returned {} trunk reservations",
            self.id,
            reservations.len()
        );
    }

    /// Re-run the fold outside any event, e.g. when a release finds no
    /// sub-services left to wait for.
    fn settle(&self) {
        let to_return = {
            let mut body = self.body.lock().unwrap();
            self.reconsider(&mut body)
        };
        if let Some(reservations) = to_return {
            self.return_reservations(reservations);
        }
        self.stable.notify_all();
        self.outbox.deliver(self.id);
    }

    /// Asynchronously release every sub-service that is not yet released,
    /// then let the fold return the trunk reservations.
    fn spawn_rollback(&self) {
        let me = match self.weak.upgrade() {
            Some(me) => me,
            None => return,
        };
        thread::spawn(move || {
            // keep sweeping until no unreleased sub-service remains, so
            // sub-services recorded while the failure was propagating are
            // not missed
            let mut last: Vec<ServiceId> = Vec::new();
            loop {
                let targets: Vec<Service> = {
                    let body = me.body.lock().unwrap();
                    body.subs
                        .iter()
                        .filter(|s| s.status != ServiceState::Released)
                        .filter_map(|s| s.service.clone())
                        .collect()
                };
                if targets.is_empty() {
                    break;
                }
                let ids: Vec<ServiceId> = targets.iter().map(|s| s.id()).collect();
                if ids == last {
                    warn!("service {}: rollback made no progress, giving up", me.id);
                    break;
                }
                last = ids;
                debug!(
                    "service {}: rolling back {} sub-services",
                    me.id,
                    targets.len()
                );
                for sub in targets {
                    if let Err(e) = sub.release() {
                        warn!("service {}: rollback release failed: {}", me.id, e);
                    }
                }
            }
            me.settle();
        });
    }
}
