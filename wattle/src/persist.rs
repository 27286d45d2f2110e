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

//! # Persistence and restart reconciliation
//!
//! Serialisable records of a broker's networks: terminals, trunks with
//! their label allocations, external terminal mappings, and the plans of
//! live services. [`snapshot`] captures a [`Broker`]; [`restore`] rebuilds
//! one against the same fabrics and then reconciles with them: every live
//! switch service re-submits its circuit set (bridge creation is idempotent,
//! so this re-adopts the existing bridge and reinstalls its listener) and
//! each fabric is told to [`retain`](crate::fabric::Fabric::retain) exactly
//! the re-adopted bridges, garbage-collecting the rest.
//!
//! Records are plain `serde` values; [`JsonStore`] keeps them in a JSON
//! file replaced atomically on every save. Upserts are idempotent and keyed
//! by name (networks) or id (services).

use crate::agent::Broker;
use crate::fabric::{BridgeId, Fabric};
use crate::network::aggregator::{Plan, Reservation, SubPlan};
use crate::network::switch::SwitchService;
use crate::network::trunk::{TrunkAllocation, TrunkEnd};
use crate::network::{
    Aggregator, Bandwidth, ConnectionRequest, EndPoint, Label, Network, Service, ServiceId,
    ServiceState, Switch,
};
use crate::Error;
use log::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error as ThisError;

/// Persistence errors
#[derive(Debug, ThisError, PartialEq)]
pub enum PersistError {
    /// The store cannot be read or written.
    #[error("cannot access store: {0}")]
    Io(String),
    /// The records cannot be encoded or decoded.
    #[error("cannot encode or decode records: {0}")]
    Codec(String),
    /// A record references a fabric that was not supplied.
    #[error("record references unknown fabric {0}")]
    UnknownFabric(String),
    /// A record references a network that was not restored.
    #[error("record references unknown network {0}")]
    UnknownNetwork(String),
    /// A record references a service that was not restored.
    #[error("record references unknown service #{0}")]
    UnknownService(u64),
    /// A record references a trunk that was not restored.
    #[error("record references unknown trunk at {0}")]
    UnknownTrunk(String),
}

/// Everything needed to reconstruct a broker's networks and live services.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct BrokerRecord {
    /// All switches, with their terminals and live services.
    pub switches: Vec<SwitchRecord>,
    /// All aggregators, inner ones before the aggregators composing them.
    pub aggregators: Vec<AggregatorRecord>,
}

/// A switch and its live services.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwitchRecord {
    /// The switch's name.
    pub name: String,
    /// The name of the fabric the switch drives.
    pub fabric: String,
    /// The switch's terminals.
    pub terminals: Vec<TerminalRecord>,
    /// The switch's live services.
    pub services: Vec<ServiceRecord>,
}

/// A switch terminal and its backing interface description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminalRecord {
    /// Local terminal name.
    pub name: String,
    /// Fabric interface description.
    pub interface: String,
}

/// A live service of a switch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRecord {
    /// Broker-scoped service id.
    pub id: u64,
    /// The end points of the service's request.
    pub endpoints: Vec<EndPoint>,
    /// The requested bandwidth.
    pub bandwidth: Bandwidth,
}

/// An aggregator, its topology, and its live services.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatorRecord {
    /// The aggregator's name.
    pub name: String,
    /// Names of the inferior networks.
    pub inferiors: Vec<String>,
    /// External terminal aliases.
    pub terminals: Vec<AliasRecord>,
    /// Trunks, including their label allocations.
    pub trunks: Vec<TrunkRecord>,
    /// Live composite services.
    pub services: Vec<CompositeServiceRecord>,
}

/// An external terminal alias of an aggregator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AliasRecord {
    /// Local name of the external terminal.
    pub name: String,
    /// Name of the inferior network.
    pub network: String,
    /// Local name of the backing terminal.
    pub subterm: String,
}

/// A trunk, its budgets, and its allocations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrunkRecord {
    /// The first end (reference orientation).
    pub end1: TrunkEnd,
    /// The second end.
    pub end2: TrunkEnd,
    /// Delay metric.
    pub delay: f64,
    /// Upstream bandwidth budget.
    pub up: Bandwidth,
    /// Downstream bandwidth budget.
    pub down: Bandwidth,
    /// The operator-declared label range.
    pub labels: Vec<Label>,
    /// Current allocations.
    pub allocations: Vec<AllocationRecord>,
}

/// One label-pair allocation on a trunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationRecord {
    /// Label on side A (end1).
    pub label_a: Label,
    /// Label on side B (end2).
    pub label_b: Label,
    /// Upstream bandwidth held.
    pub up: Bandwidth,
    /// Downstream bandwidth held.
    pub down: Bandwidth,
    /// Owning service id.
    pub service: u64,
}

/// A live composite service of an aggregator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositeServiceRecord {
    /// Broker-scoped service id.
    pub id: u64,
    /// The end points of the original request.
    pub endpoints: Vec<EndPoint>,
    /// The requested bandwidth.
    pub bandwidth: Bandwidth,
    /// The trunk reservations of the service's plan.
    pub reservations: Vec<ReservationRecord>,
    /// The sub-services the plan was decomposed into.
    pub subs: Vec<SubRecord>,
}

/// A persisted trunk reservation, identifying the trunk by its first end
/// (a terminal participates in at most one trunk).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReservationRecord {
    /// The trunk's first end.
    pub end1: TrunkEnd,
    /// Label allocated on side A.
    pub label_a: Label,
    /// Label allocated on side B.
    pub label_b: Label,
    /// Upstream bandwidth reserved.
    pub up: Bandwidth,
    /// Downstream bandwidth reserved.
    pub down: Bandwidth,
}

/// A reference to one sub-service of a composite plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubRecord {
    /// Name of the inferior network owning the sub-service.
    pub network: String,
    /// The sub-service's id within that network.
    pub service: u64,
}

impl BrokerRecord {
    /// Insert or replace a switch record, keyed by name.
    pub fn upsert_switch(&mut self, record: SwitchRecord) {
        self.switches.retain(|s| s.name != record.name);
        self.switches.push(record);
    }

    /// Insert or replace an aggregator record, keyed by name.
    pub fn upsert_aggregator(&mut self, record: AggregatorRecord) {
        self.aggregators.retain(|a| a.name != record.name);
        self.aggregators.push(record);
    }

    /// Drop a service record wherever it appears.
    pub fn remove_service(&mut self, id: ServiceId) {
        for switch in &mut self.switches {
            switch.services.retain(|s| s.id != id.0);
        }
        for aggregator in &mut self.aggregators {
            aggregator.services.retain(|s| s.id != id.0);
        }
    }
}

/// Whether a service's state is worth persisting.
fn is_live(state: ServiceState) -> bool {
    matches!(
        state,
        ServiceState::Establishing
            | ServiceState::Inactive
            | ServiceState::Activating
            | ServiceState::Active
            | ServiceState::Deactivating
    )
}

/// Capture every network and live service of a broker.
pub fn snapshot(broker: &Broker) -> BrokerRecord {
    let mut record = BrokerRecord::default();
    for (name, network) in broker.networks() {
        match network.as_ref() {
            Network::Switch(switch) => {
                record.switches.push(snapshot_switch(
                    switch,
                    broker.binding(name).unwrap_or_default(),
                ));
            }
            Network::Aggregator(aggregator) => {
                record.aggregators.push(snapshot_aggregator(aggregator));
            }
        }
    }
    record
}

fn snapshot_switch(switch: &Switch, fabric: &str) -> SwitchRecord {
    let terminals = switch
        .list_terminals()
        .into_iter()
        .filter_map(|name| {
            let interface = switch.terminal_interface(&name).ok()?;
            Some(TerminalRecord {
                name,
                interface: interface.name().to_string(),
            })
        })
        .collect();
    let mut services = Vec::new();
    for id in switch.list_services() {
        let service = match switch.await_service(id) {
            Some(service) => service,
            None => continue,
        };
        if !is_live(service.status()) {
            continue;
        }
        if let Some(request) = service.request() {
            services.push(ServiceRecord {
                id: id.0,
                endpoints: request.endpoints.iter().cloned().collect(),
                bandwidth: request.bandwidth,
            });
        }
    }
    SwitchRecord {
        name: switch.name().to_string(),
        fabric: fabric.to_string(),
        terminals,
        services,
    }
}

fn snapshot_aggregator(aggregator: &Aggregator) -> AggregatorRecord {
    let shared = aggregator.shared();
    let (inferiors, terminals, trunks, service_arcs) = {
        let inner = shared.inner.lock().unwrap();
        let inferiors: Vec<String> = inner.inferiors.keys().cloned().collect();
        let terminals: Vec<AliasRecord> = inner
            .terminals
            .iter()
            .map(|(name, outer)| AliasRecord {
                name: name.clone(),
                network: outer.network.clone(),
                subterm: outer.terminal.clone(),
            })
            .collect();
        let trunks: Vec<TrunkRecord> = inner
            .trunks
            .values()
            .map(|t| {
                let (up, down) = t.capacity();
                TrunkRecord {
                    end1: t.end_a.clone(),
                    end2: t.end_b.clone(),
                    delay: t.delay,
                    up,
                    down,
                    labels: t.declared_labels().iter().copied().collect(),
                    allocations: t
                        .allocations()
                        .iter()
                        .map(|(label_a, a)| AllocationRecord {
                            label_a: *label_a,
                            label_b: a.label_b,
                            up: a.up,
                            down: a.down,
                            service: a.service.0,
                        })
                        .collect(),
                }
            })
            .collect();
        let service_arcs: Vec<_> = inner.services.values().cloned().collect();
        (inferiors, terminals, trunks, service_arcs)
    };

    let mut services = Vec::new();
    for service in service_arcs {
        if !is_live(service.status()) {
            continue;
        }
        let (request, plan) = match (service.request(), service.plan()) {
            (Some(request), Some(plan)) => (request, plan),
            _ => continue,
        };
        let subs = service.sub_services();
        if subs.len() != plan.subs.len() {
            warn!("service {}: plan and sub-services disagree, skipping", service.id());
            continue;
        }
        services.push(CompositeServiceRecord {
            id: service.id().0,
            endpoints: request.endpoints.iter().cloned().collect(),
            bandwidth: request.bandwidth,
            reservations: plan
                .reservations
                .iter()
                .map(|r| ReservationRecord {
                    end1: r.end_a.clone(),
                    label_a: r.label_a,
                    label_b: r.label_b,
                    up: r.up,
                    down: r.down,
                })
                .collect(),
            subs: plan
                .subs
                .iter()
                .zip(subs.iter())
                .map(|(plan, service)| SubRecord {
                    network: plan.network.clone(),
                    service: service.id().0,
                })
                .collect(),
        });
    }

    AggregatorRecord {
        name: aggregator.name().to_string(),
        inferiors,
        terminals,
        trunks,
        services,
    }
}

/// Rebuild a broker from records against the given fabrics, then reconcile
/// the fabrics: re-adopt the bridges of live services and garbage-collect
/// the rest. Listener reinstallation happens before any user-requested
/// transition can be replayed, because it *is* the bridge re-adoption.
pub fn restore(
    record: &BrokerRecord,
    fabrics: &BTreeMap<String, Arc<dyn Fabric>>,
) -> Result<Broker, Error> {
    let mut broker = Broker::with_fabrics(fabrics.clone());

    // networks first: switches, then aggregators in record order
    for sr in &record.switches {
        let fabric = fabrics
            .get(&sr.fabric)
            .cloned()
            .ok_or_else(|| PersistError::UnknownFabric(sr.fabric.clone()))?;
        let switch = Switch::new(&sr.name, fabric);
        for terminal in &sr.terminals {
            switch
                .add_terminal(&terminal.name, &terminal.interface)
                .map_err(Error::from)?;
        }
        broker.insert_network(
            sr.name.clone(),
            Arc::new(Network::Switch(switch)),
            Some(sr.fabric.clone()),
        );
    }
    for ar in &record.aggregators {
        let aggregator = Aggregator::new(&ar.name);
        for inferior in &ar.inferiors {
            let network = broker
                .network(inferior)
                .ok_or_else(|| PersistError::UnknownNetwork(inferior.clone()))?;
            aggregator.add_network(&network);
        }
        for tr in &ar.trunks {
            let trunk = aggregator
                .add_trunk(
                    &tr.end1.network,
                    &tr.end1.terminal,
                    &tr.end2.network,
                    &tr.end2.terminal,
                )
                .map_err(Error::from)?;
            trunk.set_delay(tr.delay).map_err(Error::from)?;
            trunk.set_bandwidth(tr.up, tr.down).map_err(Error::from)?;
            trunk
                .provide_labels(tr.labels.iter().copied())
                .map_err(Error::from)?;
        }
        for alias in &ar.terminals {
            aggregator
                .add_terminal(&alias.name, &alias.network, &alias.subterm)
                .map_err(Error::from)?;
        }
        // re-impose the label allocations recorded on each trunk
        {
            let mut inner = aggregator.shared().inner.lock().unwrap();
            for tr in &ar.trunks {
                let state = inner
                    .trunks
                    .values_mut()
                    .find(|t| t.end_a == tr.end1 && t.end_b == tr.end2)
                    .ok_or_else(|| PersistError::UnknownTrunk(tr.end1.to_string()))?;
                for a in &tr.allocations {
                    state
                        .restore_allocation(
                            a.label_a,
                            TrunkAllocation {
                                label_b: a.label_b,
                                up: a.up,
                                down: a.down,
                                service: ServiceId(a.service),
                            },
                        )
                        .map_err(Error::from)?;
                }
            }
        }
        broker.insert_network(ar.name.clone(), Arc::new(Network::Aggregator(aggregator)), None);
    }

    // switch services, collecting them per fabric for reconciliation
    let mut restored: Vec<(String, Arc<SwitchService>)> = Vec::new();
    for sr in &record.switches {
        let network = broker
            .network(&sr.name)
            .ok_or_else(|| PersistError::UnknownNetwork(sr.name.clone()))?;
        let switch = network.unwrap_switch();
        for rec in &sr.services {
            let request =
                ConnectionRequest::of(rec.endpoints.iter().cloned(), rec.bandwidth);
            let service = switch.restore_service(ServiceId(rec.id), request)?;
            restored.push((sr.fabric.clone(), service));
        }
    }

    // composite services, re-attached to their restored sub-services
    for ar in &record.aggregators {
        let network = broker
            .network(&ar.name)
            .ok_or_else(|| PersistError::UnknownNetwork(ar.name.clone()))?;
        let aggregator = network.unwrap_aggregator();
        for rec in &ar.services {
            let request =
                ConnectionRequest::of(rec.endpoints.iter().cloned(), rec.bandwidth);
            let mut subs: Vec<Service> = Vec::new();
            let mut sub_plans: Vec<SubPlan> = Vec::new();
            for sub in &rec.subs {
                let inferior = broker
                    .network(&sub.network)
                    .ok_or_else(|| PersistError::UnknownNetwork(sub.network.clone()))?;
                let service = inferior
                    .await_service(ServiceId(sub.service))
                    .ok_or(PersistError::UnknownService(sub.service))?;
                sub_plans.push(SubPlan {
                    network: sub.network.clone(),
                    request: service.request().unwrap_or_else(|| {
                        ConnectionRequest::of(std::iter::empty(), rec.bandwidth)
                    }),
                });
                subs.push(service);
            }
            let reservations = {
                let inner = aggregator.shared().inner.lock().unwrap();
                let mut reservations: Vec<Reservation> = Vec::new();
                for r in &rec.reservations {
                    let state = inner
                        .trunks
                        .values()
                        .find(|t| t.end_a == r.end1)
                        .ok_or_else(|| PersistError::UnknownTrunk(r.end1.to_string()))?;
                    reservations.push(Reservation {
                        trunk: state.id,
                        end_a: state.end_a.clone(),
                        end_b: state.end_b.clone(),
                        label_a: r.label_a,
                        label_b: r.label_b,
                        up: r.up,
                        down: r.down,
                    });
                }
                reservations
            };
            let plan = Plan {
                reservations,
                subs: sub_plans,
            };
            aggregator.restore_service(ServiceId(rec.id), request, plan, subs);
        }
    }

    // reconciliation: re-adopt bridges, then garbage-collect per fabric
    let mut keep: BTreeMap<String, BTreeSet<BridgeId>> = BTreeMap::new();
    for sr in &record.switches {
        keep.entry(sr.fabric.clone()).or_default();
    }
    for (fabric_name, service) in &restored {
        let bridge = service.resubmit()?;
        keep.entry(fabric_name.clone()).or_default().insert(bridge);
    }
    for (fabric_name, bridges) in &keep {
        if let Some(fabric) = fabrics.get(fabric_name) {
            info!(
                "fabric {}: retaining {} bridges after restart",
                fabric_name,
                bridges.len()
            );
            fabric.retain(bridges);
        }
    }

    Ok(broker)
}

/// A JSON file store with atomic replacement.
pub struct JsonStore {
    path: PathBuf,
}

impl JsonStore {
    /// Create a store over the given path.
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    /// Serialise and atomically replace the stored record.
    pub fn save(&self, record: &BrokerRecord) -> Result<(), PersistError> {
        let encoded = serde_json::to_vec_pretty(record)
            .map_err(|e| PersistError::Codec(e.to_string()))?;
        let staging = self.path.with_extension("tmp");
        std::fs::write(&staging, encoded).map_err(|e| PersistError::Io(e.to_string()))?;
        std::fs::rename(&staging, &self.path).map_err(|e| PersistError::Io(e.to_string()))?;
        Ok(())
    }

    /// Load the stored record.
    pub fn load(&self) -> Result<BrokerRecord, PersistError> {
        let text =
            std::fs::read_to_string(&self.path).map_err(|e| PersistError::Io(e.to_string()))?;
        serde_json::from_str(&text).map_err(|e| PersistError::Codec(e.to_string()))
    }
}
