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

//! Tests of persistence records and restart reconciliation.

use crate::agent::Broker;
use crate::fabric::dummy::DummyFabric;
use crate::fabric::{BridgeListener, Circuit, Fabric, FabricError, TrafficFlow};
use crate::network::service::ServiceId;
use crate::network::{
    Aggregator, ConnectionRequest, EndPoint, Network, Service, ServiceState, Switch,
};
use crate::persist::{
    restore, snapshot, BrokerRecord, JsonStore, PersistError, ServiceRecord, SwitchRecord,
    TerminalRecord,
};
use crate::Error;
use std::collections::BTreeMap;
use std::sync::Arc;

struct Quiet;

impl BridgeListener for Quiet {
    fn created(&self) {}
    fn destroyed(&self) {}
    fn error(&self, _reason: FabricError) {}
}

struct Rig {
    fabric: Arc<DummyFabric>,
    broker: Broker,
    #[allow(dead_code)]
    nets: Vec<Arc<Network>>,
}

/// The two-switch broker, assembled by hand so the concrete fabric stays
/// accessible.
fn rigged_broker() -> Rig {
    let fabric = Arc::new(DummyFabric::new("fab"));
    let sw1 = Switch::new("s1", fabric.clone());
    sw1.add_terminal("a", "i-a").unwrap();
    sw1.add_terminal("p", "i-p").unwrap();
    let sw2 = Switch::new("s2", fabric.clone());
    sw2.add_terminal("b", "i-b").unwrap();
    sw2.add_terminal("q", "i-q").unwrap();
    let s1 = Arc::new(Network::Switch(sw1));
    let s2 = Arc::new(Network::Switch(sw2));

    let agg = Aggregator::new("agg");
    agg.add_network(&s1);
    agg.add_network(&s2);
    let trunk = agg.add_trunk("s1", "p", "s2", "q").unwrap();
    trunk.set_delay(1.0).unwrap();
    trunk.set_bandwidth(1000.0, 1000.0).unwrap();
    trunk.provide_labels(1..=100).unwrap();
    agg.add_terminal("x", "s1", "a").unwrap();
    agg.add_terminal("y", "s2", "b").unwrap();
    let agg = Arc::new(Network::Aggregator(agg));

    let mut fabrics: BTreeMap<String, Arc<dyn Fabric>> = BTreeMap::new();
    fabrics.insert("fab".to_string(), fabric.clone());
    let mut broker = Broker::with_fabrics(fabrics);
    broker.insert_network("s1".to_string(), s1.clone(), Some("fab".to_string()));
    broker.insert_network("s2".to_string(), s2.clone(), Some("fab".to_string()));
    broker.insert_network("agg".to_string(), agg.clone(), None);

    Rig {
        fabric,
        broker,
        nets: vec![s1, s2, agg],
    }
}

/// Scenario: two persisted services survive a broker restart; a bridge
/// nobody claims any more is garbage-collected by the fabric.
#[test]
fn test_restart_reconciliation() {
    let rig = rigged_broker();
    let agg = rig.broker.network("agg").unwrap();

    let service_a = agg.new_service();
    service_a
        .initiate(ConnectionRequest::of(
            [EndPoint::of("x", 5), EndPoint::of("y", 7)],
            100.0,
        ))
        .unwrap();
    let service_b = agg.new_service();
    service_b
        .initiate(ConnectionRequest::of(
            [EndPoint::of("x", 6), EndPoint::of("y", 8)],
            200.0,
        ))
        .unwrap();
    assert_eq!(rig.fabric.bridge_count(), 4);

    // a pre-existing bridge no current service accounts for
    let stray = rig.fabric.bridge(
        Arc::new(Quiet),
        [(
            Circuit::new(rig.fabric.interface("i-zz").unwrap(), 1),
            TrafficFlow::symmetric(1.0),
        )]
        .into_iter()
        .collect(),
    );
    assert_eq!(rig.fabric.bridge_count(), 5);

    let record = snapshot(&rig.broker);
    assert_eq!(record.switches.len(), 2);
    assert_eq!(record.aggregators.len(), 1);
    assert_eq!(record.aggregators[0].services.len(), 2);

    // "restart": rebuild everything against the same fabric
    let restored = restore(&record, rig.broker.fabrics()).unwrap();

    // the composite services come back ready, under their old ids
    let agg2 = restored.network("agg").unwrap();
    let service = agg2.await_service(service_a.id()).unwrap();
    assert_eq!(service.status(), ServiceState::Inactive);
    assert_eq!(
        agg2.await_service(service_b.id()).unwrap().status(),
        ServiceState::Inactive
    );

    // bridges were re-adopted, not duplicated; the stray one is gone
    assert_eq!(rig.fabric.bridge_count(), 4);
    assert!(rig.fabric.removed_bridges().contains(&stray.id()));

    // trunk books match the two live services
    let trunk = agg2.unwrap_aggregator().get_trunk("s1", "p").unwrap();
    assert_eq!(trunk.remaining_bandwidth().unwrap(), (700.0, 700.0));
    assert!(!trunk.free_labels().unwrap().contains(&1));
    assert!(!trunk.free_labels().unwrap().contains(&2));

    // a restored service releases cleanly, returning its share
    service.release().unwrap();
    assert_eq!(service.status(), ServiceState::Released);
    assert_eq!(trunk.remaining_bandwidth().unwrap(), (800.0, 800.0));
    assert!(trunk.free_labels().unwrap().contains(&1));
}

#[test]
fn test_restore_requires_fabric() {
    let rig = rigged_broker();
    let record = snapshot(&rig.broker);
    let empty: BTreeMap<String, Arc<dyn Fabric>> = BTreeMap::new();
    assert_eq!(
        restore(&record, &empty).unwrap_err(),
        Error::Persist(PersistError::UnknownFabric("fab".to_string()))
    );
}

/// Released and dormant services are not worth persisting.
#[test]
fn test_snapshot_skips_dead_services() {
    let rig = rigged_broker();
    let agg = rig.broker.network("agg").unwrap();

    let dormant = agg.new_service();
    let released = agg.new_service();
    released
        .initiate(ConnectionRequest::of(
            [EndPoint::of("x", 5), EndPoint::of("y", 7)],
            100.0,
        ))
        .unwrap();
    released.release().unwrap();
    let _ = dormant;

    let record = snapshot(&rig.broker);
    assert!(record.aggregators[0].services.is_empty());
    assert!(record.switches.iter().all(|s| s.services.is_empty()));
}

#[test]
fn test_store_round_trip() {
    let rig = rigged_broker();
    let agg = rig.broker.network("agg").unwrap();
    let service = agg.new_service();
    service
        .initiate(ConnectionRequest::of(
            [EndPoint::of("x", 5), EndPoint::of("y", 7)],
            100.0,
        ))
        .unwrap();
    let record = snapshot(&rig.broker);

    let path = std::env::temp_dir().join(format!(
        "wattle-store-{}-{:?}.json",
        std::process::id(),
        std::thread::current().id()
    ));
    let store = JsonStore::new(&path);
    store.save(&record).unwrap();
    let loaded = store.load().unwrap();
    assert_eq!(loaded, record);
    let _ = std::fs::remove_file(&path);
}

#[test]
fn test_record_upserts_are_idempotent() {
    let mut record = BrokerRecord::default();
    record.upsert_switch(SwitchRecord {
        name: "s".to_string(),
        fabric: "f".to_string(),
        terminals: vec![TerminalRecord {
            name: "a".to_string(),
            interface: "i-a".to_string(),
        }],
        services: vec![ServiceRecord {
            id: 7,
            endpoints: vec![EndPoint::of("a", 1)],
            bandwidth: 10.0,
        }],
    });
    record.upsert_switch(SwitchRecord {
        name: "s".to_string(),
        fabric: "f".to_string(),
        terminals: vec![],
        services: vec![ServiceRecord {
            id: 7,
            endpoints: vec![EndPoint::of("a", 2)],
            bandwidth: 20.0,
        }],
    });
    assert_eq!(record.switches.len(), 1);
    assert!(record.switches[0].terminals.is_empty());

    record.remove_service(ServiceId(7));
    assert!(record.switches[0].services.is_empty());
}

/// The restored broker keeps serving: a new service can be planned on the
/// restored topology alongside the restored ones.
#[test]
fn test_restored_broker_plans_new_services() {
    let rig = rigged_broker();
    let agg = rig.broker.network("agg").unwrap();
    let service = agg.new_service();
    service
        .initiate(ConnectionRequest::of(
            [EndPoint::of("x", 5), EndPoint::of("y", 7)],
            100.0,
        ))
        .unwrap();

    let record = snapshot(&rig.broker);
    let restored = restore(&record, rig.broker.fabrics()).unwrap();

    let agg2 = restored.network("agg").unwrap();
    let fresh = agg2.new_service();
    fresh
        .initiate(ConnectionRequest::of(
            [EndPoint::of("x", 15), EndPoint::of("y", 17)],
            100.0,
        ))
        .unwrap();
    assert_eq!(fresh.status(), ServiceState::Inactive);

    // the fresh service must not reuse the restored service's label
    let trunk = agg2.unwrap_aggregator().get_trunk("s1", "p").unwrap();
    assert_eq!(trunk.remaining_bandwidth().unwrap(), (800.0, 800.0));
    assert!(matches!(
        agg2.await_service(fresh.id()),
        Some(Service::Aggregator(_))
    ));
}
