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

//! Tests of the aggregator: planning, label allocation, sub-request
//! synthesis, state folding, replanning and rollback.

use crate::fabric::dummy::DummyFabric;
use crate::network::aggregator::{allocate_plan, plan_tree, AggregatorError};
use crate::network::service::{EventLog, ServiceId};
use crate::network::trunk::TrunkError;
use crate::network::{
    Aggregator, Bandwidth, ConnectionRequest, EndPoint, Label, Network, ServiceEvent,
    ServiceState, Switch,
};
use crate::Error;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

struct TwoSwitchRig {
    fabric: Arc<DummyFabric>,
    s1: Arc<Network>,
    s2: Arc<Network>,
    agg: Aggregator,
}

/// Two switches joined by one trunk with 1 Gb/s each way and labels 1-100;
/// external terminals `x -> s1:a` and `y -> s2:b`.
fn two_switch_rig(fabric: Arc<DummyFabric>) -> TwoSwitchRig {
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

    TwoSwitchRig { fabric, s1, s2, agg }
}

fn xy_request(bandwidth: Bandwidth) -> ConnectionRequest {
    ConnectionRequest::of([EndPoint::of("x", 5), EndPoint::of("y", 7)], bandwidth)
}

/// Spin until `cond` holds, for tests that wait on the rollback thread.
fn eventually<F: Fn() -> bool>(cond: F) -> bool {
    for _ in 0..1000 {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

/// Scenario: two switches behind an aggregator; one trunk carries the
/// service.
#[test]
fn test_two_switch_service() {
    let rig = two_switch_rig(Arc::new(DummyFabric::new("fab")));
    let log = Arc::new(EventLog::new());

    let service = rig.agg.new_service();
    service.add_listener(log.clone());
    service.initiate(xy_request(200.0)).unwrap();
    assert_eq!(service.status(), ServiceState::Inactive);
    assert_eq!(log.events_for(service.id()), vec![ServiceEvent::Ready]);

    // label 1 on both sides, 200 Mb/s reserved each way
    let trunk = rig.agg.get_trunk("s1", "p").unwrap();
    assert_eq!(trunk.remaining_bandwidth().unwrap(), (800.0, 800.0));
    let expected: BTreeSet<Label> = (2..=100).collect();
    assert_eq!(trunk.free_labels().unwrap(), expected);

    // one sub-request per switch, carrying the trunk label
    let sub1 = rig.s1.await_service(rig.s1.list_services()[0]).unwrap();
    assert_eq!(
        sub1.request().unwrap(),
        ConnectionRequest::of([EndPoint::of("a", 5), EndPoint::of("p", 1)], 200.0)
    );
    let sub2 = rig.s2.await_service(rig.s2.list_services()[0]).unwrap();
    assert_eq!(
        sub2.request().unwrap(),
        ConnectionRequest::of([EndPoint::of("b", 7), EndPoint::of("q", 1)], 200.0)
    );

    // one bridge per switch
    assert_eq!(rig.fabric.bridge_count(), 2);
}

#[test]
fn test_composite_activation_folds_subs() {
    let rig = two_switch_rig(Arc::new(DummyFabric::new("fab")));
    let log = Arc::new(EventLog::new());
    let service = rig.agg.new_service();
    service.add_listener(log.clone());
    service.initiate(xy_request(100.0)).unwrap();

    service.activate().unwrap();
    assert_eq!(service.status(), ServiceState::Active);
    // no service is active while a sub-service lags behind
    for id in rig.s1.list_services() {
        assert_eq!(rig.s1.await_service(id).unwrap().status(), ServiceState::Active);
    }
    for id in rig.s2.list_services() {
        assert_eq!(rig.s2.await_service(id).unwrap().status(), ServiceState::Active);
    }

    service.deactivate().unwrap();
    assert_eq!(service.status(), ServiceState::Inactive);
    assert_eq!(
        log.events_for(service.id()),
        vec![
            ServiceEvent::Ready,
            ServiceEvent::Activating,
            ServiceEvent::Activated,
            ServiceEvent::Deactivating,
            ServiceEvent::Deactivated,
        ]
    );
}

/// Round-trip: initiate then release restores every pool and budget.
#[test]
fn test_release_restores_trunk_resources() {
    let rig = two_switch_rig(Arc::new(DummyFabric::new("fab")));
    let trunk = rig.agg.get_trunk("s1", "p").unwrap();
    let labels_before = trunk.free_labels().unwrap();
    let bandwidth_before = trunk.remaining_bandwidth().unwrap();

    let service = rig.agg.new_service();
    service.initiate(xy_request(300.0)).unwrap();
    assert_ne!(trunk.remaining_bandwidth().unwrap(), bandwidth_before);

    service.release().unwrap();
    assert_eq!(service.status(), ServiceState::Released);
    assert_eq!(trunk.free_labels().unwrap(), labels_before);
    assert_eq!(trunk.remaining_bandwidth().unwrap(), bandwidth_before);
    // all sub-services went with it
    for id in rig.s1.list_services() {
        assert_eq!(
            rig.s1.await_service(id).unwrap().status(),
            ServiceState::Released
        );
    }
    assert_eq!(rig.fabric.bridge_count(), 0);
}

/// I5 at the composite level: the second release adds nothing.
#[test]
fn test_composite_release_is_idempotent() {
    let rig = two_switch_rig(Arc::new(DummyFabric::new("fab")));
    let log = Arc::new(EventLog::new());
    let service = rig.agg.new_service();
    service.add_listener(log.clone());
    service.initiate(xy_request(100.0)).unwrap();

    service.release().unwrap();
    let events = log.events_for(service.id());
    service.release().unwrap();
    assert_eq!(log.events_for(service.id()), events);
}

#[test]
fn test_zero_bandwidth_request() {
    let rig = two_switch_rig(Arc::new(DummyFabric::new("fab")));
    let service = rig.agg.new_service();
    service.initiate(xy_request(0.0)).unwrap();
    assert_eq!(service.status(), ServiceState::Inactive);

    let trunk = rig.agg.get_trunk("s1", "p").unwrap();
    // a label is consumed, bandwidth is not
    assert!(!trunk.free_labels().unwrap().contains(&1));
    assert_eq!(trunk.remaining_bandwidth().unwrap(), (1000.0, 1000.0));
}

/// All end points behind one inferior network: the request passes through
/// rewritten, with no trunk resources touched.
#[test]
fn test_single_inferior_passthrough() {
    let rig = two_switch_rig(Arc::new(DummyFabric::new("fab")));
    rig.s1.unwrap_switch().add_terminal("c", "i-c").unwrap();
    rig.agg.add_terminal("x2", "s1", "c").unwrap();

    let service = rig.agg.new_service();
    service
        .initiate(ConnectionRequest::of(
            [EndPoint::of("x", 5), EndPoint::of("x2", 6)],
            150.0,
        ))
        .unwrap();
    assert_eq!(service.status(), ServiceState::Inactive);

    let trunk = rig.agg.get_trunk("s1", "p").unwrap();
    assert_eq!(trunk.free_labels().unwrap().len(), 100);
    assert_eq!(trunk.remaining_bandwidth().unwrap(), (1000.0, 1000.0));

    assert_eq!(rig.s1.list_services().len(), 1);
    assert!(rig.s2.list_services().is_empty());
    let sub = rig.s1.await_service(rig.s1.list_services()[0]).unwrap();
    assert_eq!(
        sub.request().unwrap(),
        ConnectionRequest::of([EndPoint::of("a", 5), EndPoint::of("c", 6)], 150.0)
    );
}

/// A competitor holding label 1 pushes the next service to label 2.
#[test]
fn test_planner_skips_taken_labels() {
    let rig = two_switch_rig(Arc::new(DummyFabric::new("fab")));
    {
        let mut inner = rig.agg.shared().inner.lock().unwrap();
        let state = inner.trunks.values_mut().next().unwrap();
        assert_eq!(state.allocate(0.0, 0.0, ServiceId(999)), Ok((1, 1)));
    }

    let service = rig.agg.new_service();
    service.initiate(xy_request(200.0)).unwrap();
    let sub1 = rig.s1.await_service(rig.s1.list_services()[0]).unwrap();
    assert!(sub1
        .request()
        .unwrap()
        .endpoints
        .contains(&EndPoint::of("p", 2)));
}

/// Scenario: the planner loses an allocation race and replans onto the
/// other trunk. The race window sits between the planning and allocation
/// critical sections, so it can be driven deterministically through the
/// planner's own stages.
#[test]
fn test_replan_after_allocation_race() {
    let rig = two_switch_rig(Arc::new(DummyFabric::new("fab")));
    // a second, thinner trunk in parallel
    let sw1 = rig.s1.unwrap_switch();
    let sw2 = rig.s2.unwrap_switch();
    sw1.add_terminal("p2", "i-p2").unwrap();
    sw2.add_terminal("q2", "i-q2").unwrap();
    let spare = rig.agg.add_trunk("s1", "p2", "s2", "q2").unwrap();
    spare.set_delay(1.0).unwrap();
    spare.set_bandwidth(500.0, 500.0).unwrap();
    spare.provide_labels(20..=30).unwrap();

    let shared = rig.agg.shared();
    let involved: BTreeSet<String> = ["s1".to_string(), "s2".to_string()].into_iter().collect();

    // plan: the fat trunk is preferred
    let tree = {
        let inner = shared.inner.lock().unwrap();
        plan_tree(&inner, &involved, 200.0).unwrap()
    };
    let fat = rig.agg.get_trunk("s1", "p").unwrap().id();
    assert_eq!(tree, vec![fat]);

    // a competitor drains the fat trunk before the allocation section runs
    {
        let mut inner = shared.inner.lock().unwrap();
        inner
            .trunks
            .get_mut(&fat)
            .unwrap()
            .allocate(900.0, 900.0, ServiceId(999))
            .unwrap();
    }

    // the stale plan now fails to allocate
    {
        let mut inner = shared.inner.lock().unwrap();
        assert!(matches!(
            allocate_plan(&mut inner, &tree, 200.0, ServiceId(1000)),
            Err(TrunkError::OutOfBandwidth(_, _))
        ));
    }

    // replanning against the new capacity view lands on the spare trunk
    let tree = {
        let inner = shared.inner.lock().unwrap();
        plan_tree(&inner, &involved, 200.0).unwrap()
    };
    assert_eq!(tree, vec![spare.id()]);
    let reservations = {
        let mut inner = shared.inner.lock().unwrap();
        allocate_plan(&mut inner, &tree, 200.0, ServiceId(1000)).unwrap()
    };
    assert_eq!(reservations.len(), 1);
    assert_eq!(reservations[0].label_a, 20);

    // and a full initiation takes the same route
    let service = rig.agg.new_service();
    service.initiate(xy_request(200.0)).unwrap();
    assert_eq!(service.status(), ServiceState::Inactive);
    assert_eq!(spare.remaining_bandwidth().unwrap(), (100.0, 100.0));
}

/// Scenario: label exhaustion. The planner retries `MAX_REPLAN` times and
/// reports the request unroutable, with no side effects.
#[test]
fn test_unroutable_after_label_exhaustion() {
    let rig = two_switch_rig(Arc::new(DummyFabric::new("fab")));
    let trunk = rig.agg.get_trunk("s1", "p").unwrap();
    trunk.revoke_labels(4..=100).unwrap();

    // three services eat the three labels
    for i in 0..3 {
        let service = rig.agg.new_service();
        service
            .initiate(ConnectionRequest::of(
                [EndPoint::of("x", 10 + i), EndPoint::of("y", 20 + i)],
                10.0,
            ))
            .unwrap();
    }
    assert!(trunk.free_labels().unwrap().is_empty());
    let subs_before = rig.s1.list_services().len();
    let bandwidth_before = trunk.remaining_bandwidth().unwrap();

    let service = rig.agg.new_service();
    let err = service.initiate(xy_request(10.0)).unwrap_err();
    assert_eq!(err, Error::Aggregator(AggregatorError::Unroutable(10.0)));

    // no side effects: state reverted, nothing allocated, nothing submitted
    assert_eq!(service.status(), ServiceState::Dormant);
    assert_eq!(rig.s1.list_services().len(), subs_before);
    assert_eq!(trunk.remaining_bandwidth().unwrap(), bandwidth_before);
}

/// A request whose bandwidth no trunk can carry is unroutable immediately.
#[test]
fn test_unroutable_bandwidth() {
    let rig = two_switch_rig(Arc::new(DummyFabric::new("fab")));
    let service = rig.agg.new_service();
    let err = service.initiate(xy_request(5000.0)).unwrap_err();
    assert_eq!(err, Error::Aggregator(AggregatorError::Unroutable(5000.0)));
    assert_eq!(service.status(), ServiceState::Dormant);
}

#[test]
fn test_unknown_terminal_in_request() {
    let rig = two_switch_rig(Arc::new(DummyFabric::new("fab")));
    let service = rig.agg.new_service();
    let err = service
        .initiate(ConnectionRequest::of(
            [EndPoint::of("x", 1), EndPoint::of("zz", 2)],
            10.0,
        ))
        .unwrap_err();
    assert_eq!(
        err,
        Error::Aggregator(AggregatorError::UnknownTerminal("zz".to_string()))
    );
    assert_eq!(service.status(), ServiceState::Dormant);
}

/// Scenario: a three-node chain where the middle switch's bridge fails.
/// The composite fails, the healthy sub-services are rolled back, and both
/// trunks return their labels and bandwidth.
#[test]
fn test_rollback_on_sub_failure() {
    let fabric = Arc::new(DummyFabric::new("fab"));
    let sw1 = Switch::new("s1", fabric.clone());
    sw1.add_terminal("a", "i-a").unwrap();
    sw1.add_terminal("p", "i-p").unwrap();
    let sw2 = Switch::new("s2", fabric.clone());
    sw2.add_terminal("q1", "i-q1").unwrap();
    sw2.add_terminal("q2", "i-q2").unwrap();
    let sw3 = Switch::new("s3", fabric.clone());
    sw3.add_terminal("c", "i-c").unwrap();
    sw3.add_terminal("r", "i-r").unwrap();

    let s1 = Arc::new(Network::Switch(sw1));
    let s2 = Arc::new(Network::Switch(sw2));
    let s3 = Arc::new(Network::Switch(sw3));
    let agg = Aggregator::new("agg");
    agg.add_network(&s1);
    agg.add_network(&s2);
    agg.add_network(&s3);
    for (n1, t1, n2, t2) in [("s1", "p", "s2", "q1"), ("s2", "q2", "s3", "r")] {
        let trunk = agg.add_trunk(n1, t1, n2, t2).unwrap();
        trunk.set_delay(1.0).unwrap();
        trunk.set_bandwidth(1000.0, 1000.0).unwrap();
        trunk.provide_labels(1..=50).unwrap();
    }
    agg.add_terminal("x", "s1", "a").unwrap();
    agg.add_terminal("z", "s3", "c").unwrap();

    // the middle switch cannot realise its bridge
    fabric.break_interface("i-q1");

    let log = Arc::new(EventLog::new());
    let service = agg.new_service();
    service.add_listener(log.clone());
    service
        .initiate(ConnectionRequest::of(
            [EndPoint::of("x", 5), EndPoint::of("z", 7)],
            100.0,
        ))
        .unwrap();

    // rollback runs asynchronously; wait for it to finish
    assert!(eventually(|| service.status() == ServiceState::Released));
    let events = log.events_for(service.id());
    assert!(matches!(events[0], ServiceEvent::Failed { .. }));
    assert_eq!(events.last(), Some(&ServiceEvent::Released));

    // every sub-service was released
    for net in [&s1, &s2, &s3] {
        for id in net.list_services() {
            let state = net.await_service(id).unwrap().status();
            assert!(
                state == ServiceState::Released || state == ServiceState::Dormant,
                "leftover sub-service in {:?}",
                state
            );
        }
    }

    // both trunks returned their labels and bandwidth
    for (net, term) in [("s1", "p"), ("s2", "q2")] {
        let trunk = agg.get_trunk(net, term).unwrap();
        assert_eq!(trunk.free_labels().unwrap().len(), 50);
        assert_eq!(trunk.remaining_bandwidth().unwrap(), (1000.0, 1000.0));
    }
    assert_eq!(fabric.bridge_count(), 0);
}

/// Composite initiation blocks until the fabric answers.
#[test]
fn test_initiation_blocks_until_stable() {
    let rig = two_switch_rig(Arc::new(DummyFabric::deferred("fab")));
    let service = rig.agg.new_service();
    let mover = service.clone();

    let worker = thread::spawn(move || mover.initiate(xy_request(100.0)));

    // both sub-bridges must be requested before we let them complete
    assert!(eventually(|| rig.fabric.bridge_count() == 2));
    assert_eq!(service.status(), ServiceState::Establishing);

    rig.fabric.complete_pending();
    worker.join().unwrap().unwrap();
    assert_eq!(service.status(), ServiceState::Inactive);
}

#[test]
fn test_management_errors() {
    let rig = two_switch_rig(Arc::new(DummyFabric::new("fab")));
    let agg = &rig.agg;

    assert_eq!(
        agg.add_terminal("x", "s1", "a"),
        Err(AggregatorError::TerminalExists("x".to_string()))
    );
    assert_eq!(
        agg.add_terminal("w", "agg", "x"),
        Err(AggregatorError::OwnTerminal("agg:x".to_string()))
    );
    assert_eq!(
        agg.add_terminal("w", "zz", "a"),
        Err(AggregatorError::UnknownSubnetwork("zz".to_string()))
    );
    assert_eq!(
        agg.add_terminal("w", "s1", "zz"),
        Err(AggregatorError::UnknownTerminal("s1:zz".to_string()))
    );
    // the backing terminal of an alias is claimed
    assert_eq!(
        agg.add_terminal("w", "s1", "a"),
        Err(AggregatorError::TerminalInUse("s1:a".to_string()))
    );

    assert_eq!(
        agg.add_trunk("agg", "x", "s2", "q"),
        Err(AggregatorError::OwnTerminal("agg:x".to_string()))
    );
    assert_eq!(
        agg.add_trunk("zz", "p", "s2", "q"),
        Err(AggregatorError::UnknownSubnetwork("zz".to_string()))
    );
    // a trunked terminal cannot carry a second trunk
    assert_eq!(
        agg.add_trunk("s1", "p", "s2", "b"),
        Err(AggregatorError::TerminalInUse("s1:p".to_string()))
    );
    // an aliased terminal cannot carry a trunk
    assert_eq!(
        agg.add_trunk("s1", "a", "s2", "b"),
        Err(AggregatorError::TerminalInUse("s1:a".to_string()))
    );

    assert!(agg.find_trunk("s1", "zz").is_none());
    assert_eq!(
        agg.get_trunk("s1", "zz"),
        Err(AggregatorError::UnknownTrunk("s1:zz".to_string()))
    );
}

#[test]
fn test_remove_trunk_with_live_allocations() {
    let rig = two_switch_rig(Arc::new(DummyFabric::new("fab")));
    let service = rig.agg.new_service();
    service.initiate(xy_request(100.0)).unwrap();

    assert_eq!(
        rig.agg.remove_trunk("s1", "p"),
        Err(AggregatorError::TerminalInUse("s1:p".to_string()))
    );
    let trunk = rig.agg.get_trunk("s1", "p").unwrap();
    assert_eq!(
        trunk.decommission(),
        Err(AggregatorError::TerminalInUse("s1:p".to_string()))
    );

    service.release().unwrap();
    trunk.decommission().unwrap();
    assert!(rig.agg.find_trunk("s1", "p").is_none());
    // the stale handle now reports the trunk gone
    assert!(matches!(trunk.delay(), Err(TrunkError::Gone(_))));
}

#[test]
fn test_remove_terminal_guards() {
    let rig = two_switch_rig(Arc::new(DummyFabric::new("fab")));
    let service = rig.agg.new_service();
    service.initiate(xy_request(100.0)).unwrap();

    assert_eq!(
        rig.agg.remove_terminal("x"),
        Err(AggregatorError::TerminalInUse("x".to_string()))
    );
    service.release().unwrap();
    rig.agg.remove_terminal("x").unwrap();
    assert_eq!(
        rig.agg.remove_terminal("x"),
        Err(AggregatorError::UnknownTerminal("x".to_string()))
    );
}

/// Inferiors are held weakly: a vanished one fails the service, which is
/// then rolled back.
#[test]
fn test_dropped_inferior_network() {
    let rig = two_switch_rig(Arc::new(DummyFabric::new("fab")));
    let TwoSwitchRig { fabric: _fabric, s1, s2, agg } = rig;
    drop(s2);

    let service = agg.new_service();
    let err = service.initiate(xy_request(100.0)).unwrap_err();
    assert_eq!(
        err,
        Error::Aggregator(AggregatorError::UnknownSubnetwork("s2".to_string()))
    );
    assert!(eventually(|| service.status() == ServiceState::Released));

    // the trunk reservations went back
    let trunk = agg.get_trunk("s1", "p").unwrap();
    assert_eq!(trunk.remaining_bandwidth().unwrap(), (1000.0, 1000.0));
    assert_eq!(trunk.free_labels().unwrap().len(), 100);
    drop(s1);
}
