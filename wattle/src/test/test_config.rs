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

//! Tests of configuration parsing and the agent registry.

use crate::agent::AgentRegistry;
use crate::config::{BrokerConfig, ConfigError, LabelSpec};
use crate::network::{ConnectionRequest, EndPoint, ServiceState};

const BROKER_TOML: &str = r#"
[[agents]]
name = "fab"
type = "dummy-fabric"

[[agents]]
name = "s1"
type = "switch"
fabric = "fab"
[agents.terminals]
a = "i-a"
p = "i-p"

[[agents]]
name = "s2"
type = "switch"
fabric = "fab"
[agents.terminals]
b = "i-b"
q = "i-q"

[[agents]]
name = "agg"
type = "aggregator"
[agents.terminals.x]
network = "s1"
subterm = "a"
[agents.terminals.y]
network = "s2"
subterm = "b"
[agents.trunks.t1]
end1 = { network = "s1", terminal = "p" }
end2 = { network = "s2", terminal = "q" }
delay = 1.0
up = 1000.0
down = 1000.0
labels = "1-100"
"#;

#[test]
fn test_parse_and_build() {
    let config = BrokerConfig::parse(BROKER_TOML).unwrap();
    assert_eq!(config.agents.len(), 4);

    let broker = AgentRegistry::with_builtin().build(&config).unwrap();
    assert!(broker.fabric("fab").is_some());
    let s1 = broker.network("s1").unwrap();
    assert!(s1.has_terminal("a") && s1.has_terminal("p"));
    assert_eq!(broker.binding("s1"), Some("fab"));

    let agg = broker.network("agg").unwrap();
    assert_eq!(agg.list_terminals(), vec!["x".to_string(), "y".to_string()]);
    let trunk = agg.unwrap_aggregator().get_trunk("s1", "p").unwrap();
    assert_eq!(trunk.delay().unwrap(), 1.0);
    assert_eq!(trunk.remaining_bandwidth().unwrap(), (1000.0, 1000.0));
    assert_eq!(trunk.free_labels().unwrap().len(), 100);
}

/// The built broker is fully operational end to end.
#[test]
fn test_built_broker_carries_a_service() {
    let config = BrokerConfig::parse(BROKER_TOML).unwrap();
    let broker = AgentRegistry::with_builtin().build(&config).unwrap();
    let agg = broker.network("agg").unwrap();

    let service = agg.new_service();
    service
        .initiate(ConnectionRequest::of(
            [EndPoint::of("x", 5), EndPoint::of("y", 7)],
            200.0,
        ))
        .unwrap();
    assert_eq!(service.status(), ServiceState::Inactive);
}

#[test]
fn test_unknown_agent_type() {
    let config = BrokerConfig::parse(
        r#"
[[agents]]
name = "odd"
type = "teleporter"
"#,
    )
    .unwrap();
    assert_eq!(
        AgentRegistry::with_builtin().build(&config).unwrap_err(),
        ConfigError::UnknownAgentType("odd".to_string(), "teleporter".to_string())
    );
}

#[test]
fn test_duplicate_agent_name() {
    let config = BrokerConfig::parse(
        r#"
[[agents]]
name = "fab"
type = "dummy-fabric"

[[agents]]
name = "fab"
type = "dummy-fabric"
"#,
    )
    .unwrap();
    assert_eq!(
        AgentRegistry::with_builtin().build(&config).unwrap_err(),
        ConfigError::DuplicateAgent("fab".to_string())
    );
}

#[test]
fn test_switch_requires_fabric() {
    let config = BrokerConfig::parse(
        r#"
[[agents]]
name = "s1"
type = "switch"
"#,
    )
    .unwrap();
    assert_eq!(
        AgentRegistry::with_builtin().build(&config).unwrap_err(),
        ConfigError::MissingKey("s1".to_string(), "fabric")
    );
}

#[test]
fn test_forward_references_are_rejected() {
    // the switch names a fabric declared after it
    let config = BrokerConfig::parse(
        r#"
[[agents]]
name = "s1"
type = "switch"
fabric = "fab"

[[agents]]
name = "fab"
type = "dummy-fabric"
"#,
    )
    .unwrap();
    assert_eq!(
        AgentRegistry::with_builtin().build(&config).unwrap_err(),
        ConfigError::UnknownReference("s1".to_string(), "fab".to_string())
    );
}

#[test]
fn test_switch_terminal_must_be_interface() {
    let config = BrokerConfig::parse(
        r#"
[[agents]]
name = "fab"
type = "dummy-fabric"

[[agents]]
name = "s1"
type = "switch"
fabric = "fab"
[agents.terminals.a]
network = "s2"
subterm = "b"
"#,
    )
    .unwrap();
    assert!(matches!(
        AgentRegistry::with_builtin().build(&config).unwrap_err(),
        ConfigError::Build(name, _) if name == "s1"
    ));
}

#[test]
fn test_label_specs() {
    assert_eq!(LabelSpec::One(7).labels("a").unwrap(), vec![7]);
    assert_eq!(
        LabelSpec::Many(vec![1, 2, 9]).labels("a").unwrap(),
        vec![1, 2, 9]
    );
    assert_eq!(
        LabelSpec::Range("1-4".to_string()).labels("a").unwrap(),
        vec![1, 2, 3, 4]
    );
    assert_eq!(
        LabelSpec::Range(" 10 - 12 ".to_string()).labels("a").unwrap(),
        vec![10, 11, 12]
    );
    assert!(LabelSpec::Range("4-1".to_string()).labels("a").is_err());
    assert!(LabelSpec::Range("0-5".to_string()).labels("a").is_err());
    assert!(LabelSpec::Range("nope".to_string()).labels("a").is_err());
}

#[test]
fn test_label_spec_forms_parse_from_toml() {
    let config = BrokerConfig::parse(
        r#"
[[agents]]
name = "agg"
type = "aggregator"
[agents.trunks.t1]
end1 = { network = "s1", terminal = "p" }
end2 = { network = "s2", terminal = "q" }
labels = [4, 5, 6]
[agents.trunks.t2]
end1 = { network = "s1", terminal = "p2" }
end2 = { network = "s2", terminal = "q2" }
labels = 9
"#,
    )
    .unwrap();
    let agent = &config.agents[0];
    assert_eq!(
        agent.trunks["t1"].labels.as_ref().unwrap().labels("agg").unwrap(),
        vec![4, 5, 6]
    );
    assert_eq!(
        agent.trunks["t2"].labels.as_ref().unwrap().labels("agg").unwrap(),
        vec![9]
    );
}

#[test]
fn test_syntax_error_is_reported() {
    assert!(matches!(
        BrokerConfig::parse("this is not toml ["),
        Err(ConfigError::Syntax(_))
    ));
}
