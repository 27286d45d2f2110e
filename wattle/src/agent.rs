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

//! # Agent registry
//!
//! Agents are the deployable units of a broker: fabrics, switches and
//! aggregators. An [`AgentRegistry`] maps `type` strings to
//! [`AgentFactory`] implementations and builds a [`Broker`] from a
//! [`BrokerConfig`], wiring the dependencies (switch to fabric, aggregator
//! to inferiors) as it goes. The core network types never learn about
//! configuration; everything is injected here.

use crate::config::{AgentConfig, BrokerConfig, ConfigError, TerminalConfig};
use crate::fabric::dummy::DummyFabric;
use crate::fabric::Fabric;
use crate::network::{Aggregator, Network, Switch};
use log::*;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// A built agent: a network or a fabric.
pub enum Agent {
    /// A switch or aggregator.
    Network(Arc<Network>),
    /// A fabric driver.
    Fabric(Arc<dyn Fabric>),
}

/// The collection of built agents, indexed by name.
#[derive(Default)]
pub struct Broker {
    fabrics: BTreeMap<String, Arc<dyn Fabric>>,
    networks: BTreeMap<String, Arc<Network>>,
    bindings: BTreeMap<String, String>,
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("fabrics", &self.fabrics.keys().collect::<Vec<_>>())
            .field("networks", &self.networks.keys().collect::<Vec<_>>())
            .field("bindings", &self.bindings)
            .finish()
    }
}

impl Broker {
    /// An empty broker.
    pub fn new() -> Self {
        Self::default()
    }

    /// A broker primed with existing fabrics, as used when restoring
    /// persisted state.
    pub fn with_fabrics(fabrics: BTreeMap<String, Arc<dyn Fabric>>) -> Self {
        Self {
            fabrics,
            networks: BTreeMap::new(),
            bindings: BTreeMap::new(),
        }
    }

    /// Look up a fabric by name.
    pub fn fabric(&self, name: &str) -> Option<Arc<dyn Fabric>> {
        self.fabrics.get(name).cloned()
    }

    /// Look up a network by name.
    pub fn network(&self, name: &str) -> Option<Arc<Network>> {
        self.networks.get(name).cloned()
    }

    /// All networks, by name.
    pub fn networks(&self) -> &BTreeMap<String, Arc<Network>> {
        &self.networks
    }

    /// All fabrics, by name.
    pub fn fabrics(&self) -> &BTreeMap<String, Arc<dyn Fabric>> {
        &self.fabrics
    }

    /// The fabric name a switch was built with.
    pub fn binding(&self, switch: &str) -> Option<&str> {
        self.bindings.get(switch).map(String::as_str)
    }

    pub(crate) fn insert_fabric(&mut self, name: String, fabric: Arc<dyn Fabric>) {
        self.fabrics.insert(name, fabric);
    }

    pub(crate) fn insert_network(
        &mut self,
        name: String,
        network: Arc<Network>,
        binding: Option<String>,
    ) {
        if let Some(fabric) = binding {
            self.bindings.insert(name.clone(), fabric);
        }
        self.networks.insert(name, network);
    }
}

/// Builds one kind of agent from its configuration. Factories see the
/// broker as built so far, so an agent can only reference agents declared
/// before it.
pub trait AgentFactory: Send + Sync {
    /// Build the agent.
    fn build(&self, config: &AgentConfig, broker: &Broker) -> Result<Agent, ConfigError>;
}

/// A registry of agent factories, keyed by the `type` string of the
/// configuration.
#[derive(Default)]
pub struct AgentRegistry {
    factories: BTreeMap<String, Box<dyn AgentFactory>>,
}

impl AgentRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the built-in factories: `switch`, `aggregator` and
    /// `dummy-fabric`.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register("dummy-fabric", Box::new(DummyFabricFactory));
        registry.register("switch", Box::new(SwitchFactory));
        registry.register("aggregator", Box::new(AggregatorFactory));
        registry
    }

    /// Register a factory for an agent type, replacing any previous one.
    pub fn register<S: Into<String>>(&mut self, kind: S, factory: Box<dyn AgentFactory>) {
        self.factories.insert(kind.into(), factory);
    }

    /// Build every agent of `config`, in declaration order.
    pub fn build(&self, config: &BrokerConfig) -> Result<Broker, ConfigError> {
        let mut broker = Broker::new();
        for agent in &config.agents {
            if broker.fabrics.contains_key(&agent.name)
                || broker.networks.contains_key(&agent.name)
            {
                return Err(ConfigError::DuplicateAgent(agent.name.clone()));
            }
            let factory = self.factories.get(&agent.kind).ok_or_else(|| {
                ConfigError::UnknownAgentType(agent.name.clone(), agent.kind.clone())
            })?;
            match factory.build(agent, &broker)? {
                Agent::Fabric(fabric) => {
                    info!("built fabric {}", agent.name);
                    broker.insert_fabric(agent.name.clone(), fabric);
                }
                Agent::Network(network) => {
                    info!("built network {}", agent.name);
                    broker.insert_network(agent.name.clone(), network, agent.fabric.clone());
                }
            }
        }
        Ok(broker)
    }
}

/// Builds [`DummyFabric`] agents.
struct DummyFabricFactory;

impl AgentFactory for DummyFabricFactory {
    fn build(&self, config: &AgentConfig, _broker: &Broker) -> Result<Agent, ConfigError> {
        Ok(Agent::Fabric(Arc::new(DummyFabric::new(&config.name))))
    }
}

/// Builds [`Switch`] agents on a previously built fabric.
struct SwitchFactory;

impl AgentFactory for SwitchFactory {
    fn build(&self, config: &AgentConfig, broker: &Broker) -> Result<Agent, ConfigError> {
        let fabric_name = config
            .fabric
            .as_ref()
            .ok_or_else(|| ConfigError::MissingKey(config.name.clone(), "fabric"))?;
        let fabric = broker.fabric(fabric_name).ok_or_else(|| {
            ConfigError::UnknownReference(config.name.clone(), fabric_name.clone())
        })?;
        if !config.trunks.is_empty() {
            return Err(ConfigError::Build(
                config.name.clone(),
                "switches have no trunks".to_string(),
            ));
        }
        let switch = Switch::new(&config.name, fabric);
        for (terminal, decl) in &config.terminals {
            match decl {
                TerminalConfig::Interface(desc) => {
                    switch
                        .add_terminal(terminal, desc)
                        .map_err(|e| ConfigError::Build(config.name.clone(), e.to_string()))?;
                }
                TerminalConfig::Alias { .. } => {
                    return Err(ConfigError::Build(
                        config.name.clone(),
                        format!("terminal {} must name a fabric interface", terminal),
                    ));
                }
            }
        }
        Ok(Agent::Network(Arc::new(Network::Switch(switch))))
    }
}

/// Builds [`Aggregator`] agents over previously built networks.
struct AggregatorFactory;

impl AgentFactory for AggregatorFactory {
    fn build(&self, config: &AgentConfig, broker: &Broker) -> Result<Agent, ConfigError> {
        let aggregator = Aggregator::new(&config.name);

        // gather and wire every referenced inferior network first
        let mut referenced: BTreeSet<&str> = BTreeSet::new();
        for decl in config.terminals.values() {
            if let TerminalConfig::Alias { network, .. } = decl {
                referenced.insert(network);
            }
        }
        for trunk in config.trunks.values() {
            referenced.insert(&trunk.end1.network);
            referenced.insert(&trunk.end2.network);
        }
        for name in referenced {
            let network = broker.network(name).ok_or_else(|| {
                ConfigError::UnknownReference(config.name.clone(), name.to_string())
            })?;
            aggregator.add_network(&network);
        }

        for (tag, decl) in &config.trunks {
            let trunk = aggregator
                .add_trunk(
                    &decl.end1.network,
                    &decl.end1.terminal,
                    &decl.end2.network,
                    &decl.end2.terminal,
                )
                .map_err(|e| {
                    ConfigError::Build(config.name.clone(), format!("trunk {}: {}", tag, e))
                })?;
            let labels = match &decl.labels {
                Some(spec) => spec.labels(&config.name)?,
                None => Vec::new(),
            };
            trunk
                .set_delay(decl.delay)
                .and_then(|_| trunk.set_bandwidth(decl.up, decl.down))
                .and_then(|_| trunk.provide_labels(labels))
                .map_err(|e| {
                    ConfigError::Build(config.name.clone(), format!("trunk {}: {}", tag, e))
                })?;
        }

        for (terminal, decl) in &config.terminals {
            match decl {
                TerminalConfig::Alias { network, subterm } => {
                    aggregator
                        .add_terminal(terminal, network, subterm)
                        .map_err(|e| ConfigError::Build(config.name.clone(), e.to_string()))?;
                }
                TerminalConfig::Interface(_) => {
                    return Err(ConfigError::Build(
                        config.name.clone(),
                        format!("terminal {} must name an inferior terminal", terminal),
                    ));
                }
            }
        }

        Ok(Agent::Network(Arc::new(Network::Aggregator(aggregator))))
    }
}
