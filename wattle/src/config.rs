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

//! # Broker configuration
//!
//! A broker is configured as a TOML document with one `[[agents]]` array.
//! Agents are built in declaration order, so fabrics come before the
//! switches that use them, and inferior networks before the aggregators
//! that compose them.
//!
//! ```toml
//! [[agents]]
//! name = "fab"
//! type = "dummy-fabric"
//!
//! [[agents]]
//! name = "s1"
//! type = "switch"
//! fabric = "fab"
//! [agents.terminals]
//! a = "phys1"
//! p = "phys2"
//!
//! [[agents]]
//! name = "agg"
//! type = "aggregator"
//! [agents.terminals.x]
//! network = "s1"
//! subterm = "a"
//! [agents.trunks.t1]
//! end1 = { network = "s1", terminal = "p" }
//! end2 = { network = "s2", terminal = "q" }
//! delay = 1.0
//! up = 1000.0
//! down = 1000.0
//! labels = "1-100"
//! ```

use crate::network::Label;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    /// The configuration file cannot be read.
    #[error("cannot read configuration: {0}")]
    Io(String),
    /// The configuration does not parse.
    #[error("configuration syntax error: {0}")]
    Syntax(String),
    /// No factory is registered for the agent's `type`.
    #[error("agent {0}: unknown agent type {1}")]
    UnknownAgentType(String, String),
    /// A required key is missing from an agent.
    #[error("agent {0}: missing key {1}")]
    MissingKey(String, &'static str),
    /// An agent references another agent that has not been built.
    #[error("agent {0}: unknown reference to {1}")]
    UnknownReference(String, String),
    /// A label range does not parse.
    #[error("agent {0}: bad label range {1}")]
    BadLabelRange(String, String),
    /// Two agents share a name.
    #[error("duplicate agent name {0}")]
    DuplicateAgent(String),
    /// Building the agent failed.
    #[error("agent {0}: {1}")]
    Build(String, String),
}

/// The whole broker configuration: a list of agents.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct BrokerConfig {
    /// The agents to build, in order.
    #[serde(default)]
    pub agents: Vec<AgentConfig>,
}

impl BrokerConfig {
    /// Parse a configuration from TOML text.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|e| ConfigError::Syntax(e.to_string()))
    }

    /// Read and parse a configuration file.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let text =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        Self::parse(&text)
    }
}

/// One agent of the broker configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// The agent's name, unique within the broker.
    pub name: String,
    /// The agent type, selecting the factory that builds it.
    #[serde(rename = "type")]
    pub kind: String,
    /// For switches: the name of the fabric agent to use.
    #[serde(default)]
    pub fabric: Option<String>,
    /// Terminals to create on the network.
    #[serde(default)]
    pub terminals: BTreeMap<String, TerminalConfig>,
    /// Trunks to create on an aggregator.
    #[serde(default)]
    pub trunks: BTreeMap<String, TrunkConfig>,
}

/// A terminal declaration. Switch terminals name a fabric interface;
/// aggregator terminals alias an inferior network's terminal.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum TerminalConfig {
    /// Switch form: a fabric interface description.
    Interface(String),
    /// Aggregator form: the backing inferior terminal.
    Alias {
        /// Name of the inferior network.
        network: String,
        /// Local name of the terminal within the inferior network.
        subterm: String,
    },
}

/// One end of a configured trunk.
#[derive(Debug, Clone, Deserialize)]
pub struct TrunkEndConfig {
    /// Name of the inferior network owning the terminal.
    pub network: String,
    /// Local name of the terminal.
    pub terminal: String,
}

/// A trunk declaration on an aggregator.
#[derive(Debug, Clone, Deserialize)]
pub struct TrunkConfig {
    /// The first end, fixing the trunk's reference orientation.
    pub end1: TrunkEndConfig,
    /// The second end.
    pub end2: TrunkEndConfig,
    /// Delay metric of the trunk.
    #[serde(default)]
    pub delay: f64,
    /// Upstream bandwidth budget.
    #[serde(default)]
    pub up: f64,
    /// Downstream bandwidth budget.
    #[serde(default)]
    pub down: f64,
    /// The labels available on the trunk.
    #[serde(default)]
    pub labels: Option<LabelSpec>,
}

/// A label set: a `"lo-hi"` range string, a single label, or an explicit
/// list.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum LabelSpec {
    /// A single label.
    One(Label),
    /// An explicit list of labels.
    Many(Vec<Label>),
    /// An inclusive `"lo-hi"` range.
    Range(String),
}

impl LabelSpec {
    /// Expand the specification into concrete labels.
    pub fn labels(&self, agent: &str) -> Result<Vec<Label>, ConfigError> {
        match self {
            Self::One(label) => Ok(vec![*label]),
            Self::Many(labels) => Ok(labels.clone()),
            Self::Range(text) => {
                let bad = || ConfigError::BadLabelRange(agent.to_string(), text.clone());
                let (lo, hi) = text.split_once('-').ok_or_else(bad)?;
                let lo: Label = lo.trim().parse().map_err(|_| bad())?;
                let hi: Label = hi.trim().parse().map_err(|_| bad())?;
                if lo == 0 || hi < lo {
                    return Err(bad());
                }
                Ok((lo..=hi).collect())
            }
        }
    }
}
