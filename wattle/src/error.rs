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

//! Module containing the top-level error type

use crate::config::ConfigError;
use crate::fabric::FabricError;
use crate::graph::GraphError;
use crate::network::aggregator::AggregatorError;
use crate::network::service::LifecycleError;
use crate::network::switch::SwitchError;
use crate::network::trunk::TrunkError;
use crate::persist::PersistError;
use thiserror::Error;

/// Main error type
#[derive(Debug, Error, PartialEq)]
pub enum Error {
    /// Error propagated from the graph library
    #[error("Routing error: {0}")]
    Graph(#[from] GraphError),
    /// Error reported by a fabric driver
    #[error("Fabric error: {0}")]
    Fabric(#[from] FabricError),
    /// Error propagated from a switch
    #[error("Switch error: {0}")]
    Switch(#[from] SwitchError),
    /// Error propagated from a trunk
    #[error("Trunk error: {0}")]
    Trunk(#[from] TrunkError),
    /// Error propagated from an aggregator
    #[error("Aggregator error: {0}")]
    Aggregator(#[from] AggregatorError),
    /// Error in the service lifecycle
    #[error("Lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),
    /// Error in the broker configuration
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    /// Error while persisting or restoring broker state
    #[error("Persistence error: {0}")]
    Persist(#[from] PersistError),
}
