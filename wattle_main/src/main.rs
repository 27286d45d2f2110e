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

use clap::{Parser, Subcommand};
use log::*;
use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use wattle::agent::{AgentRegistry, Broker};
use wattle::config::BrokerConfig;
use wattle::network::{
    ConnectionRequest, EndPoint, Network, ServiceEvent, ServiceId, ServiceListener,
};

#[derive(Parser)]
#[command(
    name = "wattle",
    version,
    about = "Hierarchical data-plane service broker"
)]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate a broker configuration and print the resulting topology
    Check {
        /// Path to the TOML broker configuration
        config: PathBuf,
    },
    /// Build a broker from a configuration and carry one connection request
    /// through its lifecycle
    Request {
        /// Path to the TOML broker configuration
        config: PathBuf,
        /// The network to submit the request to
        network: String,
        /// End points, as `terminal:label` pairs
        #[arg(required = true)]
        endpoints: Vec<String>,
        /// Minimum bandwidth in each direction, in Mb/s
        #[arg(long, default_value_t = 0.0)]
        bandwidth: f64,
        /// Also activate the service before releasing it
        #[arg(long)]
        activate: bool,
    },
    /// Run the built-in two-switch demonstration
    Demo,
}

/// Prints every lifecycle event a service emits.
struct Narrator;

impl ServiceListener for Narrator {
    fn on_event(&self, service: ServiceId, event: ServiceEvent) {
        println!("service {}: {:?}", service, event);
    }
}

const DEMO_CONFIG: &str = r#"
[[agents]]
name = "fab"
type = "dummy-fabric"

[[agents]]
name = "s1"
type = "switch"
fabric = "fab"
[agents.terminals]
a = "phys1"
p = "phys2"

[[agents]]
name = "s2"
type = "switch"
fabric = "fab"
[agents.terminals]
b = "phys3"
q = "phys4"

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

fn main() -> Result<(), Box<dyn Error>> {
    pretty_env_logger::init();
    let args = Args::parse();

    match args.cmd {
        Command::Check { config } => {
            let broker = build_broker(&BrokerConfig::from_path(config)?)?;
            print_topology(&broker);
        }
        Command::Request {
            config,
            network,
            endpoints,
            bandwidth,
            activate,
        } => {
            let broker = build_broker(&BrokerConfig::from_path(config)?)?;
            let endpoints = endpoints
                .iter()
                .map(|text| parse_endpoint(text))
                .collect::<Result<Vec<_>, _>>()?;
            carry_request(&broker, &network, endpoints, bandwidth, activate)?;
        }
        Command::Demo => {
            let broker = build_broker(&BrokerConfig::parse(DEMO_CONFIG)?)?;
            print_topology(&broker);
            carry_request(
                &broker,
                "agg",
                vec![EndPoint::of("x", 5), EndPoint::of("y", 7)],
                200.0,
                true,
            )?;
        }
    }
    Ok(())
}

fn build_broker(config: &BrokerConfig) -> Result<Broker, Box<dyn Error>> {
    let broker = AgentRegistry::with_builtin().build(config)?;
    info!(
        "built {} fabrics and {} networks",
        broker.fabrics().len(),
        broker.networks().len()
    );
    Ok(broker)
}

fn print_topology(broker: &Broker) {
    for (name, network) in broker.networks() {
        match network.as_ref() {
            Network::Switch(_) => {
                println!(
                    "switch {} (fabric {}): terminals {}",
                    name,
                    broker.binding(name).unwrap_or("?"),
                    network.list_terminals().join(", ")
                );
            }
            Network::Aggregator(aggregator) => {
                println!(
                    "aggregator {}: terminals {}",
                    name,
                    network.list_terminals().join(", ")
                );
                for id in aggregator.list_trunks() {
                    let trunk = match aggregator.trunk_by_id(id) {
                        Some(trunk) => trunk,
                        None => continue,
                    };
                    if let (Ok((end1, end2)), Ok(delay), Ok((up, down)), Ok(labels)) = (
                        trunk.ends(),
                        trunk.delay(),
                        trunk.remaining_bandwidth(),
                        trunk.free_labels(),
                    ) {
                        println!(
                            "  {} <-> {}: delay {}, {}/{} Mb/s free, {} labels free",
                            end1,
                            end2,
                            delay,
                            up,
                            down,
                            labels.len()
                        );
                    }
                }
            }
        }
    }
}

fn carry_request(
    broker: &Broker,
    network: &str,
    endpoints: Vec<EndPoint>,
    bandwidth: f64,
    activate: bool,
) -> Result<(), Box<dyn Error>> {
    let network = broker
        .network(network)
        .ok_or_else(|| format!("no such network: {}", network))?;

    let service = network.new_service();
    service.add_listener(Arc::new(Narrator));
    println!("service {} created", service.id());

    service.initiate(ConnectionRequest::of(endpoints, bandwidth))?;
    println!("service {} settled as {:?}", service.id(), service.status());

    if activate {
        service.activate()?;
        service.deactivate()?;
    }
    service.release()?;
    println!("service {} released", service.id());
    Ok(())
}

fn parse_endpoint(text: &str) -> Result<EndPoint, Box<dyn Error>> {
    let (terminal, label) = text
        .rsplit_once(':')
        .ok_or_else(|| format!("end point {} is not terminal:label", text))?;
    Ok(EndPoint::of(terminal, label.parse()?))
}
