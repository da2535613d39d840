pub mod commands;

use crate::config::{Config, EndpointStrategy, TransportKind};
use clap::{Args, Parser, Subcommand};
use std::net::SocketAddr;

#[derive(Parser)]
#[command(name = "orb8-gateway")]
#[command(author = "Ignoramuss")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Cluster-wide GPU diagnostics gateway for per-node orb8 agents", long_about = None)]
pub struct Cli {
    #[arg(short, long, global = true, help = "Enable verbose logging")]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    #[command(about = "Serve JSON-RPC over HTTP with health and metrics endpoints")]
    Serve {
        #[arg(
            short,
            long,
            env = "ORB8_LISTEN_ADDR",
            default_value = "0.0.0.0:8000",
            help = "Listen address"
        )]
        addr: SocketAddr,

        #[command(flatten)]
        overrides: ConfigOverrides,
    },
    #[command(about = "Serve one JSON-RPC session over stdin/stdout")]
    Stdio {
        #[command(flatten)]
        overrides: ConfigOverrides,
    },
    #[command(about = "Print the agent targets currently discovered")]
    Targets {
        #[arg(long, help = "Print JSON instead of a table")]
        json: bool,

        #[command(flatten)]
        overrides: ConfigOverrides,
    },
}

/// Flags that take precedence over `ORB8_*` environment settings
#[derive(Args, Debug, Default, Clone)]
pub struct ConfigOverrides {
    #[arg(short, long, help = "Namespace the agents run in")]
    pub namespace: Option<String>,

    #[arg(long, value_enum, help = "How requests reach the agents")]
    pub transport: Option<TransportKind>,

    #[arg(long, value_enum, help = "How agent HTTP endpoints are addressed")]
    pub endpoint_strategy: Option<EndpointStrategy>,

    #[arg(long, help = "Agent HTTP port")]
    pub agent_port: Option<u16>,
}

impl ConfigOverrides {
    pub fn apply(&self, config: &mut Config) {
        if let Some(ns) = &self.namespace {
            config.namespace = ns.clone();
        }
        if let Some(transport) = self.transport {
            config.transport = transport;
        }
        if let Some(strategy) = self.endpoint_strategy {
            config.endpoint_strategy = strategy;
        }
        if let Some(port) = self.agent_port.filter(|p| *p > 0) {
            config.agent_port = port;
        }
    }
}
