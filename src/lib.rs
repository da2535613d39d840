pub mod aggregator;
pub mod breaker;
pub mod cli;
pub mod config;
pub mod error;
pub mod gateway;
pub mod k8s;
pub mod metrics;
pub mod protocol;
pub mod server;
pub mod transport;

pub use error::{GatewayError, Result};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
