//! Assembly of the gateway's shared components

use crate::aggregator::Aggregator;
use crate::breaker::BreakerRegistry;
use crate::config::{Config, TransportKind};
use crate::k8s::{ClusterApi, ClusterDirectory};
use crate::metrics::GatewayMetrics;
use crate::protocol::{Dispatcher, ToolRegistry};
use crate::server::ServerState;
use crate::transport::{exec::ExecTransport, http::HttpTransport, Transport};
use crate::Result;
use std::sync::Arc;
use tracing::info;

/// Everything a serving surface needs, built once at startup
#[derive(Clone)]
pub struct Gateway {
    pub config: Arc<Config>,
    pub aggregator: Arc<Aggregator>,
    pub dispatcher: Arc<Dispatcher>,
    pub metrics: GatewayMetrics,
}

impl Gateway {
    /// Wire the gateway with the transport selected by `config`
    pub fn new(config: Config, api: Arc<dyn ClusterApi>) -> Result<Self> {
        let transport: Arc<dyn Transport> = match config.transport {
            TransportKind::Http => Arc::new(HttpTransport::new(
                config.endpoint_strategy,
                config.agent_port,
            )),
            TransportKind::Exec => Arc::new(ExecTransport::new(
                api.clone(),
                config.agent_command.clone(),
            )),
        };
        Self::with_transport(config, api, transport)
    }

    pub fn with_transport(
        config: Config,
        api: Arc<dyn ClusterApi>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        config.validate()?;
        let metrics = GatewayMetrics::new()?;
        let config = Arc::new(config);

        let directory = ClusterDirectory::new(
            api,
            config.namespace.clone(),
            config.service_name.clone(),
            config.agent_selector(),
        );
        let breakers =
            Arc::new(BreakerRegistry::new(config.breaker).with_metrics(metrics.clone()));

        info!(
            "gateway: namespace={} selector={} transport={} per_call={:?} aggregate={:?}",
            config.namespace,
            config.agent_selector(),
            transport.name(),
            config.timeouts.per_call,
            config.timeouts.aggregate
        );

        let aggregator = Arc::new(
            Aggregator::new(directory, transport, breakers, config.timeouts)
                .with_metrics(metrics.clone()),
        );
        let tools = Arc::new(ToolRegistry::new(aggregator.clone(), config.clone()));
        let dispatcher = Arc::new(Dispatcher::new(tools).with_metrics(metrics.clone()));

        Ok(Self {
            config,
            aggregator,
            dispatcher,
            metrics,
        })
    }

    pub fn server_state(&self) -> ServerState {
        ServerState::new(
            self.dispatcher.clone(),
            self.aggregator.clone(),
            self.metrics.clone(),
        )
    }
}
