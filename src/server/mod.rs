//! Serving surfaces: HTTP (`/mcp` plus probes) and stdio

pub mod http;
pub mod sessions;
pub mod stdio;

use crate::aggregator::Aggregator;
use crate::metrics::GatewayMetrics;
use crate::protocol::Dispatcher;
use std::sync::Arc;

/// Shared by every HTTP handler
#[derive(Clone)]
pub struct ServerState {
    pub dispatcher: Arc<Dispatcher>,
    pub aggregator: Arc<Aggregator>,
    pub metrics: GatewayMetrics,
    pub sessions: Arc<SessionStore>,
}

impl ServerState {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        aggregator: Arc<Aggregator>,
        metrics: GatewayMetrics,
    ) -> Self {
        Self {
            dispatcher,
            aggregator,
            metrics,
            sessions: Arc::new(SessionStore::default()),
        }
    }

    pub fn with_sessions(mut self, sessions: SessionStore) -> Self {
        self.sessions = Arc::new(sessions);
        self
    }
}

pub use http::{router, serve, SESSION_HEADER};
pub use sessions::SessionStore;
pub use stdio::run_stdio;
