//! Delivery of one JSON-RPC request to one agent
//!
//! - `http`: POST to the agent's `/mcp` endpoint
//! - `exec`: pipe the request through the Kubernetes exec channel
//!
//! Both bound every call by a caller-supplied deadline and classify failures
//! the same way, so the aggregator and breaker do not care which is in use.

pub mod exec;
pub mod http;

pub use exec::ExecTransport;
pub use http::HttpTransport;

use crate::k8s::Target;
use async_trait::async_trait;
use orb8_rpc::{Request, Response, RpcError};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("deadline of {0:?} exceeded")]
    Timeout(Duration),

    #[error("unreachable: {0}")]
    Unreachable(String),

    #[error("malformed agent output: {0}")]
    Malformed(String),

    /// The agent answered with a well-formed JSON-RPC error
    #[error("agent error: {0}")]
    Remote(RpcError),
}

impl TransportError {
    /// Whether this outcome says the target itself is unhealthy
    ///
    /// A well-formed error reply proves the agent is alive.
    pub fn counts_against_breaker(&self) -> bool {
        !matches!(self, TransportError::Remote(_))
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;

    /// The address this transport would use for `target`, if any
    fn endpoint(&self, target: &Target) -> Option<String>;

    /// Send `request` and return the agent's `result` payload
    async fn send(
        &self,
        endpoint: &str,
        request: &Request,
        deadline: Duration,
    ) -> Result<Value, TransportError>;
}

/// Decode agent output into the `result` of the response answering `request`
///
/// Accepts newline-delimited output and uses the last line that is a
/// response to the request id, skipping log noise and unrelated replies.
pub fn decode_response(output: &[u8], request: &Request) -> Result<Value, TransportError> {
    let text = std::str::from_utf8(output)
        .map_err(|e| TransportError::Malformed(format!("output is not UTF-8: {}", e)))?;

    if text.trim().is_empty() {
        return Err(TransportError::Malformed("empty output".to_string()));
    }

    let expected_id = request.id.clone().unwrap_or(Value::Null);

    let whole = serde_json::from_str::<Response>(text.trim()).ok();
    let response = whole
        .into_iter()
        .chain(
            text.lines()
                .rev()
                .filter_map(|line| serde_json::from_str::<Response>(line.trim()).ok()),
        )
        .find(|resp| resp.id == expected_id);

    match response {
        Some(resp) => resp.into_result().map_err(TransportError::Remote),
        None => Err(TransportError::Malformed(format!(
            "no JSON-RPC response for id {} in {} bytes of output",
            expected_id,
            output.len()
        ))),
    }
}
