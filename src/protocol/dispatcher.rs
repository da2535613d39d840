use super::tools::ToolRegistry;
use crate::metrics::GatewayMetrics;
use orb8_rpc::{
    codes, tool_result, Request, Response, RpcError, JSONRPC_VERSION, MCP_PROTOCOL_VERSION,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const SERVER_NAME: &str = "orb8-gateway";

const KNOWN_METHODS: &[&str] = &[
    "initialize",
    "notifications/initialized",
    "ping",
    "tools/list",
    "tools/call",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Initialized,
}

/// Per-client protocol state
#[derive(Debug, Clone)]
pub struct Session {
    state: SessionState,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self {
            state: SessionState::Uninitialized,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_initialized(&self) -> bool {
        self.state == SessionState::Initialized
    }

    pub fn mark_initialized(&mut self) {
        self.state = SessionState::Initialized;
    }
}

#[derive(Debug, Deserialize)]
struct CallParams {
    name: String,
    #[serde(default)]
    arguments: Value,
}

/// Routes JSON-RPC requests to protocol handlers and tools
pub struct Dispatcher {
    tools: Arc<ToolRegistry>,
    metrics: Option<GatewayMetrics>,
}

impl Dispatcher {
    pub fn new(tools: Arc<ToolRegistry>) -> Self {
        Self {
            tools,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: GatewayMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Handle one raw message body
    ///
    /// Returns `None` for notifications.
    pub async fn handle_raw(
        &self,
        session: &mut Session,
        body: &[u8],
        cancel: &CancellationToken,
    ) -> Option<Response> {
        match parse_request(body) {
            Ok(request) => self.handle(session, request, cancel).await,
            Err(response) => {
                self.count("invalid", "error");
                Some(*response)
            }
        }
    }

    pub async fn handle(
        &self,
        session: &mut Session,
        request: Request,
        cancel: &CancellationToken,
    ) -> Option<Response> {
        let method_label = if KNOWN_METHODS.contains(&request.method.as_str()) {
            request.method.clone()
        } else {
            "unknown".to_string()
        };

        let outcome = self.route(session, &request, cancel).await;
        self.count(&method_label, if outcome.is_ok() { "ok" } else { "error" });

        if let Err(e) = &outcome {
            debug!("{} failed: {}", request.method, e);
        }

        let id = request.id?;
        Some(match outcome {
            Ok(result) => Response::success(id, result),
            Err(error) => Response::error(id, error),
        })
    }

    fn count(&self, method: &str, outcome: &str) {
        if let Some(m) = &self.metrics {
            m.requests_total.with_label_values(&[method, outcome]).inc();
        }
    }

    async fn route(
        &self,
        session: &mut Session,
        request: &Request,
        cancel: &CancellationToken,
    ) -> Result<Value, RpcError> {
        match request.method.as_str() {
            "initialize" => Ok(self.initialize(session, request.params.as_ref())),
            "ping" => Ok(json!({})),
            "notifications/initialized" => Ok(Value::Null),
            method if !KNOWN_METHODS.contains(&method) => {
                Err(RpcError::method_not_found(method))
            }
            _ if !session.is_initialized() => Err(RpcError::new(
                codes::NOT_INITIALIZED,
                "Session not initialized",
            )),
            "tools/list" => Ok(json!({ "tools": self.tools.list() })),
            "tools/call" => self.call_tool(request.params.clone(), cancel).await,
            method => Err(RpcError::method_not_found(method)),
        }
    }

    fn initialize(&self, session: &mut Session, params: Option<&Value>) -> Value {
        let requested = params
            .and_then(|p| p.get("protocolVersion"))
            .and_then(Value::as_str);
        if let Some(version) = requested {
            if version != MCP_PROTOCOL_VERSION {
                warn!(
                    "client requested protocol {}, answering with {}",
                    version, MCP_PROTOCOL_VERSION
                );
            }
        }

        if !session.is_initialized() {
            let client = params
                .and_then(|p| p.get("clientInfo"))
                .and_then(|c| c.get("name"))
                .and_then(Value::as_str)
                .unwrap_or("unknown");
            info!("session initialized (client: {})", client);
        }
        session.mark_initialized();

        json!({
            "protocolVersion": MCP_PROTOCOL_VERSION,
            "capabilities": {
                "tools": { "listChanged": false },
            },
            "serverInfo": {
                "name": SERVER_NAME,
                "version": crate::VERSION,
            },
        })
    }

    async fn call_tool(
        &self,
        params: Option<Value>,
        cancel: &CancellationToken,
    ) -> Result<Value, RpcError> {
        let params = params.ok_or_else(|| RpcError::invalid_params("missing params"))?;
        let call: CallParams =
            serde_json::from_value(params).map_err(RpcError::invalid_params)?;

        let payload = self
            .tools
            .call(&call.name, call.arguments, cancel)
            .await
            .map_err(|e| e.to_rpc())?;

        Ok(tool_result(&payload))
    }
}

/// Decode a message body into a request or the error response for it
///
/// Anything that does not decode into a JSON-RPC 2.0 request is a parse
/// error. The id is echoed when one can be recovered.
fn parse_request(body: &[u8]) -> Result<Request, Box<Response>> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| Box::new(Response::error(Value::Null, RpcError::parse_error(e))))?;

    let id = match value.get("id") {
        Some(id @ (Value::Null | Value::Number(_) | Value::String(_))) => id.clone(),
        _ => Value::Null,
    };
    let malformed =
        |detail: String| Box::new(Response::error(id.clone(), RpcError::parse_error(detail)));

    if !value.is_object() {
        return Err(malformed("expected a request object".to_string()));
    }

    let request: Request = serde_json::from_value(value).map_err(|e| malformed(e.to_string()))?;

    if request.jsonrpc != JSONRPC_VERSION {
        return Err(malformed(format!(
            "unsupported jsonrpc version {:?}",
            request.jsonrpc
        )));
    }
    if let Some(other) = &request.id {
        if !(other.is_null() || other.is_number() || other.is_string()) {
            return Err(malformed(format!("invalid id {}", other)));
        }
    }

    Ok(request)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_request_errors() {
        let err = parse_request(b"{not json").unwrap_err();
        assert_eq!(err.id, Value::Null);
        assert_eq!(err.into_result().unwrap_err().code, codes::PARSE_ERROR);

        let err = parse_request(b"[1, 2]").unwrap_err();
        assert_eq!(err.into_result().unwrap_err().code, codes::PARSE_ERROR);

        let err = parse_request(br#"{"jsonrpc":"1.0","id":4,"method":"ping"}"#).unwrap_err();
        assert_eq!(err.id, json!(4));
        assert_eq!(err.into_result().unwrap_err().code, codes::PARSE_ERROR);

        let err = parse_request(br#"{"jsonrpc":"2.0","id":{"a":1},"method":"ping"}"#).unwrap_err();
        assert_eq!(err.into_result().unwrap_err().code, codes::PARSE_ERROR);

        let err = parse_request(br#"{"jsonrpc":"2.0","id":"x"}"#).unwrap_err();
        assert_eq!(err.id, json!("x"));
    }

    #[test]
    fn test_parse_request_notification() {
        let req = parse_request(br#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#)
            .unwrap();
        assert!(req.is_notification());
    }

    #[test]
    fn test_session_starts_uninitialized() {
        let session = Session::new();
        assert_eq!(session.state(), SessionState::Uninitialized);
        assert!(!session.is_initialized());
    }
}
