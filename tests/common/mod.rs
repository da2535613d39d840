#![allow(dead_code)]

use orb8_gateway::config::{Config, TransportKind};
use orb8_gateway::gateway::Gateway;
use orb8_gateway::k8s::fake::{agent_pod, gpu_node};
use orb8_gateway::k8s::{ExecError, ExecOutput, InMemoryCluster};
use orb8_gateway::protocol::Session;
use orb8_rpc::{tool_payload, tool_result, Request, Response};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub const NAMESPACE: &str = "gpu-diagnostics";
pub const AGENT_LABELS: &[(&str, &str)] = &[("app.kubernetes.io/name", "gpu-agent")];
pub const NODE_LABELS: &[(&str, &str)] = &[("nvidia.com/gpu.present", "true")];

/// Pods whose name contains this marker fail their exec call
pub const BROKEN: &str = "broken";

/// A cluster with one ready agent per `(node, pod)` pair and an exec
/// handler that answers like a one-shot agent
pub fn cluster(agents: &[(&str, &str)]) -> InMemoryCluster {
    let cluster = InMemoryCluster::new();
    for (i, (node, pod)) in agents.iter().enumerate() {
        cluster.add_node(gpu_node(node, 8, NODE_LABELS));
        let ip = format!("10.0.0.{}", i + 10);
        cluster.add_pod(agent_pod(pod, NAMESPACE, node, Some(&ip), true, AGENT_LABELS));
    }
    cluster.set_exec_handler(agent_reply);
    cluster
}

fn agent_reply(_ns: &str, pod: &str, stdin: &[u8]) -> Result<ExecOutput, ExecError> {
    if pod.contains(BROKEN) {
        return Err(ExecError::Unavailable(format!("pod {} refused exec", pod)));
    }

    let request: Request = serde_json::from_slice(stdin)
        .map_err(|e| ExecError::Stream(format!("bad request: {}", e)))?;
    let params = request.params.clone().unwrap_or(Value::Null);
    let tool = params["name"].as_str().unwrap_or_default().to_string();

    let payload = json!({
        "pod": pod,
        "tool": tool,
        "arguments": params["arguments"],
        "gpus": [{ "index": 0, "name": "NVIDIA H100 80GB HBM3", "temperature_c": 41 }],
    });
    let response = Response::success(request.id.unwrap_or(Value::Null), tool_result(&payload));

    Ok(ExecOutput {
        stdout: format!("{}\n", serde_json::to_string(&response).unwrap()).into_bytes(),
        stderr: Vec::new(),
        success: Some(true),
    })
}

pub fn config() -> Config {
    Config {
        namespace: NAMESPACE.to_string(),
        transport: TransportKind::Exec,
        ..Config::default()
    }
}

pub fn gateway(cluster: &InMemoryCluster) -> Gateway {
    Gateway::new(config(), Arc::new(cluster.clone())).unwrap()
}

/// Drives one session against a dispatcher
pub struct Client {
    pub gateway: Gateway,
    pub session: Session,
    next_id: u64,
}

impl Client {
    pub fn new(gateway: Gateway) -> Self {
        Self {
            gateway,
            session: Session::new(),
            next_id: 1,
        }
    }

    pub async fn initialized(gateway: Gateway) -> Self {
        let mut client = Self::new(gateway);
        client
            .request("initialize", Some(json!({
                "protocolVersion": orb8_rpc::MCP_PROTOCOL_VERSION,
                "clientInfo": { "name": "integration", "version": "0" },
            })))
            .await
            .into_result()
            .unwrap();
        client
    }

    pub async fn raw(&mut self, body: &[u8]) -> Option<Response> {
        self.gateway
            .dispatcher
            .handle_raw(&mut self.session, body, &CancellationToken::new())
            .await
    }

    pub async fn request(&mut self, method: &str, params: Option<Value>) -> Response {
        let id = self.next_id;
        self.next_id += 1;
        let request = Request::new(id, method, params);
        let body = serde_json::to_vec(&request).unwrap();
        self.raw(&body).await.expect("requests with an id are answered")
    }

    pub async fn call(&mut self, tool: &str, arguments: Value) -> Response {
        self.request("tools/call", Some(json!({ "name": tool, "arguments": arguments })))
            .await
    }

    /// Successful tool call, unwrapped to its JSON payload
    pub async fn call_ok(&mut self, tool: &str, arguments: Value) -> Value {
        let result = self.call(tool, arguments).await.into_result().unwrap();
        assert_eq!(result["isError"], false);
        assert_eq!(result["content"][0]["type"], "text");
        tool_payload(result)
    }

    /// Failed tool call, unwrapped to its error code and data
    pub async fn call_err(&mut self, tool: &str, arguments: Value) -> (i32, Value) {
        let err = self.call(tool, arguments).await.into_result().unwrap_err();
        (err.code, err.data.unwrap_or(Value::Null))
    }
}

pub fn nodes_of(payload: &Value) -> Vec<String> {
    payload["nodes"]
        .as_array()
        .unwrap()
        .iter()
        .map(|n| n["node_name"].as_str().unwrap().to_string())
        .collect()
}
