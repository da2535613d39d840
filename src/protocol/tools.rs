//! Static tool registry and handlers
//!
//! Fan-out tools forward the call to every agent (or one, with `node_name`)
//! through the [`Aggregator`]. The rest are answered by the gateway itself.

use crate::aggregator::{AggregateResult, Aggregator, FanOutRequest, TargetFailure};
use crate::config::Config;
use crate::k8s::DirectoryError;
use orb8_rpc::{codes, RpcError};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolKind {
    ListNodes,
    FanOut,
    DescribeNode,
    GatewayStatus,
}

#[derive(Debug, Clone, Copy)]
pub struct ToolSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub kind: ToolKind,
    /// Accepts the `since_minutes` window forwarded to agents
    pub windowed: bool,
}

impl ToolSpec {
    pub fn input_schema(&self) -> Value {
        let mut properties = Map::new();

        match self.kind {
            ToolKind::FanOut => {
                properties.insert(
                    "node_name".to_string(),
                    json!({
                        "type": "string",
                        "description": "Only query the agent on this node",
                    }),
                );
                properties.insert("timeout_seconds".to_string(), timeout_schema());
            }
            ToolKind::DescribeNode => {
                properties.insert(
                    "node_name".to_string(),
                    json!({ "type": "string", "description": "Node to describe" }),
                );
                properties.insert("timeout_seconds".to_string(), timeout_schema());
            }
            ToolKind::ListNodes | ToolKind::GatewayStatus => {}
        }

        if self.windowed {
            properties.insert(
                "since_minutes".to_string(),
                json!({
                    "type": "integer",
                    "minimum": 1,
                    "description": "Only consider events from the last N minutes",
                }),
            );
        }

        let required: Vec<&str> = match self.kind {
            ToolKind::DescribeNode => vec!["node_name"],
            _ => vec![],
        };

        json!({
            "type": "object",
            "properties": properties,
            "required": required,
            "additionalProperties": false,
        })
    }

    pub fn descriptor(&self) -> Value {
        json!({
            "name": self.name,
            "description": self.description,
            "inputSchema": self.input_schema(),
        })
    }
}

fn timeout_schema() -> Value {
    json!({
        "type": "number",
        "minimum": crate::config::MIN_TIMEOUT.as_secs(),
        "maximum": crate::config::MAX_TIMEOUT.as_secs(),
        "description": "Per-agent timeout in seconds",
    })
}

pub const TOOLS: &[ToolSpec] = &[
    ToolSpec {
        name: "list_gpu_nodes",
        description: "List GPU nodes in the cluster and whether a diagnostics agent is ready on each",
        kind: ToolKind::ListNodes,
        windowed: false,
    },
    ToolSpec {
        name: "get_gpu_inventory",
        description: "Collect GPU inventory (model, memory, driver, UUIDs) from every node agent",
        kind: ToolKind::FanOut,
        windowed: false,
    },
    ToolSpec {
        name: "get_gpu_health",
        description: "Collect GPU health (temperature, power, ECC, throttling) from every node agent",
        kind: ToolKind::FanOut,
        windowed: false,
    },
    ToolSpec {
        name: "analyze_xid_errors",
        description: "Collect and classify NVIDIA XID errors reported by every node agent",
        kind: ToolKind::FanOut,
        windowed: true,
    },
    ToolSpec {
        name: "describe_gpu_node",
        description: "Describe one node: Kubernetes GPU capacity plus the agent's inventory",
        kind: ToolKind::DescribeNode,
        windowed: false,
    },
    ToolSpec {
        name: "get_gateway_status",
        description: "Report gateway configuration and per-node circuit breaker state",
        kind: ToolKind::GatewayStatus,
        windowed: false,
    },
];

pub fn find(name: &str) -> Option<&'static ToolSpec> {
    TOOLS.iter().find(|t| t.name == name)
}

#[derive(Error, Debug)]
pub enum ToolError {
    #[error("Unknown tool: {0}")]
    NotFound(String),

    #[error("Invalid arguments for {tool}: {message}")]
    InvalidArguments { tool: String, message: String },

    #[error("No agent succeeded for {}", .0.tool)]
    Aggregate(AggregateResult),

    #[error("Agent on node {node} failed")]
    Target {
        node: String,
        failure: Option<TargetFailure>,
    },

    #[error("{0}")]
    Discovery(#[from] DirectoryError),
}

impl ToolError {
    pub fn to_rpc(&self) -> RpcError {
        match self {
            ToolError::NotFound(_) => RpcError::new(codes::TOOL_NOT_FOUND, self.to_string()),
            ToolError::InvalidArguments { .. } => {
                RpcError::new(codes::TOOL_INVALID_ARGUMENTS, self.to_string())
            }
            ToolError::Aggregate(result) => result.to_error(),
            ToolError::Target { failure, .. } => {
                let error = RpcError::new(codes::TARGET_FAILURE, self.to_string());
                match failure {
                    Some(f) => error.with_data(json!({ "failure": f })),
                    None => error,
                }
            }
            ToolError::Discovery(e) if e.is_not_found() => {
                RpcError::new(codes::TARGET_FAILURE, self.to_string())
            }
            ToolError::Discovery(_) => RpcError::internal(self),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct CallArgs {
    node_name: Option<String>,
    timeout_seconds: Option<f64>,
    since_minutes: Option<u32>,
}

impl CallArgs {
    fn parse(spec: &ToolSpec, arguments: Value) -> Result<Self, ToolError> {
        let invalid = |message: String| ToolError::InvalidArguments {
            tool: spec.name.to_string(),
            message,
        };

        let args: CallArgs = match arguments {
            Value::Null => CallArgs::default(),
            Value::Object(map) => {
                if matches!(spec.kind, ToolKind::ListNodes | ToolKind::GatewayStatus)
                    && !map.is_empty()
                {
                    return Err(invalid("this tool takes no arguments".to_string()));
                }
                serde_json::from_value(Value::Object(map)).map_err(|e| invalid(e.to_string()))?
            }
            other => return Err(invalid(format!("expected an object, got {}", other))),
        };

        if args.node_name.as_deref().map(str::trim) == Some("") {
            return Err(invalid("node_name must not be empty".to_string()));
        }
        if spec.kind == ToolKind::DescribeNode && args.node_name.is_none() {
            return Err(invalid("node_name is required".to_string()));
        }
        if args.since_minutes.is_some() && !spec.windowed {
            return Err(invalid("since_minutes is not supported".to_string()));
        }
        if args.since_minutes == Some(0) {
            return Err(invalid("since_minutes must be at least 1".to_string()));
        }

        Ok(args)
    }

    /// Arguments forwarded to the agents
    fn forwarded(&self) -> Value {
        match self.since_minutes {
            Some(minutes) => json!({ "since_minutes": minutes }),
            None => json!({}),
        }
    }
}

pub struct ToolRegistry {
    aggregator: Arc<Aggregator>,
    config: Arc<Config>,
}

impl ToolRegistry {
    pub fn new(aggregator: Arc<Aggregator>, config: Arc<Config>) -> Self {
        Self { aggregator, config }
    }

    pub fn list(&self) -> Vec<Value> {
        TOOLS.iter().map(ToolSpec::descriptor).collect()
    }

    /// Run tool `name` and return its JSON payload
    pub async fn call(
        &self,
        name: &str,
        arguments: Value,
        cancel: &CancellationToken,
    ) -> Result<Value, ToolError> {
        let spec = find(name).ok_or_else(|| ToolError::NotFound(name.to_string()))?;
        let args = CallArgs::parse(spec, arguments)?;

        debug!("tools/call {} {:?}", spec.name, args);

        match spec.kind {
            ToolKind::ListNodes => self.list_gpu_nodes().await,
            ToolKind::FanOut => {
                let request = FanOutRequest {
                    tool: spec.name.to_string(),
                    arguments: args.forwarded(),
                    node_name: args.node_name.clone(),
                    timeout_seconds: args.timeout_seconds,
                };
                let result = self.aggregator.aggregate(&request, cancel).await?;
                if result.is_failure() {
                    return Err(ToolError::Aggregate(result));
                }
                Ok(result.to_payload())
            }
            ToolKind::DescribeNode => {
                let node = args.node_name.clone().unwrap_or_default();
                self.describe_gpu_node(&node, args.timeout_seconds, cancel)
                    .await
            }
            ToolKind::GatewayStatus => Ok(self.gateway_status()),
        }
    }

    async fn list_gpu_nodes(&self) -> Result<Value, ToolError> {
        let directory = self.aggregator.directory();
        let nodes = directory.list_nodes(&self.config.node_selector()).await?;
        let agents = directory.snapshot().await?;

        let entries: Vec<Value> = nodes
            .iter()
            .map(|node| {
                let agent = agents
                    .iter()
                    .find(|a| a.ready && a.node_name == node.name)
                    .or_else(|| agents.iter().find(|a| a.node_name == node.name));
                json!({
                    "node": node,
                    "agent": agent.map(|a| json!({
                        "pod_name": a.pod_name,
                        "pod_ip": a.pod_ip,
                        "ready": a.ready,
                    })),
                })
            })
            .collect();

        let with_ready_agent = agents.iter().filter(|a| a.ready).count();

        Ok(json!({
            "summary": {
                "gpu_nodes": nodes.len(),
                "agents": agents.len(),
                "ready_agents": with_ready_agent,
            },
            "nodes": entries,
        }))
    }

    async fn describe_gpu_node(
        &self,
        node_name: &str,
        timeout_seconds: Option<f64>,
        cancel: &CancellationToken,
    ) -> Result<Value, ToolError> {
        let node = self.aggregator.directory().get_node(node_name).await?;

        let request = FanOutRequest {
            tool: "get_gpu_inventory".to_string(),
            arguments: json!({}),
            node_name: Some(node_name.to_string()),
            timeout_seconds,
        };

        let result = self.aggregator.aggregate(&request, cancel).await?;
        match result.successes.into_iter().next() {
            Some(success) => Ok(json!({
                "node": node,
                "agent": {
                    "pod_name": success.pod_name,
                    "inventory": success.data,
                },
            })),
            None => Err(ToolError::Target {
                node: node_name.to_string(),
                failure: result.failures.into_iter().next(),
            }),
        }
    }

    fn gateway_status(&self) -> Value {
        json!({
            "version": crate::VERSION,
            "transport": self.aggregator.transport_name(),
            "config": {
                "namespace": self.config.namespace,
                "service_name": self.config.service_name,
                "agent_selector": self.config.agent_selector(),
                "endpoint_strategy": self.config.endpoint_strategy,
                "timeouts": self.config.timeouts,
                "breaker": self.config.breaker,
            },
            "circuits": self.aggregator.breakers().snapshot(),
        })
    }
}
