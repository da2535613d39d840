use crate::k8s::{ClusterApi, ExecError, Target};
use crate::transport::{decode_response, Transport, TransportError};
use async_trait::async_trait;
use orb8_rpc::Request;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Delivery through the API server's exec channel
///
/// For clusters where the gateway has no route to pod addresses. The agent
/// binary is started in one-shot mode inside the agent pod, reads a single
/// request line from stdin and writes its response to stdout.
pub struct ExecTransport {
    api: Arc<dyn ClusterApi>,
    command: Vec<String>,
}

impl ExecTransport {
    pub fn new(api: Arc<dyn ClusterApi>, command: Vec<String>) -> Self {
        Self { api, command }
    }
}

/// Endpoint strings for this transport are `namespace/pod`
fn split_endpoint(endpoint: &str) -> Result<(&str, &str), TransportError> {
    endpoint
        .split_once('/')
        .filter(|(ns, pod)| !ns.is_empty() && !pod.is_empty())
        .ok_or_else(|| TransportError::Unreachable(format!("bad exec endpoint {:?}", endpoint)))
}

#[async_trait]
impl Transport for ExecTransport {
    fn name(&self) -> &'static str {
        "exec"
    }

    fn endpoint(&self, target: &Target) -> Option<String> {
        if target.namespace.is_empty() || target.pod_name.is_empty() {
            return None;
        }
        Some(format!("{}/{}", target.namespace, target.pod_name))
    }

    async fn send(
        &self,
        endpoint: &str,
        request: &Request,
        deadline: Duration,
    ) -> Result<Value, TransportError> {
        let (namespace, pod) = split_endpoint(endpoint)?;

        let mut stdin = serde_json::to_vec(request)
            .map_err(|e| TransportError::Malformed(format!("encoding request: {}", e)))?;
        stdin.push(b'\n');

        debug!("exec {:?} in {} (deadline {:?})", self.command, endpoint, deadline);

        let output = tokio::time::timeout(
            deadline,
            self.api.exec(namespace, pod, &self.command, stdin),
        )
        .await
        .map_err(|_| TransportError::Timeout(deadline))?
        .map_err(|e| match e {
            ExecError::Unavailable(msg) | ExecError::Stream(msg) => {
                TransportError::Unreachable(msg)
            }
        })?;

        match decode_response(&output.stdout, request) {
            Ok(value) => Ok(value),
            Err(TransportError::Malformed(detail)) if output.success == Some(false) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                Err(TransportError::Malformed(format!(
                    "agent exited with failure ({}): {}",
                    detail,
                    stderr.trim()
                )))
            }
            Err(e) => Err(e),
        }
    }
}
