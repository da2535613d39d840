use crate::config::EndpointStrategy;
use crate::k8s::{resolve_direct, resolve_dns, Target};
use crate::transport::{decode_response, Transport, TransportError};
use async_trait::async_trait;
use orb8_rpc::Request;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// Path the agents serve JSON-RPC on
pub const AGENT_RPC_PATH: &str = "/mcp";

/// Direct HTTP delivery to an agent's pod address or per-pod DNS name
pub struct HttpTransport {
    client: reqwest::Client,
    strategy: EndpointStrategy,
    port: u16,
}

impl HttpTransport {
    pub fn new(strategy: EndpointStrategy, port: u16) -> Self {
        Self {
            client: reqwest::Client::new(),
            strategy,
            port,
        }
    }
}

fn classify(e: reqwest::Error, deadline: Duration) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout(deadline)
    } else if e.is_connect() || e.is_request() {
        TransportError::Unreachable(e.to_string())
    } else {
        TransportError::Malformed(e.to_string())
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn name(&self) -> &'static str {
        "http"
    }

    fn endpoint(&self, target: &Target) -> Option<String> {
        match self.strategy {
            EndpointStrategy::Dns => resolve_dns(target, self.port),
            EndpointStrategy::PodIp => resolve_direct(target, self.port),
        }
    }

    async fn send(
        &self,
        endpoint: &str,
        request: &Request,
        deadline: Duration,
    ) -> Result<Value, TransportError> {
        let url = format!("http://{}{}", endpoint, AGENT_RPC_PATH);
        let body = serde_json::to_vec(request)
            .map_err(|e| TransportError::Malformed(format!("encoding request: {}", e)))?;

        debug!("POST {} ({} bytes, deadline {:?})", url, body.len(), deadline);

        let call = async {
            let response = self
                .client
                .post(&url)
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .header(reqwest::header::ACCEPT, "application/json")
                .body(body)
                .send()
                .await
                .map_err(|e| classify(e, deadline))?;

            let status = response.status();
            let bytes = response.bytes().await.map_err(|e| classify(e, deadline))?;

            if status.is_server_error() && bytes.is_empty() {
                return Err(TransportError::Unreachable(format!(
                    "agent returned HTTP {}",
                    status
                )));
            }
            if !status.is_success() && bytes.is_empty() {
                return Err(TransportError::Malformed(format!(
                    "agent returned HTTP {} with an empty body",
                    status
                )));
            }

            decode_response(&bytes, request)
        };

        tokio::time::timeout(deadline, call)
            .await
            .map_err(|_| TransportError::Timeout(deadline))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn target() -> Target {
        Target {
            node_name: "node-a".to_string(),
            pod_name: "agent-a".to_string(),
            pod_ip: Some("127.0.0.1".to_string()),
            ready: true,
            namespace: "gpu".to_string(),
            service_name: "gpu-agent".to_string(),
        }
    }

    /// Accept one connection and answer with `body` after `delay`
    async fn one_shot_agent(body: &'static str, delay: Duration) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            if let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = vec![0u8; 8192];
                let _ = socket.read(&mut buf).await;
                tokio::time::sleep(delay).await;
                let reply = format!(
                    "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = socket.write_all(reply.as_bytes()).await;
            }
        });

        addr
    }

    #[test]
    fn test_endpoint_strategy() {
        let dns = HttpTransport::new(EndpointStrategy::Dns, 8080);
        assert_eq!(
            dns.endpoint(&target()).as_deref(),
            Some("agent-a.gpu-agent.gpu.svc.cluster.local:8080")
        );

        let direct = HttpTransport::new(EndpointStrategy::PodIp, 8080);
        assert_eq!(direct.endpoint(&target()).as_deref(), Some("127.0.0.1:8080"));
    }

    #[tokio::test]
    async fn test_send_returns_result() {
        let addr = one_shot_agent(
            r#"{"jsonrpc":"2.0","id":1,"result":{"gpus":4}}"#,
            Duration::ZERO,
        )
        .await;
        let transport = HttpTransport::new(EndpointStrategy::PodIp, 0);
        let request = Request::tool_call(1, "get_gpu_inventory", json!({}));

        let result = transport
            .send(&addr, &request, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(result, json!({"gpus": 4}));
    }

    #[tokio::test]
    async fn test_send_times_out() {
        let addr = one_shot_agent(
            r#"{"jsonrpc":"2.0","id":1,"result":{}}"#,
            Duration::from_secs(5),
        )
        .await;
        let transport = HttpTransport::new(EndpointStrategy::PodIp, 0);
        let request = Request::tool_call(1, "get_gpu_inventory", json!({}));

        let err = transport
            .send(&addr, &request, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_send_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let transport = HttpTransport::new(EndpointStrategy::PodIp, 0);
        let request = Request::tool_call(1, "get_gpu_inventory", json!({}));

        let err = transport
            .send(&addr, &request, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Unreachable(_)), "{:?}", err);
    }

    #[tokio::test]
    async fn test_send_malformed() {
        let addr = one_shot_agent("<html>oops</html>", Duration::ZERO).await;
        let transport = HttpTransport::new(EndpointStrategy::PodIp, 0);
        let request = Request::tool_call(1, "get_gpu_inventory", json!({}));

        let err = transport
            .send(&addr, &request, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Malformed(_)));
    }
}
