use crate::k8s::DirectoryError;
use crate::{GatewayError, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::{AttachParams, ListParams};
use kube::{Api, Client};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info};

/// Captured output of a command executed inside a pod
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// `None` when the API reported no terminal status
    pub success: Option<bool>,
}

#[derive(Error, Debug)]
pub enum ExecError {
    #[error("exec channel unavailable: {0}")]
    Unavailable(String),

    #[error("exec stream failed: {0}")]
    Stream(String),
}

/// The narrow slice of the orchestration API the gateway depends on
///
/// Implemented by [`K8sClient`] in production and by
/// [`InMemoryCluster`](crate::k8s::InMemoryCluster) in tests.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn list_pods(
        &self,
        namespace: &str,
        label_selector: &str,
        field_selector: Option<&str>,
    ) -> std::result::Result<Vec<Pod>, DirectoryError>;

    async fn get_pod(&self, namespace: &str, name: &str)
        -> std::result::Result<Pod, DirectoryError>;

    async fn list_nodes(&self, label_selector: &str)
        -> std::result::Result<Vec<Node>, DirectoryError>;

    async fn get_node(&self, name: &str) -> std::result::Result<Node, DirectoryError>;

    /// Run `command` in the pod, feed `stdin`, and collect its output
    ///
    /// Not bounded here; callers wrap it in their own deadline.
    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        command: &[String],
        stdin: Vec<u8>,
    ) -> std::result::Result<ExecOutput, ExecError>;
}

pub struct K8sClient {
    client: Client,
}

impl K8sClient {
    pub async fn try_default() -> Result<Self> {
        debug!("Initializing Kubernetes client");

        let client = Client::try_default().await.map_err(|e| {
            GatewayError::KubernetesError(format!("Failed to create K8s client: {}", e))
        })?;

        info!("Successfully connected to Kubernetes cluster");

        Ok(Self { client })
    }

    pub fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    pub fn nodes(&self) -> Api<Node> {
        Api::all(self.client.clone())
    }
}

fn not_found_or(kind: &'static str, name: &str, e: kube::Error) -> DirectoryError {
    match &e {
        kube::Error::Api(resp) if resp.code == 404 => DirectoryError::NotFound {
            kind,
            name: name.to_string(),
        },
        _ => DirectoryError::Api(e),
    }
}

async fn drain<R: AsyncRead + Unpin>(reader: Option<R>) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    if let Some(mut r) = reader {
        r.read_to_end(&mut buf).await?;
    }
    Ok(buf)
}

#[async_trait]
impl ClusterApi for K8sClient {
    async fn list_pods(
        &self,
        namespace: &str,
        label_selector: &str,
        field_selector: Option<&str>,
    ) -> std::result::Result<Vec<Pod>, DirectoryError> {
        let mut params = ListParams::default();
        if !label_selector.is_empty() {
            params = params.labels(label_selector);
        }
        if let Some(fields) = field_selector {
            params = params.fields(fields);
        }

        let pod_list = self.pods(namespace).list(&params).await?;

        Ok(pod_list.items)
    }

    async fn get_pod(
        &self,
        namespace: &str,
        name: &str,
    ) -> std::result::Result<Pod, DirectoryError> {
        self.pods(namespace)
            .get(name)
            .await
            .map_err(|e| not_found_or("pod", name, e))
    }

    async fn list_nodes(
        &self,
        label_selector: &str,
    ) -> std::result::Result<Vec<Node>, DirectoryError> {
        let mut params = ListParams::default();
        if !label_selector.is_empty() {
            params = params.labels(label_selector);
        }

        let node_list = self.nodes().list(&params).await?;

        Ok(node_list.items)
    }

    async fn get_node(&self, name: &str) -> std::result::Result<Node, DirectoryError> {
        self.nodes()
            .get(name)
            .await
            .map_err(|e| not_found_or("node", name, e))
    }

    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        command: &[String],
        stdin: Vec<u8>,
    ) -> std::result::Result<ExecOutput, ExecError> {
        let params = AttachParams::default()
            .stdin(true)
            .stdout(true)
            .stderr(true);

        let mut process = self
            .pods(namespace)
            .exec(pod, command.to_vec(), &params)
            .await
            .map_err(|e| ExecError::Unavailable(e.to_string()))?;

        if let Some(mut writer) = process.stdin() {
            writer
                .write_all(&stdin)
                .await
                .map_err(|e| ExecError::Stream(format!("writing stdin: {}", e)))?;
            writer
                .shutdown()
                .await
                .map_err(|e| ExecError::Stream(format!("closing stdin: {}", e)))?;
        }

        let status = process.take_status();
        let stdout_reader = process.stdout();
        let stderr_reader = process.stderr();
        let (stdout, stderr) = tokio::join!(drain(stdout_reader), drain(stderr_reader));
        let stdout = stdout.map_err(|e| ExecError::Stream(format!("reading stdout: {}", e)))?;
        let stderr = stderr.map_err(|e| ExecError::Stream(format!("reading stderr: {}", e)))?;

        let success = match status {
            Some(fut) => fut
                .await
                .map(|s| s.status.as_deref() == Some("Success")),
            None => None,
        };

        process
            .join()
            .await
            .map_err(|e| ExecError::Stream(e.to_string()))?;

        debug!(
            "exec in {}/{} finished: {} stdout bytes, {} stderr bytes",
            namespace,
            pod,
            stdout.len(),
            stderr.len()
        );

        Ok(ExecOutput {
            stdout,
            stderr,
            success,
        })
    }
}
