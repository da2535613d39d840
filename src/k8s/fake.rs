//! In-memory [`ClusterApi`] for tests and local demos
//!
//! Holds pods and nodes in memory, evaluates equality label selectors and the
//! handful of field selectors the directory uses, and answers exec calls with
//! a pluggable handler.

use crate::k8s::client::{ClusterApi, ExecError, ExecOutput};
use crate::k8s::DirectoryError;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    Node, NodeCondition, NodeStatus, NodeSystemInfo, Pod, PodCondition, PodSpec, PodStatus,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::ObjectMeta;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

type ExecHandler =
    dyn Fn(&str, &str, &[u8]) -> Result<ExecOutput, ExecError> + Send + Sync + 'static;

#[derive(Clone)]
pub struct InMemoryCluster {
    pods: Arc<RwLock<Vec<Pod>>>,
    nodes: Arc<RwLock<Vec<Node>>>,
    api_error: Arc<RwLock<Option<String>>>,
    exec_handler: Arc<RwLock<Option<Arc<ExecHandler>>>>,
    exec_delay: Arc<RwLock<Option<Duration>>>,
    list_calls: Arc<AtomicU64>,
    field_selected_calls: Arc<AtomicU64>,
}

impl InMemoryCluster {
    pub fn new() -> Self {
        Self {
            pods: Arc::new(RwLock::new(Vec::new())),
            nodes: Arc::new(RwLock::new(Vec::new())),
            api_error: Arc::new(RwLock::new(None)),
            exec_handler: Arc::new(RwLock::new(None)),
            exec_delay: Arc::new(RwLock::new(None)),
            list_calls: Arc::new(AtomicU64::new(0)),
            field_selected_calls: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn add_pod(&self, pod: Pod) {
        if let Ok(mut pods) = self.pods.write() {
            pods.push(pod);
        }
    }

    pub fn add_node(&self, node: Node) {
        if let Ok(mut nodes) = self.nodes.write() {
            nodes.push(node);
        }
    }

    pub fn remove_pod(&self, name: &str) {
        if let Ok(mut pods) = self.pods.write() {
            pods.retain(|p| p.metadata.name.as_deref() != Some(name));
        }
    }

    /// Make every subsequent read fail with a 503 from the API server
    pub fn fail_api(&self, message: Option<&str>) {
        if let Ok(mut err) = self.api_error.write() {
            *err = message.map(str::to_string);
        }
    }

    pub fn set_exec_handler<F>(&self, handler: F)
    where
        F: Fn(&str, &str, &[u8]) -> Result<ExecOutput, ExecError> + Send + Sync + 'static,
    {
        if let Ok(mut slot) = self.exec_handler.write() {
            *slot = Some(Arc::new(handler));
        }
    }

    /// Hold every exec call for `delay` before the handler runs
    pub fn set_exec_delay(&self, delay: Option<Duration>) {
        if let Ok(mut slot) = self.exec_delay.write() {
            *slot = delay;
        }
    }

    /// Number of `list_pods` calls served
    pub fn list_calls(&self) -> u64 {
        self.list_calls.load(Ordering::Relaxed)
    }

    /// Number of `list_pods` calls that carried a field selector
    pub fn field_selected_calls(&self) -> u64 {
        self.field_selected_calls.load(Ordering::Relaxed)
    }

    fn check_api(&self) -> Result<(), DirectoryError> {
        let err = self.api_error.read().ok().and_then(|e| e.clone());
        match err {
            Some(message) => Err(DirectoryError::Api(kube::Error::Api(
                kube::core::ErrorResponse {
                    status: "Failure".to_string(),
                    message,
                    reason: "ServiceUnavailable".to_string(),
                    code: 503,
                },
            ))),
            None => Ok(()),
        }
    }
}

impl Default for InMemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

fn labels_match(labels: Option<&BTreeMap<String, String>>, selector: &str) -> bool {
    selector
        .split(',')
        .map(str::trim)
        .filter(|clause| !clause.is_empty())
        .all(|clause| match clause.split_once('=') {
            Some((k, v)) => labels
                .and_then(|l| l.get(k.trim()))
                .map(|actual| actual == v.trim())
                .unwrap_or(false),
            None => labels.map(|l| l.contains_key(clause)).unwrap_or(false),
        })
}

fn pod_fields_match(pod: &Pod, selector: &str) -> bool {
    selector
        .split(',')
        .map(str::trim)
        .filter(|clause| !clause.is_empty())
        .all(|clause| {
            let Some((field, value)) = clause.split_once('=') else {
                return false;
            };
            let actual = match field.trim() {
                "spec.nodeName" => pod.spec.as_ref().and_then(|s| s.node_name.as_deref()),
                "metadata.name" => pod.metadata.name.as_deref(),
                "metadata.namespace" => pod.metadata.namespace.as_deref(),
                "status.phase" => pod.status.as_ref().and_then(|s| s.phase.as_deref()),
                _ => None,
            };
            actual == Some(value.trim())
        })
}

#[async_trait]
impl ClusterApi for InMemoryCluster {
    async fn list_pods(
        &self,
        namespace: &str,
        label_selector: &str,
        field_selector: Option<&str>,
    ) -> Result<Vec<Pod>, DirectoryError> {
        self.list_calls.fetch_add(1, Ordering::Relaxed);
        if field_selector.is_some() {
            self.field_selected_calls.fetch_add(1, Ordering::Relaxed);
        }
        self.check_api()?;

        let pods = self.pods.read().map(|p| p.clone()).unwrap_or_default();

        Ok(pods
            .into_iter()
            .filter(|p| p.metadata.namespace.as_deref() == Some(namespace))
            .filter(|p| labels_match(p.metadata.labels.as_ref(), label_selector))
            .filter(|p| field_selector.map_or(true, |f| pod_fields_match(p, f)))
            .collect())
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, DirectoryError> {
        self.check_api()?;

        self.pods
            .read()
            .ok()
            .and_then(|pods| {
                pods.iter()
                    .find(|p| {
                        p.metadata.namespace.as_deref() == Some(namespace)
                            && p.metadata.name.as_deref() == Some(name)
                    })
                    .cloned()
            })
            .ok_or_else(|| DirectoryError::NotFound {
                kind: "pod",
                name: name.to_string(),
            })
    }

    async fn list_nodes(&self, label_selector: &str) -> Result<Vec<Node>, DirectoryError> {
        self.check_api()?;

        let nodes = self.nodes.read().map(|n| n.clone()).unwrap_or_default();

        Ok(nodes
            .into_iter()
            .filter(|n| labels_match(n.metadata.labels.as_ref(), label_selector))
            .collect())
    }

    async fn get_node(&self, name: &str) -> Result<Node, DirectoryError> {
        self.check_api()?;

        self.nodes
            .read()
            .ok()
            .and_then(|nodes| {
                nodes
                    .iter()
                    .find(|n| n.metadata.name.as_deref() == Some(name))
                    .cloned()
            })
            .ok_or_else(|| DirectoryError::NotFound {
                kind: "node",
                name: name.to_string(),
            })
    }

    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        _command: &[String],
        stdin: Vec<u8>,
    ) -> Result<ExecOutput, ExecError> {
        let delay = self.exec_delay.read().ok().and_then(|d| *d);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let handler = self.exec_handler.read().ok().and_then(|h| h.clone());
        match handler {
            Some(handler) => handler(namespace, pod, &stdin),
            None => Err(ExecError::Unavailable(format!(
                "no exec handler for {}/{}",
                namespace, pod
            ))),
        }
    }
}

/// A running agent pod with the given labels
pub fn agent_pod(
    name: &str,
    namespace: &str,
    node: &str,
    pod_ip: Option<&str>,
    ready: bool,
    labels: &[(&str, &str)],
) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(
                labels
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            ..Default::default()
        },
        spec: Some(PodSpec {
            node_name: Some(node.to_string()),
            ..Default::default()
        }),
        status: Some(PodStatus {
            phase: Some(if ready { "Running" } else { "Pending" }.to_string()),
            pod_ip: pod_ip.map(str::to_string),
            conditions: Some(vec![PodCondition {
                type_: "Ready".to_string(),
                status: if ready { "True" } else { "False" }.to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
    }
}

/// A ready node advertising `gpus` NVIDIA GPUs
pub fn gpu_node(name: &str, gpus: u32, labels: &[(&str, &str)]) -> Node {
    let mut capacity = BTreeMap::new();
    capacity.insert("nvidia.com/gpu".to_string(), Quantity(gpus.to_string()));

    Node {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(
                labels
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            ..Default::default()
        },
        spec: None,
        status: Some(NodeStatus {
            capacity: Some(capacity.clone()),
            allocatable: Some(capacity),
            conditions: Some(vec![NodeCondition {
                type_: "Ready".to_string(),
                status: "True".to_string(),
                ..Default::default()
            }]),
            node_info: Some(NodeSystemInfo {
                kernel_version: "6.8.0-gpu".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
    }
}
