use k8s_openapi::api::core::v1::{Node, Pod};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Extended resources that mark a node as GPU-capable
pub const GPU_RESOURCES: &[&str] = &["nvidia.com/gpu", "amd.com/gpu"];

const GPU_PRODUCT_LABEL: &str = "nvidia.com/gpu.product";

/// One queryable node agent, as seen in a single directory snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub node_name: String,
    pub pod_name: String,
    pub pod_ip: Option<String>,
    pub ready: bool,
    pub namespace: String,
    pub service_name: String,
}

impl Target {
    pub fn from_k8s_pod(pod: &Pod, service_name: &str) -> Self {
        let metadata = &pod.metadata;
        let spec = pod.spec.as_ref();
        let status = pod.status.as_ref();

        let running = status
            .and_then(|s| s.phase.as_deref())
            .map(|phase| phase == "Running")
            .unwrap_or(false);

        let ready_condition = status
            .and_then(|s| s.conditions.as_ref())
            .map(|conditions| {
                conditions
                    .iter()
                    .any(|c| c.type_ == "Ready" && c.status == "True")
            })
            .unwrap_or(false);

        Self {
            node_name: spec.and_then(|s| s.node_name.clone()).unwrap_or_default(),
            pod_name: metadata.name.clone().unwrap_or_default(),
            pod_ip: status
                .and_then(|s| s.pod_ip.clone())
                .filter(|ip| !ip.is_empty()),
            ready: running && ready_condition,
            namespace: metadata.namespace.clone().unwrap_or_default(),
            service_name: service_name.to_string(),
        }
    }

    /// Breaker key; node name when scheduled, pod name otherwise
    pub fn key(&self) -> &str {
        if self.node_name.is_empty() {
            &self.pod_name
        } else {
            &self.node_name
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub name: String,
    pub ready: bool,
    pub unschedulable: bool,
    pub kernel_version: String,
    pub gpu_product: Option<String>,
    pub gpu_capacity: Option<String>,
    pub gpu_allocatable: Option<String>,
}

impl NodeInfo {
    pub fn from_k8s_node(node: &Node) -> Self {
        let status = node.status.as_ref();

        let ready = status
            .and_then(|s| s.conditions.as_ref())
            .map(|conditions| {
                conditions
                    .iter()
                    .any(|c| c.type_ == "Ready" && c.status == "True")
            })
            .unwrap_or(false);

        Self {
            name: node.metadata.name.clone().unwrap_or_default(),
            ready,
            unschedulable: node
                .spec
                .as_ref()
                .and_then(|s| s.unschedulable)
                .unwrap_or(false),
            kernel_version: status
                .and_then(|s| s.node_info.as_ref())
                .map(|i| i.kernel_version.clone())
                .unwrap_or_default(),
            gpu_product: node
                .metadata
                .labels
                .as_ref()
                .and_then(|l| l.get(GPU_PRODUCT_LABEL).cloned()),
            gpu_capacity: gpu_quantity(status.and_then(|s| s.capacity.as_ref())),
            gpu_allocatable: gpu_quantity(status.and_then(|s| s.allocatable.as_ref())),
        }
    }
}

fn gpu_quantity(resources: Option<&BTreeMap<String, Quantity>>) -> Option<String> {
    resources.and_then(|r| {
        GPU_RESOURCES
            .iter()
            .find_map(|name| r.get(*name).map(|q| q.0.clone()))
    })
}
