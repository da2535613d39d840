//! Point-in-time view of which nodes run a GPU agent
//!
//! Every call goes to the API; there is no cache. Errors from the API are
//! returned as-is and never retried here.

use crate::k8s::client::ClusterApi;
use crate::k8s::{node_field_selector, DirectoryError, NodeInfo, Target};
use std::sync::Arc;
use tracing::debug;

#[derive(Clone)]
pub struct ClusterDirectory {
    api: Arc<dyn ClusterApi>,
    namespace: String,
    service_name: String,
    agent_selector: String,
}

impl ClusterDirectory {
    pub fn new(
        api: Arc<dyn ClusterApi>,
        namespace: impl Into<String>,
        service_name: impl Into<String>,
        agent_selector: impl Into<String>,
    ) -> Self {
        Self {
            api,
            namespace: namespace.into(),
            service_name: service_name.into(),
            agent_selector: agent_selector.into(),
        }
    }

    /// Agent pods matching the selectors, ordered by node then pod name
    pub async fn list_targets(
        &self,
        label_selector: &str,
        field_selector: Option<&str>,
    ) -> Result<Vec<Target>, DirectoryError> {
        let pods = self
            .api
            .list_pods(&self.namespace, label_selector, field_selector)
            .await?;

        let mut targets: Vec<Target> = pods
            .iter()
            .map(|pod| Target::from_k8s_pod(pod, &self.service_name))
            .collect();

        targets.sort_by(|a, b| {
            a.node_name
                .cmp(&b.node_name)
                .then_with(|| a.pod_name.cmp(&b.pod_name))
        });

        debug!(
            "Directory snapshot: {} agents ({} ready) for selector {:?}",
            targets.len(),
            targets.iter().filter(|t| t.ready).count(),
            label_selector
        );

        Ok(targets)
    }

    /// All agent pods under the configured agent selector
    pub async fn snapshot(&self) -> Result<Vec<Target>, DirectoryError> {
        self.list_targets(&self.agent_selector, None).await
    }

    /// The ready agent on `node_name`
    pub async fn get_target(&self, node_name: &str) -> Result<Target, DirectoryError> {
        let fields = node_field_selector(node_name);

        self.list_targets(&self.agent_selector, Some(&fields))
            .await?
            .into_iter()
            .find(|t| t.ready && t.node_name == node_name)
            .ok_or_else(|| DirectoryError::NotFound {
                kind: "ready agent on node",
                name: node_name.to_string(),
            })
    }

    pub async fn list_nodes(&self, label_selector: &str) -> Result<Vec<NodeInfo>, DirectoryError> {
        let mut nodes: Vec<NodeInfo> = self
            .api
            .list_nodes(label_selector)
            .await?
            .iter()
            .map(NodeInfo::from_k8s_node)
            .collect();

        nodes.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(nodes)
    }

    pub async fn get_node(&self, name: &str) -> Result<NodeInfo, DirectoryError> {
        let node = self.api.get_node(name).await?;
        Ok(NodeInfo::from_k8s_node(&node))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::k8s::fake::{agent_pod, gpu_node, InMemoryCluster};

    const LABELS: &[(&str, &str)] = &[("app", "gpu-agent")];

    fn directory(cluster: &InMemoryCluster) -> ClusterDirectory {
        ClusterDirectory::new(Arc::new(cluster.clone()), "gpu", "gpu-agent", "app=gpu-agent")
    }

    #[tokio::test]
    async fn test_snapshot_is_sorted_and_carries_service() {
        let cluster = InMemoryCluster::new();
        cluster.add_pod(agent_pod("agent-z", "gpu", "node-b", Some("10.0.0.2"), true, LABELS));
        cluster.add_pod(agent_pod("agent-y", "gpu", "node-a", Some("10.0.0.1"), false, LABELS));

        let targets = directory(&cluster).snapshot().await.unwrap();

        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].node_name, "node-a");
        assert!(!targets[0].ready);
        assert_eq!(targets[1].node_name, "node-b");
        assert!(targets[1].ready);
        assert_eq!(targets[1].service_name, "gpu-agent");
        assert_eq!(targets[1].namespace, "gpu");
    }

    #[tokio::test]
    async fn test_get_target_uses_field_selector() {
        let cluster = InMemoryCluster::new();
        cluster.add_pod(agent_pod("agent-a", "gpu", "node-a", Some("10.0.0.1"), true, LABELS));
        cluster.add_pod(agent_pod("agent-b", "gpu", "node-b", Some("10.0.0.2"), true, LABELS));

        let target = directory(&cluster).get_target("node-b").await.unwrap();

        assert_eq!(target.pod_name, "agent-b");
        assert_eq!(cluster.field_selected_calls(), 1);
    }

    #[tokio::test]
    async fn test_get_target_not_ready_is_not_found() {
        let cluster = InMemoryCluster::new();
        cluster.add_pod(agent_pod("agent-a", "gpu", "node-a", None, false, LABELS));

        let err = directory(&cluster).get_target("node-a").await.unwrap_err();
        assert!(err.is_not_found());

        let err = directory(&cluster).get_target("missing").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_each_snapshot_reads_current_pods() {
        let cluster = InMemoryCluster::new();
        cluster.add_pod(agent_pod("agent-a", "gpu", "node-a", Some("10.0.0.1"), true, LABELS));
        cluster.add_pod(agent_pod("agent-b", "gpu", "node-b", Some("10.0.0.2"), true, LABELS));
        let dir = directory(&cluster);

        assert_eq!(dir.snapshot().await.unwrap().len(), 2);

        cluster.remove_pod("agent-a");
        let targets = dir.snapshot().await.unwrap();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].pod_name, "agent-b");
        assert!(dir.get_target("node-a").await.unwrap_err().is_not_found());
        assert_eq!(cluster.list_calls(), 3);
    }

    #[tokio::test]
    async fn test_api_errors_surface_unmodified() {
        let cluster = InMemoryCluster::new();
        cluster.fail_api(Some("connection refused"));

        let err = directory(&cluster).snapshot().await.unwrap_err();
        assert!(matches!(err, DirectoryError::Api(_)));
        assert!(err.to_string().contains("connection refused"));
        assert_eq!(cluster.list_calls(), 1);
    }

    #[tokio::test]
    async fn test_nodes() {
        let cluster = InMemoryCluster::new();
        cluster.add_node(gpu_node("node-b", 8, &[("nvidia.com/gpu.present", "true")]));
        cluster.add_node(gpu_node("node-a", 4, &[("nvidia.com/gpu.present", "true")]));
        cluster.add_node(gpu_node("cpu-1", 0, &[]));

        let dir = directory(&cluster);
        let nodes = dir.list_nodes("nvidia.com/gpu.present=true").await.unwrap();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].name, "node-a");
        assert_eq!(nodes[0].gpu_capacity.as_deref(), Some("4"));

        let node = dir.get_node("node-b").await.unwrap();
        assert!(node.ready);
        assert!(dir.get_node("nope").await.unwrap_err().is_not_found());
    }
}
