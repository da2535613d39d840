pub mod client;
pub mod directory;
pub mod endpoint;
pub mod fake;
pub mod types;

pub use client::{ClusterApi, ExecError, ExecOutput, K8sClient};
pub use directory::ClusterDirectory;
pub use endpoint::{resolve_direct, resolve_dns};
pub use fake::InMemoryCluster;
pub use types::{NodeInfo, Target};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DirectoryError {
    #[error("Kubernetes API error: {0}")]
    Api(#[from] kube::Error),

    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },
}

impl DirectoryError {
    pub fn is_not_found(&self) -> bool {
        match self {
            DirectoryError::NotFound { .. } => true,
            DirectoryError::Api(kube::Error::Api(resp)) => resp.code == 404,
            _ => false,
        }
    }
}

/// AND together equality requirements: `a=1,b=2`
pub fn label_selector<K, V>(labels: &[(K, V)]) -> String
where
    K: AsRef<str>,
    V: AsRef<str>,
{
    labels
        .iter()
        .map(|(k, v)| format!("{}={}", k.as_ref(), v.as_ref()))
        .collect::<Vec<_>>()
        .join(",")
}

/// Field selector matching pods scheduled on `node_name`
pub fn node_field_selector(node_name: &str) -> String {
    format!("spec.nodeName={}", node_name)
}
