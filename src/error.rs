use crate::k8s::DirectoryError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Kubernetes error: {0}")]
    KubernetesError(String),

    #[error(transparent)]
    Directory(#[from] DirectoryError),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Metrics error: {0}")]
    MetricsError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl From<prometheus::Error> for GatewayError {
    fn from(e: prometheus::Error) -> Self {
        GatewayError::MetricsError(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
