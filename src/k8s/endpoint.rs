//! Address resolution for agent targets
//!
//! Two sibling strategies: the pod IP, or the stable per-pod DNS name behind
//! the agents' headless service. Each returns `None` when the target lacks the
//! fields it needs; the transport in use decides which one applies.

use crate::k8s::Target;

const CLUSTER_DOMAIN: &str = "svc.cluster.local";

/// `pod_ip:port`, bracketing IPv6 literals
pub fn resolve_direct(target: &Target, port: u16) -> Option<String> {
    let ip = target.pod_ip.as_deref().map(str::trim).filter(|ip| !ip.is_empty())?;

    if ip.contains(':') {
        Some(format!("[{}]:{}", ip, port))
    } else {
        Some(format!("{}:{}", ip, port))
    }
}

/// `pod.service.namespace.svc.cluster.local:port`
pub fn resolve_dns(target: &Target, port: u16) -> Option<String> {
    if target.namespace.is_empty() || target.service_name.is_empty() || target.pod_name.is_empty()
    {
        return None;
    }

    Some(format!(
        "{}.{}.{}.{}:{}",
        target.pod_name, target.service_name, target.namespace, CLUSTER_DOMAIN, port
    ))
}
