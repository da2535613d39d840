//! Process-wide gateway configuration
//!
//! Loaded once from the environment before any dispatch begins and shared
//! read-only (`Arc<Config>`) afterwards. Invalid values never abort startup:
//! each knob falls back to its default and the rejection is logged.

use crate::{GatewayError, Result};
use clap::ValueEnum;
use serde::Serialize;
use std::time::Duration;
use tracing::warn;

pub const ENV_EXEC_TIMEOUT: &str = "ORB8_EXEC_TIMEOUT";
pub const ENV_AGGREGATE_TIMEOUT: &str = "ORB8_AGGREGATE_TIMEOUT";
pub const ENV_NAMESPACE: &str = "ORB8_NAMESPACE";
pub const ENV_SERVICE_NAME: &str = "ORB8_SERVICE_NAME";
pub const ENV_AGENT_PORT: &str = "ORB8_AGENT_PORT";
pub const ENV_AGENT_LABELS: &str = "ORB8_AGENT_LABELS";
pub const ENV_NODE_LABELS: &str = "ORB8_NODE_LABELS";
pub const ENV_TRANSPORT: &str = "ORB8_TRANSPORT";
pub const ENV_ENDPOINT_STRATEGY: &str = "ORB8_ENDPOINT_STRATEGY";
pub const ENV_BREAKER_THRESHOLD: &str = "ORB8_BREAKER_THRESHOLD";
pub const ENV_BREAKER_COOLDOWN: &str = "ORB8_BREAKER_COOLDOWN";

pub const DEFAULT_NAMESPACE: &str = "gpu-diagnostics";
pub const DEFAULT_SERVICE_NAME: &str = "gpu-agent";
pub const DEFAULT_AGENT_PORT: u16 = 8080;
pub const DEFAULT_AGENT_LABELS: &str = "app.kubernetes.io/name=gpu-agent";
pub const DEFAULT_NODE_LABELS: &str = "nvidia.com/gpu.present=true";
pub const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_AGGREGATE_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_BREAKER_THRESHOLD: u32 = 3;
pub const DEFAULT_BREAKER_COOLDOWN: Duration = Duration::from_secs(30);

pub const MIN_TIMEOUT: Duration = Duration::from_secs(1);
pub const MAX_TIMEOUT: Duration = Duration::from_secs(300);

/// Command run inside the agent pod by the exec transport
pub const DEFAULT_AGENT_COMMAND: &[&str] = &["/usr/local/bin/gpu-agent", "--oneshot"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    /// POST to the agent's HTTP endpoint
    Http,
    /// Pipe the request through the Kubernetes exec channel
    Exec,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum EndpointStrategy {
    /// `pod.service.namespace.svc.cluster.local:port`
    Dns,
    /// `pod_ip:port`
    PodIp,
}

/// Per-call and aggregate deadlines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Timeouts {
    #[serde(with = "secs")]
    pub per_call: Duration,
    #[serde(with = "secs")]
    pub aggregate: Duration,
}

impl Timeouts {
    /// Per-call deadline for one request, honoring a caller override when
    /// it falls inside `[MIN_TIMEOUT, MAX_TIMEOUT]`
    pub fn per_call(&self, override_secs: Option<f64>) -> Duration {
        let Some(secs) = override_secs else {
            return self.per_call;
        };

        match Duration::try_from_secs_f64(secs) {
            Ok(d) if in_bounds(d) => d,
            _ => {
                warn!(
                    "Rejected per-call timeout override of {}s (allowed {:?}..={:?}); using {:?}",
                    secs, MIN_TIMEOUT, MAX_TIMEOUT, self.per_call
                );
                self.per_call
            }
        }
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            per_call: DEFAULT_EXEC_TIMEOUT,
            aggregate: DEFAULT_AGGREGATE_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    #[serde(with = "secs")]
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_BREAKER_THRESHOLD,
            cooldown: DEFAULT_BREAKER_COOLDOWN,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Config {
    pub namespace: String,
    pub service_name: String,
    pub agent_port: u16,
    pub agent_labels: Vec<(String, String)>,
    pub node_labels: Vec<(String, String)>,
    pub agent_command: Vec<String>,
    pub transport: TransportKind,
    pub endpoint_strategy: EndpointStrategy,
    pub timeouts: Timeouts,
    pub breaker: BreakerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            agent_port: DEFAULT_AGENT_PORT,
            agent_labels: parse_labels(DEFAULT_AGENT_LABELS).unwrap_or_default(),
            node_labels: parse_labels(DEFAULT_NODE_LABELS).unwrap_or_default(),
            agent_command: DEFAULT_AGENT_COMMAND.iter().map(|s| s.to_string()).collect(),
            transport: TransportKind::Http,
            endpoint_strategy: EndpointStrategy::Dns,
            timeouts: Timeouts::default(),
            breaker: BreakerConfig::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let agent_port = match non_empty(ENV_AGENT_PORT) {
            Some(raw) => match raw.trim().parse::<u16>() {
                Ok(port) if port > 0 => port,
                _ => {
                    warn!(
                        "Invalid {}={:?}; using {}",
                        ENV_AGENT_PORT, raw, defaults.agent_port
                    );
                    defaults.agent_port
                }
            },
            None => defaults.agent_port,
        };

        let labels = |key: &str, fallback: Vec<(String, String)>| match non_empty(key) {
            Some(raw) => parse_labels(&raw).unwrap_or_else(|| {
                warn!("Invalid label selector {}={:?}; using default", key, raw);
                fallback
            }),
            None => fallback,
        };

        let transport = match non_empty(ENV_TRANSPORT) {
            Some(raw) => TransportKind::from_str(raw.trim(), true).unwrap_or_else(|_| {
                warn!("Invalid {}={:?}; using http", ENV_TRANSPORT, raw);
                defaults.transport
            }),
            None => defaults.transport,
        };

        let endpoint_strategy = match non_empty(ENV_ENDPOINT_STRATEGY) {
            Some(raw) => EndpointStrategy::from_str(raw.trim(), true).unwrap_or_else(|_| {
                warn!("Invalid {}={:?}; using dns", ENV_ENDPOINT_STRATEGY, raw);
                defaults.endpoint_strategy
            }),
            None => defaults.endpoint_strategy,
        };

        let failure_threshold = match non_empty(ENV_BREAKER_THRESHOLD) {
            Some(raw) => match raw.trim().parse::<u32>() {
                Ok(n) if n > 0 => n,
                _ => {
                    warn!(
                        "Invalid {}={:?}; using {}",
                        ENV_BREAKER_THRESHOLD, raw, DEFAULT_BREAKER_THRESHOLD
                    );
                    DEFAULT_BREAKER_THRESHOLD
                }
            },
            None => DEFAULT_BREAKER_THRESHOLD,
        };

        Self {
            namespace: non_empty(ENV_NAMESPACE).unwrap_or(defaults.namespace),
            service_name: non_empty(ENV_SERVICE_NAME).unwrap_or(defaults.service_name),
            agent_port,
            agent_labels: labels(ENV_AGENT_LABELS, defaults.agent_labels),
            node_labels: labels(ENV_NODE_LABELS, defaults.node_labels),
            agent_command: defaults.agent_command,
            transport,
            endpoint_strategy,
            timeouts: Timeouts {
                per_call: parse_timeout(
                    ENV_EXEC_TIMEOUT,
                    lookup(ENV_EXEC_TIMEOUT).as_deref(),
                    DEFAULT_EXEC_TIMEOUT,
                ),
                aggregate: parse_timeout(
                    ENV_AGGREGATE_TIMEOUT,
                    lookup(ENV_AGGREGATE_TIMEOUT).as_deref(),
                    DEFAULT_AGGREGATE_TIMEOUT,
                ),
            },
            breaker: BreakerConfig {
                failure_threshold,
                cooldown: parse_timeout(
                    ENV_BREAKER_COOLDOWN,
                    lookup(ENV_BREAKER_COOLDOWN).as_deref(),
                    DEFAULT_BREAKER_COOLDOWN,
                ),
            },
        }
    }

    /// Reject settings the gateway cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.agent_labels.is_empty() {
            return Err(GatewayError::ConfigError(
                "agent label selector must not be empty".to_string(),
            ));
        }
        if self.transport == TransportKind::Exec && self.agent_command.is_empty() {
            return Err(GatewayError::ConfigError(
                "exec transport needs an agent command".to_string(),
            ));
        }
        Ok(())
    }

    /// Agent label selector in `k=v,k2=v2` form
    pub fn agent_selector(&self) -> String {
        crate::k8s::label_selector(&self.agent_labels)
    }

    pub fn node_selector(&self) -> String {
        crate::k8s::label_selector(&self.node_labels)
    }
}

fn in_bounds(d: Duration) -> bool {
    d >= MIN_TIMEOUT && d <= MAX_TIMEOUT
}

/// Parse a bounded timeout setting
///
/// Returns `default` when the value is absent, malformed, or outside
/// `[MIN_TIMEOUT, MAX_TIMEOUT]`. Rejections are logged.
pub fn parse_timeout(name: &str, raw: Option<&str>, default: Duration) -> Duration {
    let Some(raw) = raw.map(str::trim).filter(|r| !r.is_empty()) else {
        return default;
    };

    match parse_duration(raw) {
        Some(d) if in_bounds(d) => d,
        Some(d) => {
            warn!(
                "{}={:?} ({:?}) is outside {:?}..={:?}; using {:?}",
                name, raw, d, MIN_TIMEOUT, MAX_TIMEOUT, default
            );
            default
        }
        None => {
            warn!("{}={:?} is not a valid duration; using {:?}", name, raw, default);
            default
        }
    }
}

/// Parse `500ms`, `30s`, `5m`, `1h`, or a bare number of seconds
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    let (num, unit_ms) = if let Some(n) = s.strip_suffix("ms") {
        (n, 1u64)
    } else if let Some(n) = s.strip_suffix('s') {
        (n, 1000u64)
    } else if let Some(n) = s.strip_suffix('m') {
        (n, 60_000u64)
    } else if let Some(n) = s.strip_suffix('h') {
        (n, 3_600_000u64)
    } else {
        (s, 1000u64)
    };

    let value: u64 = num.trim().parse().ok()?;
    value.checked_mul(unit_ms).map(Duration::from_millis)
}

/// Parse `k=v,k2=v2`; `None` if any clause is not an equality
pub fn parse_labels(raw: &str) -> Option<Vec<(String, String)>> {
    raw.split(',')
        .map(str::trim)
        .filter(|clause| !clause.is_empty())
        .map(|clause| {
            let (k, v) = clause.split_once('=')?;
            let (k, v) = (k.trim(), v.trim());
            if k.is_empty() || k.contains('!') {
                return None;
            }
            Some((k.to_string(), v.to_string()))
        })
        .collect::<Option<Vec<_>>>()
        .filter(|labels| !labels.is_empty())
}

mod secs {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_parse_timeout_in_range_round_trips() {
        for secs in [1u64, 2, 30, 59, 120, 299, 300] {
            let raw = format!("{}s", secs);
            assert_eq!(
                parse_timeout("T", Some(&raw), DEFAULT_EXEC_TIMEOUT),
                Duration::from_secs(secs)
            );
            let bare = secs.to_string();
            assert_eq!(
                parse_timeout("T", Some(&bare), DEFAULT_EXEC_TIMEOUT),
                Duration::from_secs(secs)
            );
        }
        assert_eq!(
            parse_timeout("T", Some("5m"), DEFAULT_EXEC_TIMEOUT),
            Duration::from_secs(300)
        );
        assert_eq!(
            parse_timeout("T", Some("1500ms"), DEFAULT_EXEC_TIMEOUT),
            Duration::from_millis(1500)
        );
    }

    #[test]
    fn test_parse_timeout_rejects_degenerate_values() {
        let default = Duration::from_secs(17);
        for raw in ["0", "0s", "-5", "301", "301s", "1h", "999ms", "abc", "10x", ""] {
            assert_eq!(parse_timeout("T", Some(raw), default), default, "{}", raw);
        }
        assert_eq!(parse_timeout("T", None, default), default);
        assert_eq!(
            parse_timeout("T", Some("99999999999999999999h"), default),
            default
        );
    }

    #[test]
    fn test_per_call_override_bounds() {
        let t = Timeouts::default();
        assert_eq!(t.per_call(None), DEFAULT_EXEC_TIMEOUT);
        assert_eq!(t.per_call(Some(5.0)), Duration::from_secs(5));
        assert_eq!(t.per_call(Some(0.0)), DEFAULT_EXEC_TIMEOUT);
        assert_eq!(t.per_call(Some(-1.0)), DEFAULT_EXEC_TIMEOUT);
        assert_eq!(t.per_call(Some(10_000.0)), DEFAULT_EXEC_TIMEOUT);
        assert_eq!(t.per_call(Some(f64::NAN)), DEFAULT_EXEC_TIMEOUT);
    }

    #[test]
    fn test_from_lookup_defaults() {
        let cfg = Config::from_lookup(|_| None);
        assert_eq!(cfg.namespace, DEFAULT_NAMESPACE);
        assert_eq!(cfg.service_name, DEFAULT_SERVICE_NAME);
        assert_eq!(cfg.agent_port, DEFAULT_AGENT_PORT);
        assert_eq!(cfg.transport, TransportKind::Http);
        assert_eq!(cfg.agent_selector(), DEFAULT_AGENT_LABELS);
    }

    #[test]
    fn test_from_lookup_overrides_and_fallbacks() {
        let cfg = Config::from_lookup(lookup(&[
            (ENV_NAMESPACE, "gpu"),
            (ENV_SERVICE_NAME, "agents"),
            (ENV_AGENT_PORT, "not-a-port"),
            (ENV_AGENT_LABELS, "app=agent, tier=gpu"),
            (ENV_TRANSPORT, "exec"),
            (ENV_ENDPOINT_STRATEGY, "pod-ip"),
            (ENV_EXEC_TIMEOUT, "0"),
            (ENV_BREAKER_THRESHOLD, "5"),
        ]));

        assert_eq!(cfg.namespace, "gpu");
        assert_eq!(cfg.service_name, "agents");
        assert_eq!(cfg.agent_port, DEFAULT_AGENT_PORT);
        assert_eq!(cfg.agent_selector(), "app=agent,tier=gpu");
        assert_eq!(cfg.transport, TransportKind::Exec);
        assert_eq!(cfg.endpoint_strategy, EndpointStrategy::PodIp);
        assert_eq!(cfg.timeouts.per_call, DEFAULT_EXEC_TIMEOUT);
        assert_eq!(cfg.breaker.failure_threshold, 5);
    }

    #[test]
    fn test_parse_labels() {
        assert_eq!(
            parse_labels("a=b,c=d"),
            Some(vec![
                ("a".to_string(), "b".to_string()),
                ("c".to_string(), "d".to_string())
            ])
        );
        assert_eq!(parse_labels("a"), None);
        assert_eq!(parse_labels("a!=b"), None);
        assert_eq!(parse_labels(""), None);
    }

    #[test]
    fn test_validate() {
        assert!(Config::default().validate().is_ok());

        let no_labels = Config {
            agent_labels: Vec::new(),
            ..Config::default()
        };
        assert!(matches!(no_labels.validate(), Err(GatewayError::ConfigError(_))));

        let no_command = Config {
            transport: TransportKind::Exec,
            agent_command: Vec::new(),
            ..Config::default()
        };
        assert!(no_command.validate().is_err());
    }
}
