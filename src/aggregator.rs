//! Fan-out of one tool call across the agent fleet
//!
//! One directory snapshot per call. Every ready target whose circuit admits
//! it gets its own worker task; workers report back over a channel and the
//! collector stops at the aggregate deadline or on caller cancellation,
//! marking whatever is still outstanding as timed out. Successes are merged
//! in directory order regardless of completion order.

use crate::breaker::{BreakerRegistry, Permit};
use crate::config::Timeouts;
use crate::k8s::{ClusterDirectory, DirectoryError, Target};
use crate::metrics::GatewayMetrics;
use crate::transport::{Transport, TransportError};
use orb8_rpc::{tool_payload, tool_result_is_error, Request, RpcError};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureTag {
    Timeout,
    ConnectionRefused,
    ProtocolError,
    CircuitOpen,
    Unresolvable,
    NoTargets,
}

impl FailureTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureTag::Timeout => "timeout",
            FailureTag::ConnectionRefused => "connection_refused",
            FailureTag::ProtocolError => "protocol_error",
            FailureTag::CircuitOpen => "circuit_open",
            FailureTag::Unresolvable => "unresolvable",
            FailureTag::NoTargets => "no_targets",
        }
    }
}

impl From<&TransportError> for FailureTag {
    fn from(e: &TransportError) -> Self {
        match e {
            TransportError::Timeout(_) => FailureTag::Timeout,
            TransportError::Unreachable(_) => FailureTag::ConnectionRefused,
            TransportError::Malformed(_) | TransportError::Remote(_) => FailureTag::ProtocolError,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TargetSuccess {
    pub node_name: String,
    pub pod_name: String,
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TargetFailure {
    pub node_name: String,
    pub pod_name: String,
    pub reason: FailureTag,
    pub message: String,
}

impl TargetFailure {
    fn new(target: &Target, reason: FailureTag, message: impl Into<String>) -> Self {
        Self {
            node_name: target.node_name.clone(),
            pod_name: target.pod_name.clone(),
            reason,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AggregateResult {
    pub tool: String,
    /// Agent pods in the snapshot
    pub total: usize,
    /// Ready agent pods in the snapshot
    pub ready: usize,
    /// Targets actually sent a request
    pub dispatched: usize,
    pub successes: Vec<TargetSuccess>,
    pub failures: Vec<TargetFailure>,
}

impl AggregateResult {
    /// No target answered and at least one failed
    pub fn is_failure(&self) -> bool {
        self.successes.is_empty() && !self.failures.is_empty()
    }

    fn summary(&self) -> Value {
        json!({
            "total_agents": self.total,
            "ready_agents": self.ready,
            "attempted": self.ready,
            "dispatched": self.dispatched,
            "succeeded": self.successes.len(),
            "failed": self.failures.len(),
        })
    }

    /// The merged payload returned to the caller on success
    pub fn to_payload(&self) -> Value {
        let status = if self.failures.is_empty() {
            "success"
        } else {
            "partial"
        };

        json!({
            "status": status,
            "tool": self.tool,
            "summary": self.summary(),
            "nodes": self.successes,
            "failures": self.failures,
        })
    }

    /// The error returned when no target succeeded
    pub fn to_error(&self) -> RpcError {
        RpcError::new(
            orb8_rpc::codes::AGGREGATE_FAILURE,
            format!(
                "{}: no agent succeeded ({} of {} ready agents failed)",
                self.tool,
                self.failures.len(),
                self.ready
            ),
        )
        .with_data(json!({
            "tool": self.tool,
            "summary": self.summary(),
            "failures": self.failures,
        }))
    }
}

/// A tool call to forward to agents
#[derive(Debug, Clone, PartialEq)]
pub struct FanOutRequest {
    /// Tool name on the agent side
    pub tool: String,
    pub arguments: Value,
    /// Restrict the fan-out to the agent on this node
    pub node_name: Option<String>,
    /// Caller's per-call timeout override in seconds
    pub timeout_seconds: Option<f64>,
}

impl FanOutRequest {
    pub fn new(tool: impl Into<String>, arguments: Value) -> Self {
        Self {
            tool: tool.into(),
            arguments,
            node_name: None,
            timeout_seconds: None,
        }
    }
}

enum Slot {
    Pending,
    Done(Result<Value, TransportError>),
    Skipped(TargetFailure),
}

pub struct Aggregator {
    directory: ClusterDirectory,
    transport: Arc<dyn Transport>,
    breakers: Arc<BreakerRegistry>,
    timeouts: Timeouts,
    metrics: Option<GatewayMetrics>,
    next_id: AtomicU64,
}

impl Aggregator {
    pub fn new(
        directory: ClusterDirectory,
        transport: Arc<dyn Transport>,
        breakers: Arc<BreakerRegistry>,
        timeouts: Timeouts,
    ) -> Self {
        Self {
            directory,
            transport,
            breakers,
            timeouts,
            metrics: None,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn with_metrics(mut self, metrics: GatewayMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn directory(&self) -> &ClusterDirectory {
        &self.directory
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    pub fn transport_name(&self) -> &'static str {
        self.transport.name()
    }

    /// Where the transport would send a request for `target`
    pub fn endpoint(&self, target: &Target) -> Option<String> {
        self.transport.endpoint(target)
    }

    fn count(&self, outcome: &str) {
        if let Some(m) = &self.metrics {
            m.dispatch_total.with_label_values(&[outcome]).inc();
        }
    }

    async fn snapshot(&self, request: &FanOutRequest) -> Result<Vec<Target>, DirectoryError> {
        match request.node_name.as_deref() {
            Some(node) => Ok(vec![self.directory.get_target(node).await?]),
            None => self.directory.snapshot().await,
        }
    }

    /// Dispatch `request` to every eligible agent and merge the answers
    ///
    /// Discovery failures are returned as errors. Per-target failures are
    /// recorded in the result, never raised.
    pub async fn aggregate(
        &self,
        request: &FanOutRequest,
        cancel: &CancellationToken,
    ) -> Result<AggregateResult, DirectoryError> {
        let started = Instant::now();
        let deadline = started + self.timeouts.aggregate;
        let per_call = self.timeouts.per_call(request.timeout_seconds);

        let targets = self.snapshot(request).await?;
        let total = targets.len();
        let ready: Vec<Target> = targets.into_iter().filter(|t| t.ready).collect();

        let mut result = AggregateResult {
            tool: request.tool.clone(),
            total,
            ready: ready.len(),
            ..Default::default()
        };

        if ready.is_empty() {
            warn!("{}: no ready agents among {} discovered", request.tool, total);
            self.count(FailureTag::NoTargets.as_str());
            result.failures.push(TargetFailure {
                node_name: request.node_name.clone().unwrap_or_default(),
                pod_name: String::new(),
                reason: FailureTag::NoTargets,
                message: format!("no ready agents ({} discovered)", total),
            });
            return Ok(result);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let rpc = Arc::new(Request::tool_call(
            id,
            &request.tool,
            request.arguments.clone(),
        ));

        let token = cancel.child_token();
        let (tx, mut rx) = mpsc::channel::<(usize, Result<Value, TransportError>)>(ready.len());
        let mut workers = JoinSet::new();
        let mut slots: Vec<Slot> = Vec::with_capacity(ready.len());
        let mut pending: HashSet<usize> = HashSet::new();
        let mut permits: HashMap<usize, Permit> = HashMap::new();

        for (idx, target) in ready.iter().enumerate() {
            let Some(endpoint) = self.transport.endpoint(target) else {
                slots.push(Slot::Skipped(TargetFailure::new(
                    target,
                    FailureTag::Unresolvable,
                    format!("no {} endpoint for agent", self.transport.name()),
                )));
                continue;
            };

            match self.breakers.try_acquire(target.key()) {
                Ok(permit) => {
                    if permit.is_probe() {
                        debug!("{}: half-open probe to {}", request.tool, target.key());
                    }
                    permits.insert(idx, permit);
                }
                Err(rejected) => {
                    slots.push(Slot::Skipped(TargetFailure::new(
                        target,
                        FailureTag::CircuitOpen,
                        format!(
                            "circuit open after {} consecutive failures",
                            rejected.consecutive_failures
                        ),
                    )));
                    continue;
                }
            }

            slots.push(Slot::Pending);
            pending.insert(idx);

            let transport = Arc::clone(&self.transport);
            let rpc = Arc::clone(&rpc);
            let tx = tx.clone();
            let token = token.clone();
            workers.spawn(async move {
                let outcome = tokio::select! {
                    biased;
                    _ = token.cancelled() => return,
                    outcome = transport.send(&endpoint, &rpc, per_call) => outcome,
                };
                let _ = tx.send((idx, outcome)).await;
            });
        }
        drop(tx);

        result.dispatched = pending.len();

        while !pending.is_empty() {
            tokio::select! {
                received = rx.recv() => match received {
                    Some((idx, outcome)) => {
                        pending.remove(&idx);
                        slots[idx] = Slot::Done(outcome);
                    }
                    None => break,
                },
                _ = tokio::time::sleep_until(deadline) => {
                    warn!(
                        "{}: aggregate deadline {:?} reached with {} agents outstanding",
                        request.tool, self.timeouts.aggregate, pending.len()
                    );
                    break;
                }
                _ = cancel.cancelled() => {
                    info!("{}: caller cancelled with {} agents outstanding", request.tool, pending.len());
                    break;
                }
            }
        }

        // Workers exit silently once the caller cancels, so the channel may
        // close before the cancellation branch is observed.
        let caller_cancelled = cancel.is_cancelled();
        token.cancel();
        workers.abort_all();

        for (idx, target) in ready.iter().enumerate() {
            let key = target.key();
            let permit = permits.get(&idx).copied();
            match std::mem::replace(&mut slots[idx], Slot::Pending) {
                Slot::Skipped(failure) => {
                    self.count(failure.reason.as_str());
                    result.failures.push(failure);
                }
                Slot::Pending if pending.contains(&idx) => {
                    if let Some(permit) = &permit {
                        if caller_cancelled {
                            self.breakers.release(key, permit);
                        } else {
                            self.breakers.record_failure(key, permit);
                        }
                    }
                    self.count(FailureTag::Timeout.as_str());
                    result.failures.push(TargetFailure::new(
                        target,
                        FailureTag::Timeout,
                        if caller_cancelled {
                            "cancelled by caller".to_string()
                        } else {
                            format!("aggregate deadline of {:?} exceeded", self.timeouts.aggregate)
                        },
                    ));
                }
                Slot::Pending => {}
                Slot::Done(outcome) => {
                    let outcome = outcome.and_then(|value| {
                        if tool_result_is_error(&value) {
                            Err(TransportError::Remote(RpcError::new(
                                orb8_rpc::codes::TARGET_FAILURE,
                                tool_payload(value).to_string(),
                            )))
                        } else {
                            Ok(tool_payload(value))
                        }
                    });

                    match outcome {
                        Ok(data) => {
                            if let Some(permit) = &permit {
                                self.breakers.record_success(key, permit);
                            }
                            self.count("ok");
                            result.successes.push(TargetSuccess {
                                node_name: target.node_name.clone(),
                                pod_name: target.pod_name.clone(),
                                data,
                            });
                        }
                        Err(e) => {
                            match (&permit, e.counts_against_breaker()) {
                                (Some(permit), true) => self.breakers.record_failure(key, permit),
                                (Some(permit), false) => self.breakers.record_success(key, permit),
                                (None, _) => {}
                            }
                            let tag = FailureTag::from(&e);
                            self.count(tag.as_str());
                            debug!("{}: {} failed: {}", request.tool, key, e);
                            result
                                .failures
                                .push(TargetFailure::new(target, tag, e.to_string()));
                        }
                    }
                }
            }
        }

        let elapsed = started.elapsed();
        if let Some(m) = &self.metrics {
            m.aggregate_duration_seconds
                .with_label_values(&[request.tool.as_str()])
                .observe(elapsed.as_secs_f64());
        }

        info!(
            "{}: {}/{} agents succeeded in {:?} ({} probes)",
            request.tool,
            result.successes.len(),
            result.ready,
            elapsed,
            permits.values().filter(|p| p.is_probe()).count()
        );

        Ok(result)
    }
}
