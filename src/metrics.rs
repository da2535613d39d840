//! Prometheus metrics for the gateway
//!
//! Owned by the gateway (not the global default registry) so each test can
//! build an isolated instance.

use crate::Result;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};

#[derive(Clone)]
pub struct GatewayMetrics {
    registry: Registry,
    pub requests_total: IntCounterVec,
    pub dispatch_total: IntCounterVec,
    pub circuit_transitions_total: IntCounterVec,
    pub circuit_rejections_total: IntCounter,
    pub aggregate_duration_seconds: HistogramVec,
}

impl GatewayMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new_custom(Some("orb8_gateway".to_string()), None)?;

        let requests_total = IntCounterVec::new(
            Opts::new("requests_total", "JSON-RPC requests by method and outcome"),
            &["method", "outcome"],
        )?;
        let dispatch_total = IntCounterVec::new(
            Opts::new("dispatch_total", "Per-target dispatch outcomes by tag"),
            &["outcome"],
        )?;
        let circuit_transitions_total = IntCounterVec::new(
            Opts::new(
                "circuit_transitions_total",
                "Circuit breaker transitions by destination state",
            ),
            &["to"],
        )?;
        let circuit_rejections_total = IntCounter::new(
            "circuit_rejections_total",
            "Dispatches vetoed by an open circuit",
        )?;
        let aggregate_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "aggregate_duration_seconds",
                "Wall time of fan-out aggregations by tool",
            )
            .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]),
            &["tool"],
        )?;

        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(dispatch_total.clone()))?;
        registry.register(Box::new(circuit_transitions_total.clone()))?;
        registry.register(Box::new(circuit_rejections_total.clone()))?;
        registry.register(Box::new(aggregate_duration_seconds.clone()))?;

        #[cfg(target_os = "linux")]
        registry.register(Box::new(
            prometheus::process_collector::ProcessCollector::for_self(),
        ))?;

        Ok(Self {
            registry,
            requests_total,
            dispatch_total,
            circuit_transitions_total,
            circuit_rejections_total,
            aggregate_duration_seconds,
        })
    }

    /// Text exposition format for `/metrics`
    pub fn render(&self) -> Result<String> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        String::from_utf8(buf).map_err(|e| crate::GatewayError::MetricsError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_counters() {
        let metrics = GatewayMetrics::new().unwrap();
        metrics
            .requests_total
            .with_label_values(&["tools/call", "ok"])
            .inc();
        metrics.circuit_rejections_total.inc();
        metrics
            .circuit_transitions_total
            .with_label_values(&["open"])
            .inc();

        let text = metrics.render().unwrap();
        assert!(text.contains("orb8_gateway_requests_total{method=\"tools/call\",outcome=\"ok\"} 1"));
        assert!(text.contains("orb8_gateway_circuit_rejections_total 1"));
        assert!(text.contains("orb8_gateway_circuit_transitions_total{to=\"open\"} 1"));
    }
}
