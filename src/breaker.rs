//! Per-target circuit breakers
//!
//! ```text
//! Closed   -> Open      consecutive failures reach the threshold
//! Open     -> HalfOpen  first dispatch attempt after the cooldown (one probe)
//! HalfOpen -> Closed    probe succeeds, counter reset
//! HalfOpen -> Open      probe fails, cooldown restarts
//! ```
//!
//! Each target has its own lock so outcome recording for unrelated targets
//! never contends. Every transition bumps the circuit's generation; outcomes
//! carried by a [`Permit`] from an older generation are ignored.

use crate::config::BreakerConfig;
use crate::metrics::GatewayMetrics;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitStatus {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitStatus::Closed => "closed",
            CircuitStatus::Open => "open",
            CircuitStatus::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug)]
struct CircuitState {
    status: CircuitStatus,
    consecutive_failures: u32,
    last_transition: Instant,
    probe_in_flight: bool,
    generation: u64,
}

impl CircuitState {
    fn new() -> Self {
        Self {
            status: CircuitStatus::Closed,
            consecutive_failures: 0,
            last_transition: Instant::now(),
            probe_in_flight: false,
            generation: 0,
        }
    }
}

/// Admission granted by [`BreakerRegistry::try_acquire`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Circuit closed, normal dispatch
    Allowed,
    /// Cooldown elapsed; this dispatch is the single half-open probe
    Probe,
}

/// Proof of admission, handed back with the dispatch outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Permit {
    pub admission: Admission,
    generation: u64,
}

impl Permit {
    pub fn is_probe(&self) -> bool {
        self.admission == Admission::Probe
    }
}

/// Dispatch vetoed by an open circuit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rejected {
    pub consecutive_failures: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub target: String,
    pub status: CircuitStatus,
    pub consecutive_failures: u32,
    pub seconds_in_state: f64,
}

pub struct BreakerRegistry {
    cells: DashMap<String, Arc<Mutex<CircuitState>>>,
    config: BreakerConfig,
    metrics: Option<GatewayMetrics>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            cells: DashMap::new(),
            config,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: GatewayMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> BreakerConfig {
        self.config
    }

    fn cell(&self, key: &str) -> Arc<Mutex<CircuitState>> {
        if let Some(cell) = self.cells.get(key) {
            return cell.clone();
        }
        self.cells
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(CircuitState::new())))
            .clone()
    }

    fn lock(cell: &Mutex<CircuitState>) -> MutexGuard<'_, CircuitState> {
        cell.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn transition(&self, key: &str, state: &mut CircuitState, to: CircuitStatus) {
        if state.status == to {
            return;
        }
        info!(
            "circuit {}: {} -> {} after {} consecutive failures",
            key,
            state.status.as_str(),
            to.as_str(),
            state.consecutive_failures
        );
        state.status = to;
        state.last_transition = Instant::now();
        state.generation += 1;
        if let Some(m) = &self.metrics {
            m.circuit_transitions_total
                .with_label_values(&[to.as_str()])
                .inc();
        }
    }

    /// Ask whether `key` may be dispatched to right now
    ///
    /// A granted [`Permit`] must be followed by exactly one
    /// `record_success`, `record_failure` or `release` for the same key.
    pub fn try_acquire(&self, key: &str) -> Result<Permit, Rejected> {
        let cell = self.cell(key);
        let mut state = Self::lock(&cell);

        let admission = match state.status {
            CircuitStatus::Closed => Ok(Admission::Allowed),
            CircuitStatus::Open => {
                if state.last_transition.elapsed() >= self.config.cooldown {
                    self.transition(key, &mut state, CircuitStatus::HalfOpen);
                    state.probe_in_flight = true;
                    Ok(Admission::Probe)
                } else {
                    Err(Rejected {
                        consecutive_failures: state.consecutive_failures,
                    })
                }
            }
            CircuitStatus::HalfOpen => {
                if state.probe_in_flight {
                    Err(Rejected {
                        consecutive_failures: state.consecutive_failures,
                    })
                } else {
                    state.probe_in_flight = true;
                    Ok(Admission::Probe)
                }
            }
        };

        if admission.is_err() {
            if let Some(m) = &self.metrics {
                m.circuit_rejections_total.inc();
            }
        }

        admission.map(|admission| Permit {
            admission,
            generation: state.generation,
        })
    }

    /// Lock `key` for an outcome, or `None` if `permit` predates the last
    /// transition
    fn current<'a>(
        cell: &'a Mutex<CircuitState>,
        key: &str,
        permit: &Permit,
    ) -> Option<MutexGuard<'a, CircuitState>> {
        let state = Self::lock(cell);
        if state.generation != permit.generation {
            debug!(
                "circuit {}: ignoring outcome from generation {} (now {})",
                key, permit.generation, state.generation
            );
            return None;
        }
        Some(state)
    }

    pub fn record_success(&self, key: &str, permit: &Permit) {
        let cell = self.cell(key);
        let Some(mut state) = Self::current(&cell, key, permit) else {
            return;
        };

        match state.status {
            CircuitStatus::Closed => {
                state.consecutive_failures = 0;
            }
            CircuitStatus::HalfOpen => {
                state.consecutive_failures = 0;
                state.probe_in_flight = false;
                self.transition(key, &mut state, CircuitStatus::Closed);
            }
            CircuitStatus::Open => {}
        }
    }

    pub fn record_failure(&self, key: &str, permit: &Permit) {
        let cell = self.cell(key);
        let Some(mut state) = Self::current(&cell, key, permit) else {
            return;
        };

        state.consecutive_failures = state.consecutive_failures.saturating_add(1);

        match state.status {
            CircuitStatus::Closed => {
                if state.consecutive_failures >= self.config.failure_threshold {
                    warn!(
                        "circuit {} opening for {:?}",
                        key, self.config.cooldown
                    );
                    self.transition(key, &mut state, CircuitStatus::Open);
                }
            }
            CircuitStatus::HalfOpen => {
                state.probe_in_flight = false;
                self.transition(key, &mut state, CircuitStatus::Open);
            }
            CircuitStatus::Open => {}
        }
    }

    /// Give back an admission without recording an outcome
    ///
    /// Used when the caller abandoned the dispatch; a pending half-open probe
    /// slot is freed so the next attempt can probe.
    pub fn release(&self, key: &str, permit: &Permit) {
        let cell = self.cell(key);
        let Some(mut state) = Self::current(&cell, key, permit) else {
            return;
        };
        if permit.is_probe() {
            state.probe_in_flight = false;
        }
    }

    pub fn status(&self, key: &str) -> CircuitStatus {
        self.cells
            .get(key)
            .map(|cell| {
                let state = Self::lock(&cell);
                state.status
            })
            .unwrap_or(CircuitStatus::Closed)
    }

    pub fn consecutive_failures(&self, key: &str) -> u32 {
        self.cells
            .get(key)
            .map(|cell| {
                let state = Self::lock(&cell);
                state.consecutive_failures
            })
            .unwrap_or(0)
    }

    /// All known circuits, sorted by target
    pub fn snapshot(&self) -> Vec<CircuitSnapshot> {
        let mut circuits: Vec<CircuitSnapshot> = self
            .cells
            .iter()
            .map(|entry| {
                let state = Self::lock(entry.value());
                CircuitSnapshot {
                    target: entry.key().clone(),
                    status: state.status,
                    consecutive_failures: state.consecutive_failures,
                    seconds_in_state: state.last_transition.elapsed().as_secs_f64(),
                }
            })
            .collect();

        circuits.sort_by(|a, b| a.target.cmp(&b.target));
        circuits
    }
}
