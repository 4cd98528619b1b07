//! Periodic aggregate health

use crate::circuit_breaker::CircuitState;
use crate::config::HealthConfig;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Readings a health check is evaluated on
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HealthInputs {
    pub circuit_state: CircuitState,
    pub resources_ok: bool,
    pub queue_len: usize,
    pub queue_capacity: usize,
}

/// Outcome of one check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    /// Overall health after this check
    pub healthy: bool,
    pub circuit_ok: bool,
    pub resources_ok: bool,
    pub queue_ok: bool,
    pub consecutive_failures: u32,
}

impl HealthReport {
    /// All individual checks passed
    pub fn all_ok(&self) -> bool {
        self.circuit_ok && self.resources_ok && self.queue_ok
    }
}

#[derive(Debug)]
struct HealthState {
    config: HealthConfig,
    healthy: bool,
    consecutive_failures: u32,
    checks_run: u64,
    last_report: Option<HealthReport>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub healthy: bool,
    pub consecutive_failures: u32,
    pub max_failures: u32,
    pub checks_run: u64,
    pub last_report: Option<HealthReport>,
}

/// Flips to unhealthy after `max_failures` consecutive failed checks and
/// back to healthy on the next fully passing check.
#[derive(Debug)]
pub struct HealthChecker {
    state: RwLock<HealthState>,
}

impl HealthChecker {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            state: RwLock::new(HealthState {
                config,
                healthy: true,
                consecutive_failures: 0,
                checks_run: 0,
                last_report: None,
            }),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.state.read().healthy
    }

    pub fn evaluate(&self, inputs: HealthInputs) -> HealthReport {
        let mut state = self.state.write();

        let circuit_ok = inputs.circuit_state != CircuitState::Open;
        let occupancy = if inputs.queue_capacity == 0 {
            0.0
        } else {
            inputs.queue_len as f64 / inputs.queue_capacity as f64
        };
        let queue_ok = occupancy < state.config.queue_high_water;

        state.checks_run += 1;
        if circuit_ok && inputs.resources_ok && queue_ok {
            state.consecutive_failures = 0;
            if !state.healthy {
                info!("Pipeline healthy again");
            }
            state.healthy = true;
        } else {
            state.consecutive_failures = state.consecutive_failures.saturating_add(1);
            if state.consecutive_failures >= state.config.max_failures && state.healthy {
                warn!(
                    "Pipeline unhealthy after {} failed checks (circuit_ok={}, resources_ok={}, queue_ok={})",
                    state.consecutive_failures, circuit_ok, inputs.resources_ok, queue_ok
                );
                state.healthy = false;
            }
        }

        let report = HealthReport {
            healthy: state.healthy,
            circuit_ok,
            resources_ok: inputs.resources_ok,
            queue_ok,
            consecutive_failures: state.consecutive_failures,
        };
        state.last_report = Some(report.clone());
        report
    }

    /// Operator reset: mark healthy and clear the failure streak.
    pub fn reset(&self) {
        let mut state = self.state.write();
        state.healthy = true;
        state.consecutive_failures = 0;
        state.last_report = None;
    }

    pub fn config(&self) -> HealthConfig {
        self.state.read().config.clone()
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        let state = self.state.read();
        HealthSnapshot {
            healthy: state.healthy,
            consecutive_failures: state.consecutive_failures,
            max_failures: state.config.max_failures,
            checks_run: state.checks_run,
            last_report: state.last_report.clone(),
        }
    }
}
