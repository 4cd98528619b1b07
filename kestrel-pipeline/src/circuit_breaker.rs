//! Circuit breaker over inference failures

use crate::config::CircuitBreakerConfig;
use kestrel_core::RejectReason;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation
    Closed,
    /// Failing, reject new work
    Open,
    /// Retry timeout elapsed, one trial allowed
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
    next_retry: Option<Instant>,
    trial_in_flight: bool,
    config: CircuitBreakerConfig,
}

impl BreakerState {
    fn close(&mut self) {
        self.state = CircuitState::Closed;
        self.failure_count = 0;
        self.next_retry = None;
        self.trial_in_flight = false;
    }

    fn open(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.next_retry = Some(now + self.config.retry_timeout);
        self.trial_in_flight = false;
    }
}

/// Point-in-time view for status reporting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub max_failures: u32,
    pub retry_timeout_ms: u64,
    /// Time left before a trial is allowed, when open
    pub retry_in_ms: Option<u64>,
    /// Time since the most recent counted failure
    pub since_last_failure_ms: Option<u64>,
}

/// Closed -> Open after `max_failures` counted failures; Open -> HalfOpen
/// on the first attempt after the retry timeout; HalfOpen -> Closed on a
/// successful trial, back to Open on a failed one.
#[derive(Debug)]
pub struct CircuitBreaker {
    inner: RwLock<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            inner: RwLock::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure: None,
                next_retry: None,
                trial_in_flight: false,
                config,
            }),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.read().state
    }

    pub fn failure_count(&self) -> u32 {
        self.inner.read().failure_count
    }

    /// Admission check. A successful call in `HalfOpen` claims the single
    /// trial slot; the caller must report the outcome with
    /// [`record_success`](Self::record_success),
    /// [`record_failure`](Self::record_failure) or
    /// [`abandon_trial`](Self::abandon_trial).
    pub fn try_acquire(&self) -> Result<(), RejectReason> {
        let mut inner = self.inner.write();
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let now = Instant::now();
                match inner.next_retry {
                    Some(retry_at) if now < retry_at => Err(RejectReason::CircuitOpen),
                    _ => {
                        inner.state = CircuitState::HalfOpen;
                        inner.trial_in_flight = true;
                        info!("Circuit breaker half-open, allowing trial request");
                        Ok(())
                    }
                }
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    Err(RejectReason::CircuitOpen)
                } else {
                    inner.trial_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.write();
        if inner.state == CircuitState::HalfOpen {
            inner.close();
            info!("Circuit breaker closed after successful trial");
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.write();
        let now = Instant::now();
        inner.failure_count = inner.failure_count.saturating_add(1);
        inner.last_failure = Some(now);

        match inner.state {
            CircuitState::Closed => {
                if inner.failure_count >= inner.config.max_failures {
                    inner.open(now);
                    warn!(
                        "Circuit breaker opened after {} failures (retry in {:?})",
                        inner.failure_count, inner.config.retry_timeout
                    );
                }
            }
            CircuitState::HalfOpen => {
                inner.open(now);
                warn!("Circuit breaker trial failed, re-opened");
            }
            // late completion of work admitted before the circuit opened
            CircuitState::Open => {}
        }
    }

    /// Release a half-open trial whose outcome says nothing about the
    /// engine (cancelled or rejected before inference ran).
    pub fn abandon_trial(&self) {
        let mut inner = self.inner.write();
        if inner.state == CircuitState::HalfOpen {
            inner.trial_in_flight = false;
        }
    }

    /// Operator reset: close the circuit and clear counters.
    pub fn reset(&self) {
        let mut inner = self.inner.write();
        inner.close();
        inner.last_failure = None;
        info!("Circuit breaker reset");
    }

    /// Apply new thresholds. The current state is kept; a pending retry
    /// deadline is not moved.
    pub fn set_config(&self, config: CircuitBreakerConfig) {
        let mut inner = self.inner.write();
        info!(
            "Circuit breaker settings: max_failures={}, retry_timeout={:?}",
            config.max_failures, config.retry_timeout
        );
        inner.config = config;
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let inner = self.inner.read();
        let now = Instant::now();
        CircuitBreakerSnapshot {
            state: inner.state,
            failure_count: inner.failure_count,
            max_failures: inner.config.max_failures,
            retry_timeout_ms: inner.config.retry_timeout.as_millis() as u64,
            retry_in_ms: match inner.state {
                CircuitState::Open => inner
                    .next_retry
                    .map(|at| at.saturating_duration_since(now).as_millis() as u64),
                _ => None,
            },
            since_last_failure_ms: inner
                .last_failure
                .map(|at| now.saturating_duration_since(at).as_millis() as u64),
        }
    }
}
