//! Circuit breaker gating new dispatch during sustained failure.

use std::sync::Mutex;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::BreakerConfig;

/// Breaker state. Transitions only along
/// closed -> open -> half-open -> {closed | open}.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    half_open_successes: u32,
    times_opened: u64,
}

/// Snapshot for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub times_opened: u64,
}

/// Three-state failure gate consulted before every dispatch.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                last_failure: None,
                half_open_successes: 0,
                times_opened: 0,
            }),
        }
    }

    /// Returns `true` when dispatch must be rejected. An open breaker whose
    /// recovery timeout has elapsed moves to half-open and lets the probe
    /// through.
    pub fn check(&self) -> bool {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => false,
            CircuitState::Open => {
                let quiet = inner
                    .last_failure
                    .map(|at| at.elapsed() > self.config.recovery_timeout)
                    .unwrap_or(true);
                if quiet {
                    inner.state = CircuitState::HalfOpen;
                    inner.half_open_successes = 0;
                    info!("circuit half-open, probing for recovery");
                    false
                } else {
                    true
                }
            }
        }
    }

    /// Feeds one successful flow outcome.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        match inner.state {
            CircuitState::Closed => inner.consecutive_failures = 0,
            CircuitState::HalfOpen => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.half_open_max_attempts {
                    inner.state = CircuitState::Closed;
                    inner.consecutive_failures = 0;
                    info!("circuit closed after successful probes");
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Feeds one failed flow outcome.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        inner.last_failure = Some(Instant::now());
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.times_opened += 1;
                    warn!(
                        consecutive_failures = inner.consecutive_failures,
                        "circuit opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.times_opened += 1;
                warn!("circuit re-opened, probe failed");
            }
            CircuitState::Open => {}
        }
    }

    /// Current state.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().expect("breaker lock poisoned").state
    }

    /// Snapshot for the final report.
    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock().expect("breaker lock poisoned");
        BreakerSnapshot { state: inner.state, times_opened: inner.times_opened }
    }
}
