//! Circuit breaker guarding calls to the log service.
//!
//! ```text
//!            failure_threshold consecutive failures
//!   Closed ─────────────────────────────────────────▶ Open
//!     ▲                                                │
//!     │ success                     reset_timeout over │ next call
//!     │                                                ▼
//!     └──────────────────────────────────────────── HalfOpen
//!                  (any failure goes back to Open)
//! ```
//!
//! Calls made while the circuit is open fail with
//! [`FetchError::CircuitOpen`] without running the operation. Once half-open,
//! exactly one caller runs the trial; concurrent callers are rejected as if
//! the circuit were still open until the trial settles.

use std::fmt;
use std::future::Future;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::CircuitBreakerConfig;
use crate::error::{FetchError, Result};

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls pass through.
    Closed,
    /// Calls are rejected until the reset timeout passes.
    Open,
    /// One trial call decides whether to close again.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Snapshot of breaker counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitStats {
    /// Current state
    pub state: CircuitState,
    /// Consecutive failures since the last success
    pub failure_count: u32,
    /// When the most recent failure happened
    pub last_failure_time: Option<DateTime<Utc>>,
    /// When an open circuit will admit a trial call
    pub next_retry_time: Option<DateTime<Utc>>,
    /// Calls made through the breaker, including rejected ones
    pub total_requests: u64,
    /// Calls whose operation failed
    pub total_failures: u64,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    last_failure_time: Option<DateTime<Utc>>,
    next_retry_time: Option<DateTime<Utc>>,
    next_retry_at: Option<Instant>,
    trial_in_flight: bool,
    total_requests: u64,
    total_failures: u64,
}

impl BreakerState {
    const fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure_time: None,
            next_retry_time: None,
            next_retry_at: None,
            trial_in_flight: false,
            total_requests: 0,
            total_failures: 0,
        }
    }
}

/// Tracks consecutive failures and short-circuits calls while open.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    /// Creates a closed breaker, validating the configuration.
    pub fn new(config: CircuitBreakerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            state: Mutex::new(BreakerState::new()),
        })
    }

    /// Returns the current state without side effects.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.state.lock().state
    }

    /// Returns a snapshot of the counters.
    #[must_use]
    pub fn stats(&self) -> CircuitStats {
        let s = self.state.lock();
        CircuitStats {
            state: s.state,
            failure_count: s.failure_count,
            last_failure_time: s.last_failure_time,
            next_retry_time: s.next_retry_time,
            total_requests: s.total_requests,
            total_failures: s.total_failures,
        }
    }

    /// Forces the breaker closed, keeping cumulative counters.
    pub fn reset(&self) {
        let mut s = self.state.lock();
        s.state = CircuitState::Closed;
        s.failure_count = 0;
        s.next_retry_time = None;
        s.next_retry_at = None;
        s.trial_in_flight = false;
        info!("circuit breaker manually reset");
    }

    /// Runs `operation` unless the circuit is open.
    pub async fn execute<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let trial = self.admit()?;
        let mut permit = TrialPermit {
            breaker: self,
            armed: trial,
        };

        let result = operation().await;
        permit.armed = false;
        match result {
            Ok(value) => {
                self.on_success(trial);
                Ok(value)
            }
            Err(err) => {
                self.on_failure(trial);
                Err(err)
            }
        }
    }

    /// Returns whether the admitted call is the half-open trial.
    fn admit(&self) -> Result<bool> {
        let mut s = self.state.lock();
        s.total_requests += 1;

        match s.state {
            CircuitState::Closed => Ok(false),
            CircuitState::HalfOpen if s.trial_in_flight => Err(FetchError::CircuitOpen {
                next_retry_time: s.next_retry_time.unwrap_or_else(Utc::now),
            }),
            CircuitState::Open | CircuitState::HalfOpen => {
                let ready = s.next_retry_at.is_none_or(|at| Instant::now() >= at);
                if !ready {
                    return Err(FetchError::CircuitOpen {
                        next_retry_time: s.next_retry_time.unwrap_or_else(Utc::now),
                    });
                }
                s.state = CircuitState::HalfOpen;
                s.trial_in_flight = true;
                info!("circuit breaker half-open; admitting trial call");
                Ok(true)
            }
        }
    }

    fn on_success(&self, trial: bool) {
        let mut s = self.state.lock();
        match s.state {
            CircuitState::HalfOpen if trial => {
                s.state = CircuitState::Closed;
                s.trial_in_flight = false;
                s.failure_count = 0;
                s.next_retry_time = None;
                s.next_retry_at = None;
                info!("circuit breaker closed after successful trial call");
            }
            CircuitState::Closed => s.failure_count = 0,
            // A call admitted before the circuit opened does not decide recovery.
            CircuitState::Open | CircuitState::HalfOpen => {}
        }
    }

    fn on_failure(&self, trial: bool) {
        let mut s = self.state.lock();
        s.failure_count += 1;
        s.total_failures += 1;
        s.last_failure_time = Some(Utc::now());

        let should_open = match s.state {
            CircuitState::HalfOpen => trial,
            CircuitState::Closed => s.failure_count >= self.config.failure_threshold,
            CircuitState::Open => false,
        };
        if should_open {
            let reset = self.config.reset_timeout();
            s.state = CircuitState::Open;
            s.trial_in_flight = false;
            s.next_retry_at = Some(Instant::now() + reset);
            s.next_retry_time = chrono::Duration::from_std(reset)
                .ok()
                .map(|d| Utc::now() + d);
            warn!(
                failure_count = s.failure_count,
                reset_timeout_ms = self.config.reset_timeout_ms,
                "circuit breaker opened"
            );
        }
    }
}

/// Hands the half-open slot back if the trial future is dropped before it
/// settles.
struct TrialPermit<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for TrialPermit<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut s = self.breaker.state.lock();
        if s.state == CircuitState::HalfOpen && s.trial_in_flight {
            s.state = CircuitState::Open;
            s.trial_in_flight = false;
            warn!("circuit breaker trial call abandoned; circuit back to open");
        }
    }
}
