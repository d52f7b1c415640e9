//! Circuit breaker for one downstream service.
//!
//! The breaker is shared by every executor calling the same service, so all
//! state lives behind a single lock. The Open -> HalfOpen transition is
//! applied lazily on the next call (or state query) once the open timeout
//! has elapsed.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Breaker thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures in Closed that open the circuit.
    pub failure_threshold: u32,
    /// How long the circuit stays Open before allowing probes.
    #[serde(rename = "open_timeout_ms", with = "crate::config::duration_ms")]
    pub open_timeout: Duration,
    /// Probe successes in HalfOpen needed to close the circuit.
    pub half_open_required_successes: u32,
    /// Probes allowed in flight at once while HalfOpen.
    pub half_open_max_calls: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_timeout: Duration::from_secs(30),
            half_open_required_successes: 2,
            half_open_max_calls: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    last_transition_at: Instant,
    half_open_successes: u32,
    half_open_in_flight: u32,
}

impl BreakerState {
    fn transition(&mut self, service: &str, to: CircuitState) {
        let from = self.state;
        self.state = to;
        self.last_transition_at = Instant::now();
        self.half_open_successes = 0;
        self.half_open_in_flight = 0;
        if to != CircuitState::Open {
            self.consecutive_failures = 0;
        }
        match to {
            CircuitState::Open => warn!(service, %from, "circuit opened"),
            _ => info!(service, %from, %to, "circuit transition"),
        }
    }
}

/// Three-state guard around calls to one logical service.
#[derive(Debug)]
pub struct CircuitBreaker {
    service: String,
    config: BreakerConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    /// Create a new breaker in the Closed state.
    pub fn new(service: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            service: service.into(),
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                last_transition_at: Instant::now(),
                half_open_successes: 0,
                half_open_in_flight: 0,
            }),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Current state, after applying any due Open -> HalfOpen transition.
    pub async fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock().await;
        self.refresh(&mut inner);
        inner.state
    }

    pub async fn consecutive_failures(&self) -> u32 {
        self.inner.lock().await.consecutive_failures
    }

    /// Run `f` through the breaker.
    ///
    /// Only errors for which [`Error::trips_breaker`] holds count as
    /// failures; other errors pass through without touching the counters.
    ///
    /// # Errors
    /// `CircuitOpen` without invoking `f` when the circuit is Open, or when
    /// it is HalfOpen and the probe allowance is used up. Otherwise whatever
    /// `f` returns.
    pub async fn call<T, F, Fut>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.before_call().await?;
        let result = f().await;
        match &result {
            Ok(_) => self.record_success().await,
            Err(err) if err.trips_breaker() => self.record_failure().await,
            Err(_) => self.record_neutral().await,
        }
        result
    }

    async fn before_call(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        self.refresh(&mut inner);
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                debug!(service = %self.service, "rejecting call, circuit open");
                Err(self.open_error())
            }
            CircuitState::HalfOpen => {
                if inner.half_open_in_flight >= self.config.half_open_max_calls.max(1) {
                    debug!(service = %self.service, "rejecting call, half-open probe in flight");
                    return Err(self.open_error());
                }
                inner.half_open_in_flight += 1;
                Ok(())
            }
        }
    }

    /// Record a successful call.
    pub async fn record_success(&self) {
        let mut inner = self.inner.lock().await;
        match inner.state {
            CircuitState::Closed => inner.consecutive_failures = 0,
            CircuitState::HalfOpen => {
                inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.half_open_required_successes.max(1) {
                    inner.transition(&self.service, CircuitState::Closed);
                }
            }
            // Started before another caller tripped the circuit.
            CircuitState::Open => {}
        }
    }

    /// Record a failed call.
    pub async fn record_failure(&self) {
        let mut inner = self.inner.lock().await;
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold.max(1) {
                    inner.transition(&self.service, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                inner.consecutive_failures += 1;
                inner.transition(&self.service, CircuitState::Open);
            }
            CircuitState::Open => {}
        }
    }

    async fn record_neutral(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state == CircuitState::HalfOpen {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
        }
    }

    fn refresh(&self, inner: &mut BreakerState) {
        if inner.state == CircuitState::Open
            && inner.last_transition_at.elapsed() >= self.config.open_timeout
        {
            inner.transition(&self.service, CircuitState::HalfOpen);
        }
    }

    fn open_error(&self) -> Error {
        Error::CircuitOpen {
            service: self.service.clone(),
        }
    }
}
