//! Circuit Breaker
//!
//! Named, independent state machines guarding calls to volatile downstream
//! operations. A breaker fast-fails while open, admits a bounded number of
//! trial calls while half-open, and closes again after enough consecutive
//! trial successes.
//!
//! # States
//!
//! - **Closed**: normal operation, calls pass through
//! - **Open**: calls are rejected immediately without invoking the handler
//! - **HalfOpen**: bounded trial calls probe whether the operation recovered

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::clock::{SharedClock, SystemClock};
use crate::error::DispatchError;
use crate::message::BoxedMessage;
use crate::middleware::{Middleware, Next, StageResult};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures in Closed before the circuit opens.
    pub failure_threshold: u64,
    /// Consecutive half-open successes before the circuit closes.
    pub success_threshold: u64,
    /// Time the circuit stays open before admitting a trial call.
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u64,
    consecutive_successes: u64,
    half_open_in_flight: u64,
    opened_at: Option<Duration>,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            half_open_in_flight: 0,
            opened_at: None,
        }
    }
}

/// A named circuit breaker.
///
/// Transition decisions are serialized under the internal mutex; the guarded
/// call itself runs outside the lock. `opened_at` is set exactly when the
/// circuit opens and cleared when it leaves Open.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    clock: SharedClock,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig, clock: SharedClock) -> Self {
        Self {
            name: name.into(),
            config,
            clock,
            inner: Mutex::new(BreakerState::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Admission decision for one call.
    ///
    /// Returns a permit whose outcome must be recorded; a permit dropped
    /// without an outcome releases its half-open trial slot. While Open the
    /// call is rejected without ever invoking the wrapped operation.
    pub fn acquire(self: &Arc<Self>) -> Result<CallPermit, DispatchError> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Ok(CallPermit::new(Arc::clone(self), false)),
            CircuitState::Open => {
                let recovered = inner
                    .opened_at
                    .map(|at| self.clock.now().saturating_sub(at) >= self.config.recovery_timeout)
                    .unwrap_or(false);
                if recovered {
                    inner.state = CircuitState::HalfOpen;
                    inner.consecutive_successes = 0;
                    inner.half_open_in_flight = 1;
                    inner.opened_at = None;
                    tracing::info!(circuit = %self.name, "Circuit transitioned to HALF_OPEN");
                    Ok(CallPermit::new(Arc::clone(self), true))
                } else {
                    Err(DispatchError::CircuitOpen {
                        name: self.name.clone(),
                    })
                }
            }
            CircuitState::HalfOpen => {
                let admitted = inner.consecutive_successes + inner.half_open_in_flight;
                if admitted < self.config.success_threshold {
                    inner.half_open_in_flight += 1;
                    Ok(CallPermit::new(Arc::clone(self), true))
                } else {
                    Err(DispatchError::CircuitOpen {
                        name: self.name.clone(),
                    })
                }
            }
        }
    }

    fn record_success(&self, trial: bool) {
        let mut inner = self.inner.lock();
        if trial {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
        }
        match inner.state {
            CircuitState::HalfOpen => {
                inner.consecutive_successes += 1;
                if inner.consecutive_successes >= self.config.success_threshold {
                    inner.state = CircuitState::Closed;
                    inner.consecutive_failures = 0;
                    inner.consecutive_successes = 0;
                    inner.half_open_in_flight = 0;
                    tracing::info!(circuit = %self.name, "Circuit closed");
                }
            }
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
            }
            CircuitState::Open => {}
        }
    }

    fn record_failure(&self, trial: bool) {
        let mut inner = self.inner.lock();
        if trial {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
        }
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    self.trip(&mut inner);
                }
            }
            // Any failure during a half-open trial reopens the circuit,
            // discarding partial successes.
            CircuitState::HalfOpen => self.trip(&mut inner),
            CircuitState::Open => {}
        }
    }

    fn trip(&self, inner: &mut BreakerState) {
        inner.state = CircuitState::Open;
        inner.opened_at = Some(self.clock.now());
        inner.consecutive_successes = 0;
        inner.half_open_in_flight = 0;
        tracing::warn!(
            circuit = %self.name,
            consecutive_failures = inner.consecutive_failures,
            "Circuit opened"
        );
    }

    /// Restores the breaker to Closed with cleared counters (test isolation).
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        *inner = BreakerState::new();
        tracing::info!(circuit = %self.name, "Circuit reset");
    }

    /// Forces the breaker Open, rejecting calls until the recovery timeout.
    pub fn force_open(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Open;
        inner.opened_at = Some(self.clock.now());
        inner.consecutive_successes = 0;
        inner.half_open_in_flight = 0;
        tracing::warn!(circuit = %self.name, "Circuit force-opened");
    }

    /// Snapshot of the breaker's counters.
    pub fn stats(&self) -> CircuitBreakerStats {
        let inner = self.inner.lock();
        CircuitBreakerStats {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            consecutive_successes: inner.consecutive_successes,
        }
    }
}

/// Snapshot of one breaker's state and counters.
#[derive(Debug, Clone)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u64,
    pub consecutive_successes: u64,
}

/// RAII admission permit handed out by [`CircuitBreaker::acquire`].
pub struct CallPermit {
    breaker: Arc<CircuitBreaker>,
    trial: bool,
    recorded: bool,
}

impl CallPermit {
    fn new(breaker: Arc<CircuitBreaker>, trial: bool) -> Self {
        Self {
            breaker,
            trial,
            recorded: false,
        }
    }

    pub fn record_success(mut self) {
        self.recorded = true;
        self.breaker.record_success(self.trial);
    }

    pub fn record_failure(mut self) {
        self.recorded = true;
        self.breaker.record_failure(self.trial);
    }
}

impl Drop for CallPermit {
    fn drop(&mut self) {
        // A cancelled trial must not occupy its half-open slot forever.
        if !self.recorded && self.trial {
            let mut inner = self.breaker.inner.lock();
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
        }
    }
}

/// Named breakers, created lazily on first use.
///
/// Owned explicitly by the application and passed to the bus builder, rather
/// than living in a hidden process-wide singleton; `reset` exists for test
/// isolation.
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    overrides: DashMap<String, CircuitBreakerConfig>,
    default_config: CircuitBreakerConfig,
    clock: SharedClock,
}

impl CircuitBreakerRegistry {
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self::with_clock(default_config, Arc::new(SystemClock::new()))
    }

    pub fn with_clock(default_config: CircuitBreakerConfig, clock: SharedClock) -> Self {
        Self {
            breakers: DashMap::new(),
            overrides: DashMap::new(),
            default_config,
            clock,
        }
    }

    /// Per-name config override, effective from the breaker's first use.
    pub fn configure(&self, name: impl Into<String>, config: CircuitBreakerConfig) {
        self.overrides.insert(name.into(), config);
    }

    /// The breaker for `name`, created on first use with its override or the
    /// registry default.
    pub fn breaker(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(name) {
            return Arc::clone(existing.value());
        }
        let config = self
            .overrides
            .get(name)
            .map(|entry| entry.value().clone())
            .unwrap_or_else(|| self.default_config.clone());
        Arc::clone(
            self.breakers
                .entry(name.to_string())
                .or_insert_with(|| {
                    Arc::new(CircuitBreaker::new(name, config, Arc::clone(&self.clock)))
                })
                .value(),
        )
    }

    /// Resets every breaker to Closed (test isolation).
    pub fn reset(&self) {
        for entry in self.breakers.iter() {
            entry.value().reset();
        }
    }

    /// Snapshot of every breaker created so far.
    pub fn stats(&self) -> Vec<CircuitBreakerStats> {
        self.breakers
            .iter()
            .map(|entry| entry.value().stats())
            .collect()
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

/// Breaker stage: short-circuits while the message type's breaker is open.
///
/// Sits inside the retry stage, so every retry attempt re-checks breaker
/// state and is itself rejected once the circuit opens.
#[derive(Debug)]
pub struct CircuitBreakerMiddleware {
    registry: Arc<CircuitBreakerRegistry>,
}

impl CircuitBreakerMiddleware {
    pub fn new(registry: Arc<CircuitBreakerRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Middleware for CircuitBreakerMiddleware {
    async fn handle(&self, message: BoxedMessage, next: Next) -> StageResult {
        let breaker = self.registry.breaker(next.meta().name);
        let permit = breaker.acquire()?;

        let result = next.run(message).await;
        match &result {
            Ok(_) => permit.record_success(),
            Err(_) => permit.record_failure(),
        }
        result
    }
}
