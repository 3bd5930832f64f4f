//! Circuit breaker
//!
//! Stops calling a failing dependency for a recovery period, then lets a
//! bounded number of probe calls through to decide whether it has healed.
//!
//! ```text
//! closed --(failures >= threshold)--> open --(recovery elapsed)--> half_open
//! half_open --success--> closed
//! half_open --failure or probe budget exceeded--> open
//! ```

use parking_lot::Mutex;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::CircuitBreakerSettings;
use crate::error::GatewayError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            half_open_max_calls: 1,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn from_settings(settings: &CircuitBreakerSettings) -> Self {
        Self {
            failure_threshold: settings.failure_threshold.max(1),
            recovery_timeout: Duration::from_secs(settings.recovery_timeout_secs),
            half_open_max_calls: settings.half_open_max_calls.max(1),
        }
    }
}

/// Point-in-time view of a breaker
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitStats {
    pub state: CircuitState,
    pub failure_count: u32,
    pub half_open_calls: u32,
    /// Time left before an open breaker admits probes
    pub retry_after: Option<Duration>,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failure_count: u32,
    opened_at: Option<Instant>,
    half_open_calls: u32,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self::named("gateway", config)
    }

    pub fn named(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failure_count: 0,
                opened_at: None,
                half_open_calls: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state; an open breaker whose recovery period has passed
    /// reports (and becomes) half-open
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);
        inner.state
    }

    pub fn stats(&self) -> CircuitStats {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);
        CircuitStats {
            state: inner.state,
            failure_count: inner.failure_count,
            half_open_calls: inner.half_open_calls,
            retry_after: self.remaining_open(&inner),
        }
    }

    /// Run `op` through the breaker
    ///
    /// Rejected calls never invoke `op` and fail with
    /// [`GatewayError::CircuitOpen`] converted into the caller's error type.
    pub async fn execute<F, Fut, T, E>(&self, op: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<GatewayError>,
    {
        self.acquire().map_err(E::from)?;
        match op().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(error) => {
                self.record_failure();
                Err(error)
            }
        }
    }

    /// Admission check; counts a probe when half-open
    pub fn acquire(&self) -> Result<(), GatewayError> {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => Err(GatewayError::CircuitOpen {
                retry_after: self.remaining_open(&inner).unwrap_or_default(),
            }),
            CircuitState::HalfOpen => {
                if inner.half_open_calls >= self.config.half_open_max_calls {
                    self.trip(&mut inner, "probe budget exhausted");
                    return Err(GatewayError::CircuitOpen {
                        retry_after: self.config.recovery_timeout,
                    });
                }
                inner.half_open_calls += 1;
                Ok(())
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::HalfOpen => {
                tracing::info!(breaker = %self.name, "circuit closed after successful probe");
                inner.state = CircuitState::Closed;
                inner.failure_count = 0;
                inner.half_open_calls = 0;
                inner.opened_at = None;
            }
            CircuitState::Closed => inner.failure_count = 0,
            // Late success from a call admitted before the breaker tripped
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::HalfOpen => self.trip(&mut inner, "probe failed"),
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    self.trip(&mut inner, "failure threshold reached");
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Force the breaker closed
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.half_open_calls = 0;
        inner.opened_at = None;
    }

    fn refresh(&self, inner: &mut Inner) {
        if inner.state != CircuitState::Open {
            return;
        }
        let elapsed = inner.opened_at.map(|at| at.elapsed()).unwrap_or_default();
        if elapsed >= self.config.recovery_timeout {
            tracing::info!(breaker = %self.name, "circuit half-open, admitting probes");
            inner.state = CircuitState::HalfOpen;
            inner.half_open_calls = 0;
        }
    }

    fn trip(&self, inner: &mut Inner, reason: &str) {
        tracing::warn!(
            breaker = %self.name,
            failures = inner.failure_count,
            reason,
            "circuit opened"
        );
        inner.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
        inner.failure_count = 0;
        inner.half_open_calls = 0;
    }

    fn remaining_open(&self, inner: &Inner) -> Option<Duration> {
        if inner.state != CircuitState::Open {
            return None;
        }
        let opened_at = inner.opened_at?;
        Some(self.config.recovery_timeout.saturating_sub(opened_at.elapsed()))
    }
}
