//! Resilience wrappers
//!
//! Independent primitives that can be used alone or composed through a
//! [`ResiliencePolicy`]:
//! - [`CircuitBreaker`]: fail fast while a dependency is unhealthy
//! - [`RetryPolicy`]: exponential backoff for transient errors
//! - [`RateLimiter`]: sliding-window admission control
//! - [`RequestDeduplicator`]: reject identical requests within a TTL
//!
//! Composition order, outermost first: dedup, retry, then per attempt the
//! rate limiter and circuit breaker around the call.

pub mod circuit_breaker;
pub mod dedup;
pub mod rate_limiter;
pub mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState, CircuitStats};
pub use dedup::{request_hash, RequestDeduplicator};
pub use rate_limiter::RateLimiter;
pub use retry::RetryPolicy;

use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::config::ResilienceSettings;
use crate::error::{GatewayError, Result};
use crate::execution::{AgentRequest, ExecutionOutcome, Invoke};
use crate::transport::{EventFilter, Subscription, Transport, TransportCapabilities};

/// A set of resilience layers; absent layers are skipped
#[derive(Debug, Clone, Default)]
pub struct ResiliencePolicy {
    pub breaker: Option<Arc<CircuitBreaker>>,
    pub retry: Option<RetryPolicy>,
    pub limiter: Option<Arc<RateLimiter>>,
    pub dedup: Option<Arc<RequestDeduplicator>>,
}

impl ResiliencePolicy {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn from_settings(settings: &ResilienceSettings) -> Self {
        Self {
            breaker: settings.circuit_breaker.enabled.then(|| {
                Arc::new(CircuitBreaker::new(CircuitBreakerConfig::from_settings(
                    &settings.circuit_breaker,
                )))
            }),
            retry: settings
                .retry
                .enabled
                .then(|| RetryPolicy::from_settings(&settings.retry)),
            limiter: settings
                .rate_limit
                .enabled
                .then(|| Arc::new(RateLimiter::from_settings(&settings.rate_limit))),
            dedup: settings
                .dedup
                .enabled
                .then(|| Arc::new(RequestDeduplicator::from_settings(&settings.dedup))),
        }
    }

    pub fn with_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn with_dedup(mut self, dedup: Arc<RequestDeduplicator>) -> Self {
        self.dedup = Some(dedup);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.breaker.is_none() && self.retry.is_none() && self.limiter.is_none() && self.dedup.is_none()
    }

    /// Run `op` through every configured layer
    ///
    /// `method` and `params` identify the request for deduplication.
    pub async fn run<F, Fut, T>(&self, method: &str, params: &Value, op: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if let Some(dedup) = &self.dedup {
            if dedup.check_and_mark(method, params) {
                return Err(GatewayError::DuplicateRequest {
                    method: method.to_string(),
                });
            }
        }

        let op = &op;
        let this = self;
        let attempt = move || async move {
            if let Some(limiter) = &this.limiter {
                limiter.acquire().await;
            }
            match &this.breaker {
                Some(breaker) => breaker.execute(op).await,
                None => op().await,
            }
        };

        match &self.retry {
            Some(retry) => retry.execute(attempt).await,
            None => attempt().await,
        }
    }
}

/// Transport wrapper that applies a [`ResiliencePolicy`] to every call
pub struct ResilientTransport {
    inner: Arc<dyn Transport>,
    policy: ResiliencePolicy,
}

impl ResilientTransport {
    pub fn new(inner: Arc<dyn Transport>, policy: ResiliencePolicy) -> Self {
        Self { inner, policy }
    }

    pub fn policy(&self) -> &ResiliencePolicy {
        &self.policy
    }

    pub fn inner(&self) -> &Arc<dyn Transport> {
        &self.inner
    }
}

#[async_trait]
impl Transport for ResilientTransport {
    async fn call(&self, method: &str, params: Value, timeout: Option<Duration>) -> Result<Value> {
        let inner = &self.inner;
        let params_ref = &params;
        self.policy
            .run(method, &params, || inner.call(method, params_ref.clone(), timeout))
            .await
    }

    fn subscribe(&self, filter: EventFilter) -> Result<Subscription> {
        self.inner.subscribe(filter)
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }

    fn capabilities(&self) -> TransportCapabilities {
        self.inner.capabilities()
    }

    fn name(&self) -> &'static str {
        self.inner.name()
    }
}

/// Invoker wrapper that applies a [`ResiliencePolicy`] to whole agent runs
pub struct ResilientInvoker<I> {
    inner: I,
    policy: ResiliencePolicy,
}

impl<I: Invoke> ResilientInvoker<I> {
    pub fn new(inner: I, policy: ResiliencePolicy) -> Self {
        Self { inner, policy }
    }

    pub fn into_inner(self) -> I {
        self.inner
    }
}

#[async_trait]
impl<I: Invoke> Invoke for ResilientInvoker<I> {
    async fn invoke(&self, request: AgentRequest) -> Result<ExecutionOutcome> {
        // Identity for dedup excludes the per-call idempotency key
        let identity = serde_json::json!({
            "message": request.message,
            "sessionKey": request.session_key,
            "agentId": request.agent_id,
        });
        let inner = &self.inner;
        let request = &request;
        self.policy
            .run("agent.invoke", &identity, || inner.invoke(request.clone()))
            .await
    }
}
