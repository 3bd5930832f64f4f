//! Retry with exponential backoff
//!
//! Wraps any fallible future factory. Classification goes through the
//! [`Retryable`] trait, so the policy works with gateway errors as well as
//! foreign error types.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;

use crate::config::RetrySettings;
use crate::error::{ErrorKind, Retryable};

/// Retry configuration and executor
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_retries: u32,
    backoff_base: Duration,
    backoff_max: Duration,
    jitter: bool,
    retryable: HashSet<ErrorKind>,
    overrides: HashMap<ErrorKind, bool>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(30),
            jitter: true,
            retryable: ErrorKind::default_retryable_set().into_iter().collect(),
            overrides: HashMap::new(),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            backoff_base: Duration::ZERO,
            backoff_max: Duration::ZERO,
            jitter: false,
            ..Self::default()
        }
    }

    pub fn from_settings(settings: &RetrySettings) -> Self {
        let mut policy = Self {
            max_retries: settings.max_retries,
            backoff_base: Duration::from_millis(settings.backoff_base_ms),
            backoff_max: Duration::from_millis(settings.backoff_max_ms),
            jitter: settings.jitter,
            retryable: settings.retryable.iter().copied().collect(),
            overrides: HashMap::new(),
        };
        for kind in &settings.always_retry {
            policy.overrides.insert(*kind, true);
        }
        for kind in &settings.never_retry {
            policy.overrides.insert(*kind, false);
        }
        policy
    }

    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.backoff_base = base;
        self.backoff_max = max;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Replace the set of kinds retried by default
    pub fn with_retryable(mut self, kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        self.retryable = kinds.into_iter().collect();
        self
    }

    /// Force a decision for one kind, taking precedence over the set
    pub fn with_override(mut self, kind: ErrorKind, retry: bool) -> Self {
        self.overrides.insert(kind, retry);
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Decide whether an error is worth another attempt
    pub fn should_retry<E: Retryable + ?Sized>(&self, error: &E) -> bool {
        let kind = error.error_kind();
        // Credentials do not fix themselves
        if kind == ErrorKind::Auth {
            return false;
        }
        if let Some(decision) = self.overrides.get(&kind) {
            return *decision;
        }
        self.retryable.contains(&kind)
    }

    /// Un-jittered delay before retry number `attempt + 1`
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.backoff_base.saturating_mul(factor).min(self.backoff_max)
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let delay = self.delay_for_attempt(attempt);
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let secs = rand::thread_rng().gen_range(0.0..=delay.as_secs_f64());
        Duration::from_secs_f64(secs)
    }

    /// Backoff for `attempt`, raised to the server's retry-after hint but
    /// never past `backoff_max`
    fn delay_after<E: Retryable + ?Sized>(&self, error: &E, attempt: u32) -> Duration {
        let hint = error.retry_after().unwrap_or_default().min(self.backoff_max);
        self.backoff(attempt).max(hint)
    }

    /// Run `op` until it succeeds, fails permanently, or retries run out
    pub async fn execute<F, Fut, T, E>(&self, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + std::fmt::Display,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(error) => {
                    if !self.should_retry(&error) {
                        tracing::debug!(kind = %error.error_kind(), error = %error, "not retrying");
                        return Err(error);
                    }
                    if attempt >= self.max_retries {
                        tracing::warn!(attempts = attempt + 1, error = %error, "retries exhausted");
                        return Err(error);
                    }
                    let delay = self.delay_after(&error, attempt);
                    tracing::warn!(
                        attempt = attempt + 1,
                        max_retries = self.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "retrying after failure"
                    );
                    if !delay.is_zero() {
                        sleep(delay).await;
                    }
                    attempt += 1;
                }
            }
        }
    }
}
