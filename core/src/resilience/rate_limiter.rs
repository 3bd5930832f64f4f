//! Sliding-window rate limiter
//!
//! Admits at most `max_calls` acquisitions in any trailing `period`.
//! Callers over the limit wait until the oldest admission leaves the window.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::{sleep, Instant};

use crate::config::RateLimitSettings;

#[derive(Debug)]
pub struct RateLimiter {
    max_calls: usize,
    period: Duration,
    window: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(max_calls: u32, period: Duration) -> Self {
        let max_calls = max_calls.max(1) as usize;
        Self {
            max_calls,
            period,
            window: Mutex::new(VecDeque::with_capacity(max_calls)),
        }
    }

    pub fn from_settings(settings: &RateLimitSettings) -> Self {
        Self::new(settings.max_calls, Duration::from_millis(settings.period_ms))
    }

    /// Wait until a slot is free, then take it
    pub async fn acquire(&self) {
        loop {
            let wait = match self.try_reserve() {
                Ok(()) => return,
                Err(wait) => wait,
            };
            tracing::debug!(wait_ms = wait.as_millis() as u64, "rate limit reached, waiting");
            sleep(wait).await;
        }
    }

    /// Take a slot without waiting
    pub fn try_acquire(&self) -> bool {
        self.try_reserve().is_ok()
    }

    /// Slots available right now
    pub fn remaining(&self) -> usize {
        let mut window = self.window.lock();
        Self::purge(&mut window, Instant::now(), self.period);
        self.max_calls.saturating_sub(window.len())
    }

    fn try_reserve(&self) -> Result<(), Duration> {
        let now = Instant::now();
        let mut window = self.window.lock();
        Self::purge(&mut window, now, self.period);
        if window.len() < self.max_calls {
            window.push_back(now);
            return Ok(());
        }
        let oldest = window.front().copied().unwrap_or(now);
        let wait = (oldest + self.period).saturating_duration_since(now);
        Err(wait.max(Duration::from_millis(1)))
    }

    fn purge(window: &mut VecDeque<Instant>, now: Instant, period: Duration) {
        while let Some(front) = window.front() {
            if now.duration_since(*front) >= period {
                window.pop_front();
            } else {
                break;
            }
        }
    }
}
