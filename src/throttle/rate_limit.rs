//! Concurrency and throughput limiter for provider traffic.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

use crate::config::RateLimitConfig;
use crate::observability::metrics;
use crate::throttle::budget::RequestBudget;

/// Error returned once the limiter has been closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("rate limiter closed")]
pub struct LimiterClosed;

/// Grants permits while both ceilings hold:
/// - fewer than `max_in_flight` permits outstanding
/// - fewer than `requests_per_window` grants in the rolling window
pub struct RateLimiter {
    name: &'static str,
    concurrency: Arc<Semaphore>,
    max_in_flight: usize,
    budget: Mutex<RequestBudget>,
}

/// Scoped right to issue one provider call. Released on drop.
#[must_use = "the permit is released as soon as it is dropped"]
#[derive(Debug)]
pub struct Permit {
    _slot: OwnedSemaphorePermit,
}

impl Permit {
    /// Give the slot back explicitly. Same as dropping.
    pub fn release(self) {}
}

impl RateLimiter {
    pub fn new(name: &'static str, max_in_flight: usize, requests_per_window: u32, window: Duration) -> Self {
        Self {
            name,
            concurrency: Arc::new(Semaphore::new(max_in_flight)),
            max_in_flight,
            budget: Mutex::new(RequestBudget::new(requests_per_window, window)),
        }
    }

    pub fn from_config(name: &'static str, config: &RateLimitConfig) -> Self {
        Self::new(
            name,
            config.max_in_flight,
            config.requests_per_window,
            Duration::from_millis(config.window_ms),
        )
    }

    /// Wait for a permit. Never spins: waits on the semaphore, then sleeps until
    /// the oldest grant leaves the window.
    pub async fn acquire(&self) -> Result<Permit, LimiterClosed> {
        let started = Instant::now();
        let slot = self
            .concurrency
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| LimiterClosed)?;

        loop {
            let wait = match self.budget.lock().try_consume(Instant::now()) {
                Ok(()) => break,
                Err(wait) => wait,
            };
            tracing::trace!(limiter = self.name, wait_ms = wait.as_millis() as u64, "Rate window full");
            tokio::time::sleep(wait).await;
        }

        metrics::record_limiter_wait(self.name, started.elapsed());
        Ok(Permit { _slot: slot })
    }

    /// Stop granting; pending and future `acquire` calls fail.
    pub fn close(&self) {
        self.concurrency.close();
    }

    /// Permits currently held.
    pub fn in_flight(&self) -> usize {
        self.max_in_flight - self.concurrency.available_permits()
    }

    /// Grants inside the current window.
    pub fn consumed(&self) -> u32 {
        self.budget.lock().consumed(Instant::now())
    }

    /// Grants since creation or the last reset.
    pub fn total_granted(&self) -> u64 {
        self.budget.lock().total()
    }

    pub fn reset_budget(&self) {
        self.budget.lock().reset();
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("name", &self.name)
            .field("max_in_flight", &self.max_in_flight)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}
