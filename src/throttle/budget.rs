//! Rolling request budget.

use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// Log of provider calls granted inside the current rolling window.
///
/// Not synchronized itself; `RateLimiter` owns it behind a mutex.
#[derive(Debug)]
pub struct RequestBudget {
    limit: u32,
    window: Duration,
    grants: VecDeque<Instant>,
    total: u64,
}

impl RequestBudget {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            grants: VecDeque::with_capacity(limit as usize),
            total: 0,
        }
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&oldest) = self.grants.front() {
            if now.saturating_duration_since(oldest) >= self.window {
                self.grants.pop_front();
            } else {
                break;
            }
        }
    }

    /// Record a grant at `now` if the window has room, otherwise return how long to wait.
    pub fn try_consume(&mut self, now: Instant) -> Result<(), Duration> {
        self.prune(now);
        if (self.grants.len() as u32) < self.limit {
            self.grants.push_back(now);
            self.total += 1;
            return Ok(());
        }
        // Full window: the oldest grant leaves first.
        let oldest = self.grants.front().copied().unwrap_or(now);
        Err((oldest + self.window).saturating_duration_since(now))
    }

    /// Grants inside the window ending at `now`.
    pub fn consumed(&mut self, now: Instant) -> u32 {
        self.prune(now);
        self.grants.len() as u32
    }

    /// Grants since creation or the last reset.
    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn reset(&mut self) {
        self.grants.clear();
        self.total = 0;
    }
}
