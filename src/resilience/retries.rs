//! Retry policy for provider calls.
//!
//! # Design Decisions
//! - Only transient and throttled failures are retried
//! - Attempt count includes the first call
//! - Delays come from the pure backoff function

use std::time::Duration;

use crate::config::RetryConfig;
use crate::geocode::ResolveError;
use crate::resilience::backoff::calculate_backoff;

/// What to do after a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Wait, then try the same client again.
    RetryAfter(Duration),
    /// Stop; retries are exhausted or the error is not retryable.
    GiveUp,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay_ms: u64,
    max_delay_ms: u64,
}

impl RetryPolicy {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay_ms: config.base_delay_ms,
            max_delay_ms: config.max_delay_ms,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Decide after attempt number `attempt` (1-based) failed with `err`.
    pub fn decide(&self, attempt: u32, err: &ResolveError) -> RetryDecision {
        if !err.is_retryable() || attempt >= self.max_attempts {
            return RetryDecision::GiveUp;
        }
        RetryDecision::RetryAfter(calculate_backoff(attempt, self.base_delay_ms, self.max_delay_ms))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(&RetryConfig::default())
    }
}
