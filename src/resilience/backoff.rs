//! Exponential backoff with jitter.

use rand::Rng;
use std::time::Duration;

/// Pure backoff policy.
///
/// `attempt` is the retry number (1 for the first retry); `jitter` in `[0, 1)`
/// adds up to 10% of the capped delay.
pub fn backoff_delay(attempt: u32, base_ms: u64, max_ms: u64, jitter: f64) -> Duration {
    if attempt == 0 {
        return Duration::from_millis(0);
    }

    let exponential_base = 2u64.saturating_pow(attempt - 1);
    let delay_ms = base_ms.saturating_mul(exponential_base);
    let capped_delay = delay_ms.min(max_ms);

    let jitter_range = capped_delay / 10;
    let jitter_ms = (jitter_range as f64 * jitter.clamp(0.0, 1.0)) as u64;

    Duration::from_millis(capped_delay + jitter_ms.min(jitter_range))
}

/// Calculate exponential backoff delay with random jitter.
pub fn calculate_backoff(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    let jitter = rand::thread_rng().gen_range(0.0..1.0);
    backoff_delay(attempt, base_ms, max_ms, jitter)
}
