//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Provider call:
//!     → timeouts.rs (enforce per-call deadline)
//!     → On failure: retries.rs (retryable? wait backoff.rs delay and retry)
//!     → circuit_breaker.rs (track provider blocks, skip the API while open)
//! ```
//!
//! # Design Decisions
//! - Timeouts are non-negotiable; every external call has a deadline
//! - Only transient and throttled failures are retried
//! - Backoff is a pure function of the attempt number

pub mod backoff;
pub mod circuit_breaker;
pub mod retries;
pub mod timeouts;

pub use circuit_breaker::{ApiPass, BlockCircuit, CircuitState};
pub use retries::{RetryDecision, RetryPolicy};
