//! Provider traffic shaping.
//!
//! # Data Flow
//! ```text
//! provider call
//!     → rate_limit.rs (wait for a concurrency slot)
//!     → budget.rs (wait until the rolling window has room)
//!     → Permit held for the duration of the call, released on drop
//! ```
//!
//! # Design Decisions
//! - One limiter per outbound path (API, browser), passed in explicitly
//! - Waiting is timer based, never a spin loop
//! - Release is tied to scope so every exit path gives the slot back

pub mod budget;
pub mod rate_limit;

pub use budget::RequestBudget;
pub use rate_limit::{LimiterClosed, Permit, RateLimiter};
