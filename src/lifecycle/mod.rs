//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Config → open cache → limiters → provider clients → BatchRunner
//!
//! Cancellation (cancellation.rs):
//!     trigger() → every in-flight resolution and backoff wait stops
//!
//! Signals (signals.rs):
//!     Ctrl-C → cancel the run, second Ctrl-C → exit
//! ```
//!
//! # Design Decisions
//! - Ordered startup: config first, then shared state, then clients
//! - Fail fast: any startup error is fatal
//! - Cancellation is cooperative; permits are released by drop

pub mod cancellation;
pub mod signals;
pub mod startup;

pub use cancellation::RunCancellation;
pub use startup::{build_runner, StartupError};
