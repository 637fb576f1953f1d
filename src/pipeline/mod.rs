//! Address resolution pipeline.
//!
//! # Data Flow
//! ```text
//! AddressRecord[]
//!     → batch.rs    (normalize, dedupe by key, bounded fan-out)
//!     → resolver.rs (cache → API with retries → fallback, per distinct key)
//!     → batch.rs    (fan-in by input index → ResolutionReport / BatchReport)
//!     → events.rs   (progress on an optional channel)
//! ```
//!
//! # Design Decisions
//! - Duplicate addresses in a batch share one resolution
//! - Results are matched to records by input index, never by completion order
//! - The caller always gets a complete report; failures are per address
//! - Cancellation and quota exhaustion end the run early, keeping what resolved

pub mod batch;
pub mod events;
pub mod resolver;

pub use batch::{BatchReport, BatchRunner, ResolutionReport, RunParams, UnresolvedAddress};
pub use events::{BatchEvent, EventSink};
pub use resolver::ResolutionPipeline;
