//! Address resolution and route planning library.

pub mod cache;
pub mod clock;
pub mod config;
pub mod geocode;
pub mod lifecycle;
pub mod observability;
pub mod pipeline;
pub mod provider;
pub mod resilience;
pub mod routing;
pub mod throttle;

pub use config::schema::PlannerConfig;
pub use lifecycle::RunCancellation;
pub use pipeline::{BatchReport, BatchRunner};
