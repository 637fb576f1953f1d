//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse, deserialize, env overrides)
//!     → validation.rs (semantic checks)
//!     → PlannerConfig (validated, immutable)
//!     → sections handed to each subsystem at construction
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, ConfigError};
pub use schema::{
    BatchConfig, CacheConfig, CircuitConfig, FallbackConfig, LegSource, ObservabilityConfig,
    PlannerConfig, ProviderConfig, RateLimitConfig, RetryConfig, RoutingConfig,
};
