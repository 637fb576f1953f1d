//! Geocoding domain types.
//!
//! # Data Flow
//! ```text
//! AddressRecord (import layer)
//!     → normalize.rs (NormalizedAddress cache key)
//!     → provider / cache (GeocodeResult)
//!     → ResolvedStop (record + geocode)
//! ```

pub mod error;
pub mod normalize;
pub mod types;

pub use error::{FailureReason, ResolveError, ResolveResult};
pub use normalize::{normalize, NormalizedAddress};
pub use types::{
    AddressRecord, Coordinate, GeocodeResult, Precision, ResolutionSource, ResolvedStop,
    RouteMetrics,
};
