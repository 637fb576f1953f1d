//! Route sequencing engine.
//!
//! # Data Flow
//! ```text
//! ResolvedStop[]
//!     → cluster.rs  (angular sweep around the depot, balanced refinement)
//!     → legs.rs     (leg costs: provider driving metrics or straight line, memoized per run)
//!     → sequence.rs (nearest neighbour + seeded restarts, 2-opt / swap improvement)
//!     → route.rs    (ordered stops, measured legs, totals)
//! ```
//!
//! # Design Decisions
//! - Clustering and sequencing are pure functions over coordinates and cost matrices
//! - Deterministic: same stops and seed always give the same routes
//! - A failed leg measurement degrades to the straight-line estimate, never fails the plan
//! - Routes are built and reordered only by the optimizer

pub mod cluster;
pub mod geo;
pub mod legs;
pub mod optimizer;
pub mod route;
pub mod sequence;

pub use legs::{LegCache, LegMetrics, StraightLine};
pub use optimizer::{PlanError, PlanParams, RouteOptimizer};
pub use route::{FarthestPair, Leg, Route};
