//! Leg cost sources.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;

use crate::geocode::{Coordinate, ResolveResult, RouteMetrics};
use crate::observability::metrics;
use crate::provider::MapApiClient;
use crate::routing::geo::haversine_m;

/// Anything that can measure travel between two points.
#[async_trait]
pub trait LegMetrics: Send + Sync {
    async fn measure(&self, origin: Coordinate, destination: Coordinate) -> ResolveResult<RouteMetrics>;
}

#[async_trait]
impl LegMetrics for MapApiClient {
    async fn measure(&self, origin: Coordinate, destination: Coordinate) -> ResolveResult<RouteMetrics> {
        self.route_metrics(origin, destination).await
    }
}

/// Great-circle estimate at a constant speed.
#[derive(Debug, Clone, Copy)]
pub struct StraightLine {
    speed_mps: f64,
}

impl StraightLine {
    pub fn new(speed_kmh: f64) -> Self {
        let speed_kmh = if speed_kmh.is_finite() && speed_kmh > 0.0 { speed_kmh } else { 30.0 };
        Self {
            speed_mps: speed_kmh / 3.6,
        }
    }

    pub fn estimate(&self, origin: Coordinate, destination: Coordinate) -> RouteMetrics {
        let distance = haversine_m(origin, destination);
        RouteMetrics {
            distance_m: distance.round() as u64,
            duration_s: (distance / self.speed_mps).round() as u64,
            polyline: vec![origin, destination],
        }
    }
}

#[async_trait]
impl LegMetrics for StraightLine {
    async fn measure(&self, origin: Coordinate, destination: Coordinate) -> ResolveResult<RouteMetrics> {
        Ok(self.estimate(origin, destination))
    }
}

type LegKey = (u64, u64, u64, u64);

fn leg_key(origin: Coordinate, destination: Coordinate) -> LegKey {
    (
        origin.lng.to_bits(),
        origin.lat.to_bits(),
        destination.lng.to_bits(),
        destination.lat.to_bits(),
    )
}

/// A measured (or estimated) leg.
#[derive(Debug, Clone, PartialEq)]
pub struct MeasuredLeg {
    pub metrics: RouteMetrics,
    /// True when the numbers are a straight-line estimate.
    pub estimated: bool,
}

/// Per-run memo of `(origin, destination)` measurements.
///
/// Without a road source every leg is a straight-line estimate.
pub struct LegCache {
    road: Option<Arc<dyn LegMetrics>>,
    estimator: StraightLine,
    memo: DashMap<LegKey, MeasuredLeg>,
}

impl LegCache {
    pub fn new(road: Option<Arc<dyn LegMetrics>>, estimator: StraightLine) -> Self {
        Self {
            road,
            estimator,
            memo: DashMap::new(),
        }
    }

    pub fn straight_line(estimator: StraightLine) -> Self {
        Self::new(None, estimator)
    }

    pub fn has_road_source(&self) -> bool {
        self.road.is_some()
    }

    pub fn estimator(&self) -> StraightLine {
        self.estimator
    }

    /// Number of memoized legs.
    pub fn len(&self) -> usize {
        self.memo.len()
    }

    pub fn is_empty(&self) -> bool {
        self.memo.is_empty()
    }

    /// Measure a leg, consulting the memo first.
    pub async fn measure(&self, origin: Coordinate, destination: Coordinate) -> MeasuredLeg {
        if origin == destination {
            return MeasuredLeg {
                metrics: RouteMetrics::default(),
                estimated: false,
            };
        }
        let key = leg_key(origin, destination);
        if let Some(hit) = self.memo.get(&key) {
            return hit.value().clone();
        }

        let leg = match &self.road {
            None => MeasuredLeg {
                metrics: self.estimator.estimate(origin, destination),
                estimated: true,
            },
            Some(road) => match road.measure(origin, destination).await {
                Ok(metrics) => {
                    metrics::record_leg_measured("road");
                    MeasuredLeg {
                        metrics,
                        estimated: false,
                    }
                }
                Err(e) => {
                    metrics::record_leg_measured("estimated");
                    tracing::warn!(
                        origin = %origin,
                        destination = %destination,
                        error = %e,
                        "Leg measurement failed, using straight-line estimate"
                    );
                    MeasuredLeg {
                        metrics: self.estimator.estimate(origin, destination),
                        estimated: true,
                    }
                }
            },
        };
        self.memo.insert(key, leg.clone());
        leg
    }
}

impl std::fmt::Debug for LegCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LegCache")
            .field("road", &self.road.is_some())
            .field("memoized", &self.memo.len())
            .finish()
    }
}
