//! Route optimizer: cluster, sequence, measure.

use futures_util::stream::{self, StreamExt};
use thiserror::Error;

use crate::config::RoutingConfig;
use crate::geocode::{Coordinate, ResolvedStop};
use crate::observability::metrics;
use crate::routing::cluster::sweep_clusters;
use crate::routing::geo::{centroid, haversine_m};
use crate::routing::legs::{LegCache, MeasuredLeg};
use crate::routing::route::Route;
use crate::routing::sequence::{self, CostMatrix, SequenceOptions, Start};

/// Concurrent leg measurements while filling a road matrix.
const MATRIX_CONCURRENCY: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    #[error("{stops} stops do not fit on {vehicles} vehicles of capacity {capacity}")]
    CapacityExceeded {
        stops: usize,
        vehicles: usize,
        capacity: usize,
    },

    #[error("invalid plan parameters: {0}")]
    InvalidParams(String),
}

/// Parameters for one optimization.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanParams {
    pub vehicle_count: usize,
    pub capacity: Option<usize>,
    pub balance_tolerance: f64,
    pub depot: Option<Coordinate>,
    pub start_name: Option<String>,
    pub improvement_passes: u32,
    pub restarts: u32,
    pub seed: u64,
    pub road_matrix_limit: usize,
}

impl PlanParams {
    pub fn from_config(config: &RoutingConfig) -> Self {
        Self {
            vehicle_count: config.vehicle_count,
            capacity: config.capacity,
            balance_tolerance: config.balance_tolerance,
            depot: config.depot,
            start_name: config.start_name.clone(),
            improvement_passes: config.improvement_passes,
            restarts: config.restarts,
            seed: config.seed,
            road_matrix_limit: config.road_matrix_limit,
        }
    }

    /// Reject parameters no batch could be planned with.
    pub fn validate(&self) -> Result<(), PlanError> {
        if self.vehicle_count == 0 {
            return Err(PlanError::InvalidParams("vehicle_count must be at least 1".into()));
        }
        if self.capacity == Some(0) {
            return Err(PlanError::InvalidParams("capacity must be at least 1".into()));
        }
        Ok(())
    }

    /// Number of routes for `n` stops, or why they cannot be planned.
    pub fn route_count(&self, n: usize) -> Result<usize, PlanError> {
        self.validate()?;
        let needed = match self.capacity {
            Some(cap) => n.div_ceil(cap),
            None => 1,
        };
        if needed > self.vehicle_count {
            return Err(PlanError::CapacityExceeded {
                stops: n,
                vehicles: self.vehicle_count,
                capacity: self.capacity.unwrap_or(n),
            });
        }
        Ok(needed.max(self.vehicle_count.min(n)))
    }

    fn sequence_options(&self) -> SequenceOptions {
        SequenceOptions {
            restarts: self.restarts,
            improvement_passes: self.improvement_passes,
            seed: self.seed,
        }
    }
}

impl Default for PlanParams {
    fn default() -> Self {
        Self::from_config(&RoutingConfig::default())
    }
}

/// Turns resolved stops into routes.
#[derive(Debug)]
pub struct RouteOptimizer {
    legs: LegCache,
}

impl RouteOptimizer {
    pub fn new(legs: LegCache) -> Self {
        Self { legs }
    }

    pub fn legs(&self) -> &LegCache {
        &self.legs
    }

    /// Cluster `stops` into vehicles and order each cluster.
    ///
    /// Every input stop appears in exactly one route. Output is deterministic
    /// for a fixed input and seed.
    pub async fn optimize(&self, stops: Vec<ResolvedStop>, params: &PlanParams) -> Result<Vec<Route>, PlanError> {
        let n = stops.len();
        if n == 0 {
            return Ok(Vec::new());
        }
        let k = params.route_count(n)?;

        let points: Vec<Coordinate> = stops.iter().map(ResolvedStop::location).collect();
        let center = params
            .depot
            .or_else(|| centroid(&points))
            .unwrap_or(Coordinate::new(0.0, 0.0));
        let clusters = sweep_clusters(&points, center, k, params.balance_tolerance, params.capacity);
        tracing::info!(stops = n, routes = clusters.len(), "Stops clustered");

        let mut slots: Vec<Option<ResolvedStop>> = stops.into_iter().map(Some).collect();
        let mut routes = Vec::with_capacity(clusters.len());
        for (vehicle, members) in clusters.into_iter().enumerate() {
            let cluster: Vec<ResolvedStop> = members.iter().filter_map(|&i| slots[i].take()).collect();
            let ordered = self.order_cluster(cluster, center, params).await;
            let route = self.build_route(vehicle, ordered).await;
            tracing::debug!(
                vehicle,
                stops = route.len(),
                distance_m = route.distance_m(),
                duration_s = route.duration_s(),
                "Route planned"
            );
            routes.push(route);
        }

        metrics::record_routes_planned(routes.len());
        Ok(routes)
    }

    /// One route visiting `stops` exactly in the given order.
    pub async fn measure_in_order(&self, stops: Vec<ResolvedStop>) -> Route {
        self.build_route(0, stops).await
    }

    async fn order_cluster(&self, stops: Vec<ResolvedStop>, center: Coordinate, params: &PlanParams) -> Vec<ResolvedStop> {
        if stops.len() < 2 {
            return stops;
        }
        let points: Vec<Coordinate> = stops.iter().map(ResolvedStop::location).collect();
        let costs = if self.legs.has_road_source() && stops.len() <= params.road_matrix_limit {
            self.road_matrix(&points).await
        } else {
            straight_matrix(&points)
        };

        let named = params
            .start_name
            .as_deref()
            .and_then(|name| stops.iter().position(|s| s.label() == name || s.record.address == name));
        let start = match named {
            Some(i) => Start::Fixed(i),
            None => Start::Preferred(nearest_to(&points, center)),
        };

        let order = sequence::sequence(&costs, start, params.sequence_options());
        let mut slots: Vec<Option<ResolvedStop>> = stops.into_iter().map(Some).collect();
        order.into_iter().filter_map(|i| slots[i].take()).collect()
    }

    async fn road_matrix(&self, points: &[Coordinate]) -> CostMatrix {
        let n = points.len();
        let pairs: Vec<(usize, usize)> = (0..n)
            .flat_map(|i| (0..n).filter(move |&j| j != i).map(move |j| (i, j)))
            .collect();
        let measured: Vec<(usize, usize, u64)> = stream::iter(pairs)
            .map(|(i, j)| async move {
                let leg = self.legs.measure(points[i], points[j]).await;
                (i, j, leg.metrics.distance_m)
            })
            .buffer_unordered(MATRIX_CONCURRENCY)
            .collect()
            .await;

        let mut costs = vec![vec![0; n]; n];
        for (i, j, d) in measured {
            costs[i][j] = d;
        }
        costs
    }

    async fn build_route(&self, vehicle: usize, stops: Vec<ResolvedStop>) -> Route {
        let mut legs: Vec<MeasuredLeg> = Vec::with_capacity(stops.len().saturating_sub(1));
        for pair in stops.windows(2) {
            legs.push(self.legs.measure(pair[0].location(), pair[1].location()).await);
        }
        Route::new(vehicle, stops, legs)
    }
}

fn straight_matrix(points: &[Coordinate]) -> CostMatrix {
    points
        .iter()
        .map(|a| points.iter().map(|b| haversine_m(*a, *b).round() as u64).collect())
        .collect()
}

fn nearest_to(points: &[Coordinate], center: Coordinate) -> usize {
    points
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| haversine_m(**a, center).total_cmp(&haversine_m(**b, center)))
        .map(|(i, _)| i)
        .unwrap_or(0)
}
