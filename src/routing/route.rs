//! Planned routes.

use serde::Serialize;

use crate::geocode::{Coordinate, ResolvedStop};
use crate::routing::geo::{farthest_pair, polyline_midpoint};
use crate::routing::legs::MeasuredLeg;

/// Travel between two consecutive stops of a route.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Leg {
    /// Positions within the route.
    pub from: usize,
    pub to: usize,
    pub distance_m: u64,
    pub duration_s: u64,
    /// Halfway point along the driven path, when the provider returned one.
    pub midpoint: Option<Coordinate>,
    /// Straight-line estimate rather than a measured road leg.
    pub estimated: bool,
}

/// The two stops of a route farthest apart as the crow flies.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FarthestPair {
    pub first: usize,
    pub second: usize,
    pub distance_m: u64,
}

/// An ordered sequence of stops for one vehicle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Route {
    vehicle: usize,
    stops: Vec<ResolvedStop>,
    legs: Vec<Leg>,
    distance_m: u64,
    duration_s: u64,
    service_s: u64,
    farthest_pair: Option<FarthestPair>,
}

impl Route {
    /// `measured[i]` is the leg from `stops[i]` to `stops[i + 1]`.
    pub(crate) fn new(vehicle: usize, stops: Vec<ResolvedStop>, measured: Vec<MeasuredLeg>) -> Self {
        let legs: Vec<Leg> = measured
            .into_iter()
            .enumerate()
            .map(|(i, m)| Leg {
                from: i,
                to: i + 1,
                distance_m: m.metrics.distance_m,
                duration_s: m.metrics.duration_s,
                midpoint: if m.estimated { None } else { polyline_midpoint(&m.metrics.polyline) },
                estimated: m.estimated,
            })
            .collect();

        let points: Vec<Coordinate> = stops.iter().map(ResolvedStop::location).collect();
        let farthest_pair = farthest_pair(&points).map(|(first, second, d)| FarthestPair {
            first,
            second,
            distance_m: d.round() as u64,
        });

        Self {
            vehicle,
            distance_m: legs.iter().map(|l| l.distance_m).sum(),
            duration_s: legs.iter().map(|l| l.duration_s).sum(),
            service_s: stops
                .iter()
                .map(|s| u64::from(s.record.service_time_secs.unwrap_or(0)))
                .sum(),
            stops,
            legs,
            farthest_pair,
        }
    }

    /// Zero-based vehicle number.
    pub fn vehicle(&self) -> usize {
        self.vehicle
    }

    pub fn stops(&self) -> &[ResolvedStop] {
        &self.stops
    }

    pub fn legs(&self) -> &[Leg] {
        &self.legs
    }

    pub fn len(&self) -> usize {
        self.stops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stops.is_empty()
    }

    /// Driving distance over all legs.
    pub fn distance_m(&self) -> u64 {
        self.distance_m
    }

    /// Driving time over all legs.
    pub fn duration_s(&self) -> u64 {
        self.duration_s
    }

    /// Driving time plus time spent at the stops.
    pub fn total_time_s(&self) -> u64 {
        self.duration_s + self.service_s
    }

    pub fn longest_leg_m(&self) -> u64 {
        self.legs.iter().map(|l| l.distance_m).max().unwrap_or(0)
    }

    pub fn farthest_pair(&self) -> Option<&FarthestPair> {
        self.farthest_pair.as_ref()
    }

    /// Input batch positions in visiting order.
    pub fn stop_indices(&self) -> Vec<usize> {
        self.stops.iter().map(|s| s.index).collect()
    }
}
