//! Metrics collection and exposition.
//!
//! # Metrics
//! - `geocode_requests_total` (counter): provider calls by source, outcome
//! - `cache_lookups_total` (counter): cache lookups by result
//! - `rate_limiter_wait_seconds` (histogram): time spent waiting for a permit
//! - `addresses_unresolved_total` (counter): unresolved addresses by reason
//! - `routes_planned_total` (counter): routes produced
//! - `route_legs_measured_total` (counter): leg metric lookups by outcome
//!
//! All recorders are no-ops until an exporter is installed.

use metrics::{counter, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::time::Duration;

/// Install the Prometheus exporter on `addr`. Needs a running Tokio runtime.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_geocode_request(source: &'static str, outcome: &'static str) {
    counter!("geocode_requests_total", "source" => source, "outcome" => outcome).increment(1);
}

pub fn record_cache_lookup(result: &'static str) {
    counter!("cache_lookups_total", "result" => result).increment(1);
}

pub fn record_limiter_wait(limiter: &'static str, waited: Duration) {
    histogram!("rate_limiter_wait_seconds", "limiter" => limiter).record(waited.as_secs_f64());
}

pub fn record_unresolved(reason: &'static str) {
    counter!("addresses_unresolved_total", "reason" => reason).increment(1);
}

pub fn record_routes_planned(count: usize) {
    counter!("routes_planned_total").increment(count as u64);
}

pub fn record_leg_measured(outcome: &'static str) {
    counter!("route_legs_measured_total", "outcome" => outcome).increment(1);
}
