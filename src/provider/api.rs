//! Map provider REST API client.
//!
//! # Responsibilities
//! - Geocode an address (`geocoding/v3`)
//! - Measure a driving leg (`directionlite/v1/driving`)
//! - Classify every failure into the resolution error taxonomy
//!
//! # Status classification
//! ```text
//! HTTP 403, HTML body, status 3/5/101/102/2xx  → ProviderBlocked
//! HTTP 429, status 401/402                     → Throttled
//! timeout, connect error, 5xx, bad JSON, 1     → Transient
//! status 4, 3xx                                → QuotaExhausted
//! status 2, other 4xx, no location/route       → Unresolvable
//! ```

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use crate::clock::{Clock, SystemClock};
use crate::config::ProviderConfig;
use crate::geocode::{
    Coordinate, GeocodeResult, NormalizedAddress, Precision, ResolutionSource, ResolveError,
    ResolveResult, RouteMetrics,
};
use crate::observability::metrics;
use crate::provider::{parse_base_url, GeocodeProvider, ProviderInitError};
use crate::resilience::timeouts::with_deadline;
use crate::throttle::RateLimiter;

const GEOCODE_PATH: &str = "geocoding/v3/";
const DRIVING_PATH: &str = "directionlite/v1/driving";
const NO_RESULT_MARKERS: [&str; 3] = ["无相关结果", "no result", "no results"];

/// Client for the provider's web API.
#[derive(Clone)]
pub struct MapApiClient {
    http: reqwest::Client,
    base_url: Url,
    access_key: String,
    city: Option<String>,
    tactics: u8,
    timeout: Duration,
    limiter: Arc<RateLimiter>,
    clock: Arc<dyn Clock>,
}

#[derive(Debug, Deserialize)]
struct Location {
    lng: f64,
    lat: f64,
}

#[derive(Debug, Deserialize)]
struct GeocodeBody {
    location: Option<Location>,
    #[serde(default)]
    precise: i64,
    #[serde(default)]
    confidence: i64,
    #[serde(default)]
    level: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DrivingStep {
    #[serde(default)]
    path: String,
}

#[derive(Debug, Deserialize)]
struct DrivingRoute {
    #[serde(default)]
    distance: f64,
    #[serde(default)]
    duration: f64,
    #[serde(default)]
    steps: Vec<DrivingStep>,
}

#[derive(Debug, Deserialize)]
struct DrivingBody {
    #[serde(default)]
    routes: Vec<DrivingRoute>,
}

impl MapApiClient {
    /// Create a client sharing `limiter` with every other API caller.
    pub fn new(config: &ProviderConfig, limiter: Arc<RateLimiter>) -> Result<Self, ProviderInitError> {
        if config.access_key.trim().is_empty() {
            return Err(ProviderInitError::MissingAccessKey);
        }
        let base_url = parse_base_url(&config.base_url)?;
        let http = reqwest::Client::builder()
            .user_agent(concat!("route-system/", env!("CARGO_PKG_VERSION")))
            .build()?;

        tracing::info!(
            base_url = %base_url,
            timeout_secs = config.timeout_secs,
            "Map API client initialized"
        );

        Ok(Self {
            http,
            base_url,
            access_key: config.access_key.trim().to_string(),
            city: config.city.clone(),
            tactics: config.tactics,
            timeout: Duration::from_secs(config.timeout_secs),
            limiter,
            clock: Arc::new(SystemClock),
        })
    }

    /// Replace the timestamp source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn endpoint(&self, path: &str) -> ResolveResult<Url> {
        self.base_url
            .join(path)
            .map_err(|e| ResolveError::Unresolvable(format!("bad endpoint {}: {}", path, e)))
    }

    /// Issue one GET under a limiter permit and return the decoded, status-checked body.
    async fn get_json(&self, url: Url, query: &[(&str, String)], what: &'static str) -> ResolveResult<Value> {
        let permit = self
            .limiter
            .acquire()
            .await
            .map_err(|e| ResolveError::Transient(e.to_string()))?;

        let request = self.http.get(url).query(query);
        let result = with_deadline(self.timeout, what, async move {
            let response = request.send().await.map_err(classify_transport)?;
            let status = response.status();
            let text = response.text().await.map_err(classify_transport)?;
            decode_body(status, &text)
        })
        .await;

        permit.release();
        result
    }

    /// Geocode a normalized address.
    pub async fn geocode_address(&self, address: &NormalizedAddress) -> ResolveResult<GeocodeResult> {
        if address.is_empty() {
            return Err(ResolveError::Unresolvable("empty address".into()));
        }
        let mut query = vec![
            ("address", address.as_str().to_string()),
            ("output", "json".to_string()),
            ("ret_coordtype", "bd09ll".to_string()),
            ("ak", self.access_key.clone()),
        ];
        if let Some(city) = &self.city {
            query.push(("city", city.clone()));
        }

        let url = self.endpoint(GEOCODE_PATH)?;
        let outcome = self
            .get_json(url, &query, "geocode")
            .await
            .and_then(|body| parse_geocode(address, body, self.clock.now_unix()));

        metrics::record_geocode_request("api", outcome_label(&outcome));
        match &outcome {
            Ok(r) => tracing::debug!(address = %address, location = %r.location, confidence = r.confidence, "Geocoded via API"),
            Err(e) => tracing::debug!(address = %address, error = %e, "API geocode failed"),
        }
        outcome
    }

    /// Driving distance/duration from `origin` to `destination`.
    pub async fn route_metrics(&self, origin: Coordinate, destination: Coordinate) -> ResolveResult<RouteMetrics> {
        let query = vec![
            ("origin", origin.to_query()),
            ("destination", destination.to_query()),
            ("coord_type", "bd09ll".to_string()),
            ("ret_coordtype", "bd09ll".to_string()),
            ("steps_info", "1".to_string()),
            ("tactics", self.tactics.to_string()),
            ("ak", self.access_key.clone()),
        ];
        let url = self.endpoint(DRIVING_PATH)?;
        let outcome = self.get_json(url, &query, "route metrics").await.and_then(parse_driving);
        metrics::record_geocode_request("api_route", outcome_label(&outcome));
        outcome
    }
}

#[async_trait]
impl GeocodeProvider for MapApiClient {
    fn source(&self) -> ResolutionSource {
        ResolutionSource::Api
    }

    async fn geocode(&self, address: &NormalizedAddress) -> ResolveResult<GeocodeResult> {
        self.geocode_address(address).await
    }
}

impl std::fmt::Debug for MapApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MapApiClient")
            .field("base_url", &self.base_url.as_str())
            .field("timeout_secs", &self.timeout.as_secs())
            .finish()
    }
}

fn outcome_label<T>(outcome: &ResolveResult<T>) -> &'static str {
    match outcome {
        Ok(_) => "ok",
        Err(e) => e.kind(),
    }
}

fn classify_transport(err: reqwest::Error) -> ResolveError {
    if err.is_timeout() {
        ResolveError::Transient(format!("request timed out: {}", err))
    } else if err.is_connect() {
        ResolveError::Transient(format!("connection failed: {}", err))
    } else {
        ResolveError::Transient(format!("request failed: {}", err))
    }
}

/// Classify the HTTP layer, then the provider status inside the JSON envelope.
fn decode_body(status: StatusCode, text: &str) -> ResolveResult<Value> {
    if status == StatusCode::FORBIDDEN {
        return Err(ResolveError::ProviderBlocked(format!("HTTP {}", status)));
    }
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(ResolveError::Throttled(format!("HTTP {}", status)));
    }
    if status.is_server_error() {
        return Err(ResolveError::Transient(format!("HTTP {}", status)));
    }
    if !status.is_success() {
        return Err(ResolveError::Unresolvable(format!("HTTP {}", status)));
    }

    let trimmed = text.trim_start();
    if trimmed.starts_with('<') {
        return Err(ResolveError::ProviderBlocked("verification page instead of JSON".into()));
    }
    let body: Value = serde_json::from_str(trimmed)
        .map_err(|e| ResolveError::Transient(format!("malformed response: {}", e)))?;

    let code = provider_status(&body)
        .ok_or_else(|| ResolveError::Transient("response without status".into()))?;
    let message = body
        .get("message")
        .or_else(|| body.get("msg"))
        .and_then(Value::as_str)
        .unwrap_or_default();
    classify_status(code, message)?;
    Ok(body)
}

fn provider_status(body: &Value) -> Option<i64> {
    match body.get("status")? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Map a provider status code to the taxonomy. `0` is success.
pub fn classify_status(code: i64, message: &str) -> ResolveResult<()> {
    let detail = || format!("status {}: {}", code, message);
    match code {
        0 => Ok(()),
        1 if NO_RESULT_MARKERS.iter().any(|m| message.to_lowercase().contains(m)) => {
            Err(ResolveError::Unresolvable(detail()))
        }
        1 => Err(ResolveError::Transient(detail())),
        2 => Err(ResolveError::Unresolvable(detail())),
        3 | 5 | 101 | 102 | 200..=299 => Err(ResolveError::ProviderBlocked(detail())),
        401 | 402 => Err(ResolveError::Throttled(detail())),
        4 | 300..=399 => Err(ResolveError::QuotaExhausted(detail())),
        _ => Err(ResolveError::Unresolvable(detail())),
    }
}

fn parse_geocode(address: &NormalizedAddress, body: Value, now: u64) -> ResolveResult<GeocodeResult> {
    let result = body
        .get("result")
        .cloned()
        .ok_or_else(|| ResolveError::Unresolvable("no result".into()))?;
    let parsed: GeocodeBody = serde_json::from_value(result)
        .map_err(|e| ResolveError::Transient(format!("malformed geocode result: {}", e)))?;
    let location = parsed
        .location
        .map(|l| Coordinate::new(l.lng, l.lat))
        .filter(Coordinate::is_valid)
        .ok_or_else(|| ResolveError::Unresolvable("no location in result".into()))?;

    Ok(GeocodeResult {
        location,
        formatted_address: address.as_str().to_string(),
        confidence: parsed.confidence.clamp(0, 100) as u8,
        precision: Precision::from_provider(parsed.level.as_deref(), parsed.precise == 1),
        source: ResolutionSource::Api,
        resolved_at: now,
    })
}

fn parse_driving(body: Value) -> ResolveResult<RouteMetrics> {
    let result = body
        .get("result")
        .cloned()
        .ok_or_else(|| ResolveError::Unresolvable("no route result".into()))?;
    let parsed: DrivingBody = serde_json::from_value(result)
        .map_err(|e| ResolveError::Transient(format!("malformed route result: {}", e)))?;
    let route = parsed
        .routes
        .into_iter()
        .next()
        .ok_or_else(|| ResolveError::Unresolvable("no route between points".into()))?;

    let mut polyline: Vec<Coordinate> = Vec::new();
    for step in &route.steps {
        for point in parse_path(&step.path) {
            if polyline.last() != Some(&point) {
                polyline.push(point);
            }
        }
    }

    Ok(RouteMetrics {
        distance_m: route.distance.max(0.0).round() as u64,
        duration_s: route.duration.max(0.0).round() as u64,
        polyline,
    })
}

/// Parse `"lng,lat;lng,lat;..."`, skipping malformed pairs.
pub fn parse_path(path: &str) -> impl Iterator<Item = Coordinate> + '_ {
    path.split(';').filter_map(|pair| {
        let (lng, lat) = pair.split_once(',')?;
        let point = Coordinate::new(lng.trim().parse().ok()?, lat.trim().parse().ok()?);
        point.is_valid().then_some(point)
    })
}
