//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the planner.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};

use crate::geocode::Coordinate;

/// Root configuration for a planning run.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct PlannerConfig {
    /// Map provider REST API.
    pub provider: ProviderConfig,

    /// Limits for traffic to the provider API.
    pub rate_limit: RateLimitConfig,

    /// Browser fallback settings.
    pub fallback: FallbackConfig,

    /// Retry configuration.
    pub retries: RetryConfig,

    /// Provider block circuit.
    pub circuit: CircuitConfig,

    /// Persistent address cache.
    pub cache: CacheConfig,

    /// Batch fan-out.
    pub batch: BatchConfig,

    /// Route clustering and sequencing.
    pub routing: RoutingConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Provider REST API configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Base URL of the web API.
    pub base_url: String,

    /// Access key (`ak`). `BAIDU_WEB_AK` overrides it at load time.
    pub access_key: String,

    /// Per-call timeout in seconds.
    pub timeout_secs: u64,

    /// Optional city hint passed to the geocoder.
    pub city: Option<String>,

    /// Driving tactics for route metrics (0 = no highways, 1 = fastest, 2 = shortest).
    pub tactics: u8,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.map.baidu.com".to_string(),
            access_key: String::new(),
            timeout_secs: 20,
            city: None,
            tactics: 0,
        }
    }
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Maximum simultaneous requests.
    pub max_in_flight: usize,

    /// Maximum requests granted inside one rolling window.
    pub requests_per_window: u32,

    /// Rolling window length in milliseconds.
    pub window_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 3,
            requests_per_window: 30,
            window_ms: 1000,
        }
    }
}

/// Browser fallback configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FallbackConfig {
    /// Use the browser when the API blocks us.
    pub enabled: bool,

    /// WebDriver endpoint (msedgedriver by default).
    pub webdriver_url: String,

    /// WebDriver browser name.
    pub browser_name: String,

    /// Attach to a browser started with `--remote-debugging-port` (e.g. "127.0.0.1:9222").
    pub debugger_address: Option<String>,

    /// Run a fresh browser headless. Ignored when attaching.
    pub headless: bool,

    /// Interactive map page that loads the provider's JS geocoder.
    pub page_url: String,

    /// Page load timeout in seconds.
    pub page_load_timeout_secs: u64,

    /// Script timeout for one geocode in seconds.
    pub script_timeout_secs: u64,

    /// Browser calls allowed per rolling window.
    pub requests_per_window: u32,

    /// Rolling window length in milliseconds.
    pub window_ms: u64,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            webdriver_url: "http://127.0.0.1:9515".to_string(),
            browser_name: "MicrosoftEdge".to_string(),
            debugger_address: None,
            headless: true,
            page_url: "https://api.map.baidu.com/lbsapi/getpoint/index.html".to_string(),
            page_load_timeout_secs: 120,
            script_timeout_secs: 15,
            requests_per_window: 6,
            window_ms: 10_000,
        }
    }
}

/// Retry configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum API attempts per address, first call included.
    pub max_attempts: u32,

    /// Base delay for exponential backoff in milliseconds.
    pub base_delay_ms: u64,

    /// Maximum delay for exponential backoff in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 200,
            max_delay_ms: 5000,
        }
    }
}

/// Provider block circuit configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CircuitConfig {
    /// Consecutive blocked addresses before the API is skipped. 0 disables the circuit.
    pub failure_threshold: u32,

    /// Seconds the API is skipped before a probe.
    pub cooldown_secs: u64,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown_secs: 60,
        }
    }
}

/// Address cache configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Cache file. `None` keeps the cache in memory only.
    pub path: Option<String>,

    /// Entries older than this are re-resolved.
    pub max_age_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            path: Some("geocode_cache.json".to_string()),
            max_age_secs: 30 * 24 * 3600,
        }
    }
}

/// Batch fan-out configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Addresses resolved concurrently.
    pub concurrency: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self { concurrency: 8 }
    }
}

/// Which leg costs the sequencer uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LegSource {
    /// Driving metrics from the provider.
    Road,
    /// Great-circle estimate, no provider calls.
    Straight,
}

/// Route optimization configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Maximum number of routes.
    pub vehicle_count: usize,

    /// Maximum stops per route.
    pub capacity: Option<usize>,

    /// Allowed cluster size overshoot over the even share, as a fraction.
    pub balance_tolerance: f64,

    /// Center for the angular sweep. Defaults to the stops' centroid.
    pub depot: Option<Coordinate>,

    /// Stop label to start each sequence from when present in the cluster.
    pub start_name: Option<String>,

    /// Pairwise exchange passes per route.
    pub improvement_passes: u32,

    /// Extra seeded nearest-neighbour starts.
    pub restarts: u32,

    /// Seed for the extra starts.
    pub seed: u64,

    /// Leg cost source.
    pub legs: LegSource,

    /// Largest cluster ordered on a full road matrix.
    pub road_matrix_limit: usize,

    /// Speed used for straight-line duration estimates.
    pub estimate_speed_kmh: f64,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            vehicle_count: 1,
            capacity: None,
            balance_tolerance: 0.2,
            depot: None,
            start_name: None,
            improvement_passes: 50,
            restarts: 4,
            seed: 42,
            legs: LegSource::Road,
            road_matrix_limit: 25,
            estimate_speed_kmh: 30.0,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Emit JSON log lines.
    pub json_logs: bool,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}
