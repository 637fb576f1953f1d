//! Startup orchestration.
//!
//! # Responsibilities
//! - Open the persistent cache
//! - Build limiters and provider clients from configuration
//! - Assemble the batch runner
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal
//! - Subsystems initialize in order, not concurrently
//! - The API client is shared by geocoding and leg measurement, so both draw on one budget

use std::sync::Arc;
use thiserror::Error;

use crate::cache::AddressCache;
use crate::config::{LegSource, PlannerConfig};
use crate::pipeline::BatchRunner;
use crate::provider::{BrowserFallbackClient, MapApiClient, ProviderInitError};
use crate::resilience::{BlockCircuit, RetryPolicy};
use crate::routing::{PlanParams, StraightLine};
use crate::throttle::RateLimiter;

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("failed to open cache {path}: {source}")]
    Cache {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to create provider client: {0}")]
    Provider(#[from] ProviderInitError),
}

/// Open the configured cache, or an in-memory one when no path is set.
pub fn open_cache(config: &PlannerConfig) -> Result<AddressCache, StartupError> {
    match &config.cache.path {
        Some(path) => AddressCache::open(path, config.cache.max_age_secs).map_err(|source| StartupError::Cache {
            path: path.clone(),
            source,
        }),
        None => Ok(AddressCache::in_memory(config.cache.max_age_secs)),
    }
}

/// Build a runner wired to the real provider.
pub fn build_runner(config: &PlannerConfig) -> Result<BatchRunner, StartupError> {
    let cache = open_cache(config)?;

    let api_limiter = Arc::new(RateLimiter::from_config("api", &config.rate_limit));
    let api = MapApiClient::new(&config.provider, api_limiter)?;

    let mut runner = BatchRunner::new(cache, Arc::new(api.clone()))
        .with_retry(RetryPolicy::new(&config.retries))
        .with_circuit(Arc::new(BlockCircuit::new(&config.circuit)))
        .with_plan_params(PlanParams::from_config(&config.routing))
        .with_estimator(StraightLine::new(config.routing.estimate_speed_kmh))
        .with_concurrency(config.batch.concurrency);

    if config.routing.legs == LegSource::Road {
        runner = runner.with_road_legs(Arc::new(api));
    }

    if config.fallback.enabled {
        let limiter = Arc::new(BrowserFallbackClient::limiter_for(&config.fallback));
        let browser = BrowserFallbackClient::new(&config.fallback, config.provider.city.clone(), limiter)?;
        tracing::info!(
            webdriver_url = %config.fallback.webdriver_url,
            browser = %config.fallback.browser_name,
            "Browser fallback ready"
        );
        runner = runner.with_fallback(Arc::new(browser));
    }

    Ok(runner)
}
