//! Geocode providers.
//!
//! # Data Flow
//! ```text
//! ResolutionPipeline
//!     → GeocodeProvider (trait)
//!         → api.rs     (provider REST API, reqwest)
//!         → browser.rs (WebDriver-driven map page, reqwest)
//!     each call: RateLimiter permit → request with deadline → classify
//! ```
//!
//! # Design Decisions
//! - The pipeline only sees the trait; it never knows which mechanism resolved an address
//! - Classification into the ResolveError taxonomy happens here, at the edge
//! - Clients hold no mutable state beyond the shared limiter (and the browser session)

pub mod api;
pub mod browser;

use async_trait::async_trait;
use thiserror::Error;

use crate::geocode::{GeocodeResult, NormalizedAddress, ResolutionSource, ResolveResult};

pub use api::MapApiClient;
pub use browser::BrowserFallbackClient;

/// Capability shared by every resolution strategy.
#[async_trait]
pub trait GeocodeProvider: Send + Sync {
    /// Label stamped on results.
    fn source(&self) -> ResolutionSource;

    /// Resolve one normalized address.
    async fn geocode(&self, address: &NormalizedAddress) -> ResolveResult<GeocodeResult>;

    /// Release run-scoped resources. Called once when a run ends.
    async fn shutdown(&self) {}
}

/// Errors constructing a provider client.
#[derive(Debug, Error)]
pub enum ProviderInitError {
    #[error("invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("provider access key is not configured (set provider.access_key or BAIDU_WEB_AK)")]
    MissingAccessKey,

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
}

pub(crate) fn parse_base_url(raw: &str) -> Result<url::Url, ProviderInitError> {
    // Trailing slash so relative joins keep the base path.
    let with_slash = if raw.ends_with('/') {
        raw.to_string()
    } else {
        format!("{}/", raw)
    };
    url::Url::parse(&with_slash).map_err(|e| ProviderInitError::InvalidUrl {
        url: raw.to_string(),
        reason: e.to_string(),
    })
}
