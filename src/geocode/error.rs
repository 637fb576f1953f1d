//! Resolution error taxonomy.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced while resolving one address or measuring one leg.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    /// Timeout, connection failure, 5xx or undecodable response.
    #[error("transient network error: {0}")]
    Transient(String),

    /// Provider asked us to slow down (429, concurrency over quota).
    #[error("provider throttled the request: {0}")]
    Throttled(String),

    /// Provider refuses API traffic from this client (403, verification page, key/IP rejected).
    #[error("provider blocked automated traffic: {0}")]
    ProviderBlocked(String),

    /// This address cannot be resolved.
    #[error("address could not be resolved: {0}")]
    Unresolvable(String),

    /// Quota for the billing period is spent.
    #[error("provider quota exhausted: {0}")]
    QuotaExhausted(String),

    /// The run was cancelled.
    #[error("run cancelled")]
    Cancelled,
}

impl ResolveError {
    /// Worth another attempt against the same client.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ResolveError::Transient(_) | ResolveError::Throttled(_))
    }

    /// Signature of the provider rejecting us rather than this address.
    pub fn indicates_block(&self) -> bool {
        matches!(self, ResolveError::Throttled(_) | ResolveError::ProviderBlocked(_))
    }

    /// Label used in logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            ResolveError::Transient(_) => "transient",
            ResolveError::Throttled(_) => "throttled",
            ResolveError::ProviderBlocked(_) => "blocked",
            ResolveError::Unresolvable(_) => "unresolvable",
            ResolveError::QuotaExhausted(_) => "quota_exhausted",
            ResolveError::Cancelled => "cancelled",
        }
    }
}

/// Result type for provider calls.
pub type ResolveResult<T> = Result<T, ResolveError>;

/// Why an address ended up in the unresolved report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    Unresolvable,
    QuotaExhausted,
    Cancelled,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::Unresolvable => "unresolvable",
            FailureReason::QuotaExhausted => "quota_exhausted",
            FailureReason::Cancelled => "cancelled",
        }
    }
}

impl From<&ResolveError> for FailureReason {
    fn from(err: &ResolveError) -> Self {
        match err {
            ResolveError::QuotaExhausted(_) => FailureReason::QuotaExhausted,
            ResolveError::Cancelled => FailureReason::Cancelled,
            _ => FailureReason::Unresolvable,
        }
    }
}
