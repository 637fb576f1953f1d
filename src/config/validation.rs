//! Configuration validation.
//!
//! Serde handles syntax; this checks value ranges and combinations.
//! Returns every error found, not just the first.

use std::fmt;

use crate::config::schema::PlannerConfig;

/// A single semantic problem in the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Validate a configuration.
pub fn validate_config(config: &PlannerConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if url::Url::parse(&config.provider.base_url).is_err() {
        errors.push(ValidationError::new("provider.base_url", "not a valid URL"));
    }
    if config.provider.timeout_secs == 0 {
        errors.push(ValidationError::new("provider.timeout_secs", "must be > 0"));
    }

    if config.rate_limit.max_in_flight == 0 {
        errors.push(ValidationError::new("rate_limit.max_in_flight", "must be > 0"));
    }
    if config.rate_limit.requests_per_window == 0 {
        errors.push(ValidationError::new("rate_limit.requests_per_window", "must be > 0"));
    }
    if config.rate_limit.window_ms == 0 {
        errors.push(ValidationError::new("rate_limit.window_ms", "must be > 0"));
    }

    if config.fallback.enabled {
        if url::Url::parse(&config.fallback.webdriver_url).is_err() {
            errors.push(ValidationError::new("fallback.webdriver_url", "not a valid URL"));
        }
        if url::Url::parse(&config.fallback.page_url).is_err() {
            errors.push(ValidationError::new("fallback.page_url", "not a valid URL"));
        }
        if config.fallback.requests_per_window == 0 || config.fallback.window_ms == 0 {
            errors.push(ValidationError::new("fallback.requests_per_window", "window must allow requests"));
        }
    }

    if config.retries.max_attempts == 0 {
        errors.push(ValidationError::new("retries.max_attempts", "must be >= 1"));
    }
    if config.retries.base_delay_ms > config.retries.max_delay_ms {
        errors.push(ValidationError::new("retries.base_delay_ms", "must not exceed max_delay_ms"));
    }

    if config.batch.concurrency == 0 {
        errors.push(ValidationError::new("batch.concurrency", "must be > 0"));
    }

    let routing = &config.routing;
    if routing.vehicle_count == 0 {
        errors.push(ValidationError::new("routing.vehicle_count", "must be > 0"));
    }
    if routing.capacity == Some(0) {
        errors.push(ValidationError::new("routing.capacity", "must be > 0 when set"));
    }
    if !(0.0..=10.0).contains(&routing.balance_tolerance) {
        errors.push(ValidationError::new("routing.balance_tolerance", "must be within 0..=10"));
    }
    if routing.estimate_speed_kmh <= 0.0 || !routing.estimate_speed_kmh.is_finite() {
        errors.push(ValidationError::new("routing.estimate_speed_kmh", "must be > 0"));
    }
    if let Some(depot) = routing.depot {
        if !depot.is_valid() {
            errors.push(ValidationError::new("routing.depot", "coordinate out of range"));
        }
    }

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<std::net::SocketAddr>().is_err()
    {
        errors.push(ValidationError::new("observability.metrics_address", "not a socket address"));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
