//! Configuration loading from disk.

use std::fs;
use std::path::Path;
use thiserror::Error;

use crate::config::schema::PlannerConfig;
use crate::config::validation::{validate_config, ValidationError};

/// Environment variable that overrides `provider.access_key`.
pub const ACCESS_KEY_ENV: &str = "BAIDU_WEB_AK";

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation failed: {}", join_errors(.0))]
    Validation(Vec<ValidationError>),
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Load and validate configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<PlannerConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    parse_config(&content)
}

/// Parse, apply environment overrides and validate.
pub fn parse_config(content: &str) -> Result<PlannerConfig, ConfigError> {
    let mut config: PlannerConfig = toml::from_str(content)?;
    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    validate_config(&config).map_err(ConfigError::Validation)?;
    Ok(config)
}

/// Defaults plus environment overrides, validated.
pub fn default_config() -> Result<PlannerConfig, ConfigError> {
    parse_config("")
}

fn apply_env_overrides(config: &mut PlannerConfig, env: impl Fn(&str) -> Option<String>) {
    if let Some(key) = env(ACCESS_KEY_ENV).filter(|k| !k.trim().is_empty()) {
        tracing::debug!("Access key taken from {}", ACCESS_KEY_ENV);
        config.provider.access_key = key.trim().to_string();
    }
}
