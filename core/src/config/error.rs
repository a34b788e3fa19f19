use std::path::PathBuf;
use thiserror::Error;

use crate::geo::GeoError;

/// Errors that can occur during configuration loading and validation
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    LoadError(String),

    #[error("Configuration file not found at path: {0}")]
    FileNotFound(PathBuf),

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Invalid configuration value: {0}")]
    ValidationError(String),

    #[error("Failed to render configuration: {0}")]
    RenderError(String),
}

/// Result of loading or validating a [`SimulatorConfig`](super::SimulatorConfig).
pub type Result<T> = std::result::Result<T, ConfigError>;

impl From<::config::ConfigError> for ConfigError {
    fn from(err: ::config::ConfigError) -> Self {
        ConfigError::LoadError(err.to_string())
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self {
        ConfigError::ParseError(err.to_string())
    }
}

impl From<toml::ser::Error> for ConfigError {
    fn from(err: toml::ser::Error) -> Self {
        ConfigError::RenderError(err.to_string())
    }
}

impl From<GeoError> for ConfigError {
    fn from(err: GeoError) -> Self {
        ConfigError::ValidationError(err.to_string())
    }
}
