//! Configuration Error Types
//!
//! Errors raised while loading, merging and validating the sync configuration.

use crate::error::SyncError;
use thiserror::Error;

pub type ConfigResult<T> = Result<T, ConfigurationError>;

#[derive(Debug, Error)]
pub enum ConfigurationError {
    /// A source could not be read or parsed
    #[error("Failed to load configuration from '{source_name}': {error}")]
    LoadError { source_name: String, error: String },

    /// Merged sources could not be deserialized into the config structs
    #[error("Invalid configuration structure: {error}")]
    DeserializeError { error: String },

    /// Missing required configuration field
    #[error("Missing required configuration field '{field}' in {context}")]
    MissingRequiredField { field: String, context: String },

    /// Invalid configuration value
    #[error("Invalid value '{value}' for field '{field}': {context}")]
    InvalidValue {
        field: String,
        value: String,
        context: String,
    },
}

impl ConfigurationError {
    pub fn load_error<S: Into<String>, E: std::fmt::Display>(source_name: S, error: E) -> Self {
        Self::LoadError {
            source_name: source_name.into(),
            error: error.to_string(),
        }
    }

    pub fn missing_required_field<F: Into<String>, C: Into<String>>(field: F, context: C) -> Self {
        Self::MissingRequiredField {
            field: field.into(),
            context: context.into(),
        }
    }

    pub fn invalid_value<F: Into<String>, V: Into<String>, C: Into<String>>(
        field: F,
        value: V,
        context: C,
    ) -> Self {
        Self::InvalidValue {
            field: field.into(),
            value: value.into(),
            context: context.into(),
        }
    }
}

impl From<config::ConfigError> for ConfigurationError {
    fn from(err: config::ConfigError) -> Self {
        match err {
            config::ConfigError::FileParse { uri, cause } => Self::LoadError {
                source_name: uri.unwrap_or_else(|| "unknown".to_string()),
                error: cause.to_string(),
            },
            config::ConfigError::Foreign(cause) => Self::load_error("environment", cause),
            other => Self::DeserializeError {
                error: other.to_string(),
            },
        }
    }
}

impl From<ConfigurationError> for SyncError {
    fn from(err: ConfigurationError) -> Self {
        SyncError::Configuration(err.to_string())
    }
}
