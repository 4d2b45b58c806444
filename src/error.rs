//! # Sync Error Taxonomy
//!
//! Every failure the sync core can observe is expressed as a [`SyncError`]. The
//! variants line up with the four failure families the orchestration layer cares
//! about:
//!
//! - **Fatal**: authentication failures, malformed requests, permanent 4xx responses
//! - **Transient**: timeouts, connection resets, 5xx and 429 responses
//! - **Circuit open**: a derived condition raised before any call is attempted
//! - **Partial item failure**: reported per record, see [`crate::recovery`]
//!
//! Whether an error is worth retrying is decided by
//! [`crate::resilience::error_classifier`], never by the call site.

use std::time::Duration;

use crate::resilience::error_classifier::{ErrorClassifier, StandardErrorClassifier};

#[derive(Debug, Clone, thiserror::Error)]
pub enum SyncError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("HTTP {status} from {endpoint}: {message}")]
    Http {
        status: u16,
        endpoint: String,
        message: String,
    },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Rate limited by {service}")]
    RateLimited {
        service: String,
        retry_after: Option<Duration>,
    },

    #[error("Circuit breaker is open for {component} (retry in {}s)", .cooldown.as_secs())]
    CircuitOpen {
        component: String,
        cooldown: Duration,
    },

    #[error("Fatal error: {0}")]
    Fatal(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("{context} failed after {attempts} attempts: {original_error}")]
    RetryExhausted {
        context: String,
        attempts: u32,
        original_error: Box<SyncError>,
    },

    #[error("Invalid state transition: {0}")]
    InvalidTransition(String),
}

impl SyncError {
    pub fn database(message: impl Into<String>) -> Self {
        Self::Database(message.into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal(message.into())
    }

    pub fn http(status: u16, endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Http {
            status,
            endpoint: endpoint.into(),
            message: message.into(),
        }
    }

    /// Whether the standard classifier considers this error transient.
    pub fn is_retryable(&self) -> bool {
        StandardErrorClassifier::new().classify(self).is_retryable
    }

    /// Short machine-readable code used in envelopes, run records and API payloads.
    pub fn code(&self) -> &'static str {
        match self {
            SyncError::Database(_) => "database",
            SyncError::Http { .. } => "http",
            SyncError::Network(_) => "network",
            SyncError::Timeout(_) => "timeout",
            SyncError::RateLimited { .. } => "rate_limited",
            SyncError::CircuitOpen { .. } => "circuit_open",
            SyncError::Fatal(_) => "fatal",
            SyncError::Validation(_) => "validation",
            SyncError::Conflict(_) => "conflict",
            SyncError::NotFound(_) => "not_found",
            SyncError::Configuration(_) => "configuration",
            SyncError::Serialization(_) => "serialization",
            SyncError::RetryExhausted { .. } => "retry_exhausted",
            SyncError::InvalidTransition(_) => "invalid_transition",
        }
    }

    /// Unwrap a `RetryExhausted` wrapper down to the error that caused it.
    pub fn root_cause(&self) -> &SyncError {
        match self {
            SyncError::RetryExhausted { original_error, .. } => original_error.root_cause(),
            other => other,
        }
    }
}

impl From<sqlx::Error> for SyncError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => SyncError::NotFound("row not found".to_string()),
            sqlx::Error::PoolTimedOut => {
                SyncError::Timeout("timed out acquiring a database connection".to_string())
            }
            sqlx::Error::Io(e) => SyncError::Network(format!("database I/O: {e}")),
            other => SyncError::Database(other.to_string()),
        }
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        let endpoint = err
            .url()
            .map(|u| u.path().to_string())
            .unwrap_or_default();

        if err.is_timeout() {
            SyncError::Timeout(format!("request to {endpoint} timed out"))
        } else if let Some(status) = err.status() {
            SyncError::http(status.as_u16(), endpoint, err.to_string())
        } else if err.is_decode() {
            SyncError::Serialization(err.to_string())
        } else {
            SyncError::Network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
