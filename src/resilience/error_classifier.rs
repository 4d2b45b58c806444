//! # Error Classification
//!
//! Decides whether a failure is worth retrying. This is the single place where
//! transport-level signals (HTTP status, timeouts, connection resets) are turned
//! into a retry decision, so the executor, the job queue and the recovery store
//! all agree on what "transient" means.
//!
//! ```text
//! ┌─────────────────┐     ┌─────────────────┐     ┌─────────────────┐
//! │   SyncError     │────▶│ ErrorClassifier │────▶│ Classification  │
//! └─────────────────┘     └─────────────────┘     └─────────────────┘
//! ```

use crate::error::SyncError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// 4xx statuses that are still worth retrying: timeouts, throttling, and
/// conditions a well-behaved server may clear on its own.
pub const RETRYABLE_CLIENT_STATUSES: &[u16] = &[
    408, 413, 414, 415, 416, 417, 418, 421, 422, 424, 425, 426, 428, 429, 431, 451,
];

/// Primary error categories for classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Permanent error - will never succeed if retried
    Permanent,
    /// Transient server-side error - may succeed on retry
    Transient,
    /// Operation took too long
    Timeout,
    /// Throttled by the remote API
    RateLimit,
    /// Connection-level failure
    Network,
    /// Circuit breaker refused the call
    CircuitOpen,
    /// Bad local configuration - requires manual intervention
    Configuration,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Permanent => write!(f, "permanent"),
            ErrorCategory::Transient => write!(f, "transient"),
            ErrorCategory::Timeout => write!(f, "timeout"),
            ErrorCategory::RateLimit => write!(f, "rate_limit"),
            ErrorCategory::Network => write!(f, "network"),
            ErrorCategory::CircuitOpen => write!(f, "circuit_open"),
            ErrorCategory::Configuration => write!(f, "configuration"),
        }
    }
}

/// Result of error classification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorClassification {
    pub category: ErrorCategory,
    pub is_retryable: bool,
    /// Server-requested delay (Retry-After), if any
    pub retry_after: Option<Duration>,
}

impl ErrorClassification {
    fn retryable(category: ErrorCategory) -> Self {
        Self {
            category,
            is_retryable: true,
            retry_after: None,
        }
    }

    fn fatal(category: ErrorCategory) -> Self {
        Self {
            category,
            is_retryable: false,
            retry_after: None,
        }
    }
}

pub trait ErrorClassifier: Send + Sync {
    fn classify(&self, error: &SyncError) -> ErrorClassification;
}

/// Classification rules for the CRM sync pipeline
#[derive(Debug, Default, Clone, Copy)]
pub struct StandardErrorClassifier;

impl StandardErrorClassifier {
    pub fn new() -> Self {
        Self
    }
}

/// Whether an HTTP status code represents a transient condition
pub fn is_retryable_status(status: u16) -> bool {
    match status {
        500..=599 => true,
        400..=499 => RETRYABLE_CLIENT_STATUSES.contains(&status),
        _ => false,
    }
}

impl ErrorClassifier for StandardErrorClassifier {
    fn classify(&self, error: &SyncError) -> ErrorClassification {
        match error {
            SyncError::Timeout(_) => ErrorClassification::retryable(ErrorCategory::Timeout),
            SyncError::Network(_) => ErrorClassification::retryable(ErrorCategory::Network),
            SyncError::RateLimited { retry_after, .. } => ErrorClassification {
                category: ErrorCategory::RateLimit,
                is_retryable: true,
                retry_after: *retry_after,
            },
            SyncError::Http { status, .. } if *status == 429 => {
                ErrorClassification::retryable(ErrorCategory::RateLimit)
            }
            SyncError::Http { status, .. } if *status == 408 => {
                ErrorClassification::retryable(ErrorCategory::Timeout)
            }
            SyncError::Http { status, .. } if is_retryable_status(*status) => {
                ErrorClassification::retryable(ErrorCategory::Transient)
            }
            SyncError::Http { .. } => ErrorClassification::fatal(ErrorCategory::Permanent),
            // Connection-level database failures are already mapped to
            // Network/Timeout; what remains are query and constraint errors.
            SyncError::Database(_) => ErrorClassification::fatal(ErrorCategory::Permanent),
            SyncError::CircuitOpen { .. } => ErrorClassification::fatal(ErrorCategory::CircuitOpen),
            SyncError::Configuration(_) => ErrorClassification::fatal(ErrorCategory::Configuration),
            SyncError::RetryExhausted { original_error, .. } => {
                let inner = self.classify(original_error);
                ErrorClassification {
                    is_retryable: false,
                    ..inner
                }
            }
            SyncError::Fatal(_)
            | SyncError::Validation(_)
            | SyncError::Conflict(_)
            | SyncError::NotFound(_)
            | SyncError::Serialization(_)
            | SyncError::InvalidTransition(_) => ErrorClassification::fatal(ErrorCategory::Permanent),
        }
    }
}
