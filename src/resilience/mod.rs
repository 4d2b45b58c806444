//! # Resilience Module
//!
//! Fault tolerance for every call that leaves the process: the CRM API and the
//! datastore. Failures are isolated per dependency so a CRM outage fails fast
//! instead of tying up workers on timeouts.
//!
//! ## Architecture
//!
//! - **Circuit Breakers**: one per dependency, owned by [`CircuitBreakerManager`]
//! - **Backoff**: exponential delays with jitter and a cap
//! - **Error Classification**: the single retryable/fatal decision point
//! - **Resilient Executor**: rate-limit wait + breaker + classified retries
//!
//! ## Usage
//!
//! ```rust,no_run
//! use crm_sync::clock::system_clock;
//! use crm_sync::resilience::{CircuitBreaker, CircuitBreakerConfig, ExecutorConfig, ResilientExecutor};
//! use std::sync::Arc;
//!
//! # async fn example() {
//! let clock = system_clock();
//! let breaker = Arc::new(CircuitBreaker::new("crm_api", CircuitBreakerConfig::for_crm_api(), clock.clone()));
//! let executor = ResilientExecutor::new("crm_api", breaker, ExecutorConfig::default(), clock);
//!
//! let envelope = executor
//!     .execute_with_resilience("fetch merchants", || async { Ok::<_, crm_sync::error::SyncError>(42) })
//!     .await;
//! assert!(envelope.success);
//! # }
//! ```

pub mod backoff;
pub mod circuit_breaker;
pub mod config;
pub mod error_classifier;
pub mod executor;
pub mod manager;
pub mod metrics;

pub use backoff::{BackoffCalculator, BackoffConfig};
pub use circuit_breaker::{
    CallPermit, CircuitBreaker, CircuitBreakerError, CircuitOpenError, CircuitState,
};
pub use config::CircuitBreakerConfig;
pub use error_classifier::{
    is_retryable_status, ErrorCategory, ErrorClassification, ErrorClassifier,
    StandardErrorClassifier,
};
pub use executor::{
    retry_with_backoff, BreakerVerdict, ExecutionEnvelope, ExecutorConfig, ResilientExecutor,
};
pub use manager::{CircuitBreakerManager, CRM_API_COMPONENT, DATASTORE_COMPONENT};
pub use metrics::{CircuitBreakerMetrics, SystemCircuitBreakerMetrics};
