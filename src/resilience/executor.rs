//! # Resilient Executor
//!
//! Wraps a fallible async operation with rate-limit pre-emption, circuit breaker
//! protection and classified retries. Callers always get an
//! [`ExecutionEnvelope`] back, never an `Err`, so a sub-sync can record the
//! outcome and move on.
//!
//! ```text
//! rate limit wait ─▶ breaker.try_acquire ─▶ operation ─┬─ Ok ──────────▶ success
//!                         │                            └─ Err ─ classify
//!                         └─ open ─▶ "circuit open"          ├─ fatal ─▶ failure
//!                                                            └─ retryable ─▶ sleep(backoff) ─▶ loop
//! ```
//!
//! [`ResilientExecutor::execute_with_verdict`] runs a single attempt whose
//! caller decides what the breaker hears. Record writes use it so that a bad
//! record is never mistaken for a datastore outage.
//!
//! [`retry_with_backoff`] is the same retry contract without a breaker. The
//! recovery pass retries failed items through it and the metrics refresh
//! wraps its breaker call in it; exhaustion propagates as `RetryExhausted`.

use crate::clock::Clock;
use crate::crm::RateLimitRegistry;
use crate::error::{Result, SyncError};
use crate::resilience::{
    BackoffCalculator, BackoffConfig, CircuitBreaker, CircuitBreakerError, ErrorClassifier,
    StandardErrorClassifier,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub backoff: BackoffConfig,
    /// Upper bound on a single pre-emptive wait for a rate-limit reset
    pub max_rate_limit_wait: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: BackoffConfig::default(),
            max_rate_limit_wait: Duration::from_secs(60),
        }
    }
}

/// Outcome of a resilient execution.
///
/// A failed envelope carries a human-readable `error`, optional `details`
/// (the cool-down for an open circuit, the give-up reason otherwise) and the
/// typed error that ended the run.
#[derive(Debug, Clone)]
pub struct ExecutionEnvelope<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
    pub details: Option<String>,
    pub attempts: u32,
    pub circuit_open: bool,
    pub last_error: Option<SyncError>,
}

impl<T> ExecutionEnvelope<T> {
    fn succeeded(data: T, attempts: u32) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            details: None,
            attempts,
            circuit_open: false,
            last_error: None,
        }
    }

    fn failed(error: SyncError, details: String, attempts: u32) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.to_string()),
            details: Some(details),
            attempts,
            circuit_open: false,
            last_error: Some(error),
        }
    }

    fn rejected(component: String, cooldown: Duration, attempts: u32) -> Self {
        Self {
            success: false,
            data: None,
            error: Some("circuit open".to_string()),
            details: Some(format!("retry in {}s", cooldown.as_secs())),
            attempts,
            circuit_open: true,
            last_error: Some(SyncError::CircuitOpen {
                component,
                cooldown,
            }),
        }
    }

    /// Convert into a plain `Result`, surfacing the terminating error
    pub fn into_result(self) -> Result<T> {
        match (self.data, self.last_error) {
            (Some(data), _) if self.success => Ok(data),
            (_, Some(err)) => Err(err),
            _ => Err(SyncError::fatal(
                self.error
                    .unwrap_or_else(|| "execution failed without an error".to_string()),
            )),
        }
    }
}

/// What a single guarded attempt tells the circuit breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerVerdict {
    /// The dependency answered; resets the failure count
    Healthy,
    /// The dependency itself is failing; counts towards opening
    Unhealthy,
    /// Says nothing about the dependency's health
    Neutral,
}

/// Retry + circuit breaker wrapper for one external dependency
pub struct ResilientExecutor {
    service: String,
    breaker: Arc<CircuitBreaker>,
    backoff: BackoffCalculator,
    classifier: Arc<dyn ErrorClassifier>,
    rate_limits: Option<Arc<RateLimitRegistry>>,
    clock: Arc<dyn Clock>,
    config: ExecutorConfig,
}

impl std::fmt::Debug for ResilientExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilientExecutor")
            .field("service", &self.service)
            .field("breaker", &self.breaker.name())
            .field("config", &self.config)
            .finish()
    }
}

impl ResilientExecutor {
    pub fn new(
        service: impl Into<String>,
        breaker: Arc<CircuitBreaker>,
        config: ExecutorConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            service: service.into(),
            breaker,
            backoff: BackoffCalculator::new(config.backoff.clone()),
            classifier: Arc::new(StandardErrorClassifier::new()),
            rate_limits: None,
            clock,
            config,
        }
    }

    /// Consult a shared rate-limit registry before each attempt
    pub fn with_rate_limits(mut self, registry: Arc<RateLimitRegistry>) -> Self {
        self.rate_limits = Some(registry);
        self
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn ErrorClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub async fn execute_with_resilience<T, F, Fut>(
        &self,
        operation_name: &str,
        mut operation: F,
    ) -> ExecutionEnvelope<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.config.max_retries + 1;
        let mut attempts = 0;

        loop {
            self.wait_for_rate_limit(operation_name).await;

            let outcome = self.breaker.call(|| operation()).await;
            let err = match outcome {
                Ok(data) => {
                    attempts += 1;
                    if attempts > 1 {
                        info!(
                            service = %self.service,
                            operation = operation_name,
                            attempts,
                            "🟢 Operation succeeded after retry"
                        );
                    }
                    return ExecutionEnvelope::succeeded(data, attempts);
                }
                Err(CircuitBreakerError::CircuitOpen {
                    component,
                    cooldown,
                }) => {
                    warn!(
                        service = %self.service,
                        operation = operation_name,
                        component = %component,
                        cooldown_seconds = cooldown.as_secs(),
                        "🔴 Circuit open, not attempting operation"
                    );
                    return ExecutionEnvelope::rejected(component, cooldown, attempts);
                }
                Err(CircuitBreakerError::OperationFailed(err)) => {
                    attempts += 1;
                    err
                }
            };

            let classification = self.classifier.classify(&err);
            if !classification.is_retryable {
                warn!(
                    service = %self.service,
                    operation = operation_name,
                    category = %classification.category,
                    error = %err,
                    "Fatal error, aborting without retry"
                );
                return ExecutionEnvelope::failed(err, "non-retryable error".to_string(), attempts);
            }

            if attempts >= max_attempts {
                error!(
                    service = %self.service,
                    operation = operation_name,
                    attempts,
                    error = %err,
                    "Retries exhausted"
                );
                let details = format!("gave up after {attempts} attempts");
                return ExecutionEnvelope::failed(err, details, attempts);
            }

            let delay = self
                .backoff
                .delay_with_hint(attempts - 1, classification.retry_after);
            debug!(
                service = %self.service,
                operation = operation_name,
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                category = %classification.category,
                "Retrying after backoff"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Run `operation` once behind the breaker. The operation reports both its
    /// result and a [`BreakerVerdict`], and only the verdict reaches the
    /// breaker. An open circuit yields a rejected envelope without running it.
    pub async fn execute_with_verdict<T, F, Fut>(
        &self,
        operation_name: &str,
        operation: F,
    ) -> ExecutionEnvelope<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = (Result<T>, BreakerVerdict)>,
    {
        self.wait_for_rate_limit(operation_name).await;

        let permit = match self.breaker.try_acquire() {
            Ok(permit) => permit,
            Err(open) => {
                warn!(
                    service = %self.service,
                    operation = operation_name,
                    component = %open.component,
                    cooldown_seconds = open.cooldown.as_secs(),
                    "🔴 Circuit open, not attempting operation"
                );
                return ExecutionEnvelope::rejected(open.component, open.cooldown, 0);
            }
        };

        let (result, verdict) = operation().await;
        match verdict {
            BreakerVerdict::Healthy => permit.succeed(),
            BreakerVerdict::Unhealthy => permit.fail(),
            BreakerVerdict::Neutral => drop(permit),
        }

        match result {
            Ok(data) => ExecutionEnvelope::succeeded(data, 1),
            Err(err) => {
                debug!(
                    service = %self.service,
                    operation = operation_name,
                    verdict = ?verdict,
                    error = %err,
                    "Guarded operation failed"
                );
                ExecutionEnvelope::failed(err, format!("{verdict:?} failure"), 1)
            }
        }
    }

    async fn wait_for_rate_limit(&self, operation_name: &str) {
        let Some(registry) = &self.rate_limits else {
            return;
        };
        if let Some(wait) = registry.wait_needed(&self.service, self.clock.now()) {
            let wait = wait.min(self.config.max_rate_limit_wait);
            info!(
                service = %self.service,
                operation = operation_name,
                wait_ms = wait.as_millis() as u64,
                "Rate limit quota exhausted, waiting for reset"
            );
            tokio::time::sleep(wait).await;
        }
    }
}

/// Retry a labelled operation with exponential backoff.
///
/// Non-retryable errors are returned unchanged after the first attempt. When
/// every attempt fails with a retryable error the last one is wrapped in
/// [`SyncError::RetryExhausted`].
pub async fn retry_with_backoff<T, F, Fut>(
    backoff: &BackoffCalculator,
    max_retries: u32,
    context: &str,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let classifier = StandardErrorClassifier::new();
    let max_attempts = max_retries + 1;
    let mut attempt = 0;

    loop {
        attempt += 1;
        let err = match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        let classification = classifier.classify(&err);
        if !classification.is_retryable {
            return Err(err);
        }
        if attempt >= max_attempts {
            return Err(SyncError::RetryExhausted {
                context: context.to_string(),
                attempts: attempt,
                original_error: Box::new(err),
            });
        }

        let delay = backoff.delay_with_hint(attempt - 1, classification.retry_after);
        debug!(context, attempt, delay_ms = delay.as_millis() as u64, "Retrying");
        tokio::time::sleep(delay).await;
    }
}
