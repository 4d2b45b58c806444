//! # Circuit Breaker Implementation
//!
//! Fault isolation for calls to an external dependency. Classic three-state
//! breaker: Closed (normal operation), Open (failing fast) and Half-Open
//! (a single probe tests recovery).
//!
//! All bookkeeping happens inside one mutex-guarded region, so the
//! "check open, maybe half-open, admit" sequence cannot race: only one caller
//! at a time can hold the half-open probe permit. The cool-down is measured
//! from the last recorded failure using the injected [`Clock`].

use crate::clock::Clock;
use crate::error::SyncError;
use crate::resilience::{CircuitBreakerConfig, CircuitBreakerMetrics};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Circuit breaker states representing the current operational mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - all calls are allowed through
    Closed,
    /// Failure mode - all calls fail fast without executing
    Open,
    /// Testing recovery - one probe call is allowed at a time
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Errors that can occur during circuit breaker operation
#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError<E> {
    /// Circuit is open, rejecting all calls
    #[error("Circuit breaker is open for {component}")]
    CircuitOpen { component: String, cooldown: Duration },

    /// Operation failed and was recorded
    #[error("Operation failed: {0}")]
    OperationFailed(E),
}

/// Rejection returned when the breaker refuses to admit a call
#[derive(Debug, Clone, thiserror::Error)]
#[error("Circuit breaker is open for {component}")]
pub struct CircuitOpenError {
    pub component: String,
    pub cooldown: Duration,
}

impl From<CircuitOpenError> for SyncError {
    fn from(err: CircuitOpenError) -> Self {
        SyncError::CircuitOpen {
            component: err.component,
            cooldown: err.cooldown,
        }
    }
}

impl From<CircuitBreakerError<SyncError>> for SyncError {
    fn from(err: CircuitBreakerError<SyncError>) -> Self {
        match err {
            CircuitBreakerError::CircuitOpen {
                component,
                cooldown,
            } => SyncError::CircuitOpen {
                component,
                cooldown,
            },
            CircuitBreakerError::OperationFailed(e) => e,
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure_time: Option<DateTime<Utc>>,
    probe_in_flight: bool,
    half_open_successes: u32,
    metrics: CircuitBreakerMetrics,
}

/// Per-dependency circuit breaker. Share it as `Arc<CircuitBreaker>`.
#[derive(Debug)]
pub struct CircuitBreaker {
    /// Component name for logging and metrics
    name: String,

    /// Configuration parameters
    config: CircuitBreakerConfig,

    clock: Arc<dyn Clock>,

    inner: Mutex<BreakerState>,
}

/// Admission ticket returned by [`CircuitBreaker::try_acquire`].
///
/// Settle it with [`CallPermit::succeed`] or [`CallPermit::fail`]. A probe
/// permit dropped without being settled releases the half-open slot.
#[must_use = "a permit must be settled with succeed() or fail()"]
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    settled: bool,
}

impl CallPermit<'_> {
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn succeed(mut self) {
        self.settled = true;
        self.breaker.on_success(self.probe);
    }

    pub fn fail(mut self) {
        self.settled = true;
        self.breaker.on_failure(self.probe);
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.probe {
            self.breaker.inner.lock().probe_in_flight = false;
        }
    }
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given name and configuration
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        let name = name.into();
        info!(
            component = %name,
            failure_threshold = config.failure_threshold,
            timeout_seconds = config.timeout.as_secs(),
            success_threshold = config.success_threshold,
            "🛡️ Circuit breaker initialized"
        );

        Self {
            name,
            config,
            clock,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                last_failure_time: None,
                probe_in_flight: false,
                half_open_successes: 0,
                metrics: CircuitBreakerMetrics::new(),
            }),
        }
    }

    /// Get component name
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state, moving Open to HalfOpen once the cool-down has elapsed
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);
        inner.state
    }

    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }

    /// Time left before a probe will be admitted. Zero unless the circuit is open.
    pub fn remaining_cooldown(&self) -> Duration {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);
        match inner.state {
            CircuitState::Open => self.cooldown_remaining(&inner),
            _ => Duration::ZERO,
        }
    }

    /// Ask for permission to call the protected dependency
    pub fn try_acquire(&self) -> Result<CallPermit<'_>, CircuitOpenError> {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);

        match inner.state {
            CircuitState::Closed => Ok(CallPermit {
                breaker: self,
                probe: false,
                settled: false,
            }),
            CircuitState::HalfOpen if !inner.probe_in_flight => {
                inner.probe_in_flight = true;
                debug!(component = %self.name, "🟡 Admitting half-open probe");
                Ok(CallPermit {
                    breaker: self,
                    probe: true,
                    settled: false,
                })
            }
            CircuitState::HalfOpen | CircuitState::Open => {
                inner.metrics.rejected_count += 1;
                let cooldown = self.cooldown_remaining(&inner);
                Err(CircuitOpenError {
                    component: self.name.clone(),
                    cooldown,
                })
            }
        }
    }

    /// Execute an operation with circuit breaker protection
    pub async fn call<F, T, E, Fut>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let permit = self
            .try_acquire()
            .map_err(|open| CircuitBreakerError::CircuitOpen {
                component: open.component,
                cooldown: open.cooldown,
            })?;

        let result = operation().await;
        match &result {
            Ok(_) => permit.succeed(),
            Err(_) => permit.fail(),
        }

        result.map_err(CircuitBreakerError::OperationFailed)
    }

    /// Record a success observed outside of [`CircuitBreaker::call`]
    pub fn record_success(&self) {
        self.on_success(false);
    }

    /// Record a failure observed outside of [`CircuitBreaker::call`]
    pub fn record_failure(&self) {
        self.on_failure(false);
    }

    /// Force circuit to open state (for emergency situations)
    pub fn force_open(&self) {
        warn!(component = %self.name, "🚨 Circuit breaker forced open");
        let mut inner = self.inner.lock();
        inner.last_failure_time = Some(self.clock.now());
        self.transition_to_open(&mut inner);
    }

    /// Force circuit to closed state (for emergency recovery)
    pub fn force_closed(&self) {
        warn!(component = %self.name, "🚨 Circuit breaker forced closed");
        let mut inner = self.inner.lock();
        self.transition_to_closed(&mut inner);
    }

    /// Get current metrics snapshot
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);

        let mut snapshot = inner.metrics.clone();
        snapshot.current_state = inner.state;
        snapshot.consecutive_failures = u64::from(inner.consecutive_failures);
        if snapshot.total_calls > 0 {
            snapshot.failure_rate = snapshot.failure_count as f64 / snapshot.total_calls as f64;
        }
        snapshot
    }

    fn on_success(&self, probe: bool) {
        let mut inner = self.inner.lock();
        inner.metrics.total_calls += 1;
        inner.metrics.success_count += 1;
        inner.consecutive_failures = 0;
        if probe {
            inner.probe_in_flight = false;
        }

        match inner.state {
            CircuitState::HalfOpen => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.success_threshold {
                    self.transition_to_closed(&mut inner);
                }
            }
            CircuitState::Closed => {}
            CircuitState::Open => {
                debug!(component = %self.name, "Late success recorded while circuit is open");
            }
        }
    }

    fn on_failure(&self, probe: bool) {
        let mut inner = self.inner.lock();
        inner.metrics.total_calls += 1;
        inner.metrics.failure_count += 1;
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.last_failure_time = Some(self.clock.now());
        if probe {
            inner.probe_in_flight = false;
        }

        match inner.state {
            CircuitState::Closed => {
                if inner.consecutive_failures >= self.config.failure_threshold {
                    self.transition_to_open(&mut inner);
                }
            }
            CircuitState::HalfOpen => {
                // Any failure in half-open state immediately reopens; the
                // cool-down restarts from the failure just recorded.
                self.transition_to_open(&mut inner);
            }
            CircuitState::Open => {}
        }
    }

    fn refresh(&self, inner: &mut BreakerState) {
        if inner.state == CircuitState::Open && self.cooldown_remaining(inner).is_zero() {
            inner.state = CircuitState::HalfOpen;
            inner.half_open_successes = 0;
            inner.probe_in_flight = false;
            info!(
                component = %self.name,
                success_threshold = self.config.success_threshold,
                "🟡 Circuit breaker half-open (testing recovery)"
            );
        }
    }

    fn cooldown_remaining(&self, inner: &BreakerState) -> Duration {
        let Some(last_failure) = inner.last_failure_time else {
            return Duration::ZERO;
        };
        let elapsed = (self.clock.now() - last_failure)
            .to_std()
            .unwrap_or(Duration::ZERO);
        self.config.timeout.saturating_sub(elapsed)
    }

    fn transition_to_open(&self, inner: &mut BreakerState) {
        inner.state = CircuitState::Open;
        inner.half_open_successes = 0;
        inner.metrics.times_opened += 1;

        error!(
            component = %self.name,
            consecutive_failures = inner.consecutive_failures,
            failure_threshold = self.config.failure_threshold,
            timeout_seconds = self.config.timeout.as_secs(),
            "🔴 Circuit breaker opened (failing fast)"
        );
    }

    fn transition_to_closed(&self, inner: &mut BreakerState) {
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.half_open_successes = 0;
        inner.probe_in_flight = false;

        info!(
            component = %self.name,
            total_calls = inner.metrics.total_calls,
            "🟢 Circuit breaker closed (recovered)"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn breaker(threshold: u32, timeout_secs: u64) -> (CircuitBreaker, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_now());
        let config = CircuitBreakerConfig {
            failure_threshold: threshold,
            timeout: Duration::from_secs(timeout_secs),
            success_threshold: 1,
        };
        (CircuitBreaker::new("crm_api", config, clock.clone()), clock)
    }

    #[tokio::test]
    async fn test_circuit_breaker_normal_operation() {
        let (circuit, _) = breaker(3, 60);
        assert_eq!(circuit.state(), CircuitState::Closed);

        let result = circuit.call(|| async { Ok::<_, String>("success") }).await;
        assert!(result.is_ok());

        let metrics = circuit.metrics();
        assert_eq!(metrics.total_calls, 1);
        assert_eq!(metrics.success_count, 1);
        assert_eq!(metrics.failure_count, 0);
    }

    #[tokio::test]
    async fn test_circuit_breaker_opens_on_failures() {
        let (circuit, _) = breaker(2, 60);

        let _ = circuit.call(|| async { Err::<String, _>("error") }).await;
        assert_eq!(circuit.state(), CircuitState::Closed);

        let _ = circuit.call(|| async { Err::<String, _>("error") }).await;
        assert!(circuit.is_open());

        let result = circuit
            .call(|| async { Ok::<_, String>("should not execute") })
            .await;
        assert!(matches!(result, Err(CircuitBreakerError::CircuitOpen { .. })));
        assert_eq!(circuit.metrics().rejected_count, 1);
    }

    #[tokio::test]
    async fn test_success_resets_consecutive_failures() {
        let (circuit, _) = breaker(3, 60);

        let _ = circuit.call(|| async { Err::<(), _>("error") }).await;
        let _ = circuit.call(|| async { Err::<(), _>("error") }).await;
        assert_eq!(circuit.consecutive_failures(), 2);

        let _ = circuit.call(|| async { Ok::<_, String>(()) }).await;
        assert_eq!(circuit.consecutive_failures(), 0);
        assert_eq!(circuit.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_after_cooldown_then_closes() {
        let (circuit, clock) = breaker(2, 60);
        circuit.record_failure();
        circuit.record_failure();
        assert!(circuit.is_open());

        clock.advance(chrono::Duration::seconds(59));
        assert!(circuit.is_open());
        assert_eq!(circuit.remaining_cooldown(), Duration::from_secs(1));

        clock.advance(chrono::Duration::seconds(1));
        assert_eq!(circuit.state(), CircuitState::HalfOpen);

        let result = circuit.call(|| async { Ok::<_, String>("probe") }).await;
        assert!(result.is_ok());
        assert_eq!(circuit.state(), CircuitState::Closed);
        assert_eq!(circuit.consecutive_failures(), 0);
    }

    #[tokio::test]
    async fn test_half_open_failure_restarts_cooldown() {
        let (circuit, clock) = breaker(1, 60);
        circuit.record_failure();
        clock.advance(chrono::Duration::seconds(60));
        assert_eq!(circuit.state(), CircuitState::HalfOpen);

        let _ = circuit.call(|| async { Err::<(), _>("still down") }).await;
        assert!(circuit.is_open());
        assert_eq!(circuit.remaining_cooldown(), Duration::from_secs(60));
    }

    #[test]
    fn test_only_one_probe_admitted_in_half_open() {
        let (circuit, clock) = breaker(1, 10);
        circuit.record_failure();
        clock.advance(chrono::Duration::seconds(10));

        let probe = circuit.try_acquire().expect("first probe admitted");
        assert!(probe.is_probe());
        assert!(circuit.try_acquire().is_err());

        drop(probe);
        let second = circuit.try_acquire().expect("slot released on drop");
        second.succeed();
        assert_eq!(circuit.state(), CircuitState::Closed);
    }

    #[test]
    fn test_force_operations() {
        let (circuit, _) = breaker(1, 1);

        circuit.force_open();
        assert_eq!(circuit.state(), CircuitState::Open);

        circuit.force_closed();
        assert_eq!(circuit.state(), CircuitState::Closed);
    }
}
