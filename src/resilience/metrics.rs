//! # Circuit Breaker Metrics
//!
//! Counters kept by each breaker plus the aggregated view the manager exposes to
//! the status endpoint.

use crate::resilience::CircuitState;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Metrics for a single circuit breaker instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerMetrics {
    /// Total number of calls that reached the protected operation
    pub total_calls: u64,

    /// Number of successful calls
    pub success_count: u64,

    /// Number of failed calls
    pub failure_count: u64,

    /// Calls rejected without executing because the circuit was open
    pub rejected_count: u64,

    /// Current consecutive failure count
    pub consecutive_failures: u64,

    /// Number of times the circuit has opened
    pub times_opened: u64,

    /// Current circuit breaker state
    pub current_state: CircuitState,

    /// Calculated failure rate (0.0 to 1.0)
    pub failure_rate: f64,
}

impl Default for CircuitBreakerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl CircuitBreakerMetrics {
    /// Create new metrics instance with zero values
    pub fn new() -> Self {
        Self {
            total_calls: 0,
            success_count: 0,
            failure_count: 0,
            rejected_count: 0,
            consecutive_failures: 0,
            times_opened: 0,
            current_state: CircuitState::Closed,
            failure_rate: 0.0,
        }
    }

    /// Check if metrics indicate healthy operation
    pub fn is_healthy(&self) -> bool {
        match self.current_state {
            CircuitState::Closed => self.failure_rate < 0.1,
            CircuitState::Open => false,
            CircuitState::HalfOpen => true,
        }
    }
}

/// Aggregated metrics across every breaker owned by a manager
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemCircuitBreakerMetrics {
    pub circuit_breakers: HashMap<String, CircuitBreakerMetrics>,
    pub open_circuits: usize,
    pub total_calls: u64,
    pub overall_failure_rate: f64,
}

impl SystemCircuitBreakerMetrics {
    pub fn from_breakers(circuit_breakers: HashMap<String, CircuitBreakerMetrics>) -> Self {
        let open_circuits = circuit_breakers
            .values()
            .filter(|m| m.current_state == CircuitState::Open)
            .count();
        let total_calls: u64 = circuit_breakers.values().map(|m| m.total_calls).sum();
        let total_failures: u64 = circuit_breakers.values().map(|m| m.failure_count).sum();
        let overall_failure_rate = if total_calls > 0 {
            total_failures as f64 / total_calls as f64
        } else {
            0.0
        };

        Self {
            circuit_breakers,
            open_circuits,
            total_calls,
            overall_failure_rate,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.open_circuits == 0
    }
}
