//! # Circuit Breaker Manager
//!
//! Owns one circuit breaker per external dependency (the CRM API, the datastore)
//! and aggregates their metrics. Built once at process start and handed out as
//! `Arc<CircuitBreakerManager>`; breakers are looked up by component name.

use crate::clock::Clock;
use crate::config::CircuitBreakersConfig;
use crate::resilience::{CircuitBreaker, CircuitBreakerMetrics, SystemCircuitBreakerMetrics};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Component name of the external CRM API breaker
pub const CRM_API_COMPONENT: &str = "crm_api";
/// Component name of the datastore breaker
pub const DATASTORE_COMPONENT: &str = "datastore";

#[derive(Debug)]
pub struct CircuitBreakerManager {
    circuit_breakers: DashMap<String, Arc<CircuitBreaker>>,
    config: CircuitBreakersConfig,
    clock: Arc<dyn Clock>,
}

impl CircuitBreakerManager {
    pub fn from_config(config: &CircuitBreakersConfig, clock: Arc<dyn Clock>) -> Self {
        info!(
            components = config.components.len(),
            "Initializing circuit breaker manager"
        );

        Self {
            circuit_breakers: DashMap::new(),
            config: config.clone(),
            clock,
        }
    }

    /// Get or create the breaker for a component
    pub fn get_circuit_breaker(&self, component_name: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.circuit_breakers.get(component_name) {
            return Arc::clone(existing.value());
        }

        let entry = self
            .circuit_breakers
            .entry(component_name.to_string())
            .or_insert_with(|| {
                let component_config = self.config.config_for_component(component_name);
                Arc::new(CircuitBreaker::new(
                    component_name,
                    component_config,
                    Arc::clone(&self.clock),
                ))
            });

        Arc::clone(entry.value())
    }

    pub fn list_components(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .circuit_breakers
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }

    pub fn get_component_metrics(&self, component_name: &str) -> Option<CircuitBreakerMetrics> {
        self.circuit_breakers
            .get(component_name)
            .map(|breaker| breaker.metrics())
    }

    pub fn system_metrics(&self) -> SystemCircuitBreakerMetrics {
        let metrics: HashMap<String, CircuitBreakerMetrics> = self
            .circuit_breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().metrics()))
            .collect();
        SystemCircuitBreakerMetrics::from_breakers(metrics)
    }

    /// Force open all circuit breakers (emergency stop)
    pub fn force_open_all(&self) {
        warn!("🚨 Forcing all circuit breakers open (emergency stop)");
        for entry in self.circuit_breakers.iter() {
            entry.value().force_open();
        }
    }

    /// Force close all circuit breakers (emergency recovery)
    pub fn force_close_all(&self) {
        warn!("🚨 Forcing all circuit breakers closed (emergency recovery)");
        for entry in self.circuit_breakers.iter() {
            entry.value().force_closed();
        }
    }
}
