//! Shared state handed to every web handler.

use crate::config::DatastoreBackend;
use crate::crm::RateLimitRegistry;
use crate::orchestration::{SyncService, SyncSystem};
use crate::progress::ProgressTracker;
use crate::recovery::ErrorRecovery;
use crate::resilience::CircuitBreakerManager;
use sqlx::PgPool;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<SyncService>,
    pub progress: Arc<ProgressTracker>,
    pub recovery: Arc<ErrorRecovery>,
    pub breakers: Arc<CircuitBreakerManager>,
    pub rate_limits: Arc<RateLimitRegistry>,
    pub backend: DatastoreBackend,
    pub pool: Option<PgPool>,
}

impl AppState {
    pub fn from_system(system: &SyncSystem) -> Self {
        let ctx = system.context();
        Self {
            service: system.service().clone(),
            progress: ctx.progress.clone(),
            recovery: ctx.recovery.clone(),
            breakers: system.breakers().clone(),
            rate_limits: ctx.rate_limits.clone(),
            backend: system.config().datastore.backend,
            pool: system.pool().cloned(),
        }
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("backend", &self.backend)
            .finish_non_exhaustive()
    }
}
