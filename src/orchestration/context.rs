use crate::clock::Clock;
use crate::config::{CrmConfig, OrchestratorConfig};
use crate::crm::{CrmApi, RateLimitRegistry};
use crate::datastore::{RecordStore, SyncHistoryStore};
use crate::notifications::NotificationSink;
use crate::progress::ProgressTracker;
use crate::recovery::ErrorRecovery;
use crate::resilience::ResilientExecutor;
use crate::strategy::SyncStrategyAnalyzer;
use std::sync::Arc;

/// Everything a sync run touches, shared by the historical, daily and
/// targeted orchestrators
#[derive(Clone)]
pub struct SyncContext {
    pub crm: Arc<dyn CrmApi>,
    pub records: Arc<dyn RecordStore>,
    pub history: Arc<dyn SyncHistoryStore>,
    pub progress: Arc<ProgressTracker>,
    pub recovery: Arc<ErrorRecovery>,
    pub analyzer: Arc<SyncStrategyAnalyzer>,
    /// Guards CRM calls
    pub crm_executor: Arc<ResilientExecutor>,
    /// Guards datastore writes
    pub datastore_executor: Arc<ResilientExecutor>,
    pub rate_limits: Arc<RateLimitRegistry>,
    pub notifications: Arc<dyn NotificationSink>,
    pub clock: Arc<dyn Clock>,
    pub orchestrator: OrchestratorConfig,
    pub per_page: u32,
    pub max_pages: u32,
}

impl SyncContext {
    pub fn with_crm_settings(mut self, crm: &CrmConfig) -> Self {
        self.per_page = crm.per_page;
        self.max_pages = crm.max_pages;
        self
    }
}

impl std::fmt::Debug for SyncContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncContext")
            .field("service", &self.crm.service_name())
            .field("orchestrator", &self.orchestrator)
            .field("per_page", &self.per_page)
            .field("max_pages", &self.max_pages)
            .finish()
    }
}
