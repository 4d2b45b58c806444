//! # Sync System Bootstrap
//!
//! Builds the whole system from a [`CrmSyncConfig`]: the connection pool and
//! migrations, the stores for the configured backend, one circuit breaker and
//! resilient executor per dependency, the queue, and the orchestrators' shared
//! [`SyncContext`]. The binary, the web server and the tests all start here.

use crate::clock::{system_clock, Clock};
use crate::config::{CrmSyncConfig, DatabaseConfig, DatastoreBackend};
use crate::crm::{CrmApi, HttpCrmClient, RateLimitRegistry};
use crate::datastore::{MemoryDatastore, PgDatastore, RecordStore, SyncHistoryStore};
use crate::error::{Result, SyncError};
use crate::notifications::{NotificationSink, TracingNotificationSink};
use crate::orchestration::context::SyncContext;
use crate::orchestration::handler::SyncJobHandler;
use crate::orchestration::record_sync::rebuild_record;
use crate::orchestration::service::SyncService;
use crate::progress::{MemoryProgressStore, PgProgressStore, ProgressStore, ProgressTracker};
use crate::queue::{
    JobQueue, JobStore, LeaseSweeper, MemoryJobStore, PgJobStore, QueueProcessor,
    QueueProcessorConfig,
};
use crate::recovery::{ErrorRecovery, FailedItemStore, MemoryFailedItemStore, PgFailedItemStore, RecoveryResult};
use crate::resilience::{
    BackoffCalculator, CircuitBreakerManager, ResilientExecutor, SystemCircuitBreakerMetrics,
    CRM_API_COMPONENT, DATASTORE_COMPONENT,
};
use crate::strategy::SyncStrategyAnalyzer;
use serde::Serialize;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Embedded migrations, applied at startup when `database.run_migrations` is set
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// The pluggable pieces of a [`SyncSystem`]
pub struct SyncComponents {
    pub crm: Arc<dyn CrmApi>,
    pub records: Arc<dyn RecordStore>,
    pub history: Arc<dyn SyncHistoryStore>,
    pub progress: Arc<dyn ProgressStore>,
    pub failed_items: Arc<dyn FailedItemStore>,
    pub jobs: Arc<dyn JobStore>,
    pub notifications: Arc<dyn NotificationSink>,
    pub rate_limits: Arc<RateLimitRegistry>,
    pub clock: Arc<dyn Clock>,
}

/// Health snapshot for the status interface
#[derive(Debug, Clone, Serialize)]
pub struct SystemStatus {
    pub backend: DatastoreBackend,
    pub database_pool_size: Option<u32>,
    pub database_pool_idle: Option<usize>,
    pub circuit_breakers: SystemCircuitBreakerMetrics,
}

pub struct SyncSystem {
    config: CrmSyncConfig,
    context: SyncContext,
    queue: Arc<JobQueue>,
    service: Arc<SyncService>,
    breakers: Arc<CircuitBreakerManager>,
    pool: Option<PgPool>,
}

impl std::fmt::Debug for SyncSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncSystem")
            .field("backend", &self.config.datastore.backend)
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}

impl SyncSystem {
    /// Connect, migrate and wire every component for `config`
    pub async fn bootstrap(config: CrmSyncConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| SyncError::Configuration(e.to_string()))?;

        let clock = system_clock();
        let rate_limits = Arc::new(RateLimitRegistry::new());
        let crm: Arc<dyn CrmApi> = Arc::new(HttpCrmClient::new(
            &config.crm,
            rate_limits.clone(),
            clock.clone(),
        )?);

        let (components, pool) = match config.datastore.backend {
            DatastoreBackend::Postgres => {
                let pool = Self::connect(&config.database).await?;
                let datastore = Arc::new(PgDatastore::new(pool.clone()));
                let components = SyncComponents {
                    crm,
                    records: datastore.clone(),
                    history: datastore,
                    progress: Arc::new(PgProgressStore::new(pool.clone())),
                    failed_items: Arc::new(PgFailedItemStore::new(pool.clone())),
                    jobs: Arc::new(PgJobStore::new(pool.clone())),
                    notifications: Arc::new(TracingNotificationSink),
                    rate_limits,
                    clock,
                };
                (components, Some(pool))
            }
            DatastoreBackend::Memory => {
                let datastore = Arc::new(MemoryDatastore::new());
                let components = SyncComponents {
                    crm,
                    records: datastore.clone(),
                    history: datastore,
                    progress: Arc::new(MemoryProgressStore::new()),
                    failed_items: Arc::new(MemoryFailedItemStore::new()),
                    jobs: Arc::new(MemoryJobStore::new()),
                    notifications: Arc::new(TracingNotificationSink),
                    rate_limits,
                    clock,
                };
                (components, None)
            }
        };

        let system = Self::assemble(config, components, pool);
        info!(
            backend = ?system.config.datastore.backend,
            service = %system.context.crm.service_name(),
            "🚀 Sync system bootstrapped"
        );
        Ok(system)
    }

    pub async fn connect(config: &DatabaseConfig) -> Result<PgPool> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout())
            .connect(&config.url)
            .await?;

        if config.run_migrations {
            MIGRATOR
                .run(&pool)
                .await
                .map_err(|e| SyncError::database(format!("migration failed: {e}")))?;
            info!("Database migrations applied");
        }
        Ok(pool)
    }

    /// Wire already-built components; no I/O
    pub fn assemble(config: CrmSyncConfig, components: SyncComponents, pool: Option<PgPool>) -> Self {
        let SyncComponents {
            crm,
            records,
            history,
            progress,
            failed_items,
            jobs,
            notifications,
            rate_limits,
            clock,
        } = components;

        let breakers = Arc::new(CircuitBreakerManager::from_config(
            &config.circuit_breakers,
            clock.clone(),
        ));
        let executor_config = config.executor.to_executor_config();
        let crm_executor = Arc::new(
            ResilientExecutor::new(
                crm.service_name().to_string(),
                breakers.get_circuit_breaker(CRM_API_COMPONENT),
                executor_config.clone(),
                clock.clone(),
            )
            .with_rate_limits(rate_limits.clone()),
        );
        let datastore_executor = Arc::new(ResilientExecutor::new(
            DATASTORE_COMPONENT,
            breakers.get_circuit_breaker(DATASTORE_COMPONENT),
            executor_config.clone(),
            clock.clone(),
        ));

        let progress = Arc::new(ProgressTracker::new(
            progress,
            config.progress.broadcast_capacity,
            clock.clone(),
        ));
        let recovery = Arc::new(ErrorRecovery::new(
            failed_items,
            BackoffCalculator::new(executor_config.backoff.clone()),
            executor_config.max_retries,
            clock.clone(),
        ));
        let analyzer = Arc::new(SyncStrategyAnalyzer::new(
            history.clone(),
            rate_limits.clone(),
            crm.service_name().to_string(),
            config.strategy.clone(),
        ));
        let queue = Arc::new(JobQueue::new(jobs, config.queue.clone(), clock.clone()));

        let context = SyncContext {
            crm,
            records,
            history: history.clone(),
            progress: progress.clone(),
            recovery,
            analyzer,
            crm_executor,
            datastore_executor,
            rate_limits,
            notifications,
            clock: clock.clone(),
            orchestrator: config.orchestrator.clone(),
            per_page: 0,
            max_pages: 0,
        }
        .with_crm_settings(&config.crm);

        let service = Arc::new(SyncService::new(queue.clone(), history, progress, clock));

        Self {
            config,
            context,
            queue,
            service,
            breakers,
            pool,
        }
    }

    pub fn config(&self) -> &CrmSyncConfig {
        &self.config
    }

    pub fn context(&self) -> &SyncContext {
        &self.context
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    pub fn service(&self) -> &Arc<SyncService> {
        &self.service
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerManager> {
        &self.breakers
    }

    pub fn pool(&self) -> Option<&PgPool> {
        self.pool.as_ref()
    }

    pub fn job_handler(&self) -> Arc<SyncJobHandler> {
        Arc::new(SyncJobHandler::new(self.context.clone()))
    }

    pub fn processor(&self, worker_id: impl Into<String>) -> QueueProcessor {
        QueueProcessor::new(
            self.queue.clone(),
            self.job_handler(),
            worker_id,
            QueueProcessorConfig::from_settings(&self.config.processor, &self.config.queue),
        )
    }

    pub fn sweeper(&self) -> LeaseSweeper {
        LeaseSweeper::new(self.queue.clone(), self.config.processor.sweep_interval())
    }

    /// Retry every unresolved failed item, optionally for one run
    pub async fn run_recovery(&self, sync_id: Option<Uuid>) -> Result<RecoveryResult> {
        let records = self.context.records.clone();
        self.context
            .recovery
            .retry_unresolved(sync_id, |item| {
                let records = records.clone();
                let rebuilt = rebuild_record(item);
                async move {
                    let record = rebuilt?;
                    records.upsert_record(&record).await.map(|_| ())
                }
            })
            .await
    }

    pub fn status(&self) -> SystemStatus {
        SystemStatus {
            backend: self.config.datastore.backend,
            database_pool_size: self.pool.as_ref().map(PgPool::size),
            database_pool_idle: self.pool.as_ref().map(PgPool::num_idle),
            circuit_breakers: self.breakers.system_metrics(),
        }
    }
}
