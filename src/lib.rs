#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # CRM Sync Core
//!
//! Keeps a PostgreSQL copy of a rate-limited CRM's merchants, monthly
//! transaction volumes and residual payouts up to date.
//!
//! ## Architecture
//!
//! Syncs are jobs. A trigger (scheduler, CLI or the status interface) enqueues
//! a job; workers claim jobs with `FOR UPDATE SKIP LOCKED` under a lease and
//! run one of three orchestrations:
//!
//! - **historical**: every month from the configured epoch to today
//! - **daily**: incremental merchants, current-month volumes, last month's residuals
//! - **targeted**: a single data type, optionally for one period
//!
//! Every CRM call and datastore write goes through a [`resilience::ResilientExecutor`]
//! (circuit breaker, retry with exponential backoff, rate-limit awareness).
//! Items that still fail are recorded by [`recovery::ErrorRecovery`] and retried
//! later; a run with a small share of failed items finishes `partial`, not `failed`.
//!
//! ## Module Organization
//!
//! - [`models`] - records, periods, run/phase/progress state
//! - [`crm`] - the CRM client and rate-limit header tracking
//! - [`datastore`] - idempotent upserts and sync history
//! - [`queue`] - the persistent job queue, its processor and lease sweeper
//! - [`resilience`] - circuit breakers, backoff and the resilient executor
//! - [`recovery`] - failed-item bookkeeping and retries
//! - [`strategy`] - full vs incremental recommendations
//! - [`progress`] - live progress snapshots and broadcast
//! - [`orchestration`] - the run shapes and system bootstrap
//! - [`web`] - the HTTP status interface
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use crm_sync::config::ConfigManager;
//! use crm_sync::orchestration::SyncSystem;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ConfigManager::load()?;
//! let system = SyncSystem::bootstrap(manager.config().clone()).await?;
//! let processed = system.processor("worker-1").run_once().await?;
//! println!("processed: {:?}", processed.map(|p| p.job_id));
//! # Ok(())
//! # }
//! ```
//!
//! ## Testing
//!
//! ```bash
//! cargo test                                   # memory-backed unit and integration tests
//! DATABASE_URL=postgres://... cargo test -- --ignored   # PostgreSQL store tests
//! ```

pub mod clock;
pub mod config;
pub mod crm;
pub mod datastore;
pub mod error;
pub mod logging;
pub mod models;
pub mod notifications;
pub mod orchestration;
pub mod progress;
pub mod queue;
pub mod recovery;
pub mod resilience;
pub mod strategy;
pub mod test_helpers;
pub mod web;

pub use config::{ConfigManager, CrmSyncConfig};
pub use error::{Result, SyncError};
pub use models::{DataType, RecordKind, RunStatus, SyncPeriod, SyncPhase};
pub use orchestration::{SyncService, SyncSystem};
