//! # Sync Orchestration
//!
//! Everything between a claimed job and the datastore:
//!
//! - [`record_sync`]: one paginated, chunked, recoverable pass over a CRM collection
//! - [`historical`], [`daily`], [`targeted`]: the three run shapes, each a
//!   sequence of record passes followed by the metrics refresh
//! - [`handler`]: the queue's [`crate::queue::JobHandler`] dispatching on job type
//! - [`service`]: trigger/status operations used by the web layer and the CLI
//! - [`bootstrap`]: builds all of the above from configuration
//!
//! Run phases move through [`state::RunStateMachine`]; an illegal move is a bug
//! and aborts the run.

pub mod bootstrap;
pub mod context;
pub mod daily;
pub mod handler;
pub mod historical;
pub mod record_sync;
pub mod run;
pub mod service;
pub mod state;
pub mod targeted;

pub use bootstrap::{SyncComponents, SyncSystem, SystemStatus, MIGRATOR};
pub use context::SyncContext;
pub use daily::DailySyncManager;
pub use handler::{SyncJobHandler, SyncJobPayload};
pub use historical::HistoricalSyncManager;
pub use record_sync::{run_sub_sync, SubSyncReport, SubSyncSpec};
pub use run::RunSummary;
pub use service::{StartSyncRequest, StartSyncResponse, SyncService, SyncStatusEntry, SyncStatusReport};
pub use state::RunStateMachine;
pub use targeted::{TargetedSyncManager, TargetedSyncRequest};
