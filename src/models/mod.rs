//! # Sync Data Model
//!
//! Plain domain types shared by the queue, the stores and the orchestrators.
//! Database row mapping lives next to each Postgres store, not here.

pub mod failed_item;
pub mod period;
pub mod phase;
pub mod progress;
pub mod rate_limit;
pub mod record;
pub mod run;
pub mod watermark;

pub use failed_item::{FailedSyncItem, NewFailedSyncItem};
pub use period::SyncPeriod;
pub use phase::SyncPhase;
pub use progress::{ProgressUpdate, SyncProgress};
pub use rate_limit::RateLimitRecord;
pub use record::{content_hash, CrmRecord, DataType, RecordKind, UpsertOutcome};
pub use run::{RunStatus, SyncRunRecord};
pub use watermark::{SyncMode, SyncWatermark};
