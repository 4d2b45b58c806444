use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A single record that failed to persist during a sync run.
///
/// Never purged automatically; it stays until a recovery pass or an operator
/// resolves it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedSyncItem {
    pub id: Uuid,
    pub sync_id: Uuid,
    pub item_type: String,
    pub item_id: String,
    /// `{"error", "category", "payload"}`
    pub error_details: Value,
    pub is_transient: bool,
    pub retry_count: i32,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl FailedSyncItem {
    pub fn is_resolved(&self) -> bool {
        self.resolved_at.is_some()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewFailedSyncItem {
    pub sync_id: Uuid,
    pub item_type: String,
    pub item_id: String,
    pub error_details: Value,
    pub is_transient: bool,
}
