use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    Full,
    Incremental,
}

impl SyncMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncMode::Full => "full",
            SyncMode::Incremental => "incremental",
        }
    }
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => Ok(SyncMode::Full),
            "incremental" => Ok(SyncMode::Incremental),
            other => Err(format!("unknown sync mode: {other}")),
        }
    }
}

/// One completed run for a `(data_type, sync_scope)` pair.
///
/// Watermarks are append-only; the newest row is the resume point for the next
/// incremental sync and the whole history feeds the strategy analyzer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncWatermark {
    pub data_type: String,
    pub sync_scope: String,
    pub sync_mode: SyncMode,
    pub last_sync_timestamp: DateTime<Utc>,
    pub records_processed: i64,
    pub records_changed: i64,
    pub error_count: i64,
    pub inconsistency_count: i64,
    pub created_at: DateTime<Utc>,
}

impl SyncWatermark {
    pub fn had_errors(&self) -> bool {
        self.error_count > 0
    }
}
