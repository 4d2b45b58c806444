use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Latest rate-limit telemetry reported by an external service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitRecord {
    pub service: String,
    pub endpoint: String,
    pub remaining: i64,
    pub limit: i64,
    pub reset_at: Option<DateTime<Utc>>,
    pub recorded_at: DateTime<Utc>,
}

impl RateLimitRecord {
    /// Remaining quota as a fraction of the limit, `None` when the limit is unknown
    pub fn quota_ratio(&self) -> Option<f64> {
        if self.limit <= 0 {
            return None;
        }
        Some((self.remaining.max(0) as f64 / self.limit as f64).clamp(0.0, 1.0))
    }

    /// Whether the quota is used up and will not reset before `now`
    pub fn is_exhausted_at(&self, now: DateTime<Utc>) -> bool {
        self.remaining <= 0 && self.reset_at.is_some_and(|reset| reset > now)
    }
}
