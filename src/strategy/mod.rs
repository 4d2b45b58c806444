//! # Sync Strategy Analyzer
//!
//! Reads the watermark history for a `(data_type, scope)` pair plus the latest
//! rate-limit telemetry and recommends whether the next run should be full or
//! incremental, and how long to wait before it.
//!
//! Rules are checked in order and the first match wins:
//!
//! | # | Condition                                   | Result      | Confidence |
//! |---|---------------------------------------------|-------------|------------|
//! | 1 | no full sync recorded                       | full        | 0.95       |
//! | 2 | incrementals since last full > cap          | full        | 0.90       |
//! | 3 | share of recent runs with errors > limit    | full        | 0.85       |
//! | 4 | inconsistency rate since last full > limit  | full        | 0.80       |
//! | 5 | changes since last full / its size > limit  | full        | 0.75       |
//! | 6 | remaining quota ratio < limit               | defer       | 0.70       |
//! | 7 | otherwise                                   | incremental | 0.80       |
//!
//! The result is advisory; orchestrators log when they run something else.

use crate::config::StrategyConfig;
use crate::crm::RateLimitRegistry;
use crate::datastore::SyncHistoryStore;
use crate::error::Result;
use crate::models::{SyncMode, SyncWatermark};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Upper bound on watermarks read when counting runs since the last full sync
const HISTORY_SCAN_LIMIT: i64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NextSyncType {
    Full,
    Incremental,
    Deferred,
}

impl fmt::Display for NextSyncType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            NextSyncType::Full => "full",
            NextSyncType::Incremental => "incremental",
            NextSyncType::Deferred => "deferred",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub recommend_full_sync: bool,
    pub confidence: f64,
    pub reason: String,
    pub next_sync_type: NextSyncType,
    #[serde(with = "duration_secs")]
    pub optimal_interval: Duration,
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

/// Inputs to [`recommend`], derived from history
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncMetrics {
    pub has_full_sync: bool,
    pub incremental_since_last_full: i64,
    /// Share of the last `error_window` runs that reported errors
    pub recent_error_rate: f64,
    /// Inconsistencies per processed record since the last full sync
    pub inconsistency_rate: f64,
    /// Records changed since the last full sync relative to its size
    pub change_ratio: f64,
    /// Changed/processed in the most recent run
    pub latest_change_rate: f64,
    pub quota_ratio: Option<f64>,
}

fn ratio(numerator: i64, denominator: i64) -> f64 {
    if denominator <= 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

impl SyncMetrics {
    /// `history` newest first, `last_full` the newest full-mode watermark
    pub fn from_history(
        history: &[SyncWatermark],
        last_full: Option<&SyncWatermark>,
        error_window: usize,
        quota_ratio: Option<f64>,
    ) -> Self {
        let Some(last_full) = last_full else {
            return Self {
                quota_ratio,
                ..Self::default()
            };
        };

        let since_full: Vec<&SyncWatermark> = history
            .iter()
            .filter(|w| w.created_at > last_full.created_at)
            .collect();

        let incremental_since_last_full = since_full
            .iter()
            .filter(|w| w.sync_mode == SyncMode::Incremental)
            .count() as i64;

        let window: Vec<&SyncWatermark> = history.iter().take(error_window).collect();
        let recent_error_rate = if window.is_empty() {
            0.0
        } else {
            window.iter().filter(|w| w.had_errors()).count() as f64 / window.len() as f64
        };

        let processed: i64 = since_full.iter().map(|w| w.records_processed).sum();
        let inconsistencies: i64 = since_full.iter().map(|w| w.inconsistency_count).sum();
        let changed: i64 = since_full.iter().map(|w| w.records_changed).sum();

        let latest_change_rate = history
            .first()
            .map(|w| ratio(w.records_changed, w.records_processed))
            .unwrap_or(0.0);

        Self {
            has_full_sync: true,
            incremental_since_last_full,
            recent_error_rate,
            inconsistency_rate: ratio(inconsistencies, processed),
            change_ratio: ratio(changed, last_full.records_processed),
            latest_change_rate,
            quota_ratio,
        }
    }
}

fn minutes(n: i64) -> Duration {
    Duration::from_secs(u64::try_from(n.max(0)).unwrap_or(0) * 60)
}

fn full(confidence: f64, reason: String, config: &StrategyConfig) -> Recommendation {
    Recommendation {
        recommend_full_sync: true,
        confidence,
        reason,
        next_sync_type: NextSyncType::Full,
        optimal_interval: minutes(config.base_interval_minutes),
    }
}

/// Incremental polling interval from quota headroom and change volume
pub fn optimal_interval(metrics: &SyncMetrics, config: &StrategyConfig) -> Duration {
    let mut interval = minutes(config.base_interval_minutes);
    if metrics.quota_ratio.is_some_and(|q| q < 0.5) {
        interval *= 2;
    }
    if metrics.latest_change_rate > 0.3 {
        interval /= 2;
    } else if metrics.latest_change_rate < 0.05 {
        interval *= 2;
    }
    interval.clamp(
        minutes(config.min_interval_minutes),
        minutes(config.max_interval_hours * 60),
    )
}

/// Apply the decision table to already-collected metrics
pub fn recommend(metrics: &SyncMetrics, config: &StrategyConfig) -> Recommendation {
    if !metrics.has_full_sync {
        return full(0.95, "no previous full sync".to_string(), config);
    }
    if metrics.incremental_since_last_full > config.max_incremental_before_full {
        return full(
            0.9,
            format!(
                "{} incremental syncs since last full sync (cap {})",
                metrics.incremental_since_last_full, config.max_incremental_before_full
            ),
            config,
        );
    }
    if metrics.recent_error_rate > config.error_rate_threshold {
        return full(
            0.85,
            format!(
                "recent error rate {:.0}% above {:.0}%",
                metrics.recent_error_rate * 100.0,
                config.error_rate_threshold * 100.0
            ),
            config,
        );
    }
    if metrics.inconsistency_rate > config.inconsistency_threshold {
        return full(
            0.8,
            format!(
                "inconsistency rate {:.1}% above {:.1}%",
                metrics.inconsistency_rate * 100.0,
                config.inconsistency_threshold * 100.0
            ),
            config,
        );
    }
    if metrics.change_ratio > config.change_ratio_threshold {
        return full(
            0.75,
            format!(
                "{:.0}% of records changed since last full sync",
                metrics.change_ratio * 100.0
            ),
            config,
        );
    }
    if let Some(quota) = metrics.quota_ratio.filter(|q| *q < config.low_quota_threshold) {
        return Recommendation {
            recommend_full_sync: false,
            confidence: 0.7,
            reason: format!("API quota low ({:.0}% remaining)", quota * 100.0),
            next_sync_type: NextSyncType::Deferred,
            optimal_interval: minutes(config.deferral_hours * 60),
        };
    }

    Recommendation {
        recommend_full_sync: false,
        confidence: 0.8,
        reason: "incremental sync is sufficient".to_string(),
        next_sync_type: NextSyncType::Incremental,
        optimal_interval: optimal_interval(metrics, config),
    }
}

pub struct SyncStrategyAnalyzer {
    history: Arc<dyn SyncHistoryStore>,
    rate_limits: Arc<RateLimitRegistry>,
    service_name: String,
    config: StrategyConfig,
}

impl SyncStrategyAnalyzer {
    pub fn new(
        history: Arc<dyn SyncHistoryStore>,
        rate_limits: Arc<RateLimitRegistry>,
        service_name: impl Into<String>,
        config: StrategyConfig,
    ) -> Self {
        Self {
            history,
            rate_limits,
            service_name: service_name.into(),
            config,
        }
    }

    /// Quota from live telemetry, falling back to the last persisted record
    async fn quota_ratio(&self) -> Result<Option<f64>> {
        if let Some(ratio) = self.rate_limits.quota_ratio(&self.service_name) {
            return Ok(Some(ratio));
        }
        Ok(self
            .history
            .latest_rate_limit(&self.service_name)
            .await?
            .and_then(|r| r.quota_ratio()))
    }

    pub async fn collect_metrics(&self, data_type: &str, sync_scope: &str) -> Result<SyncMetrics> {
        let last_full = self
            .history
            .latest_watermark(data_type, sync_scope, Some(SyncMode::Full))
            .await?;

        let since = last_full.as_ref().map(|w| w.created_at);
        let mut history = self
            .history
            .watermark_history(data_type, sync_scope, since, HISTORY_SCAN_LIMIT)
            .await?;

        // The error window may reach back past the last full sync
        if history.len() < self.config.error_window {
            history = self
                .history
                .watermark_history(data_type, sync_scope, None, HISTORY_SCAN_LIMIT)
                .await?;
        }

        let quota = self.quota_ratio().await?;
        Ok(SyncMetrics::from_history(
            &history,
            last_full.as_ref(),
            self.config.error_window,
            quota,
        ))
    }

    pub async fn analyze_sync_strategy(
        &self,
        data_type: &str,
        sync_scope: &str,
    ) -> Result<Recommendation> {
        let metrics = self.collect_metrics(data_type, sync_scope).await?;
        debug!(data_type, sync_scope, ?metrics, "Collected sync metrics");

        let recommendation = recommend(&metrics, &self.config);
        info!(
            data_type,
            sync_scope,
            next_sync_type = %recommendation.next_sync_type,
            confidence = recommendation.confidence,
            interval_minutes = recommendation.optimal_interval.as_secs() / 60,
            reason = %recommendation.reason,
            "Sync strategy recommendation"
        );
        Ok(recommendation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::MemoryDatastore;
    use crate::models::RateLimitRecord;
    use chrono::Utc;

    fn healthy() -> SyncMetrics {
        SyncMetrics {
            has_full_sync: true,
            incremental_since_last_full: 3,
            recent_error_rate: 0.0,
            inconsistency_rate: 0.0,
            change_ratio: 0.1,
            latest_change_rate: 0.1,
            quota_ratio: Some(0.9),
        }
    }

    #[test]
    fn test_first_sync_is_full() {
        let rec = recommend(&SyncMetrics::default(), &StrategyConfig::default());
        assert!(rec.recommend_full_sync);
        assert_eq!(rec.confidence, 0.95);
    }

    #[test]
    fn test_escalates_after_too_many_incrementals() {
        let config = StrategyConfig::default();
        let at_cap = SyncMetrics {
            incremental_since_last_full: 48,
            ..healthy()
        };
        assert!(!recommend(&at_cap, &config).recommend_full_sync);

        let over = SyncMetrics {
            incremental_since_last_full: 50,
            ..healthy()
        };
        let rec = recommend(&over, &config);
        assert!(rec.recommend_full_sync);
        assert_eq!(rec.next_sync_type, NextSyncType::Full);
        assert_eq!(rec.confidence, 0.9);
    }

    #[test]
    fn test_first_matching_rule_wins() {
        let config = StrategyConfig::default();
        let metrics = SyncMetrics {
            recent_error_rate: 0.5,
            change_ratio: 0.9,
            quota_ratio: Some(0.01),
            ..healthy()
        };
        assert_eq!(recommend(&metrics, &config).confidence, 0.85);
    }

    #[test]
    fn test_low_quota_defers() {
        let config = StrategyConfig::default();
        let rec = recommend(
            &SyncMetrics {
                quota_ratio: Some(0.1),
                ..healthy()
            },
            &config,
        );
        assert_eq!(rec.next_sync_type, NextSyncType::Deferred);
        assert_eq!(rec.optimal_interval, Duration::from_secs(6 * 3600));
    }

    #[test]
    fn test_interval_scaling_and_bounds() {
        let config = StrategyConfig::default();
        let busy = SyncMetrics {
            latest_change_rate: 0.6,
            ..healthy()
        };
        assert_eq!(optimal_interval(&busy, &config), Duration::from_secs(30 * 60));

        let quiet_and_throttled = SyncMetrics {
            latest_change_rate: 0.0,
            quota_ratio: Some(0.3),
            ..healthy()
        };
        assert_eq!(
            optimal_interval(&quiet_and_throttled, &config),
            Duration::from_secs(240 * 60)
        );

        let tight = StrategyConfig {
            base_interval_minutes: 20,
            ..StrategyConfig::default()
        };
        assert_eq!(optimal_interval(&busy, &tight), Duration::from_secs(15 * 60));
    }

    #[tokio::test]
    async fn test_analyzer_reads_history() {
        let store = Arc::new(MemoryDatastore::new());
        let registry = Arc::new(RateLimitRegistry::new());
        let start = Utc::now();

        let watermark = |i: i64, mode: SyncMode, changed: i64| SyncWatermark {
            data_type: "merchants".into(),
            sync_scope: "default".into(),
            sync_mode: mode,
            last_sync_timestamp: start,
            records_processed: 100,
            records_changed: changed,
            error_count: 0,
            inconsistency_count: 0,
            created_at: start + chrono::Duration::minutes(i),
        };
        store.record_watermark(&watermark(0, SyncMode::Full, 100)).await.unwrap();
        for i in 1..=50 {
            store
                .record_watermark(&watermark(i, SyncMode::Incremental, 1))
                .await
                .unwrap();
        }
        registry.record(RateLimitRecord {
            service: "crm_api".into(),
            endpoint: "/merchants".into(),
            remaining: 90,
            limit: 100,
            reset_at: None,
            recorded_at: start,
        });

        let analyzer =
            SyncStrategyAnalyzer::new(store, registry, "crm_api", StrategyConfig::default());
        let metrics = analyzer.collect_metrics("merchants", "default").await.unwrap();
        assert_eq!(metrics.incremental_since_last_full, 50);
        assert_eq!(metrics.quota_ratio, Some(0.9));

        let rec = analyzer
            .analyze_sync_strategy("merchants", "default")
            .await
            .unwrap();
        assert!(rec.recommend_full_sync);
    }
}
