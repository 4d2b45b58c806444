//! Rate-limit telemetry shared between the CRM client, the resilient executor
//! and the strategy analyzer.

use crate::models::RateLimitRecord;
use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use reqwest::header::HeaderMap;
use std::time::Duration;
use tracing::debug;

pub const LIMIT_HEADER: &str = "x-ratelimit-limit";
pub const REMAINING_HEADER: &str = "x-ratelimit-remaining";
pub const RESET_HEADER: &str = "x-ratelimit-reset";
pub const RETRY_AFTER_HEADER: &str = "retry-after";

/// Reset values above this are unix timestamps, below it a delay in seconds
const EPOCH_THRESHOLD: i64 = 1_000_000_000;

/// Values read from one response's rate-limit headers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RateLimitHeaders {
    pub limit: Option<i64>,
    pub remaining: Option<i64>,
    pub reset_at: Option<DateTime<Utc>>,
    pub retry_after: Option<Duration>,
}

impl RateLimitHeaders {
    pub fn is_empty(&self) -> bool {
        self.limit.is_none() && self.remaining.is_none() && self.reset_at.is_none()
    }

    /// Telemetry record for these headers. `None` without a remaining count:
    /// an unknown quota must not read as an exhausted one.
    pub fn into_record(
        self,
        service: &str,
        endpoint: &str,
        now: DateTime<Utc>,
    ) -> Option<RateLimitRecord> {
        let remaining = self.remaining?;
        Some(RateLimitRecord {
            service: service.to_string(),
            endpoint: endpoint.to_string(),
            remaining,
            limit: self.limit.unwrap_or(0),
            reset_at: self.reset_at,
            recorded_at: now,
        })
    }
}

fn header_i64(headers: &HeaderMap, name: &str) -> Option<i64> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<i64>().ok())
}

/// Parse `X-RateLimit-*` and `Retry-After`. Unparseable values are ignored.
pub fn parse_rate_limit_headers(headers: &HeaderMap, now: DateTime<Utc>) -> RateLimitHeaders {
    let reset_at = header_i64(headers, RESET_HEADER).and_then(|reset| {
        if reset >= EPOCH_THRESHOLD {
            Utc.timestamp_opt(reset, 0).single()
        } else {
            Some(now + chrono::Duration::seconds(reset.max(0)))
        }
    });

    RateLimitHeaders {
        limit: header_i64(headers, LIMIT_HEADER),
        remaining: header_i64(headers, REMAINING_HEADER),
        reset_at,
        retry_after: header_i64(headers, RETRY_AFTER_HEADER)
            .filter(|secs| *secs >= 0)
            .map(|secs| Duration::from_secs(secs as u64)),
    }
}

/// Latest rate-limit record per service
#[derive(Debug, Default)]
pub struct RateLimitRegistry {
    records: DashMap<String, RateLimitRecord>,
}

impl RateLimitRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, record: RateLimitRecord) {
        debug!(
            service = %record.service,
            endpoint = %record.endpoint,
            remaining = record.remaining,
            limit = record.limit,
            "Rate limit telemetry"
        );
        self.records.insert(record.service.clone(), record);
    }

    pub fn get(&self, service: &str) -> Option<RateLimitRecord> {
        self.records.get(service).map(|r| r.value().clone())
    }

    pub fn quota_ratio(&self, service: &str) -> Option<f64> {
        self.records.get(service).and_then(|r| r.quota_ratio())
    }

    /// How long to hold off before calling `service`, when its quota is used up
    /// and the reset is still in the future
    pub fn wait_needed(&self, service: &str, now: DateTime<Utc>) -> Option<Duration> {
        let record = self.records.get(service)?;
        if !record.is_exhausted_at(now) {
            return None;
        }
        record
            .reset_at
            .and_then(|reset| (reset - now).to_std().ok())
    }

    pub fn snapshot(&self) -> Vec<RateLimitRecord> {
        self.records.iter().map(|r| r.value().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_str(value).unwrap());
        }
        map
    }

    #[test]
    fn test_parse_relative_and_epoch_reset() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();

        let relative = parse_rate_limit_headers(
            &headers(&[
                ("x-ratelimit-limit", "100"),
                ("x-ratelimit-remaining", "7"),
                ("x-ratelimit-reset", "30"),
            ]),
            now,
        );
        assert_eq!(relative.limit, Some(100));
        assert_eq!(relative.remaining, Some(7));
        assert_eq!(relative.reset_at, Some(now + chrono::Duration::seconds(30)));

        let epoch = parse_rate_limit_headers(
            &headers(&[("x-ratelimit-reset", "1714565000"), ("retry-after", "12")]),
            now,
        );
        assert_eq!(epoch.reset_at, Utc.timestamp_opt(1_714_565_000, 0).single());
        assert_eq!(epoch.retry_after, Some(Duration::from_secs(12)));
    }

    #[test]
    fn test_garbage_headers_ignored() {
        let parsed = parse_rate_limit_headers(
            &headers(&[("x-ratelimit-limit", "lots"), ("retry-after", "Wed, 21 Oct 2015")]),
            Utc::now(),
        );
        assert!(parsed.is_empty());
        assert!(parsed.retry_after.is_none());
        assert!(parsed.into_record("crm_api", "/merchants", Utc::now()).is_none());
    }

    #[test]
    fn test_missing_remaining_is_unknown_not_exhausted() {
        let now = Utc::now();
        let parsed = parse_rate_limit_headers(
            &headers(&[("x-ratelimit-limit", "100"), ("x-ratelimit-reset", "30")]),
            now,
        );
        assert!(!parsed.is_empty());
        assert!(parsed.remaining.is_none());
        assert!(parsed.into_record("crm_api", "/merchants", now).is_none());

        let registry = RateLimitRegistry::new();
        let with_remaining = parse_rate_limit_headers(
            &headers(&[("x-ratelimit-remaining", "40"), ("x-ratelimit-reset", "30")]),
            now,
        );
        registry.record(with_remaining.into_record("crm_api", "/merchants", now).unwrap());
        // Limit unknown: no ratio, and 40 left is not a reason to wait
        assert_eq!(registry.quota_ratio("crm_api"), None);
        assert!(registry.wait_needed("crm_api", now).is_none());
    }

    #[test]
    fn test_wait_needed_only_when_exhausted() {
        let now = Utc::now();
        let registry = RateLimitRegistry::new();
        assert!(registry.wait_needed("crm_api", now).is_none());

        registry.record(RateLimitRecord {
            service: "crm_api".into(),
            endpoint: "/merchants".into(),
            remaining: 0,
            limit: 100,
            reset_at: Some(now + chrono::Duration::seconds(5)),
            recorded_at: now,
        });
        let wait = registry.wait_needed("crm_api", now).unwrap();
        assert_eq!(wait, Duration::from_secs(5));
        assert_eq!(registry.quota_ratio("crm_api"), Some(0.0));

        let later = now + chrono::Duration::seconds(6);
        assert!(registry.wait_needed("crm_api", later).is_none());
    }
}
