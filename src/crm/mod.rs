//! # CRM API
//!
//! The external CRM is reached through the [`CrmApi`] trait: one paginated
//! fetch per record kind. [`HttpCrmClient`] is the production implementation;
//! [`ScriptedCrm`] replays canned pages and failures for tests.
//!
//! Every response's `X-RateLimit-*` headers end up in the shared
//! [`RateLimitRegistry`], which the resilient executor consults before calling.

pub mod client;
pub mod rate_limit;
pub mod scripted;

pub use client::HttpCrmClient;
pub use rate_limit::{parse_rate_limit_headers, RateLimitHeaders, RateLimitRegistry};
pub use scripted::ScriptedCrm;

use crate::error::{Result, SyncError};
use crate::models::{RateLimitRecord, RecordKind, SyncPeriod};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value;

/// One page request against a record endpoint
#[derive(Debug, Clone, PartialEq)]
pub struct PageRequest {
    pub kind: RecordKind,
    /// 1-based
    pub page: u32,
    pub per_page: u32,
    pub modified_since: Option<DateTime<Utc>>,
    pub period: Option<SyncPeriod>,
    pub date: Option<NaiveDate>,
}

impl PageRequest {
    pub fn first(kind: RecordKind, per_page: u32) -> Self {
        Self {
            kind,
            page: 1,
            per_page,
            modified_since: None,
            period: None,
            date: None,
        }
    }

    pub fn modified_since(mut self, since: Option<DateTime<Utc>>) -> Self {
        self.modified_since = since;
        self
    }

    pub fn for_period(mut self, period: SyncPeriod) -> Self {
        self.period = Some(period);
        self
    }

    pub fn on_date(mut self, date: NaiveDate) -> Self {
        self.date = Some(date);
        self
    }

    pub fn next_page(&self) -> Self {
        Self {
            page: self.page + 1,
            ..self.clone()
        }
    }

    /// Query string pairs in the CRM's parameter names
    pub fn query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![
            ("page", self.page.to_string()),
            ("per_page", self.per_page.to_string()),
        ];
        if let Some(since) = self.modified_since {
            pairs.push(("modified_since", since.to_rfc3339()));
        }
        if let Some(period) = self.period {
            pairs.push(("year", period.year.to_string()));
            pairs.push(("month", period.month.to_string()));
        }
        if let Some(date) = self.date {
            pairs.push(("date", date.format("%Y-%m-%d").to_string()));
        }
        pairs
    }
}

/// A page of raw CRM payloads
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CrmPage {
    pub records: Vec<Value>,
    pub has_more: bool,
    pub rate_limit: Option<RateLimitRecord>,
}

/// Keys a paginated envelope may nest its record array under
const NESTED_RECORD_KEYS: [&str; 4] = ["data", "records", "items", "results"];

fn pagination_meta<'a>(body: &'a Value, data: Option<&'a Value>) -> Option<&'a Value> {
    body.get("meta")
        .or_else(|| data.filter(|d| d.get("last_page").is_some()))
        .or_else(|| body.get("last_page").map(|_| body))
}

impl CrmPage {
    /// Decode a `{"data": [...], "meta": {"current_page", "last_page"}}` body.
    ///
    /// A bare array is accepted, as is a `data` object wrapping the array
    /// under `data`, `records`, `items` or `results` (its own `current_page`
    /// and `last_page` then count as the pagination meta). Any other shape is
    /// rejected. Without meta, a full page means there may be more.
    pub fn from_body(body: Value, request: &PageRequest) -> Result<Self> {
        let data = body.get("data").filter(|d| !d.is_null());
        let records = match (data, &body) {
            (Some(Value::Array(items)), _) => items.clone(),
            (Some(Value::Object(envelope)), _) => NESTED_RECORD_KEYS
                .iter()
                .find_map(|key| envelope.get(*key).and_then(Value::as_array))
                .cloned()
                .ok_or_else(|| {
                    SyncError::validation(format!(
                        "{} response 'data' object has no record array",
                        request.kind.endpoint()
                    ))
                })?,
            (Some(other), _) => {
                return Err(SyncError::validation(format!(
                    "{} response 'data' is not a list: {other}",
                    request.kind.endpoint()
                )))
            }
            (None, Value::Array(items)) => items.clone(),
            (None, _) => Vec::new(),
        };

        let meta_has_more = pagination_meta(&body, data).and_then(|meta| {
            let last = meta.get("last_page").and_then(Value::as_u64)?;
            let current = meta
                .get("current_page")
                .and_then(Value::as_u64)
                .unwrap_or(u64::from(request.page));
            Some(current < last)
        });

        let has_more = meta_has_more.unwrap_or_else(|| {
            request.per_page > 0 && records.len() >= request.per_page as usize
        });

        Ok(Self {
            records,
            has_more,
            rate_limit: None,
        })
    }
}

#[async_trait]
pub trait CrmApi: Send + Sync {
    /// Service name used for breakers and rate-limit telemetry
    fn service_name(&self) -> &str;

    async fn fetch_page(&self, request: &PageRequest) -> Result<CrmPage>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_meta_pagination() {
        let request = PageRequest::first(RecordKind::Merchant, 2);
        let page = CrmPage::from_body(
            json!({"data": [{"mid": "1"}], "meta": {"current_page": 1, "last_page": 3}}),
            &request,
        )
        .unwrap();
        assert_eq!(page.records.len(), 1);
        assert!(page.has_more);

        let last = CrmPage::from_body(
            json!({"data": [], "meta": {"current_page": 3, "last_page": 3}}),
            &request.next_page().next_page(),
        )
        .unwrap();
        assert!(!last.has_more);
    }

    #[test]
    fn test_pagination_without_meta_uses_page_size() {
        let request = PageRequest::first(RecordKind::Residual, 2);
        let full =
            CrmPage::from_body(json!({"data": [{"mid": "1"}, {"mid": "2"}]}), &request).unwrap();
        assert!(full.has_more);
        let short = CrmPage::from_body(json!([{"mid": "1"}]), &request).unwrap();
        assert!(!short.has_more);
        assert_eq!(short.records.len(), 1);
    }

    #[test]
    fn test_object_data_unwraps_nested_records() {
        let request = PageRequest::first(RecordKind::Merchant, 50);
        let page = CrmPage::from_body(
            json!({"data": {
                "data": [{"mid": "1"}, {"mid": "2"}],
                "current_page": 1,
                "last_page": 2,
            }}),
            &request,
        )
        .unwrap();
        assert_eq!(page.records.len(), 2);
        assert!(page.has_more);

        let items = CrmPage::from_body(json!({"data": {"items": [{"mid": "3"}]}}), &request).unwrap();
        assert_eq!(items.records, vec![json!({"mid": "3"})]);
        assert!(!items.has_more);
    }

    #[test]
    fn test_unrecognized_data_shape_is_rejected() {
        let request = PageRequest::first(RecordKind::Merchant, 50);
        let single = CrmPage::from_body(json!({"data": {"mid": "1", "name": "Cafe"}}), &request);
        assert!(matches!(single, Err(SyncError::Validation(_))));

        let scalar = CrmPage::from_body(json!({"data": "maintenance"}), &request);
        assert!(matches!(scalar, Err(SyncError::Validation(_))));

        let empty = CrmPage::from_body(json!({"data": null}), &request).unwrap();
        assert!(empty.records.is_empty());
        assert!(!empty.has_more);
    }

    #[test]
    fn test_query_pairs() {
        let request = PageRequest::first(RecordKind::Transaction, 100)
            .for_period(SyncPeriod::new(2024, 3).unwrap())
            .on_date(NaiveDate::from_ymd_opt(2024, 3, 9).unwrap());
        let pairs = request.query_pairs();
        assert!(pairs.contains(&("month", "3".to_string())));
        assert!(pairs.contains(&("date", "2024-03-09".to_string())));
        assert!(!pairs.iter().any(|(k, _)| *k == "modified_since"));
    }
}
