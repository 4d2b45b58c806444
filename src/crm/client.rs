//! reqwest-backed CRM client.

use crate::clock::Clock;
use crate::config::CrmConfig;
use crate::crm::{parse_rate_limit_headers, CrmApi, CrmPage, PageRequest, RateLimitRegistry};
use crate::error::{Result, SyncError};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT};
use reqwest::{Client, StatusCode, Url};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// Longest response body excerpt kept in an error message
const ERROR_BODY_LIMIT: usize = 512;

pub struct HttpCrmClient {
    client: Client,
    base_url: String,
    service_name: String,
    rate_limits: Arc<RateLimitRegistry>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for HttpCrmClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpCrmClient")
            .field("base_url", &self.base_url)
            .field("service_name", &self.service_name)
            .field("api_key", &"[MASKED]")
            .finish()
    }
}

impl HttpCrmClient {
    pub fn new(
        config: &CrmConfig,
        rate_limits: Arc<RateLimitRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        Url::parse(&config.base_url).map_err(|e| {
            SyncError::Configuration(format!("Invalid CRM base URL '{}': {e}", config.base_url))
        })?;

        let mut default_headers = HeaderMap::new();
        default_headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        if !config.api_key.is_empty() {
            let mut key = HeaderValue::from_str(&config.api_key)
                .map_err(|e| SyncError::Configuration(format!("Invalid CRM API key: {e}")))?;
            key.set_sensitive(true);
            default_headers.insert("X-API-KEY", key);
        }

        let client = Client::builder()
            .timeout(config.request_timeout())
            .user_agent(format!("crm-sync-core/{}", env!("CARGO_PKG_VERSION")))
            .default_headers(default_headers)
            .build()
            .map_err(|e| SyncError::Configuration(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            service_name: config.service_name.clone(),
            rate_limits,
            clock,
        })
    }

    fn endpoint_url(&self, endpoint: &str) -> Result<Url> {
        Url::parse(&format!("{}{endpoint}", self.base_url))
            .map_err(|e| SyncError::Configuration(format!("Invalid CRM URL for {endpoint}: {e}")))
    }
}

#[async_trait]
impl CrmApi for HttpCrmClient {
    fn service_name(&self) -> &str {
        &self.service_name
    }

    #[instrument(skip(self), fields(endpoint = request.kind.endpoint(), page = request.page))]
    async fn fetch_page(&self, request: &PageRequest) -> Result<CrmPage> {
        let endpoint = request.kind.endpoint();
        let mut url = self.endpoint_url(endpoint)?;
        url.query_pairs_mut().extend_pairs(request.query_pairs());

        debug!(url = %url, "Fetching CRM page");
        let response = self.client.get(url).send().await?;

        let status = response.status();
        let limits = parse_rate_limit_headers(response.headers(), self.clock.now());
        let retry_after = limits.retry_after;
        let rate_limit = limits.into_record(&self.service_name, endpoint, self.clock.now());
        if let Some(record) = &rate_limit {
            self.rate_limits.record(record.clone());
        }

        if status == StatusCode::TOO_MANY_REQUESTS {
            warn!(endpoint, retry_after_secs = ?retry_after.map(|d| d.as_secs()), "CRM rate limit hit");
            return Err(SyncError::RateLimited {
                service: self.service_name.clone(),
                retry_after,
            });
        }

        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            let excerpt: String = body.chars().take(ERROR_BODY_LIMIT).collect();
            return Err(SyncError::http(status.as_u16(), endpoint, excerpt));
        }

        let body: Value = response.json().await?;
        let mut page = CrmPage::from_body(body, request)?;
        page.rate_limit = rate_limit;

        debug!(
            endpoint,
            records = page.records.len(),
            has_more = page.has_more,
            "Fetched CRM page"
        );
        Ok(page)
    }
}
