//! Canned CRM responses for tests. Only constructed explicitly; no
//! configuration value selects it.

use crate::crm::{CrmApi, CrmPage, PageRequest};
use crate::error::{Result, SyncError};
use crate::models::RecordKind;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};

#[derive(Debug, Default)]
struct Script {
    pages: HashMap<RecordKind, Vec<Vec<Value>>>,
    failures: HashMap<RecordKind, VecDeque<SyncError>>,
    requests: Vec<PageRequest>,
}

/// Serves pre-loaded pages per record kind, with optional injected failures
#[derive(Debug)]
pub struct ScriptedCrm {
    service_name: String,
    script: Mutex<Script>,
}

impl Default for ScriptedCrm {
    fn default() -> Self {
        Self::new("crm_api")
    }
}

impl ScriptedCrm {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            script: Mutex::new(Script::default()),
        }
    }

    /// Serve `records` split into pages of `per_page`
    pub fn with_records(self, kind: RecordKind, records: Vec<Value>, per_page: usize) -> Self {
        self.load_records(kind, records, per_page);
        self
    }

    /// Replace the pages served for `kind`
    pub fn load_records(&self, kind: RecordKind, records: Vec<Value>, per_page: usize) {
        let pages = records
            .chunks(per_page.max(1))
            .map(<[Value]>::to_vec)
            .collect();
        self.script.lock().pages.insert(kind, pages);
    }

    /// The next call for `kind` fails with `error` (stackable)
    pub fn fail_next(&self, kind: RecordKind, error: SyncError) {
        self.script
            .lock()
            .failures
            .entry(kind)
            .or_default()
            .push_back(error);
    }

    pub fn requests(&self) -> Vec<PageRequest> {
        self.script.lock().requests.clone()
    }

    pub fn request_count(&self, kind: RecordKind) -> usize {
        self.script
            .lock()
            .requests
            .iter()
            .filter(|r| r.kind == kind)
            .count()
    }
}

#[async_trait]
impl CrmApi for ScriptedCrm {
    fn service_name(&self) -> &str {
        &self.service_name
    }

    async fn fetch_page(&self, request: &PageRequest) -> Result<CrmPage> {
        let mut script = self.script.lock();
        script.requests.push(request.clone());

        if let Some(error) = script
            .failures
            .get_mut(&request.kind)
            .and_then(VecDeque::pop_front)
        {
            return Err(error);
        }

        let pages = script.pages.get(&request.kind);
        let index = request.page.saturating_sub(1) as usize;
        let records = pages
            .and_then(|p| p.get(index))
            .cloned()
            .unwrap_or_default();
        let has_more = pages.is_some_and(|p| index + 1 < p.len());

        Ok(CrmPage {
            records,
            has_more,
            rate_limit: None,
        })
    }
}
