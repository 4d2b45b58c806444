use crate::error::Result;
use crate::models::{FailedSyncItem, NewFailedSyncItem};
use crate::recovery::FailedItemStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

const ITEM_COLUMNS: &str = "id, sync_id, item_type, item_id, error_details, is_transient, \
     retry_count, created_at, resolved_at";

#[derive(Debug, FromRow)]
struct FailedItemRow {
    id: Uuid,
    sync_id: Uuid,
    item_type: String,
    item_id: String,
    error_details: Value,
    is_transient: bool,
    retry_count: i32,
    created_at: DateTime<Utc>,
    resolved_at: Option<DateTime<Utc>>,
}

impl From<FailedItemRow> for FailedSyncItem {
    fn from(row: FailedItemRow) -> Self {
        FailedSyncItem {
            id: row.id,
            sync_id: row.sync_id,
            item_type: row.item_type,
            item_id: row.item_id,
            error_details: row.error_details,
            is_transient: row.is_transient,
            retry_count: row.retry_count,
            created_at: row.created_at,
            resolved_at: row.resolved_at,
        }
    }
}

/// `failed_sync_items` table
#[derive(Debug, Clone)]
pub struct PgFailedItemStore {
    pool: PgPool,
}

impl PgFailedItemStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl FailedItemStore for PgFailedItemStore {
    async fn insert(&self, item: &NewFailedSyncItem, now: DateTime<Utc>) -> Result<FailedSyncItem> {
        let row: FailedItemRow = sqlx::query_as(&format!(
            "INSERT INTO failed_sync_items (sync_id, item_type, item_id, error_details, is_transient, created_at)
             VALUES ($1, $2, $3, $4, $5, $6)
             RETURNING {ITEM_COLUMNS}"
        ))
        .bind(item.sync_id)
        .bind(&item.item_type)
        .bind(&item.item_id)
        .bind(&item.error_details)
        .bind(item.is_transient)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }

    async fn get(&self, id: Uuid) -> Result<Option<FailedSyncItem>> {
        let row: Option<FailedItemRow> = sqlx::query_as(&format!(
            "SELECT {ITEM_COLUMNS} FROM failed_sync_items WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn list_unresolved(&self, sync_id: Option<Uuid>) -> Result<Vec<FailedSyncItem>> {
        let rows: Vec<FailedItemRow> = sqlx::query_as(&format!(
            "SELECT {ITEM_COLUMNS} FROM failed_sync_items
             WHERE resolved_at IS NULL AND ($1::UUID IS NULL OR sync_id = $1)
             ORDER BY created_at ASC"
        ))
        .bind(sync_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn mark_resolved(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE failed_sync_items SET resolved_at = $2 WHERE id = $1 AND resolved_at IS NULL",
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn record_retry_failure(&self, id: Uuid, error_details: &Value) -> Result<()> {
        sqlx::query(
            "UPDATE failed_sync_items
             SET retry_count = retry_count + 1, error_details = $2
             WHERE id = $1",
        )
        .bind(id)
        .bind(error_details)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
