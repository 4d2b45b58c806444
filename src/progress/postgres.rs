use crate::error::{Result, SyncError};
use crate::models::{SyncPhase, SyncProgress};
use crate::progress::ProgressStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

#[derive(Debug, FromRow)]
struct ProgressRow {
    sync_id: Uuid,
    phase: String,
    progress: f64,
    message: String,
    details: Value,
    last_update: DateTime<Utc>,
}

impl TryFrom<ProgressRow> for SyncProgress {
    type Error = SyncError;

    fn try_from(row: ProgressRow) -> Result<Self> {
        Ok(SyncProgress {
            sync_id: row.sync_id,
            phase: row.phase.parse::<SyncPhase>().map_err(SyncError::Database)?,
            progress: row.progress,
            message: row.message,
            details: row.details,
            last_update: row.last_update,
        })
    }
}

/// `sync_progress` table, keyed by `sync_id`
#[derive(Debug, Clone)]
pub struct PgProgressStore {
    pool: PgPool,
}

impl PgProgressStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ProgressStore for PgProgressStore {
    async fn upsert(&self, progress: &SyncProgress) -> Result<()> {
        sqlx::query(
            "INSERT INTO sync_progress (sync_id, phase, progress, message, details, last_update)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (sync_id) DO UPDATE
                SET phase = EXCLUDED.phase,
                    progress = EXCLUDED.progress,
                    message = EXCLUDED.message,
                    details = EXCLUDED.details,
                    last_update = EXCLUDED.last_update",
        )
        .bind(progress.sync_id)
        .bind(progress.phase.as_str())
        .bind(progress.progress)
        .bind(&progress.message)
        .bind(&progress.details)
        .bind(progress.last_update)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, sync_id: Uuid) -> Result<Option<SyncProgress>> {
        let row: Option<ProgressRow> = sqlx::query_as(
            "SELECT sync_id, phase, progress, message, details, last_update
             FROM sync_progress WHERE sync_id = $1",
        )
        .bind(sync_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(SyncProgress::try_from).transpose()
    }

    async fn delete(&self, sync_id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM sync_progress WHERE sync_id = $1")
            .bind(sync_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_active(&self) -> Result<Vec<SyncProgress>> {
        let rows: Vec<ProgressRow> = sqlx::query_as(
            "SELECT sync_id, phase, progress, message, details, last_update
             FROM sync_progress
             WHERE phase NOT IN ('completed', 'failed')
             ORDER BY last_update DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(SyncProgress::try_from).collect()
    }
}
