//! Postgres datastore.
//!
//! Record upserts rely on `ON CONFLICT` against each table's natural key and
//! skip the write when the stored `content_hash` already matches. The
//! `RETURNING (xmax = 0)` trick tells inserts from updates; no returned row
//! means the hash matched and nothing was written.

use crate::datastore::{RecordStore, SyncHistoryStore};
use crate::error::{Result, SyncError};
use crate::models::{
    CrmRecord, RateLimitRecord, RecordKind, RunStatus, SyncMode, SyncRunRecord, SyncWatermark,
    UpsertOutcome,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::types::Json;
use sqlx::{FromRow, PgConnection, PgPool};
use tracing::{debug, error, instrument};
use uuid::Uuid;

const UPSERT_MERCHANT: &str = r#"
    INSERT INTO merchants (merchant_number, payload, content_hash, synced_at)
    VALUES ($1, $2, $3, NOW())
    ON CONFLICT (merchant_number) DO UPDATE
        SET payload = EXCLUDED.payload,
            content_hash = EXCLUDED.content_hash,
            synced_at = EXCLUDED.synced_at
        WHERE merchants.content_hash IS DISTINCT FROM EXCLUDED.content_hash
    RETURNING (xmax = 0) AS inserted
"#;

const UPSERT_TRANSACTION: &str = r#"
    INSERT INTO merchant_transactions (merchant_number, year, month, payload, content_hash, synced_at)
    VALUES ($1, $2, $3, $4, $5, NOW())
    ON CONFLICT (merchant_number, year, month) DO UPDATE
        SET payload = EXCLUDED.payload,
            content_hash = EXCLUDED.content_hash,
            synced_at = EXCLUDED.synced_at
        WHERE merchant_transactions.content_hash IS DISTINCT FROM EXCLUDED.content_hash
    RETURNING (xmax = 0) AS inserted
"#;

const UPSERT_RESIDUAL: &str = r#"
    INSERT INTO residual_payouts (merchant_number, year, month, payload, content_hash, synced_at)
    VALUES ($1, $2, $3, $4, $5, NOW())
    ON CONFLICT (merchant_number, year, month) DO UPDATE
        SET payload = EXCLUDED.payload,
            content_hash = EXCLUDED.content_hash,
            synced_at = EXCLUDED.synced_at
        WHERE residual_payouts.content_hash IS DISTINCT FROM EXCLUDED.content_hash
    RETURNING (xmax = 0) AS inserted
"#;

async fn upsert_one(conn: &mut PgConnection, record: &CrmRecord) -> Result<UpsertOutcome> {
    let inserted: Option<bool> = match record.kind {
        RecordKind::Merchant => {
            sqlx::query_scalar::<_, bool>(UPSERT_MERCHANT)
                .bind(&record.merchant_number)
                .bind(&record.payload)
                .bind(&record.content_hash)
                .fetch_optional(&mut *conn)
                .await?
        }
        RecordKind::Transaction | RecordKind::Residual => {
            let period = record.period.ok_or_else(|| {
                SyncError::validation(format!(
                    "{} record {} has no period",
                    record.kind, record.natural_key
                ))
            })?;
            let sql = if record.kind == RecordKind::Transaction {
                UPSERT_TRANSACTION
            } else {
                UPSERT_RESIDUAL
            };
            sqlx::query_scalar::<_, bool>(sql)
                .bind(&record.merchant_number)
                .bind(period.year)
                .bind(period.month as i32)
                .bind(&record.payload)
                .bind(&record.content_hash)
                .fetch_optional(&mut *conn)
                .await?
        }
    };

    Ok(match inserted {
        Some(true) => UpsertOutcome::Inserted,
        Some(false) => UpsertOutcome::Updated,
        None => UpsertOutcome::Unchanged,
    })
}

#[derive(Debug, FromRow)]
struct WatermarkRow {
    data_type: String,
    sync_scope: String,
    sync_mode: String,
    last_sync_timestamp: DateTime<Utc>,
    records_processed: i64,
    records_changed: i64,
    error_count: i64,
    inconsistency_count: i64,
    created_at: DateTime<Utc>,
}

impl TryFrom<WatermarkRow> for SyncWatermark {
    type Error = SyncError;

    fn try_from(row: WatermarkRow) -> Result<Self> {
        Ok(SyncWatermark {
            sync_mode: row.sync_mode.parse::<SyncMode>().map_err(SyncError::Database)?,
            data_type: row.data_type,
            sync_scope: row.sync_scope,
            last_sync_timestamp: row.last_sync_timestamp,
            records_processed: row.records_processed,
            records_changed: row.records_changed,
            error_count: row.error_count,
            inconsistency_count: row.inconsistency_count,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct RunRow {
    sync_id: Uuid,
    sync_type: String,
    status: String,
    started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    stats: Value,
    errors: Json<Vec<String>>,
}

impl TryFrom<RunRow> for SyncRunRecord {
    type Error = SyncError;

    fn try_from(row: RunRow) -> Result<Self> {
        Ok(SyncRunRecord {
            sync_id: row.sync_id,
            sync_type: row.sync_type,
            status: row.status.parse::<RunStatus>().map_err(SyncError::Database)?,
            started_at: row.started_at,
            completed_at: row.completed_at,
            stats: row.stats,
            errors: row.errors.0,
        })
    }
}

const WATERMARK_COLUMNS: &str = "data_type, sync_scope, sync_mode, last_sync_timestamp, \
     records_processed, records_changed, error_count, inconsistency_count, created_at";

const RUN_COLUMNS: &str = "sync_id, sync_type, status, started_at, completed_at, stats, errors";

#[derive(Debug, Clone)]
pub struct PgDatastore {
    pool: PgPool,
}

impl PgDatastore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl RecordStore for PgDatastore {
    #[instrument(skip(self, records), fields(count = records.len()))]
    async fn upsert_records(&self, records: &[CrmRecord]) -> Result<Vec<UpsertOutcome>> {
        let mut tx = self.pool.begin().await?;
        let mut outcomes = Vec::with_capacity(records.len());
        for record in records {
            outcomes.push(upsert_one(&mut *tx, record).await?);
        }
        tx.commit().await?;
        debug!(count = outcomes.len(), "Upserted record batch");
        Ok(outcomes)
    }

    async fn upsert_record(&self, record: &CrmRecord) -> Result<UpsertOutcome> {
        let mut conn = self.pool.acquire().await?;
        upsert_one(&mut *conn, record).await
    }

    #[instrument(skip(self))]
    async fn refresh_calculated_metrics(&self) -> Result<()> {
        sqlx::query("SELECT refresh_merchant_metrics()")
            .execute(&self.pool)
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to refresh merchant metrics");
                SyncError::database(format!("refresh_merchant_metrics failed: {e}"))
            })?;
        Ok(())
    }
}

#[async_trait]
impl SyncHistoryStore for PgDatastore {
    async fn record_watermark(&self, watermark: &SyncWatermark) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO sync_watermarks ({WATERMARK_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)"
        ))
        .bind(&watermark.data_type)
        .bind(&watermark.sync_scope)
        .bind(watermark.sync_mode.as_str())
        .bind(watermark.last_sync_timestamp)
        .bind(watermark.records_processed)
        .bind(watermark.records_changed)
        .bind(watermark.error_count)
        .bind(watermark.inconsistency_count)
        .bind(watermark.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn latest_watermark(
        &self,
        data_type: &str,
        sync_scope: &str,
        mode: Option<SyncMode>,
    ) -> Result<Option<SyncWatermark>> {
        let row: Option<WatermarkRow> = sqlx::query_as(&format!(
            "SELECT {WATERMARK_COLUMNS} FROM sync_watermarks
             WHERE data_type = $1 AND sync_scope = $2 AND ($3::TEXT IS NULL OR sync_mode = $3)
             ORDER BY created_at DESC
             LIMIT 1"
        ))
        .bind(data_type)
        .bind(sync_scope)
        .bind(mode.map(|m| m.as_str()))
        .fetch_optional(&self.pool)
        .await?;
        row.map(SyncWatermark::try_from).transpose()
    }

    async fn watermark_history(
        &self,
        data_type: &str,
        sync_scope: &str,
        since: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Result<Vec<SyncWatermark>> {
        let rows: Vec<WatermarkRow> = sqlx::query_as(&format!(
            "SELECT {WATERMARK_COLUMNS} FROM sync_watermarks
             WHERE data_type = $1 AND sync_scope = $2
               AND ($3::TIMESTAMPTZ IS NULL OR created_at > $3)
             ORDER BY created_at DESC
             LIMIT $4"
        ))
        .bind(data_type)
        .bind(sync_scope)
        .bind(since)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(SyncWatermark::try_from).collect()
    }

    async fn record_rate_limit(&self, record: &RateLimitRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO rate_limit_records (service, endpoint, remaining, limit_total, reset_at, recorded_at)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(&record.service)
        .bind(&record.endpoint)
        .bind(record.remaining)
        .bind(record.limit)
        .bind(record.reset_at)
        .bind(record.recorded_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn latest_rate_limit(&self, service: &str) -> Result<Option<RateLimitRecord>> {
        let row: Option<(String, String, i64, i64, Option<DateTime<Utc>>, DateTime<Utc>)> =
            sqlx::query_as(
                "SELECT service, endpoint, remaining, limit_total, reset_at, recorded_at
                 FROM rate_limit_records
                 WHERE service = $1
                 ORDER BY recorded_at DESC
                 LIMIT 1",
            )
            .bind(service)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(
            |(service, endpoint, remaining, limit, reset_at, recorded_at)| RateLimitRecord {
                service,
                endpoint,
                remaining,
                limit,
                reset_at,
                recorded_at,
            },
        ))
    }

    async fn save_run(&self, run: &SyncRunRecord) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO sync_runs ({RUN_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7)
             ON CONFLICT (sync_id) DO UPDATE
                SET status = EXCLUDED.status,
                    completed_at = EXCLUDED.completed_at,
                    stats = EXCLUDED.stats,
                    errors = EXCLUDED.errors"
        ))
        .bind(run.sync_id)
        .bind(&run.sync_type)
        .bind(run.status.as_str())
        .bind(run.started_at)
        .bind(run.completed_at)
        .bind(&run.stats)
        .bind(Json(&run.errors))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_run(&self, sync_id: Uuid) -> Result<Option<SyncRunRecord>> {
        let row: Option<RunRow> =
            sqlx::query_as(&format!("SELECT {RUN_COLUMNS} FROM sync_runs WHERE sync_id = $1"))
                .bind(sync_id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(SyncRunRecord::try_from).transpose()
    }

    async fn list_runs(&self, limit: i64) -> Result<Vec<SyncRunRecord>> {
        let rows: Vec<RunRow> = sqlx::query_as(&format!(
            "SELECT {RUN_COLUMNS} FROM sync_runs ORDER BY started_at DESC LIMIT $1"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(SyncRunRecord::try_from).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[sqlx::test(migrations = "./migrations")]
    #[ignore = "requires DATABASE_URL"]
    async fn test_upsert_detects_unchanged_rows(pool: PgPool) -> sqlx::Result<()> {
        let store = PgDatastore::new(pool);
        let record =
            CrmRecord::from_payload(RecordKind::Merchant, json!({"mid": "42", "dba": "Cafe"}), None)
                .unwrap();

        assert_eq!(store.upsert_record(&record).await.unwrap(), UpsertOutcome::Inserted);
        assert_eq!(store.upsert_record(&record).await.unwrap(), UpsertOutcome::Unchanged);

        let changed =
            CrmRecord::from_payload(RecordKind::Merchant, json!({"mid": "42", "dba": "Cafe 2"}), None)
                .unwrap();
        assert_eq!(
            store.upsert_records(&[changed]).await.unwrap(),
            vec![UpsertOutcome::Updated]
        );
        Ok(())
    }
}
