//! # Sync Log Repository
//!
//! Append-only record of sync attempts, one row per push or pull.

use sqlx::{FromRow, SqlitePool};

use crate::error::{DbError, DbResult};
use tally_core::{clock, SyncDirection, SyncLog};

/// A sync attempt about to be recorded.
#[derive(Debug, Clone, PartialEq)]
pub struct NewSyncLog {
    pub direction: SyncDirection,
    pub success: bool,
    pub entries_processed: i64,
    pub duration_ms: i64,
    pub error: Option<String>,
}

#[derive(Debug, FromRow)]
struct SyncLogRow {
    id: i64,
    device_id: String,
    direction: String,
    success: bool,
    entries_processed: i64,
    duration_ms: i64,
    error: Option<String>,
    started_at: i64,
}

impl TryFrom<SyncLogRow> for SyncLog {
    type Error = DbError;

    fn try_from(row: SyncLogRow) -> Result<Self, Self::Error> {
        Ok(SyncLog {
            id: row.id,
            device_id: row.device_id,
            direction: row.direction.parse()?,
            success: row.success,
            entries_processed: row.entries_processed,
            duration_ms: row.duration_ms,
            error: row.error,
            started_at: clock::from_millis(row.started_at)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct SyncLogRepository {
    pool: SqlitePool,
}

impl SyncLogRepository {
    pub fn new(pool: SqlitePool) -> Self {
        SyncLogRepository { pool }
    }

    /// Append one attempt. `started_at` is derived from the duration.
    pub async fn record(&self, device_id: &str, log: &NewSyncLog) -> DbResult<i64> {
        let started_at = clock::to_millis(clock::now()) - log.duration_ms;

        let id = sqlx::query(
            r#"
            INSERT INTO sync_logs (
                device_id, direction, success, entries_processed,
                duration_ms, error, started_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(device_id)
        .bind(log.direction.as_str())
        .bind(log.success)
        .bind(log.entries_processed)
        .bind(log.duration_ms)
        .bind(&log.error)
        .bind(started_at)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        Ok(id)
    }

    /// Most recent attempts first.
    pub async fn recent(&self, limit: u32) -> DbResult<Vec<SyncLog>> {
        let rows = sqlx::query_as::<_, SyncLogRow>(
            r#"
            SELECT id, device_id, direction, success, entries_processed,
                   duration_ms, error, started_at
            FROM sync_logs
            ORDER BY id DESC
            LIMIT ?1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(SyncLog::try_from).collect()
    }
}
