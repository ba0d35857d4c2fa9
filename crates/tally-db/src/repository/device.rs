//! # Device State Repository
//!
//! The single `device_state` row: who this store belongs to, how far it has
//! pulled, and the next per-device ledger sequence number. Also the pulled
//! changes the device skipped, which keep the pushed watermark low.

use sqlx::{FromRow, SqliteConnection, SqlitePool};
use tracing::info;

use crate::error::{DbError, DbResult};
use tally_core::{clock, EntityKind};

/// Identity and progress of the local device.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct DeviceState {
    pub device_id: String,
    pub account_id: String,
    /// Highest central change sequence applied locally.
    pub watermark: i64,
    pub next_event_sequence: i64,
}

/// Repository for the device identity row.
#[derive(Debug, Clone)]
pub struct DeviceStateRepository {
    pool: SqlitePool,
}

impl DeviceStateRepository {
    pub fn new(pool: SqlitePool) -> Self {
        DeviceStateRepository { pool }
    }

    /// Write the identity row on first start; verify it on later starts.
    ///
    /// ## Errors
    /// [`DbError::DeviceMismatch`] if the store was initialized for another
    /// device; a store is never shared between devices.
    pub async fn initialize(&self, device_id: &str, account_id: &str) -> DbResult<DeviceState> {
        if let Some(existing) = self.get().await? {
            if existing.device_id != device_id {
                return Err(DbError::DeviceMismatch {
                    stored: existing.device_id,
                    requested: device_id.to_string(),
                });
            }
            return Ok(existing);
        }

        let now = clock::to_millis(clock::now());
        sqlx::query(
            r#"
            INSERT INTO device_state (device_id, account_id, watermark, next_event_sequence, created_at, updated_at)
            VALUES (?1, ?2, 0, 1, ?3, ?3)
            "#,
        )
        .bind(device_id)
        .bind(account_id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        info!(device_id = %device_id, account_id = %account_id, "Device store initialized");

        Ok(DeviceState {
            device_id: device_id.to_string(),
            account_id: account_id.to_string(),
            watermark: 0,
            next_event_sequence: 1,
        })
    }

    pub async fn get(&self) -> DbResult<Option<DeviceState>> {
        let state = sqlx::query_as::<_, DeviceState>(
            "SELECT device_id, account_id, watermark, next_event_sequence FROM device_state LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(state)
    }

    /// Current pull watermark.
    pub async fn watermark(&self) -> DbResult<i64> {
        Ok(self.get().await?.ok_or(DbError::NotInitialized)?.watermark)
    }

    /// Watermark to report with a push.
    ///
    /// Equal to the pull watermark unless a pulled change was skipped because
    /// its entity had local entries queued. Until those entries are
    /// acknowledged the device has not really seen that change, so the
    /// reported watermark stays just below it and central still treats the
    /// change as a competitor.
    pub async fn conflict_watermark(&self) -> DbResult<i64> {
        let watermark = self.watermark().await?;
        let skipped: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT MIN(s.seq) FROM skipped_changes AS s
            WHERE EXISTS (
                SELECT 1 FROM sync_queue AS q
                WHERE q.entity_kind = s.entity_kind
                  AND q.entity_id = s.entity_id
                  AND q.status != 'acknowledged'
                  AND q.rejected = 0
            )
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(skipped.map_or(watermark, |seq| watermark.min(seq - 1)))
    }
}

/// Device state inside an open transaction.
pub(crate) async fn load(conn: &mut SqliteConnection) -> DbResult<DeviceState> {
    sqlx::query_as::<_, DeviceState>(
        "SELECT device_id, account_id, watermark, next_event_sequence FROM device_state LIMIT 1",
    )
    .fetch_optional(&mut *conn)
    .await?
    .ok_or(DbError::NotInitialized)
}

/// Advance the watermark. Never moves it backwards.
pub(crate) async fn advance_watermark(conn: &mut SqliteConnection, seq: i64) -> DbResult<()> {
    sqlx::query("UPDATE device_state SET watermark = MAX(watermark, ?1), updated_at = ?2")
        .bind(seq)
        .bind(clock::to_millis(clock::now()))
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Remember a pulled change that was not applied. Keeps the earliest seq.
pub(crate) async fn record_skipped(
    conn: &mut SqliteConnection,
    kind: EntityKind,
    entity_id: &str,
    seq: i64,
) -> DbResult<()> {
    sqlx::query(
        r#"
        INSERT INTO skipped_changes (entity_kind, entity_id, seq) VALUES (?1, ?2, ?3)
        ON CONFLICT (entity_kind, entity_id) DO UPDATE SET seq = MIN(seq, excluded.seq)
        "#,
    )
    .bind(kind.as_str())
    .bind(entity_id)
    .bind(seq)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Reserve the next ledger sequence number for this device.
pub(crate) async fn take_event_sequence(conn: &mut SqliteConnection) -> DbResult<i64> {
    let seq: i64 = sqlx::query_scalar(
        r#"
        UPDATE device_state
        SET next_event_sequence = next_event_sequence + 1
        RETURNING next_event_sequence - 1
        "#,
    )
    .fetch_one(&mut *conn)
    .await?;
    Ok(seq)
}

#[cfg(test)]
mod tests {
    use crate::{Database, DbConfig, DbError};
    use tally_core::{EntityKind, MenuItem};

    #[tokio::test]
    async fn test_initialize_is_idempotent_for_same_device() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        db.device().initialize("dev-a", "acct").await.unwrap();
        let again = db.device().initialize("dev-a", "acct").await.unwrap();
        assert_eq!(again.watermark, 0);
    }

    #[tokio::test]
    async fn test_store_cannot_be_reused_by_another_device() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        db.device().initialize("dev-a", "acct").await.unwrap();
        let err = db.device().initialize("dev-b", "acct").await.unwrap_err();
        assert!(matches!(err, DbError::DeviceMismatch { .. }));
    }

    #[tokio::test]
    async fn test_watermark_only_advances() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        db.device().initialize("dev-a", "acct").await.unwrap();

        let mut conn = db.pool().acquire().await.unwrap();
        super::advance_watermark(&mut conn, 10).await.unwrap();
        super::advance_watermark(&mut conn, 4).await.unwrap();
        drop(conn);

        assert_eq!(db.device().watermark().await.unwrap(), 10);
    }

    #[tokio::test]
    async fn test_conflict_watermark_stays_below_skipped_change() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        db.device().initialize("dev-a", "acct").await.unwrap();
        let item = MenuItem::new("Tea", 9000);
        let created = db.mutations().create_menu_item(item).await.unwrap();

        let mut conn = db.pool().acquire().await.unwrap();
        super::record_skipped(&mut conn, EntityKind::MenuItem, &created.id, 5).await.unwrap();
        super::advance_watermark(&mut conn, 9).await.unwrap();
        drop(conn);

        assert_eq!(db.device().watermark().await.unwrap(), 9);
        assert_eq!(db.device().conflict_watermark().await.unwrap(), 4);

        // Once the local entry is acknowledged the skipped change is seen.
        let queued = db.sync_queue().next_batch(10).await.unwrap();
        db.sync_queue().mark_acknowledged(queued[0].local_id).await.unwrap();
        assert_eq!(db.device().conflict_watermark().await.unwrap(), 9);
    }

    #[tokio::test]
    async fn test_event_sequence_is_monotonic() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        db.device().initialize("dev-a", "acct").await.unwrap();

        let mut conn = db.pool().acquire().await.unwrap();
        assert_eq!(super::take_event_sequence(&mut conn).await.unwrap(), 1);
        assert_eq!(super::take_event_sequence(&mut conn).await.unwrap(), 2);
    }
}
