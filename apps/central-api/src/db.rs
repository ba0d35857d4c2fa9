//! Database layer for the Central API.
//!
//! Provides SQLite connectivity, migrations, the account/device registry and
//! the central sync log. Entity, change-feed and ledger queries live in
//! [`crate::store`] and [`crate::ledger`] and run on a transaction's
//! connection.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::FromRow;
use tokio::sync::{Mutex, MutexGuard};
use tracing::info;

use tally_core::{clock, Device, SyncDirection, SyncLog};

use crate::error::{CentralError, CentralResult};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("../../migrations/central");

/// Database connection pool.
///
/// SQLite allows one writer at a time; `write_lock` queues writers inside
/// the process instead of letting them fail with `SQLITE_BUSY`.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
    write_lock: Arc<Mutex<()>>,
}

#[derive(Debug, FromRow)]
struct DeviceRow {
    device_id: String,
    account_id: String,
    name: String,
    is_active: bool,
    registered_at: i64,
    last_seen_seq: i64,
}

impl TryFrom<DeviceRow> for Device {
    type Error = CentralError;

    fn try_from(row: DeviceRow) -> Result<Self, Self::Error> {
        Ok(Device {
            device_id: row.device_id,
            account_id: row.account_id,
            name: row.name,
            is_active: row.is_active,
            registered_at: clock::from_millis(row.registered_at)?,
            last_seen_seq: row.last_seen_seq,
        })
    }
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
    type Error = CentralError;

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

impl Database {
    /// Connect to the database and run migrations.
    pub async fn connect(url: &str) -> CentralResult<Self> {
        let in_memory = url.contains(":memory:");
        let mut options = SqliteConnectOptions::from_str(url)
            .map_err(|e| CentralError::Database(e.to_string()))?
            .foreign_keys(true)
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));
        if !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        // Every connection to sqlite::memory: is a separate database.
        let max_connections = if in_memory { 1 } else { 8 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await
            .map_err(|e| CentralError::Database(e.to_string()))?;

        let db = Database {
            pool,
            write_lock: Arc::new(Mutex::new(())),
        };
        db.run_migrations().await?;
        Ok(db)
    }

    /// Fresh in-memory store, for tests.
    pub async fn in_memory() -> CentralResult<Self> {
        Self::connect("sqlite::memory:").await
    }

    /// Run database migrations.
    pub async fn run_migrations(&self) -> CentralResult<()> {
        MIGRATOR.run(&self.pool).await?;
        info!("Central migrations complete");
        Ok(())
    }

    /// Get the connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub(crate) async fn lock_writer(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock().await
    }

    pub async fn close(&self) {
        info!("Closing central database pool");
        self.pool.close().await;
    }

    pub async fn health_check(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }

    // =========================================================================
    // Accounts and Devices
    // =========================================================================

    /// Create an account if it does not exist yet.
    pub async fn create_account(&self, account_id: &str, name: &str) -> CentralResult<()> {
        let _writer = self.lock_writer().await;
        sqlx::query(
            r#"
            INSERT INTO accounts (id, name, created_at) VALUES (?1, ?2, ?3)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(account_id)
        .bind(name)
        .bind(clock::to_millis(clock::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Register a device under an existing account.
    ///
    /// Re-registering a device under the same account reactivates it; a
    /// device id already owned by another account is refused.
    pub async fn register_device(
        &self,
        account_id: &str,
        device_id: &str,
        name: &str,
    ) -> CentralResult<Device> {
        if let Some(existing) = self.device(device_id).await? {
            if existing.account_id != account_id {
                return Err(CentralError::Forbidden(format!(
                    "device {device_id} belongs to another account"
                )));
            }
        }

        {
            let _writer = self.lock_writer().await;
            sqlx::query(
                r#"
                INSERT INTO devices (device_id, account_id, name, is_active, registered_at, last_seen_seq)
                VALUES (?1, ?2, ?3, 1, ?4, 0)
                ON CONFLICT (device_id) DO UPDATE SET
                    name = excluded.name,
                    is_active = 1
                "#,
            )
            .bind(device_id)
            .bind(account_id)
            .bind(name)
            .bind(clock::to_millis(clock::now()))
            .execute(&self.pool)
            .await?;
        }

        info!(account_id, device_id, "Device registered");
        self.device(device_id)
            .await?
            .ok_or_else(|| CentralError::NotFound(format!("device {device_id}")))
    }

    /// Retire a device. Its history stays; its requests are refused.
    pub async fn retire_device(&self, device_id: &str) -> CentralResult<()> {
        let _writer = self.lock_writer().await;
        let result = sqlx::query("UPDATE devices SET is_active = 0 WHERE device_id = ?1")
            .bind(device_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(CentralError::NotFound(format!("device {device_id}")));
        }
        info!(device_id, "Device retired");
        Ok(())
    }

    pub async fn device(&self, device_id: &str) -> CentralResult<Option<Device>> {
        sqlx::query_as::<_, DeviceRow>(
            r#"
            SELECT device_id, account_id, name, is_active, registered_at, last_seen_seq
            FROM devices WHERE device_id = ?1
            "#,
        )
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await?
        .map(Device::try_from)
        .transpose()
    }

    /// Raise a device's last-seen sequence number. Never lowers it.
    pub async fn observe_seq(&self, device_id: &str, seq: i64) -> CentralResult<()> {
        let _writer = self.lock_writer().await;
        sqlx::query(
            "UPDATE devices SET last_seen_seq = MAX(last_seen_seq, ?2) WHERE device_id = ?1",
        )
        .bind(device_id)
        .bind(seq)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // =========================================================================
    // Sync Log
    // =========================================================================

    pub async fn record_sync_log(
        &self,
        device_id: &str,
        direction: SyncDirection,
        success: bool,
        entries_processed: i64,
        duration_ms: i64,
        error: Option<&str>,
    ) -> CentralResult<()> {
        let _writer = self.lock_writer().await;
        sqlx::query(
            r#"
            INSERT INTO sync_logs (device_id, direction, success, entries_processed, duration_ms, error, started_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(device_id)
        .bind(direction.as_str())
        .bind(success)
        .bind(entries_processed)
        .bind(duration_ms)
        .bind(error)
        .bind(clock::to_millis(clock::now()) - duration_ms)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn sync_logs_for(&self, device_id: &str) -> CentralResult<Vec<SyncLog>> {
        let rows = sqlx::query_as::<_, SyncLogRow>(
            r#"
            SELECT id, device_id, direction, success, entries_processed, duration_ms, error, started_at
            FROM sync_logs WHERE device_id = ?1
            ORDER BY id DESC
            "#,
        )
        .bind(device_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(SyncLog::try_from).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_and_retire_device() {
        let db = Database::in_memory().await.unwrap();
        db.create_account("acct-1", "Corner Cafe").await.unwrap();

        let device = db.register_device("acct-1", "till-1", "Front till").await.unwrap();
        assert!(device.is_active);
        assert_eq!(device.last_seen_seq, 0);

        db.retire_device("till-1").await.unwrap();
        let retired = db.device("till-1").await.unwrap().unwrap();
        assert!(!retired.is_active);
    }

    #[tokio::test]
    async fn test_device_cannot_change_account() {
        let db = Database::in_memory().await.unwrap();
        db.create_account("acct-1", "One").await.unwrap();
        db.create_account("acct-2", "Two").await.unwrap();
        db.register_device("acct-1", "till-1", "Till").await.unwrap();

        let err = db.register_device("acct-2", "till-1", "Till").await.unwrap_err();
        assert!(matches!(err, CentralError::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_observe_seq_never_lowers() {
        let db = Database::in_memory().await.unwrap();
        db.create_account("acct-1", "One").await.unwrap();
        db.register_device("acct-1", "till-1", "Till").await.unwrap();

        db.observe_seq("till-1", 9).await.unwrap();
        db.observe_seq("till-1", 4).await.unwrap();
        assert_eq!(db.device("till-1").await.unwrap().unwrap().last_seen_seq, 9);
    }

    #[tokio::test]
    async fn test_sync_log_roundtrip() {
        let db = Database::in_memory().await.unwrap();
        db.record_sync_log("till-1", SyncDirection::Push, false, 0, 12, Some("rejected batch"))
            .await
            .unwrap();

        let logs = db.sync_logs_for("till-1").await.unwrap();
        assert_eq!(logs.len(), 1);
        assert!(!logs[0].success);
        assert_eq!(logs[0].direction, SyncDirection::Push);
    }
}
