//! # Database Pool Management
//!
//! Connection pool creation and configuration for the device store.
//!
//! ## Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Device Store Lifecycle                             │
//! │                                                                         │
//! │  Startup                                                               │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  DbConfig::new(path) ← Configure pool settings                         │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  Database::new(config).await ← Create pool + run migrations            │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌──────────────────────────────┐   ┌──────────────────────────────┐   │
//! │  │          SqlitePool          │   │   write lock (one writer)    │   │
//! │  │  readers share connections   │   │   business mutations  ──┐    │   │
//! │  └──────────────────────────────┘   │   sync engine applies ──┴─►  │   │
//! │                                     └──────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  Database::close().await ← Shutdown                                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## WAL Mode
//! SQLite WAL mode is enabled so readers never block the single writer.

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use crate::error::{DbError, DbResult};
use crate::migrations;
use crate::repository::device::DeviceStateRepository;
use crate::repository::entity::EntityRepository;
use crate::repository::inbound::InboundRepository;
use crate::repository::ledger::LedgerRepository;
use crate::repository::mutations::MutationRepository;
use crate::repository::queue::SyncQueueRepository;
use crate::repository::sync_log::SyncLogRepository;

const IN_MEMORY: &str = ":memory:";

// =============================================================================
// Configuration
// =============================================================================

/// Database configuration.
///
/// ## Example
/// ```rust,ignore
/// let config = DbConfig::new("/path/to/tally.db")
///     .max_connections(5)
///     .min_connections(1);
/// ```
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Path to the SQLite database file.
    pub database_path: PathBuf,

    /// Maximum number of connections in the pool.
    /// Default: 5
    pub max_connections: u32,

    /// Minimum number of connections to keep alive.
    /// Default: 1
    pub min_connections: u32,

    /// Connection timeout duration.
    /// Default: 30 seconds
    pub connect_timeout: Duration,

    /// Idle timeout before closing a connection.
    /// Default: 10 minutes
    pub idle_timeout: Duration,

    /// Whether to run migrations on connect.
    /// Default: true
    pub run_migrations: bool,
}

impl DbConfig {
    /// Creates a new database configuration with the given path.
    ///
    /// The file is created if it doesn't exist.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        DbConfig {
            database_path: path.into(),
            max_connections: 5,
            min_connections: 1,
            connect_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600),
            run_migrations: true,
        }
    }

    /// Sets the maximum number of connections.
    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    /// Sets the minimum number of connections.
    pub fn min_connections(mut self, min: u32) -> Self {
        self.min_connections = min;
        self
    }

    /// Sets the connection timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets whether to run migrations on connect.
    pub fn run_migrations(mut self, run: bool) -> Self {
        self.run_migrations = run;
        self
    }

    /// Creates an in-memory database configuration (for testing).
    ///
    /// Every call yields a separate, isolated database.
    pub fn in_memory() -> Self {
        DbConfig {
            database_path: PathBuf::from(IN_MEMORY),
            max_connections: 1, // In-memory requires single connection
            min_connections: 1,
            connect_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(60),
            run_migrations: true,
        }
    }

    fn is_in_memory(&self) -> bool {
        self.database_path.as_os_str() == IN_MEMORY
    }
}

// =============================================================================
// Database
// =============================================================================

/// Handle to one device's store.
///
/// Cloning is cheap; clones share the pool and the write lock. The handle is
/// created at startup and passed explicitly to everything that needs it.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
    write_lock: Arc<Mutex<()>>,
}

impl Database {
    /// Creates a new database connection pool.
    ///
    /// ## What This Does
    /// 1. Creates the database file if it doesn't exist
    /// 2. Configures SQLite:
    ///    - WAL mode for concurrent reads
    ///    - NORMAL synchronous
    ///    - Foreign keys enabled
    /// 3. Creates the connection pool
    /// 4. Runs migrations (if enabled)
    pub async fn new(config: DbConfig) -> DbResult<Self> {
        info!(
            path = %config.database_path.display(),
            "Initializing database connection"
        );

        // sqlite::memory: gets a fresh shared-cache database per pool
        let connect_url = if config.is_in_memory() {
            "sqlite::memory:".to_string()
        } else {
            format!("sqlite://{}?mode=rwc", config.database_path.display())
        };

        let connect_options = SqliteConnectOptions::from_str(&connect_url)
            .map_err(|e| DbError::ConnectionFailed(e.to_string()))?
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .create_if_missing(true);

        debug!("Connection options configured");

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.connect_timeout)
            .idle_timeout(Some(config.idle_timeout))
            .connect_with(connect_options)
            .await
            .map_err(|e| DbError::ConnectionFailed(e.to_string()))?;

        info!(
            max_connections = config.max_connections,
            "Database pool created"
        );

        let db = Database {
            pool,
            write_lock: Arc::new(Mutex::new(())),
        };

        if config.run_migrations {
            db.run_migrations().await?;
        }

        Ok(db)
    }

    /// Runs database migrations. Idempotent.
    pub async fn run_migrations(&self) -> DbResult<()> {
        info!("Running database migrations");
        migrations::run_migrations(&self.pool).await?;
        info!("Migrations complete");
        Ok(())
    }

    /// Returns a reference to the connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Acquire the device's single-writer lock.
    ///
    /// Held for the duration of any transaction that writes entities, the
    /// ledger or the queue.
    pub async fn lock_writer(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock().await
    }

    /// Device identity and pull watermark.
    pub fn device(&self) -> DeviceStateRepository {
        DeviceStateRepository::new(self.pool.clone())
    }

    /// Read access to the JSON entity tables.
    pub fn entities(&self) -> EntityRepository {
        EntityRepository::new(self.pool.clone())
    }

    /// Inventory events, snapshots and derived stock levels.
    pub fn ledger(&self) -> LedgerRepository {
        LedgerRepository::new(self.pool.clone())
    }

    /// The durable sync queue.
    pub fn sync_queue(&self) -> SyncQueueRepository {
        SyncQueueRepository::new(self.pool.clone(), self.write_lock.clone())
    }

    /// Business-layer writes (entity write + enqueue, atomically).
    pub fn mutations(&self) -> MutationRepository {
        MutationRepository::new(self.pool.clone(), self.write_lock.clone())
    }

    /// Sync-engine writes (pulled changes, conflict resolutions).
    pub fn inbound(&self) -> InboundRepository {
        InboundRepository::new(self.pool.clone(), self.write_lock.clone())
    }

    /// Sync attempt audit trail.
    pub fn sync_logs(&self) -> SyncLogRepository {
        SyncLogRepository::new(self.pool.clone())
    }

    /// Closes the database connection pool.
    ///
    /// After calling close, all repository operations will fail.
    pub async fn close(&self) {
        info!("Closing database connection pool");
        self.pool.close().await;
    }

    /// Checks if the database is healthy (can execute queries).
    pub async fn health_check(&self) -> bool {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .is_ok()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
