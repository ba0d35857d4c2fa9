//! # tally-db: Device-Local Store for Tally POS
//!
//! One SQLite database per device, accessed through sqlx.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Tally POS Device                                 │
//! │                                                                         │
//! │  Business layer (orders, menu, stock)      tally-sync engine           │
//! │       │                                         │                       │
//! │       ▼                                         ▼                       │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                     tally-db (THIS CRATE)                       │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐    ┌────────────────┐    ┌──────────────┐  │   │
//! │  │   │   Database    │    │  Repositories  │    │  Migrations  │  │   │
//! │  │   │   (pool.rs)   │    │                │    │  (embedded)  │  │   │
//! │  │   │               │    │ Mutations      │    │              │  │   │
//! │  │   │ SqlitePool    │◄───│ SyncQueue      │    │ 0001_initial │  │   │
//! │  │   │ write lock    │    │ Inbound        │    │              │  │   │
//! │  │   │               │    │ Ledger, ...    │    │              │  │   │
//! │  │   └───────────────┘    └────────────────┘    └──────────────┘  │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                     SQLite Database (WAL)                       │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`pool`] - Connection pool creation and configuration
//! - [`migrations`] - Embedded database migrations
//! - [`error`] - Database error types
//! - [`repository`] - Repository implementations
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tally_db::{Database, DbConfig};
//!
//! let db = Database::new(DbConfig::new("path/to/tally.db")).await?;
//! db.device().initialize("till-1", "cafe-42").await?;
//!
//! let item = db.mutations().create_menu_item(MenuItem::new("Latte", 15000)).await?;
//! let pending = db.sync_queue().pending_count().await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod migrations;
pub mod pool;
pub mod repository;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{DbError, DbResult};
pub use pool::{Database, DbConfig};

// Repository re-exports for convenience
pub use repository::device::{DeviceState, DeviceStateRepository};
pub use repository::entity::EntityRepository;
pub use repository::inbound::{AppliedChanges, InboundRepository};
pub use repository::ledger::LedgerRepository;
pub use repository::mutations::MutationRepository;
pub use repository::queue::SyncQueueRepository;
pub use repository::sync_log::{NewSyncLog, SyncLogRepository};
