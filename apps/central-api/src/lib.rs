//! # Tally Central API
//!
//! The central store every device syncs with: it applies pushed mutations
//! exactly once, resolves concurrent edits, keeps the account-wide
//! inventory ledger and serves the change feed devices pull from.
//!
//! ## Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Central API                                     │
//! │                                                                         │
//! │  ┌────────────────┐  ┌────────────────────┐  ┌───────────────────────┐ │
//! │  │  routes        │  │  sync::CentralStore│  │  store / ledger       │ │
//! │  │                │  │                    │  │                       │ │
//! │  │ • bearer auth  │─►│ • push (idempotent)│─►│ • entity state        │ │
//! │  │ • push / pull  │  │ • conflict routing │  │ • mutation_log        │ │
//! │  │ • stock        │  │ • pull pages       │  │ • change feed         │ │
//! │  │ • compact      │  │ • compaction       │  │ • events / snapshots  │ │
//! │  └────────────────┘  └────────────────────┘  └───────────┬───────────┘ │
//! │                                                          │             │
//! │                                                  ┌───────▼───────┐     │
//! │                                                  │    SQLite     │     │
//! │                                                  └───────────────┘     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration
//! Environment variables:
//! - `TALLY_BIND_ADDR` - listen address (default: 0.0.0.0:8080)
//! - `TALLY_DATABASE_URL` - SQLite connection string
//! - `TALLY_JWT_SECRET` - secret for device credentials
//! - `TALLY_JWT_LIFETIME_SECS` - credential lifetime (default: 30 days)
//! - `TALLY_MAX_BATCH_SIZE` - largest accepted push batch (default: 500)
//! - `TALLY_MAX_PULL_LIMIT` - largest pull page (default: 1000)
//! - `TALLY_COMPACTION_THRESHOLD` - events before auto-compaction (default: 200)

pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod ledger;
pub mod routes;
mod store;
pub mod sync;

// Re-exports
pub use auth::{Authenticator, JwtManager, Principal};
pub use config::CentralConfig;
pub use db::Database;
pub use error::{CentralError, CentralResult};
pub use ledger::StockReport;
pub use routes::{app_router, AppState};
pub use sync::CentralStore;
