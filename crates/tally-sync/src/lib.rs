//! # tally-sync: Device Sync for Tally POS
//!
//! Moves queued local mutations to the central store and applies the
//! central change feed back to the device store.
//!
//! ## Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                            Device Process                               │
//! │                                                                         │
//! │  ┌───────────────┐  triggers  ┌───────────────┐                         │
//! │  │   SyncAgent   │ ─────────► │  SyncEngine   │                         │
//! │  │ interval,     │            │ push batches  │                         │
//! │  │ sync_now,     │            │ pull pages    │                         │
//! │  │ backoff       │            │ sync logs     │                         │
//! │  └───────────────┘            └───────┬───────┘                         │
//! │                                       │                                 │
//! │                      ┌────────────────┴────────────────┐                │
//! │                      ▼                                 ▼                │
//! │              ┌───────────────┐                 ┌───────────────┐        │
//! │              │   tally-db    │                 │  CentralApi   │ ──► HTTP│
//! │              │ queue, state, │                 │ (trait)       │        │
//! │              │ watermark     │                 └───────────────┘        │
//! │              └───────────────┘                                          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//! - [`agent`] - background scheduler and control handle
//! - [`client`] - `CentralApi` trait and the HTTP client
//! - [`config`] - TOML + environment configuration
//! - [`engine`] - one push/pull cycle
//! - [`error`] - sync error types
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tally_sync::{HttpCentralClient, SyncAgent, SyncConfig};
//!
//! let config = SyncConfig::load_or_default(None);
//! let api = Arc::new(HttpCentralClient::from_config(&config)?);
//! let agent = SyncAgent::new(config, database, api);
//! let handle = agent.handle();
//! tokio::spawn(agent.run());
//!
//! handle.sync_now();
//! ```

pub mod agent;
pub mod client;
pub mod config;
pub mod engine;
pub mod error;

pub use agent::{NoOpEmitter, SyncAgent, SyncAgentHandle, SyncEventEmitter, SyncStatus};
pub use client::{CentralApi, HttpCentralClient};
pub use config::{CentralSettings, DeviceConfig, SyncConfig, SyncMode, SyncSettings};
pub use engine::{CycleReport, EngineSettings, EngineState, PullReport, PushReport, SyncEngine};
pub use error::{SyncError, SyncResult};
