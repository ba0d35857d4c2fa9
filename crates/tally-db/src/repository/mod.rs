//! # Repository Module
//!
//! Repository implementations for the device store.
//!
//! ## Who Writes What
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Device Store Access                                  │
//! │                                                                         │
//! │  Business layer                       Sync engine (tally-sync)         │
//! │       │                                     │                           │
//! │       │ db.mutations().create_menu_item()   │ db.sync_queue().next_batch│
//! │       ▼                                     │ db.inbound().apply_changes│
//! │  MutationRepository                         ▼                           │
//! │  ┌──────────── one transaction ───┐   InboundRepository                │
//! │  │ entity / ledger write          │   ┌──── one transaction ───────┐   │
//! │  │ sync_queue INSERT (pending)    │   │ entity upserts              │   │
//! │  └────────────────────────────────┘   │ ledger inserts              │   │
//! │                                       │ watermark advance           │   │
//! │  Both hold Database::lock_writer      └─────────────────────────────┘   │
//! │  for the whole transaction.                                             │
//! │                                                                         │
//! │  Read-only: EntityRepository, LedgerRepository, SyncLogRepository      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Available Repositories
//!
//! - [`device::DeviceStateRepository`] - Device identity and watermark
//! - [`entity::EntityRepository`] - JSON entity tables
//! - [`ledger::LedgerRepository`] - Events, snapshots, stock levels
//! - [`queue::SyncQueueRepository`] - Durable FIFO sync queue
//! - [`mutations::MutationRepository`] - Local writes + enqueue
//! - [`inbound::InboundRepository`] - Pulled changes, conflict resolutions
//! - [`sync_log::SyncLogRepository`] - Sync attempt audit trail

pub mod device;
pub mod entity;
pub mod inbound;
pub mod ledger;
pub mod mutations;
pub mod queue;
pub mod sync_log;
