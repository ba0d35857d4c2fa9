//! # tally-core: Pure Domain Logic for Tally POS
//!
//! Everything in this crate is deterministic and free of I/O. The device
//! store, the sync engine and the central store all build on it.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Tally POS Architecture                           │
//! │                                                                         │
//! │  ┌──────────────────────────┐          ┌──────────────────────────┐    │
//! │  │  Device                  │          │  Central                 │    │
//! │  │  tally-db + tally-sync   │──push───►│  central-api             │    │
//! │  │                          │◄──pull───│                          │    │
//! │  └────────────┬─────────────┘          └────────────┬─────────────┘    │
//! │               │                                     │                   │
//! │  ┌────────────▼─────────────────────────────────────▼─────────────┐    │
//! │  │               ★ tally-core (THIS CRATE) ★                      │    │
//! │  │                                                                 │    │
//! │  │   ┌─────────┐  ┌──────────┐  ┌──────────┐  ┌────────────────┐  │    │
//! │  │   │ types   │  │ mutation │  │ conflict │  │ ledger         │  │    │
//! │  │   │ entities│  │ patches  │  │ resolver │  │ fold, compact, │  │    │
//! │  │   │ queue   │  │ apply    │  │ per kind │  │ verify         │  │    │
//! │  │   └─────────┘  └──────────┘  └──────────┘  └────────────────┘  │    │
//! │  │   ┌──────────┐  ┌────────────┐  ┌───────┐  ┌───────┐           │    │
//! │  │   │ protocol │  │ validation │  │ money │  │ clock │           │    │
//! │  │   └──────────┘  └────────────┘  └───────┘  └───────┘           │    │
//! │  │                                                                 │    │
//! │  │   NO I/O • NO DATABASE • NO NETWORK • PURE FUNCTIONS           │    │
//! │  └─────────────────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Entities, queue entries, logs
//! - [`mutation`] - Mutations, typed patches, patch application
//! - [`conflict`] - Deterministic conflict resolution per entity kind
//! - [`ledger`] - Inventory ledger fold, compaction and verification
//! - [`protocol`] - Push/pull messages exchanged with the central store
//! - [`validation`] - Payload validation shared by devices and central
//! - [`money`] - Integer money for order totals
//! - [`clock`] - Millisecond timestamps
//! - [`error`] - Domain error types
//!
//! ## Example Usage
//!
//! ```rust
//! use tally_core::ledger::compute_stock;
//! use tally_core::types::InventoryItem;
//!
//! let flour = InventoryItem::new("Flour", "g");
//! let level = compute_stock(&flour, &[], &[]).unwrap();
//! assert_eq!(level.quantity, 0);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod clock;
pub mod conflict;
pub mod error;
pub mod ledger;
pub mod money;
pub mod mutation;
pub mod protocol;
pub mod types;
pub mod validation;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use error::{CoreError, CoreResult, LedgerError, ValidationError};
pub use money::Money;
pub use mutation::Mutation;
pub use types::*;

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Actor recorded on snapshots produced by automatic compaction.
pub const SYSTEM_ACTOR: &str = "system";

/// Maximum lines allowed on a single order.
pub const MAX_ORDER_LINES: usize = 200;

/// Maximum quantity of a single order line.
///
/// ## Business Reason
/// Prevents accidental over-ordering (e.g., typing 1000 instead of 10).
pub const MAX_LINE_QUANTITY: i64 = 999;
