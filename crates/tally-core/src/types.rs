//! # Domain Types
//!
//! Core domain types shared by devices and the central store.
//!
//! ## Type Map
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Domain Types                                    │
//! │                                                                         │
//! │  Mutable entities (synced as JSON payloads, conflicts resolved):       │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │     Order       │   │    MenuItem     │   │ InventoryItem   │       │
//! │  │  ─────────────  │   │  ─────────────  │   │  ─────────────  │       │
//! │  │  status, lines  │   │  name, price    │   │  name, unit     │       │
//! │  │  total          │   │  is_available   │   │  reorder_level  │       │
//! │  └─────────────────┘   └─────────────────┘   └────────┬────────┘       │
//! │                                                       │ item_id        │
//! │  Append-only ledger (never updated, never conflicts): │                │
//! │  ┌─────────────────┐   ┌─────────────────┐            │                │
//! │  │ InventoryEvent  │   │InventorySnapshot│◄───────────┘                │
//! │  │  delta, unit    │   │  stock_level    │                             │
//! │  │  occurred_at    │   │  taken_at       │                             │
//! │  └─────────────────┘   └─────────────────┘                             │
//! │                                                                         │
//! │  Sync bookkeeping: SyncQueueEntry, ConflictLog, SyncLog, Device        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Entity ids are UUID v4 strings generated on the device, so entities can
//! be created offline without coordination.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock;
use crate::error::CoreError;
use crate::money::Money;

fn default_true() -> bool {
    true
}

fn invalid(field: &str, value: &str) -> CoreError {
    CoreError::InvalidEnumValue {
        field: field.to_string(),
        value: value.to_string(),
    }
}

// =============================================================================
// Entity Kind
// =============================================================================

/// Every kind of record that travels through the sync queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Order,
    MenuItem,
    InventoryItem,
    InventoryEvent,
    InventorySnapshot,
}

impl EntityKind {
    pub const ALL: [EntityKind; 5] = [
        EntityKind::Order,
        EntityKind::MenuItem,
        EntityKind::InventoryItem,
        EntityKind::InventoryEvent,
        EntityKind::InventorySnapshot,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Order => "order",
            EntityKind::MenuItem => "menu_item",
            EntityKind::InventoryItem => "inventory_item",
            EntityKind::InventoryEvent => "inventory_event",
            EntityKind::InventorySnapshot => "inventory_snapshot",
        }
    }

    /// Ledger records are append-only and never take part in conflicts.
    pub fn is_ledger_record(&self) -> bool {
        matches!(
            self,
            EntityKind::InventoryEvent | EntityKind::InventorySnapshot
        )
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntityKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| CoreError::UnknownEntityKind(s.to_string()))
    }
}

// =============================================================================
// Operation
// =============================================================================

/// Kind of change a queued mutation performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Create,
    Update,
    /// Soft delete: applied as the patch `{"is_active": false}`.
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(Operation::Create),
            "update" => Ok(Operation::Update),
            "delete" => Ok(Operation::Delete),
            other => Err(CoreError::UnknownOperation(other.to_string())),
        }
    }
}

// =============================================================================
// Menu Item
// =============================================================================

/// A sellable menu entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MenuItem {
    pub id: String,
    pub name: String,
    /// Price in minor currency units.
    pub price: i64,
    pub category: Option<String>,
    #[serde(default = "default_true")]
    pub is_available: bool,
    #[serde(default = "default_true")]
    pub is_active: bool,
    pub updated_at: DateTime<Utc>,
}

impl MenuItem {
    pub fn new(name: impl Into<String>, price: i64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            price,
            category: None,
            is_available: true,
            is_active: true,
            updated_at: clock::now(),
        }
    }
}

// =============================================================================
// Inventory Item
// =============================================================================

/// Logical stock-keeping item.
///
/// There is deliberately no stock field: the level is always derived from
/// the ledger (latest snapshot plus later events). A payload carrying one is
/// rejected as an unknown field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InventoryItem {
    pub id: String,
    pub name: String,
    /// Declared unit for every event and snapshot of this item.
    pub unit: String,
    pub reorder_level: Option<i64>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    pub updated_at: DateTime<Utc>,
}

impl InventoryItem {
    pub fn new(name: impl Into<String>, unit: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            unit: unit.into(),
            reorder_level: None,
            is_active: true,
            updated_at: clock::now(),
        }
    }
}

// =============================================================================
// Order
// =============================================================================

/// Order lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Open,
    Paid,
    Voided,
}

/// One line of an order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OrderLine {
    pub menu_item_id: String,
    /// Name at time of sale (menu may be renamed later).
    pub name: String,
    pub unit_price: i64,
    pub quantity: i64,
}

impl OrderLine {
    pub fn line_total(&self) -> Money {
        Money::from_minor(self.unit_price).multiply_quantity(self.quantity)
    }
}

/// A customer order taken on a device.
///
/// Orders are replaced wholesale on update; they are never merged field by
/// field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Order {
    pub id: String,
    /// Device that took the order.
    pub device_id: String,
    pub status: OrderStatus,
    pub lines: Vec<OrderLine>,
    /// Sum of line totals in minor units.
    pub total: i64,
    pub notes: Option<String>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    pub fn new(device_id: impl Into<String>, lines: Vec<OrderLine>) -> Self {
        let now = clock::now();
        let mut order = Self {
            id: Uuid::new_v4().to_string(),
            device_id: device_id.into(),
            status: OrderStatus::Open,
            lines,
            total: 0,
            notes: None,
            is_active: true,
            created_at: now,
            updated_at: now,
        };
        order.total = order.computed_total().minor();
        order
    }

    /// Sum of all line totals.
    pub fn computed_total(&self) -> Money {
        self.lines.iter().map(OrderLine::line_total).sum()
    }
}

// =============================================================================
// Inventory Ledger Records
// =============================================================================

/// What caused a stock movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StockAction {
    /// Deduction caused by a sale (negative delta).
    Sale,
    /// Goods received (positive delta).
    Restock,
    /// Manual correction, waste, breakage (either sign).
    Adjustment,
}

impl StockAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            StockAction::Sale => "sale",
            StockAction::Restock => "restock",
            StockAction::Adjustment => "adjustment",
        }
    }
}

impl FromStr for StockAction {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sale" => Ok(StockAction::Sale),
            "restock" => Ok(StockAction::Restock),
            "adjustment" => Ok(StockAction::Adjustment),
            other => Err(invalid("action", other)),
        }
    }
}

/// Append-only stock movement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InventoryEvent {
    pub id: String,
    pub item_id: String,
    pub action: StockAction,
    /// Signed quantity change in `unit`.
    pub delta: i64,
    pub unit: String,
    pub device_id: String,
    pub actor: String,
    pub occurred_at: DateTime<Utc>,
    /// Per-device insertion counter; final tie-break when folding.
    pub sequence: i64,
    /// Optional cross-reference, e.g. the order that caused a sale.
    pub reference: Option<String>,
}

/// Origin of a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotSource {
    /// Folded from events by the compaction actor.
    Compaction,
    /// Physical count entered by a person; authoritative override point.
    VerifiedCount,
}

impl SnapshotSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotSource::Compaction => "compaction",
            SnapshotSource::VerifiedCount => "verified_count",
        }
    }
}

impl FromStr for SnapshotSource {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "compaction" => Ok(SnapshotSource::Compaction),
            "verified_count" => Ok(SnapshotSource::VerifiedCount),
            other => Err(invalid("source", other)),
        }
    }
}

/// Materialized stock level at a point in time. Never deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InventorySnapshot {
    pub id: String,
    pub item_id: String,
    pub stock_level: i64,
    pub unit: String,
    pub taken_at: DateTime<Utc>,
    pub device_id: String,
    pub verified_by: String,
    pub source: SnapshotSource,
    pub notes: Option<String>,
}

impl InventorySnapshot {
    /// A physical count recorded by a person.
    pub fn verified_count(
        item: &InventoryItem,
        stock_level: i64,
        device_id: impl Into<String>,
        verified_by: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            item_id: item.id.clone(),
            stock_level,
            unit: item.unit.clone(),
            taken_at: clock::now(),
            device_id: device_id.into(),
            verified_by: verified_by.into(),
            source: SnapshotSource::VerifiedCount,
            notes: None,
        }
    }
}

// =============================================================================
// Sync Queue Entry
// =============================================================================

/// Delivery status of a queued mutation.
///
/// ```text
/// pending ──► sent ──► acknowledged
///    ▲          │
///    └──────────┴────► failed (retryable → back in next batch,
///                              terminal  → operator attention)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Pending,
    Sent,
    Acknowledged,
    Failed,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Sent => "sent",
            QueueStatus::Acknowledged => "acknowledged",
            QueueStatus::Failed => "failed",
        }
    }
}

impl FromStr for QueueStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(QueueStatus::Pending),
            "sent" => Ok(QueueStatus::Sent),
            "acknowledged" => Ok(QueueStatus::Acknowledged),
            "failed" => Ok(QueueStatus::Failed),
            other => Err(invalid("status", other)),
        }
    }
}

/// Idempotency key of a client-originated mutation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationRef {
    pub device_id: String,
    pub local_id: i64,
}

impl fmt::Display for MutationRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.device_id, self.local_id)
    }
}

/// A locally-originated mutation awaiting delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncQueueEntry {
    /// Monotonic per device, never reused.
    pub local_id: i64,
    pub device_id: String,
    pub entity_kind: EntityKind,
    pub entity_id: String,
    pub operation: Operation,
    pub payload: serde_json::Value,
    pub client_timestamp: DateTime<Utc>,
    pub status: QueueStatus,
    pub attempts: u32,
    /// False once the entry failed terminally (rejected or retries exhausted).
    pub retryable: bool,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub acknowledged_at: Option<DateTime<Utc>>,
}

impl SyncQueueEntry {
    pub fn mutation_ref(&self) -> MutationRef {
        MutationRef {
            device_id: self.device_id.clone(),
            local_id: self.local_id,
        }
    }
}

// =============================================================================
// Conflict Log
// =============================================================================

/// Policy the resolver applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    /// Orders: the mutation received last by the server wins whole.
    LastReceiptWins,
    /// Menu and inventory metadata: per-field latest client timestamp.
    FieldLastWriterWins,
    /// Ledger records: both kept, nothing overwritten.
    RetainBoth,
}

impl ResolutionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionStrategy::LastReceiptWins => "last_receipt_wins",
            ResolutionStrategy::FieldLastWriterWins => "field_last_writer_wins",
            ResolutionStrategy::RetainBoth => "retain_both",
        }
    }
}

impl FromStr for ResolutionStrategy {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "last_receipt_wins" => Ok(ResolutionStrategy::LastReceiptWins),
            "field_last_writer_wins" => Ok(ResolutionStrategy::FieldLastWriterWins),
            "retain_both" => Ok(ResolutionStrategy::RetainBoth),
            other => Err(invalid("strategy", other)),
        }
    }
}

/// Immutable audit record of one resolved conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictLog {
    pub id: String,
    pub account_id: String,
    pub entity_kind: EntityKind,
    pub entity_id: String,
    pub winner: MutationRef,
    pub superseded: MutationRef,
    pub strategy: ResolutionStrategy,
    /// Full entity state after the resolution was applied.
    pub resolved_payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Sync Log
// =============================================================================

/// Direction of a sync attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncDirection {
    Push,
    Pull,
}

impl SyncDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncDirection::Push => "push",
            SyncDirection::Pull => "pull",
        }
    }
}

impl FromStr for SyncDirection {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "push" => Ok(SyncDirection::Push),
            "pull" => Ok(SyncDirection::Pull),
            other => Err(invalid("direction", other)),
        }
    }
}

/// One record per sync attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncLog {
    pub id: i64,
    pub device_id: String,
    pub direction: SyncDirection,
    pub success: bool,
    pub entries_processed: i64,
    pub duration_ms: i64,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
}

// =============================================================================
// Device
// =============================================================================

/// A registered point-of-sale device. Retired, never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub device_id: String,
    pub account_id: String,
    pub name: String,
    pub is_active: bool,
    pub registered_at: DateTime<Utc>,
    /// Highest change sequence the device has pulled.
    pub last_seen_seq: i64,
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_kind_round_trip_strings() {
        for kind in EntityKind::ALL {
            assert_eq!(kind.as_str().parse::<EntityKind>().unwrap(), kind);
        }
        assert!("coupon".parse::<EntityKind>().is_err());
    }

    #[test]
    fn test_ledger_kinds() {
        assert!(EntityKind::InventoryEvent.is_ledger_record());
        assert!(EntityKind::InventorySnapshot.is_ledger_record());
        assert!(!EntityKind::InventoryItem.is_ledger_record());
    }

    #[test]
    fn test_order_total_is_sum_of_lines() {
        let order = Order::new(
            "dev-a",
            vec![
                OrderLine {
                    menu_item_id: "m1".into(),
                    name: "Latte".into(),
                    unit_price: 25000,
                    quantity: 2,
                },
                OrderLine {
                    menu_item_id: "m2".into(),
                    name: "Croissant".into(),
                    unit_price: 18000,
                    quantity: 1,
                },
            ],
        );
        assert_eq!(order.total, 68000);
    }

    #[test]
    fn test_inventory_item_rejects_stock_field() {
        let json = serde_json::json!({
            "id": "i1",
            "name": "Milk",
            "unit": "ml",
            "reorder_level": null,
            "updated_at": "2026-01-01T00:00:00Z",
            "current_stock": 10
        });
        assert!(serde_json::from_value::<InventoryItem>(json).is_err());
    }

    #[test]
    fn test_menu_item_defaults_active_flags() {
        let json = serde_json::json!({
            "id": "m1",
            "name": "Tea",
            "price": 9000,
            "category": null,
            "updated_at": "2026-01-01T00:00:00Z"
        });
        let item: MenuItem = serde_json::from_value(json).unwrap();
        assert!(item.is_active);
        assert!(item.is_available);
    }
}
