//! # Mutation Repository
//!
//! The only way the business layer writes to the device store. Each call
//! applies the change locally and appends the matching sync queue entry in
//! one transaction, under the device's single-writer lock.
//!
//! ```text
//! place_order(lines)
//!     │
//!     ├── lock_writer
//!     ├── BEGIN
//!     │     ├── load device identity
//!     │     ├── apply_patch + parse_entity   (rejects invalid state)
//!     │     ├── UPSERT orders
//!     │     └── INSERT sync_queue (pending)
//!     └── COMMIT   (or ROLLBACK: neither write happened)
//! ```

use std::sync::Arc;

use serde_json::Value;
use sqlx::{SqliteConnection, SqlitePool};
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

use crate::error::{DbError, DbResult};
use crate::repository::device::{self, DeviceState};
use crate::repository::{entity, ledger, queue};
use tally_core::ledger::check_unit;
use tally_core::mutation::{apply_patch, InventoryItemPatch, MenuItemPatch};
use tally_core::validation::{parse_entity, Entity};
use tally_core::{
    clock, EntityKind, InventoryEvent, InventoryItem, InventorySnapshot, MenuItem,
    Mutation, Order, OrderLine, StockAction, SyncQueueEntry,
};

/// Apply a mutation to the local tables. Shared by every write path.
async fn apply_local(conn: &mut SqliteConnection, mutation: &Mutation) -> DbResult<Value> {
    let kind = mutation.entity_kind;
    let id = mutation.entity_id.as_str();

    if kind.is_ledger_record() {
        // Rejects update/delete before anything is parsed.
        let state = apply_patch(kind, id, None, mutation.operation, &mutation.payload)?;
        match parse_entity(kind, id, &state, None)? {
            Entity::InventoryEvent(event) => {
                let item = ledger::load_item(conn, &event.item_id)
                    .await?
                    .ok_or_else(|| DbError::not_found("inventory item", event.item_id.clone()))?;
                check_unit(&item, &event.unit)?;
                ledger::insert_event(conn, &event).await?;
            }
            Entity::InventorySnapshot(snapshot) => {
                let item = ledger::load_item(conn, &snapshot.item_id)
                    .await?
                    .ok_or_else(|| DbError::not_found("inventory item", snapshot.item_id.clone()))?;
                check_unit(&item, &snapshot.unit)?;
                ledger::insert_snapshot(conn, &snapshot).await?;
            }
            _ => {}
        }
        return Ok(state);
    }

    let current = entity::load(conn, kind, id).await?;
    let next = apply_patch(kind, id, current.as_ref(), mutation.operation, &mutation.payload)?;
    parse_entity(kind, id, &next, current.as_ref())?;
    entity::store(conn, kind, id, &next, None).await?;
    Ok(next)
}

fn typed<T: serde::de::DeserializeOwned>(state: Value) -> DbResult<T> {
    Ok(serde_json::from_value(state)?)
}

/// Business-layer writes.
#[derive(Debug, Clone)]
pub struct MutationRepository {
    pool: SqlitePool,
    write_lock: Arc<Mutex<()>>,
}

impl MutationRepository {
    pub fn new(pool: SqlitePool, write_lock: Arc<Mutex<()>>) -> Self {
        MutationRepository { pool, write_lock }
    }

    /// Apply a mutation locally and enqueue it, atomically.
    ///
    /// Returns the new full state and the queue entry. On any error neither
    /// the entity write nor the queue entry is persisted.
    pub async fn record(&self, mutation: Mutation) -> DbResult<(Value, SyncQueueEntry)> {
        self.record_with(|_, _| Ok(mutation)).await
    }

    /// Like [`Self::record`], but the mutation is built inside the
    /// transaction from the device identity and its next ledger sequence.
    async fn record_with<F>(&self, build: F) -> DbResult<(Value, SyncQueueEntry)>
    where
        F: FnOnce(&DeviceState, i64) -> DbResult<Mutation>,
    {
        let _writer = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let state = device::load(&mut tx).await?;
        let sequence = state.next_event_sequence;
        let mutation = build(&state, sequence)?;

        if mutation.entity_kind == EntityKind::InventoryEvent {
            device::take_event_sequence(&mut tx).await?;
        }

        let next = apply_local(&mut tx, &mutation).await?;
        let entry = queue::insert(&mut tx, &state.device_id, &mutation).await?;

        tx.commit().await?;
        Ok((next, entry))
    }

    // =========================================================================
    // Menu
    // =========================================================================

    pub async fn create_menu_item(&self, item: MenuItem) -> DbResult<MenuItem> {
        let (state, _) = self.record(Mutation::create_menu_item(&item)?).await?;
        info!(item_id = %item.id, name = %item.name, "Menu item created");
        typed(state)
    }

    pub async fn update_menu_item(&self, id: &str, patch: &MenuItemPatch) -> DbResult<MenuItem> {
        let (state, _) = self.record(Mutation::update_menu_item(id, patch)?).await?;
        typed(state)
    }

    // =========================================================================
    // Inventory metadata
    // =========================================================================

    pub async fn create_inventory_item(&self, item: InventoryItem) -> DbResult<InventoryItem> {
        let (state, _) = self.record(Mutation::create_inventory_item(&item)?).await?;
        info!(item_id = %item.id, unit = %item.unit, "Inventory item created");
        typed(state)
    }

    pub async fn update_inventory_item(
        &self,
        id: &str,
        patch: &InventoryItemPatch,
    ) -> DbResult<InventoryItem> {
        let (state, _) = self.record(Mutation::update_inventory_item(id, patch)?).await?;
        typed(state)
    }

    /// Soft delete: the entity stays, with `is_active = false`.
    pub async fn delete(&self, kind: EntityKind, id: &str) -> DbResult<Value> {
        let (state, _) = self.record(Mutation::delete(kind, id)?).await?;
        Ok(state)
    }

    // =========================================================================
    // Orders
    // =========================================================================

    /// Open a new order taken on this device.
    pub async fn place_order(&self, lines: Vec<OrderLine>, notes: Option<String>) -> DbResult<Order> {
        let (state, _) = self
            .record_with(|device, _| {
                let mut order = Order::new(device.device_id.clone(), lines);
                order.notes = notes;
                Ok(Mutation::create_order(&order)?)
            })
            .await?;
        let order: Order = typed(state)?;
        info!(order_id = %order.id, total = order.total, "Order placed");
        Ok(order)
    }

    /// Replace an order with its new full state. The total is recomputed.
    pub async fn update_order(&self, mut order: Order) -> DbResult<Order> {
        order.total = order.computed_total().minor();
        order.updated_at = clock::now();
        let (state, _) = self.record(Mutation::update_order(&order)?).await?;
        typed(state)
    }

    // =========================================================================
    // Inventory ledger
    // =========================================================================

    /// Append a stock movement. `delta` is signed: sales are negative.
    pub async fn record_stock_event(
        &self,
        item_id: &str,
        action: StockAction,
        delta: i64,
        actor: &str,
        reference: Option<&str>,
    ) -> DbResult<InventoryEvent> {
        let item = self.item(item_id).await?;
        let (state, _) = self
            .record_with(|device, sequence| {
                let event = InventoryEvent {
                    id: Uuid::new_v4().to_string(),
                    item_id: item.id.clone(),
                    action,
                    delta,
                    unit: item.unit.clone(),
                    device_id: device.device_id.clone(),
                    actor: actor.to_string(),
                    occurred_at: clock::now(),
                    sequence,
                    reference: reference.map(str::to_string),
                };
                Ok(Mutation::record_event(&event)?)
            })
            .await?;
        typed(state)
    }

    /// Record a physical count. It becomes the new baseline for the item.
    pub async fn record_verified_count(
        &self,
        item_id: &str,
        stock_level: i64,
        verified_by: &str,
        notes: Option<&str>,
    ) -> DbResult<InventorySnapshot> {
        let item = self.item(item_id).await?;
        let (state, _) = self
            .record_with(|device, _| {
                let mut snapshot = InventorySnapshot::verified_count(
                    &item,
                    stock_level,
                    device.device_id.clone(),
                    verified_by,
                );
                snapshot.notes = notes.map(str::to_string);
                Ok(Mutation::record_snapshot(&snapshot)?)
            })
            .await?;
        let snapshot: InventorySnapshot = typed(state)?;
        info!(
            item_id = %item_id,
            stock_level,
            verified_by = %verified_by,
            "Verified count recorded"
        );
        Ok(snapshot)
    }

    async fn item(&self, item_id: &str) -> DbResult<InventoryItem> {
        let mut conn = self.pool.acquire().await?;
        ledger::load_item(&mut conn, item_id)
            .await?
            .ok_or_else(|| DbError::not_found("inventory item", item_id))
    }
}
