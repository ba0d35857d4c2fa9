//! # Mutations and Patches
//!
//! A [`Mutation`] is one locally-originated change: the unit that is queued,
//! pushed, deduplicated and (when two devices collide) resolved.
//!
//! ## Payload Shapes
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  operation │ mutable entities              │ ledger records            │
//! │  ──────────┼───────────────────────────────┼────────────────────────── │
//! │  create    │ full entity object            │ full event / snapshot     │
//! │  update    │ partial object (changed       │ refused (append-only)     │
//! │            │ fields + updated_at); orders  │                           │
//! │            │ always send the full order    │                           │
//! │  delete    │ {"is_active": false, ...}     │ refused (append-only)     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Partial payloads are what make field-level conflict resolution possible:
//! the resolver only sees the fields each device actually touched.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::clock;
use crate::error::{CoreError, CoreResult};
use crate::types::{
    EntityKind, InventoryEvent, InventoryItem, InventorySnapshot, MenuItem, Operation, Order,
};

// =============================================================================
// Mutation
// =============================================================================

/// A change to one entity, as recorded by the device that made it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mutation {
    pub entity_kind: EntityKind,
    pub entity_id: String,
    pub operation: Operation,
    pub payload: Value,
    pub client_timestamp: DateTime<Utc>,
}

impl Mutation {
    fn build(
        entity_kind: EntityKind,
        entity_id: &str,
        operation: Operation,
        payload: Value,
        client_timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            entity_kind,
            entity_id: entity_id.to_string(),
            operation,
            payload,
            client_timestamp,
        }
    }

    fn to_payload<T: Serialize>(kind: EntityKind, value: &T) -> CoreResult<Value> {
        serde_json::to_value(value).map_err(|e| CoreError::MalformedPayload {
            kind: kind.to_string(),
            reason: e.to_string(),
        })
    }

    pub fn create_menu_item(item: &MenuItem) -> CoreResult<Self> {
        let payload = Self::to_payload(EntityKind::MenuItem, item)?;
        Ok(Self::build(
            EntityKind::MenuItem,
            &item.id,
            Operation::Create,
            payload,
            item.updated_at,
        ))
    }

    pub fn create_inventory_item(item: &InventoryItem) -> CoreResult<Self> {
        let payload = Self::to_payload(EntityKind::InventoryItem, item)?;
        Ok(Self::build(
            EntityKind::InventoryItem,
            &item.id,
            Operation::Create,
            payload,
            item.updated_at,
        ))
    }

    /// New order. Orders are created and updated with their full state.
    pub fn create_order(order: &Order) -> CoreResult<Self> {
        let payload = Self::to_payload(EntityKind::Order, order)?;
        Ok(Self::build(
            EntityKind::Order,
            &order.id,
            Operation::Create,
            payload,
            order.updated_at,
        ))
    }

    pub fn update_order(order: &Order) -> CoreResult<Self> {
        let payload = Self::to_payload(EntityKind::Order, order)?;
        Ok(Self::build(
            EntityKind::Order,
            &order.id,
            Operation::Update,
            payload,
            order.updated_at,
        ))
    }

    /// Partial update stamped with the current time.
    pub fn update_menu_item(id: &str, patch: &MenuItemPatch) -> CoreResult<Self> {
        Self::patch(EntityKind::MenuItem, id, patch, clock::now())
    }

    pub fn update_inventory_item(id: &str, patch: &InventoryItemPatch) -> CoreResult<Self> {
        Self::patch(EntityKind::InventoryItem, id, patch, clock::now())
    }

    /// Partial update with an explicit client timestamp.
    pub fn patch<P: Serialize>(
        kind: EntityKind,
        id: &str,
        patch: &P,
        at: DateTime<Utc>,
    ) -> CoreResult<Self> {
        let mut payload = Self::to_payload(kind, patch)?;
        if let Value::Object(fields) = &mut payload {
            fields.insert("updated_at".to_string(), Self::to_payload(kind, &at)?);
        }
        Ok(Self::build(kind, id, Operation::Update, payload, at))
    }

    /// Soft delete of a mutable entity.
    pub fn delete(kind: EntityKind, id: &str) -> CoreResult<Self> {
        let at = clock::now();
        let mut fields = Map::new();
        fields.insert("is_active".to_string(), Value::Bool(false));
        fields.insert("updated_at".to_string(), Self::to_payload(kind, &at)?);
        Ok(Self::build(kind, id, Operation::Delete, Value::Object(fields), at))
    }

    pub fn record_event(event: &InventoryEvent) -> CoreResult<Self> {
        let payload = Self::to_payload(EntityKind::InventoryEvent, event)?;
        Ok(Self::build(
            EntityKind::InventoryEvent,
            &event.id,
            Operation::Create,
            payload,
            event.occurred_at,
        ))
    }

    pub fn record_snapshot(snapshot: &InventorySnapshot) -> CoreResult<Self> {
        let payload = Self::to_payload(EntityKind::InventorySnapshot, snapshot)?;
        Ok(Self::build(
            EntityKind::InventorySnapshot,
            &snapshot.id,
            Operation::Create,
            payload,
            snapshot.taken_at,
        ))
    }
}

// =============================================================================
// Typed Patches
// =============================================================================

/// Changed menu item fields. `None` means "not touched".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MenuItemPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_available: Option<bool>,
}

/// Changed inventory item metadata. The unit cannot be patched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InventoryItemPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reorder_level: Option<i64>,
}

// =============================================================================
// Patch Application
// =============================================================================

/// Borrow a payload as a JSON object.
pub fn payload_fields(kind: EntityKind, payload: &Value) -> CoreResult<&Map<String, Value>> {
    payload.as_object().ok_or_else(|| CoreError::MalformedPayload {
        kind: kind.to_string(),
        reason: "payload must be a JSON object".to_string(),
    })
}

/// Apply one mutation's payload to the current state of an entity.
///
/// Returns the full new state. Creates over an existing entity merge like
/// updates, so a re-delivered create is harmless.
///
/// ## Errors
/// - [`CoreError::AppendOnly`] for update/delete of a ledger record
/// - [`CoreError::UnknownEntity`] for update/delete of a missing entity
/// - [`CoreError::MalformedPayload`] for non-object payloads
pub fn apply_patch(
    kind: EntityKind,
    entity_id: &str,
    current: Option<&Value>,
    operation: Operation,
    payload: &Value,
) -> CoreResult<Value> {
    if kind.is_ledger_record() && operation != Operation::Create {
        return Err(CoreError::AppendOnly {
            kind: kind.to_string(),
        });
    }

    let patch = payload_fields(kind, payload)?;

    let mut state = match (current, operation) {
        (Some(existing), _) => payload_fields(kind, existing)?.clone(),
        (None, Operation::Create) => Map::new(),
        (None, _) => {
            return Err(CoreError::UnknownEntity {
                kind: kind.to_string(),
                id: entity_id.to_string(),
            })
        }
    };

    for (field, value) in patch {
        state.insert(field.clone(), value.clone());
    }

    Ok(Value::Object(state))
}

// =============================================================================
// Unit Tests
// =============================================================================
