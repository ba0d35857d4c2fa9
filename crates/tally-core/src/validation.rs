//! # Validation Module
//!
//! Payload validation shared by the device store and the central store.
//!
//! ## Validation Strategy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Validation Layers                                  │
//! │                                                                         │
//! │  Layer 1: Device (tally-db)                                            │
//! │  ├── parse_entity on the merged state before the local write           │
//! │  └── invalid input never reaches the sync queue                        │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 2: Central (central-api)                                        │
//! │  ├── THIS MODULE again, on the state produced by the pushed patch      │
//! │  └── failure → `rejected` outcome (terminal for that entry)            │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 3: Database (SQLite)                                            │
//! │  ├── NOT NULL / UNIQUE constraints                                     │
//! │  └── UNIQUE(device_id, local_id) idempotency index                     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//! ```rust
//! use tally_core::validation::validate_name;
//!
//! assert!(validate_name("Iced Latte").is_ok());
//! assert!(validate_name("   ").is_err());
//! ```

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{CoreError, CoreResult, ValidationError};
use crate::types::{
    EntityKind, InventoryEvent, InventoryItem, InventorySnapshot, MenuItem, Order, StockAction,
};
use crate::{MAX_LINE_QUANTITY, MAX_ORDER_LINES};

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

// =============================================================================
// Parsed Entity
// =============================================================================

/// A payload that passed shape and business-rule validation.
#[derive(Debug, Clone, PartialEq)]
pub enum Entity {
    Order(Order),
    MenuItem(MenuItem),
    InventoryItem(InventoryItem),
    InventoryEvent(InventoryEvent),
    InventorySnapshot(InventorySnapshot),
}

fn parse<T: DeserializeOwned>(kind: EntityKind, state: &Value) -> CoreResult<T> {
    serde_json::from_value(state.clone()).map_err(|e| CoreError::MalformedPayload {
        kind: kind.to_string(),
        reason: e.to_string(),
    })
}

fn check_id(kind: EntityKind, expected: &str, found: &str) -> CoreResult<()> {
    if expected != found {
        return Err(CoreError::MalformedPayload {
            kind: kind.to_string(),
            reason: format!("payload id {found} does not match entity id {expected}"),
        });
    }
    Ok(())
}

/// Parse and validate the full state of an entity.
///
/// `previous` is the state before this mutation (if any); it is used for
/// rules that compare old and new values, like the immutable item unit.
pub fn parse_entity(
    kind: EntityKind,
    entity_id: &str,
    state: &Value,
    previous: Option<&Value>,
) -> CoreResult<Entity> {
    match kind {
        EntityKind::Order => {
            let order: Order = parse(kind, state)?;
            check_id(kind, entity_id, &order.id)?;
            validate_order(&order)?;
            Ok(Entity::Order(order))
        }
        EntityKind::MenuItem => {
            let item: MenuItem = parse(kind, state)?;
            check_id(kind, entity_id, &item.id)?;
            validate_name(&item.name)?;
            validate_price(item.price)?;
            Ok(Entity::MenuItem(item))
        }
        EntityKind::InventoryItem => {
            let item: InventoryItem = parse(kind, state)?;
            check_id(kind, entity_id, &item.id)?;
            validate_name(&item.name)?;
            validate_unit(&item.unit)?;
            if let Some(level) = item.reorder_level {
                validate_non_negative("reorder_level", level)?;
            }
            if let Some(prev) = previous {
                let prev: InventoryItem = parse(kind, prev)?;
                if prev.unit != item.unit {
                    return Err(ValidationError::Immutable {
                        field: "unit".to_string(),
                    }
                    .into());
                }
            }
            Ok(Entity::InventoryItem(item))
        }
        EntityKind::InventoryEvent => {
            let event: InventoryEvent = parse(kind, state)?;
            check_id(kind, entity_id, &event.id)?;
            validate_event_delta(event.action, event.delta)?;
            validate_unit(&event.unit)?;
            Ok(Entity::InventoryEvent(event))
        }
        EntityKind::InventorySnapshot => {
            let snapshot: InventorySnapshot = parse(kind, state)?;
            check_id(kind, entity_id, &snapshot.id)?;
            validate_non_negative("stock_level", snapshot.stock_level)?;
            validate_unit(&snapshot.unit)?;
            Ok(Entity::InventorySnapshot(snapshot))
        }
    }
}

// =============================================================================
// Field Validators
// =============================================================================

/// Validates a display name.
///
/// ## Rules
/// - Must not be empty after trimming
/// - At most 200 characters
pub fn validate_name(name: &str) -> ValidationResult<()> {
    let name = name.trim();

    if name.is_empty() {
        return Err(ValidationError::Required {
            field: "name".to_string(),
        });
    }

    if name.chars().count() > 200 {
        return Err(ValidationError::TooLong {
            field: "name".to_string(),
            max: 200,
        });
    }

    Ok(())
}

/// Validates a unit of measure ("g", "ml", "pcs", ...).
pub fn validate_unit(unit: &str) -> ValidationResult<()> {
    if unit.trim().is_empty() {
        return Err(ValidationError::Required {
            field: "unit".to_string(),
        });
    }
    if unit.len() > 20 {
        return Err(ValidationError::TooLong {
            field: "unit".to_string(),
            max: 20,
        });
    }
    Ok(())
}

/// Validates a price in minor units. Zero is allowed (free items).
pub fn validate_price(price: i64) -> ValidationResult<()> {
    validate_non_negative("price", price)
}

fn validate_non_negative(field: &str, value: i64) -> ValidationResult<()> {
    if value < 0 {
        return Err(ValidationError::OutOfRange {
            field: field.to_string(),
            min: 0,
            max: i64::MAX,
        });
    }
    Ok(())
}

/// Validates an order line quantity.
///
/// ## Rules
/// - Must be positive (> 0)
/// - Must not exceed MAX_LINE_QUANTITY (999)
pub fn validate_quantity(qty: i64) -> ValidationResult<()> {
    if qty <= 0 {
        return Err(ValidationError::MustBePositive {
            field: "quantity".to_string(),
        });
    }

    if qty > MAX_LINE_QUANTITY {
        return Err(ValidationError::OutOfRange {
            field: "quantity".to_string(),
            min: 1,
            max: MAX_LINE_QUANTITY,
        });
    }

    Ok(())
}

/// Validates the sign of a stock movement against its action.
///
/// ```text
/// sale        delta < 0
/// restock     delta > 0
/// adjustment  delta != 0
/// ```
pub fn validate_event_delta(action: StockAction, delta: i64) -> ValidationResult<()> {
    let ok = match action {
        StockAction::Sale => delta < 0,
        StockAction::Restock => delta > 0,
        StockAction::Adjustment => delta != 0,
    };
    if !ok {
        return Err(ValidationError::InvalidFormat {
            field: "delta".to_string(),
            reason: format!("{delta} is not valid for a {} event", action.as_str()),
        });
    }
    Ok(())
}

/// Validates an order's lines and total.
pub fn validate_order(order: &Order) -> ValidationResult<()> {
    if order.lines.len() > MAX_ORDER_LINES {
        return Err(ValidationError::OutOfRange {
            field: "lines".to_string(),
            min: 0,
            max: MAX_ORDER_LINES as i64,
        });
    }

    for line in &order.lines {
        validate_quantity(line.quantity)?;
        validate_price(line.unit_price)?;
    }

    let expected = order.computed_total().minor();
    if expected != order.total {
        return Err(ValidationError::Mismatch {
            field: "total".to_string(),
            expected,
            actual: order.total,
        });
    }

    Ok(())
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OrderLine;
    use serde_json::json;

    #[test]
    fn test_validate_name() {
        assert!(validate_name("Flat White").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name(&"x".repeat(201)).is_err());
    }

    #[test]
    fn test_event_delta_sign() {
        assert!(validate_event_delta(StockAction::Sale, -3).is_ok());
        assert!(validate_event_delta(StockAction::Sale, 3).is_err());
        assert!(validate_event_delta(StockAction::Restock, 10).is_ok());
        assert!(validate_event_delta(StockAction::Adjustment, 0).is_err());
    }

    #[test]
    fn test_order_total_must_match_lines() {
        let mut order = Order::new(
            "dev-a",
            vec![OrderLine {
                menu_item_id: "m1".into(),
                name: "Latte".into(),
                unit_price: 25000,
                quantity: 2,
            }],
        );
        assert!(validate_order(&order).is_ok());

        order.total = 1;
        let err = validate_order(&order).unwrap_err();
        assert!(matches!(err, ValidationError::Mismatch { expected: 50000, .. }));
    }

    #[test]
    fn test_parse_entity_rejects_id_mismatch() {
        let item = MenuItem::new("Tea", 9000);
        let state = serde_json::to_value(&item).unwrap();
        assert!(parse_entity(EntityKind::MenuItem, &item.id, &state, None).is_ok());
        assert!(parse_entity(EntityKind::MenuItem, "other", &state, None).is_err());
    }

    #[test]
    fn test_inventory_unit_is_immutable() {
        let item = InventoryItem::new("Milk", "ml");
        let before = serde_json::to_value(&item).unwrap();
        let mut after = before.clone();
        after["unit"] = json!("l");

        let err = parse_entity(EntityKind::InventoryItem, &item.id, &after, Some(&before))
            .unwrap_err();
        assert!(matches!(
            err,
            CoreError::Validation(ValidationError::Immutable { .. })
        ));
    }

    #[test]
    fn test_negative_price_rejected() {
        let mut item = MenuItem::new("Tea", 9000);
        item.price = -1;
        let state = serde_json::to_value(&item).unwrap();
        assert!(parse_entity(EntityKind::MenuItem, &item.id, &state, None).is_err());
    }
}
