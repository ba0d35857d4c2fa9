//! # Conflict Resolver
//!
//! Decides the outcome when devices mutated the same entity without having
//! seen each other's changes.
//!
//! ## When Is It Called?
//! ```text
//! Device A ── update X (local_id 7) ──► central applies, change seq 41
//!                                              │
//! Device B (watermark 30, never saw seq 41)    │
//!         ── update X (local_id 3) ──►  central: "X changed at seq 41 by
//!                                        another device, after B's
//!                                        watermark" → resolve(kind, [A..], B)
//! ```
//!
//! ## Policy per Entity Kind
//! ```text
//! ┌──────────────────────┬──────────────────────────┬────────────────────────┐
//! │ kind                 │ strategy                 │ resolved payload       │
//! ├──────────────────────┼──────────────────────────┼────────────────────────┤
//! │ order                │ last_receipt_wins        │ incoming, whole        │
//! │ menu_item            │ field_last_writer_wins   │ union of fields, later │
//! │ inventory_item       │ field_last_writer_wins   │ timestamp per field,   │
//! │                      │                          │ tie → smaller device   │
//! │ inventory_event      │ retain_both              │ incoming (append-only) │
//! │ inventory_snapshot   │ retain_both              │ incoming (append-only) │
//! └──────────────────────┴──────────────────────────┴────────────────────────┘
//! ```
//!
//! Every unseen mutation competes, not just the latest one. The result
//! depends only on the payloads, their client timestamps and device ids, so
//! resolving the same set twice always yields the same payload.

use std::cmp::Ordering;
use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::error::CoreResult;
use crate::mutation::payload_fields;
use crate::types::{EntityKind, MutationRef, Operation, ResolutionStrategy};

// =============================================================================
// Types
// =============================================================================

/// One side of a conflict.
#[derive(Debug, Clone, PartialEq)]
pub struct Contender {
    pub mutation: MutationRef,
    pub operation: Operation,
    /// The payload as pushed (partial for updates).
    pub payload: Value,
    pub client_timestamp: DateTime<Utc>,
}

/// Who won against one competing mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct Contest {
    pub winner: MutationRef,
    pub superseded: MutationRef,
}

/// Outcome of a resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub strategy: ResolutionStrategy,
    /// One contest per competing mutation, in the order they were given.
    pub contests: Vec<Contest>,
    /// Patch to apply on top of the entity's current state.
    pub payload: Value,
}

// =============================================================================
// Dispatch
// =============================================================================

/// Resolve the mutation being applied now (`incoming`) against every
/// already-applied mutation it had not seen (`earlier`, in server receipt
/// order).
pub fn resolve(
    kind: EntityKind,
    earlier: &[Contender],
    incoming: &Contender,
) -> CoreResult<Resolution> {
    match kind {
        EntityKind::Order => Ok(incoming_wins(
            ResolutionStrategy::LastReceiptWins,
            earlier,
            incoming,
        )),
        EntityKind::MenuItem => resolve_fields(kind, earlier, incoming),
        EntityKind::InventoryItem => resolve_fields(kind, earlier, incoming),
        EntityKind::InventoryEvent | EntityKind::InventorySnapshot => Ok(incoming_wins(
            ResolutionStrategy::RetainBoth,
            earlier,
            incoming,
        )),
    }
}

/// Orders are not merged: the mutation the server received last wins whole.
/// Ledger records never overwrite each other; both stay in the ledger.
fn incoming_wins(
    strategy: ResolutionStrategy,
    earlier: &[Contender],
    incoming: &Contender,
) -> Resolution {
    Resolution {
        strategy,
        contests: earlier
            .iter()
            .map(|e| Contest {
                winner: incoming.mutation.clone(),
                superseded: e.mutation.clone(),
            })
            .collect(),
        payload: incoming.payload.clone(),
    }
}

/// Field-level last-writer-wins.
///
/// Each field takes the value of the contender with the highest precedence
/// among those that touched it, so an older edit never overwrites a newer one
/// no matter how many other edits sit between them.
fn resolve_fields(
    kind: EntityKind,
    earlier: &[Contender],
    incoming: &Contender,
) -> CoreResult<Resolution> {
    let mut merged: Map<String, Value> = Map::new();
    let mut holders: HashMap<&str, &Contender> = HashMap::new();

    for contender in earlier.iter().chain(std::iter::once(incoming)) {
        for (field, value) in payload_fields(kind, &contender.payload)? {
            let takes_field = holders
                .get(field.as_str())
                .map_or(true, |held| precedence(contender, held) == Ordering::Greater);
            if takes_field {
                merged.insert(field.clone(), value.clone());
                holders.insert(field.as_str(), contender);
            }
        }
    }

    let contests = earlier
        .iter()
        .map(|e| match precedence(incoming, e) {
            Ordering::Greater => Contest {
                winner: incoming.mutation.clone(),
                superseded: e.mutation.clone(),
            },
            _ => Contest {
                winner: e.mutation.clone(),
                superseded: incoming.mutation.clone(),
            },
        })
        .collect();

    Ok(Resolution {
        strategy: ResolutionStrategy::FieldLastWriterWins,
        contests,
        payload: Value::Object(merged),
    })
}

/// Total order over contenders: later timestamp first, then the
/// lexicographically smaller device id, then the higher local id.
fn precedence(a: &Contender, b: &Contender) -> Ordering {
    a.client_timestamp
        .cmp(&b.client_timestamp)
        .then_with(|| b.mutation.device_id.cmp(&a.mutation.device_id))
        .then_with(|| a.mutation.local_id.cmp(&b.mutation.local_id))
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn contender(device: &str, local_id: i64, ts: i64, payload: Value) -> Contender {
        Contender {
            mutation: MutationRef {
                device_id: device.to_string(),
                local_id,
            },
            operation: Operation::Update,
            payload,
            client_timestamp: at(ts),
        }
    }

    #[test]
    fn test_menu_price_later_timestamp_wins() {
        let a = contender("dev-a", 1, 10, json!({"price": 15000}));
        let b = contender("dev-b", 1, 12, json!({"price": 18000}));

        // Whichever push reaches the server first, B's price wins and A is
        // the superseded mutation.
        for (earlier, incoming) in [(&a, &b), (&b, &a)] {
            let resolution = resolve(EntityKind::MenuItem, &[earlier.clone()], incoming).unwrap();
            assert_eq!(resolution.strategy, ResolutionStrategy::FieldLastWriterWins);
            assert_eq!(resolution.payload["price"], json!(18000));
            assert_eq!(resolution.contests.len(), 1);
            assert_eq!(resolution.contests[0].superseded, a.mutation);
            assert_eq!(resolution.contests[0].winner, b.mutation);
        }
    }

    #[test]
    fn test_timestamp_tie_prefers_smaller_device_id() {
        let a = contender("dev-a", 5, 10, json!({"name": "Chai"}));
        let b = contender("dev-b", 2, 10, json!({"name": "Masala Chai"}));

        let resolution = resolve(EntityKind::MenuItem, &[b], &a).unwrap();
        assert_eq!(resolution.payload["name"], json!("Chai"));
        assert_eq!(resolution.contests[0].winner.device_id, "dev-a");
    }

    #[test]
    fn test_non_conflicting_fields_are_merged() {
        let a = contender("dev-a", 1, 20, json!({"name": "Oat Milk", "updated_at": "a"}));
        let b = contender("dev-b", 1, 15, json!({"reorder_level": 12, "updated_at": "b"}));

        let resolution = resolve(EntityKind::InventoryItem, &[a], &b).unwrap();
        assert_eq!(
            resolution.payload,
            json!({"name": "Oat Milk", "reorder_level": 12, "updated_at": "a"})
        );
    }

    #[test]
    fn test_older_edit_loses_to_every_newer_edit_of_the_field() {
        // A changed the price and then the name; B never saw either and
        // changed the price with an older clock.
        let a_price = contender("dev-a", 1, 20, json!({"price": 20000}));
        let a_name = contender("dev-a", 2, 21, json!({"name": "Flat White"}));
        let b_price = contender("dev-b", 1, 10, json!({"price": 15000}));

        let resolution =
            resolve(EntityKind::MenuItem, &[a_price.clone(), a_name.clone()], &b_price).unwrap();
        assert_eq!(
            resolution.payload,
            json!({"price": 20000, "name": "Flat White"})
        );
        assert_eq!(resolution.contests.len(), 2);
        for contest in &resolution.contests {
            assert_eq!(contest.superseded, b_price.mutation);
        }
        assert_eq!(resolution.contests[0].winner, a_price.mutation);
        assert_eq!(resolution.contests[1].winner, a_name.mutation);
    }

    #[test]
    fn test_newer_edit_beats_several_older_ones() {
        let a = contender("dev-a", 1, 10, json!({"price": 100}));
        let c = contender("dev-c", 1, 11, json!({"price": 110, "is_available": false}));
        let b = contender("dev-b", 1, 30, json!({"price": 300}));

        let resolution = resolve(EntityKind::MenuItem, &[a, c], &b).unwrap();
        assert_eq!(resolution.payload, json!({"price": 300, "is_available": false}));
        assert!(resolution.contests.iter().all(|c| c.winner == b.mutation));
    }

    #[test]
    fn test_delete_competes_as_a_field() {
        let a = contender("dev-a", 1, 10, json!({"is_active": false}));
        let b = contender("dev-b", 1, 12, json!({"is_active": true, "price": 900}));

        let resolution = resolve(EntityKind::MenuItem, &[b], &a).unwrap();
        assert_eq!(resolution.payload, json!({"is_active": true, "price": 900}));
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let a = contender("dev-a", 3, 10, json!({"price": 100, "is_available": false}));
        let b = contender("dev-b", 9, 11, json!({"price": 120}));

        let first = resolve(EntityKind::MenuItem, &[a.clone()], &b).unwrap();
        let second = resolve(EntityKind::MenuItem, &[a], &b).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_orders_last_receipt_wins_regardless_of_clock() {
        let a = contender("dev-a", 1, 99, json!({"status": "paid"}));
        let b = contender("dev-b", 1, 1, json!({"status": "voided"}));

        let resolution = resolve(EntityKind::Order, &[a.clone()], &b).unwrap();
        assert_eq!(resolution.strategy, ResolutionStrategy::LastReceiptWins);
        assert_eq!(resolution.payload, json!({"status": "voided"}));
        assert_eq!(resolution.contests[0].superseded, a.mutation);
    }

    #[test]
    fn test_ledger_records_retain_both() {
        let a = contender("dev-a", 1, 1, json!({"delta": -3}));
        let b = contender("dev-b", 1, 2, json!({"delta": 5}));

        let resolution = resolve(EntityKind::InventoryEvent, &[a], &b).unwrap();
        assert_eq!(resolution.strategy, ResolutionStrategy::RetainBoth);
        assert_eq!(resolution.payload, json!({"delta": 5}));
    }
}
