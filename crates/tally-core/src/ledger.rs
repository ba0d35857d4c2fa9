//! # Inventory Ledger
//!
//! Stock is never stored as a mutable number. It is derived from an
//! append-only history:
//!
//! ```text
//!   snapshots ──────────────●────────────────────●───────────────▶ time
//!                     compaction (40)     verified count (50)
//!   events     +10   -3   -2 │  +5   -6    -1     │   -4   +12
//!                            │                    │   └────┬───┘
//!                            │                    │   folded on read
//!
//!   stock = latest snapshot.stock_level + Σ deltas of events strictly after
//!           snapshot.taken_at, ordered by (occurred_at, device_id, sequence)
//!         = 50 + (-4) + 12 = 58
//! ```
//!
//! Everything here is pure; the device store and the central store load the
//! rows and call these functions, so both compute the same level from the
//! same rows.
//!
//! ## Verified Counts Override
//! A verified count is authoritative. Events timestamped at or before it are
//! never folded again, even if they arrive after the count was recorded.
//! [`superseded_events`] reports those events so an operator can review them.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{LedgerError, LedgerResult};
use crate::types::{InventoryEvent, InventoryItem, InventorySnapshot, SnapshotSource};

// =============================================================================
// Stock Level
// =============================================================================

/// Result of folding an item's ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockLevel {
    pub item_id: String,
    pub quantity: i64,
    pub unit: String,
    /// Snapshot used as the baseline, if any.
    pub baseline_snapshot_id: Option<String>,
    pub baseline: i64,
    /// Number of events folded on top of the baseline.
    pub events_applied: usize,
    /// Timestamp of the last folded record.
    pub as_of: Option<DateTime<Utc>>,
}

// =============================================================================
// Ordering
// =============================================================================

/// Snapshot recency: `taken_at`, then verified counts over compactions,
/// then id for a total order.
pub fn snapshot_order(a: &InventorySnapshot, b: &InventorySnapshot) -> Ordering {
    a.taken_at
        .cmp(&b.taken_at)
        .then_with(|| a.source.cmp(&b.source))
        .then_with(|| a.id.cmp(&b.id))
}

/// Fold order: `occurred_at`, then device id, then the device's insertion
/// sequence.
pub fn event_order(a: &InventoryEvent, b: &InventoryEvent) -> Ordering {
    a.occurred_at
        .cmp(&b.occurred_at)
        .then_with(|| a.device_id.cmp(&b.device_id))
        .then_with(|| a.sequence.cmp(&b.sequence))
        .then_with(|| a.id.cmp(&b.id))
}

/// The snapshot that serves as the current baseline.
pub fn latest_snapshot(snapshots: &[InventorySnapshot]) -> Option<&InventorySnapshot> {
    snapshots.iter().max_by(|a, b| snapshot_order(a, b))
}

/// The latest verified count, ignoring compactions.
pub fn latest_verified_count(snapshots: &[InventorySnapshot]) -> Option<&InventorySnapshot> {
    snapshots
        .iter()
        .filter(|s| s.source == SnapshotSource::VerifiedCount)
        .max_by(|a, b| snapshot_order(a, b))
}

/// Events strictly after `after` (all events when `None`), in fold order.
pub fn events_after(after: Option<DateTime<Utc>>, events: &[InventoryEvent]) -> Vec<&InventoryEvent> {
    let mut folded: Vec<&InventoryEvent> = events
        .iter()
        .filter(|e| after.map_or(true, |t| e.occurred_at > t))
        .collect();
    folded.sort_by(|a, b| event_order(a, b));
    folded
}

// =============================================================================
// Integrity Checks
// =============================================================================

/// Every event and snapshot must belong to `item` and use its unit.
pub fn check_records(
    item: &InventoryItem,
    snapshots: &[InventorySnapshot],
    events: &[InventoryEvent],
) -> LedgerResult<()> {
    let records = snapshots
        .iter()
        .map(|s| (&s.id, &s.item_id, &s.unit))
        .chain(events.iter().map(|e| (&e.id, &e.item_id, &e.unit)));

    for (record_id, item_id, unit) in records {
        if *item_id != item.id {
            return Err(LedgerError::ItemMismatch {
                record_id: record_id.clone(),
                expected: item.id.clone(),
                found: item_id.clone(),
            });
        }
        check_unit(item, unit)?;
    }
    Ok(())
}

/// A single record's unit against the item's declared unit.
pub fn check_unit(item: &InventoryItem, unit: &str) -> LedgerResult<()> {
    if unit != item.unit {
        return Err(LedgerError::UnitMismatch {
            item_id: item.id.clone(),
            expected: item.unit.clone(),
            found: unit.to_string(),
        });
    }
    Ok(())
}

fn sum_deltas<'a>(
    item_id: &str,
    start: i64,
    events: impl IntoIterator<Item = &'a InventoryEvent>,
) -> LedgerResult<i64> {
    events.into_iter().try_fold(start, |acc, e| {
        acc.checked_add(e.delta).ok_or_else(|| LedgerError::Overflow {
            item_id: item_id.to_string(),
        })
    })
}

// =============================================================================
// Fold
// =============================================================================

/// Current stock of `item`: latest snapshot plus every later event.
///
/// Without any snapshot the baseline is zero.
///
/// ## Errors
/// - [`LedgerError::UnitMismatch`] / [`LedgerError::ItemMismatch`] for
///   records that do not belong to the item's ledger
/// - [`LedgerError::Overflow`] if the sum leaves i64
pub fn compute_stock(
    item: &InventoryItem,
    snapshots: &[InventorySnapshot],
    events: &[InventoryEvent],
) -> LedgerResult<StockLevel> {
    check_records(item, snapshots, events)?;

    let baseline = latest_snapshot(snapshots);
    let start = baseline.map_or(0, |s| s.stock_level);
    let folded = events_after(baseline.map(|s| s.taken_at), events);
    let quantity = sum_deltas(&item.id, start, folded.iter().copied())?;

    let as_of = folded
        .last()
        .map(|e| e.occurred_at)
        .or_else(|| baseline.map(|s| s.taken_at));

    Ok(StockLevel {
        item_id: item.id.clone(),
        quantity,
        unit: item.unit.clone(),
        baseline_snapshot_id: baseline.map(|s| s.id.clone()),
        baseline: start,
        events_applied: folded.len(),
        as_of,
    })
}

/// Fold the events after the latest snapshot into a new compaction
/// snapshot.
///
/// Returns `None` when nothing happened since the latest snapshot. The new
/// snapshot is stamped with the timestamp of the last folded event, so
/// `compute_stock` gives the same answer before and after it is stored.
pub fn compact(
    item: &InventoryItem,
    snapshots: &[InventorySnapshot],
    events: &[InventoryEvent],
    actor: &str,
    device_id: &str,
) -> LedgerResult<Option<InventorySnapshot>> {
    let level = compute_stock(item, snapshots, events)?;
    if level.events_applied == 0 {
        return Ok(None);
    }

    let Some(taken_at) = level.as_of else {
        return Ok(None);
    };

    Ok(Some(InventorySnapshot {
        id: Uuid::new_v4().to_string(),
        item_id: item.id.clone(),
        stock_level: level.quantity,
        unit: item.unit.clone(),
        taken_at,
        device_id: device_id.to_string(),
        verified_by: actor.to_string(),
        source: SnapshotSource::Compaction,
        notes: Some(format!("folded {} events", level.events_applied)),
    }))
}

// =============================================================================
// Audit
// =============================================================================

/// Events discarded by the latest verified count.
///
/// These are the events timestamped after the snapshot preceding the count
/// and at or before the count itself: their deltas are not part of any
/// folded level, because the count replaced them.
pub fn superseded_events<'a>(
    snapshots: &[InventorySnapshot],
    events: &'a [InventoryEvent],
) -> Vec<&'a InventoryEvent> {
    let Some(count) = latest_verified_count(snapshots) else {
        return Vec::new();
    };

    let previous = snapshots
        .iter()
        .filter(|s| snapshot_order(s, count) == Ordering::Less)
        .max_by(|a, b| snapshot_order(a, b))
        .map(|s| s.taken_at);

    let mut superseded: Vec<&InventoryEvent> = events
        .iter()
        .filter(|e| previous.map_or(true, |t| e.occurred_at > t) && e.occurred_at <= count.taken_at)
        .collect();
    superseded.sort_by(|a, b| event_order(a, b));
    superseded
}

/// Replay the full history and check every compaction snapshot.
///
/// A compaction snapshot must equal its predecessor plus the events between
/// them. Verified counts reset the chain and are never checked. A late event
/// that landed behind a compaction snapshot shows up here as a mismatch.
pub fn verify_history(
    item: &InventoryItem,
    snapshots: &[InventorySnapshot],
    events: &[InventoryEvent],
) -> LedgerResult<()> {
    check_records(item, snapshots, events)?;

    let mut chain: Vec<&InventorySnapshot> = snapshots.iter().collect();
    chain.sort_by(|a, b| snapshot_order(a, b));

    let mut previous: Option<&InventorySnapshot> = None;
    for snapshot in chain {
        if snapshot.source == SnapshotSource::Compaction {
            let start = previous.map_or(0, |p| p.stock_level);
            let after = previous.map(|p| p.taken_at);
            let between = events.iter().filter(|e| {
                after.map_or(true, |t| e.occurred_at > t) && e.occurred_at <= snapshot.taken_at
            });
            let expected = sum_deltas(&item.id, start, between)?;

            if expected != snapshot.stock_level {
                return Err(LedgerError::IntegrityViolation {
                    item_id: item.id.clone(),
                    reason: format!(
                        "snapshot {} records {} but replay gives {}",
                        snapshot.id, snapshot.stock_level, expected
                    ),
                });
            }
        }
        previous = Some(snapshot);
    }

    Ok(())
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StockAction;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn item() -> InventoryItem {
        let mut item = InventoryItem::new("Espresso beans", "g");
        item.id = "beans".to_string();
        item
    }

    fn event(device: &str, seq: i64, secs: i64, delta: i64) -> InventoryEvent {
        InventoryEvent {
            id: format!("{device}-{seq}"),
            item_id: "beans".to_string(),
            action: if delta < 0 {
                StockAction::Sale
            } else {
                StockAction::Restock
            },
            delta,
            unit: "g".to_string(),
            device_id: device.to_string(),
            actor: "cashier".to_string(),
            occurred_at: at(secs),
            sequence: seq,
            reference: None,
        }
    }

    fn verified(secs: i64, level: i64) -> InventorySnapshot {
        let mut snapshot = InventorySnapshot::verified_count(&item(), level, "dev-b", "manager");
        snapshot.taken_at = at(secs);
        snapshot
    }

    #[test]
    fn test_no_snapshot_starts_from_zero() {
        let events = vec![event("dev-a", 1, 1, 100), event("dev-a", 2, 2, -30)];
        let level = compute_stock(&item(), &[], &events).unwrap();
        assert_eq!(level.quantity, 70);
        assert_eq!(level.baseline_snapshot_id, None);
        assert_eq!(level.events_applied, 2);
    }

    #[test]
    fn test_compaction_preserves_stock() {
        let item = item();
        let mut events = vec![
            event("dev-a", 1, 1, 500),
            event("dev-b", 1, 2, -20),
            event("dev-a", 2, 3, -35),
        ];
        let before = compute_stock(&item, &[], &events).unwrap();

        let snapshot = compact(&item, &[], &events, "system", "central")
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.stock_level, 445);
        assert_eq!(snapshot.taken_at, at(3));
        assert_eq!(snapshot.source, SnapshotSource::Compaction);

        let snapshots = vec![snapshot];
        let after = compute_stock(&item, &snapshots, &events).unwrap();
        assert_eq!(after.quantity, before.quantity);
        assert_eq!(after.events_applied, 0);

        events.push(event("dev-b", 2, 10, -5));
        let later = compute_stock(&item, &snapshots, &events).unwrap();
        assert_eq!(later.quantity, 440);

        let tail: i64 = events_after(Some(snapshots[0].taken_at), &events)
            .iter()
            .map(|e| e.delta)
            .sum();
        assert_eq!(later.baseline + tail, later.quantity);

        assert!(verify_history(&item, &snapshots, &events).is_ok());
    }

    #[test]
    fn test_compact_without_new_events_is_noop() {
        let item = item();
        let snapshots = vec![verified(5, 10)];
        assert_eq!(compact(&item, &snapshots, &[], "system", "central").unwrap(), None);
    }

    #[test]
    fn test_verified_count_overrides_earlier_offline_sale() {
        // A sells 3 offline at t=10; B counts 50 at t=20 without knowing.
        let item = item();
        let events = vec![event("dev-a", 1, 10, -3)];
        let snapshots = vec![verified(20, 50)];

        let level = compute_stock(&item, &snapshots, &events).unwrap();
        assert_eq!(level.quantity, 50);

        let superseded = superseded_events(&snapshots, &events);
        assert_eq!(superseded.len(), 1);
        assert_eq!(superseded[0].id, "dev-a-1");
    }

    #[test]
    fn test_events_after_verified_count_are_folded() {
        let item = item();
        let events = vec![event("dev-a", 1, 10, -3), event("dev-a", 2, 30, -4)];
        let snapshots = vec![verified(20, 50)];
        assert_eq!(compute_stock(&item, &snapshots, &events).unwrap().quantity, 46);
    }

    #[test]
    fn test_verified_count_beats_compaction_at_same_instant() {
        let item = item();
        let events = vec![event("dev-a", 1, 5, 40)];
        let mut compaction = compact(&item, &[], &events, "system", "central")
            .unwrap()
            .unwrap();
        compaction.taken_at = at(20);
        let snapshots = vec![compaction, verified(20, 33)];
        assert_eq!(compute_stock(&item, &snapshots, &events).unwrap().quantity, 33);
    }

    #[test]
    fn test_fold_order_ties_break_on_device_then_sequence() {
        let mut events = vec![
            event("dev-b", 1, 5, -1),
            event("dev-a", 2, 5, -1),
            event("dev-a", 1, 5, -1),
        ];
        events.rotate_left(1);
        let ordered: Vec<&str> = events_after(None, &events)
            .into_iter()
            .map(|e| e.id.as_str())
            .collect();
        assert_eq!(ordered, vec!["dev-a-1", "dev-a-2", "dev-b-1"]);
    }

    #[test]
    fn test_unit_mismatch_is_surfaced() {
        let mut bad = event("dev-a", 1, 1, -3);
        bad.unit = "kg".to_string();
        let err = compute_stock(&item(), &[], &[bad]).unwrap_err();
        assert_eq!(
            err,
            LedgerError::UnitMismatch {
                item_id: "beans".to_string(),
                expected: "g".to_string(),
                found: "kg".to_string(),
            }
        );
    }

    #[test]
    fn test_late_event_behind_compaction_fails_verification() {
        let item = item();
        let mut events = vec![event("dev-a", 1, 10, 100)];
        let snapshot = compact(&item, &[], &events, "system", "central")
            .unwrap()
            .unwrap();
        let snapshots = vec![snapshot];

        // dev-b was offline; its sale is older than the compaction.
        events.push(event("dev-b", 1, 5, -7));

        assert_eq!(compute_stock(&item, &snapshots, &events).unwrap().quantity, 100);
        let err = verify_history(&item, &snapshots, &events).unwrap_err();
        assert!(matches!(err, LedgerError::IntegrityViolation { .. }));
    }

    #[test]
    fn test_overflow_detected() {
        let events = vec![event("dev-a", 1, 1, i64::MAX), event("dev-a", 2, 2, 1)];
        assert!(matches!(
            compute_stock(&item(), &[], &events),
            Err(LedgerError::Overflow { .. })
        ));
    }
}
