//! # Central Inventory Ledger
//!
//! Storage for the account-scoped event/snapshot ledger and the central
//! rules around it: late-event flagging, verified-count overrides and
//! compaction. Stock arithmetic itself is [`tally_core::ledger`].
//!
//! ```text
//! event ingested
//!   ├─ occurred_at <= latest compaction.taken_at → flag item (integrity)
//!   ├─ occurred_at <= latest verified count      → warn (superseded)
//!   └─ not flagged, events since snapshot >= threshold
//!                                                → compact, publish snapshot
//!
//! verified count ingested → clear flag, warn about superseded events
//! compact (manual)        → refused while flagged or if replay disagrees
//! ```

use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqliteConnection};
use tracing::{debug, info, warn};

use tally_core::ledger::{self, StockLevel};
use tally_core::{
    clock, EntityKind, InventoryEvent, InventoryItem, InventorySnapshot, Operation,
    SnapshotSource,
};

use crate::error::{CentralError, CentralResult};
use crate::store;

/// Actor and origin recorded on snapshots the central store writes itself.
pub const CENTRAL_ACTOR: &str = "central";

const EVENT_COLUMNS: &str =
    "id, item_id, action, delta, unit, device_id, actor, occurred_at, sequence, reference";

const SNAPSHOT_COLUMNS: &str =
    "id, item_id, stock_level, unit, taken_at, device_id, verified_by, source, notes";

#[derive(Debug, FromRow)]
struct EventRow {
    id: String,
    item_id: String,
    action: String,
    delta: i64,
    unit: String,
    device_id: String,
    actor: String,
    occurred_at: i64,
    sequence: i64,
    reference: Option<String>,
}

impl TryFrom<EventRow> for InventoryEvent {
    type Error = CentralError;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        Ok(InventoryEvent {
            id: row.id,
            item_id: row.item_id,
            action: row.action.parse()?,
            delta: row.delta,
            unit: row.unit,
            device_id: row.device_id,
            actor: row.actor,
            occurred_at: clock::from_millis(row.occurred_at)?,
            sequence: row.sequence,
            reference: row.reference,
        })
    }
}

#[derive(Debug, FromRow)]
struct SnapshotRow {
    id: String,
    item_id: String,
    stock_level: i64,
    unit: String,
    taken_at: i64,
    device_id: String,
    verified_by: String,
    source: String,
    notes: Option<String>,
}

impl TryFrom<SnapshotRow> for InventorySnapshot {
    type Error = CentralError;

    fn try_from(row: SnapshotRow) -> Result<Self, Self::Error> {
        Ok(InventorySnapshot {
            id: row.id,
            item_id: row.item_id,
            stock_level: row.stock_level,
            unit: row.unit,
            taken_at: clock::from_millis(row.taken_at)?,
            device_id: row.device_id,
            verified_by: row.verified_by,
            source: row.source.parse()?,
            notes: row.notes,
        })
    }
}

/// Stock of one item as reported by the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StockReport {
    pub level: StockLevel,
    /// Why the item is waiting for a verified count, if it is.
    pub flagged: Option<String>,
    /// Events discarded by the latest verified count.
    pub superseded_events: Vec<InventoryEvent>,
}

// =============================================================================
// Reads
// =============================================================================

pub(crate) async fn load_item(
    conn: &mut SqliteConnection,
    account_id: &str,
    item_id: &str,
) -> CentralResult<Option<InventoryItem>> {
    store::load_entity(conn, account_id, EntityKind::InventoryItem, item_id)
        .await?
        .map(|v| serde_json::from_value(v).map_err(CentralError::from))
        .transpose()
}

pub(crate) async fn events_for(
    conn: &mut SqliteConnection,
    account_id: &str,
    item_id: &str,
) -> CentralResult<Vec<InventoryEvent>> {
    let rows = sqlx::query_as::<_, EventRow>(&format!(
        "SELECT {EVENT_COLUMNS} FROM inventory_events WHERE account_id = ?1 AND item_id = ?2 \
         ORDER BY occurred_at, device_id, sequence, id"
    ))
    .bind(account_id)
    .bind(item_id)
    .fetch_all(&mut *conn)
    .await?;

    rows.into_iter().map(InventoryEvent::try_from).collect()
}

pub(crate) async fn snapshots_for(
    conn: &mut SqliteConnection,
    account_id: &str,
    item_id: &str,
) -> CentralResult<Vec<InventorySnapshot>> {
    let rows = sqlx::query_as::<_, SnapshotRow>(&format!(
        "SELECT {SNAPSHOT_COLUMNS} FROM inventory_snapshots WHERE account_id = ?1 AND item_id = ?2 \
         ORDER BY taken_at, id"
    ))
    .bind(account_id)
    .bind(item_id)
    .fetch_all(&mut *conn)
    .await?;

    rows.into_iter().map(InventorySnapshot::try_from).collect()
}

pub(crate) async fn flag_reason(
    conn: &mut SqliteConnection,
    account_id: &str,
    item_id: &str,
) -> CentralResult<Option<String>> {
    Ok(sqlx::query_scalar(
        "SELECT reason FROM ledger_flags WHERE account_id = ?1 AND item_id = ?2",
    )
    .bind(account_id)
    .bind(item_id)
    .fetch_optional(&mut *conn)
    .await?)
}

/// Stock level, flag and superseded events of one item.
pub(crate) async fn stock_report(
    conn: &mut SqliteConnection,
    account_id: &str,
    item_id: &str,
) -> CentralResult<StockReport> {
    let item = load_item(conn, account_id, item_id)
        .await?
        .ok_or_else(|| CentralError::NotFound(format!("inventory item {item_id}")))?;
    let snapshots = snapshots_for(conn, account_id, item_id).await?;
    let events = events_for(conn, account_id, item_id).await?;

    let level = ledger::compute_stock(&item, &snapshots, &events)?;
    let superseded_events = ledger::superseded_events(&snapshots, &events)
        .into_iter()
        .cloned()
        .collect();

    Ok(StockReport {
        level,
        flagged: flag_reason(conn, account_id, item_id).await?,
        superseded_events,
    })
}

// =============================================================================
// Writes
// =============================================================================

/// Insert an event. Returns false if it was already present.
pub(crate) async fn insert_event(
    conn: &mut SqliteConnection,
    account_id: &str,
    event: &InventoryEvent,
) -> CentralResult<bool> {
    let result = sqlx::query(
        r#"
        INSERT OR IGNORE INTO inventory_events (
            id, account_id, item_id, action, delta, unit, device_id, actor,
            occurred_at, sequence, reference, inserted_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
        "#,
    )
    .bind(&event.id)
    .bind(account_id)
    .bind(&event.item_id)
    .bind(event.action.as_str())
    .bind(event.delta)
    .bind(&event.unit)
    .bind(&event.device_id)
    .bind(&event.actor)
    .bind(clock::to_millis(event.occurred_at))
    .bind(event.sequence)
    .bind(&event.reference)
    .bind(clock::to_millis(clock::now()))
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Insert a snapshot. Returns false if it was already present.
pub(crate) async fn insert_snapshot(
    conn: &mut SqliteConnection,
    account_id: &str,
    snapshot: &InventorySnapshot,
) -> CentralResult<bool> {
    let result = sqlx::query(
        r#"
        INSERT OR IGNORE INTO inventory_snapshots (
            id, account_id, item_id, stock_level, unit, taken_at, device_id,
            verified_by, source, notes, inserted_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
        "#,
    )
    .bind(&snapshot.id)
    .bind(account_id)
    .bind(&snapshot.item_id)
    .bind(snapshot.stock_level)
    .bind(&snapshot.unit)
    .bind(clock::to_millis(snapshot.taken_at))
    .bind(&snapshot.device_id)
    .bind(&snapshot.verified_by)
    .bind(snapshot.source.as_str())
    .bind(&snapshot.notes)
    .bind(clock::to_millis(clock::now()))
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected() > 0)
}

async fn flag_item(
    conn: &mut SqliteConnection,
    account_id: &str,
    item_id: &str,
    reason: &str,
) -> CentralResult<()> {
    sqlx::query(
        r#"
        INSERT INTO ledger_flags (account_id, item_id, reason, flagged_at)
        VALUES (?1, ?2, ?3, ?4)
        ON CONFLICT (account_id, item_id) DO UPDATE SET
            reason = excluded.reason,
            flagged_at = excluded.flagged_at
        "#,
    )
    .bind(account_id)
    .bind(item_id)
    .bind(reason)
    .bind(clock::to_millis(clock::now()))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn clear_flag(
    conn: &mut SqliteConnection,
    account_id: &str,
    item_id: &str,
) -> CentralResult<bool> {
    let result = sqlx::query("DELETE FROM ledger_flags WHERE account_id = ?1 AND item_id = ?2")
        .bind(account_id)
        .bind(item_id)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Store a snapshot written by the central store and publish it.
async fn publish_snapshot(
    conn: &mut SqliteConnection,
    account_id: &str,
    snapshot: &InventorySnapshot,
) -> CentralResult<i64> {
    insert_snapshot(conn, account_id, snapshot).await?;
    store::append_change(
        conn,
        account_id,
        EntityKind::InventorySnapshot,
        &snapshot.id,
        Operation::Create,
        &serde_json::to_value(snapshot)?,
        CENTRAL_ACTOR,
    )
    .await
}

// =============================================================================
// Ingest Rules
// =============================================================================

/// Central checks after a device event was stored.
///
/// Returns the compaction snapshot if one was written.
pub(crate) async fn after_event(
    conn: &mut SqliteConnection,
    account_id: &str,
    item: &InventoryItem,
    event: &InventoryEvent,
    compaction_threshold: usize,
) -> CentralResult<Option<InventorySnapshot>> {
    let snapshots = snapshots_for(conn, account_id, &item.id).await?;

    if let Some(latest) = ledger::latest_snapshot(&snapshots) {
        if event.occurred_at <= latest.taken_at {
            match latest.source {
                SnapshotSource::Compaction => {
                    let reason = format!(
                        "event {} from {} predates compaction snapshot {}",
                        event.id, event.device_id, latest.id
                    );
                    warn!(
                        account_id,
                        item_id = %item.id,
                        event_id = %event.id,
                        "Late event behind compaction, item flagged for verification"
                    );
                    flag_item(conn, account_id, &item.id, &reason).await?;
                }
                SnapshotSource::VerifiedCount => {
                    warn!(
                        account_id,
                        item_id = %item.id,
                        event_id = %event.id,
                        delta = event.delta,
                        count_id = %latest.id,
                        "Event superseded by a later verified count"
                    );
                }
            }
        }
    }

    if flag_reason(conn, account_id, &item.id).await?.is_some() {
        return Ok(None);
    }

    let events = events_for(conn, account_id, &item.id).await?;
    let level = ledger::compute_stock(item, &snapshots, &events)?;
    if level.events_applied < compaction_threshold {
        return Ok(None);
    }
    if level.quantity < 0 {
        debug!(
            account_id,
            item_id = %item.id,
            quantity = level.quantity,
            "Negative stock, waiting for a verified count before compacting"
        );
        return Ok(None);
    }

    let Some(snapshot) = ledger::compact(item, &snapshots, &events, CENTRAL_ACTOR, CENTRAL_ACTOR)?
    else {
        return Ok(None);
    };
    publish_snapshot(conn, account_id, &snapshot).await?;
    info!(
        account_id,
        item_id = %item.id,
        stock_level = snapshot.stock_level,
        folded = level.events_applied,
        "Ledger compacted"
    );
    Ok(Some(snapshot))
}

/// Central checks after a device snapshot was stored.
pub(crate) async fn after_snapshot(
    conn: &mut SqliteConnection,
    account_id: &str,
    item: &InventoryItem,
    snapshot: &InventorySnapshot,
) -> CentralResult<()> {
    if snapshot.source != SnapshotSource::VerifiedCount {
        return Ok(());
    }

    if clear_flag(conn, account_id, &item.id).await? {
        info!(account_id, item_id = %item.id, "Verified count cleared ledger flag");
    }

    let snapshots = snapshots_for(conn, account_id, &item.id).await?;
    let events = events_for(conn, account_id, &item.id).await?;
    let superseded = ledger::superseded_events(&snapshots, &events);
    if !superseded.is_empty() {
        let discarded: i64 = superseded.iter().map(|e| e.delta).sum();
        warn!(
            account_id,
            item_id = %item.id,
            count_id = %snapshot.id,
            superseded = superseded.len(),
            discarded_delta = discarded,
            "Verified count overrides earlier events"
        );
    }
    Ok(())
}

/// Compact one item on request.
///
/// Refused with [`CentralError::Integrity`] while the item is flagged or
/// when replaying its history disagrees with a stored snapshot.
pub(crate) async fn compact_item(
    conn: &mut SqliteConnection,
    account_id: &str,
    item_id: &str,
    actor: &str,
) -> CentralResult<Option<InventorySnapshot>> {
    let item = load_item(conn, account_id, item_id)
        .await?
        .ok_or_else(|| CentralError::NotFound(format!("inventory item {item_id}")))?;

    if let Some(reason) = flag_reason(conn, account_id, item_id).await? {
        return Err(CentralError::Integrity(format!(
            "item {item_id} needs a verified count: {reason}"
        )));
    }

    let snapshots = snapshots_for(conn, account_id, item_id).await?;
    let events = events_for(conn, account_id, item_id).await?;
    ledger::verify_history(&item, &snapshots, &events)?;

    let level = ledger::compute_stock(&item, &snapshots, &events)?;
    if level.quantity < 0 {
        return Err(CentralError::Integrity(format!(
            "item {item_id} is at {} {}, record a verified count",
            level.quantity, item.unit
        )));
    }

    let Some(snapshot) = ledger::compact(&item, &snapshots, &events, actor, CENTRAL_ACTOR)? else {
        return Ok(None);
    };
    publish_snapshot(conn, account_id, &snapshot).await?;
    info!(account_id, item_id, stock_level = snapshot.stock_level, "Ledger compacted on request");
    Ok(Some(snapshot))
}
