//! # Ledger Repository
//!
//! Append-only inventory events and snapshots on the device, and the stock
//! levels derived from them with [`tally_core::ledger`].
//!
//! Records are inserted with `INSERT OR IGNORE` on their id, so a record
//! that arrives again through pull is a no-op.

use sqlx::{FromRow, SqliteConnection, SqlitePool};

use crate::error::{DbError, DbResult};
use crate::repository::entity;
use tally_core::ledger::{self, StockLevel};
use tally_core::{clock, EntityKind, InventoryEvent, InventoryItem, InventorySnapshot};

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
    type Error = DbError;

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
    type Error = DbError;

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

/// Insert an event. Returns false if it was already present.
pub(crate) async fn insert_event(
    conn: &mut SqliteConnection,
    event: &InventoryEvent,
) -> DbResult<bool> {
    let result = sqlx::query(
        r#"
        INSERT OR IGNORE INTO inventory_events (
            id, item_id, action, delta, unit, device_id, actor,
            occurred_at, sequence, reference, inserted_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
        "#,
    )
    .bind(&event.id)
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
    snapshot: &InventorySnapshot,
) -> DbResult<bool> {
    let result = sqlx::query(
        r#"
        INSERT OR IGNORE INTO inventory_snapshots (
            id, item_id, stock_level, unit, taken_at, device_id,
            verified_by, source, notes, inserted_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
        "#,
    )
    .bind(&snapshot.id)
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

/// The inventory item a ledger record refers to, typed.
pub(crate) async fn load_item(
    conn: &mut SqliteConnection,
    item_id: &str,
) -> DbResult<Option<InventoryItem>> {
    entity::load(conn, EntityKind::InventoryItem, item_id)
        .await?
        .map(|v| serde_json::from_value(v).map_err(DbError::from))
        .transpose()
}

/// Read access to the device's inventory ledger.
#[derive(Debug, Clone)]
pub struct LedgerRepository {
    pool: SqlitePool,
}

impl LedgerRepository {
    pub fn new(pool: SqlitePool) -> Self {
        LedgerRepository { pool }
    }

    pub async fn events_for_item(&self, item_id: &str) -> DbResult<Vec<InventoryEvent>> {
        let rows = sqlx::query_as::<_, EventRow>(&format!(
            "SELECT {EVENT_COLUMNS} FROM inventory_events WHERE item_id = ?1 \
             ORDER BY occurred_at, device_id, sequence, id"
        ))
        .bind(item_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(InventoryEvent::try_from).collect()
    }

    pub async fn snapshots_for_item(&self, item_id: &str) -> DbResult<Vec<InventorySnapshot>> {
        let rows = sqlx::query_as::<_, SnapshotRow>(&format!(
            "SELECT {SNAPSHOT_COLUMNS} FROM inventory_snapshots WHERE item_id = ?1 \
             ORDER BY taken_at, id"
        ))
        .bind(item_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(InventorySnapshot::try_from).collect()
    }

    async fn item(&self, item_id: &str) -> DbResult<InventoryItem> {
        let mut conn = self.pool.acquire().await?;
        load_item(&mut conn, item_id)
            .await?
            .ok_or_else(|| DbError::not_found("inventory item", item_id))
    }

    /// Current stock: latest snapshot plus the events after it.
    ///
    /// Only the baseline snapshot and the events after it are loaded; the
    /// rest of the history is not needed for the fold.
    pub async fn stock_level(&self, item_id: &str) -> DbResult<StockLevel> {
        let item = self.item(item_id).await?;

        let baseline = sqlx::query_as::<_, SnapshotRow>(&format!(
            r#"
            SELECT {SNAPSHOT_COLUMNS} FROM inventory_snapshots
            WHERE item_id = ?1
            ORDER BY taken_at DESC,
                     CASE source WHEN 'verified_count' THEN 1 ELSE 0 END DESC,
                     id DESC
            LIMIT 1
            "#
        ))
        .bind(item_id)
        .fetch_optional(&self.pool)
        .await?
        .map(InventorySnapshot::try_from)
        .transpose()?;

        let since = baseline
            .as_ref()
            .map_or(i64::MIN, |s| clock::to_millis(s.taken_at));

        let events = sqlx::query_as::<_, EventRow>(&format!(
            "SELECT {EVENT_COLUMNS} FROM inventory_events \
             WHERE item_id = ?1 AND occurred_at > ?2"
        ))
        .bind(item_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(InventoryEvent::try_from)
        .collect::<DbResult<Vec<_>>>()?;

        let snapshots: Vec<InventorySnapshot> = baseline.into_iter().collect();
        Ok(ledger::compute_stock(&item, &snapshots, &events)?)
    }

    /// Events overridden by the latest verified count.
    pub async fn superseded_events(&self, item_id: &str) -> DbResult<Vec<InventoryEvent>> {
        let snapshots = self.snapshots_for_item(item_id).await?;
        let events = self.events_for_item(item_id).await?;
        Ok(ledger::superseded_events(&snapshots, &events)
            .into_iter()
            .cloned()
            .collect())
    }

    /// Replay the whole history and check every compaction snapshot.
    pub async fn verify(&self, item_id: &str) -> DbResult<()> {
        let item = self.item(item_id).await?;
        let snapshots = self.snapshots_for_item(item_id).await?;
        let events = self.events_for_item(item_id).await?;
        ledger::verify_history(&item, &snapshots, &events)?;
        Ok(())
    }
}
