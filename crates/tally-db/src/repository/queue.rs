//! # Sync Queue Repository
//!
//! Durable FIFO of locally-originated mutations awaiting delivery.
//!
//! ## The Outbox Pattern
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Outbox Pattern Implementation                        │
//! │                                                                         │
//! │  LOCAL OPERATION (e.g., update menu price)                             │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────── SINGLE TRANSACTION ──────────────────────────┐   │
//! │  │  1. UPSERT menu_items SET payload = <merged state>              │   │
//! │  │  2. INSERT INTO sync_queue (..., status = 'pending')            │   │
//! │  │     → local_id assigned by AUTOINCREMENT (never reused)         │   │
//! │  └──────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  SYNC ENGINE (tally-sync)                                              │
//! │  1. next_batch(n)      pending / sent / failed-retryable, by local_id  │
//! │  2. mark_sent(ids)     before the network call                         │
//! │  3. per-entry outcome:                                                 │
//! │     applied|duplicate|conflict → mark_acknowledged                     │
//! │     rejected                   → mark_failed(retryable = false)        │
//! │     transport error            → record_attempt_failure                │
//! │                                                                         │
//! │  KEY GUARANTEES:                                                       │
//! │  • An entity write is never without its queue entry (same tx)          │
//! │  • Enqueue order = delivery order, so create precedes update           │
//! │  • `sent` is re-delivered after a crash; central answers `duplicate`   │
//! │  • Terminal failures stay visible until an operator requeues them      │
//! │  • An exhausted entry holds back later entries of its entity           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;

use chrono::Duration;
use sqlx::{FromRow, SqliteConnection, SqlitePool};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{DbError, DbResult};
use tally_core::{clock, EntityKind, Mutation, QueueStatus, SyncQueueEntry};

const COLUMNS: &str = "local_id, device_id, entity_kind, entity_id, operation, payload, \
     client_timestamp, status, attempts, retryable, last_error, created_at, acknowledged_at";

/// Entries the engine may still deliver.
const DELIVERABLE: &str =
    "(status IN ('pending', 'sent') OR (status = 'failed' AND retryable = 1))";

/// No earlier entry of the same entity ran out of retries without central
/// ever seeing it. Such an entry holds back everything queued after it for
/// that entity until it is requeued, so an update never overtakes its create.
const NOT_HELD_BACK: &str = "NOT EXISTS (\
     SELECT 1 FROM sync_queue AS earlier \
     WHERE earlier.entity_kind = sync_queue.entity_kind \
       AND earlier.entity_id = sync_queue.entity_id \
       AND earlier.local_id < sync_queue.local_id \
       AND earlier.status = 'failed' AND earlier.retryable = 0 AND earlier.rejected = 0)";

#[derive(Debug, FromRow)]
struct QueueRow {
    local_id: i64,
    device_id: String,
    entity_kind: String,
    entity_id: String,
    operation: String,
    payload: String,
    client_timestamp: i64,
    status: String,
    attempts: i64,
    retryable: bool,
    last_error: Option<String>,
    created_at: i64,
    acknowledged_at: Option<i64>,
}

impl TryFrom<QueueRow> for SyncQueueEntry {
    type Error = DbError;

    fn try_from(row: QueueRow) -> Result<Self, Self::Error> {
        Ok(SyncQueueEntry {
            local_id: row.local_id,
            device_id: row.device_id,
            entity_kind: row.entity_kind.parse()?,
            entity_id: row.entity_id,
            operation: row.operation.parse()?,
            payload: serde_json::from_str(&row.payload)?,
            client_timestamp: clock::from_millis(row.client_timestamp)?,
            status: row.status.parse()?,
            attempts: u32::try_from(row.attempts).unwrap_or(u32::MAX),
            retryable: row.retryable,
            last_error: row.last_error,
            created_at: clock::from_millis(row.created_at)?,
            acknowledged_at: row.acknowledged_at.map(clock::from_millis).transpose()?,
        })
    }
}

fn into_entries(rows: Vec<QueueRow>) -> DbResult<Vec<SyncQueueEntry>> {
    rows.into_iter().map(SyncQueueEntry::try_from).collect()
}

// =============================================================================
// Transaction-scoped helpers
// =============================================================================

/// Append a mutation with status `pending`.
pub(crate) async fn insert(
    conn: &mut SqliteConnection,
    device_id: &str,
    mutation: &Mutation,
) -> DbResult<SyncQueueEntry> {
    let now = clock::now();
    let payload = serde_json::to_string(&mutation.payload)?;

    let local_id = sqlx::query(
        r#"
        INSERT INTO sync_queue (
            device_id, entity_kind, entity_id, operation, payload,
            client_timestamp, status, attempts, retryable, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', 0, 1, ?7, ?7)
        "#,
    )
    .bind(device_id)
    .bind(mutation.entity_kind.as_str())
    .bind(&mutation.entity_id)
    .bind(mutation.operation.as_str())
    .bind(payload)
    .bind(clock::to_millis(mutation.client_timestamp))
    .bind(clock::to_millis(now))
    .execute(&mut *conn)
    .await?
    .last_insert_rowid();

    debug!(
        local_id,
        entity_kind = %mutation.entity_kind,
        entity_id = %mutation.entity_id,
        operation = %mutation.operation,
        "Queued mutation"
    );

    Ok(SyncQueueEntry {
        local_id,
        device_id: device_id.to_string(),
        entity_kind: mutation.entity_kind,
        entity_id: mutation.entity_id.clone(),
        operation: mutation.operation,
        payload: mutation.payload.clone(),
        client_timestamp: mutation.client_timestamp,
        status: QueueStatus::Pending,
        attempts: 0,
        retryable: true,
        last_error: None,
        created_at: now,
        acknowledged_at: None,
    })
}

/// Whether an entity still has deliverable entries, optionally ignoring one.
pub(crate) async fn pending_for(
    conn: &mut SqliteConnection,
    kind: EntityKind,
    entity_id: &str,
    excluding: Option<i64>,
) -> DbResult<bool> {
    let count: i64 = sqlx::query_scalar(&format!(
        "SELECT COUNT(*) FROM sync_queue \
         WHERE entity_kind = ?1 AND entity_id = ?2 AND local_id != ?3 AND {DELIVERABLE}"
    ))
    .bind(kind.as_str())
    .bind(entity_id)
    .bind(excluding.unwrap_or(-1))
    .fetch_one(&mut *conn)
    .await?;
    Ok(count > 0)
}

/// Mark one entry acknowledged.
pub(crate) async fn acknowledge(conn: &mut SqliteConnection, local_id: i64) -> DbResult<()> {
    let now = clock::to_millis(clock::now());
    sqlx::query(
        r#"
        UPDATE sync_queue SET
            status = 'acknowledged',
            last_error = NULL,
            acknowledged_at = ?2,
            updated_at = ?2
        WHERE local_id = ?1
        "#,
    )
    .bind(local_id)
    .bind(now)
    .execute(&mut *conn)
    .await?;

    // The entity's last local entry is settled: a skipped change for it is
    // now reflected in the state central returns.
    sqlx::query(
        r#"
        DELETE FROM skipped_changes
        WHERE EXISTS (
            SELECT 1 FROM sync_queue AS acked
            WHERE acked.local_id = ?1
              AND acked.entity_kind = skipped_changes.entity_kind
              AND acked.entity_id = skipped_changes.entity_id
        )
        AND NOT EXISTS (
            SELECT 1 FROM sync_queue AS q
            WHERE q.entity_kind = skipped_changes.entity_kind
              AND q.entity_id = skipped_changes.entity_id
              AND q.status != 'acknowledged'
        )
        "#,
    )
    .bind(local_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

// =============================================================================
// Repository
// =============================================================================

/// Repository for sync queue operations.
#[derive(Debug, Clone)]
pub struct SyncQueueRepository {
    pool: SqlitePool,
    write_lock: Arc<Mutex<()>>,
}

impl SyncQueueRepository {
    pub fn new(pool: SqlitePool, write_lock: Arc<Mutex<()>>) -> Self {
        SyncQueueRepository { pool, write_lock }
    }

    /// Append a mutation without touching any entity table.
    ///
    /// Business writes go through [`super::mutations::MutationRepository`],
    /// which enqueues in the same transaction as the entity write. This is
    /// for callers that already persisted the entity elsewhere.
    pub async fn enqueue(&self, device_id: &str, mutation: &Mutation) -> DbResult<SyncQueueEntry> {
        let _writer = self.write_lock.lock().await;
        let mut conn = self.pool.acquire().await?;
        insert(&mut conn, device_id, mutation).await
    }

    /// Next entries to deliver, oldest first, without removing them.
    ///
    /// Entries queued behind an exhausted entry of the same entity stay
    /// pending but are not returned until that entry is requeued.
    pub async fn next_batch(&self, max_size: u32) -> DbResult<Vec<SyncQueueEntry>> {
        let rows = sqlx::query_as::<_, QueueRow>(&format!(
            "SELECT {COLUMNS} FROM sync_queue WHERE {DELIVERABLE} AND {NOT_HELD_BACK} \
             ORDER BY local_id ASC LIMIT ?1"
        ))
        .bind(max_size)
        .fetch_all(&self.pool)
        .await?;

        into_entries(rows)
    }

    pub async fn get(&self, local_id: i64) -> DbResult<Option<SyncQueueEntry>> {
        let row = sqlx::query_as::<_, QueueRow>(&format!(
            "SELECT {COLUMNS} FROM sync_queue WHERE local_id = ?1"
        ))
        .bind(local_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(SyncQueueEntry::try_from).transpose()
    }

    /// Record that entries are about to be submitted.
    pub async fn mark_sent(&self, local_ids: &[i64]) -> DbResult<()> {
        let _writer = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        let now = clock::to_millis(clock::now());

        for local_id in local_ids {
            sqlx::query(
                "UPDATE sync_queue SET status = 'sent', updated_at = ?2 \
                 WHERE local_id = ?1 AND status != 'acknowledged'",
            )
            .bind(local_id)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Central confirmed the entry (applied, duplicate or resolved conflict).
    pub async fn mark_acknowledged(&self, local_id: i64) -> DbResult<()> {
        let _writer = self.write_lock.lock().await;
        let mut conn = self.pool.acquire().await?;
        acknowledge(&mut conn, local_id).await
    }

    /// Record central's answer for an entry it refused.
    ///
    /// Non-retryable failures drop out of [`Self::next_batch`] and show up in
    /// [`Self::failed_entries`]. Central keeps the refusal, so later entries
    /// of the same entity are not held back by it.
    pub async fn mark_failed(&self, local_id: i64, reason: &str, retryable: bool) -> DbResult<()> {
        let _writer = self.write_lock.lock().await;
        let now = clock::to_millis(clock::now());

        sqlx::query(
            r#"
            UPDATE sync_queue SET
                status = 'failed',
                attempts = attempts + 1,
                retryable = ?3,
                rejected = NOT ?3,
                last_error = ?2,
                updated_at = ?4
            WHERE local_id = ?1 AND status != 'acknowledged'
            "#,
        )
        .bind(local_id)
        .bind(reason)
        .bind(retryable)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if !retryable {
            warn!(local_id, reason = %reason, "Sync queue entry failed permanently");
        }
        Ok(())
    }

    /// Count a transient failure against every entry of a batch.
    ///
    /// Entries that reach `max_attempts` become terminal failures. Returns
    /// the local ids that were exhausted by this call.
    pub async fn record_attempt_failure(
        &self,
        local_ids: &[i64],
        reason: &str,
        max_attempts: u32,
    ) -> DbResult<Vec<i64>> {
        let _writer = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        let now = clock::to_millis(clock::now());
        let mut exhausted = Vec::new();

        for &local_id in local_ids {
            let retryable: Option<bool> = sqlx::query_scalar(
                r#"
                UPDATE sync_queue SET
                    status = 'failed',
                    attempts = attempts + 1,
                    retryable = CASE WHEN attempts + 1 >= ?3 THEN 0 ELSE 1 END,
                    last_error = ?2,
                    updated_at = ?4
                WHERE local_id = ?1 AND status != 'acknowledged'
                RETURNING retryable
                "#,
            )
            .bind(local_id)
            .bind(reason)
            .bind(max_attempts)
            .bind(now)
            .fetch_optional(&mut *tx)
            .await?;

            if retryable == Some(false) {
                exhausted.push(local_id);
            }
        }

        tx.commit().await?;

        for local_id in &exhausted {
            warn!(
                local_id,
                max_attempts,
                reason = %reason,
                "Retry budget exhausted, entry needs operator attention"
            );
        }
        Ok(exhausted)
    }

    /// Put a terminally failed entry back into delivery with a fresh budget.
    pub async fn requeue(&self, local_id: i64) -> DbResult<()> {
        let _writer = self.write_lock.lock().await;
        let result = sqlx::query(
            r#"
            UPDATE sync_queue SET
                status = 'pending', attempts = 0, retryable = 1, rejected = 0, updated_at = ?2
            WHERE local_id = ?1 AND status = 'failed'
            "#,
        )
        .bind(local_id)
        .bind(clock::to_millis(clock::now()))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found("failed sync queue entry", local_id.to_string()));
        }
        Ok(())
    }

    /// Entries the engine will still deliver.
    pub async fn pending_count(&self) -> DbResult<i64> {
        let count: i64 =
            sqlx::query_scalar(&format!("SELECT COUNT(*) FROM sync_queue WHERE {DELIVERABLE}"))
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    /// Whether the entity has local changes not yet acknowledged.
    pub async fn has_pending_for(&self, kind: EntityKind, entity_id: &str) -> DbResult<bool> {
        let mut conn = self.pool.acquire().await?;
        pending_for(&mut conn, kind, entity_id, None).await
    }

    /// Terminal failures awaiting operator attention.
    pub async fn failed_entries(&self) -> DbResult<Vec<SyncQueueEntry>> {
        let rows = sqlx::query_as::<_, QueueRow>(&format!(
            "SELECT {COLUMNS} FROM sync_queue \
             WHERE status = 'failed' AND retryable = 0 ORDER BY local_id ASC"
        ))
        .fetch_all(&self.pool)
        .await?;

        into_entries(rows)
    }

    /// Delete acknowledged entries older than `retention`.
    ///
    /// Returns the number of deleted entries.
    pub async fn purge_acknowledged(&self, retention: Duration) -> DbResult<u64> {
        let _writer = self.write_lock.lock().await;
        let cutoff = clock::to_millis(clock::now() - retention);

        let result = sqlx::query(
            "DELETE FROM sync_queue WHERE status = 'acknowledged' AND acknowledged_at < ?1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Database, DbConfig};
    use tally_core::mutation::MenuItemPatch;
    use tally_core::MenuItem;

    async fn setup() -> Database {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        db.device().initialize("dev-a", "acct").await.unwrap();
        db
    }

    fn price_change(id: &str, price: i64) -> Mutation {
        Mutation::update_menu_item(
            id,
            &MenuItemPatch {
                price: Some(price),
                ..Default::default()
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_enqueue_assigns_monotonic_ids_in_fifo_order() {
        let db = setup().await;
        let queue = db.sync_queue();

        let item = MenuItem::new("Tea", 9000);
        let first = queue
            .enqueue("dev-a", &Mutation::create_menu_item(&item).unwrap())
            .await
            .unwrap();
        let second = queue.enqueue("dev-a", &price_change(&item.id, 9500)).await.unwrap();
        assert!(second.local_id > first.local_id);

        let batch = queue.next_batch(10).await.unwrap();
        let ids: Vec<i64> = batch.iter().map(|e| e.local_id).collect();
        assert_eq!(ids, vec![first.local_id, second.local_id]);
        assert_eq!(batch[0].status, QueueStatus::Pending);
        assert_eq!(batch[1].payload["price"], 9500);
    }

    #[tokio::test]
    async fn test_acknowledged_entries_leave_the_batch() {
        let db = setup().await;
        let queue = db.sync_queue();
        let a = queue.enqueue("dev-a", &price_change("m1", 1)).await.unwrap();
        let b = queue.enqueue("dev-a", &price_change("m1", 2)).await.unwrap();

        queue.mark_sent(&[a.local_id, b.local_id]).await.unwrap();
        queue.mark_acknowledged(a.local_id).await.unwrap();

        let batch = queue.next_batch(10).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].local_id, b.local_id);
        // Sent but unacknowledged entries are redelivered.
        assert_eq!(batch[0].status, QueueStatus::Sent);

        let acked = queue.get(a.local_id).await.unwrap().unwrap();
        assert_eq!(acked.status, QueueStatus::Acknowledged);
        assert!(acked.acknowledged_at.is_some());
    }

    #[tokio::test]
    async fn test_terminal_failure_is_excluded_but_visible() {
        let db = setup().await;
        let queue = db.sync_queue();
        let a = queue.enqueue("dev-a", &price_change("m1", 1)).await.unwrap();

        queue.mark_failed(a.local_id, "unknown entity", false).await.unwrap();

        assert!(queue.next_batch(10).await.unwrap().is_empty());
        assert_eq!(queue.pending_count().await.unwrap(), 0);
        let failed = queue.failed_entries().await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].last_error.as_deref(), Some("unknown entity"));

        queue.requeue(a.local_id).await.unwrap();
        assert_eq!(queue.next_batch(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_retry_budget_exhaustion() {
        let db = setup().await;
        let queue = db.sync_queue();
        let a = queue.enqueue("dev-a", &price_change("m1", 1)).await.unwrap();

        let exhausted = queue.record_attempt_failure(&[a.local_id], "timeout", 2).await.unwrap();
        assert!(exhausted.is_empty());
        assert_eq!(queue.next_batch(10).await.unwrap().len(), 1);

        let exhausted = queue.record_attempt_failure(&[a.local_id], "timeout", 2).await.unwrap();
        assert_eq!(exhausted, vec![a.local_id]);
        assert!(queue.next_batch(10).await.unwrap().is_empty());

        let entry = queue.get(a.local_id).await.unwrap().unwrap();
        assert_eq!(entry.attempts, 2);
        assert!(!entry.retryable);
    }

    #[tokio::test]
    async fn test_exhausted_create_holds_back_its_updates() {
        let db = setup().await;
        let queue = db.sync_queue();
        let item = MenuItem::new("Tea", 9000);
        let create = queue
            .enqueue("dev-a", &Mutation::create_menu_item(&item).unwrap())
            .await
            .unwrap();
        let update = queue.enqueue("dev-a", &price_change(&item.id, 9500)).await.unwrap();
        let other = queue.enqueue("dev-a", &price_change("m-other", 10)).await.unwrap();

        let exhausted = queue
            .record_attempt_failure(&[create.local_id], "timeout", 1)
            .await
            .unwrap();
        assert_eq!(exhausted, vec![create.local_id]);

        let ids: Vec<i64> = queue
            .next_batch(10)
            .await
            .unwrap()
            .iter()
            .map(|e| e.local_id)
            .collect();
        assert_eq!(ids, vec![other.local_id]);
        // Held back, not dropped.
        assert_eq!(queue.pending_count().await.unwrap(), 2);
        assert!(queue.has_pending_for(EntityKind::MenuItem, &item.id).await.unwrap());

        queue.requeue(create.local_id).await.unwrap();
        let ids: Vec<i64> = queue
            .next_batch(10)
            .await
            .unwrap()
            .iter()
            .map(|e| e.local_id)
            .collect();
        assert_eq!(ids, vec![create.local_id, update.local_id, other.local_id]);
    }

    #[tokio::test]
    async fn test_rejected_entry_does_not_hold_back_later_edits() {
        let db = setup().await;
        let queue = db.sync_queue();
        let bad = queue.enqueue("dev-a", &price_change("m1", 5)).await.unwrap();
        let good = queue.enqueue("dev-a", &price_change("m1", 500)).await.unwrap();

        queue.mark_failed(bad.local_id, "price out of range", false).await.unwrap();

        let batch = queue.next_batch(10).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].local_id, good.local_id);
    }

    #[tokio::test]
    async fn test_pending_for_entity() {
        let db = setup().await;
        let queue = db.sync_queue();
        let a = queue.enqueue("dev-a", &price_change("m1", 1)).await.unwrap();

        assert!(queue.has_pending_for(EntityKind::MenuItem, "m1").await.unwrap());
        assert!(!queue.has_pending_for(EntityKind::MenuItem, "m2").await.unwrap());

        queue.mark_acknowledged(a.local_id).await.unwrap();
        assert!(!queue.has_pending_for(EntityKind::MenuItem, "m1").await.unwrap());
    }

    #[tokio::test]
    async fn test_purge_only_removes_old_acknowledged() {
        let db = setup().await;
        let queue = db.sync_queue();
        let a = queue.enqueue("dev-a", &price_change("m1", 1)).await.unwrap();
        let b = queue.enqueue("dev-a", &price_change("m1", 2)).await.unwrap();
        queue.mark_acknowledged(a.local_id).await.unwrap();

        // Zero retention: everything acknowledged before "now" goes.
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let purged = queue.purge_acknowledged(Duration::zero()).await.unwrap();
        assert_eq!(purged, 1);
        assert!(queue.get(a.local_id).await.unwrap().is_none());
        assert!(queue.get(b.local_id).await.unwrap().is_some());

        // local_id is never reused after a purge.
        let c = queue.enqueue("dev-a", &price_change("m1", 3)).await.unwrap();
        assert!(c.local_id > b.local_id);
    }
}
