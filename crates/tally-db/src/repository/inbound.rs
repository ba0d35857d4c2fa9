//! # Inbound Repository
//!
//! Writes that originate at the central store: pulled changes and conflict
//! resolutions returned by a push.
//!
//! ## Pull Page Application
//! ```text
//! changes (ascending seq)          device store (one transaction)
//! ─────────────────────────        ─────────────────────────────────────
//! seq <= watermark            ──►  skipped (already applied)
//! ledger event / snapshot     ──►  INSERT OR IGNORE
//! entity, local entry queued  ──►  skipped and remembered; pushes report
//!                                  a watermark below it until our own
//!                                  change comes back with the merged state
//! entity, nothing queued      ──►  UPSERT full payload, server_seq = seq
//! ─────────────────────────        ─────────────────────────────────────
//!                                  watermark = max(watermark, last seq)
//! ```

use std::sync::Arc;

use serde_json::Value;
use sqlx::SqlitePool;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::DbResult;
use crate::repository::{device, entity, ledger, queue};
use tally_core::protocol::Change;
use tally_core::validation::{parse_entity, Entity};
use tally_core::EntityKind;

/// Summary of one applied pull page.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AppliedChanges {
    pub applied: usize,
    pub skipped: usize,
    /// Watermark after the page.
    pub watermark: i64,
}

/// Sync-engine writes.
#[derive(Debug, Clone)]
pub struct InboundRepository {
    pool: SqlitePool,
    write_lock: Arc<Mutex<()>>,
}

impl InboundRepository {
    pub fn new(pool: SqlitePool, write_lock: Arc<Mutex<()>>) -> Self {
        InboundRepository { pool, write_lock }
    }

    /// Apply one page of the central change feed and advance the watermark,
    /// atomically.
    ///
    /// Payloads are validated before they are stored; a change that does not
    /// parse fails the whole page so the watermark never moves past it.
    pub async fn apply_changes(&self, changes: &[Change]) -> DbResult<AppliedChanges> {
        let _writer = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let state = device::load(&mut tx).await?;
        let mut report = AppliedChanges {
            watermark: state.watermark,
            ..Default::default()
        };

        let mut ordered: Vec<&Change> = changes.iter().collect();
        ordered.sort_by_key(|c| c.seq);

        for change in ordered {
            if change.seq <= report.watermark {
                report.skipped += 1;
                continue;
            }
            report.watermark = change.seq;

            let kind = change.entity_kind;
            let id = change.entity_id.as_str();

            if kind.is_ledger_record() {
                let inserted = match parse_entity(kind, id, &change.payload, None)? {
                    Entity::InventoryEvent(event) => ledger::insert_event(&mut tx, &event).await?,
                    Entity::InventorySnapshot(snapshot) => {
                        ledger::insert_snapshot(&mut tx, &snapshot).await?
                    }
                    _ => false,
                };
                if inserted {
                    report.applied += 1;
                } else {
                    report.skipped += 1;
                }
                continue;
            }

            if queue::pending_for(&mut tx, kind, id, None).await? {
                debug!(
                    seq = change.seq,
                    entity_kind = %kind,
                    entity_id = %id,
                    "Local changes queued, keeping local state"
                );
                device::record_skipped(&mut tx, kind, id, change.seq).await?;
                report.skipped += 1;
                continue;
            }

            parse_entity(kind, id, &change.payload, None)?;
            entity::store(&mut tx, kind, id, &change.payload, Some(change.seq)).await?;
            report.applied += 1;
        }

        device::advance_watermark(&mut tx, report.watermark).await?;
        tx.commit().await?;

        if report.applied > 0 {
            info!(
                applied = report.applied,
                skipped = report.skipped,
                watermark = report.watermark,
                "Applied pulled changes"
            );
        }
        Ok(report)
    }

    /// Store the state central resolved for a conflicting entry and
    /// acknowledge the entry.
    ///
    /// The resolved payload is only written when no later local mutation of
    /// the same entity is still queued; otherwise that mutation is pushed
    /// next and the merged state is pulled back afterwards. Returns whether
    /// the payload was written.
    pub async fn apply_resolution(
        &self,
        local_id: i64,
        kind: EntityKind,
        entity_id: &str,
        resolved: &Value,
        server_seq: i64,
    ) -> DbResult<bool> {
        let _writer = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let write = !kind.is_ledger_record()
            && !queue::pending_for(&mut tx, kind, entity_id, Some(local_id)).await?;

        if write {
            parse_entity(kind, entity_id, resolved, None)?;
            entity::store(&mut tx, kind, entity_id, resolved, Some(server_seq)).await?;
        }
        queue::acknowledge(&mut tx, local_id).await?;

        tx.commit().await?;
        Ok(write)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Database, DbConfig};
    use chrono::Utc;
    use serde_json::json;
    use tally_core::mutation::MenuItemPatch;
    use tally_core::{MenuItem, Operation, QueueStatus};

    async fn setup() -> Database {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        db.device().initialize("dev-a", "acct").await.unwrap();
        db
    }

    fn change(seq: i64, item: &MenuItem) -> Change {
        Change {
            seq,
            entity_kind: EntityKind::MenuItem,
            entity_id: item.id.clone(),
            operation: Operation::Update,
            payload: serde_json::to_value(item).unwrap(),
            origin_device_id: "dev-b".to_string(),
            recorded_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_apply_changes_upserts_and_advances_watermark() {
        let db = setup().await;
        let item = MenuItem::new("Mocha", 16000);

        let report = db.inbound().apply_changes(&[change(5, &item)]).await.unwrap();
        assert_eq!(report.applied, 1);
        assert_eq!(report.watermark, 5);
        assert_eq!(db.device().watermark().await.unwrap(), 5);

        let stored = db.entities().menu_item(&item.id).await.unwrap().unwrap();
        assert_eq!(stored.price, 16000);

        // Replaying the same page is a no-op.
        let again = db.inbound().apply_changes(&[change(5, &item)]).await.unwrap();
        assert_eq!(again.applied, 0);
        assert_eq!(again.skipped, 1);
    }

    #[tokio::test]
    async fn test_pull_keeps_entities_with_queued_changes() {
        let db = setup().await;
        let mut item = db
            .mutations()
            .create_menu_item(MenuItem::new("Mocha", 16000))
            .await
            .unwrap();

        item.price = 99;
        let report = db.inbound().apply_changes(&[change(3, &item)]).await.unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(report.watermark, 3);

        let stored = db.entities().menu_item(&item.id).await.unwrap().unwrap();
        assert_eq!(stored.price, 16000);
        // The skipped change still counts as unseen when pushing.
        assert_eq!(db.device().conflict_watermark().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_invalid_change_fails_the_page() {
        let db = setup().await;
        let bad = Change {
            seq: 1,
            entity_kind: EntityKind::MenuItem,
            entity_id: "m1".to_string(),
            operation: Operation::Create,
            payload: json!({"id": "m1", "stock": 3}),
            origin_device_id: "dev-b".to_string(),
            recorded_at: Utc::now(),
        };
        assert!(db.inbound().apply_changes(&[bad]).await.is_err());
        assert_eq!(db.device().watermark().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_resolution_applies_and_acknowledges() {
        let db = setup().await;
        let writes = db.mutations();
        let item = writes.create_menu_item(MenuItem::new("Mocha", 16000)).await.unwrap();
        let patch = MenuItemPatch {
            price: Some(15000),
            ..Default::default()
        };
        writes.update_menu_item(&item.id, &patch).await.unwrap();

        let batch = db.sync_queue().next_batch(10).await.unwrap();
        db.sync_queue().mark_acknowledged(batch[0].local_id).await.unwrap();

        let mut resolved = item.clone();
        resolved.price = 18000;
        let written = db
            .inbound()
            .apply_resolution(
                batch[1].local_id,
                EntityKind::MenuItem,
                &item.id,
                &serde_json::to_value(&resolved).unwrap(),
                9,
            )
            .await
            .unwrap();
        assert!(written);

        let stored = db.entities().menu_item(&item.id).await.unwrap().unwrap();
        assert_eq!(stored.price, 18000);
        let entry = db.sync_queue().get(batch[1].local_id).await.unwrap().unwrap();
        assert_eq!(entry.status, QueueStatus::Acknowledged);
    }

    #[tokio::test]
    async fn test_resolution_defers_to_later_local_change() {
        let db = setup().await;
        let writes = db.mutations();
        let item = writes.create_menu_item(MenuItem::new("Mocha", 16000)).await.unwrap();
        let first = db.sync_queue().next_batch(1).await.unwrap().remove(0);

        let patch = MenuItemPatch {
            name: Some("Mocha Grande".to_string()),
            ..Default::default()
        };
        writes.update_menu_item(&item.id, &patch).await.unwrap();

        let written = db
            .inbound()
            .apply_resolution(
                first.local_id,
                EntityKind::MenuItem,
                &item.id,
                &serde_json::to_value(&item).unwrap(),
                4,
            )
            .await
            .unwrap();
        assert!(!written);

        let stored = db.entities().menu_item(&item.id).await.unwrap().unwrap();
        assert_eq!(stored.name, "Mocha Grande");
        assert_eq!(db.sync_queue().pending_count().await.unwrap(), 1);
    }
}
