//! # Central Sync Store
//!
//! Applies pushed mutations and serves the change feed.
//!
//! ## Push
//! ```text
//! PushRequest (one device, ordered entries)
//!   │
//!   ├─ batch larger than max_batch_size        → 400
//!   ├─ deviceId != authenticated device        → 403
//!   │
//!   └─ per entry, one transaction, in order:
//!        seen (device_id, local_id) before?    → duplicate (or stored rejection)
//!        ledger record?                        → append, ledger rules, applied
//!        entity changed by another device
//!          after the pusher's watermark?       → resolve, conflict log, conflict
//!        otherwise                             → apply patch, applied
//!        invalid payload / unknown entity      → rejected (logged, terminal)
//! ```
//!
//! The writer lock is taken per entry, so batches from different devices
//! interleave, while two entries touching the same entity are still applied
//! one after the other and the second one sees the first one's change. A
//! re-delivery racing its original through another process hits the
//! UNIQUE (device_id, local_id) index and is answered `duplicate`.

use std::time::Instant;

use sqlx::SqliteConnection;
use tracing::{debug, info, warn};
use uuid::Uuid;

use tally_core::conflict::{self, Contender};
use tally_core::mutation::apply_patch;
use tally_core::protocol::{
    EntryOutcome, EntryResult, PullRequest, PullResponse, PushEntry, PushRequest, PushResponse,
};
use tally_core::validation::{parse_entity, Entity};
use tally_core::{
    clock, ConflictLog, CoreError, Device, EntityKind, InventoryEvent, InventorySnapshot,
    MutationRef, Operation, SnapshotSource, SyncDirection,
};

use crate::auth::Principal;
use crate::config::CentralConfig;
use crate::db::Database;
use crate::error::{CentralError, CentralResult};
use crate::ledger::{self, StockReport};
use crate::store::{self, Verdict};

/// Push/pull processing over the central database.
#[derive(Debug, Clone)]
pub struct CentralStore {
    db: Database,
    max_batch_size: usize,
    max_pull_limit: u32,
    compaction_threshold: usize,
}

impl CentralStore {
    pub fn new(db: Database, config: &CentralConfig) -> Self {
        CentralStore {
            db,
            max_batch_size: config.max_batch_size,
            max_pull_limit: config.max_pull_limit,
            compaction_threshold: config.compaction_threshold,
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// The registered, active device a request speaks for.
    async fn acting_device(&self, principal: &Principal, device_id: &str) -> CentralResult<Device> {
        if device_id != principal.device_id {
            return Err(CentralError::Forbidden(format!(
                "token is for device {}, request names {device_id}",
                principal.device_id
            )));
        }

        let device = self
            .db
            .device(device_id)
            .await?
            .ok_or_else(|| CentralError::AuthFailed(format!("unknown device {device_id}")))?;

        if device.account_id != principal.account_id {
            return Err(CentralError::Forbidden(format!(
                "device {device_id} belongs to another account"
            )));
        }
        if !device.is_active {
            return Err(CentralError::Forbidden(format!("device {device_id} is retired")));
        }
        Ok(device)
    }

    // =========================================================================
    // Push
    // =========================================================================

    /// Apply a batch of mutations from one device.
    ///
    /// Returns one result per entry, in request order. Invalid entries are
    /// `rejected` results, not request errors.
    pub async fn push(
        &self,
        principal: &Principal,
        request: &PushRequest,
    ) -> CentralResult<PushResponse> {
        if request.entries.len() > self.max_batch_size {
            return Err(CentralError::InvalidRequest(format!(
                "batch of {} entries exceeds the limit of {}",
                request.entries.len(),
                self.max_batch_size
            )));
        }
        let device = self.acting_device(principal, &request.device_id).await?;

        let started = Instant::now();
        // The device reports what it has seen; a pull watermark alone may
        // cover changes it skipped while its own edits were queued.
        let watermark = request.last_seen_seq;
        self.db.observe_seq(&device.device_id, request.last_seen_seq).await?;

        let result = self.apply_batch(&device, watermark, &request.entries).await;
        let duration_ms = started.elapsed().as_millis() as i64;

        match &result {
            Ok(results) => {
                self.db
                    .record_sync_log(
                        &device.device_id,
                        SyncDirection::Push,
                        true,
                        results.len() as i64,
                        duration_ms,
                        None,
                    )
                    .await?;
                debug!(
                    device_id = %device.device_id,
                    entries = results.len(),
                    duration_ms,
                    "Push processed"
                );
            }
            Err(e) => {
                self.db
                    .record_sync_log(
                        &device.device_id,
                        SyncDirection::Push,
                        false,
                        0,
                        duration_ms,
                        Some(&e.to_string()),
                    )
                    .await?;
            }
        }

        Ok(PushResponse { results: result? })
    }

    async fn apply_batch(
        &self,
        device: &Device,
        watermark: i64,
        entries: &[PushEntry],
    ) -> CentralResult<Vec<EntryResult>> {
        let mut results = Vec::with_capacity(entries.len());

        for entry in entries {
            let _writer = self.db.lock_writer().await;
            let mut tx = self.db.pool().begin().await?;
            let outcome = match self.apply_entry(&mut tx, device, watermark, entry).await {
                Ok(outcome) => {
                    tx.commit().await?;
                    outcome
                }
                Err(CentralError::Duplicate(_)) => {
                    tx.rollback().await?;
                    EntryOutcome::Duplicate
                }
                Err(err) if err.is_entry_rejection() => {
                    tx.rollback().await?;
                    let reason = err.to_string();
                    warn!(
                        device_id = %device.device_id,
                        local_id = entry.local_id,
                        entity_kind = %entry.entity_kind,
                        entity_id = %entry.entity_id,
                        reason = %reason,
                        "Push entry rejected"
                    );
                    let mut conn = self.db.pool().acquire().await?;
                    store::log_mutation(
                        &mut conn,
                        &device.account_id,
                        &device.device_id,
                        entry,
                        Verdict::Rejected,
                        Some(&reason),
                        None,
                    )
                    .await?;
                    EntryOutcome::Rejected { reason }
                }
                Err(err) => return Err(err),
            };

            results.push(EntryResult {
                local_id: entry.local_id,
                outcome,
            });
        }

        Ok(results)
    }

    async fn apply_entry(
        &self,
        conn: &mut SqliteConnection,
        device: &Device,
        watermark: i64,
        entry: &PushEntry,
    ) -> CentralResult<EntryOutcome> {
        match store::find_mutation(conn, &device.device_id, entry.local_id).await? {
            Some((Verdict::Rejected, reason)) => {
                return Ok(EntryOutcome::Rejected {
                    reason: reason.unwrap_or_else(|| "rejected".to_string()),
                })
            }
            Some(_) => {
                debug!(
                    device_id = %device.device_id,
                    local_id = entry.local_id,
                    "Duplicate push entry"
                );
                return Ok(EntryOutcome::Duplicate);
            }
            None => {}
        }

        if entry.entity_kind.is_ledger_record() {
            self.apply_ledger_record(conn, device, entry).await
        } else {
            self.apply_entity(conn, device, watermark, entry).await
        }
    }

    /// Mutable entity: apply as sent, or resolve against the other devices'
    /// unseen mutations.
    async fn apply_entity(
        &self,
        conn: &mut SqliteConnection,
        device: &Device,
        watermark: i64,
        entry: &PushEntry,
    ) -> CentralResult<EntryOutcome> {
        let account_id = device.account_id.as_str();
        let kind = entry.entity_kind;
        let id = entry.entity_id.as_str();

        let current = store::load_entity(conn, account_id, kind, id).await?;
        let rivals =
            store::unseen_mutations(conn, account_id, kind, id, &device.device_id, watermark)
                .await?;

        if rivals.is_empty() {
            let state = apply_patch(kind, id, current.as_ref(), entry.operation, &entry.payload)?;
            parse_entity(kind, id, &state, current.as_ref())?;

            let seq = store::append_change(
                conn,
                account_id,
                kind,
                id,
                entry.operation,
                &state,
                &device.device_id,
            )
            .await?;
            store::store_entity(conn, account_id, kind, id, &state, seq).await?;
            store::log_mutation(
                conn,
                account_id,
                &device.device_id,
                entry,
                Verdict::Applied,
                None,
                Some(seq),
            )
            .await?;
            return Ok(EntryOutcome::Applied { server_seq: seq });
        }

        let earlier: Vec<Contender> = rivals
            .into_iter()
            .map(|rival| Contender {
                mutation: rival.mutation,
                operation: rival.operation,
                payload: rival.payload,
                client_timestamp: rival.client_timestamp,
            })
            .collect();
        let incoming = Contender {
            mutation: MutationRef {
                device_id: device.device_id.clone(),
                local_id: entry.local_id,
            },
            operation: entry.operation,
            payload: entry.payload.clone(),
            client_timestamp: entry.client_timestamp,
        };
        let resolution = conflict::resolve(kind, &earlier, &incoming)?;

        let merge_as = if current.is_some() {
            Operation::Update
        } else {
            entry.operation
        };
        let state = apply_patch(kind, id, current.as_ref(), merge_as, &resolution.payload)?;
        parse_entity(kind, id, &state, current.as_ref())?;

        let seq = store::append_change(
            conn,
            account_id,
            kind,
            id,
            entry.operation,
            &state,
            &device.device_id,
        )
        .await?;
        store::store_entity(conn, account_id, kind, id, &state, seq).await?;

        for contest in &resolution.contests {
            store::insert_conflict_log(
                conn,
                &ConflictLog {
                    id: Uuid::new_v4().to_string(),
                    account_id: account_id.to_string(),
                    entity_kind: kind,
                    entity_id: id.to_string(),
                    winner: contest.winner.clone(),
                    superseded: contest.superseded.clone(),
                    strategy: resolution.strategy,
                    resolved_payload: state.clone(),
                    created_at: clock::now(),
                },
            )
            .await?;
        }
        store::log_mutation(
            conn,
            account_id,
            &device.device_id,
            entry,
            Verdict::Conflict,
            None,
            Some(seq),
        )
        .await?;

        info!(
            entity_kind = %kind,
            entity_id = %id,
            strategy = %resolution.strategy.as_str(),
            competitors = resolution.contests.len(),
            server_seq = seq,
            "Conflict resolved"
        );

        Ok(EntryOutcome::Conflict {
            server_seq: seq,
            strategy: resolution.strategy,
            resolved: state,
        })
    }

    /// Ledger record: appended, never merged.
    async fn apply_ledger_record(
        &self,
        conn: &mut SqliteConnection,
        device: &Device,
        entry: &PushEntry,
    ) -> CentralResult<EntryOutcome> {
        let kind = entry.entity_kind;
        if entry.operation != Operation::Create {
            return Err(CoreError::AppendOnly {
                kind: kind.to_string(),
            }
            .into());
        }

        match parse_entity(kind, &entry.entity_id, &entry.payload, None)? {
            Entity::InventoryEvent(event) => self.ingest_event(conn, device, entry, event).await,
            Entity::InventorySnapshot(snapshot) => {
                self.ingest_snapshot(conn, device, entry, snapshot).await
            }
            _ => Err(CentralError::Internal(format!("{kind} is not a ledger record"))),
        }
    }

    async fn ingest_event(
        &self,
        conn: &mut SqliteConnection,
        device: &Device,
        entry: &PushEntry,
        event: InventoryEvent,
    ) -> CentralResult<EntryOutcome> {
        let account_id = device.account_id.as_str();
        let item = ledger::load_item(conn, account_id, &event.item_id)
            .await?
            .ok_or_else(|| CoreError::UnknownEntity {
                kind: EntityKind::InventoryItem.to_string(),
                id: event.item_id.clone(),
            })?;
        tally_core::ledger::check_unit(&item, &event.unit)?;

        if !ledger::insert_event(conn, account_id, &event).await? {
            store::log_mutation(
                conn,
                account_id,
                &device.device_id,
                entry,
                Verdict::Applied,
                None,
                None,
            )
            .await?;
            return Ok(EntryOutcome::Duplicate);
        }

        let seq = store::append_change(
            conn,
            account_id,
            EntityKind::InventoryEvent,
            &event.id,
            Operation::Create,
            &entry.payload,
            &device.device_id,
        )
        .await?;
        store::log_mutation(
            conn,
            account_id,
            &device.device_id,
            entry,
            Verdict::Applied,
            None,
            Some(seq),
        )
        .await?;

        ledger::after_event(conn, account_id, &item, &event, self.compaction_threshold).await?;
        Ok(EntryOutcome::Applied { server_seq: seq })
    }

    async fn ingest_snapshot(
        &self,
        conn: &mut SqliteConnection,
        device: &Device,
        entry: &PushEntry,
        snapshot: InventorySnapshot,
    ) -> CentralResult<EntryOutcome> {
        if snapshot.source == SnapshotSource::Compaction {
            return Err(CentralError::InvalidRequest(
                "compaction snapshots are only written centrally".to_string(),
            ));
        }

        let account_id = device.account_id.as_str();
        let item = ledger::load_item(conn, account_id, &snapshot.item_id)
            .await?
            .ok_or_else(|| CoreError::UnknownEntity {
                kind: EntityKind::InventoryItem.to_string(),
                id: snapshot.item_id.clone(),
            })?;
        tally_core::ledger::check_unit(&item, &snapshot.unit)?;

        if !ledger::insert_snapshot(conn, account_id, &snapshot).await? {
            store::log_mutation(
                conn,
                account_id,
                &device.device_id,
                entry,
                Verdict::Applied,
                None,
                None,
            )
            .await?;
            return Ok(EntryOutcome::Duplicate);
        }

        let seq = store::append_change(
            conn,
            account_id,
            EntityKind::InventorySnapshot,
            &snapshot.id,
            Operation::Create,
            &entry.payload,
            &device.device_id,
        )
        .await?;
        store::log_mutation(
            conn,
            account_id,
            &device.device_id,
            entry,
            Verdict::Applied,
            None,
            Some(seq),
        )
        .await?;

        ledger::after_snapshot(conn, account_id, &item, &snapshot).await?;
        Ok(EntryOutcome::Applied { server_seq: seq })
    }

    // =========================================================================
    // Pull
    // =========================================================================

    /// One page of the account's change feed after `since`.
    pub async fn pull(
        &self,
        principal: &Principal,
        request: &PullRequest,
    ) -> CentralResult<PullResponse> {
        let device = self.acting_device(principal, &request.device_id).await?;
        let started = Instant::now();

        let limit = request.limit.clamp(1, self.max_pull_limit);
        let (changes, has_more) =
            store::changes_since(self.db.pool(), &device.account_id, request.since, limit).await?;
        let latest_seq = store::latest_seq(self.db.pool(), &device.account_id).await?;

        // The device has everything up to `since`.
        self.db.observe_seq(&device.device_id, request.since).await?;
        self.db
            .record_sync_log(
                &device.device_id,
                SyncDirection::Pull,
                true,
                changes.len() as i64,
                started.elapsed().as_millis() as i64,
                None,
            )
            .await?;

        Ok(PullResponse {
            changes,
            latest_seq,
            has_more,
        })
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Current state of a mutable entity.
    pub async fn entity(
        &self,
        account_id: &str,
        kind: EntityKind,
        id: &str,
    ) -> CentralResult<Option<serde_json::Value>> {
        let mut conn = self.db.pool().acquire().await?;
        store::load_entity(&mut conn, account_id, kind, id).await
    }

    pub async fn conflict_logs(
        &self,
        account_id: &str,
        kind: EntityKind,
        id: &str,
    ) -> CentralResult<Vec<ConflictLog>> {
        store::conflict_logs_for(self.db.pool(), account_id, kind, id).await
    }

    pub async fn stock(&self, account_id: &str, item_id: &str) -> CentralResult<StockReport> {
        let mut conn = self.db.pool().acquire().await?;
        ledger::stock_report(&mut conn, account_id, item_id).await
    }

    /// Fold an item's events into a new compaction snapshot.
    ///
    /// Returns `None` when there was nothing to fold.
    pub async fn compact(
        &self,
        account_id: &str,
        item_id: &str,
        actor: &str,
    ) -> CentralResult<Option<InventorySnapshot>> {
        let _writer = self.db.lock_writer().await;
        let mut tx = self.db.pool().begin().await?;
        let snapshot = ledger::compact_item(&mut tx, account_id, item_id, actor).await?;
        tx.commit().await?;
        Ok(snapshot)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use serde_json::json;
    use tally_core::mutation::MenuItemPatch;
    use tally_core::{InventoryItem, MenuItem, Mutation, ResolutionStrategy, StockAction};

    struct Fixture {
        store: CentralStore,
        a: Principal,
        b: Principal,
    }

    async fn setup_with(config: CentralConfig) -> Fixture {
        let db = Database::in_memory().await.unwrap();
        db.create_account("acct", "Corner Cafe").await.unwrap();
        db.register_device("acct", "dev-a", "Front till").await.unwrap();
        db.register_device("acct", "dev-b", "Back till").await.unwrap();
        Fixture {
            store: CentralStore::new(db, &config),
            a: Principal {
                account_id: "acct".to_string(),
                device_id: "dev-a".to_string(),
            },
            b: Principal {
                account_id: "acct".to_string(),
                device_id: "dev-b".to_string(),
            },
        }
    }

    async fn setup() -> Fixture {
        setup_with(CentralConfig::default()).await
    }

    fn entry(local_id: i64, mutation: Mutation) -> PushEntry {
        PushEntry {
            local_id,
            entity_kind: mutation.entity_kind,
            entity_id: mutation.entity_id,
            operation: mutation.operation,
            payload: mutation.payload,
            client_timestamp: mutation.client_timestamp,
        }
    }

    fn request(who: &Principal, last_seen_seq: i64, entries: Vec<PushEntry>) -> PushRequest {
        PushRequest {
            device_id: who.device_id.clone(),
            last_seen_seq,
            entries,
        }
    }

    fn price_patch(id: &str, price: i64, at: chrono::DateTime<Utc>) -> Mutation {
        let patch = MenuItemPatch {
            price: Some(price),
            ..Default::default()
        };
        Mutation::patch(EntityKind::MenuItem, id, &patch, at).unwrap()
    }

    fn event(item: &InventoryItem, device: &str, delta: i64, sequence: i64) -> InventoryEvent {
        InventoryEvent {
            id: Uuid::new_v4().to_string(),
            item_id: item.id.clone(),
            action: if delta < 0 {
                StockAction::Sale
            } else {
                StockAction::Restock
            },
            delta,
            unit: item.unit.clone(),
            device_id: device.to_string(),
            actor: "staff".to_string(),
            occurred_at: clock::now(),
            sequence,
            reference: None,
        }
    }

    async fn seed_item(fx: &Fixture, item: &InventoryItem) -> i64 {
        let create = entry(1, Mutation::create_inventory_item(item).unwrap());
        let response = fx.store.push(&fx.a, &request(&fx.a, 0, vec![create])).await.unwrap();
        match response.results[0].outcome {
            EntryOutcome::Applied { server_seq } => server_seq,
            ref other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_push_applies_and_feeds_changes() {
        let fx = setup().await;
        let item = MenuItem::new("Latte", 12000);
        let create = entry(1, Mutation::create_menu_item(&item).unwrap());

        let response = fx.store.push(&fx.a, &request(&fx.a, 0, vec![create])).await.unwrap();
        assert!(matches!(response.results[0].outcome, EntryOutcome::Applied { .. }));

        let pulled = fx
            .store
            .pull(
                &fx.b,
                &PullRequest {
                    device_id: "dev-b".to_string(),
                    since: 0,
                    limit: 50,
                },
            )
            .await
            .unwrap();
        assert_eq!(pulled.changes.len(), 1);
        assert_eq!(pulled.changes[0].origin_device_id, "dev-a");
        assert_eq!(pulled.changes[0].payload["price"], json!(12000));
        assert_eq!(pulled.latest_seq, pulled.changes[0].seq);
        assert!(!pulled.has_more);

        let logs = fx.store.database().sync_logs_for("dev-a").await.unwrap();
        assert_eq!(logs.len(), 1);
        assert!(logs[0].success);
    }

    #[tokio::test]
    async fn test_repush_is_duplicate() {
        let fx = setup().await;
        let item = MenuItem::new("Latte", 12000);
        let create = entry(1, Mutation::create_menu_item(&item).unwrap());

        fx.store
            .push(&fx.a, &request(&fx.a, 0, vec![create.clone()]))
            .await
            .unwrap();
        let again = fx.store.push(&fx.a, &request(&fx.a, 0, vec![create])).await.unwrap();
        assert_eq!(again.results[0].outcome, EntryOutcome::Duplicate);

        let (changes, _) = store::changes_since(fx.store.database().pool(), "acct", 0, 10)
            .await
            .unwrap();
        assert_eq!(changes.len(), 1);
    }

    #[tokio::test]
    async fn test_rejection_is_stored_and_repeated() {
        let fx = setup().await;
        let bogus = PushEntry {
            local_id: 4,
            entity_kind: EntityKind::MenuItem,
            entity_id: "missing".to_string(),
            operation: Operation::Update,
            payload: json!({"price": 100}),
            client_timestamp: Utc::now(),
        };

        let first = fx
            .store
            .push(&fx.a, &request(&fx.a, 0, vec![bogus.clone()]))
            .await
            .unwrap();
        let EntryOutcome::Rejected { reason } = &first.results[0].outcome else {
            panic!("expected rejection");
        };

        let second = fx.store.push(&fx.a, &request(&fx.a, 0, vec![bogus])).await.unwrap();
        assert_eq!(
            second.results[0].outcome,
            EntryOutcome::Rejected {
                reason: reason.clone()
            }
        );
    }

    #[tokio::test]
    async fn test_one_bad_entry_does_not_block_the_batch() {
        let fx = setup().await;
        let good = MenuItem::new("Scone", 6000);
        let bad = MenuItem::new("", 6000);

        let response = fx
            .store
            .push(
                &fx.a,
                &request(
                    &fx.a,
                    0,
                    vec![
                        entry(1, Mutation::create_menu_item(&bad).unwrap()),
                        entry(2, Mutation::create_menu_item(&good).unwrap()),
                    ],
                ),
            )
            .await
            .unwrap();

        assert!(matches!(response.results[0].outcome, EntryOutcome::Rejected { .. }));
        assert!(matches!(response.results[1].outcome, EntryOutcome::Applied { .. }));
    }

    #[tokio::test]
    async fn test_concurrent_price_edits_resolve_field_wise() {
        let fx = setup().await;
        let item = MenuItem::new("Mocha", 16000);
        let create = entry(1, Mutation::create_menu_item(&item).unwrap());
        fx.store.push(&fx.a, &request(&fx.a, 0, vec![create])).await.unwrap();
        let seen = store::latest_seq(fx.store.database().pool(), "acct").await.unwrap();

        let t0 = Utc::now();
        let from_a = entry(2, price_patch(&item.id, 15000, t0));
        let from_b = entry(1, price_patch(&item.id, 18000, t0 + Duration::seconds(5)));

        fx.store.push(&fx.a, &request(&fx.a, seen, vec![from_a])).await.unwrap();
        let response = fx.store.push(&fx.b, &request(&fx.b, seen, vec![from_b])).await.unwrap();

        let EntryOutcome::Conflict {
            strategy, resolved, ..
        } = &response.results[0].outcome
        else {
            panic!("expected conflict");
        };
        assert_eq!(*strategy, ResolutionStrategy::FieldLastWriterWins);
        assert_eq!(resolved["price"], json!(18000));
        assert_eq!(resolved["name"], json!("Mocha"));

        let state = fx
            .store
            .entity("acct", EntityKind::MenuItem, &item.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state["price"], json!(18000));

        let logs = fx
            .store
            .conflict_logs("acct", EntityKind::MenuItem, &item.id)
            .await
            .unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].superseded.device_id, "dev-a");
        assert_eq!(logs[0].winner.device_id, "dev-b");
    }

    fn name_patch(id: &str, name: &str, at: chrono::DateTime<Utc>) -> Mutation {
        let patch = MenuItemPatch {
            name: Some(name.to_string()),
            ..Default::default()
        };
        Mutation::patch(EntityKind::MenuItem, id, &patch, at).unwrap()
    }

    #[tokio::test]
    async fn test_older_edit_loses_to_every_unseen_newer_edit() {
        let fx = setup().await;
        let item = MenuItem::new("Mocha", 16000);
        let create = entry(1, Mutation::create_menu_item(&item).unwrap());
        fx.store.push(&fx.a, &request(&fx.a, 0, vec![create])).await.unwrap();
        let seen = store::latest_seq(fx.store.database().pool(), "acct").await.unwrap();

        // A edits the price and then the name; B, having seen neither, edits
        // the price with an older clock.
        let t0 = Utc::now();
        let a_price = entry(2, price_patch(&item.id, 20000, t0 + Duration::seconds(20)));
        let a_name = entry(3, name_patch(&item.id, "Mocha Grande", t0 + Duration::seconds(21)));
        fx.store
            .push(&fx.a, &request(&fx.a, seen, vec![a_price, a_name]))
            .await
            .unwrap();

        let b_price = entry(1, price_patch(&item.id, 15000, t0 + Duration::seconds(10)));
        let response = fx.store.push(&fx.b, &request(&fx.b, seen, vec![b_price])).await.unwrap();
        let EntryOutcome::Conflict { resolved, .. } = &response.results[0].outcome else {
            panic!("expected conflict");
        };
        assert_eq!(resolved["price"], json!(20000));
        assert_eq!(resolved["name"], json!("Mocha Grande"));

        let state = fx
            .store
            .entity("acct", EntityKind::MenuItem, &item.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state["price"], json!(20000));

        let logs = fx
            .store
            .conflict_logs("acct", EntityKind::MenuItem, &item.id)
            .await
            .unwrap();
        assert_eq!(logs.len(), 2);
        for log in &logs {
            assert_eq!(log.superseded.device_id, "dev-b");
            assert_eq!(log.winner.device_id, "dev-a");
        }
    }

    #[tokio::test]
    async fn test_three_devices_keep_the_newest_price() {
        let fx = setup().await;
        fx.store
            .database()
            .register_device("acct", "dev-c", "Bar till")
            .await
            .unwrap();
        let c = Principal {
            account_id: "acct".to_string(),
            device_id: "dev-c".to_string(),
        };

        let item = MenuItem::new("Mocha", 16000);
        let create = entry(1, Mutation::create_menu_item(&item).unwrap());
        fx.store.push(&fx.a, &request(&fx.a, 0, vec![create])).await.unwrap();
        let base = store::latest_seq(fx.store.database().pool(), "acct").await.unwrap();

        let t0 = Utc::now();
        let a_price = entry(2, price_patch(&item.id, 20000, t0 + Duration::seconds(20)));
        fx.store.push(&fx.a, &request(&fx.a, base, vec![a_price])).await.unwrap();

        // C saw A's price, then renamed.
        let after_a = store::latest_seq(fx.store.database().pool(), "acct").await.unwrap();
        let c_name = entry(1, name_patch(&item.id, "Mocha Grande", t0 + Duration::seconds(30)));
        fx.store.push(&c, &request(&c, after_a, vec![c_name])).await.unwrap();

        let b_price = entry(1, price_patch(&item.id, 15000, t0 + Duration::seconds(10)));
        fx.store.push(&fx.b, &request(&fx.b, base, vec![b_price])).await.unwrap();

        let state = fx
            .store
            .entity("acct", EntityKind::MenuItem, &item.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state["price"], json!(20000));
        assert_eq!(state["name"], json!("Mocha Grande"));
    }

    #[tokio::test]
    async fn test_reported_watermark_decides_what_was_seen() {
        let fx = setup().await;
        let item = MenuItem::new("Mocha", 16000);
        let create = entry(1, Mutation::create_menu_item(&item).unwrap());
        fx.store.push(&fx.a, &request(&fx.a, 0, vec![create])).await.unwrap();
        let base = store::latest_seq(fx.store.database().pool(), "acct").await.unwrap();

        let t0 = Utc::now();
        let a_price = entry(2, price_patch(&item.id, 20000, t0 + Duration::seconds(20)));
        fx.store.push(&fx.a, &request(&fx.a, base, vec![a_price])).await.unwrap();
        let latest = store::latest_seq(fx.store.database().pool(), "acct").await.unwrap();

        // B pulled past A's change but skipped it, so it reports `base`.
        fx.store
            .pull(
                &fx.b,
                &PullRequest {
                    device_id: "dev-b".to_string(),
                    since: latest,
                    limit: 10,
                },
            )
            .await
            .unwrap();
        let b_price = entry(1, price_patch(&item.id, 15000, t0 + Duration::seconds(10)));
        let response = fx.store.push(&fx.b, &request(&fx.b, base, vec![b_price])).await.unwrap();

        assert!(matches!(response.results[0].outcome, EntryOutcome::Conflict { .. }));
        let state = fx
            .store
            .entity("acct", EntityKind::MenuItem, &item.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state["price"], json!(20000));
    }

    #[tokio::test]
    async fn test_seen_changes_are_not_conflicts() {
        let fx = setup().await;
        let item = MenuItem::new("Mocha", 16000);
        fx.store
            .push(
                &fx.a,
                &request(&fx.a, 0, vec![entry(1, Mutation::create_menu_item(&item).unwrap())]),
            )
            .await
            .unwrap();
        fx.store
            .push(
                &fx.a,
                &request(&fx.a, 0, vec![entry(2, price_patch(&item.id, 15000, Utc::now()))]),
            )
            .await
            .unwrap();

        let seen = store::latest_seq(fx.store.database().pool(), "acct").await.unwrap();
        let response = fx
            .store
            .push(
                &fx.b,
                &request(&fx.b, seen, vec![entry(1, price_patch(&item.id, 17000, Utc::now()))]),
            )
            .await
            .unwrap();
        assert!(matches!(response.results[0].outcome, EntryOutcome::Applied { .. }));
    }

    #[tokio::test]
    async fn test_device_mismatch_and_batch_limit() {
        let fx = setup_with(CentralConfig {
            max_batch_size: 1,
            ..CentralConfig::default()
        })
        .await;

        let err = fx.store.push(&fx.a, &request(&fx.b, 0, vec![])).await.unwrap_err();
        assert!(matches!(err, CentralError::Forbidden(_)));

        let item = MenuItem::new("Tea", 9000);
        let entries = vec![
            entry(1, Mutation::create_menu_item(&item).unwrap()),
            entry(2, price_patch(&item.id, 9500, Utc::now())),
        ];
        let err = fx.store.push(&fx.a, &request(&fx.a, 0, entries)).await.unwrap_err();
        assert!(matches!(err, CentralError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_retired_device_is_refused() {
        let fx = setup().await;
        fx.store.database().retire_device("dev-b").await.unwrap();
        let err = fx.store.push(&fx.b, &request(&fx.b, 0, vec![])).await.unwrap_err();
        assert!(matches!(err, CentralError::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_pull_pages_and_records_watermark() {
        let fx = setup().await;
        let entries = (1..=5)
            .map(|n| {
                let item = MenuItem::new(format!("Item {n}"), 1000 * n);
                entry(n, Mutation::create_menu_item(&item).unwrap())
            })
            .collect();
        fx.store.push(&fx.a, &request(&fx.a, 0, entries)).await.unwrap();

        let first = fx
            .store
            .pull(
                &fx.b,
                &PullRequest {
                    device_id: "dev-b".to_string(),
                    since: 0,
                    limit: 2,
                },
            )
            .await
            .unwrap();
        assert_eq!(first.changes.len(), 2);
        assert!(first.has_more);

        let since = first.changes[1].seq;
        let rest = fx
            .store
            .pull(
                &fx.b,
                &PullRequest {
                    device_id: "dev-b".to_string(),
                    since,
                    limit: 100,
                },
            )
            .await
            .unwrap();
        assert_eq!(rest.changes.len(), 3);
        assert!(!rest.has_more);
        assert!(rest.changes.iter().all(|c| c.seq > since));

        let device = fx.store.database().device("dev-b").await.unwrap().unwrap();
        assert_eq!(device.last_seen_seq, since);
    }

    #[tokio::test]
    async fn test_ledger_event_for_unknown_item_is_rejected() {
        let fx = setup().await;
        let item = InventoryItem::new("Milk", "ml");
        let ev = event(&item, "dev-a", -200, 1);

        let response = fx
            .store
            .push(&fx.a, &request(&fx.a, 0, vec![entry(1, Mutation::record_event(&ev).unwrap())]))
            .await
            .unwrap();
        assert!(matches!(response.results[0].outcome, EntryOutcome::Rejected { .. }));
    }

    #[tokio::test]
    async fn test_ledger_unit_mismatch_is_rejected() {
        let fx = setup().await;
        let item = InventoryItem::new("Milk", "ml");
        seed_item(&fx, &item).await;

        let mut ev = event(&item, "dev-a", -2, 1);
        ev.unit = "l".to_string();
        let response = fx
            .store
            .push(&fx.a, &request(&fx.a, 0, vec![entry(2, Mutation::record_event(&ev).unwrap())]))
            .await
            .unwrap();
        assert!(matches!(response.results[0].outcome, EntryOutcome::Rejected { .. }));
    }

    #[tokio::test]
    async fn test_ledger_events_from_two_devices_both_count() {
        let fx = setup().await;
        let item = InventoryItem::new("Beans", "g");
        seed_item(&fx, &item).await;

        let restock = event(&item, "dev-a", 1000, 1);
        let sale = event(&item, "dev-b", -18, 1);
        fx.store
            .push(&fx.a, &request(&fx.a, 0, vec![entry(2, Mutation::record_event(&restock).unwrap())]))
            .await
            .unwrap();
        let response = fx
            .store
            .push(&fx.b, &request(&fx.b, 0, vec![entry(1, Mutation::record_event(&sale).unwrap())]))
            .await
            .unwrap();
        assert!(matches!(response.results[0].outcome, EntryOutcome::Applied { .. }));

        let report = fx.store.stock("acct", &item.id).await.unwrap();
        assert_eq!(report.level.quantity, 982);
        assert!(report.flagged.is_none());
    }

    #[tokio::test]
    async fn test_device_compaction_snapshot_is_rejected() {
        let fx = setup().await;
        let item = InventoryItem::new("Beans", "g");
        seed_item(&fx, &item).await;

        let mut snapshot = InventorySnapshot::verified_count(&item, 500, "dev-a", "manager");
        snapshot.source = SnapshotSource::Compaction;
        let response = fx
            .store
            .push(
                &fx.a,
                &request(&fx.a, 0, vec![entry(2, Mutation::record_snapshot(&snapshot).unwrap())]),
            )
            .await
            .unwrap();
        assert!(matches!(response.results[0].outcome, EntryOutcome::Rejected { .. }));
    }

    #[tokio::test]
    async fn test_auto_compaction_at_threshold() {
        let fx = setup_with(CentralConfig {
            compaction_threshold: 3,
            ..CentralConfig::default()
        })
        .await;
        let item = InventoryItem::new("Cups", "pcs");
        seed_item(&fx, &item).await;

        let entries = [10, -1, -1]
            .into_iter()
            .zip(1..)
            .map(|(delta, n)| {
                entry(n + 1, Mutation::record_event(&event(&item, "dev-a", delta, n)).unwrap())
            })
            .collect();
        fx.store.push(&fx.a, &request(&fx.a, 0, entries)).await.unwrap();

        let report = fx.store.stock("acct", &item.id).await.unwrap();
        assert_eq!(report.level.quantity, 8);
        assert_eq!(report.level.events_applied, 0);
        assert!(report.level.baseline_snapshot_id.is_some());

        let (changes, _) = store::changes_since(fx.store.database().pool(), "acct", 0, 100)
            .await
            .unwrap();
        let published = changes.last().unwrap();
        assert_eq!(published.entity_kind, EntityKind::InventorySnapshot);
        assert_eq!(published.origin_device_id, ledger::CENTRAL_ACTOR);
    }

    #[tokio::test]
    async fn test_late_event_flags_item_until_verified_count() {
        let fx = setup().await;
        let item = InventoryItem::new("Cups", "pcs");
        seed_item(&fx, &item).await;

        // dev-b's sale happens first but reaches central after compaction.
        let mut late = event(&item, "dev-b", -5, 1);
        late.occurred_at = Utc::now() - Duration::seconds(60);
        let mut restock = event(&item, "dev-a", 100, 1);
        restock.occurred_at = Utc::now() - Duration::seconds(30);

        fx.store
            .push(&fx.a, &request(&fx.a, 0, vec![entry(2, Mutation::record_event(&restock).unwrap())]))
            .await
            .unwrap();
        fx.store.compact("acct", &item.id, "manager").await.unwrap().unwrap();

        fx.store
            .push(&fx.b, &request(&fx.b, 0, vec![entry(1, Mutation::record_event(&late).unwrap())]))
            .await
            .unwrap();

        let report = fx.store.stock("acct", &item.id).await.unwrap();
        assert!(report.flagged.is_some());
        let err = fx.store.compact("acct", &item.id, "manager").await.unwrap_err();
        assert!(matches!(err, CentralError::Integrity(_)));

        let count = InventorySnapshot::verified_count(&item, 95, "dev-a", "manager");
        fx.store
            .push(&fx.a, &request(&fx.a, 0, vec![entry(3, Mutation::record_snapshot(&count).unwrap())]))
            .await
            .unwrap();

        let report = fx.store.stock("acct", &item.id).await.unwrap();
        assert!(report.flagged.is_none());
        assert_eq!(report.level.quantity, 95);
    }

    #[tokio::test]
    async fn test_compact_with_nothing_to_fold() {
        let fx = setup().await;
        let item = InventoryItem::new("Lids", "pcs");
        seed_item(&fx, &item).await;
        assert!(fx.store.compact("acct", &item.id, "manager").await.unwrap().is_none());

        let err = fx.store.compact("acct", "nope", "manager").await.unwrap_err();
        assert!(matches!(err, CentralError::NotFound(_)));
    }
}
