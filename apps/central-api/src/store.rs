//! Entity state, the received-mutation log, the change feed and the
//! conflict log.
//!
//! The write helpers take the connection of an open transaction so that
//! one push entry is applied atomically:
//!
//! ```text
//! BEGIN
//!   find_mutation(device, local_id)     → duplicate?
//!   load_entity / unseen_mutations      → conflict?
//!   store_entity + append_change        → new state, new seq
//!   insert_conflict_log                 (only on conflict)
//!   log_mutation                        → UNIQUE(device_id, local_id)
//! COMMIT
//! ```

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{FromRow, SqliteConnection, SqlitePool};

use tally_core::protocol::{Change, PushEntry};
use tally_core::{
    clock, ConflictLog, CoreError, EntityKind, MutationRef, Operation, ResolutionStrategy,
};

use crate::error::{CentralError, CentralResult};

/// Table holding a mutable entity kind.
fn table_for(kind: EntityKind) -> CentralResult<&'static str> {
    match kind {
        EntityKind::Order => Ok("orders"),
        EntityKind::MenuItem => Ok("menu_items"),
        EntityKind::InventoryItem => Ok("inventory_items"),
        EntityKind::InventoryEvent | EntityKind::InventorySnapshot => {
            Err(CentralError::Core(CoreError::AppendOnly {
                kind: kind.to_string(),
            }))
        }
    }
}

// =============================================================================
// Entity State
// =============================================================================

pub(crate) async fn load_entity(
    conn: &mut SqliteConnection,
    account_id: &str,
    kind: EntityKind,
    id: &str,
) -> CentralResult<Option<Value>> {
    let table = table_for(kind)?;
    let payload: Option<String> = sqlx::query_scalar(&format!(
        "SELECT payload FROM {table} WHERE account_id = ?1 AND id = ?2"
    ))
    .bind(account_id)
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?;

    payload
        .map(|p| serde_json::from_str(&p).map_err(CentralError::from))
        .transpose()
}

pub(crate) async fn store_entity(
    conn: &mut SqliteConnection,
    account_id: &str,
    kind: EntityKind,
    id: &str,
    payload: &Value,
    change_seq: i64,
) -> CentralResult<()> {
    let table = table_for(kind)?;
    sqlx::query(&format!(
        r#"
        INSERT INTO {table} (account_id, id, payload, change_seq, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5)
        ON CONFLICT (account_id, id) DO UPDATE SET
            payload = excluded.payload,
            change_seq = excluded.change_seq,
            updated_at = excluded.updated_at
        "#
    ))
    .bind(account_id)
    .bind(id)
    .bind(serde_json::to_string(payload)?)
    .bind(change_seq)
    .bind(clock::to_millis(clock::now()))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

// =============================================================================
// Change Feed
// =============================================================================

#[derive(Debug, FromRow)]
struct ChangeRow {
    seq: i64,
    entity_kind: String,
    entity_id: String,
    operation: String,
    payload: String,
    origin_device_id: String,
    recorded_at: i64,
}

impl TryFrom<ChangeRow> for Change {
    type Error = CentralError;

    fn try_from(row: ChangeRow) -> Result<Self, Self::Error> {
        Ok(Change {
            seq: row.seq,
            entity_kind: row.entity_kind.parse()?,
            entity_id: row.entity_id,
            operation: row.operation.parse()?,
            payload: serde_json::from_str(&row.payload)?,
            origin_device_id: row.origin_device_id,
            recorded_at: clock::from_millis(row.recorded_at)?,
        })
    }
}

/// Append a change and return its sequence number.
pub(crate) async fn append_change(
    conn: &mut SqliteConnection,
    account_id: &str,
    kind: EntityKind,
    id: &str,
    operation: Operation,
    payload: &Value,
    origin_device_id: &str,
) -> CentralResult<i64> {
    let seq: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO changes (account_id, entity_kind, entity_id, operation, payload, origin_device_id, recorded_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        RETURNING seq
        "#,
    )
    .bind(account_id)
    .bind(kind.as_str())
    .bind(id)
    .bind(operation.as_str())
    .bind(serde_json::to_string(payload)?)
    .bind(origin_device_id)
    .bind(clock::to_millis(clock::now()))
    .fetch_one(&mut *conn)
    .await?;
    Ok(seq)
}

/// One page of an account's change feed, ascending, `seq > since`.
///
/// Fetches one row past `limit` to tell whether more pages follow.
pub(crate) async fn changes_since(
    pool: &SqlitePool,
    account_id: &str,
    since: i64,
    limit: u32,
) -> CentralResult<(Vec<Change>, bool)> {
    let rows = sqlx::query_as::<_, ChangeRow>(
        r#"
        SELECT seq, entity_kind, entity_id, operation, payload, origin_device_id, recorded_at
        FROM changes
        WHERE account_id = ?1 AND seq > ?2
        ORDER BY seq
        LIMIT ?3
        "#,
    )
    .bind(account_id)
    .bind(since)
    .bind(i64::from(limit) + 1)
    .fetch_all(pool)
    .await?;

    let has_more = rows.len() > limit as usize;
    let changes = rows
        .into_iter()
        .take(limit as usize)
        .map(Change::try_from)
        .collect::<CentralResult<Vec<_>>>()?;
    Ok((changes, has_more))
}

pub(crate) async fn latest_seq(pool: &SqlitePool, account_id: &str) -> CentralResult<i64> {
    let seq: Option<i64> = sqlx::query_scalar("SELECT MAX(seq) FROM changes WHERE account_id = ?1")
        .bind(account_id)
        .fetch_one(pool)
        .await?;
    Ok(seq.unwrap_or(0))
}

// =============================================================================
// Mutation Log
// =============================================================================

/// Stored verdict for a received mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Verdict {
    Applied,
    Conflict,
    Rejected,
}

impl Verdict {
    fn as_str(&self) -> &'static str {
        match self {
            Verdict::Applied => "applied",
            Verdict::Conflict => "conflict",
            Verdict::Rejected => "rejected",
        }
    }
}

/// A previously received mutation, as the conflict check needs it.
#[derive(Debug, Clone)]
pub(crate) struct LoggedMutation {
    pub mutation: MutationRef,
    pub operation: Operation,
    pub payload: Value,
    pub client_timestamp: DateTime<Utc>,
}

#[derive(Debug, FromRow)]
struct LoggedRow {
    device_id: String,
    local_id: i64,
    operation: String,
    payload: String,
    client_timestamp: i64,
}

impl TryFrom<LoggedRow> for LoggedMutation {
    type Error = CentralError;

    fn try_from(row: LoggedRow) -> Result<Self, Self::Error> {
        Ok(LoggedMutation {
            mutation: MutationRef {
                device_id: row.device_id,
                local_id: row.local_id,
            },
            operation: row.operation.parse()?,
            payload: serde_json::from_str(&row.payload)?,
            client_timestamp: clock::from_millis(row.client_timestamp)?,
        })
    }
}

/// Outcome recorded for (`device_id`, `local_id`), if it was seen before.
///
/// Returns the stored rejection reason for rejected entries.
pub(crate) async fn find_mutation(
    conn: &mut SqliteConnection,
    device_id: &str,
    local_id: i64,
) -> CentralResult<Option<(Verdict, Option<String>)>> {
    let row: Option<(String, Option<String>)> = sqlx::query_as(
        "SELECT outcome, reason FROM mutation_log WHERE device_id = ?1 AND local_id = ?2",
    )
    .bind(device_id)
    .bind(local_id)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(row.map(|(outcome, reason)| {
        let verdict = match outcome.as_str() {
            "rejected" => Verdict::Rejected,
            "conflict" => Verdict::Conflict,
            _ => Verdict::Applied,
        };
        (verdict, reason)
    }))
}

/// Mutations from other devices that changed the entity after `since`, in
/// receipt order.
pub(crate) async fn unseen_mutations(
    conn: &mut SqliteConnection,
    account_id: &str,
    kind: EntityKind,
    id: &str,
    device_id: &str,
    since: i64,
) -> CentralResult<Vec<LoggedMutation>> {
    sqlx::query_as::<_, LoggedRow>(
        r#"
        SELECT device_id, local_id, operation, payload, client_timestamp
        FROM mutation_log
        WHERE account_id = ?1 AND entity_kind = ?2 AND entity_id = ?3
          AND outcome IN ('applied', 'conflict')
          AND device_id <> ?4
          AND change_seq > ?5
        ORDER BY change_seq ASC
        "#,
    )
    .bind(account_id)
    .bind(kind.as_str())
    .bind(id)
    .bind(device_id)
    .bind(since)
    .fetch_all(&mut *conn)
    .await?
    .into_iter()
    .map(LoggedMutation::try_from)
    .collect()
}

/// Record a received mutation. Fails with [`CentralError::Duplicate`] if
/// (`device_id`, `local_id`) is already logged.
pub(crate) async fn log_mutation(
    conn: &mut SqliteConnection,
    account_id: &str,
    device_id: &str,
    entry: &PushEntry,
    verdict: Verdict,
    reason: Option<&str>,
    change_seq: Option<i64>,
) -> CentralResult<()> {
    sqlx::query(
        r#"
        INSERT INTO mutation_log (
            account_id, device_id, local_id, entity_kind, entity_id, operation,
            payload, client_timestamp, outcome, reason, change_seq, received_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
        "#,
    )
    .bind(account_id)
    .bind(device_id)
    .bind(entry.local_id)
    .bind(entry.entity_kind.as_str())
    .bind(&entry.entity_id)
    .bind(entry.operation.as_str())
    .bind(serde_json::to_string(&entry.payload)?)
    .bind(clock::to_millis(entry.client_timestamp))
    .bind(verdict.as_str())
    .bind(reason)
    .bind(change_seq)
    .bind(clock::to_millis(clock::now()))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

// =============================================================================
// Conflict Log
// =============================================================================

pub(crate) async fn insert_conflict_log(
    conn: &mut SqliteConnection,
    log: &ConflictLog,
) -> CentralResult<()> {
    sqlx::query(
        r#"
        INSERT INTO conflict_logs (
            id, account_id, entity_kind, entity_id,
            winner_device_id, winner_local_id, superseded_device_id, superseded_local_id,
            strategy, resolved_payload, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
        "#,
    )
    .bind(&log.id)
    .bind(&log.account_id)
    .bind(log.entity_kind.as_str())
    .bind(&log.entity_id)
    .bind(&log.winner.device_id)
    .bind(log.winner.local_id)
    .bind(&log.superseded.device_id)
    .bind(log.superseded.local_id)
    .bind(log.strategy.as_str())
    .bind(serde_json::to_string(&log.resolved_payload)?)
    .bind(clock::to_millis(log.created_at))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

#[derive(Debug, FromRow)]
struct ConflictRow {
    id: String,
    account_id: String,
    entity_kind: String,
    entity_id: String,
    winner_device_id: String,
    winner_local_id: i64,
    superseded_device_id: String,
    superseded_local_id: i64,
    strategy: String,
    resolved_payload: String,
    created_at: i64,
}

impl TryFrom<ConflictRow> for ConflictLog {
    type Error = CentralError;

    fn try_from(row: ConflictRow) -> Result<Self, Self::Error> {
        Ok(ConflictLog {
            id: row.id,
            account_id: row.account_id,
            entity_kind: row.entity_kind.parse()?,
            entity_id: row.entity_id,
            winner: MutationRef {
                device_id: row.winner_device_id,
                local_id: row.winner_local_id,
            },
            superseded: MutationRef {
                device_id: row.superseded_device_id,
                local_id: row.superseded_local_id,
            },
            strategy: row.strategy.parse::<ResolutionStrategy>()?,
            resolved_payload: serde_json::from_str(&row.resolved_payload)?,
            created_at: clock::from_millis(row.created_at)?,
        })
    }
}

/// Conflict logs of one entity, oldest first.
pub(crate) async fn conflict_logs_for(
    pool: &SqlitePool,
    account_id: &str,
    kind: EntityKind,
    id: &str,
) -> CentralResult<Vec<ConflictLog>> {
    let rows = sqlx::query_as::<_, ConflictRow>(
        r#"
        SELECT id, account_id, entity_kind, entity_id,
               winner_device_id, winner_local_id, superseded_device_id, superseded_local_id,
               strategy, resolved_payload, created_at
        FROM conflict_logs
        WHERE account_id = ?1 AND entity_kind = ?2 AND entity_id = ?3
        ORDER BY created_at, id
        "#,
    )
    .bind(account_id)
    .bind(kind.as_str())
    .bind(id)
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(ConflictLog::try_from).collect()
}
