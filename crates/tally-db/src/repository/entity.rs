//! # Entity Repository
//!
//! Orders, menu items and inventory items are stored as their full JSON
//! state, one table per kind:
//!
//! ```text
//! orders / menu_items / inventory_items
//! ┌──────────┬──────────────────────────────┬────────────┬────────────┐
//! │ id (PK)  │ payload (JSON)               │ server_seq │ updated_at │
//! ├──────────┼──────────────────────────────┼────────────┼────────────┤
//! │ 6f1c…    │ {"id":"6f1c…","price":18000…}│ 42         │ 1760…      │
//! └──────────┴──────────────────────────────┴────────────┴────────────┘
//! server_seq: last central change applied to this row (NULL = local only)
//! ```
//!
//! Ledger records live in their own tables (see [`super::ledger`]).

use serde::de::DeserializeOwned;
use serde_json::Value;
use sqlx::{SqliteConnection, SqlitePool};

use crate::error::{DbError, DbResult};
use tally_core::{clock, CoreError, EntityKind, InventoryItem, MenuItem, Order};

/// Table holding a mutable entity kind.
pub(crate) fn table_for(kind: EntityKind) -> DbResult<&'static str> {
    match kind {
        EntityKind::Order => Ok("orders"),
        EntityKind::MenuItem => Ok("menu_items"),
        EntityKind::InventoryItem => Ok("inventory_items"),
        EntityKind::InventoryEvent | EntityKind::InventorySnapshot => {
            Err(DbError::Core(CoreError::AppendOnly {
                kind: kind.to_string(),
            }))
        }
    }
}

/// Read the current JSON state of an entity inside a transaction.
pub(crate) async fn load(
    conn: &mut SqliteConnection,
    kind: EntityKind,
    id: &str,
) -> DbResult<Option<Value>> {
    let table = table_for(kind)?;
    let payload: Option<String> =
        sqlx::query_scalar(&format!("SELECT payload FROM {table} WHERE id = ?1"))
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?;

    payload
        .map(|p| serde_json::from_str(&p).map_err(DbError::from))
        .transpose()
}

/// Insert or replace the JSON state of an entity.
///
/// `server_seq` is `None` for local writes; the previous value is kept.
pub(crate) async fn store(
    conn: &mut SqliteConnection,
    kind: EntityKind,
    id: &str,
    payload: &Value,
    server_seq: Option<i64>,
) -> DbResult<()> {
    let table = table_for(kind)?;
    let json = serde_json::to_string(payload)?;

    sqlx::query(&format!(
        r#"
        INSERT INTO {table} (id, payload, server_seq, updated_at)
        VALUES (?1, ?2, ?3, ?4)
        ON CONFLICT(id) DO UPDATE SET
            payload = excluded.payload,
            server_seq = COALESCE(excluded.server_seq, {table}.server_seq),
            updated_at = excluded.updated_at
        "#
    ))
    .bind(id)
    .bind(json)
    .bind(server_seq)
    .bind(clock::to_millis(clock::now()))
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Read-only access to the entity tables.
#[derive(Debug, Clone)]
pub struct EntityRepository {
    pool: SqlitePool,
}

impl EntityRepository {
    pub fn new(pool: SqlitePool) -> Self {
        EntityRepository { pool }
    }

    /// Raw JSON state of an entity.
    pub async fn get(&self, kind: EntityKind, id: &str) -> DbResult<Option<Value>> {
        let mut conn = self.pool.acquire().await?;
        load(&mut conn, kind, id).await
    }

    async fn typed<T: DeserializeOwned>(&self, kind: EntityKind, id: &str) -> DbResult<Option<T>> {
        self.get(kind, id)
            .await?
            .map(|v| serde_json::from_value(v).map_err(DbError::from))
            .transpose()
    }

    pub async fn menu_item(&self, id: &str) -> DbResult<Option<MenuItem>> {
        self.typed(EntityKind::MenuItem, id).await
    }

    pub async fn inventory_item(&self, id: &str) -> DbResult<Option<InventoryItem>> {
        self.typed(EntityKind::InventoryItem, id).await
    }

    pub async fn order(&self, id: &str) -> DbResult<Option<Order>> {
        self.typed(EntityKind::Order, id).await
    }

    /// All entities of a kind, ordered by id.
    pub async fn list(&self, kind: EntityKind) -> DbResult<Vec<Value>> {
        let table = table_for(kind)?;
        let rows: Vec<String> = sqlx::query_scalar(&format!("SELECT payload FROM {table} ORDER BY id"))
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|p| serde_json::from_str(p).map_err(DbError::from))
            .collect()
    }

    /// Last central change applied to an entity, if any.
    pub async fn server_seq(&self, kind: EntityKind, id: &str) -> DbResult<Option<i64>> {
        let table = table_for(kind)?;
        let seq: Option<Option<i64>> =
            sqlx::query_scalar(&format!("SELECT server_seq FROM {table} WHERE id = ?1"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(seq.flatten())
    }
}
