//! # Sync Protocol Messages
//!
//! Request/response bodies exchanged between a device and the central
//! store.
//!
//! ## Protocol Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Sync Protocol Messages                             │
//! │                                                                         │
//! │  PUSH (device → central)                POST /v1/sync/push             │
//! │  ───────────────────────                                               │
//! │  DEVICE  ───► PushRequest  { deviceId, lastSeenSeq, entries: [...] }   │
//! │  CENTRAL ◄─── PushResponse { results: [{ localId, outcome, ... }] }    │
//! │                                                                         │
//! │      outcome = applied | duplicate | conflict | rejected                │
//! │                                                                         │
//! │  PULL (central → device)                GET /v1/sync/pull              │
//! │  ───────────────────────                                               │
//! │  DEVICE  ───► PullRequest  { deviceId, since, limit }                  │
//! │  CENTRAL ◄─── PullResponse { changes: [...], latestSeq, hasMore }      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Wire Format
//! camelCase JSON. Entity payloads inside `payload` / `resolved` keep their
//! own snake_case field names.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{EntityKind, Operation, ResolutionStrategy, SyncQueueEntry};

/// Current protocol version, reported by `/health`.
pub const PROTOCOL_VERSION: u32 = 1;

// =============================================================================
// Push
// =============================================================================

/// One queued mutation on the wire. `(deviceId, localId)` is its
/// idempotency key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushEntry {
    pub local_id: i64,
    pub entity_kind: EntityKind,
    pub entity_id: String,
    pub operation: Operation,
    pub payload: Value,
    pub client_timestamp: DateTime<Utc>,
}

impl From<&SyncQueueEntry> for PushEntry {
    fn from(entry: &SyncQueueEntry) -> Self {
        PushEntry {
            local_id: entry.local_id,
            entity_kind: entry.entity_kind,
            entity_id: entry.entity_id.clone(),
            operation: entry.operation,
            payload: entry.payload.clone(),
            client_timestamp: entry.client_timestamp,
        }
    }
}

/// Ordered batch of mutations from one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushRequest {
    pub device_id: String,
    /// The device's pull watermark; changes up to it are known to the
    /// device and never count as conflicts.
    pub last_seen_seq: i64,
    pub entries: Vec<PushEntry>,
}

/// Per-entry result of a push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum EntryOutcome {
    /// Applied as sent.
    #[serde(rename_all = "camelCase")]
    Applied { server_seq: i64 },

    /// Already applied earlier; treat as success.
    Duplicate,

    /// Competed with another device's mutation. `resolved` is the full
    /// entity state after resolution.
    #[serde(rename_all = "camelCase")]
    Conflict {
        server_seq: i64,
        strategy: ResolutionStrategy,
        resolved: Value,
    },

    /// Terminal: the entry will never apply.
    Rejected { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryResult {
    pub local_id: i64,
    #[serde(flatten)]
    pub outcome: EntryOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushResponse {
    pub results: Vec<EntryResult>,
}

// =============================================================================
// Pull
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequest {
    pub device_id: String,
    /// Return changes with a sequence number strictly greater than this.
    pub since: i64,
    pub limit: u32,
}

/// One entry of the central change feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Change {
    pub seq: i64,
    pub entity_kind: EntityKind,
    pub entity_id: String,
    pub operation: Operation,
    /// Full current state of the entity (or the ledger record).
    pub payload: Value,
    pub origin_device_id: String,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullResponse {
    /// Ascending by `seq`.
    pub changes: Vec<Change>,
    /// Highest sequence number of the account's feed at response time.
    pub latest_seq: i64,
    pub has_more: bool,
}

// =============================================================================
// Unit Tests
// =============================================================================
