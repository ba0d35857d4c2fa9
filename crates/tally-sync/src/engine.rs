//! # Sync Engine
//!
//! One push/pull cycle against the central store.
//!
//! ## State Machine
//! ```text
//!             sync_once()
//!   ┌──────┐ ───────────► ┌─────────┐  queue drained  ┌─────────┐
//!   │ Idle │              │ Pushing │ ──────────────► │ Pulling │
//!   └──────┘ ◄─────────── └─────────┘                 └─────────┘
//!      ▲        done           │ transient failure         │  │
//!      │                       ▼                           │  │ last page
//!      │                  ┌─────────┐ ◄────────────────────┘  │
//!      └──── agent ────── │ Backoff │                          │
//!            slept        └─────────┘                          ▼
//!                                                           Idle
//! ```
//!
//! ## Push Outcomes
//! ```text
//! applied | duplicate   → acknowledged
//! conflict              → resolved payload stored (unless newer local
//!                         changes are queued), acknowledged
//! rejected              → failed, not retryable, warning
//! no outcome            → one attempt counted against the entry
//! transport failure     → one attempt counted against every entry sent
//! ```

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use tally_core::protocol::{EntryOutcome, PullRequest, PushEntry, PushRequest, PushResponse};
use tally_core::{EntityKind, SyncDirection, SyncQueueEntry};
use tally_db::{Database, DbError, NewSyncLog};

use crate::client::CentralApi;
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};

// =============================================================================
// State and Reports
// =============================================================================

/// Observable engine state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EngineState {
    #[default]
    Idle,
    Pushing,
    Pulling,
    Backoff,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineState::Idle => write!(f, "idle"),
            EngineState::Pushing => write!(f, "pushing"),
            EngineState::Pulling => write!(f, "pulling"),
            EngineState::Backoff => write!(f, "backoff"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushReport {
    pub batches: usize,
    pub sent: usize,
    pub acknowledged: usize,
    pub conflicts: usize,
    pub rejected: usize,
    /// Entries whose retry budget ran out during this cycle.
    pub exhausted: Vec<i64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PullReport {
    pub pages: usize,
    pub applied: usize,
    pub skipped: usize,
    pub watermark: i64,
}

/// Result of one [`SyncEngine::sync_once`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Another cycle was already running; nothing was done.
    pub skipped: bool,
    pub push: PushReport,
    pub pull: PullReport,
}

impl CycleReport {
    fn skipped() -> Self {
        CycleReport {
            skipped: true,
            ..Default::default()
        }
    }
}

// =============================================================================
// Settings
// =============================================================================

/// Engine tuning, usually derived from [`SyncConfig`].
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    pub batch_size: u32,
    pub pull_page_size: u32,
    pub max_attempts: u32,
    pub request_timeout: Duration,
    /// Acknowledged queue entries older than this are purged after a
    /// successful cycle.
    pub purge_after: chrono::Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        EngineSettings::from(&SyncConfig::default())
    }
}

impl From<&SyncConfig> for EngineSettings {
    fn from(config: &SyncConfig) -> Self {
        EngineSettings {
            batch_size: config.sync.batch_size,
            pull_page_size: config.sync.pull_page_size,
            max_attempts: config.sync.max_attempts,
            request_timeout: config.request_timeout(),
            purge_after: chrono::Duration::days(i64::from(config.sync.purge_after_days)),
        }
    }
}

// =============================================================================
// Engine
// =============================================================================

/// Push/pull engine for one device store.
pub struct SyncEngine {
    db: Database,
    api: Arc<dyn CentralApi>,
    settings: EngineSettings,
    state: watch::Sender<EngineState>,
    cycle: Mutex<()>,
    cancel: CancellationToken,
    /// Current push batch size; shrinks when central refuses a batch.
    batch_limit: AtomicU32,
}

impl SyncEngine {
    pub fn new(
        db: Database,
        api: Arc<dyn CentralApi>,
        settings: EngineSettings,
        cancel: CancellationToken,
    ) -> Self {
        let (state, _) = watch::channel(EngineState::Idle);
        let batch_limit = AtomicU32::new(settings.batch_size.max(1));
        SyncEngine {
            db,
            api,
            settings,
            state,
            cycle: Mutex::new(()),
            cancel,
            batch_limit,
        }
    }

    /// Current state.
    pub fn state(&self) -> EngineState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<EngineState> {
        self.state.subscribe()
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    fn set_state(&self, next: EngineState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(from = %previous, to = %next, "Sync engine state");
        }
    }

    /// Leave `Backoff` once the agent has waited.
    pub fn end_backoff(&self) {
        if self.state() == EngineState::Backoff {
            self.set_state(EngineState::Idle);
        }
    }

    /// Run one push cycle followed by one pull cycle.
    ///
    /// Returns a skipped report if a cycle is already in flight. On a
    /// transient failure the engine is left in [`EngineState::Backoff`] and
    /// the error is returned so the caller can schedule a retry.
    pub async fn sync_once(&self) -> SyncResult<CycleReport> {
        let Ok(_cycle) = self.cycle.try_lock() else {
            debug!("Sync cycle already running, skipping");
            return Ok(CycleReport::skipped());
        };

        let result = self.run_cycle().await;

        match &result {
            Ok(_) => self.set_state(EngineState::Idle),
            Err(e) if e.is_retryable() => self.set_state(EngineState::Backoff),
            Err(_) => self.set_state(EngineState::Idle),
        }
        result
    }

    async fn run_cycle(&self) -> SyncResult<CycleReport> {
        let device = self
            .db
            .device()
            .get()
            .await?
            .ok_or(SyncError::DatabaseError(DbError::NotInitialized))?;
        let device_id = device.device_id;

        self.set_state(EngineState::Pushing);
        let started = Instant::now();
        let push = self.push_all(&device_id).await;
        self.log_attempt(
            &device_id,
            SyncDirection::Push,
            started,
            push.as_ref().map(|r| r.acknowledged + r.rejected),
        )
        .await;
        let push = push?;

        self.set_state(EngineState::Pulling);
        let started = Instant::now();
        let pull = self.pull_all(&device_id).await;
        self.log_attempt(
            &device_id,
            SyncDirection::Pull,
            started,
            pull.as_ref().map(|r| r.applied),
        )
        .await;
        let pull = pull?;

        let purged = self
            .db
            .sync_queue()
            .purge_acknowledged(self.settings.purge_after)
            .await?;
        if purged > 0 {
            debug!(purged, "Purged acknowledged queue entries");
        }

        if push.sent > 0 || pull.applied > 0 {
            info!(
                sent = push.sent,
                acknowledged = push.acknowledged,
                conflicts = push.conflicts,
                rejected = push.rejected,
                pulled = pull.applied,
                watermark = pull.watermark,
                "Sync cycle complete"
            );
        }

        Ok(CycleReport {
            skipped: false,
            push,
            pull,
        })
    }

    async fn log_attempt(
        &self,
        device_id: &str,
        direction: SyncDirection,
        started: Instant,
        outcome: Result<usize, &SyncError>,
    ) {
        let log = NewSyncLog {
            direction,
            success: outcome.is_ok(),
            entries_processed: outcome.map_or(0, |n| n as i64),
            duration_ms: started.elapsed().as_millis() as i64,
            error: outcome.err().map(ToString::to_string),
        };
        if let Err(e) = self.db.sync_logs().record(device_id, &log).await {
            error!(?e, "Failed to record sync log");
        }
    }

    /// Race a network call against cancellation and the request timeout.
    async fn call<T>(&self, fut: impl Future<Output = SyncResult<T>>) -> SyncResult<T> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(SyncError::Cancelled),
            result = tokio::time::timeout(self.settings.request_timeout, fut) => match result {
                Ok(inner) => inner,
                Err(_) => Err(SyncError::Timeout(self.settings.request_timeout.as_secs())),
            },
        }
    }

    // =========================================================================
    // Push
    // =========================================================================

    async fn push_all(&self, device_id: &str) -> SyncResult<PushReport> {
        let queue = self.db.sync_queue();
        let mut report = PushReport::default();

        loop {
            if self.cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }

            let limit = self.batch_limit.load(Ordering::Relaxed);
            let batch = queue.next_batch(limit).await?;
            if batch.is_empty() {
                break;
            }

            let ids: Vec<i64> = batch.iter().map(|e| e.local_id).collect();
            queue.mark_sent(&ids).await?;

            let request = PushRequest {
                device_id: device_id.to_string(),
                last_seen_seq: self.db.device().conflict_watermark().await?,
                entries: batch.iter().map(PushEntry::from).collect(),
            };
            report.batches += 1;
            report.sent += batch.len();

            let response = match self.call(self.api.push(&request)).await {
                Ok(response) => response,
                Err(SyncError::RequestRejected { status: 400, message }) if ids.len() > 1 => {
                    let smaller = (ids.len() / 2) as u32;
                    self.batch_limit.store(smaller, Ordering::Relaxed);
                    warn!(
                        entries = ids.len(),
                        batch_size = smaller,
                        reason = %message,
                        "Central refused the batch, retrying smaller"
                    );
                    continue;
                }
                Err(SyncError::RequestRejected { status: 400, message }) => {
                    for &local_id in &ids {
                        queue.mark_failed(local_id, &message, false).await?;
                    }
                    report.rejected += ids.len();
                    continue;
                }
                Err(e) => {
                    if e.is_retryable() {
                        let exhausted = queue
                            .record_attempt_failure(&ids, &e.to_string(), self.settings.max_attempts)
                            .await?;
                        report.exhausted.extend(exhausted);
                    }
                    warn!(error = %e, entries = ids.len(), "Push failed");
                    return Err(e);
                }
            };

            let settled = self.process_results(&batch, response, &mut report).await?;
            if settled == 0 {
                // Nothing in this batch could be settled; try again next cycle.
                break;
            }
        }

        Ok(report)
    }

    /// Apply per-entry outcomes. Returns how many entries left the batch.
    async fn process_results(
        &self,
        batch: &[SyncQueueEntry],
        response: PushResponse,
        report: &mut PushReport,
    ) -> SyncResult<usize> {
        let queue = self.db.sync_queue();
        let mut outcomes: HashMap<i64, EntryOutcome> = response
            .results
            .into_iter()
            .map(|r| (r.local_id, r.outcome))
            .collect();
        let mut settled = 0;
        // Entities with an earlier entry in this batch that got no outcome.
        let mut unsettled: HashSet<(EntityKind, &str)> = HashSet::new();

        for entry in batch {
            let outcome = outcomes.remove(&entry.local_id);
            let entity = (entry.entity_kind, entry.entity_id.as_str());
            if unsettled.contains(&entity) {
                debug!(
                    local_id = entry.local_id,
                    entity_kind = %entry.entity_kind,
                    entity_id = %entry.entity_id,
                    "Earlier entry of the entity unsettled, leaving for redelivery"
                );
                continue;
            }

            match outcome {
                Some(EntryOutcome::Applied { .. }) | Some(EntryOutcome::Duplicate) => {
                    queue.mark_acknowledged(entry.local_id).await?;
                    report.acknowledged += 1;
                    settled += 1;
                }
                Some(EntryOutcome::Conflict {
                    server_seq,
                    strategy,
                    resolved,
                }) => {
                    let stored = self
                        .db
                        .inbound()
                        .apply_resolution(
                            entry.local_id,
                            entry.entity_kind,
                            &entry.entity_id,
                            &resolved,
                            server_seq,
                        )
                        .await?;
                    info!(
                        local_id = entry.local_id,
                        entity_kind = %entry.entity_kind,
                        entity_id = %entry.entity_id,
                        strategy = strategy.as_str(),
                        stored,
                        "Conflict resolved by central"
                    );
                    report.acknowledged += 1;
                    report.conflicts += 1;
                    settled += 1;
                }
                Some(EntryOutcome::Rejected { reason }) => {
                    queue.mark_failed(entry.local_id, &reason, false).await?;
                    warn!(
                        mutation = %entry.mutation_ref(),
                        entity_kind = %entry.entity_kind,
                        entity_id = %entry.entity_id,
                        reason = %reason,
                        "Mutation rejected by central"
                    );
                    report.rejected += 1;
                    settled += 1;
                }
                None => {
                    unsettled.insert(entity);
                    let exhausted = queue
                        .record_attempt_failure(
                            &[entry.local_id],
                            "no outcome returned",
                            self.settings.max_attempts,
                        )
                        .await?;
                    report.exhausted.extend(exhausted);
                }
            }
        }

        Ok(settled)
    }

    // =========================================================================
    // Pull
    // =========================================================================

    async fn pull_all(&self, device_id: &str) -> SyncResult<PullReport> {
        let mut report = PullReport {
            watermark: self.db.device().watermark().await?,
            ..Default::default()
        };

        loop {
            if self.cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }

            let request = PullRequest {
                device_id: device_id.to_string(),
                since: report.watermark,
                limit: self.settings.pull_page_size,
            };
            let page = self.call(self.api.pull(&request)).await?;

            let applied = self.db.inbound().apply_changes(&page.changes).await?;
            report.pages += 1;
            report.applied += applied.applied;
            report.skipped += applied.skipped;

            let advanced = applied.watermark > report.watermark;
            report.watermark = applied.watermark;

            if !page.has_more || !advanced {
                break;
            }
        }

        Ok(report)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
