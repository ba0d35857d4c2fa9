//! # Sync Agent
//!
//! Background scheduler around the [`SyncEngine`]. Decides when a cycle
//! runs and how long to wait after a transient failure.
//!
//! ## Scheduling
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           SyncAgent::run                                │
//! │                                                                         │
//! │   wait for one of:                                                      │
//! │     • poll interval tick      (auto mode only)                          │
//! │     • SyncAgentHandle::sync_now                                         │
//! │     • retry after backoff                                               │
//! │     • shutdown                 → exit                                   │
//! │                                                                         │
//! │   engine.sync_once()                                                    │
//! │     Ok          → reset backoff, publish status                         │
//! │     transient   → sleep next backoff interval, then retry               │
//! │     other error → publish error, wait for next trigger                  │
//! │                                                                         │
//! │   Offline mode never starts the loop.                                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use chrono::{DateTime, Utc};
use tokio::sync::{Notify, RwLock};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use tally_db::Database;

use crate::client::CentralApi;
use crate::config::{SyncConfig, SyncMode};
use crate::engine::{CycleReport, EngineSettings, EngineState, SyncEngine};
use crate::error::{SyncError, SyncResult};

// =============================================================================
// Sync Status
// =============================================================================

/// Snapshot of the agent for status displays.
#[derive(Debug, Clone, Default)]
pub struct SyncStatus {
    pub mode: SyncMode,
    pub state: EngineState,
    /// Entries not yet acknowledged by central.
    pub pending_count: i64,
    /// Entries that failed terminally and need an operator.
    pub failed_count: usize,
    pub last_sync: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
    pub watermark: i64,
}

// =============================================================================
// Event Emitter Trait
// =============================================================================

/// Receives agent notifications (a UI, a log shipper, a test recorder).
pub trait SyncEventEmitter: Send + Sync {
    fn emit_status(&self, status: &SyncStatus);

    fn emit_cycle(&self, report: &CycleReport);

    fn emit_error(&self, message: &str, retryable: bool);
}

pub struct NoOpEmitter;

impl SyncEventEmitter for NoOpEmitter {
    fn emit_status(&self, _status: &SyncStatus) {}
    fn emit_cycle(&self, _report: &CycleReport) {}
    fn emit_error(&self, _message: &str, _retryable: bool) {}
}

// =============================================================================
// Sync Agent
// =============================================================================

/// Runs sync cycles in the background until shut down.
pub struct SyncAgent {
    config: Arc<SyncConfig>,
    engine: Arc<SyncEngine>,
    status: Arc<RwLock<SyncStatus>>,
    emitter: Arc<dyn SyncEventEmitter>,
    trigger: Arc<Notify>,
    cancel: CancellationToken,
}

impl SyncAgent {
    pub fn new(config: SyncConfig, db: Database, api: Arc<dyn CentralApi>) -> Self {
        Self::with_emitter(config, db, api, Arc::new(NoOpEmitter))
    }

    pub fn with_emitter(
        config: SyncConfig,
        db: Database,
        api: Arc<dyn CentralApi>,
        emitter: Arc<dyn SyncEventEmitter>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let engine = SyncEngine::new(db, api, EngineSettings::from(&config), cancel.clone());
        let status = SyncStatus {
            mode: config.mode(),
            ..Default::default()
        };

        SyncAgent {
            config: Arc::new(config),
            engine: Arc::new(engine),
            status: Arc::new(RwLock::new(status)),
            emitter,
            trigger: Arc::new(Notify::new()),
            cancel,
        }
    }

    /// Handle for triggering and stopping the agent from other tasks.
    pub fn handle(&self) -> SyncAgentHandle {
        SyncAgentHandle {
            trigger: self.trigger.clone(),
            cancel: self.cancel.clone(),
            status: self.status.clone(),
        }
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    pub async fn status(&self) -> SyncStatus {
        self.status.read().await.clone()
    }

    fn create_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.config.sync.initial_backoff(),
            max_interval: self.config.sync.max_backoff(),
            multiplier: self.config.sync.backoff_multiplier,
            max_elapsed_time: None,
            ..Default::default()
        }
    }

    /// Run until [`SyncAgentHandle::shutdown`] is called.
    ///
    /// Returns immediately in offline mode.
    pub async fn run(self) -> SyncResult<()> {
        if !self.config.is_sync_enabled() {
            info!("Sync is disabled (mode: offline)");
            return Ok(());
        }
        self.config.validate()?;

        info!(
            device_id = %self.config.device_id(),
            central = %self.config.central.url,
            mode = %self.config.mode(),
            "Starting sync agent"
        );

        let periodic = self.config.mode().is_periodic();
        let mut ticker = tokio::time::interval(self.config.sync.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut backoff = self.create_backoff();
        let mut retry_pending = false;

        loop {
            if !retry_pending {
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    _ = ticker.tick(), if periodic => {}
                    _ = self.trigger.notified() => debug!("Sync requested"),
                }
            }
            retry_pending = false;

            match self.engine.sync_once().await {
                Ok(report) => {
                    backoff.reset();
                    if !report.skipped {
                        self.emitter.emit_cycle(&report);
                    }
                    self.record_success(&report).await;
                }
                Err(SyncError::Cancelled) => break,
                Err(e) if e.is_retryable() => {
                    let delay = backoff
                        .next_backoff()
                        .unwrap_or_else(|| self.config.sync.max_backoff());
                    let failures = self.record_failure(&e).await;
                    warn!(
                        error = %e,
                        consecutive_failures = failures,
                        retry_in_ms = delay.as_millis() as u64,
                        "Sync cycle failed, backing off"
                    );
                    self.emitter.emit_error(&e.to_string(), true);

                    if !self.sleep_or_cancel(delay).await {
                        break;
                    }
                    self.engine.end_backoff();
                    retry_pending = true;
                }
                Err(e) => {
                    error!(error = %e, "Sync cycle failed");
                    self.record_failure(&e).await;
                    self.emitter.emit_error(&e.to_string(), false);
                }
            }
        }

        self.status.write().await.state = EngineState::Idle;
        info!("Sync agent stopped");
        Ok(())
    }

    /// Returns false when cancelled during the wait.
    async fn sleep_or_cancel(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    async fn record_success(&self, report: &CycleReport) {
        let db = self.engine.database();
        let pending = db.sync_queue().pending_count().await;
        let failed = db.sync_queue().failed_entries().await;

        let mut status = self.status.write().await;
        status.state = self.engine.state();
        status.consecutive_failures = 0;
        status.last_error = None;
        if !report.skipped {
            status.last_sync = Some(Utc::now());
            status.watermark = report.pull.watermark;
        }
        match pending {
            Ok(count) => status.pending_count = count,
            Err(e) => error!(?e, "Failed to count pending entries"),
        }
        match failed {
            Ok(entries) => status.failed_count = entries.len(),
            Err(e) => error!(?e, "Failed to list failed entries"),
        }
        self.emitter.emit_status(&status);
    }

    async fn record_failure(&self, err: &SyncError) -> u32 {
        let mut status = self.status.write().await;
        status.state = self.engine.state();
        status.consecutive_failures += 1;
        status.last_error = Some(err.to_string());
        self.emitter.emit_status(&status);
        status.consecutive_failures
    }
}

// =============================================================================
// Agent Handle (for external control)
// =============================================================================

/// Controls a running [`SyncAgent`] from outside its task.
#[derive(Clone)]
pub struct SyncAgentHandle {
    trigger: Arc<Notify>,
    cancel: CancellationToken,
    status: Arc<RwLock<SyncStatus>>,
}

impl SyncAgentHandle {
    /// Request a cycle now. Coalesces with any request not yet picked up.
    pub fn sync_now(&self) {
        self.trigger.notify_one();
    }

    pub async fn status(&self) -> SyncStatus {
        self.status.read().await.clone()
    }

    /// Stop the agent. An in-flight request is abandoned; its entries stay
    /// queued for the next run.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tally_core::protocol::{
        EntryOutcome, EntryResult, PullRequest, PullResponse, PushRequest, PushResponse,
    };
    use tally_core::MenuItem;
    use tally_db::DbConfig;

    struct StubCentral {
        fail: bool,
        pushes: AtomicUsize,
    }

    impl StubCentral {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(StubCentral {
                fail,
                pushes: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl CentralApi for StubCentral {
        async fn push(&self, request: &PushRequest) -> SyncResult<PushResponse> {
            self.pushes.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(SyncError::ConnectionFailed("refused".into()));
            }
            Ok(PushResponse {
                results: request
                    .entries
                    .iter()
                    .map(|e| EntryResult {
                        local_id: e.local_id,
                        outcome: EntryOutcome::Applied { server_seq: e.local_id },
                    })
                    .collect(),
            })
        }

        async fn pull(&self, _request: &PullRequest) -> SyncResult<PullResponse> {
            Ok(PullResponse {
                changes: vec![],
                latest_seq: 0,
                has_more: false,
            })
        }
    }

    async fn database() -> Database {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        db.device().initialize("till-1", "acct").await.unwrap();
        db.mutations()
            .create_menu_item(MenuItem::new("Flat White", 14000))
            .await
            .unwrap();
        db
    }

    fn config(mode: SyncMode) -> SyncConfig {
        let mut config = SyncConfig::default();
        config.device.id = "till-1".to_string();
        config.sync.mode = mode;
        config.sync.initial_backoff_ms = 10;
        config
    }

    async fn wait_for_status(handle: &SyncAgentHandle, check: impl Fn(&SyncStatus) -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if check(&handle.status().await) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("status condition not reached");
    }

    #[tokio::test]
    async fn test_offline_mode_does_not_sync() {
        let central = StubCentral::new(false);
        let agent = SyncAgent::new(config(SyncMode::Offline), database().await, central.clone());

        agent.run().await.unwrap();
        assert_eq!(central.pushes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_manual_trigger_runs_cycle() {
        let central = StubCentral::new(false);
        let agent = SyncAgent::new(config(SyncMode::Manual), database().await, central.clone());
        let handle = agent.handle();
        let task = tokio::spawn(agent.run());

        handle.sync_now();
        wait_for_status(&handle, |s| s.last_sync.is_some()).await;

        let status = handle.status().await;
        assert_eq!(status.pending_count, 0);
        assert_eq!(status.consecutive_failures, 0);
        assert_eq!(central.pushes.load(Ordering::SeqCst), 1);

        handle.shutdown();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let central = StubCentral::new(true);
        let agent = SyncAgent::new(config(SyncMode::Manual), database().await, central.clone());
        let handle = agent.handle();
        let task = tokio::spawn(agent.run());

        handle.sync_now();
        wait_for_status(&handle, |s| s.consecutive_failures >= 2).await;

        let status = handle.status().await;
        assert!(status.last_error.unwrap().contains("refused"));
        assert!(central.pushes.load(Ordering::SeqCst) >= 2);

        handle.shutdown();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_stops_idle_agent() {
        let agent = SyncAgent::new(
            config(SyncMode::Manual),
            database().await,
            StubCentral::new(false),
        );
        let handle = agent.handle();
        let task = tokio::spawn(agent.run());

        handle.shutdown();
        assert!(handle.is_shutdown());
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
