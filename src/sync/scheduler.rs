//! Sync scheduler for periodic SIPP reconciliation
//!
//! This module provides a scheduler that periodically triggers the
//! reconciler, with an initial delay and jitter to spread load, and accepts
//! manual sync requests from the HTTP API. Runs are executed one at a time
//! inside the scheduler loop, so invocations never overlap.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, oneshot, RwLock};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::SchedulerConfig;
use crate::error::SyncError;
use crate::models::{RunStatus, SyncMode, SyncRun};

const MANUAL_QUEUE_CAPACITY: usize = 32;

/// Something the scheduler can run
#[async_trait]
pub trait Syncable: Send + Sync {
    /// Get the name of this source
    fn name(&self) -> &str;

    /// Perform one synchronization; `cancel` is triggered on shutdown
    async fn sync(&self, mode: SyncMode, cancel: CancellationToken) -> Result<SyncRun, SyncError>;
}

/// Snapshot of the scheduler state
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulerStatus {
    /// Whether a sync is currently in progress
    pub in_progress: bool,
    /// Last run this scheduler executed
    pub last_run: Option<SyncRun>,
    /// Error of the last invocation, if it did not succeed
    pub last_error: Option<String>,
    pub last_finished_at: Option<DateTime<Utc>>,
    /// Next scheduled run, when periodic syncs are enabled
    pub next_run: Option<DateTime<Utc>>,
    /// Runs executed since startup
    pub runs_total: u64,
}

/// Manual sync request
struct ManualSyncRequest {
    mode: SyncMode,
    /// `None` for fire-and-forget requests
    response: Option<oneshot::Sender<Result<SyncRun, SyncError>>>,
}

/// Sync scheduler
///
/// Drives a single [`Syncable`] on a fixed interval and on demand.
pub struct SyncScheduler {
    config: SchedulerConfig,
    source: Arc<dyn Syncable>,
    status: Arc<RwLock<SchedulerStatus>>,
    shutdown_rx: broadcast::Receiver<()>,
    manual_sync_rx: mpsc::Receiver<ManualSyncRequest>,
    manual_sync_tx: mpsc::Sender<ManualSyncRequest>,
    shutting_down: bool,
}

impl SyncScheduler {
    /// Create a new sync scheduler
    ///
    /// # Arguments
    ///
    /// * `config` - Scheduler configuration
    /// * `source` - The syncable to drive
    /// * `shutdown_rx` - Broadcast receiver for shutdown signal
    pub fn new(
        config: SchedulerConfig,
        source: Arc<dyn Syncable>,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Self {
        let (manual_sync_tx, manual_sync_rx) = mpsc::channel(MANUAL_QUEUE_CAPACITY);

        Self {
            config,
            source,
            status: Arc::new(RwLock::new(SchedulerStatus::default())),
            shutdown_rx,
            manual_sync_rx,
            manual_sync_tx,
            shutting_down: false,
        }
    }

    /// Get a handle for triggering manual syncs
    pub fn manual_sync_handle(&self) -> ManualSyncHandle {
        ManualSyncHandle {
            tx: self.manual_sync_tx.clone(),
        }
    }

    /// Shared status, readable while the scheduler runs
    pub fn status_handle(&self) -> Arc<RwLock<SchedulerStatus>> {
        self.status.clone()
    }

    /// Get the current status
    pub async fn get_status(&self) -> SchedulerStatus {
        self.status.read().await.clone()
    }

    /// Run the scheduler until shutdown is signaled
    ///
    /// Periodic runs start after `initial_delay_secs` plus a random jitter.
    /// When the scheduler is disabled only manual requests are served.
    pub async fn run(mut self) {
        let name = self.source.name().to_string();
        let period = Duration::from_secs(self.config.interval_secs.max(1));

        let jitter = if self.config.jitter_secs > 0 {
            rand::thread_rng().gen_range(0..self.config.jitter_secs)
        } else {
            0
        };
        let first_delay = Duration::from_secs(self.config.initial_delay_secs + jitter);

        let mut interval_timer = interval_at(Instant::now() + first_delay, period);
        // A long run must not be followed by a burst of catch-up runs
        interval_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            source = name,
            enabled = self.config.enabled,
            interval_secs = period.as_secs(),
            first_delay_secs = first_delay.as_secs(),
            "Starting sync scheduler"
        );

        if self.config.enabled {
            self.set_next_run(first_delay).await;
        }

        let mut scheduled_runs = 0u64;

        while !self.shutting_down {
            tokio::select! {
                _ = self.shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping sync scheduler");
                    self.shutting_down = true;
                }
                _ = interval_timer.tick(), if self.config.enabled => {
                    scheduled_runs += 1;
                    let mode = self.mode_for(scheduled_runs);

                    info!(source = name, mode = %mode, "Performing scheduled sync");
                    let _ = self.perform_sync(mode).await;

                    self.set_next_run(period).await;
                }
                Some(request) = self.manual_sync_rx.recv() => {
                    info!(source = name, mode = %request.mode, "Manual sync triggered");
                    let result = self.perform_sync(request.mode).await;

                    if let Some(response) = request.response {
                        let _ = response.send(result);
                    }
                }
            }
        }

        info!("Sync scheduler stopped");
    }

    /// Mode of the n-th scheduled run (1-based)
    fn mode_for(&self, run_number: u64) -> SyncMode {
        let every = self.config.full_sync_every;
        if every > 0 && (run_number - 1) % every == 0 {
            SyncMode::Full
        } else {
            SyncMode::Incremental
        }
    }

    async fn set_next_run(&self, after: Duration) {
        let after = chrono::Duration::from_std(after).unwrap_or_else(|_| chrono::Duration::zero());
        self.status.write().await.next_run = Some(Utc::now() + after);
    }

    async fn perform_sync(&mut self, mode: SyncMode) -> Result<SyncRun, SyncError> {
        let name = self.source.name().to_string();
        let source = self.source.clone();

        self.status.write().await.in_progress = true;

        let cancel = CancellationToken::new();
        let sync = source.sync(mode, cancel.clone());
        tokio::pin!(sync);

        let result = tokio::select! {
            result = &mut sync => result,
            _ = self.shutdown_rx.recv() => {
                info!(source = name, "Shutdown during sync, cancelling run");
                self.shutting_down = true;
                cancel.cancel();
                sync.await
            }
        };

        let mut status = self.status.write().await;
        status.in_progress = false;

        match &result {
            Ok(run) => {
                status.runs_total += 1;
                status.last_finished_at = Some(Utc::now());

                if run.status == RunStatus::Success {
                    info!(
                        source = name,
                        run_id = run.id,
                        created = run.created,
                        updated = run.updated,
                        skipped = run.skipped,
                        "Sync completed"
                    );
                    status.last_error = None;
                } else {
                    let message = run
                        .last_error
                        .as_ref()
                        .and_then(|e| e.get("message"))
                        .and_then(|m| m.as_str())
                        .map(String::from)
                        .unwrap_or_else(|| format!("{} failed records", run.failed));
                    warn!(
                        source = name,
                        run_id = run.id,
                        status = %run.status,
                        failed = run.failed,
                        error = message,
                        "Sync completed with problems"
                    );
                    status.last_error = Some(format!("{}: {}", run.status, message));
                }

                status.last_run = Some(run.clone());
            }
            Err(SyncError::AlreadyRunning) => {
                debug!(source = name, "Sync already running, skipping");
            }
            Err(err) => {
                error!(source = name, error = %err, "Sync failed");
                status.last_error = Some(err.to_string());
                status.last_finished_at = Some(Utc::now());
            }
        }

        result
    }
}

/// Handle for triggering manual syncs
#[derive(Clone)]
pub struct ManualSyncHandle {
    tx: mpsc::Sender<ManualSyncRequest>,
}

impl ManualSyncHandle {
    /// Trigger a manual sync and wait for its result
    pub async fn trigger_sync(&self, mode: SyncMode) -> Result<SyncRun, SyncError> {
        let (response_tx, response_rx) = oneshot::channel();

        self.tx
            .send(ManualSyncRequest {
                mode,
                response: Some(response_tx),
            })
            .await
            .map_err(|_| SyncError::SchedulerUnavailable("Scheduler not running".to_string()))?;

        response_rx.await.map_err(|_| {
            SyncError::SchedulerUnavailable("No response from scheduler".to_string())
        })?
    }

    /// Queue a manual sync without waiting
    ///
    /// Every call queues one more run.
    pub fn enqueue(&self, mode: SyncMode) -> Result<(), SyncError> {
        self.tx
            .try_send(ManualSyncRequest {
                mode,
                response: None,
            })
            .map_err(|e| match e {
                TrySendError::Full(_) => {
                    SyncError::SchedulerUnavailable("Manual sync queue is full".to_string())
                }
                TrySendError::Closed(_) => {
                    SyncError::SchedulerUnavailable("Scheduler not running".to_string())
                }
            })
    }
}
