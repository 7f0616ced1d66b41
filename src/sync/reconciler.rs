//! Sync reconciler
//!
//! Pages through the SIPP listings, maps every record to its local
//! projection and applies the smallest write that brings the local store up
//! to date. Each invocation is audited as a [`SyncRun`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::http_client::{PageRequest, RemoteSource};
use super::retry::RetryManager;
use super::scheduler::Syncable;
use crate::config::Config;
use crate::database::Database;
use crate::error::{ApiError, DbError, SyncError};
use crate::models::{
    MappedRecord, RecordKind, RecordSyncStatus, RunStatus, SyncMode, SyncRun, MAX_RUN_ERRORS,
};

/// Name of the run lock shared by all nodes
pub const SYNC_LOCK_NAME: &str = "sipp-sync";

const CANCELLED: &str = "Sync run cancelled";
const TIMED_OUT: &str = "Sync run timed out";

/// Reconciler settings
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Record kinds to sync, in order
    pub kinds: Vec<RecordKind>,
    pub page_size: u32,
    /// Upper bound on pages per kind
    pub max_pages: u32,
    pub lock_ttl_secs: u64,
    pub run_timeout_secs: u64,
    /// Prefix of the owner recorded on the run lock
    pub node_id: String,
}

impl ReconcilerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            kinds: RecordKind::ALL.to_vec(),
            page_size: config.sipp.page_size,
            max_pages: config.sipp.max_pages,
            lock_ttl_secs: config.scheduler.lock_ttl_secs,
            run_timeout_secs: config.scheduler.run_timeout_secs,
            node_id: config.scheduler.node_id.clone(),
        }
    }
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// What happened to one record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordOutcome {
    Created,
    Updated,
    Skipped,
}

/// Why the page loop stopped early
#[derive(Debug)]
enum RunStop {
    Interrupted(&'static str),
    Api(ApiError),
    Database(DbError),
}

/// Reconciles SIPP records into the local store
pub struct SyncReconciler<D: Database, S: RemoteSource> {
    database: Arc<D>,
    source: Arc<S>,
    retry: RetryManager,
    config: ReconcilerConfig,
    running: Mutex<()>,
}

impl<D: Database, S: RemoteSource> SyncReconciler<D, S> {
    pub fn new(
        database: Arc<D>,
        source: Arc<S>,
        retry: RetryManager,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            database,
            source,
            retry,
            config,
            running: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// Run one reconciliation
    ///
    /// Returns the finalized run for every outcome, including failed and
    /// cancelled runs. Fails with [`SyncError::AlreadyRunning`] when another
    /// run holds the lock, and with [`SyncError::Database`] when the run row
    /// itself cannot be written.
    pub async fn run_sync(
        &self,
        mode: SyncMode,
        cancel: CancellationToken,
    ) -> Result<SyncRun, SyncError> {
        let _running = self
            .running
            .try_lock()
            .map_err(|_| SyncError::AlreadyRunning)?;

        // Processes on one host share a node id
        let owner = lock_owner(&self.config.node_id);
        let acquired = self
            .database
            .try_acquire_lock(SYNC_LOCK_NAME, &owner, self.config.lock_ttl_secs)
            .await?;
        if !acquired {
            debug!(node_id = %self.config.node_id, "Sync lock held by another run");
            return Err(SyncError::AlreadyRunning);
        }

        let result = self.run_locked(mode, &cancel).await;

        if let Err(e) = self.database.release_lock(SYNC_LOCK_NAME, &owner).await {
            warn!(error = %e, "Failed to release sync lock");
        }

        result
    }

    async fn run_locked(
        &self,
        mode: SyncMode,
        cancel: &CancellationToken,
    ) -> Result<SyncRun, SyncError> {
        let mut run = SyncRun::new(mode);
        run.id = self.database.create_run(&run).await?;

        info!(run_id = run.id, mode = %mode, "Starting sync run");

        let deadline = Instant::now() + Duration::from_secs(self.config.run_timeout_secs);

        let status = match self.reconcile(&mut run, cancel, deadline).await {
            Ok(true) if run.failed == 0 => RunStatus::Success,
            Ok(_) => RunStatus::PartialSuccess,
            Err(RunStop::Api(e)) => {
                error!(run_id = run.id, error = %e, attempt = e.attempt(), "Page fetch failed");
                run.last_error = serde_json::to_value(e.details()).ok();
                RunStatus::Failed
            }
            Err(RunStop::Database(e)) => {
                error!(run_id = run.id, error = %e, "Database failure during sync run");
                run.last_error = Some(json!({ "message": e.to_string() }));
                RunStatus::Failed
            }
            Err(RunStop::Interrupted(reason)) => {
                warn!(run_id = run.id, reason, "Sync run interrupted");
                run.last_error = Some(json!({ "message": reason }));
                RunStatus::Cancelled
            }
        };

        run.finalize(status);
        self.database.finish_run(&run).await?;

        info!(
            run_id = run.id,
            status = %run.status,
            created = run.created,
            updated = run.updated,
            skipped = run.skipped,
            failed = run.failed,
            "Sync run finished"
        );

        Ok(run)
    }

    /// Page loop; `Ok(false)` means a kind was cut off by the page limit
    async fn reconcile(
        &self,
        run: &mut SyncRun,
        cancel: &CancellationToken,
        deadline: Instant,
    ) -> Result<bool, RunStop> {
        let updated_since = match run.mode {
            SyncMode::Full => None,
            SyncMode::Incremental => self
                .database
                .last_successful_watermark()
                .await
                .map_err(RunStop::Database)?,
        };

        let mut complete = true;

        for &kind in &self.config.kinds {
            let mut request = PageRequest::first(kind, updated_since, self.config.page_size);
            let mut pages = 0u32;

            loop {
                check_interrupted(cancel, deadline)?;

                let page = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(RunStop::Interrupted(CANCELLED)),
                    _ = tokio::time::sleep_until(deadline) => return Err(RunStop::Interrupted(TIMED_OUT)),
                    result = self.retry.execute(self.source.as_ref(), || self.source.fetch_page(&request)) => {
                        result.map_err(RunStop::Api)?
                    }
                };
                pages += 1;

                debug!(
                    run_id = run.id,
                    kind = %kind,
                    page = pages,
                    records = page.records.len(),
                    "Fetched page"
                );

                for value in &page.records {
                    check_interrupted(cancel, deadline)?;
                    self.reconcile_record(run, kind, value).await;
                }

                match page.next {
                    Some(cursor) if pages < self.config.max_pages => request = request.next(cursor),
                    Some(_) => {
                        warn!(
                            run_id = run.id,
                            kind = %kind,
                            max_pages = self.config.max_pages,
                            "Page limit reached, remaining pages left for the next run"
                        );
                        if run.errors.len() < MAX_RUN_ERRORS {
                            run.errors.push(format!(
                                "{}: page limit of {} reached",
                                kind, self.config.max_pages
                            ));
                        }
                        complete = false;
                        break;
                    }
                    None => break,
                }
            }
        }

        Ok(complete)
    }

    async fn reconcile_record(&self, run: &mut SyncRun, kind: RecordKind, value: &Value) {
        let record = match MappedRecord::from_external(kind, value) {
            Ok(record) => record,
            Err(e) => {
                warn!(run_id = run.id, kind = %kind, error = %e, "Skipping unmappable record");
                run.record_failure(kind, None, e.to_string());
                return;
            }
        };

        match self.apply_record(&record).await {
            Ok(RecordOutcome::Created) => run.created += 1,
            Ok(RecordOutcome::Updated) => run.updated += 1,
            Ok(RecordOutcome::Skipped) => run.skipped += 1,
            Err(e) => {
                warn!(
                    run_id = run.id,
                    kind = %kind,
                    remote_id = record.remote_id,
                    error = %e,
                    "Failed to persist record"
                );
                run.record_failure(kind, Some(record.remote_id), e.to_string());
            }
        }
    }

    async fn apply_record(&self, record: &MappedRecord) -> Result<RecordOutcome, DbError> {
        let existing = self
            .database
            .get_record(record.kind, record.remote_id)
            .await?;

        match existing {
            None => {
                self.database.insert_pending_record(record).await?;
                self.save_or_mark_failed(record).await?;
                Ok(RecordOutcome::Created)
            }
            Some(local) if record.is_unchanged_from(&local) => {
                self.database
                    .set_record_status(
                        record.kind,
                        record.remote_id,
                        RecordSyncStatus::Skipped,
                        None,
                    )
                    .await?;
                Ok(RecordOutcome::Skipped)
            }
            Some(_) => {
                self.database
                    .set_record_status(
                        record.kind,
                        record.remote_id,
                        RecordSyncStatus::Running,
                        None,
                    )
                    .await?;
                self.save_or_mark_failed(record).await?;
                Ok(RecordOutcome::Updated)
            }
        }
    }

    async fn save_or_mark_failed(&self, record: &MappedRecord) -> Result<(), DbError> {
        if let Err(e) = self.database.save_record(record, Utc::now()).await {
            if let Err(mark_err) = self
                .database
                .set_record_status(
                    record.kind,
                    record.remote_id,
                    RecordSyncStatus::Failed,
                    Some(e.to_string()),
                )
                .await
            {
                warn!(remote_id = record.remote_id, error = %mark_err, "Failed to mark record as failed");
            }
            return Err(e);
        }
        Ok(())
    }
}

/// Lock owner for one acquisition
fn lock_owner(node_id: &str) -> String {
    format!("{}:{:016x}", node_id, rand::random::<u64>())
}

fn check_interrupted(cancel: &CancellationToken, deadline: Instant) -> Result<(), RunStop> {
    if cancel.is_cancelled() {
        return Err(RunStop::Interrupted(CANCELLED));
    }
    if Instant::now() >= deadline {
        return Err(RunStop::Interrupted(TIMED_OUT));
    }
    Ok(())
}

#[async_trait]
impl<D, S> Syncable for SyncReconciler<D, S>
where
    D: Database + 'static,
    S: RemoteSource + 'static,
{
    fn name(&self) -> &str {
        "sipp"
    }

    async fn sync(&self, mode: SyncMode, cancel: CancellationToken) -> Result<SyncRun, SyncError> {
        self.run_sync(mode, cancel).await
    }
}
