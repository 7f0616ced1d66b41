//! Database layer for sipp-sync
//!
//! This module defines the database trait and SQLite implementation.

pub mod migrations;
pub mod sqlite;

pub use sqlite::SqliteDatabase;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DbError;
use crate::models::{LocalRecord, MappedRecord, RecordKind, RecordSyncStatus, SyncRun};

/// Number of local records per kind and status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCount {
    pub kind: RecordKind,
    pub status: RecordSyncStatus,
    pub count: u64,
}

/// Database trait for data persistence
///
/// This trait defines all database operations needed by the sync core.
/// It uses `async_trait` for async methods and `mockall::automock` for testing.
/// Every method is a single statement, so each record write is atomic on its own.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Database: Send + Sync {
    // =========================================================================
    // Record operations
    // =========================================================================

    /// Look up a local record by remote identifier
    async fn get_record(
        &self,
        kind: RecordKind,
        remote_id: i64,
    ) -> Result<Option<LocalRecord>, DbError>;

    /// Create the local row for a new remote identifier with status `pending`
    async fn insert_pending_record(&self, record: &MappedRecord) -> Result<(), DbError>;

    /// Persist the payload, set status `synced` and stamp `last_synced_at`
    async fn save_record(
        &self,
        record: &MappedRecord,
        synced_at: DateTime<Utc>,
    ) -> Result<(), DbError>;

    /// Transition the status only; `last_synced_at` is left untouched
    async fn set_record_status(
        &self,
        kind: RecordKind,
        remote_id: i64,
        status: RecordSyncStatus,
        error: Option<String>,
    ) -> Result<(), DbError>;

    /// List records with the given status, most recently updated first
    async fn list_records_by_status(
        &self,
        kind: Option<RecordKind>,
        status: RecordSyncStatus,
        limit: u32,
    ) -> Result<Vec<LocalRecord>, DbError>;

    /// Count records grouped by kind and status
    async fn count_records_by_status(&self) -> Result<Vec<StatusCount>, DbError>;

    // =========================================================================
    // Sync run operations
    // =========================================================================

    /// Insert a running sync run
    ///
    /// Returns the ID of the inserted run
    async fn create_run(&self, run: &SyncRun) -> Result<i64, DbError>;

    /// Finalize a run; a run that is no longer `running` cannot be changed
    async fn finish_run(&self, run: &SyncRun) -> Result<(), DbError>;

    /// Get a run by ID
    async fn get_run(&self, id: i64) -> Result<Option<SyncRun>, DbError>;

    /// Most recently started run
    async fn last_run(&self) -> Result<Option<SyncRun>, DbError>;

    /// Runs with pagination, newest first
    async fn list_runs(&self, limit: u32, offset: u32) -> Result<Vec<SyncRun>, DbError>;

    /// Watermark of the most recent successful run
    async fn last_successful_watermark(&self) -> Result<Option<DateTime<Utc>>, DbError>;

    // =========================================================================
    // Run lock operations
    // =========================================================================

    /// Take the named lock unless another owner holds an unexpired lease
    ///
    /// Returns true if the lock was acquired
    async fn try_acquire_lock(&self, name: &str, owner: &str, ttl_secs: u64)
        -> Result<bool, DbError>;

    /// Release the named lock if held by `owner`
    async fn release_lock(&self, name: &str, owner: &str) -> Result<(), DbError>;
}
