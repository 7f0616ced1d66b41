//! SQLite implementation of the Database trait
//!
//! This module provides a SQLite-based implementation of the Database trait
//! using rusqlite and tokio-rusqlite for async operations.

use async_trait::async_trait;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{OptionalExtension, Row};
use serde_json::Value;
use tokio_rusqlite::Connection;

use super::migrations::{migration_version, CREATE_SCHEMA};
use super::{Database, StatusCount};
use crate::error::DbError;
use crate::models::{LocalRecord, MappedRecord, RecordKind, RecordSyncStatus, RunStatus, SyncRun};

const RECORD_COLUMNS: &str = "kind, remote_id, case_number, payload, content_hash, \
     remote_updated_at, sync_status, last_synced_at, last_error, created_at, updated_at";

const RUN_COLUMNS: &str = "id, mode, status, started_at, finished_at, created_count, \
     updated_count, skipped_count, failed_count, watermark, last_error, errors";

/// SQLite database implementation
pub struct SqliteDatabase {
    conn: Connection,
}

impl SqliteDatabase {
    /// Create a new SQLite database connection
    ///
    /// Use `:memory:` for in-memory database or a file path for persistent storage.
    pub async fn new(path: &str) -> Result<Self, DbError> {
        let conn = Connection::open(path).await?;

        // Run migrations
        conn.call(|conn| {
            conn.execute_batch(CREATE_SCHEMA)?;
            conn.pragma_update(None, "user_version", migration_version())?;
            Ok(())
        })
        .await?;

        Ok(Self { conn })
    }

    /// Create a new in-memory database (useful for testing)
    pub async fn in_memory() -> Result<Self, DbError> {
        Self::new(":memory:").await
    }
}

#[async_trait]
impl Database for SqliteDatabase {
    // =========================================================================
    // Record operations
    // =========================================================================

    async fn get_record(
        &self,
        kind: RecordKind,
        remote_id: i64,
    ) -> Result<Option<LocalRecord>, DbError> {
        let kind = kind.to_string();

        self.conn
            .call(move |conn| {
                let sql = format!(
                    "SELECT {} FROM sipp_records WHERE kind = ?1 AND remote_id = ?2",
                    RECORD_COLUMNS
                );
                let mut stmt = conn.prepare(&sql)?;

                let record = stmt
                    .query_row(rusqlite::params![kind, remote_id], record_from_row)
                    .optional()?;

                Ok(record)
            })
            .await
            .map_err(Into::into)
    }

    async fn insert_pending_record(&self, record: &MappedRecord) -> Result<(), DbError> {
        let kind = record.kind.to_string();
        let remote_id = record.remote_id;
        let case_number = record.case_number.clone();
        let remote_updated_at = record.remote_updated_at.map(format_datetime);
        let now = format_datetime(Utc::now());

        self.conn
            .call(move |conn| {
                conn.execute(
                    r#"
                    INSERT INTO sipp_records
                    (kind, remote_id, case_number, remote_updated_at, sync_status, created_at, updated_at)
                    VALUES (?1, ?2, ?3, ?4, 'pending', ?5, ?5)
                    "#,
                    rusqlite::params![kind, remote_id, case_number, remote_updated_at, now],
                )?;
                Ok(())
            })
            .await?;

        Ok(())
    }

    async fn save_record(
        &self,
        record: &MappedRecord,
        synced_at: DateTime<Utc>,
    ) -> Result<(), DbError> {
        let kind = record.kind.to_string();
        let remote_id = record.remote_id;
        let case_number = record.case_number.clone();
        let payload = serde_json::to_string(&record.payload)
            .map_err(|e| DbError::Serialization(e.to_string()))?;
        let content_hash = record.content_hash.clone();
        let remote_updated_at = record.remote_updated_at.map(format_datetime);
        let synced_at = format_datetime(synced_at);

        let rows_affected = self
            .conn
            .call(move |conn| {
                let count = conn.execute(
                    r#"
                    UPDATE sipp_records
                    SET case_number = ?3, payload = ?4, content_hash = ?5, remote_updated_at = ?6,
                        sync_status = 'synced', last_synced_at = ?7, last_error = NULL, updated_at = ?7
                    WHERE kind = ?1 AND remote_id = ?2
                    "#,
                    rusqlite::params![
                        kind,
                        remote_id,
                        case_number,
                        payload,
                        content_hash,
                        remote_updated_at,
                        synced_at
                    ],
                )?;
                Ok(count)
            })
            .await?;

        if rows_affected == 0 {
            return Err(DbError::NotFound);
        }

        Ok(())
    }

    async fn set_record_status(
        &self,
        kind: RecordKind,
        remote_id: i64,
        status: RecordSyncStatus,
        error: Option<String>,
    ) -> Result<(), DbError> {
        let kind = kind.to_string();
        let status = status.to_string();
        let now = format_datetime(Utc::now());

        let rows_affected = self
            .conn
            .call(move |conn| {
                let count = conn.execute(
                    r#"
                    UPDATE sipp_records
                    SET sync_status = ?3, last_error = ?4, updated_at = ?5
                    WHERE kind = ?1 AND remote_id = ?2
                    "#,
                    rusqlite::params![kind, remote_id, status, error, now],
                )?;
                Ok(count)
            })
            .await?;

        if rows_affected == 0 {
            return Err(DbError::NotFound);
        }

        Ok(())
    }

    async fn list_records_by_status(
        &self,
        kind: Option<RecordKind>,
        status: RecordSyncStatus,
        limit: u32,
    ) -> Result<Vec<LocalRecord>, DbError> {
        let kind = kind.map(|k| k.to_string());
        let status = status.to_string();

        self.conn
            .call(move |conn| {
                let sql = format!(
                    r#"
                    SELECT {}
                    FROM sipp_records
                    WHERE sync_status = ?1 AND (?2 IS NULL OR kind = ?2)
                    ORDER BY updated_at DESC, remote_id
                    LIMIT ?3
                    "#,
                    RECORD_COLUMNS
                );
                let mut stmt = conn.prepare(&sql)?;

                let records = stmt
                    .query_map(rusqlite::params![status, kind, limit], record_from_row)?
                    .collect::<Result<Vec<_>, _>>()?;

                Ok(records)
            })
            .await
            .map_err(Into::into)
    }

    async fn count_records_by_status(&self) -> Result<Vec<StatusCount>, DbError> {
        self.conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    r#"
                    SELECT kind, sync_status, COUNT(*)
                    FROM sipp_records
                    GROUP BY kind, sync_status
                    ORDER BY kind, sync_status
                    "#,
                )?;

                let counts = stmt
                    .query_map([], |row| {
                        Ok(StatusCount {
                            kind: parse_column(row, 0)?,
                            status: parse_column(row, 1)?,
                            count: row.get::<_, i64>(2)? as u64,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;

                Ok(counts)
            })
            .await
            .map_err(Into::into)
    }

    // =========================================================================
    // Sync run operations
    // =========================================================================

    async fn create_run(&self, run: &SyncRun) -> Result<i64, DbError> {
        let mode = run.mode.to_string();
        let started_at = format_datetime(run.started_at);

        self.conn
            .call(move |conn| {
                conn.execute(
                    r#"
                    INSERT INTO sync_runs (mode, status, started_at)
                    VALUES (?1, 'running', ?2)
                    "#,
                    rusqlite::params![mode, started_at],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await
            .map_err(Into::into)
    }

    async fn finish_run(&self, run: &SyncRun) -> Result<(), DbError> {
        if !run.status.is_terminal() {
            return Err(DbError::ConstraintViolation(format!(
                "sync run {} cannot be finished as running",
                run.id
            )));
        }

        let id = run.id;
        let status = run.status.to_string();
        let finished_at = format_datetime(run.finished_at.unwrap_or_else(Utc::now));
        let counts = [run.created, run.updated, run.skipped, run.failed].map(|c| c as i64);
        let watermark = run.watermark.map(format_datetime);
        let last_error = run
            .last_error
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| DbError::Serialization(e.to_string()))?;
        let errors =
            serde_json::to_string(&run.errors).map_err(|e| DbError::Serialization(e.to_string()))?;

        let rows_affected = self
            .conn
            .call(move |conn| {
                let count = conn.execute(
                    r#"
                    UPDATE sync_runs
                    SET status = ?2, finished_at = ?3, created_count = ?4, updated_count = ?5,
                        skipped_count = ?6, failed_count = ?7, watermark = ?8, last_error = ?9, errors = ?10
                    WHERE id = ?1 AND status = 'running'
                    "#,
                    rusqlite::params![
                        id,
                        status,
                        finished_at,
                        counts[0],
                        counts[1],
                        counts[2],
                        counts[3],
                        watermark,
                        last_error,
                        errors
                    ],
                )?;
                Ok(count)
            })
            .await?;

        if rows_affected == 0 {
            return Err(DbError::ConstraintViolation(format!(
                "sync run {} is not running",
                id
            )));
        }

        Ok(())
    }

    async fn get_run(&self, id: i64) -> Result<Option<SyncRun>, DbError> {
        self.conn
            .call(move |conn| {
                let sql = format!("SELECT {} FROM sync_runs WHERE id = ?1", RUN_COLUMNS);
                let mut stmt = conn.prepare(&sql)?;

                let run = stmt.query_row([id], run_from_row).optional()?;

                Ok(run)
            })
            .await
            .map_err(Into::into)
    }

    async fn last_run(&self) -> Result<Option<SyncRun>, DbError> {
        self.conn
            .call(|conn| {
                let sql = format!("SELECT {} FROM sync_runs ORDER BY id DESC LIMIT 1", RUN_COLUMNS);
                let mut stmt = conn.prepare(&sql)?;

                let run = stmt.query_row([], run_from_row).optional()?;

                Ok(run)
            })
            .await
            .map_err(Into::into)
    }

    async fn list_runs(&self, limit: u32, offset: u32) -> Result<Vec<SyncRun>, DbError> {
        self.conn
            .call(move |conn| {
                let sql = format!(
                    "SELECT {} FROM sync_runs ORDER BY id DESC LIMIT ?1 OFFSET ?2",
                    RUN_COLUMNS
                );
                let mut stmt = conn.prepare(&sql)?;

                let runs = stmt
                    .query_map([limit, offset], run_from_row)?
                    .collect::<Result<Vec<_>, _>>()?;

                Ok(runs)
            })
            .await
            .map_err(Into::into)
    }

    async fn last_successful_watermark(&self) -> Result<Option<DateTime<Utc>>, DbError> {
        let watermark: Option<String> = self
            .conn
            .call(|conn| {
                let value = conn
                    .query_row(
                        r#"
                        SELECT watermark FROM sync_runs
                        WHERE status = 'success' AND watermark IS NOT NULL
                        ORDER BY id DESC
                        LIMIT 1
                        "#,
                        [],
                        |row| row.get(0),
                    )
                    .optional()?;
                Ok(value)
            })
            .await?;

        Ok(parse_datetime(watermark))
    }

    // =========================================================================
    // Run lock operations
    // =========================================================================

    async fn try_acquire_lock(
        &self,
        name: &str,
        owner: &str,
        ttl_secs: u64,
    ) -> Result<bool, DbError> {
        let name = name.to_string();
        let owner = owner.to_string();
        let now = Utc::now();
        let expires_at = format_datetime(now + Duration::seconds(ttl_secs as i64));
        let now = format_datetime(now);

        let rows_affected = self
            .conn
            .call(move |conn| {
                // Only an expired lease is taken over; owners are unique per acquisition
                let count = conn.execute(
                    r#"
                    INSERT INTO sync_locks (name, owner, acquired_at, expires_at)
                    VALUES (?1, ?2, ?3, ?4)
                    ON CONFLICT(name) DO UPDATE
                    SET owner = excluded.owner, acquired_at = excluded.acquired_at,
                        expires_at = excluded.expires_at
                    WHERE sync_locks.expires_at <= excluded.acquired_at
                    "#,
                    rusqlite::params![name, owner, now, expires_at],
                )?;
                Ok(count)
            })
            .await?;

        Ok(rows_affected == 1)
    }

    async fn release_lock(&self, name: &str, owner: &str) -> Result<(), DbError> {
        let name = name.to_string();
        let owner = owner.to_string();

        self.conn
            .call(move |conn| {
                conn.execute(
                    "DELETE FROM sync_locks WHERE name = ?1 AND owner = ?2",
                    rusqlite::params![name, owner],
                )?;
                Ok(())
            })
            .await?;

        Ok(())
    }
}

/// Format a datetime for storage; fixed precision keeps text comparisons ordered
fn format_datetime(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a datetime string to DateTime<Utc>
fn parse_datetime(s: Option<String>) -> Option<DateTime<Utc>> {
    s.and_then(|s| {
        DateTime::parse_from_rfc3339(&s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
            .or_else(|| {
                // Try parsing SQLite's datetime format
                chrono::NaiveDateTime::parse_from_str(&s, "%Y-%m-%d %H:%M:%S")
                    .ok()
                    .map(|dt| dt.and_utc())
            })
    })
}

/// Parse a text column through `FromStr`
fn parse_column<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = String>,
{
    let raw: String = row.get(idx)?;
    raw.parse()
        .map_err(|e: String| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
}

/// Parse a JSON text column
fn json_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Value>> {
    row.get::<_, Option<String>>(idx)?
        .map(|raw| serde_json::from_str(&raw))
        .transpose()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<LocalRecord> {
    Ok(LocalRecord {
        kind: parse_column(row, 0)?,
        remote_id: row.get(1)?,
        case_number: row.get(2)?,
        payload: json_column(row, 3)?.unwrap_or(Value::Null),
        content_hash: row.get(4)?,
        remote_updated_at: parse_datetime(row.get(5)?),
        sync_status: parse_column(row, 6)?,
        last_synced_at: parse_datetime(row.get(7)?),
        last_error: row.get(8)?,
        created_at: parse_datetime(row.get(9)?).unwrap_or_else(Utc::now),
        updated_at: parse_datetime(row.get(10)?).unwrap_or_else(Utc::now),
    })
}

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<SyncRun> {
    let errors = match json_column(row, 11)? {
        Some(value) => serde_json::from_value(value)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(11, Type::Text, Box::new(e)))?,
        None => Vec::new(),
    };

    Ok(SyncRun {
        id: row.get(0)?,
        mode: parse_column(row, 1)?,
        status: parse_column::<RunStatus>(row, 2)?,
        started_at: parse_datetime(row.get(3)?).unwrap_or_else(Utc::now),
        finished_at: parse_datetime(row.get(4)?),
        created: row.get::<_, i64>(5)? as u64,
        updated: row.get::<_, i64>(6)? as u64,
        skipped: row.get::<_, i64>(7)? as u64,
        failed: row.get::<_, i64>(8)? as u64,
        watermark: parse_datetime(row.get(9)?),
        last_error: json_column(row, 10)?,
        errors,
    })
}
