//! Database migrations for sipp-sync
//!
//! This module contains SQL migrations for the SQLite database schema.
//! Timestamps are stored as RFC 3339 text in UTC.

/// SQL statement to create the initial database schema
pub const CREATE_SCHEMA: &str = r#"
-- Local projections of SIPP records
CREATE TABLE IF NOT EXISTS sipp_records (
    kind TEXT NOT NULL,
    remote_id INTEGER NOT NULL,
    case_number TEXT,
    payload TEXT NOT NULL DEFAULT '{}',
    content_hash TEXT NOT NULL DEFAULT '',
    remote_updated_at TEXT,
    sync_status TEXT NOT NULL DEFAULT 'pending',
    last_synced_at TEXT,
    last_error TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (kind, remote_id)
);

CREATE INDEX IF NOT EXISTS idx_records_status ON sipp_records(sync_status);

-- Sync run audit log
CREATE TABLE IF NOT EXISTS sync_runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    mode TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'running',
    started_at TEXT NOT NULL,
    finished_at TEXT,
    created_count INTEGER NOT NULL DEFAULT 0,
    updated_count INTEGER NOT NULL DEFAULT 0,
    skipped_count INTEGER NOT NULL DEFAULT 0,
    failed_count INTEGER NOT NULL DEFAULT 0,
    watermark TEXT,
    last_error TEXT,
    errors TEXT NOT NULL DEFAULT '[]'
);

CREATE INDEX IF NOT EXISTS idx_runs_status ON sync_runs(status, id DESC);

-- Single-run guarantee across nodes sharing the database
CREATE TABLE IF NOT EXISTS sync_locks (
    name TEXT PRIMARY KEY,
    owner TEXT NOT NULL,
    acquired_at TEXT NOT NULL,
    expires_at TEXT NOT NULL
);
"#;

/// Schema version, stored as `PRAGMA user_version`
pub fn migration_version() -> i32 {
    1
}
