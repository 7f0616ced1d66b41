//! Domain models for sipp-sync
//!
//! This module contains the local record projections and the sync run audit model.

pub mod record;
pub mod run;

// Re-export commonly used types
pub use record::{content_hash, LocalRecord, MappedRecord, RecordKind, RecordSyncStatus};
pub use run::{RunStatus, SyncMode, SyncRun, MAX_RUN_ERRORS};
