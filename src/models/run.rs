//! Sync run audit records
//!
//! A [`SyncRun`] is created when a reconciliation starts and finalized once,
//! with aggregate counts and a terminal status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::RecordKind;

/// Per-record error messages kept on a run
pub const MAX_RUN_ERRORS: usize = 50;

/// Which slice of the remote set a run fetches
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Records changed since the last successful watermark
    #[default]
    Incremental,
    /// The entire remote set
    Full,
}

impl std::fmt::Display for SyncMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncMode::Incremental => write!(f, "incremental"),
            SyncMode::Full => write!(f, "full"),
        }
    }
}

impl std::str::FromStr for SyncMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "incremental" => Ok(SyncMode::Incremental),
            "full" => Ok(SyncMode::Full),
            _ => Err(format!("Invalid sync mode: {}", s)),
        }
    }
}

/// Status of a sync run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Not finalized yet
    #[default]
    Running,
    /// Every record reconciled
    Success,
    /// Completed, with at least one failed record
    PartialSuccess,
    /// A page fetch or the store failed; earlier records stay committed
    Failed,
    /// Cancelled or timed out
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Running => write!(f, "running"),
            RunStatus::Success => write!(f, "success"),
            RunStatus::PartialSuccess => write!(f, "partial_success"),
            RunStatus::Failed => write!(f, "failed"),
            RunStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "running" => Ok(RunStatus::Running),
            "success" => Ok(RunStatus::Success),
            "partial_success" => Ok(RunStatus::PartialSuccess),
            "failed" => Ok(RunStatus::Failed),
            "cancelled" => Ok(RunStatus::Cancelled),
            _ => Err(format!("Invalid run status: {}", s)),
        }
    }
}

/// Audit record of one sync invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRun {
    /// Database ID (0 until created)
    pub id: i64,

    pub mode: SyncMode,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,

    pub created: u64,
    pub updated: u64,
    pub skipped: u64,
    pub failed: u64,

    /// Start time of the run, stored only when it succeeded
    pub watermark: Option<DateTime<Utc>>,

    /// Structured form of the last error seen by the run
    pub last_error: Option<Value>,

    /// Per-record error messages, capped at [`MAX_RUN_ERRORS`]
    pub errors: Vec<String>,
}

impl SyncRun {
    /// Create a running sync run starting now
    pub fn new(mode: SyncMode) -> Self {
        Self {
            id: 0,
            mode,
            status: RunStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
            created: 0,
            updated: 0,
            skipped: 0,
            failed: 0,
            watermark: None,
            last_error: None,
            errors: Vec::new(),
        }
    }

    /// Total records the run touched
    pub fn total_processed(&self) -> u64 {
        self.created + self.updated + self.skipped + self.failed
    }

    /// Count a failed record and keep its error
    pub fn record_failure(&mut self, kind: RecordKind, remote_id: Option<i64>, message: String) {
        self.failed += 1;
        self.last_error = Some(serde_json::json!({
            "message": message,
            "kind": kind,
            "remote_id": remote_id,
        }));

        if self.errors.len() < MAX_RUN_ERRORS {
            let entry = match remote_id {
                Some(id) => format!("{} {}: {}", kind, id, message),
                None => format!("{}: {}", kind, message),
            };
            self.errors.push(entry);
        }
    }

    /// Set the terminal status; the watermark is only kept for successful runs
    pub fn finalize(&mut self, status: RunStatus) {
        self.status = status;
        self.finished_at = Some(Utc::now());
        self.watermark = match status {
            RunStatus::Success => Some(self.started_at),
            _ => None,
        };
    }
}
