//! Local projections of SIPP case and schedule records
//!
//! This module defines the record kinds, per-record sync status, and the
//! mapping from raw SIPP payloads to local records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::SyncError;

/// Kind of record pulled from SIPP
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    /// Court case (perkara)
    Case,
    /// Hearing schedule (jadwal sidang)
    Schedule,
}

impl RecordKind {
    /// All kinds, in sync order
    pub const ALL: [RecordKind; 2] = [RecordKind::Case, RecordKind::Schedule];

    /// Field that carries the remote identifier in the SIPP payload
    pub fn id_field(&self) -> &'static str {
        match self {
            RecordKind::Case => "sipp_case_id",
            RecordKind::Schedule => "sipp_schedule_id",
        }
    }
}

impl std::fmt::Display for RecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordKind::Case => write!(f, "case"),
            RecordKind::Schedule => write!(f, "schedule"),
        }
    }
}

impl std::str::FromStr for RecordKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "case" | "cases" => Ok(RecordKind::Case),
            "schedule" | "schedules" => Ok(RecordKind::Schedule),
            _ => Err(format!("Invalid record kind: {}", s)),
        }
    }
}

/// Lifecycle state of a local record
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordSyncStatus {
    /// Created locally, not yet persisted with its payload
    #[default]
    Pending,
    /// Update in progress
    Running,
    /// Payload persisted; `last_synced_at` is set
    Synced,
    /// Last persistence attempt failed
    Failed,
    /// Last run saw no change
    Skipped,
}

impl std::fmt::Display for RecordSyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordSyncStatus::Pending => write!(f, "pending"),
            RecordSyncStatus::Running => write!(f, "running"),
            RecordSyncStatus::Synced => write!(f, "synced"),
            RecordSyncStatus::Failed => write!(f, "failed"),
            RecordSyncStatus::Skipped => write!(f, "skipped"),
        }
    }
}

impl std::str::FromStr for RecordSyncStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(RecordSyncStatus::Pending),
            "running" => Ok(RecordSyncStatus::Running),
            "synced" => Ok(RecordSyncStatus::Synced),
            "failed" => Ok(RecordSyncStatus::Failed),
            "skipped" => Ok(RecordSyncStatus::Skipped),
            _ => Err(format!("Invalid sync status: {}", s)),
        }
    }
}

/// Local record as stored in the database
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalRecord {
    pub kind: RecordKind,

    /// Remote numeric identifier (`sipp_case_id` / `sipp_schedule_id`)
    pub remote_id: i64,

    /// Case number, when the payload carries one
    pub case_number: Option<String>,

    /// Last persisted payload
    pub payload: Value,

    /// Hex SHA-256 of the canonical payload; empty until first persisted
    pub content_hash: String,

    /// Upstream modification time, when the payload carries one
    pub remote_updated_at: Option<DateTime<Utc>>,

    pub sync_status: RecordSyncStatus,

    /// Set whenever the payload is persisted, never on skip
    pub last_synced_at: Option<DateTime<Utc>>,

    /// Error of the last failed persistence attempt
    pub last_error: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A fetched SIPP record mapped to the local shape
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappedRecord {
    pub kind: RecordKind,
    pub remote_id: i64,
    pub case_number: Option<String>,
    pub remote_updated_at: Option<DateTime<Utc>>,
    pub payload: Value,
    pub content_hash: String,
}

impl MappedRecord {
    /// Map a raw SIPP payload
    ///
    /// The remote identifier may be a JSON number or a numeric string.
    pub fn from_external(kind: RecordKind, value: &Value) -> Result<Self, SyncError> {
        let object = value.as_object().ok_or_else(|| {
            SyncError::InvalidRecord(format!("{} payload is not a JSON object", kind))
        })?;

        let id_field = kind.id_field();
        let remote_id = match object.get(id_field) {
            Some(Value::Number(n)) => n.as_i64(),
            Some(Value::String(s)) => s.trim().parse().ok(),
            _ => None,
        }
        .ok_or_else(|| {
            SyncError::InvalidRecord(format!("{} payload has no numeric {}", kind, id_field))
        })?;

        let case_number = ["case_number", "nomor_perkara"]
            .iter()
            .find_map(|field| object.get(*field).and_then(Value::as_str))
            .map(String::from);

        let remote_updated_at = object
            .get("updated_at")
            .and_then(Value::as_str)
            .and_then(parse_remote_timestamp);

        Ok(Self {
            kind,
            remote_id,
            case_number,
            remote_updated_at,
            content_hash: content_hash(value),
            payload: value.clone(),
        })
    }

    /// True when the local record already holds this exact content
    pub fn is_unchanged_from(&self, local: &LocalRecord) -> bool {
        !local.content_hash.is_empty() && local.content_hash == self.content_hash
    }
}

/// Hex SHA-256 of the canonical JSON encoding (object keys sorted)
pub fn content_hash(value: &Value) -> String {
    let canonical = canonicalize(value).to_string();
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let sorted = keys
                .into_iter()
                .map(|k| (k.clone(), canonicalize(&map[k])))
                .collect::<serde_json::Map<_, _>>();
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// SIPP emits either RFC 3339 or `YYYY-MM-DD HH:MM:SS` (treated as UTC)
fn parse_remote_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|| {
            chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
                .ok()
                .map(|dt| dt.and_utc())
        })
}
