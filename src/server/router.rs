//! HTTP router for sipp-sync
//!
//! This module defines the axum router that handles all HTTP requests.
//! It provides routes for:
//! - Health checks
//! - Sync status, run history and record listings
//! - Manual sync triggers and cache clearing

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::database::{Database, StatusCount};
use crate::error::SyncError;
use crate::models::{LocalRecord, RecordKind, RecordSyncStatus, SyncMode, SyncRun};
use crate::sync::{ManualSyncHandle, RemoteSource, SchedulerStatus};

/// Default number of items per page for pagination
pub const DEFAULT_PAGE_LIMIT: u32 = 50;

/// Maximum number of items per page for pagination
pub const MAX_PAGE_LIMIT: u32 = 1000;

/// Shared application state
pub struct AppState<D: Database> {
    /// Database
    pub database: Arc<D>,

    /// SIPP client, for cache clearing
    pub source: Arc<dyn RemoteSource>,

    /// Manual sync trigger; `None` when no scheduler runs
    pub sync_handle: Option<ManualSyncHandle>,

    /// Scheduler state
    pub scheduler_status: Arc<RwLock<SchedulerStatus>>,
}

impl<D: Database> Clone for AppState<D> {
    fn clone(&self) -> Self {
        Self {
            database: Arc::clone(&self.database),
            source: Arc::clone(&self.source),
            sync_handle: self.sync_handle.clone(),
            scheduler_status: Arc::clone(&self.scheduler_status),
        }
    }
}

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Sync status response
#[derive(Debug, Serialize, Deserialize)]
pub struct SyncStatusResponse {
    /// Most recent run in the store
    pub last_run: Option<SyncRun>,
    pub scheduler: SchedulerStatus,
    /// Local record counts by kind and status
    pub records: Vec<StatusCount>,
}

/// Run history query parameters
#[derive(Debug, Clone, Deserialize, Default)]
pub struct HistoryQuery {
    /// Number of runs to return (default: 50)
    pub limit: Option<u32>,
    /// Offset for pagination (default: 0)
    pub offset: Option<u32>,
}

/// Run history response
#[derive(Debug, Serialize, Deserialize)]
pub struct HistoryResponse {
    pub runs: Vec<SyncRun>,
    pub limit: u32,
    pub offset: u32,
}

/// Record listing query parameters
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RecordsQuery {
    /// Record status (default: failed)
    pub status: Option<String>,
    pub kind: Option<String>,
    pub limit: Option<u32>,
}

/// Record listing response
#[derive(Debug, Serialize, Deserialize)]
pub struct RecordsResponse {
    pub records: Vec<LocalRecord>,
    pub count: usize,
}

/// Manual trigger query parameters
#[derive(Debug, Clone, Deserialize, Default)]
pub struct TriggerQuery {
    /// `incremental` (default) or `full`
    pub mode: Option<String>,
}

/// Build the main application router
///
/// # Arguments
///
/// * `state` - Application state containing the database and sync handles
///
/// # Returns
///
/// An axum Router configured with all endpoints
pub fn build_router<D: Database + 'static>(state: AppState<D>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/sync/status", get(api_sync_status_handler::<D>))
        .route("/api/sync/history", get(api_sync_history_handler::<D>))
        .route("/api/sync/records", get(api_sync_records_handler::<D>))
        .route("/api/sync/trigger", post(api_trigger_sync_handler::<D>))
        .route("/api/sync/cache", delete(api_cache_clear_handler::<D>))
        .with_state(state)
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({ "error": message.into() }))).into_response()
}

fn clamp_limit(limit: Option<u32>) -> u32 {
    limit.unwrap_or(DEFAULT_PAGE_LIMIT).clamp(1, MAX_PAGE_LIMIT)
}

// =============================================================================
// Health Handler
// =============================================================================

/// Health check endpoint handler
async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// =============================================================================
// Sync API Handlers
// =============================================================================

/// Sync status handler
async fn api_sync_status_handler<D: Database + 'static>(
    State(state): State<AppState<D>>,
) -> Response {
    let last_run = match state.database.last_run().await {
        Ok(run) => run,
        Err(e) => {
            tracing::error!(error = %e, "Failed to load last sync run");
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to load sync status",
            );
        }
    };

    let records = match state.database.count_records_by_status().await {
        Ok(counts) => counts,
        Err(e) => {
            tracing::error!(error = %e, "Failed to count records");
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to load sync status",
            );
        }
    };

    let scheduler = state.scheduler_status.read().await.clone();

    Json(SyncStatusResponse {
        last_run,
        scheduler,
        records,
    })
    .into_response()
}

/// Run history handler, newest first
async fn api_sync_history_handler<D: Database + 'static>(
    State(state): State<AppState<D>>,
    Query(query): Query<HistoryQuery>,
) -> Response {
    let limit = clamp_limit(query.limit);
    let offset = query.offset.unwrap_or(0);

    match state.database.list_runs(limit, offset).await {
        Ok(runs) => Json(HistoryResponse {
            runs,
            limit,
            offset,
        })
        .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Failed to list sync runs");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to list sync runs")
        }
    }
}

/// Local records by status
async fn api_sync_records_handler<D: Database + 'static>(
    State(state): State<AppState<D>>,
    Query(query): Query<RecordsQuery>,
) -> Response {
    let status = match query.status.as_deref() {
        None => RecordSyncStatus::Failed,
        Some(s) => match s.parse::<RecordSyncStatus>() {
            Ok(status) => status,
            Err(e) => return error_response(StatusCode::BAD_REQUEST, e),
        },
    };

    let kind = match query.kind.as_deref() {
        None => None,
        Some(k) => match k.parse::<RecordKind>() {
            Ok(kind) => Some(kind),
            Err(e) => return error_response(StatusCode::BAD_REQUEST, e),
        },
    };

    let limit = clamp_limit(query.limit);

    match state
        .database
        .list_records_by_status(kind, status, limit)
        .await
    {
        Ok(records) => {
            let count = records.len();
            Json(RecordsResponse { records, count }).into_response()
        }
        Err(e) => {
            tracing::error!(error = %e, status = %status, "Failed to list records");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to list records")
        }
    }
}

/// Queue a manual sync
///
/// Every accepted request queues one run.
async fn api_trigger_sync_handler<D: Database + 'static>(
    State(state): State<AppState<D>>,
    Query(query): Query<TriggerQuery>,
) -> Response {
    let mode = match query.mode.as_deref() {
        None => SyncMode::Incremental,
        Some(m) => match m.parse::<SyncMode>() {
            Ok(mode) => mode,
            Err(e) => return error_response(StatusCode::BAD_REQUEST, e),
        },
    };

    let Some(handle) = &state.sync_handle else {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "Scheduler not running");
    };

    match handle.enqueue(mode) {
        Ok(()) => {
            tracing::info!(mode = %mode, "Manual sync queued");
            (
                StatusCode::ACCEPTED,
                Json(serde_json::json!({
                    "message": "Sync queued",
                    "mode": mode
                })),
            )
                .into_response()
        }
        Err(SyncError::SchedulerUnavailable(reason)) => {
            tracing::warn!(reason = %reason, "Manual sync rejected");
            error_response(StatusCode::SERVICE_UNAVAILABLE, reason)
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to queue sync");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to queue sync")
        }
    }
}

/// Clear the client's page and token cache
async fn api_cache_clear_handler<D: Database + 'static>(
    State(state): State<AppState<D>>,
) -> impl IntoResponse {
    state.source.clear_cache().await;
    tracing::info!("SIPP client cache cleared via API");

    (
        StatusCode::OK,
        Json(serde_json::json!({ "message": "Cache cleared" })),
    )
}
