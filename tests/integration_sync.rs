//! Sync integration tests
//!
//! Runs the reconciler against a mock SIPP server and an in-memory store:
//! - Full and incremental runs over paginated listings
//! - Retry behaviour for rate limits, server errors and rejected tokens
//! - The single-run lock

mod common;

use std::sync::Arc;

use serde_json::json;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use common::{
    case, create_reconciler, create_test_database, fast_retry_config, mount_case_pages,
    mount_schedules, schedule, sipp_config,
};
use sipp_sync::config::SippConfig;
use sipp_sync::database::Database;
use sipp_sync::error::SyncError;
use sipp_sync::models::{RecordKind, RecordSyncStatus, RunStatus, SyncMode};
use sipp_sync::sync::{
    ReconcilerConfig, RemoteSource, RetryManager, SippClient, SyncReconciler, SYNC_LOCK_NAME,
};

/// Test 1: A full run walks every page of every kind
#[tokio::test]
async fn test_full_sync_creates_records() {
    let server = MockServer::start().await;
    mount_case_pages(
        &server,
        vec![
            vec![case(1, "1/Pdt.G/2026/PN Jkt"), case(2, "2/Pdt.G/2026/PN Jkt")],
            vec![case(3, "3/Pid.B/2026/PN Jkt")],
        ],
    )
    .await;
    mount_schedules(&server, vec![schedule(10, 1)]).await;

    let database = create_test_database().await;
    let (reconciler, _client) = create_reconciler(Arc::clone(&database), &server.uri()).await;

    let run = reconciler
        .run_sync(SyncMode::Full, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Success);
    assert_eq!(run.created, 4);
    assert_eq!(run.failed, 0);
    assert!(run.watermark.is_some());

    let stored = database.get_record(RecordKind::Case, 3).await.unwrap().unwrap();
    assert_eq!(stored.sync_status, RecordSyncStatus::Synced);
    assert_eq!(stored.case_number.as_deref(), Some("3/Pid.B/2026/PN Jkt"));
    assert!(stored.last_synced_at.is_some());

    let schedule = database
        .get_record(RecordKind::Schedule, 10)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(schedule.payload["agenda"], "Pembacaan putusan");

    let persisted = database.get_run(run.id).await.unwrap().unwrap();
    assert_eq!(persisted.status, RunStatus::Success);
    assert_eq!(persisted.created, 4);
}

/// Test 2: Re-running over unchanged data only skips, then incremental runs send the watermark
#[tokio::test]
async fn test_rerun_is_idempotent_and_incremental_uses_watermark() {
    let server = MockServer::start().await;
    mount_case_pages(&server, vec![vec![case(1, "1/Pdt.G/2026/PN Jkt")]]).await;
    mount_schedules(&server, vec![schedule(10, 1)]).await;

    let database = create_test_database().await;
    let (reconciler, _client) = create_reconciler(Arc::clone(&database), &server.uri()).await;

    let first = reconciler
        .run_sync(SyncMode::Full, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(first.created, 2);

    let before = database.get_record(RecordKind::Case, 1).await.unwrap().unwrap();

    let second = reconciler
        .run_sync(SyncMode::Incremental, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(second.status, RunStatus::Success);
    assert_eq!(second.created, 0);
    assert_eq!(second.updated, 0);
    assert_eq!(second.skipped, 2);

    // Skipping never touches last_synced_at
    let after = database.get_record(RecordKind::Case, 1).await.unwrap().unwrap();
    assert_eq!(after.last_synced_at, before.last_synced_at);
    assert_eq!(after.sync_status, RecordSyncStatus::Skipped);

    let requests = server.received_requests().await.unwrap();
    let incremental_requests = requests
        .iter()
        .filter(|r| r.url.query().unwrap_or("").contains("updated_since"))
        .count();
    // One request per kind in the incremental run
    assert_eq!(incremental_requests, 2);
}

/// Test 3: Changed payloads are updated in place
#[tokio::test]
async fn test_changed_record_is_updated() {
    let server = MockServer::start().await;
    mount_case_pages(&server, vec![vec![case(1, "1/Pdt.G/2026/PN Jkt")]]).await;
    mount_schedules(&server, vec![]).await;

    let database = create_test_database().await;
    let (reconciler, client) = create_reconciler(Arc::clone(&database), &server.uri()).await;

    reconciler
        .run_sync(SyncMode::Full, CancellationToken::new())
        .await
        .unwrap();

    server.reset().await;
    let mut changed = case(1, "1/Pdt.G/2026/PN Jkt");
    changed["status"] = json!("Putusan");
    mount_case_pages(&server, vec![vec![changed, case(2, "2/Pdt.G/2026/PN Jkt")]]).await;
    mount_schedules(&server, vec![]).await;
    // Cached pages must not hide the new listing
    client.clear_cache().await;

    let run = reconciler
        .run_sync(SyncMode::Full, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Success);
    assert_eq!(run.updated, 1);
    assert_eq!(run.created, 1);

    let stored = database.get_record(RecordKind::Case, 1).await.unwrap().unwrap();
    assert_eq!(stored.payload["status"], "Putusan");
    assert_eq!(stored.sync_status, RecordSyncStatus::Synced);
}

/// Test 4: A rate limited page is retried after the server-given delay
#[tokio::test]
async fn test_rate_limited_page_is_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/cases"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "1"))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    mount_case_pages(&server, vec![vec![case(1, "1/Pdt.G/2026/PN Jkt")]]).await;
    mount_schedules(&server, vec![]).await;

    let database = create_test_database().await;
    let (reconciler, _client) = create_reconciler(Arc::clone(&database), &server.uri()).await;

    let run = reconciler
        .run_sync(SyncMode::Full, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Success);
    assert_eq!(run.created, 1);

    let case_requests = server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|r| r.url.path() == "/api/v1/cases")
        .count();
    assert_eq!(case_requests, 2);
}

/// Test 5: Persistent server errors fail the run after the attempt budget
#[tokio::test]
async fn test_server_errors_fail_run() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/cases"))
        .respond_with(
            ResponseTemplate::new(503).set_body_json(json!({ "message": "Sedang pemeliharaan" })),
        )
        .expect(3)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/schedules"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": [] })))
        .expect(0)
        .mount(&server)
        .await;

    let database = create_test_database().await;
    let (reconciler, _client) = create_reconciler(Arc::clone(&database), &server.uri()).await;

    let run = reconciler
        .run_sync(SyncMode::Full, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.watermark.is_none());

    let last_error = run.last_error.unwrap();
    assert_eq!(last_error["code"], 503);
    assert_eq!(last_error["attempt"], 3);
    assert_eq!(last_error["max_attempts"], 3);
    assert_eq!(last_error["has_retries_left"], false);
    assert_eq!(
        last_error["message"],
        "API failure (HTTP 503): Sedang pemeliharaan"
    );

    assert!(database.last_successful_watermark().await.unwrap().is_none());
}

/// Test 6: A rejected static token is never resent
#[tokio::test]
async fn test_rejected_static_token_fails_run() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/cases"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({ "message": "Token expired" })))
        .expect(1)
        .mount(&server)
        .await;

    let database = create_test_database().await;
    let (reconciler, _client) = create_reconciler(Arc::clone(&database), &server.uri()).await;

    let run = reconciler
        .run_sync(SyncMode::Incremental, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Failed);
    let last_error = run.last_error.unwrap();
    assert_eq!(last_error["code"], 401);
    assert_eq!(last_error["attempt"], 1);

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
}

/// Test 7: One bad payload makes the run partial and keeps the watermark
#[tokio::test]
async fn test_bad_payload_is_partial_success() {
    let server = MockServer::start().await;
    mount_case_pages(
        &server,
        vec![vec![case(1, "1/Pdt.G/2026/PN Jkt"), json!({ "nomor_perkara": "no id" })]],
    )
    .await;
    mount_schedules(&server, vec![schedule(10, 1)]).await;

    let database = create_test_database().await;
    let (reconciler, _client) = create_reconciler(Arc::clone(&database), &server.uri()).await;

    let run = reconciler
        .run_sync(SyncMode::Full, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::PartialSuccess);
    assert_eq!(run.created, 2);
    assert_eq!(run.failed, 1);
    assert_eq!(run.errors.len(), 1);
    assert!(run.watermark.is_none());
    assert!(database.last_successful_watermark().await.unwrap().is_none());
}

/// Test 8: A lock held by another node blocks the run until released
#[tokio::test]
async fn test_lock_held_elsewhere() {
    let server = MockServer::start().await;
    mount_case_pages(&server, vec![vec![case(1, "1/Pdt.G/2026/PN Jkt")]]).await;
    mount_schedules(&server, vec![]).await;

    let database = create_test_database().await;
    let (reconciler, _client) = create_reconciler(Arc::clone(&database), &server.uri()).await;

    assert!(database
        .try_acquire_lock(SYNC_LOCK_NAME, "other-node", 600)
        .await
        .unwrap());

    let result = reconciler
        .run_sync(SyncMode::Full, CancellationToken::new())
        .await;
    assert!(matches!(result, Err(SyncError::AlreadyRunning)));
    assert!(database.last_run().await.unwrap().is_none());

    database
        .release_lock(SYNC_LOCK_NAME, "other-node")
        .await
        .unwrap();

    let run = reconciler
        .run_sync(SyncMode::Full, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Success);

    // The run released its own lock
    assert!(database
        .try_acquire_lock(SYNC_LOCK_NAME, "other-node", 600)
        .await
        .unwrap());
}

/// Test 9: A rejected login token is refreshed once, then the run fails
#[tokio::test]
async fn test_rejected_login_token_is_refreshed_once() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/auth/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "token": "login-token" })))
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/cases"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({ "message": "Token expired" })))
        .expect(2)
        .mount(&server)
        .await;

    let config = SippConfig {
        api_token: None,
        username: Some("operator".to_string()),
        password: Some("rahasia".to_string()),
        ..sipp_config(&server.uri())
    };
    let client = Arc::new(SippClient::new(config).unwrap());
    let reconciler = SyncReconciler::new(
        create_test_database().await,
        client,
        RetryManager::new(fast_retry_config()),
        ReconcilerConfig {
            node_id: "test-node".to_string(),
            ..Default::default()
        },
    );

    let run = reconciler
        .run_sync(SyncMode::Full, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Failed);
    let last_error = run.last_error.unwrap();
    assert_eq!(last_error["code"], 401);
    assert_eq!(last_error["attempt"], 2);
}
