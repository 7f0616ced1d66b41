//! Common test utilities and helpers for integration tests

#![allow(dead_code)]

use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::RwLock;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use sipp_sync::config::{RetryConfig, SippConfig};
use sipp_sync::database::SqliteDatabase;
use sipp_sync::server::AppState;
use sipp_sync::sync::{
    ManualSyncHandle, ReconcilerConfig, RemoteSource, RetryManager, SchedulerStatus, SippClient,
    SyncReconciler,
};

pub type TestReconciler = SyncReconciler<SqliteDatabase, SippClient>;

/// Create an in-memory database for testing
pub async fn create_test_database() -> Arc<SqliteDatabase> {
    Arc::new(
        SqliteDatabase::in_memory()
            .await
            .expect("Failed to create test database"),
    )
}

/// SIPP client settings pointing at a mock server, with a static token
pub fn sipp_config(base_url: &str) -> SippConfig {
    SippConfig {
        base_url: base_url.to_string(),
        api_token: Some("test-token".to_string()),
        min_interval_ms: 0,
        request_timeout_secs: 5,
        page_size: 2,
        ..Default::default()
    }
}

/// Retry settings with millisecond backoff
pub fn fast_retry_config() -> RetryConfig {
    RetryConfig {
        max_attempts: 3,
        initial_backoff_ms: 10,
        max_backoff_ms: 50,
        backoff_multiplier: 2.0,
        jitter: false,
        auth_refresh_consumes_attempt: true,
    }
}

/// Build a client and reconciler against the mock server
pub async fn create_reconciler(
    database: Arc<SqliteDatabase>,
    base_url: &str,
) -> (Arc<TestReconciler>, Arc<SippClient>) {
    let config = sipp_config(base_url);
    let client = Arc::new(SippClient::new(config.clone()).expect("Failed to create client"));

    let reconciler_config = ReconcilerConfig {
        page_size: config.page_size,
        node_id: "test-node".to_string(),
        ..Default::default()
    };

    let reconciler = Arc::new(SyncReconciler::new(
        database,
        Arc::clone(&client),
        RetryManager::new(fast_retry_config()),
        reconciler_config,
    ));

    (reconciler, client)
}

/// A SIPP case payload
pub fn case(id: i64, number: &str) -> Value {
    json!({
        "sipp_case_id": id,
        "nomor_perkara": number,
        "status": "Minutasi",
        "updated_at": "2026-10-01 09:30:00"
    })
}

/// A SIPP hearing schedule payload
pub fn schedule(id: i64, case_id: i64) -> Value {
    json!({
        "sipp_schedule_id": id,
        "sipp_case_id": case_id,
        "tanggal_sidang": "2026-11-02",
        "agenda": "Pembacaan putusan"
    })
}

/// Serve `pages` of cases using `page` query parameters
pub async fn mount_case_pages(server: &MockServer, pages: Vec<Vec<Value>>) {
    let last_page = pages.len();

    // Later pages are mounted with a higher priority than the first page,
    // which is requested without a page parameter
    for (index, records) in pages.into_iter().enumerate() {
        let body = json!({
            "data": records,
            "meta": { "current_page": index + 1, "last_page": last_page }
        });

        if index == 0 {
            Mock::given(method("GET"))
                .and(path("/api/v1/cases"))
                .respond_with(ResponseTemplate::new(200).set_body_json(body))
                .with_priority(10)
                .mount(server)
                .await;
        } else {
            Mock::given(method("GET"))
                .and(path("/api/v1/cases"))
                .and(query_param("page", (index + 1).to_string()))
                .respond_with(ResponseTemplate::new(200).set_body_json(body))
                .with_priority(1)
                .mount(server)
                .await;
        }
    }
}

/// Serve a single page of schedules
pub async fn mount_schedules(server: &MockServer, records: Vec<Value>) {
    Mock::given(method("GET"))
        .and(path("/api/v1/schedules"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": records })))
        .mount(server)
        .await;
}

/// Create a test application state
pub fn create_test_state(
    database: Arc<SqliteDatabase>,
    source: Arc<dyn RemoteSource>,
    sync_handle: Option<ManualSyncHandle>,
    scheduler_status: Arc<RwLock<SchedulerStatus>>,
) -> AppState<SqliteDatabase> {
    AppState {
        database,
        source,
        sync_handle,
        scheduler_status,
    }
}

/// Run a test server in the background and return the address
/// The server will be shut down when the returned shutdown sender is dropped or sent
pub async fn run_test_server(
    state: AppState<SqliteDatabase>,
) -> (std::net::SocketAddr, tokio::sync::oneshot::Sender<()>) {
    use tokio::net::TcpListener;

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind test server");
    let addr = listener.local_addr().expect("Failed to get local address");

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();

    let app = sipp_sync::server::build_router(state)
        .layer(tower_http::trace::TraceLayer::new_for_http());

    tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .expect("Server error");
    });

    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    (addr, shutdown_tx)
}
