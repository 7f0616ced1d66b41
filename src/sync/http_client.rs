//! SIPP API client
//!
//! This module provides the HTTP client for the SIPP REST API with bearer
//! authentication, request interval control, conditional requests using
//! ETag headers, and classification of every failure into [`ApiError`].

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::header::{HeaderMap, ETAG, IF_NONE_MATCH, RETRY_AFTER};
use reqwest::{Client, StatusCode, Url};
use serde_json::{json, Value};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::SippConfig;
use crate::error::ApiError;
use crate::models::RecordKind;

/// Position of a page in a paginated listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageCursor {
    /// Opaque cursor returned by the upstream
    Cursor(String),
    /// 1-based page number
    Page(u32),
}

/// Request for one page of records
#[derive(Debug, Clone, PartialEq)]
pub struct PageRequest {
    pub kind: RecordKind,
    /// Only records changed after this instant; `None` fetches everything
    pub updated_since: Option<DateTime<Utc>>,
    /// `None` requests the first page
    pub cursor: Option<PageCursor>,
    pub page_size: u32,
}

impl PageRequest {
    /// Request for the first page
    pub fn first(kind: RecordKind, updated_since: Option<DateTime<Utc>>, page_size: u32) -> Self {
        Self {
            kind,
            updated_since,
            cursor: None,
            page_size,
        }
    }

    /// Same listing, positioned at `cursor`
    pub fn next(&self, cursor: PageCursor) -> Self {
        Self {
            cursor: Some(cursor),
            ..self.clone()
        }
    }

    /// Query parameters sent to the upstream
    pub fn query_params(&self) -> Vec<(&'static str, String)> {
        let mut params = vec![("per_page", self.page_size.to_string())];

        if let Some(since) = self.updated_since {
            params.push((
                "updated_since",
                since.to_rfc3339_opts(SecondsFormat::Secs, true),
            ));
        }

        match &self.cursor {
            Some(PageCursor::Cursor(cursor)) => params.push(("cursor", cursor.clone())),
            Some(PageCursor::Page(page)) => params.push(("page", page.to_string())),
            None => {}
        }

        params
    }
}

/// One decoded page of records
#[derive(Debug, Clone, PartialEq)]
pub struct ApiPage {
    pub records: Vec<Value>,
    /// Where the next page starts; `None` on the last page
    pub next: Option<PageCursor>,
}

/// Source of bearer tokens
///
/// The retry manager calls this once per operation to refresh an expired token.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Obtain a fresh token and cache it for subsequent requests
    async fn authenticate(&self) -> Result<String, ApiError>;

    /// Whether [`Self::authenticate`] can yield a different token
    fn can_refresh(&self) -> bool {
        true
    }
}

/// Paginated record listing on the SIPP side
#[async_trait]
pub trait RemoteSource: Authenticator {
    /// Fetch one page; each call is a single attempt
    async fn fetch_page(&self, request: &PageRequest) -> Result<ApiPage, ApiError>;

    /// Drop cached pages and the cached token
    async fn clear_cache(&self);
}

/// Last response seen for a request URL
#[derive(Debug, Clone)]
struct CachedPage {
    etag: String,
    body: Value,
}

/// HTTP client for the SIPP API
///
/// Features:
/// - Static bearer token or username/password login
/// - Minimum interval between requests
/// - ETag/If-None-Match support with a per-URL page cache
/// - Classification of HTTP and transport failures into [`ApiError`]
#[derive(Debug)]
pub struct SippClient {
    client: Client,
    config: SippConfig,
    token: RwLock<Option<String>>,
    page_cache: Mutex<HashMap<String, CachedPage>>,
    last_request: Mutex<Option<Instant>>,
}

impl SippClient {
    /// Create a new client with the configured request timeout
    pub fn new(config: SippConfig) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| ApiError::failure(None, format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            config,
            token: RwLock::new(None),
            page_cache: Mutex::new(HashMap::new()),
            last_request: Mutex::new(None),
        })
    }

    /// Get current configuration
    pub fn config(&self) -> &SippConfig {
        &self.config
    }

    /// Endpoint path for a record kind
    pub fn endpoint(&self, kind: RecordKind) -> &str {
        match kind {
            RecordKind::Case => &self.config.cases_endpoint,
            RecordKind::Schedule => &self.config.schedules_endpoint,
        }
    }

    /// GET `base_url + endpoint` and decode the page envelope
    ///
    /// A token is obtained first if none is cached. A 401 invalidates the
    /// cached token so the next authentication fetches a new one.
    pub async fn fetch(
        &self,
        endpoint: &str,
        params: &[(&str, String)],
    ) -> Result<ApiPage, ApiError> {
        let cached_token = self.token.read().await.clone();
        let token = match cached_token {
            Some(token) => token,
            None => self.authenticate().await?,
        };

        let url = Url::parse_with_params(&self.url(endpoint), params)
            .map_err(|e| ApiError::failure(None, format!("Invalid request URL: {}", e)))?;
        let cache_key = url.to_string();

        let cached_etag = self
            .page_cache
            .lock()
            .await
            .get(&cache_key)
            .map(|cached| cached.etag.clone());

        self.wait_for_rate_limit().await;

        debug!(url = %url, "Sending SIPP API request");

        let mut request = self.client.get(url).bearer_auth(&token);
        if let Some(etag) = &cached_etag {
            request = request.header(IF_NONE_MATCH, etag.as_str());
        }

        let response = request.send().await.map_err(transport_error)?;
        let status = response.status();

        if status == StatusCode::NOT_MODIFIED {
            if let Some(cached) = self.page_cache.lock().await.get(&cache_key) {
                debug!(url = %cache_key, "Page not modified (304), serving cached body");
                return parse_page(&cached.body, status);
            }
            return Err(ApiError::failure(
                Some(status.as_u16()),
                "Not modified, but no cached page",
            ));
        }

        let etag = header_str(response.headers(), ETAG);
        let retry_after = retry_after_header(response.headers());

        if status.is_success() {
            let body: Value = response.json().await.map_err(|e| {
                if e.is_timeout() {
                    ApiError::timed_out()
                } else {
                    ApiError::failure(
                        Some(status.as_u16()),
                        format!("Invalid response body: {}", e),
                    )
                }
            })?;

            let page = parse_page(&body, status)?;

            debug!(
                url = %cache_key,
                records = page.records.len(),
                has_next = page.next.is_some(),
                "Received page"
            );

            if let Some(etag) = etag {
                self.page_cache
                    .lock()
                    .await
                    .insert(cache_key, CachedPage { etag, body });
            }

            return Ok(page);
        }

        let body: Option<Value> = response.json().await.ok();

        if status == StatusCode::UNAUTHORIZED {
            *self.token.write().await = None;
        }

        let error = error_from_response(status, retry_after, body.as_ref());
        warn!(url = %cache_key, status = status.as_u16(), error = %error, "SIPP API request failed");
        Err(error)
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), endpoint)
    }

    /// Wait for the minimum request interval to pass
    async fn wait_for_rate_limit(&self) {
        let min_interval = Duration::from_millis(self.config.min_interval_ms);

        let mut last_request = self.last_request.lock().await;

        if let Some(last) = *last_request {
            let elapsed = last.elapsed();
            if elapsed < min_interval {
                let wait_time = min_interval - elapsed;
                debug!(wait_ms = wait_time.as_millis() as u64, "Waiting for request interval");
                // Holding the lock keeps concurrent callers spaced out as well
                tokio::time::sleep(wait_time).await;
            }
        }

        *last_request = Some(Instant::now());
    }
}

#[async_trait]
impl Authenticator for SippClient {
    /// A static token is returned as is, so only login credentials refresh
    fn can_refresh(&self) -> bool {
        self.config.api_token.is_none()
    }

    async fn authenticate(&self) -> Result<String, ApiError> {
        if let Some(token) = &self.config.api_token {
            *self.token.write().await = Some(token.clone());
            return Ok(token.clone());
        }

        let (username, password) = match (&self.config.username, &self.config.password) {
            (Some(username), Some(password)) => (username, password),
            _ => {
                return Err(ApiError::authentication_failed(
                    "No SIPP token or credentials configured",
                ))
            }
        };

        self.wait_for_rate_limit().await;

        let response = self
            .client
            .post(self.url(&self.config.auth_endpoint))
            .json(&json!({ "username": username, "password": password }))
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        let retry_after = retry_after_header(response.headers());
        let body: Option<Value> = response.json().await.ok();

        if !status.is_success() {
            let error = match status.as_u16() {
                408 | 429 => error_from_response(status, retry_after, body.as_ref()),
                400..=499 => ApiError::authentication_failed(
                    body_message(body.as_ref()).unwrap_or_else(|| "Credentials rejected".to_string()),
                ),
                _ => error_from_response(status, retry_after, body.as_ref()),
            };
            warn!(status = status.as_u16(), error = %error, "SIPP authentication failed");
            return Err(error);
        }

        let token = body.as_ref().and_then(extract_token).ok_or_else(|| {
            ApiError::authentication_failed("Token endpoint returned no token")
        })?;

        *self.token.write().await = Some(token.clone());
        info!("Authenticated against SIPP API");

        Ok(token)
    }
}

#[async_trait]
impl RemoteSource for SippClient {
    async fn fetch_page(&self, request: &PageRequest) -> Result<ApiPage, ApiError> {
        let endpoint = self.endpoint(request.kind).to_string();
        self.fetch(&endpoint, &request.query_params()).await
    }

    async fn clear_cache(&self) {
        let cleared = {
            let mut cache = self.page_cache.lock().await;
            let len = cache.len();
            cache.clear();
            len
        };
        *self.token.write().await = None;

        info!(pages = cleared, "Cleared SIPP page cache and token");
    }
}

fn transport_error(err: reqwest::Error) -> ApiError {
    if err.is_timeout() {
        ApiError::timed_out()
    } else {
        ApiError::failure(None, err.to_string())
    }
}

fn header_str(headers: &HeaderMap, name: reqwest::header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
}

fn retry_after_header(headers: &HeaderMap) -> Option<u64> {
    header_str(headers, RETRY_AFTER).and_then(|v| v.trim().parse().ok())
}

fn body_message(body: Option<&Value>) -> Option<String> {
    body.and_then(|b| b.get("message"))
        .and_then(Value::as_str)
        .map(String::from)
}

/// Classify a non-2xx response
fn error_from_response(status: StatusCode, retry_after: Option<u64>, body: Option<&Value>) -> ApiError {
    let retry_after = retry_after.or_else(|| {
        body.and_then(|b| b.get("retry_after")).and_then(|v| match v {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        })
    });

    let message = body_message(body).unwrap_or_else(|| {
        status
            .canonical_reason()
            .unwrap_or("Unexpected status")
            .to_string()
    });

    ApiError::from_status(status.as_u16(), retry_after, message)
}

/// Token from `{"data":{"token"}}`, `{"token"}` or `{"access_token"}`
fn extract_token(body: &Value) -> Option<String> {
    [
        body.get("data").and_then(|d| d.get("token")),
        body.get("token"),
        body.get("access_token"),
    ]
    .into_iter()
    .flatten()
    .find_map(|v| v.as_str().filter(|s| !s.is_empty()))
    .map(String::from)
}

/// Decode the `{"data", "meta", "links"}` envelope
fn parse_page(body: &Value, status: StatusCode) -> Result<ApiPage, ApiError> {
    let records = match body.get("data") {
        Some(Value::Array(items)) => items.clone(),
        Some(Value::Null) => Vec::new(),
        Some(object @ Value::Object(_)) => vec![object.clone()],
        Some(_) => {
            return Err(ApiError::failure(
                Some(status.as_u16()),
                "Response data is neither a list nor an object",
            ))
        }
        None => match body {
            Value::Array(items) => items.clone(),
            _ => {
                return Err(ApiError::failure(
                    Some(status.as_u16()),
                    "Response has no data field",
                ))
            }
        },
    };

    Ok(ApiPage {
        records,
        next: next_cursor(body),
    })
}

fn next_cursor(body: &Value) -> Option<PageCursor> {
    let meta = body.get("meta");

    let cursor = meta
        .and_then(|m| m.get("next_cursor"))
        .and_then(|v| match v {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        });
    if let Some(cursor) = cursor {
        return Some(PageCursor::Cursor(cursor));
    }

    if let Some(link) = body
        .get("links")
        .and_then(|l| l.get("next"))
        .and_then(Value::as_str)
    {
        if let Some(cursor) = cursor_from_link(link) {
            return Some(cursor);
        }
    }

    let current = meta.and_then(|m| m.get("current_page")).and_then(as_u32)?;
    let last = meta.and_then(|m| m.get("last_page")).and_then(as_u32)?;
    (current < last).then_some(PageCursor::Page(current + 1))
}

/// Read `cursor=` or `page=` from an absolute or relative link
fn cursor_from_link(link: &str) -> Option<PageCursor> {
    let url = Url::parse(link)
        .or_else(|_| Url::parse("http://localhost/").and_then(|base| base.join(link)))
        .ok()?;

    let mut page = None;
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "cursor" if !value.is_empty() => return Some(PageCursor::Cursor(value.into_owned())),
            "page" => page = value.parse().ok().map(PageCursor::Page),
            _ => {}
        }
    }
    page
}

fn as_u32(value: &Value) -> Option<u32> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
