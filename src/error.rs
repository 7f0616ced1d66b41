//! Application error types for sipp-sync
//!
//! This module defines the error taxonomy for the SIPP API client and the
//! error types used by persistence and the sync run.
//! All error types use `thiserror` for ergonomic error handling.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure returned by the SIPP API client
///
/// Every variant carries the retry metadata of the logical operation it
/// belongs to. The client creates errors with `attempt = 1, max_attempts = 1`;
/// the retry manager stamps the real values with [`ApiError::with_attempt`].
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ApiError {
    /// HTTP 429 from the upstream
    #[error("Rate limited, retry after {retry_after} seconds")]
    RateLimited {
        retry_after: u64,
        attempt: u32,
        max_attempts: u32,
    },

    /// HTTP 401, or the token endpoint refused the credentials
    #[error("Authentication failed: {message}")]
    AuthenticationFailed {
        message: String,
        attempt: u32,
        max_attempts: u32,
    },

    /// The request never got an answer within the configured timeout (or HTTP 408)
    #[error("Request timed out")]
    TimedOut { attempt: u32, max_attempts: u32 },

    /// Any other non-2xx response, or a transport failure (`status_code == None`)
    #[error("{}", failure_message(*status_code, message))]
    ApiFailure {
        status_code: Option<u16>,
        message: String,
        attempt: u32,
        max_attempts: u32,
    },
}

fn failure_message(status_code: Option<u16>, message: &str) -> String {
    match status_code {
        Some(code) => format!("API failure (HTTP {}): {}", code, message),
        None => format!("API failure: {}", message),
    }
}

impl ApiError {
    /// Create a rate limit error
    pub fn rate_limited(retry_after: u64) -> Self {
        ApiError::RateLimited {
            retry_after,
            attempt: 1,
            max_attempts: 1,
        }
    }

    /// Create an authentication error
    pub fn authentication_failed(message: impl Into<String>) -> Self {
        ApiError::AuthenticationFailed {
            message: message.into(),
            attempt: 1,
            max_attempts: 1,
        }
    }

    /// Create a timeout error
    pub fn timed_out() -> Self {
        ApiError::TimedOut {
            attempt: 1,
            max_attempts: 1,
        }
    }

    /// Create a generic failure; `None` means no HTTP response was received
    pub fn failure(status_code: Option<u16>, message: impl Into<String>) -> Self {
        ApiError::ApiFailure {
            status_code,
            message: message.into(),
            attempt: 1,
            max_attempts: 1,
        }
    }

    /// Classify a non-2xx HTTP status
    ///
    /// 429, 401 and 408 map to their dedicated variants; everything else is
    /// an [`ApiError::ApiFailure`] carrying the status code.
    pub fn from_status(status: u16, retry_after: Option<u64>, message: impl Into<String>) -> Self {
        match status {
            429 => Self::rate_limited(retry_after.unwrap_or(0)),
            401 => Self::authentication_failed(message),
            408 => Self::timed_out(),
            _ => Self::failure(Some(status), message),
        }
    }

    /// 1-based ordinal of the attempt that produced this error
    pub fn attempt(&self) -> u32 {
        match self {
            ApiError::RateLimited { attempt, .. }
            | ApiError::AuthenticationFailed { attempt, .. }
            | ApiError::TimedOut { attempt, .. }
            | ApiError::ApiFailure { attempt, .. } => *attempt,
        }
    }

    /// Attempt budget of the operation
    pub fn max_attempts(&self) -> u32 {
        match self {
            ApiError::RateLimited { max_attempts, .. }
            | ApiError::AuthenticationFailed { max_attempts, .. }
            | ApiError::TimedOut { max_attempts, .. }
            | ApiError::ApiFailure { max_attempts, .. } => *max_attempts,
        }
    }

    /// True while `attempt < max_attempts`
    pub fn has_retries_left(&self) -> bool {
        self.attempt() < self.max_attempts()
    }

    /// Return the same error stamped with retry metadata
    pub fn with_attempt(mut self, attempt: u32, max_attempts: u32) -> Self {
        match &mut self {
            ApiError::RateLimited {
                attempt: a,
                max_attempts: m,
                ..
            }
            | ApiError::AuthenticationFailed {
                attempt: a,
                max_attempts: m,
                ..
            }
            | ApiError::TimedOut {
                attempt: a,
                max_attempts: m,
            }
            | ApiError::ApiFailure {
                attempt: a,
                max_attempts: m,
                ..
            } => {
                *a = attempt;
                *m = max_attempts;
            }
        }
        self
    }

    /// Numeric code for the structured representation (0 for transport failures)
    pub fn code(&self) -> u16 {
        match self {
            ApiError::RateLimited { .. } => 429,
            ApiError::AuthenticationFailed { .. } => 401,
            ApiError::TimedOut { .. } => 408,
            ApiError::ApiFailure { status_code, .. } => status_code.unwrap_or(0),
        }
    }

    /// Server-dictated wait, only present for rate limit errors
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            ApiError::RateLimited { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    /// Structured representation used for logging and the sync run audit trail
    pub fn details(&self) -> ApiErrorDetails {
        ApiErrorDetails {
            message: self.to_string(),
            code: self.code(),
            attempt: self.attempt(),
            max_attempts: self.max_attempts(),
            has_retries_left: self.has_retries_left(),
            retry_after: self.retry_after(),
        }
    }
}

/// Serializable form of an [`ApiError`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiErrorDetails {
    pub message: String,
    pub code: u16,
    pub attempt: u32,
    pub max_attempts: u32,
    pub has_retries_left: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

/// Database-related errors
#[derive(Debug, Error)]
pub enum DbError {
    /// SQLite error
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// The background connection is gone
    #[error("Database connection error: {0}")]
    Connection(String),

    /// Record not found
    #[error("Record not found")]
    NotFound,

    /// Constraint violation
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    /// Stored value could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<tokio_rusqlite::Error> for DbError {
    fn from(err: tokio_rusqlite::Error) -> Self {
        match err {
            tokio_rusqlite::Error::Rusqlite(e) => DbError::Sqlite(e),
            other => DbError::Connection(other.to_string()),
        }
    }
}

/// Run-level synchronization errors surfaced to the scheduler
#[derive(Debug, Error)]
pub enum SyncError {
    /// Another run holds the single-run guarantee
    #[error("A sync run is already in progress")]
    AlreadyRunning,

    /// Upstream error that escaped the retry manager
    #[error("SIPP API error: {0}")]
    Api(#[from] ApiError),

    /// Persistence failed outside of a single record
    #[error("Database error: {0}")]
    Database(#[from] DbError),

    /// A fetched record could not be mapped to a local record
    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    /// Scheduler task is gone or its queue is full
    #[error("Scheduler unavailable: {0}")]
    SchedulerUnavailable(String),
}

/// Application-level error type
///
/// Aggregates the domain-specific error types for the binary.
#[derive(Debug, Error)]
pub enum AppError {
    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] DbError),

    /// Sync error
    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    /// API error
    #[error("API error: {0}")]
    Api(#[from] ApiError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Trait for determining if an error is retryable
pub trait RetryableError {
    /// Returns true if the error is retryable
    fn is_retryable(&self) -> bool;
}

impl RetryableError for ApiError {
    fn is_retryable(&self) -> bool {
        match self {
            ApiError::RateLimited { .. } => true,
            ApiError::TimedOut { .. } => true,
            // Only recoverable through a token refresh, never a plain retry
            ApiError::AuthenticationFailed { .. } => false,
            ApiError::ApiFailure {
                status_code: None, ..
            } => true,
            // 4xx is a malformed request, 2xx means the payload itself was bad
            ApiError::ApiFailure {
                status_code: Some(code),
                ..
            } => !(400..500).contains(code) && !(200..300).contains(code),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Test 1: Error message formatting
    #[test]
    fn test_api_error_messages() {
        assert_eq!(
            ApiError::rate_limited(60).to_string(),
            "Rate limited, retry after 60 seconds"
        );
        assert_eq!(
            ApiError::authentication_failed("token expired").to_string(),
            "Authentication failed: token expired"
        );
        assert_eq!(ApiError::timed_out().to_string(), "Request timed out");
        assert_eq!(
            ApiError::failure(Some(503), "unavailable").to_string(),
            "API failure (HTTP 503): unavailable"
        );
        assert_eq!(
            ApiError::failure(None, "connection refused").to_string(),
            "API failure: connection refused"
        );
    }

    // Test 2: Status classification follows the taxonomy table
    #[test]
    fn test_from_status_classification() {
        assert_eq!(
            ApiError::from_status(429, Some(30), "slow down"),
            ApiError::rate_limited(30)
        );
        assert_eq!(ApiError::from_status(429, None, "").retry_after(), Some(0));
        assert!(matches!(
            ApiError::from_status(401, None, "expired"),
            ApiError::AuthenticationFailed { .. }
        ));
        assert_eq!(ApiError::from_status(408, None, ""), ApiError::timed_out());
        assert_eq!(
            ApiError::from_status(500, None, "boom"),
            ApiError::failure(Some(500), "boom")
        );
    }

    // Test 3: has_retries_left is attempt < max_attempts
    #[test]
    fn test_has_retries_left() {
        let err = ApiError::rate_limited(5).with_attempt(1, 3);
        assert_eq!(err.attempt(), 1);
        assert_eq!(err.max_attempts(), 3);
        assert!(err.has_retries_left());

        let err = err.with_attempt(3, 3);
        assert!(!err.has_retries_left());

        let fresh = ApiError::timed_out();
        assert!(!fresh.has_retries_left());
    }

    // Test 4: with_attempt keeps the variant payload
    #[test]
    fn test_with_attempt_preserves_payload() {
        let err = ApiError::failure(Some(502), "bad gateway").with_attempt(2, 4);
        match err {
            ApiError::ApiFailure {
                status_code,
                message,
                attempt,
                max_attempts,
            } => {
                assert_eq!(status_code, Some(502));
                assert_eq!(message, "bad gateway");
                assert_eq!(attempt, 2);
                assert_eq!(max_attempts, 4);
            }
            other => panic!("Expected ApiFailure, got {:?}", other),
        }
    }

    // Test 5: RetryableError trait for ApiError
    #[test]
    fn test_api_error_retryable() {
        assert!(ApiError::rate_limited(0).is_retryable());
        assert!(ApiError::timed_out().is_retryable());
        assert!(ApiError::failure(None, "reset").is_retryable());
        assert!(ApiError::failure(Some(500), "").is_retryable());
        assert!(ApiError::failure(Some(503), "").is_retryable());

        assert!(!ApiError::authentication_failed("").is_retryable());
        assert!(!ApiError::failure(Some(400), "").is_retryable());
        assert!(!ApiError::failure(Some(404), "").is_retryable());
        assert!(!ApiError::failure(Some(422), "").is_retryable());
        assert!(!ApiError::failure(Some(200), "invalid json").is_retryable());
    }

    // Test 6: Structured representation of a rate limit error
    #[test]
    fn test_rate_limited_details() {
        let details = ApiError::rate_limited(42).with_attempt(2, 3).details();

        assert_eq!(details.code, 429);
        assert_eq!(details.attempt, 2);
        assert_eq!(details.max_attempts, 3);
        assert!(details.has_retries_left);
        assert_eq!(details.retry_after, Some(42));

        let json = serde_json::to_value(&details).unwrap();
        assert_eq!(json["retry_after"], 42);
        assert_eq!(json["message"], "Rate limited, retry after 42 seconds");
    }

    // Test 7: retry_after is omitted for other kinds
    #[test]
    fn test_details_omit_retry_after() {
        let details = ApiError::failure(None, "dns").with_attempt(3, 3).details();
        assert_eq!(details.code, 0);
        assert!(!details.has_retries_left);

        let json = serde_json::to_value(&details).unwrap();
        assert!(json.get("retry_after").is_none());
        assert_eq!(json["has_retries_left"], false);
    }

    // Test 8: From trait conversions for SyncError and AppError
    #[test]
    fn test_sync_error_from_api_error() {
        let sync_err: SyncError = ApiError::timed_out().into();
        assert!(matches!(sync_err, SyncError::Api(ApiError::TimedOut { .. })));

        let app_err: AppError = sync_err.into();
        assert_eq!(
            app_err.to_string(),
            "Sync error: SIPP API error: Request timed out"
        );
    }

    // Test 9: DbError from rusqlite::Error
    #[test]
    fn test_db_error_from_sqlite() {
        let sqlite_err = rusqlite::Error::InvalidParameterName("test".to_string());
        let db_err: DbError = sqlite_err.into();

        match db_err {
            DbError::Sqlite(_) => (),
            _ => panic!("Expected DbError::Sqlite"),
        }
    }

    // Test 10: DbError from tokio_rusqlite::Error unwraps the inner SQLite error
    #[test]
    fn test_db_error_from_tokio_rusqlite() {
        let err = tokio_rusqlite::Error::Rusqlite(rusqlite::Error::QueryReturnedNoRows);
        assert!(matches!(DbError::from(err), DbError::Sqlite(_)));

        let err = tokio_rusqlite::Error::ConnectionClosed;
        assert!(matches!(DbError::from(err), DbError::Connection(_)));
    }

    // Test 11: Run-level error messages
    #[test]
    fn test_sync_error_messages() {
        assert_eq!(
            SyncError::AlreadyRunning.to_string(),
            "A sync run is already in progress"
        );
        assert_eq!(
            SyncError::SchedulerUnavailable("stopped".to_string()).to_string(),
            "Scheduler unavailable: stopped"
        );
        assert_eq!(
            DbError::ConstraintViolation("unique".to_string()).to_string(),
            "Constraint violation: unique"
        );
    }
}
