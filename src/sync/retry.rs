//! Retry manager for SIPP API calls
//!
//! This module wraps a single-attempt operation with retry logic: server
//! dictated waits for rate limits, exponential backoff with jitter for
//! transient failures, and one token refresh per operation for
//! authentication failures when the token source can refresh.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use super::http_client::Authenticator;
use crate::config::RetryConfig;
use crate::error::{ApiError, RetryableError};

/// Retry manager with exponential backoff support
#[derive(Debug, Clone)]
pub struct RetryManager {
    config: RetryConfig,
}

impl RetryManager {
    /// Create a new RetryManager with the given configuration
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Create a RetryManager with default configuration
    pub fn with_defaults() -> Self {
        Self::new(RetryConfig::default())
    }

    /// Execute an operation with the configured attempt budget
    pub async fn execute<A, F, Fut, T>(&self, authenticator: &A, operation: F) -> Result<T, ApiError>
    where
        A: Authenticator + ?Sized,
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        self.execute_with_attempts(self.config.max_attempts, authenticator, operation)
            .await
    }

    /// Execute an operation with an explicit attempt budget
    ///
    /// Every error is stamped with `(attempt, max_attempts)`. The returned
    /// error is the last one seen; once the budget is spent its
    /// `has_retries_left()` is false.
    ///
    /// - `RateLimited`: waits exactly `retry_after` seconds
    /// - `TimedOut` and retryable `ApiFailure`: waits [`Self::calculate_backoff`]
    /// - `AuthenticationFailed`: refreshes the token once, then retries; fatal
    ///   when the authenticator cannot refresh
    /// - anything else is returned at once
    pub async fn execute_with_attempts<A, F, Fut, T>(
        &self,
        max_attempts: u32,
        authenticator: &A,
        operation: F,
    ) -> Result<T, ApiError>
    where
        A: Authenticator + ?Sized,
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        let max_attempts = max_attempts.max(1);
        let mut attempt = 1u32;
        let mut refreshed = false;

        loop {
            let err = match operation().await {
                Ok(result) => return Ok(result),
                Err(err) => err.with_attempt(attempt, max_attempts),
            };

            let wait = match &err {
                ApiError::AuthenticationFailed { .. } => {
                    let consumes = self.config.auth_refresh_consumes_attempt;
                    if refreshed || (consumes && !err.has_retries_left()) {
                        warn!(attempt, max_attempts, error = %err, "Authentication failed, giving up");
                        return Err(err);
                    }
                    if !authenticator.can_refresh() {
                        warn!(attempt, max_attempts, error = %err, "Token cannot be refreshed, giving up");
                        return Err(err);
                    }
                    refreshed = true;

                    debug!(attempt, max_attempts, "Refreshing token after authentication failure");
                    if let Err(refresh_err) = authenticator.authenticate().await {
                        let refresh_err = refresh_err.with_attempt(attempt, max_attempts);
                        warn!(attempt, max_attempts, error = %refresh_err, "Token refresh failed");
                        return Err(refresh_err);
                    }

                    if consumes {
                        attempt += 1;
                    }
                    continue;
                }
                ApiError::RateLimited { retry_after, .. } => Duration::from_secs(*retry_after),
                _ if err.is_retryable() => self.calculate_backoff(attempt),
                _ => {
                    debug!(attempt, error = %err, "Non-retryable error");
                    return Err(err);
                }
            };

            if !err.has_retries_left() {
                warn!(
                    attempts = attempt,
                    max_attempts,
                    error = %err,
                    "Max attempts exhausted"
                );
                return Err(err);
            }

            debug!(
                attempt,
                max_attempts,
                wait_ms = wait.as_millis() as u64,
                error = %err,
                "Retrying after transient error"
            );

            tokio::time::sleep(wait).await;
            attempt += 1;
        }
    }

    /// Calculate backoff duration for a given attempt number (1-based)
    ///
    /// Uses exponential backoff: initial_backoff * multiplier^(attempt - 1)
    /// Capped at max_backoff_ms with optional jitter
    pub fn calculate_backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base = self.config.initial_backoff_ms as f64 * self.config.backoff_multiplier.powi(exponent);
        let capped = base.min(self.config.max_backoff_ms as f64).max(0.0);

        let delay_ms = if self.config.jitter {
            // Add jitter: 50-100% of the calculated backoff
            let jitter = rand::thread_rng().gen_range(0.5..1.0);
            capped * jitter
        } else {
            capped
        };

        Duration::from_secs_f64(delay_ms / 1000.0)
    }

    /// Get the retry configuration
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }
}
