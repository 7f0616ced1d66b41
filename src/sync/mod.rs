//! SIPP synchronization
//!
//! This module pulls SIPP records (cases and hearing schedules) from the
//! remote API into the local store, with automatic retry, authentication
//! refresh and scheduling.
//!
//! # Components
//!
//! - [`http_client`]: Paginated, rate-limited SIPP API client
//! - [`retry`]: Retry manager with exponential backoff and auth refresh
//! - [`reconciler`]: Applies fetched records to the local store and records runs
//! - [`scheduler`]: Periodic and manual sync trigger
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use sipp_sync::sync::{ReconcilerConfig, SippClient, SyncReconciler};
//! use sipp_sync::models::SyncMode;
//!
//! let client = Arc::new(SippClient::new(config.sipp.clone())?);
//! let reconciler = SyncReconciler::new(
//!     database,
//!     client,
//!     RetryManager::new(config.retry.clone()),
//!     ReconcilerConfig::from_config(&config),
//! );
//!
//! let run = reconciler.run_sync(SyncMode::Incremental, CancellationToken::new()).await?;
//! ```

pub mod http_client;
pub mod reconciler;
pub mod retry;
pub mod scheduler;

// Re-export main types for convenience
pub use http_client::{ApiPage, Authenticator, PageCursor, PageRequest, RemoteSource, SippClient};
pub use reconciler::{ReconcilerConfig, SyncReconciler, SYNC_LOCK_NAME};
pub use retry::RetryManager;
pub use scheduler::{ManualSyncHandle, SchedulerStatus, SyncScheduler, Syncable};
