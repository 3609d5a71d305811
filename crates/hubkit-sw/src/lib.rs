//! # HubKit Service Worker
//!
//! Offline cache manager for the Entrepreneurship Hub web origin.
//!
//! ## Features
//!
//! - **Lifecycle**: install (all-or-nothing app shell), activate (stale cache cleanup, client claim)
//! - **Routing**: cross-origin passthrough, API vs static asset policies
//! - **API policy**: stale-while-revalidate with a JSON offline fallback
//! - **Static policy**: cache-first with selective population and an HTML offline page
//! - **Background sync**: durable queue of failed mutating requests, replayed on a sync trigger
//! - **Notifications**: push payloads to notifications, click handling
//!
//! ## Architecture
//!
//! ```text
//! ServiceWorker
//!     ├── Lifecycle (Parsed → Installing → Installed → Activating → Activated | Redundant)
//!     ├── Router ──┬── CachePolicies::stale_while_revalidate  (API)
//!     │            └── CachePolicies::cache_first            (static)
//!     ├── CacheStorage
//!     │       └── Cache (method + URL → CacheEntry)
//!     ├── Clients
//!     ├── SyncQueue ── PendingStore (hubkit-idb)
//!     └── WaitUntil (background tasks awaited by settle())
//! ```

use hubkit_common::HubKitError;
use hubkit_idb::IDBError;
use hubkit_net::NetError;
use thiserror::Error;

pub mod cache;
pub mod clients;
pub mod config;
pub mod lifecycle;
pub mod notifications;
pub mod offline;
pub mod policy;
pub mod router;
pub mod sync;
pub mod tasks;
pub mod worker;

pub use cache::{Cache, CacheEntry, CacheStorage};
pub use clients::{Client, ClientType, Clients};
pub use config::{NotificationSettings, RetryPolicy, WorkerConfig};
pub use lifecycle::{Lifecycle, WorkerState};
pub use notifications::{ClickOutcome, Notification, NotificationAction};
pub use policy::{FetchOutcome, ResponseSource};
pub use router::{Route, Router};
pub use sync::{IdbPendingStore, PendingRequest, PendingStore, SyncQueue, SyncReport};
pub use tasks::WaitUntil;
pub use worker::{ServiceWorker, WorkerEnv, WorkerEvent};

// ==================== Errors ====================

/// Errors that can occur in service worker operations.
#[derive(Error, Debug)]
pub enum ServiceWorkerError {
    #[error("Install failed for {url}: {reason}")]
    InstallFailed { url: String, reason: String },

    #[error("State error: {0}")]
    StateError(String),

    #[error("Network error: {0}")]
    Network(#[from] NetError),

    #[error("Storage error: {0}")]
    Storage(#[from] IDBError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl From<ServiceWorkerError> for HubKitError {
    fn from(err: ServiceWorkerError) -> Self {
        match err {
            ServiceWorkerError::Network(e) => e.into(),
            ServiceWorkerError::Storage(e) => HubKitError::storage("pending store", e),
            ServiceWorkerError::Config(msg) => HubKitError::Config(msg),
            ServiceWorkerError::InvalidUrl(msg) => HubKitError::InvalidArgument(msg),
            ServiceWorkerError::NotFound(what) => HubKitError::NotFound(what),
            other => HubKitError::Lifecycle(other.to_string()),
        }
    }
}

/// Milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_conversion_categories() {
        let err: HubKitError = ServiceWorkerError::StateError("not installed".into()).into();
        assert_eq!(err.category(), "lifecycle");

        let err: HubKitError = ServiceWorkerError::Network(NetError::Offline("down".into())).into();
        assert!(err.is_retryable());

        let err: HubKitError =
            ServiceWorkerError::Storage(IDBError::StorageError("disk full".into())).into();
        assert_eq!(err.category(), "storage");
        assert!(!err.is_retryable());

        let err: HubKitError = ServiceWorkerError::InstallFailed {
            url: "/index.html".into(),
            reason: "status 500".into(),
        }
        .into();
        assert_eq!(err.category(), "lifecycle");

        let err: HubKitError = ServiceWorkerError::InvalidUrl("::".into()).into();
        assert_eq!(err.category(), "invalid_argument");
    }
}
