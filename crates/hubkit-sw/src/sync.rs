//! Background sync: a durable queue of failed mutating requests replayed on
//! a sync trigger.

use std::sync::Arc;

use async_trait::async_trait;
use hubkit_common::{HubKitError, RetryConfig};
use hubkit_idb::{IDBFactory, KeyPath};
use hubkit_net::{FetchOptions, Request};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::policy::Network;
use crate::{now_ms, ServiceWorkerError};

/// Database holding the queue.
pub const SYNC_DB_NAME: &str = "hubkit-sync";

/// Object store holding queued requests.
pub const PENDING_STORE: &str = "pending-requests";

// ==================== Records ====================

/// A queued request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingRequest {
    /// Assigned by the store on enqueue.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,

    pub url: String,

    #[serde(default)]
    pub options: FetchOptions,

    /// Failed replays so far.
    #[serde(default)]
    pub attempts: u32,

    /// Earliest replay time (ms since epoch).
    #[serde(default)]
    pub not_before: i64,
}

impl PendingRequest {
    pub fn new(url: impl Into<String>, options: FetchOptions) -> Self {
        Self {
            id: None,
            url: url.into(),
            options,
            attempts: 0,
            not_before: 0,
        }
    }

    /// Whether the record may be replayed at `now`.
    pub fn is_due(&self, now: i64) -> bool {
        self.not_before <= now
    }
}

// ==================== Store ====================

/// Durable storage for queued requests.
#[async_trait]
pub trait PendingStore: Send + Sync {
    /// All records in enqueue order.
    async fn get_all(&self) -> Result<Vec<PendingRequest>, ServiceWorkerError>;

    /// Insert a new record and return its id.
    async fn add(&self, record: PendingRequest) -> Result<u64, ServiceWorkerError>;

    /// Overwrite an existing record.
    async fn put(&self, record: &PendingRequest) -> Result<(), ServiceWorkerError>;

    async fn delete(&self, id: u64) -> Result<(), ServiceWorkerError>;
}

/// [`PendingStore`] on an IDB object store with an auto-increment `id`.
#[derive(Clone)]
pub struct IdbPendingStore {
    factory: IDBFactory,
}

impl IdbPendingStore {
    /// Open the queue database, creating the object store on first use.
    pub async fn open(factory: IDBFactory) -> Result<Self, ServiceWorkerError> {
        factory
            .open(SYNC_DB_NAME, 1, |db, old_version, _| {
                if old_version < 1 {
                    db.create_object_store(PENDING_STORE, KeyPath::Single("id".into()), true)?;
                }
                Ok(())
            })
            .await?;
        Ok(Self { factory })
    }
}

fn to_value(record: &PendingRequest) -> Result<JsonValue, ServiceWorkerError> {
    serde_json::to_value(record)
        .map_err(|e| ServiceWorkerError::Storage(hubkit_idb::IDBError::DataError(e.to_string())))
}

#[async_trait]
impl PendingStore for IdbPendingStore {
    async fn get_all(&self) -> Result<Vec<PendingRequest>, ServiceWorkerError> {
        let values = self
            .factory
            .read_database(SYNC_DB_NAME, |db| {
                Ok(db
                    .object_store(PENDING_STORE)?
                    .get_all(None)
                    .into_iter()
                    .map(|r| r.value.clone())
                    .collect::<Vec<_>>())
            })
            .await?;

        let mut records = Vec::with_capacity(values.len());
        for value in values {
            match serde_json::from_value::<PendingRequest>(value) {
                Ok(record) => records.push(record),
                Err(e) => warn!(error = %e, "Skipping malformed pending request"),
            }
        }
        Ok(records)
    }

    async fn add(&self, record: PendingRequest) -> Result<u64, ServiceWorkerError> {
        let mut record = record;
        record.id = None;
        let value = to_value(&record)?;
        let key = self
            .factory
            .with_database(SYNC_DB_NAME, |tx| tx.object_store_mut(PENDING_STORE)?.add(value, None))
            .await?;
        key.parse::<u64>()
            .map_err(|_| ServiceWorkerError::StateError(format!("Non-numeric queue key {}", key)))
    }

    async fn put(&self, record: &PendingRequest) -> Result<(), ServiceWorkerError> {
        if record.id.is_none() {
            return Err(ServiceWorkerError::StateError(
                "Cannot update a pending request without an id".to_string(),
            ));
        }
        let value = to_value(record)?;
        self.factory
            .with_database(SYNC_DB_NAME, |tx| tx.object_store_mut(PENDING_STORE)?.put(value, None))
            .await?;
        Ok(())
    }

    async fn delete(&self, id: u64) -> Result<(), ServiceWorkerError> {
        self.factory
            .with_database(SYNC_DB_NAME, |tx| {
                tx.object_store_mut(PENDING_STORE)?.delete(&id.to_string());
                Ok(())
            })
            .await?;
        Ok(())
    }
}

// ==================== Queue ====================

/// Counts from one drain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    /// Records replayed successfully and removed.
    pub succeeded: usize,
    /// Records whose replay failed and stay queued.
    pub failed: usize,
    /// Records skipped because their backoff has not elapsed.
    pub deferred: usize,
    /// Records dropped after using up their attempts.
    pub dead_lettered: usize,
}

impl SyncReport {
    pub fn attempted(&self) -> usize {
        self.succeeded + self.failed + self.dead_lettered
    }
}

/// Replays queued requests.
#[derive(Clone)]
pub struct SyncQueue {
    store: Arc<dyn PendingStore>,
    network: Network,
    base: Url,
    retry: RetryConfig,
}

impl SyncQueue {
    /// `base` resolves relative record URLs.
    pub fn new(
        store: Arc<dyn PendingStore>,
        network: Network,
        base: Url,
        retry: RetryConfig,
    ) -> Self {
        Self {
            store,
            network,
            base,
            retry,
        }
    }

    /// Queue a request for the next sync.
    pub async fn enqueue(
        &self,
        url: impl Into<String>,
        options: FetchOptions,
    ) -> Result<u64, ServiceWorkerError> {
        let record = PendingRequest::new(url, options);
        let url = record.url.clone();
        let id = self.store.add(record).await?;
        info!(id, url = %url, "Queued request for background sync");
        Ok(id)
    }

    pub async fn pending(&self) -> Result<Vec<PendingRequest>, ServiceWorkerError> {
        self.store.get_all().await
    }

    /// Replay every due record now.
    pub async fn drain(&self) -> Result<SyncReport, ServiceWorkerError> {
        self.drain_at(now_ms()).await
    }

    /// Replay every record due at `now`. Only failing to read the queue is an
    /// error; per-record failures are logged and counted.
    pub async fn drain_at(&self, now: i64) -> Result<SyncReport, ServiceWorkerError> {
        let records = self.store.get_all().await?;
        let mut report = SyncReport::default();

        for record in records {
            let Some(id) = record.id else {
                warn!(url = %record.url, "Pending request has no id, skipping");
                continue;
            };

            if !record.is_due(now) {
                debug!(id, not_before = record.not_before, "Pending request not due yet");
                report.deferred += 1;
                continue;
            }

            match self.replay(&record).await {
                Ok(()) => {
                    if let Err(e) = self.store.delete(id).await {
                        warn!(id, error = %e, "Replayed request could not be removed");
                    }
                    report.succeeded += 1;
                }
                Err(e) => {
                    warn!(
                        id,
                        url = %record.url,
                        attempt = record.attempts + 1,
                        category = e.category(),
                        retryable = e.is_retryable(),
                        error = %e,
                        "Sync replay failed"
                    );
                    if self.record_failure(record, id, now).await {
                        report.dead_lettered += 1;
                    } else {
                        report.failed += 1;
                    }
                }
            }
        }

        info!(
            succeeded = report.succeeded,
            failed = report.failed,
            deferred = report.deferred,
            dead_lettered = report.dead_lettered,
            "Background sync drained"
        );
        Ok(report)
    }

    async fn replay(&self, record: &PendingRequest) -> hubkit_common::Result<()> {
        let url = self
            .base
            .join(&record.url)
            .map_err(|e| HubKitError::InvalidArgument(format!("{}: {}", record.url, e)))?;
        let request = Request::from_options(url, &record.options)?;

        let response = self.network.fetch(request).await?;
        if response.ok() {
            Ok(())
        } else {
            Err(HubKitError::Status(response.status.as_u16()))
        }
    }

    /// Bump attempts and schedule the next try. Returns true when the record
    /// was dropped instead.
    async fn record_failure(&self, mut record: PendingRequest, id: u64, now: i64) -> bool {
        record.attempts += 1;

        if self.retry.is_exhausted(record.attempts) {
            error!(id, url = %record.url, attempts = record.attempts, "Dropping pending request after final attempt");
            if let Err(e) = self.store.delete(id).await {
                warn!(id, error = %e, "Dead-lettered request could not be removed");
            }
            return true;
        }

        record.not_before = self.retry.retry_at(record.attempts, now);
        if let Err(e) = self.store.put(&record).await {
            warn!(id, error = %e, "Could not persist retry schedule");
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hubkit_net::{Fetcher, NetError, Response};
    use http::StatusCode;
    use std::time::Duration;

    /// Succeeds for URLs containing `ok`, fails the rest.
    struct PickyFetcher;

    #[async_trait]
    impl Fetcher for PickyFetcher {
        async fn fetch(&self, request: Request) -> Result<Response, NetError> {
            if request.url.path().contains("ok") {
                Ok(Response::new(StatusCode::CREATED))
            } else if request.url.path().contains("bad") {
                Ok(Response::new(StatusCode::BAD_GATEWAY))
            } else {
                Err(NetError::Offline("down".into()))
            }
        }
    }

    fn retry(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }

    async fn queue(max_attempts: u32) -> SyncQueue {
        let store = IdbPendingStore::open(IDBFactory::new()).await.unwrap();
        SyncQueue::new(
            Arc::new(store),
            Network::new(Arc::new(PickyFetcher), None),
            Url::parse("https://hub.example/").unwrap(),
            retry(max_attempts),
        )
    }

    #[tokio::test]
    async fn test_store_assigns_ids() {
        let store = IdbPendingStore::open(IDBFactory::new()).await.unwrap();
        let a = store.add(PendingRequest::new("/api/a", FetchOptions::default())).await.unwrap();
        let b = store.add(PendingRequest::new("/api/b", FetchOptions::default())).await.unwrap();
        assert_eq!((a, b), (1, 2));

        let all = store.get_all().await.unwrap();
        assert_eq!(all[0].id, Some(1));
        assert_eq!(all[1].url, "/api/b");

        store.delete(1).await.unwrap();
        assert_eq!(store.get_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_store_reopen_keeps_records() {
        let factory = IDBFactory::new();
        let store = IdbPendingStore::open(factory.clone()).await.unwrap();
        store.add(PendingRequest::new("/api/a", FetchOptions::default())).await.unwrap();

        let again = IdbPendingStore::open(factory).await.unwrap();
        assert_eq!(again.get_all().await.unwrap().len(), 1);
    }

    #[test]
    fn test_bare_record_deserializes() {
        let record: PendingRequest =
            serde_json::from_value(serde_json::json!({"id": 3, "url": "/api/x", "options": {}}))
                .unwrap();
        assert_eq!(record.attempts, 0);
        assert!(record.is_due(0));
    }

    #[tokio::test]
    async fn test_replay_failures_are_classified() {
        let q = queue(5).await;

        let err = q
            .replay(&PendingRequest::new("/api/bad", FetchOptions::default()))
            .await
            .unwrap_err();
        assert!(matches!(err, HubKitError::Status(502)));
        assert!(err.is_retryable());

        let err = q
            .replay(&PendingRequest::new("/api/down", FetchOptions::default()))
            .await
            .unwrap_err();
        assert_eq!(err.category(), "network");

        let bad_method = FetchOptions {
            method: Some("NOT A METHOD".into()),
            ..Default::default()
        };
        let err = q
            .replay(&PendingRequest::new("/api/ok", bad_method))
            .await
            .unwrap_err();
        assert_eq!(err.category(), "invalid_argument");

        assert!(q
            .replay(&PendingRequest::new("/api/ok", FetchOptions::default()))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_failure_schedules_backoff() {
        let q = queue(5).await;
        q.enqueue("/api/down", FetchOptions::default()).await.unwrap();

        let report = q.drain_at(1_000).await.unwrap();
        assert_eq!(report.failed, 1);

        let record = &q.pending().await.unwrap()[0];
        assert_eq!(record.attempts, 1);
        assert_eq!(record.not_before, 1_000 + 10_000);

        let report = q.drain_at(5_000).await.unwrap();
        assert_eq!(report.deferred, 1);
        assert_eq!(report.attempted(), 0);

        q.drain_at(11_000).await.unwrap();
        let record = &q.pending().await.unwrap()[0];
        assert_eq!(record.attempts, 2);
        assert_eq!(record.not_before, 11_000 + 20_000);
    }

    #[tokio::test]
    async fn test_non_success_status_is_failure() {
        let q = queue(5).await;
        q.enqueue("/api/bad", FetchOptions::default()).await.unwrap();
        let report = q.drain_at(0).await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(q.pending().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_dead_letter_after_max_attempts() {
        let q = queue(2).await;
        q.enqueue("/api/down", FetchOptions::default()).await.unwrap();

        q.drain_at(0).await.unwrap();
        let report = q.drain_at(i64::MAX / 2).await.unwrap();

        assert_eq!(report.dead_lettered, 1);
        assert!(q.pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_options_counted_as_failure() {
        let q = queue(5).await;
        let options = FetchOptions {
            method: Some("NOT A METHOD".into()),
            ..Default::default()
        };
        q.enqueue("/api/ok", options).await.unwrap();
        q.enqueue("/api/ok", FetchOptions::default()).await.unwrap();

        let report = q.drain_at(0).await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.succeeded, 1);
    }
}
