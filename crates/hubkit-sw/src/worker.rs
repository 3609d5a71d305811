//! The offline worker: lifecycle, fetch interception, sync and push handling.

use std::sync::Arc;

use hubkit_common::retry_with_backoff;
use hubkit_net::{Fetcher, FetchOptions, Origin, Request, Response};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::cache::{CacheEntry, CacheStorage};
use crate::clients::Clients;
use crate::config::WorkerConfig;
use crate::lifecycle::{Lifecycle, WorkerState};
use crate::notifications::{ClickOutcome, Notification, ACTION_EXPLORE};
use crate::policy::{CachePolicies, FetchOutcome, Network};
use crate::router::{Route, Router};
use crate::sync::{PendingStore, SyncQueue, SyncReport};
use crate::tasks::WaitUntil;
use crate::{now_ms, ServiceWorkerError};

// ==================== Events ====================

/// Events emitted by the worker.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    /// Lifecycle state changed.
    StateChange { state: WorkerState },
    /// Superseded caches were deleted on activation.
    CachesDeleted { names: Vec<String> },
    /// Uncontrolled clients were claimed.
    ClientsClaimed { count: usize },
    /// A notification should be displayed.
    ShowNotification(Notification),
    /// The notification was dismissed.
    NotificationClosed,
    /// A window was opened.
    WindowOpened { client_id: String, url: Url },
    /// An existing window was focused.
    ClientFocused { client_id: String },
    /// A background sync drain finished.
    SyncCompleted(SyncReport),
}

// ==================== Environment ====================

/// Process-wide resources a worker runs against. Caches and clients outlive
/// any single worker version.
#[derive(Clone)]
pub struct WorkerEnv {
    pub fetcher: Arc<dyn Fetcher>,
    pub store: Arc<dyn PendingStore>,
    pub caches: Arc<RwLock<CacheStorage>>,
    pub clients: Arc<RwLock<Clients>>,
    /// Cache name of the version controlling the origin.
    pub controller: Arc<RwLock<Option<String>>>,
}

impl WorkerEnv {
    /// Fresh, empty caches and clients.
    pub fn new(fetcher: Arc<dyn Fetcher>, store: Arc<dyn PendingStore>) -> Self {
        Self {
            fetcher,
            store,
            caches: Arc::new(RwLock::new(CacheStorage::new())),
            clients: Arc::new(RwLock::new(Clients::new())),
            controller: Arc::new(RwLock::new(None)),
        }
    }
}

// ==================== Service Worker ====================

/// The offline cache manager for one origin and cache version.
pub struct ServiceWorker {
    config: Arc<WorkerConfig>,
    origin: Origin,
    root: Url,
    cache_name: String,
    router: Router,
    network: Network,
    policies: CachePolicies,
    sync: SyncQueue,
    lifecycle: RwLock<Lifecycle>,
    caches: Arc<RwLock<CacheStorage>>,
    clients: Arc<RwLock<Clients>>,
    controller: Arc<RwLock<Option<String>>>,
    tasks: WaitUntil,
    event_tx: mpsc::UnboundedSender<WorkerEvent>,
}

impl ServiceWorker {
    /// Create a worker in the `Parsed` state.
    pub fn new(
        config: WorkerConfig,
        env: WorkerEnv,
    ) -> Result<(Self, mpsc::UnboundedReceiver<WorkerEvent>), ServiceWorkerError> {
        config.validate()?;

        let origin = config.origin()?;
        let root = config.origin_url()?;
        let cache_name = config.cache_name();
        let network = Network::new(env.fetcher, config.network_timeout());
        let tasks = WaitUntil::new();

        let policies = CachePolicies::new(
            env.caches.clone(),
            cache_name.clone(),
            network.clone(),
            config.cacheable_patterns(),
            tasks.clone(),
        );
        let sync = SyncQueue::new(
            env.store,
            network.clone(),
            root.clone(),
            config.sync_retry.to_retry_config(),
        );
        let router = Router::new(origin.clone(), config.api_patterns());
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        info!(origin = %origin, cache = %cache_name, "Worker created");

        Ok((
            Self {
                config: Arc::new(config),
                origin,
                root,
                cache_name,
                router,
                network,
                policies,
                sync,
                lifecycle: RwLock::new(Lifecycle::new()),
                caches: env.caches,
                clients: env.clients,
                controller: env.controller,
                tasks,
                event_tx,
            },
            event_rx,
        ))
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Name of the cache this version owns.
    pub fn cache_name(&self) -> &str {
        &self.cache_name
    }

    pub async fn state(&self) -> WorkerState {
        self.retire_if_superseded().await;
        self.lifecycle.read().await.state()
    }

    /// Cache name of the version currently controlling the origin.
    pub async fn controller(&self) -> Option<String> {
        self.controller.read().await.clone()
    }

    /// Background tasks still running.
    pub async fn pending_tasks(&self) -> usize {
        self.tasks.pending().await
    }

    /// Shared cache storage.
    pub fn caches(&self) -> Arc<RwLock<CacheStorage>> {
        self.caches.clone()
    }

    /// Shared client list.
    pub fn clients(&self) -> Arc<RwLock<Clients>> {
        self.clients.clone()
    }

    pub async fn cache_names(&self) -> Vec<String> {
        self.caches.read().await.keys()
    }

    /// URLs stored in this version's cache.
    pub async fn cached_urls(&self) -> Vec<String> {
        self.caches
            .read()
            .await
            .get(&self.cache_name)
            .map(|c| c.keys().into_iter().map(str::to_string).collect())
            .unwrap_or_default()
    }

    pub fn sync_queue(&self) -> &SyncQueue {
        &self.sync
    }

    fn emit(&self, event: WorkerEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Turn redundant once another version has taken control.
    async fn retire_if_superseded(&self) {
        let superseded = self
            .controller
            .read()
            .await
            .as_deref()
            .is_some_and(|active| active != self.cache_name);
        if !superseded {
            return;
        }

        if self.lifecycle.write().await.supersede() {
            info!(cache = %self.cache_name, "Superseded by a newer version");
            self.emit(WorkerEvent::StateChange {
                state: WorkerState::Redundant,
            });
        }
    }

    async fn set_state<F>(&self, f: F) -> Result<(), ServiceWorkerError>
    where
        F: FnOnce(&mut Lifecycle) -> Result<(), ServiceWorkerError>,
    {
        let state = {
            let mut lifecycle = self.lifecycle.write().await;
            f(&mut lifecycle)?;
            lifecycle.state()
        };
        debug!(?state, "Worker state changed");
        self.emit(WorkerEvent::StateChange { state });
        Ok(())
    }

    // ==================== Lifecycle ====================

    /// Populate this version's cache with the manifest. Every entry must
    /// fetch successfully or nothing is written and the worker turns redundant.
    #[instrument(skip(self), fields(cache = %self.cache_name))]
    pub async fn install(&self) -> Result<(), ServiceWorkerError> {
        self.set_state(|l| l.begin_install()).await?;

        match self.fetch_manifest().await {
            Ok(entries) => {
                let count = entries.len();
                {
                    let mut caches = self.caches.write().await;
                    let cache = caches.open(&self.cache_name);
                    for entry in entries {
                        cache.put(entry);
                    }
                }
                self.set_state(|l| l.install_complete()).await?;
                info!(entries = count, "Install complete");
            }
            Err(e) => {
                warn!(error = %e, "Install failed, worker is redundant");
                self.set_state(|l| {
                    l.make_redundant();
                    Ok(())
                })
                .await?;
                return Err(e);
            }
        }

        if self.lifecycle.read().await.skip_waiting_requested() {
            self.activate().await?;
        }
        Ok(())
    }

    async fn fetch_manifest(&self) -> Result<Vec<CacheEntry>, ServiceWorkerError> {
        let retry = self.config.install_retry.to_retry_config();
        let mut entries = Vec::with_capacity(self.config.manifest.len());

        for path in &self.config.manifest {
            let url = self.config.resolve(path)?;
            let request = Request::get(url);

            let response = retry_with_backoff(&retry, || self.fetch_manifest_entry(&request))
                .await
                .map_err(|reason| ServiceWorkerError::InstallFailed {
                    url: request.url.to_string(),
                    reason,
                })?;
            entries.push(CacheEntry::new(&request, &response, now_ms()));
        }
        Ok(entries)
    }

    async fn fetch_manifest_entry(&self, request: &Request) -> Result<Response, String> {
        let response = self
            .network
            .fetch(request.clone())
            .await
            .map_err(|e| e.to_string())?;
        if response.ok() {
            Ok(response)
        } else {
            Err(format!("status {}", response.status))
        }
    }

    /// Activate now instead of waiting for older clients to go away. Before
    /// install completes this only records the request.
    pub async fn skip_waiting(&self) -> Result<(), ServiceWorkerError> {
        let state = {
            let mut lifecycle = self.lifecycle.write().await;
            lifecycle.request_skip_waiting();
            lifecycle.state()
        };
        if state == WorkerState::Installed {
            self.activate().await?;
        }
        Ok(())
    }

    /// Delete every cache but this version's and claim open clients.
    #[instrument(skip(self), fields(cache = %self.cache_name))]
    pub async fn activate(&self) -> Result<(), ServiceWorkerError> {
        self.set_state(|l| l.begin_activate()).await?;
        let previous = self.controller.write().await.replace(self.cache_name.clone());
        if let Some(previous) = previous.filter(|p| p != &self.cache_name) {
            debug!(previous = %previous, "Taking control from previous version");
        }

        let deleted: Vec<String> = {
            let mut caches = self.caches.write().await;
            let stale: Vec<String> = caches
                .keys()
                .into_iter()
                .filter(|name| name != &self.cache_name)
                .collect();
            for name in &stale {
                caches.delete(name);
            }
            stale
        };
        if !deleted.is_empty() {
            info!(deleted = ?deleted, "Deleted superseded caches");
            self.emit(WorkerEvent::CachesDeleted { names: deleted });
        }

        let claimed = self.clients.write().await.claim(&self.origin);
        debug!(claimed, "Claimed clients");
        self.emit(WorkerEvent::ClientsClaimed { count: claimed });

        self.set_state(|l| l.activate_complete()).await?;
        info!("Worker activated");
        Ok(())
    }

    // ==================== Fetch ====================

    /// Handle an intercepted request. Only the activated, controlling worker
    /// intercepts; otherwise the request passes through.
    pub async fn handle_fetch(&self, request: Request) -> FetchOutcome {
        self.retire_if_superseded().await;
        if !self.lifecycle.read().await.is_active() {
            return FetchOutcome::Passthrough(request);
        }

        let route = self.router.route(&request);
        debug!(url = %request.url, method = %request.method, ?route, "Routing fetch");

        match route {
            Route::Passthrough => FetchOutcome::Passthrough(request),
            Route::Network => self.policies.network_only(request).await,
            Route::Api => self.policies.stale_while_revalidate(request).await,
            Route::Static => self.policies.cache_first(request).await,
        }
    }

    /// Wait for all background work (revalidations) to finish.
    pub async fn settle(&self) -> usize {
        self.tasks.settle().await
    }

    // ==================== Background Sync ====================

    /// Queue a request that failed so the next sync replays it.
    pub async fn queue_failed_request(&self, request: &Request) -> Result<u64, ServiceWorkerError> {
        self.sync
            .enqueue(request.url.to_string(), request.to_options())
            .await
    }

    /// Queue a request given as a URL (absolute or origin-relative) and options bag.
    pub async fn queue_request(
        &self,
        url: &str,
        options: FetchOptions,
    ) -> Result<u64, ServiceWorkerError> {
        self.sync.enqueue(url, options).await
    }

    /// Handle a sync trigger. Tags other than the configured one are ignored.
    pub async fn handle_sync(&self, tag: &str) -> Result<Option<SyncReport>, ServiceWorkerError> {
        if tag != self.config.sync_tag {
            debug!(tag, "Ignoring sync event with unknown tag");
            return Ok(None);
        }

        let report = self.sync.drain().await?;
        self.emit(WorkerEvent::SyncCompleted(report));
        Ok(Some(report))
    }

    // ==================== Push ====================

    /// Turn a push message into a notification.
    pub fn handle_push(&self, payload: Option<&str>) -> Notification {
        let notification = Notification::from_push(payload, &self.config.notifications, now_ms());
        debug!(body = %notification.body, "Showing push notification");
        self.emit(WorkerEvent::ShowNotification(notification.clone()));
        notification
    }

    /// React to a notification click. `explore` focuses or opens the site root;
    /// anything else just closes the notification.
    pub async fn handle_notification_click(&self, action: &str) -> ClickOutcome {
        if action != ACTION_EXPLORE {
            self.emit(WorkerEvent::NotificationClosed);
            return ClickOutcome::Closed;
        }

        let mut clients = self.clients.write().await;
        if let Some(client) = clients.focus_url(&self.root) {
            self.emit(WorkerEvent::ClientFocused {
                client_id: client.id.clone(),
            });
            return ClickOutcome::Focused(client);
        }

        let client = clients.open_window(self.root.clone());
        info!(client_id = %client.id, url = %client.url, "Opened window from notification");
        self.emit(WorkerEvent::WindowOpened {
            client_id: client.id.clone(),
            url: client.url.clone(),
        });
        ClickOutcome::Opened(client)
    }
}
