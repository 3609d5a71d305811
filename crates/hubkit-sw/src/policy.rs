//! Caching policies: stale-while-revalidate for API traffic, cache-first for
//! static assets.

use std::sync::Arc;
use std::time::Duration;

use http::StatusCode;
use hubkit_common::with_timeout;
use hubkit_net::{Fetcher, NetError, PatternSet, Request, Response, ResponseType};
use tokio::sync::RwLock;
use tracing::{debug, trace};

use crate::cache::{CacheEntry, CacheStorage};
use crate::offline;
use crate::tasks::WaitUntil;
use crate::now_ms;

// ==================== Outcome ====================

/// Where a worker response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    Cache,
    Network,
    /// Synthesized offline response.
    Fallback,
}

/// Result of handling an intercepted fetch.
#[derive(Debug)]
pub enum FetchOutcome {
    /// The worker declined the request; the caller fetches it itself.
    Passthrough(Request),
    /// The worker produced a response.
    Response {
        response: Response,
        source: ResponseSource,
    },
    /// The network failed and no fallback applies.
    Error(NetError),
}

impl FetchOutcome {
    fn from_cache(entry: &CacheEntry) -> Self {
        Self::Response {
            response: entry.to_response(),
            source: ResponseSource::Cache,
        }
    }

    fn network(response: Response) -> Self {
        Self::Response {
            response,
            source: ResponseSource::Network,
        }
    }

    fn fallback(response: Response) -> Self {
        Self::Response {
            response,
            source: ResponseSource::Fallback,
        }
    }

    pub fn response(&self) -> Option<&Response> {
        match self {
            Self::Response { response, .. } => Some(response),
            _ => None,
        }
    }

    pub fn into_response(self) -> Option<Response> {
        match self {
            Self::Response { response, .. } => Some(response),
            _ => None,
        }
    }

    pub fn source(&self) -> Option<ResponseSource> {
        match self {
            Self::Response { source, .. } => Some(*source),
            _ => None,
        }
    }

    pub fn is_passthrough(&self) -> bool {
        matches!(self, Self::Passthrough(_))
    }

    pub fn error(&self) -> Option<&NetError> {
        match self {
            Self::Error(e) => Some(e),
            _ => None,
        }
    }

    /// Collapse into a fetch result; a passthrough counts as a failure.
    pub fn into_result(self) -> Result<Response, NetError> {
        match self {
            Self::Response { response, .. } => Ok(response),
            Self::Error(e) => Err(e),
            Self::Passthrough(request) => Err(NetError::RequestFailed(format!(
                "{} was not intercepted",
                request.url
            ))),
        }
    }
}

// ==================== Network ====================

/// Fetcher plus the optional per-request timeout.
#[derive(Clone)]
pub struct Network {
    fetcher: Arc<dyn Fetcher>,
    timeout: Option<Duration>,
}

impl Network {
    pub fn new(fetcher: Arc<dyn Fetcher>, timeout: Option<Duration>) -> Self {
        Self { fetcher, timeout }
    }

    pub async fn fetch(&self, request: Request) -> Result<Response, NetError> {
        match self.timeout {
            Some(limit) => with_timeout(limit, || self.fetcher.fetch(request))
                .await
                .map_err(|_| NetError::Timeout(limit))?,
            None => self.fetcher.fetch(request).await,
        }
    }
}

// ==================== Policies ====================

/// The two caching policies over one versioned cache.
#[derive(Clone)]
pub struct CachePolicies {
    caches: Arc<RwLock<CacheStorage>>,
    cache_name: String,
    network: Network,
    cacheable: PatternSet,
    tasks: WaitUntil,
}

impl CachePolicies {
    pub fn new(
        caches: Arc<RwLock<CacheStorage>>,
        cache_name: String,
        network: Network,
        cacheable: PatternSet,
        tasks: WaitUntil,
    ) -> Self {
        Self {
            caches,
            cache_name,
            network,
            cacheable,
            tasks,
        }
    }

    async fn lookup(&self, request: &Request) -> Option<CacheEntry> {
        self.caches.read().await.match_in(&self.cache_name, request)
    }

    /// Write into this version's cache. A cache deleted by a newer version's
    /// activation stays deleted.
    async fn store(&self, request: &Request, response: &Response) {
        let entry = CacheEntry::new(request, response, now_ms());
        match self.caches.write().await.get_mut(&self.cache_name) {
            Some(cache) => {
                cache.put(entry);
                trace!(url = %request.url, cache = %self.cache_name, "Stored response");
            }
            None => {
                debug!(url = %request.url, cache = %self.cache_name, "Cache is gone, response not stored");
            }
        }
    }

    /// Serve from cache when possible and refresh the entry in the background;
    /// on a miss go to the network, falling back to a 503 JSON body.
    pub async fn stale_while_revalidate(&self, request: Request) -> FetchOutcome {
        if let Some(entry) = self.lookup(&request).await {
            debug!(url = %request.url, "API cache hit, revalidating in background");
            let policy = self.clone();
            self.tasks
                .spawn(async move { policy.revalidate(request).await })
                .await;
            return FetchOutcome::from_cache(&entry);
        }

        match self.network.fetch(request.clone()).await {
            Ok(response) => {
                if response.ok() {
                    self.store(&request, &response).await;
                }
                FetchOutcome::network(response)
            }
            Err(e) => {
                debug!(url = %request.url, error = %e, "API fetch failed with no cached copy");
                FetchOutcome::fallback(offline::api_offline())
            }
        }
    }

    async fn revalidate(&self, request: Request) {
        match self.network.fetch(request.clone()).await {
            Ok(response) if response.ok() => {
                self.store(&request, &response).await;
                debug!(url = %request.url, "Revalidated cached API response");
            }
            Ok(response) => {
                debug!(url = %request.url, status = %response.status, "Revalidation kept stale entry");
            }
            Err(e) => {
                debug!(url = %request.url, error = %e, "Background revalidation failed");
            }
        }
    }

    /// Serve from cache without touching the network; on a miss fetch and keep
    /// a copy of cacheable same-origin successes.
    pub async fn cache_first(&self, request: Request) -> FetchOutcome {
        if let Some(entry) = self.lookup(&request).await {
            trace!(url = %request.url, "Static cache hit");
            return FetchOutcome::from_cache(&entry);
        }

        match self.network.fetch(request.clone()).await {
            Ok(response) => {
                if is_storable(&response) && self.cacheable.matches(&request.url) {
                    self.store(&request, &response).await;
                } else {
                    trace!(
                        url = %request.url,
                        status = %response.status,
                        response_type = ?response.response_type,
                        redirected = response.redirected,
                        "Static response not cached"
                    );
                }
                FetchOutcome::network(response)
            }
            Err(e) if request.accepts_html() => {
                debug!(url = %request.url, error = %e, "Navigation failed, serving offline page");
                FetchOutcome::fallback(offline::offline_page())
            }
            Err(e) => {
                debug!(url = %request.url, error = %e, "Static fetch failed");
                FetchOutcome::Error(e)
            }
        }
    }

    /// Forward a request untouched.
    pub async fn network_only(&self, request: Request) -> FetchOutcome {
        match self.network.fetch(request).await {
            Ok(response) => FetchOutcome::network(response),
            Err(e) => FetchOutcome::Error(e),
        }
    }
}

/// Only plain 200, same-origin, non-redirected responses are kept.
fn is_storable(response: &Response) -> bool {
    response.status == StatusCode::OK
        && response.response_type == ResponseType::Basic
        && !response.redirected
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use url::Url;

    const CACHE: &str = "test-v1";

    /// Answers every request with a fixed response, or fails when `offline`.
    struct StubFetcher {
        response: Option<Response>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Fetcher for StubFetcher {
        async fn fetch(&self, _request: Request) -> Result<Response, NetError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.response
                .clone()
                .ok_or_else(|| NetError::Offline("stub".into()))
        }
    }

    /// Never answers.
    struct HangingFetcher;

    #[async_trait]
    impl Fetcher for HangingFetcher {
        async fn fetch(&self, _request: Request) -> Result<Response, NetError> {
            std::future::pending().await
        }
    }

    fn policies(fetcher: Arc<dyn Fetcher>, timeout: Option<Duration>) -> CachePolicies {
        let mut storage = CacheStorage::new();
        storage.open(CACHE);
        CachePolicies::new(
            Arc::new(RwLock::new(storage)),
            CACHE.to_string(),
            Network::new(fetcher, timeout),
            PatternSet::extensions([".js", ".css", ".png"]),
            WaitUntil::new(),
        )
    }

    fn stub(response: Option<Response>) -> Arc<StubFetcher> {
        Arc::new(StubFetcher {
            response,
            calls: AtomicUsize::new(0),
        })
    }

    fn get(s: &str) -> Request {
        Request::get(Url::parse(s).unwrap())
    }

    fn ok_body(body: &'static str) -> Response {
        Response::new(StatusCode::OK).with_body(body)
    }

    async fn cached(p: &CachePolicies, request: &Request) -> bool {
        p.lookup(request).await.is_some()
    }

    #[tokio::test]
    async fn test_static_skips_redirected_and_cors() {
        let redirected = stub(Some(ok_body("x").with_redirected(true)));
        let p = policies(redirected, None);
        let request = get("https://hub.example/app.js");
        p.cache_first(request.clone()).await;
        assert!(!cached(&p, &request).await);

        let cors = stub(Some(ok_body("x").with_type(ResponseType::Cors)));
        let p = policies(cors, None);
        p.cache_first(request.clone()).await;
        assert!(!cached(&p, &request).await);
    }

    #[tokio::test]
    async fn test_static_non_200_returned_not_cached() {
        let p = policies(stub(Some(Response::new(StatusCode::NOT_FOUND))), None);
        let request = get("https://hub.example/missing.css");

        let outcome = p.cache_first(request.clone()).await;
        assert_eq!(outcome.response().unwrap().status, StatusCode::NOT_FOUND);
        assert!(!cached(&p, &request).await);
    }

    #[tokio::test]
    async fn test_static_hit_skips_network() {
        let fetcher = stub(Some(ok_body("body{}")));
        let p = policies(fetcher.clone(), None);
        let request = get("https://hub.example/site.css");

        p.cache_first(request.clone()).await;
        let outcome = p.cache_first(request).await;

        assert_eq!(outcome.source(), Some(ResponseSource::Cache));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(p.tasks.pending().await, 0);
    }

    #[tokio::test]
    async fn test_static_offline_without_html_is_error() {
        let p = policies(stub(None), None);
        let outcome = p.cache_first(get("https://hub.example/logo.png")).await;
        assert!(matches!(outcome.error(), Some(NetError::Offline(_))));
    }

    #[tokio::test]
    async fn test_api_non_success_not_cached() {
        let p = policies(stub(Some(Response::new(StatusCode::INTERNAL_SERVER_ERROR))), None);
        let request = get("https://hub.example/api/programs");

        let outcome = p.stale_while_revalidate(request.clone()).await;
        assert_eq!(outcome.source(), Some(ResponseSource::Network));
        assert_eq!(
            outcome.response().unwrap().status,
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert!(!cached(&p, &request).await);
    }

    #[tokio::test]
    async fn test_api_fallback_not_cached() {
        let p = policies(stub(None), None);
        let request = get("https://hub.example/api/programs");

        let outcome = p.stale_while_revalidate(request.clone()).await;
        assert_eq!(outcome.source(), Some(ResponseSource::Fallback));
        assert!(!cached(&p, &request).await);
    }

    #[tokio::test]
    async fn test_failed_revalidation_keeps_stale_entry() {
        let p = policies(stub(None), None);
        let request = get("https://hub.example/api/programs");
        p.store(&request, &ok_body("stale")).await;

        let outcome = p.stale_while_revalidate(request.clone()).await;
        assert_eq!(outcome.response().unwrap().text(), "stale");
        assert_eq!(p.tasks.settle().await, 1);
        assert_eq!(p.lookup(&request).await.unwrap().body, "stale");
    }

    #[tokio::test]
    async fn test_deleted_cache_is_not_recreated() {
        let p = policies(stub(Some(ok_body("fresh"))), None);
        let request = get("https://hub.example/api/programs");
        p.store(&request, &ok_body("stale")).await;

        let outcome = p.stale_while_revalidate(request.clone()).await;
        assert_eq!(outcome.source(), Some(ResponseSource::Cache));
        // A newer version activates while the refresh is still queued.
        p.caches.write().await.delete(CACHE);
        p.tasks.settle().await;

        let outcome = p.cache_first(get("https://hub.example/app.js")).await;
        assert_eq!(outcome.source(), Some(ResponseSource::Network));
        assert!(p.caches.read().await.keys().is_empty());
    }

    #[tokio::test]
    async fn test_timeout_counts_as_network_failure() {
        let p = policies(Arc::new(HangingFetcher), Some(Duration::from_millis(20)));
        let outcome = p.stale_while_revalidate(get("https://hub.example/api/programs")).await;
        assert_eq!(outcome.response().unwrap().status, StatusCode::SERVICE_UNAVAILABLE);

        let outcome = p.network_only(get("https://hub.example/api/programs")).await;
        assert!(matches!(outcome.error(), Some(NetError::Timeout(_))));
    }
}
