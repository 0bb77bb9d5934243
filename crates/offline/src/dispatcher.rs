//! Cache-policy dispatcher: install/activate lifecycle, per-request strategy
//! resolution and control-plane messages.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};

use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::fetch::{cache_key, FetchError, FetchRequest, FetchResponse, Fetcher};
use crate::storage::CacheStorage;
use crate::strategy::{classify, Strategy};
use crate::sync::{Outbox, QueueKind, SyncReport};

/// Bumped by hand on every release; stores tagged with older versions are
/// evicted on activation.
pub const CACHE_VERSION: &str = "v1.0.0";
pub const STATIC_STORE_PREFIX: &str = "landing-static";
pub const RUNTIME_STORE: &str = "landing-runtime";
pub const OFFLINE_PAGE: &str = "/offline.html";

/// Assets fetched into the static store on install.
pub const PRECACHE_MANIFEST: &[&str] = &[
    "/",
    "/index.html",
    OFFLINE_PAGE,
    "/css/style.css",
    "/js/main.js",
    "/js/forms.js",
    "/manifest.json",
    "/images/favicon.svg",
];

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub origin: Url,
    pub version: String,
    pub runtime_store: String,
    pub manifest: Vec<String>,
    pub offline_page: String,
    /// Activate as soon as install finishes instead of waiting for
    /// `SKIP_WAITING`.
    pub activate_on_install: bool,
}

impl DispatcherConfig {
    pub fn new(origin: Url) -> Self {
        Self {
            origin,
            version: CACHE_VERSION.to_string(),
            runtime_store: RUNTIME_STORE.to_string(),
            manifest: PRECACHE_MANIFEST.iter().map(|s| s.to_string()).collect(),
            offline_page: OFFLINE_PAGE.to_string(),
            activate_on_install: true,
        }
    }

    /// Name of the version-tagged static store.
    pub fn static_store(&self) -> String {
        format!("{STATIC_STORE_PREFIX}-{}", self.version)
    }

    fn resolve(&self, path: &str) -> Result<Url, url::ParseError> {
        self.origin.join(path)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Installing,
    Installed,
    Activating,
    Active,
    /// Install failed; this dispatcher never takes control.
    Redundant,
}

/// Where a dispatched response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    Cache,
    Network,
    OfflinePage,
    Synthesized,
}

/// Result of [`Dispatcher::handle_fetch`].
#[derive(Debug)]
pub struct Dispatched {
    pub response: FetchResponse,
    pub source: ResponseSource,
    pub strategy: Option<Strategy>,
    /// Background refresh started by stale-while-revalidate.
    pub revalidation: Option<JoinHandle<()>>,
}

/// Messages the page posts to the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMessage {
    SkipWaiting,
    CacheUrls {
        urls: Vec<String>,
    },
    ClearCache {
        #[serde(default, rename = "cacheName")]
        cache_name: Option<String>,
    },
    GetCacheSize,
}

/// Replies sent back over the message channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlReply {
    Activated,
    UrlsCached {
        cached: usize,
        failed: usize,
    },
    CacheCleared {
        #[serde(rename = "cacheName")]
        cache_name: String,
        existed: bool,
    },
    CacheSize {
        bytes: u64,
    },
    Error {
        message: String,
    },
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("dispatcher is {actual:?}, expected {expected:?}")]
    InvalidState {
        expected: LifecycleState,
        actual: LifecycleState,
    },
    #[error("failed to precache {url}: {reason}")]
    InstallFailed { url: String, reason: String },
    #[error("unknown sync tag: {0}")]
    UnknownSyncTag(String),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
}

/// Intercepts fetches and resolves them against the cache stores.
///
/// Cloning is cheap; clones share state, caches and the outbox.
#[derive(Clone)]
pub struct Dispatcher {
    config: Arc<DispatcherConfig>,
    storage: Arc<dyn CacheStorage>,
    fetcher: Arc<dyn Fetcher>,
    outbox: Arc<Outbox>,
    state: Arc<Mutex<LifecycleState>>,
    controls_clients: Arc<AtomicBool>,
}

impl Dispatcher {
    pub fn new(
        config: DispatcherConfig,
        storage: Arc<dyn CacheStorage>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            storage,
            fetcher,
            outbox: Arc::new(Outbox::new()),
            state: Arc::new(Mutex::new(LifecycleState::Installing)),
            controls_clients: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn state(&self) -> LifecycleState {
        match self.state.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// `true` once activation claimed the open pages.
    pub fn controls_clients(&self) -> bool {
        self.controls_clients.load(Ordering::Acquire)
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    fn set_state(&self, next: LifecycleState) {
        let mut guard = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        debug!(stage = "offline", from = ?*guard, to = ?next, "lifecycle transition");
        *guard = next;
    }

    /// Precaches the manifest into the version-tagged store. Any failure
    /// leaves the dispatcher redundant and nothing is written.
    pub async fn install(&self) -> Result<(), DispatchError> {
        let state = self.state();
        if state != LifecycleState::Installing {
            return Err(DispatchError::InvalidState {
                expected: LifecycleState::Installing,
                actual: state,
            });
        }

        let mut fetched = Vec::with_capacity(self.config.manifest.len());
        for path in &self.config.manifest {
            let url = match self.config.resolve(path) {
                Ok(url) => url,
                Err(err) => {
                    self.set_state(LifecycleState::Redundant);
                    return Err(err.into());
                }
            };
            let request = FetchRequest::get(url);
            let failure = match self.fetcher.fetch(&request).await {
                Ok(response) if response.ok() => {
                    fetched.push((request.cache_key(), response));
                    continue;
                }
                Ok(response) => format!("status {}", response.status),
                Err(err) => err.to_string(),
            };
            warn!(stage = "offline", url = %request.url, reason = %failure, "precache failed");
            self.set_state(LifecycleState::Redundant);
            return Err(DispatchError::InstallFailed {
                url: request.url.to_string(),
                reason: failure,
            });
        }

        let store = self.config.static_store();
        let count = fetched.len();
        for (key, response) in fetched {
            self.storage.put(&store, &key, response).await;
        }
        self.set_state(LifecycleState::Installed);
        info!(stage = "offline", store = %store, assets = count, "install complete");
        Ok(())
    }

    /// Evicts stores from older versions and claims every open page.
    /// Returns the names of the deleted stores.
    pub async fn activate(&self) -> Result<Vec<String>, DispatchError> {
        let state = self.state();
        if state != LifecycleState::Installed {
            return Err(DispatchError::InvalidState {
                expected: LifecycleState::Installed,
                actual: state,
            });
        }
        self.set_state(LifecycleState::Activating);

        let keep = [self.config.static_store(), self.config.runtime_store.clone()];
        let mut deleted = Vec::new();
        for name in self.storage.store_names().await {
            if keep.contains(&name) {
                continue;
            }
            if self.storage.delete_store(&name).await {
                info!(stage = "offline", store = %name, "deleted stale cache store");
                deleted.push(name);
            }
        }

        self.controls_clients.store(true, Ordering::Release);
        self.set_state(LifecycleState::Active);
        Ok(deleted)
    }

    /// Resolves one request. Always yields a response: failures fall back to
    /// the offline page for navigations or a synthesized 503.
    pub async fn handle_fetch(&self, request: FetchRequest) -> Dispatched {
        let intercept = self.state() == LifecycleState::Active
            && request.method == Method::GET
            && matches!(request.url.scheme(), "http" | "https");

        if !intercept {
            return match self.fetcher.fetch(&request).await {
                Ok(response) => Dispatched {
                    response,
                    source: ResponseSource::Network,
                    strategy: None,
                    revalidation: None,
                },
                Err(err) => self.fallback(&request, None, err).await,
            };
        }

        let strategy = classify(&request).strategy();
        debug!(stage = "offline", url = %request.url, strategy = strategy.as_str(), "dispatching fetch");
        let outcome = match strategy {
            Strategy::CacheFirst => self
                .cache_first(&request)
                .await
                .map(|(response, source)| (response, source, None)),
            Strategy::NetworkFirst => self
                .network_first(&request)
                .await
                .map(|(response, source)| (response, source, None)),
            Strategy::StaleWhileRevalidate => self.stale_while_revalidate(&request).await,
        };

        match outcome {
            Ok((response, source, revalidation)) => Dispatched {
                response,
                source,
                strategy: Some(strategy),
                revalidation,
            },
            Err(err) => self.fallback(&request, Some(strategy), err).await,
        }
    }

    /// Serves from cache when present; otherwise fetches and stores 2xx
    /// responses.
    pub async fn cache_first(
        &self,
        request: &FetchRequest,
    ) -> Result<(FetchResponse, ResponseSource), FetchError> {
        let key = request.cache_key();
        if let Some(cached) = self.storage.match_any(&key).await {
            return Ok((cached, ResponseSource::Cache));
        }

        let response = self.fetcher.fetch(request).await?;
        if response.ok() {
            self.storage
                .put(&self.config.runtime_store, &key, response.clone())
                .await;
        }
        Ok((response, ResponseSource::Network))
    }

    /// Prefers the network and falls back to any cached copy when the
    /// network fails. Without a cached copy the failure propagates.
    pub async fn network_first(
        &self,
        request: &FetchRequest,
    ) -> Result<(FetchResponse, ResponseSource), FetchError> {
        let key = request.cache_key();
        match self.fetcher.fetch(request).await {
            Ok(response) => {
                if response.ok() {
                    self.storage
                        .put(&self.config.runtime_store, &key, response.clone())
                        .await;
                }
                Ok((response, ResponseSource::Network))
            }
            Err(err) => match self.storage.match_any(&key).await {
                Some(cached) => {
                    debug!(stage = "offline", url = %request.url, error = %err, "network failed, serving cached copy");
                    Ok((cached, ResponseSource::Cache))
                }
                None => Err(err),
            },
        }
    }

    /// Returns the cached copy immediately and refreshes it in the
    /// background; without a cached copy the caller waits on the network.
    pub async fn stale_while_revalidate(
        &self,
        request: &FetchRequest,
    ) -> Result<(FetchResponse, ResponseSource, Option<JoinHandle<()>>), FetchError> {
        let key = request.cache_key();
        match self.storage.match_any(&key).await {
            Some(cached) => {
                let this = self.clone();
                let request = request.clone();
                let refresh = tokio::spawn(async move {
                    match this.fetcher.fetch(&request).await {
                        Ok(response) if response.ok() => {
                            this.storage
                                .put(&this.config.runtime_store, &key, response)
                                .await;
                        }
                        Ok(response) => {
                            debug!(stage = "offline", url = %request.url, status = response.status, "revalidation skipped non-2xx");
                        }
                        Err(err) => {
                            debug!(stage = "offline", url = %request.url, error = %err, "revalidation failed");
                        }
                    }
                });
                Ok((cached, ResponseSource::Cache, Some(refresh)))
            }
            None => {
                let response = self.fetcher.fetch(request).await?;
                if response.ok() {
                    self.storage
                        .put(&self.config.runtime_store, &key, response.clone())
                        .await;
                }
                Ok((response, ResponseSource::Network, None))
            }
        }
    }

    async fn fallback(
        &self,
        request: &FetchRequest,
        strategy: Option<Strategy>,
        err: FetchError,
    ) -> Dispatched {
        warn!(stage = "offline", url = %request.url, error = %err, "fetch failed, serving fallback");

        if request.is_navigation() {
            if let Ok(url) = self.config.resolve(&self.config.offline_page) {
                if let Some(page) = self.storage.match_any(&cache_key(&url)).await {
                    return Dispatched {
                        response: page,
                        source: ResponseSource::OfflinePage,
                        strategy,
                        revalidation: None,
                    };
                }
            }
        }

        Dispatched {
            response: offline_response(),
            source: ResponseSource::Synthesized,
            strategy,
            revalidation: None,
        }
    }

    /// Handles a control-plane message from the page.
    pub async fn handle_message(&self, message: ControlMessage) -> ControlReply {
        match message {
            ControlMessage::SkipWaiting => match self.activate().await {
                Ok(_) => ControlReply::Activated,
                Err(err) => ControlReply::Error {
                    message: err.to_string(),
                },
            },
            ControlMessage::CacheUrls { urls } => {
                let mut cached = 0;
                let mut failed = 0;
                for raw in urls {
                    let Ok(url) = self.config.resolve(&raw) else {
                        failed += 1;
                        continue;
                    };
                    let request = FetchRequest::get(url);
                    match self.fetcher.fetch(&request).await {
                        Ok(response) if response.ok() => {
                            self.storage
                                .put(&self.config.runtime_store, &request.cache_key(), response)
                                .await;
                            cached += 1;
                        }
                        _ => failed += 1,
                    }
                }
                ControlReply::UrlsCached { cached, failed }
            }
            ControlMessage::ClearCache { cache_name } => {
                let cache_name = cache_name.unwrap_or_else(|| self.config.runtime_store.clone());
                let existed = self.storage.delete_store(&cache_name).await;
                ControlReply::CacheCleared {
                    cache_name,
                    existed,
                }
            }
            ControlMessage::GetCacheSize => ControlReply::CacheSize {
                bytes: self.storage.total_bytes().await,
            },
        }
    }

    /// Queues a payload for delivery on the next matching sync trigger.
    pub fn queue(
        &self,
        kind: QueueKind,
        endpoint: &str,
        payload: serde_json::Value,
    ) -> Result<u64, DispatchError> {
        let url = self.config.resolve(endpoint)?;
        Ok(self.outbox.enqueue(kind, url, payload))
    }

    /// Background sync trigger (`sync-forms` / `sync-analytics`).
    pub async fn sync(&self, tag: &str) -> Result<SyncReport, DispatchError> {
        let kind =
            QueueKind::from_tag(tag).ok_or_else(|| DispatchError::UnknownSyncTag(tag.to_string()))?;
        let report = self.outbox.flush(kind, self.fetcher.as_ref()).await;
        info!(stage = "offline", tag, sent = report.sent, failed = report.failed, remaining = report.remaining, "background sync finished");
        Ok(report)
    }
}

/// Synthesized response used when neither network nor cache can answer.
pub fn offline_response() -> FetchResponse {
    FetchResponse::json(
        503,
        &json!({ "error": "Network unavailable", "offline": true }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryCacheStorage;
    use async_trait::async_trait;
    use std::collections::HashMap;

    /// Serves canned bodies per path and records every hit.
    #[derive(Default)]
    struct StubNetwork {
        routes: Mutex<HashMap<String, FetchResponse>>,
        offline: AtomicBool,
        hits: Mutex<Vec<String>>,
    }

    impl StubNetwork {
        fn with(self, path: &str, status: u16, body: &str) -> Self {
            self.routes
                .lock()
                .expect("routes")
                .insert(path.to_string(), FetchResponse::new(status, body));
            self
        }

        fn set_offline(&self, offline: bool) {
            self.offline.store(offline, Ordering::SeqCst);
        }

        fn hits(&self, path: &str) -> usize {
            self.hits
                .lock()
                .expect("hits")
                .iter()
                .filter(|hit| hit.as_str() == path)
                .count()
        }
    }

    #[async_trait]
    impl Fetcher for StubNetwork {
        async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, FetchError> {
            let path = request.url.path().to_string();
            self.hits.lock().expect("hits").push(path.clone());
            if self.offline.load(Ordering::SeqCst) {
                return Err(FetchError::Network("offline".into()));
            }
            Ok(self
                .routes
                .lock()
                .expect("routes")
                .get(&path)
                .cloned()
                .unwrap_or_else(|| FetchResponse::new(404, "missing")))
        }
    }

    fn origin() -> Url {
        Url::parse("https://example.com").expect("origin")
    }

    fn url(path: &str) -> Url {
        origin().join(path).expect("url")
    }

    fn site() -> StubNetwork {
        PRECACHE_MANIFEST
            .iter()
            .fold(StubNetwork::default(), |net, path| net.with(path, 200, path))
    }

    fn dispatcher_with(
        network: Arc<StubNetwork>,
    ) -> (Dispatcher, Arc<MemoryCacheStorage>) {
        let storage = Arc::new(MemoryCacheStorage::new());
        let dispatcher = Dispatcher::new(
            DispatcherConfig::new(origin()),
            storage.clone(),
            network,
        );
        (dispatcher, storage)
    }

    async fn active(network: Arc<StubNetwork>) -> (Dispatcher, Arc<MemoryCacheStorage>) {
        let (dispatcher, storage) = dispatcher_with(network);
        dispatcher.install().await.expect("install");
        dispatcher.activate().await.expect("activate");
        (dispatcher, storage)
    }

    #[tokio::test]
    async fn install_precaches_manifest_into_versioned_store() {
        let network = Arc::new(site());
        let (dispatcher, storage) = dispatcher_with(network);

        dispatcher.install().await.expect("install");

        assert_eq!(dispatcher.state(), LifecycleState::Installed);
        let keys = storage.keys("landing-static-v1.0.0").await;
        assert_eq!(keys.len(), PRECACHE_MANIFEST.len());
        assert!(keys.contains(&"https://example.com/offline.html".to_string()));
    }

    #[tokio::test]
    async fn failed_precache_leaves_dispatcher_redundant() {
        let network = Arc::new(site().with("/js/forms.js", 500, "boom"));
        let (dispatcher, storage) = dispatcher_with(network);

        let err = dispatcher.install().await.expect_err("install fails");
        assert!(matches!(err, DispatchError::InstallFailed { .. }));
        assert_eq!(dispatcher.state(), LifecycleState::Redundant);
        assert!(storage.store_names().await.is_empty());
        assert!(dispatcher.activate().await.is_err());
    }

    #[tokio::test]
    async fn activation_evicts_only_stale_stores() {
        let network = Arc::new(site());
        let (dispatcher, storage) = dispatcher_with(network);
        storage
            .put("landing-static-v0.9.0", "k", FetchResponse::new(200, "old"))
            .await;
        storage
            .put("someone-elses-cache", "k", FetchResponse::new(200, "x"))
            .await;
        storage
            .put(RUNTIME_STORE, "k", FetchResponse::new(200, "runtime"))
            .await;

        dispatcher.install().await.expect("install");
        assert!(!dispatcher.controls_clients());
        let mut deleted = dispatcher.activate().await.expect("activate");
        deleted.sort();

        assert_eq!(
            deleted,
            vec![
                "landing-static-v0.9.0".to_string(),
                "someone-elses-cache".to_string()
            ]
        );
        let mut remaining = storage.store_names().await;
        remaining.sort();
        assert_eq!(
            remaining,
            vec![RUNTIME_STORE.to_string(), "landing-static-v1.0.0".to_string()]
        );
        assert_eq!(dispatcher.state(), LifecycleState::Active);
        assert!(dispatcher.controls_clients());
    }

    #[tokio::test]
    async fn cache_first_hit_never_touches_network() {
        let network = Arc::new(StubNetwork::default());
        let (dispatcher, storage) = dispatcher_with(network.clone());
        storage
            .put(
                RUNTIME_STORE,
                &cache_key(&url("/assets/style.css")),
                FetchResponse::new(200, "cached-css"),
            )
            .await;

        let (response, source) = dispatcher
            .cache_first(&FetchRequest::get(url("/assets/style.css")))
            .await
            .expect("cache hit");

        assert_eq!(source, ResponseSource::Cache);
        assert_eq!(response.body, b"cached-css".to_vec());
        assert_eq!(network.hits("/assets/style.css"), 0);
    }

    #[tokio::test]
    async fn cache_first_miss_stores_only_successful_responses() {
        let network = Arc::new(
            StubNetwork::default()
                .with("/images/logo.png", 200, "png")
                .with("/images/gone.png", 404, "nope"),
        );
        let (dispatcher, storage) = dispatcher_with(network.clone());

        let (_, source) = dispatcher
            .cache_first(&FetchRequest::get(url("/images/logo.png")))
            .await
            .expect("fetch");
        assert_eq!(source, ResponseSource::Network);
        dispatcher
            .cache_first(&FetchRequest::get(url("/images/logo.png")))
            .await
            .expect("fetch");
        assert_eq!(network.hits("/images/logo.png"), 1);

        let (response, _) = dispatcher
            .cache_first(&FetchRequest::get(url("/images/gone.png")))
            .await
            .expect("fetch");
        assert_eq!(response.status, 404);
        assert!(storage
            .match_any("https://example.com/images/gone.png")
            .await
            .is_none());
    }

    #[tokio::test]
    async fn network_first_falls_back_to_cache_then_propagates() {
        let network = Arc::new(StubNetwork::default().with("/api/data", 200, "fresh"));
        let (dispatcher, _) = dispatcher_with(network.clone());
        let request = FetchRequest::get(url("/api/data"));

        let (response, source) = dispatcher.network_first(&request).await.expect("online");
        assert_eq!(source, ResponseSource::Network);
        assert_eq!(response.body, b"fresh".to_vec());

        network.set_offline(true);
        let (response, source) = dispatcher.network_first(&request).await.expect("cached");
        assert_eq!(source, ResponseSource::Cache);
        assert_eq!(response.body, b"fresh".to_vec());

        let other = FetchRequest::get(url("/api/other"));
        let err = dispatcher
            .network_first(&other)
            .await
            .expect_err("nothing cached");
        assert!(matches!(err, FetchError::Network(_)));
    }

    #[tokio::test]
    async fn stale_while_revalidate_serves_cache_and_refreshes() {
        let network = Arc::new(StubNetwork::default().with("/pricing", 200, "v2"));
        let (dispatcher, storage) = dispatcher_with(network.clone());
        let key = cache_key(&url("/pricing"));
        storage
            .put(RUNTIME_STORE, &key, FetchResponse::new(200, "v1"))
            .await;

        let (response, source, refresh) = dispatcher
            .stale_while_revalidate(&FetchRequest::get(url("/pricing")))
            .await
            .expect("swr");
        assert_eq!(source, ResponseSource::Cache);
        assert_eq!(response.body, b"v1".to_vec());

        refresh.expect("refresh task").await.expect("refresh joins");
        let refreshed = storage.match_in(RUNTIME_STORE, &key).await.expect("entry");
        assert_eq!(refreshed.body, b"v2".to_vec());
    }

    #[tokio::test]
    async fn stale_while_revalidate_miss_waits_for_network() {
        let network = Arc::new(StubNetwork::default().with("/about", 200, "about"));
        let (dispatcher, storage) = dispatcher_with(network);

        let (response, source, refresh) = dispatcher
            .stale_while_revalidate(&FetchRequest::get(url("/about")))
            .await
            .expect("swr");
        assert_eq!(source, ResponseSource::Network);
        assert_eq!(response.body, b"about".to_vec());
        assert!(refresh.is_none());
        assert!(storage
            .match_any("https://example.com/about")
            .await
            .is_some());
    }

    #[tokio::test]
    async fn navigation_failure_serves_offline_page() {
        let network = Arc::new(site());
        let (dispatcher, _) = active(network.clone()).await;
        network.set_offline(true);

        let dispatched = dispatcher
            .handle_fetch(FetchRequest::navigate(url("/contact")))
            .await;

        assert_eq!(dispatched.source, ResponseSource::OfflinePage);
        assert_eq!(dispatched.strategy, Some(Strategy::StaleWhileRevalidate));
        assert_eq!(dispatched.response.body, OFFLINE_PAGE.as_bytes().to_vec());
    }

    #[tokio::test]
    async fn failure_without_offline_page_synthesizes_503() {
        let network = Arc::new(StubNetwork::default());
        network.set_offline(true);
        let storage = Arc::new(MemoryCacheStorage::new());
        let mut config = DispatcherConfig::new(origin());
        config.manifest.clear();
        let dispatcher = Dispatcher::new(config, storage, network);
        dispatcher.install().await.expect("empty install");
        dispatcher.activate().await.expect("activate");

        let dispatched = dispatcher
            .handle_fetch(FetchRequest::navigate(url("/contact")))
            .await;

        assert_eq!(dispatched.source, ResponseSource::Synthesized);
        assert_eq!(dispatched.response.status, 503);
        let body: serde_json::Value =
            serde_json::from_slice(&dispatched.response.body).expect("json body");
        assert_eq!(body["error"], "Network unavailable");
        assert_eq!(body["offline"], true);
    }

    #[tokio::test]
    async fn handle_fetch_dispatches_by_class() {
        let network = Arc::new(site().with("/api/data", 200, "api"));
        let (dispatcher, _) = active(network.clone()).await;

        let css = dispatcher
            .handle_fetch(FetchRequest::get(url("/css/style.css")))
            .await;
        assert_eq!(css.strategy, Some(Strategy::CacheFirst));
        assert_eq!(css.source, ResponseSource::Cache);
        assert_eq!(network.hits("/css/style.css"), 1, "only the precache fetch");

        let api = dispatcher.handle_fetch(FetchRequest::get(url("/api/data"))).await;
        assert_eq!(api.strategy, Some(Strategy::NetworkFirst));
        assert_eq!(api.source, ResponseSource::Network);
    }

    #[tokio::test]
    async fn non_get_requests_bypass_caches() {
        let network = Arc::new(site().with("/email-capture", 201, "{}"));
        let (dispatcher, storage) = active(network).await;
        let before = storage.total_bytes().await;

        let dispatched = dispatcher
            .handle_fetch(FetchRequest::post_json(
                url("/email-capture"),
                &json!({ "email": "a@b.co" }),
            ))
            .await;

        assert_eq!(dispatched.strategy, None);
        assert_eq!(dispatched.response.status, 201);
        assert_eq!(storage.total_bytes().await, before);
    }

    #[tokio::test]
    async fn control_messages_round_trip() {
        let network = Arc::new(site().with("/images/hero.png", 200, "hero"));
        let (dispatcher, storage) = dispatcher_with(network);
        dispatcher.install().await.expect("install");

        assert_eq!(
            dispatcher.handle_message(ControlMessage::SkipWaiting).await,
            ControlReply::Activated
        );
        assert!(matches!(
            dispatcher.handle_message(ControlMessage::SkipWaiting).await,
            ControlReply::Error { .. }
        ));

        let reply = dispatcher
            .handle_message(ControlMessage::CacheUrls {
                urls: vec!["/images/hero.png".into(), "/missing.png".into()],
            })
            .await;
        assert_eq!(reply, ControlReply::UrlsCached { cached: 1, failed: 1 });

        let expected: u64 = PRECACHE_MANIFEST.iter().map(|p| p.len() as u64).sum::<u64>() + 4;
        assert_eq!(
            dispatcher.handle_message(ControlMessage::GetCacheSize).await,
            ControlReply::CacheSize { bytes: expected }
        );

        let reply = dispatcher
            .handle_message(ControlMessage::ClearCache { cache_name: None })
            .await;
        assert_eq!(
            reply,
            ControlReply::CacheCleared {
                cache_name: RUNTIME_STORE.into(),
                existed: true
            }
        );
        assert!(storage.match_any("https://example.com/images/hero.png").await.is_none());
    }

    #[test]
    fn control_messages_parse_from_page_json() {
        let parsed: ControlMessage =
            serde_json::from_str(r#"{"type":"SKIP_WAITING"}"#).expect("skip");
        assert_eq!(parsed, ControlMessage::SkipWaiting);

        let parsed: ControlMessage =
            serde_json::from_str(r#"{"type":"CLEAR_CACHE","cacheName":"old"}"#).expect("clear");
        assert_eq!(
            parsed,
            ControlMessage::ClearCache {
                cache_name: Some("old".into())
            }
        );

        let parsed: ControlMessage =
            serde_json::from_str(r#"{"type":"CLEAR_CACHE"}"#).expect("clear default");
        assert_eq!(parsed, ControlMessage::ClearCache { cache_name: None });

        let parsed: ControlMessage =
            serde_json::from_str(r#"{"type":"CACHE_URLS","urls":["/a","/b"]}"#).expect("urls");
        assert!(matches!(parsed, ControlMessage::CacheUrls { urls } if urls.len() == 2));

        let reply = serde_json::to_value(ControlReply::CacheSize { bytes: 42 }).expect("reply");
        assert_eq!(reply, json!({ "type": "CACHE_SIZE", "bytes": 42 }));
    }

    #[tokio::test]
    async fn sync_flushes_queued_submissions() {
        let network = Arc::new(StubNetwork::default().with("/email-capture", 201, "{}"));
        let (dispatcher, _) = dispatcher_with(network.clone());
        dispatcher
            .queue(
                QueueKind::FormSubmissions,
                "/email-capture",
                json!({ "email": "a@b.co" }),
            )
            .expect("queue");

        let report = dispatcher.sync("sync-forms").await.expect("sync");
        assert_eq!(report.sent, 1);
        assert_eq!(report.remaining, 0);
        assert_eq!(network.hits("/email-capture"), 1);

        assert!(matches!(
            dispatcher.sync("sync-unknown").await,
            Err(DispatchError::UnknownSyncTag(_))
        ));
    }
}
