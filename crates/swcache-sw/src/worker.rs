//! The offline worker: one deployed version of the caching policy.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use swcache_common::{maybe_with_timeout, SwCacheError};
use swcache_net::{Fetcher, NetError, Request, Response, Url};
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::clients::Clients;
use crate::config::{CacheNames, WorkerConfig};
use crate::event::{FetchEvent, FetchOutcome};
use crate::lifecycle::WorkerState;
use crate::router::{CacheSlot, Router, Strategy};
use crate::storage::CacheStorage;
use crate::ServiceWorkerError;

/// Unique identifier for a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId(u64);

impl WorkerId {
    pub(crate) fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// A worker instance.
///
/// Holds only handles to shared state (storage, fetcher, clients); it can
/// be dropped and rebuilt between events without losing cached data.
pub struct OfflineWorker {
    id: WorkerId,
    config: WorkerConfig,
    names: CacheNames,
    scope: Url,
    offline_url: Url,
    router: Router,
    pub(crate) storage: CacheStorage,
    pub(crate) fetcher: Arc<dyn Fetcher>,
    pub(crate) clients: Arc<Clients>,
    state: watch::Sender<WorkerState>,
    skip_waiting: AtomicBool,
    skip_waiting_from_page: AtomicBool,
}

impl std::fmt::Debug for OfflineWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfflineWorker")
            .field("id", &self.id)
            .field("version", &self.config.version)
            .field("scope", &self.scope.as_str())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl OfflineWorker {
    /// Create a worker for `config` controlling `scope`.
    pub fn new(
        config: WorkerConfig,
        scope: Url,
        storage: CacheStorage,
        fetcher: Arc<dyn Fetcher>,
        clients: Arc<Clients>,
    ) -> Result<Self, ServiceWorkerError> {
        config.validate()?;
        let offline_url = resolve(&scope, &config.offline_path)?;
        let (state, _) = watch::channel(WorkerState::Parsed);

        Ok(Self {
            id: WorkerId::new(),
            names: config.cache_names(),
            router: Router::from_config(&config),
            config,
            scope,
            offline_url,
            storage,
            fetcher,
            clients,
            state,
            skip_waiting: AtomicBool::new(false),
            skip_waiting_from_page: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn version(&self) -> &str {
        &self.config.version
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn cache_names(&self) -> &CacheNames {
        &self.names
    }

    pub fn scope(&self) -> &Url {
        &self.scope
    }

    pub fn offline_url(&self) -> &Url {
        &self.offline_url
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Current lifecycle state.
    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// Watch lifecycle state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<WorkerState> {
        self.state.subscribe()
    }

    pub(crate) fn set_state(&self, state: WorkerState) {
        let previous = self.state.send_replace(state);
        debug!(worker = %self.id, version = %self.config.version, from = %previous, to = %state, "State change");
    }

    /// Ask the host to activate this worker without waiting.
    pub fn skip_waiting(&self) {
        self.skip_waiting.store(true, Ordering::SeqCst);
    }

    pub fn skip_waiting_requested(&self) -> bool {
        self.skip_waiting.load(Ordering::SeqCst)
    }

    /// Record a `SKIP_WAITING` posted by a page. Unlike the request install
    /// makes for itself, this one overrides deferred activation.
    pub(crate) fn page_skip_waiting(&self) {
        self.skip_waiting_from_page.store(true, Ordering::SeqCst);
        self.skip_waiting();
    }

    /// Whether a page asked this worker to skip waiting.
    pub fn page_requested_skip_waiting(&self) -> bool {
        self.skip_waiting_from_page.load(Ordering::SeqCst)
    }

    /// Manifest paths resolved against the scope.
    pub fn manifest_urls(&self) -> Result<Vec<Url>, ServiceWorkerError> {
        self.config
            .manifest
            .iter()
            .map(|path| resolve(&self.scope, path))
            .collect()
    }

    pub(crate) fn namespace(&self, slot: CacheSlot) -> &str {
        match slot {
            CacheSlot::Static => &self.names.static_cache,
            CacheSlot::Dynamic => &self.names.dynamic_cache,
        }
    }

    /// Handle one intercepted request.
    ///
    /// Background cache writes are attached to `event`; the caller must
    /// await [`FetchEvent::settled`] afterwards.
    #[instrument(skip_all, fields(worker = %self.id, url = %event.request.url, method = %event.request.method))]
    pub async fn handle_fetch(&self, event: &mut FetchEvent) -> FetchOutcome {
        match self.router.classify(&event.request) {
            Strategy::Passthrough => FetchOutcome::Passthrough,
            Strategy::NetworkFirst(slot) => self.network_first(event, slot).await,
            Strategy::CacheFirst(slot) => self.cache_first(event, slot).await,
        }
    }

    /// Live fetch, bounded by the configured timeout if any.
    pub(crate) async fn live_fetch(&self, request: Request) -> Result<Response, NetError> {
        let fetcher = Arc::clone(&self.fetcher);
        match maybe_with_timeout(self.config.fetch_timeout(), || fetcher.fetch(request)).await {
            Ok(result) => result,
            Err(SwCacheError::Timeout(after)) => {
                warn!(?after, "Live fetch timed out");
                Err(NetError::Timeout(after))
            }
            Err(other) => Err(NetError::RequestFailed(other.to_string())),
        }
    }

    /// The offline document, if it is cached.
    pub(crate) async fn offline_response(&self) -> Option<Response> {
        let request = Request::get(self.offline_url.clone());
        match self.storage.match_any(&request).await {
            Ok(Some(entry)) => match entry.to_response() {
                Ok(response) => Some(response),
                Err(e) => {
                    warn!(error = %e, "Stored offline document is unreadable");
                    None
                }
            },
            Ok(None) => {
                warn!(url = %self.offline_url, "Offline document is not cached");
                None
            }
            Err(e) => {
                warn!(error = %e, "Cache lookup for offline document failed");
                None
            }
        }
    }

    pub(crate) fn log_ready(&self) {
        info!(
            worker = %self.id,
            version = %self.config.version,
            static_cache = %self.names.static_cache,
            dynamic_cache = %self.names.dynamic_cache,
            "Worker controlling scope {}",
            self.scope
        );
    }
}

fn resolve(scope: &Url, path: &str) -> Result<Url, ServiceWorkerError> {
    scope
        .join(path)
        .map_err(|e| ServiceWorkerError::ConfigError(format!("cannot resolve '{}': {}", path, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use swcache_net::CannedFetcher;

    fn worker(config: WorkerConfig) -> Result<OfflineWorker, ServiceWorkerError> {
        OfflineWorker::new(
            config,
            Url::parse("https://example.com/").unwrap(),
            CacheStorage::in_memory(),
            Arc::new(CannedFetcher::new()),
            Arc::new(Clients::new()),
        )
    }

    #[test]
    fn test_new_worker_is_parsed() {
        let worker = worker(WorkerConfig::default()).unwrap();
        assert_eq!(worker.state(), WorkerState::Parsed);
        assert!(!worker.skip_waiting_requested());
        assert_eq!(
            worker.offline_url().as_str(),
            "https://example.com/static/admin/offline.html"
        );
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = WorkerConfig::default().with_manifest(["/admin/"]);
        assert!(matches!(worker(config), Err(ServiceWorkerError::ConfigError(_))));
    }

    #[test]
    fn test_manifest_urls_resolved_against_scope() {
        let worker = worker(WorkerConfig::default()).unwrap();
        let urls = worker.manifest_urls().unwrap();
        assert_eq!(urls.len(), 7);
        assert_eq!(urls[0].as_str(), "https://example.com/admin/");
        assert_eq!(urls[1].as_str(), "https://example.com/static/css/app.css");
    }

    #[test]
    fn test_state_watch() {
        let worker = worker(WorkerConfig::default()).unwrap();
        let rx = worker.subscribe_state();
        worker.set_state(WorkerState::Installing);
        assert_eq!(*rx.borrow(), WorkerState::Installing);
    }

    #[tokio::test]
    async fn test_live_fetch_timeout_maps_to_net_error() {
        let fetcher = CannedFetcher::new().with_delay(std::time::Duration::from_millis(200));
        let worker = OfflineWorker::new(
            WorkerConfig::default().with_fetch_timeout(std::time::Duration::from_millis(10)),
            Url::parse("https://example.com/").unwrap(),
            CacheStorage::in_memory(),
            Arc::new(fetcher),
            Arc::new(Clients::new()),
        )
        .unwrap();

        let result = worker
            .live_fetch(Request::parse("https://example.com/admin/").unwrap())
            .await;
        assert!(matches!(result, Err(NetError::Timeout(_))));
    }
}
