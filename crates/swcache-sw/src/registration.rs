//! Host-side registration: the installing, waiting and active worker slots.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use swcache_net::{Fetcher, Url};
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, error, info, instrument};

use crate::clients::{ClientId, Clients};
use crate::config::WorkerConfig;
use crate::event::{FetchEvent, FetchOutcome};
use crate::lifecycle::{ActivationReport, WorkerState};
use crate::message::{MessageOutcome, WorkerNotification};
use crate::storage::{CacheBackend, CacheStorage};
use crate::worker::{OfflineWorker, WorkerId};
use crate::ServiceWorkerError;

/// Events observable by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationEvent {
    /// A worker moved to a new lifecycle state.
    StateChange {
        worker: WorkerId,
        version: String,
        state: WorkerState,
    },
    /// A new worker version started installing.
    UpdateFound { version: String },
    /// A client switched to a new controller.
    ControllerChange { client: ClientId, worker: WorkerId },
}

/// Which worker slot a message is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageTarget {
    Installing,
    Waiting,
    Active,
}

#[derive(Debug, Default)]
struct Slots {
    installing: Option<Arc<OfflineWorker>>,
    waiting: Option<Arc<OfflineWorker>>,
    active: Option<Arc<OfflineWorker>>,
}

/// A registration for one scope.
///
/// Holds at most one worker per slot. All workers share the same cache
/// storage, fetcher and client list.
pub struct Registration {
    scope: Url,
    storage: CacheStorage,
    fetcher: Arc<dyn Fetcher>,
    clients: Arc<Clients>,
    slots: RwLock<Slots>,
    activation: Mutex<()>,
    defer_activation: AtomicBool,
    last_update_check: RwLock<Option<Instant>>,
    events: mpsc::UnboundedSender<RegistrationEvent>,
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("scope", &self.scope.as_str())
            .field("storage", &self.storage)
            .finish_non_exhaustive()
    }
}

impl Registration {
    /// Create an empty registration for `scope`.
    pub fn new(
        scope: Url,
        backend: Arc<dyn CacheBackend>,
        fetcher: Arc<dyn Fetcher>,
    ) -> (Self, mpsc::UnboundedReceiver<RegistrationEvent>) {
        let (events, event_rx) = mpsc::unbounded_channel();

        (
            Self {
                scope,
                storage: CacheStorage::new(backend),
                fetcher,
                clients: Arc::new(Clients::new()),
                slots: RwLock::new(Slots::default()),
                activation: Mutex::new(()),
                defer_activation: AtomicBool::new(false),
                last_update_check: RwLock::new(None),
                events,
            },
            event_rx,
        )
    }

    pub fn scope(&self) -> &Url {
        &self.scope
    }

    pub fn clients(&self) -> &Arc<Clients> {
        &self.clients
    }

    pub fn storage(&self) -> &CacheStorage {
        &self.storage
    }

    /// Keep freshly installed workers waiting while another worker is
    /// active, even if they requested skip-waiting. They are promoted by
    /// a `SKIP_WAITING` message or [`activate_waiting`](Self::activate_waiting).
    pub fn set_defer_activation(&self, defer: bool) {
        self.defer_activation.store(defer, Ordering::SeqCst);
    }

    pub async fn installing(&self) -> Option<Arc<OfflineWorker>> {
        self.slots.read().await.installing.clone()
    }

    pub async fn waiting(&self) -> Option<Arc<OfflineWorker>> {
        self.slots.read().await.waiting.clone()
    }

    pub async fn active(&self) -> Option<Arc<OfflineWorker>> {
        self.slots.read().await.active.clone()
    }

    /// Install a worker for `config`.
    ///
    /// On failure the new worker becomes redundant, the active worker (if
    /// any) keeps serving, and the error is returned.
    #[instrument(skip_all, fields(scope = %self.scope, version = %config.version))]
    pub async fn register(&self, config: WorkerConfig) -> Result<WorkerId, ServiceWorkerError> {
        let worker = Arc::new(OfflineWorker::new(
            config,
            self.scope.clone(),
            self.storage.clone(),
            Arc::clone(&self.fetcher),
            Arc::clone(&self.clients),
        )?);
        let id = worker.id();

        self.emit(RegistrationEvent::UpdateFound {
            version: worker.version().to_string(),
        });
        let superseded = self.slots.write().await.installing.replace(Arc::clone(&worker));
        if let Some(previous) = superseded {
            self.transition(&previous, WorkerState::Redundant);
        }

        self.transition(&worker, WorkerState::Installing);
        let installed = worker.install().await;

        let mut slots = self.slots.write().await;
        let still_installing = slots.installing.as_ref().map(|w| w.id()) == Some(id);
        if still_installing {
            slots.installing = None;
        }

        if let Err(e) = installed {
            drop(slots);
            error!(error = %e, "Install failed, keeping previous worker");
            self.transition(&worker, WorkerState::Redundant);
            return Err(e);
        }
        if !still_installing {
            return Err(ServiceWorkerError::StateError(format!(
                "{} was superseded during install",
                id
            )));
        }

        self.transition(&worker, WorkerState::Installed);
        let replaced = slots.waiting.replace(Arc::clone(&worker));
        let skip_waiting = if self.defer_activation.load(Ordering::SeqCst) {
            worker.page_requested_skip_waiting()
        } else {
            worker.skip_waiting_requested()
        };
        let activate_now = slots.active.is_none() || skip_waiting;
        drop(slots);

        if let Some(previous) = replaced {
            self.transition(&previous, WorkerState::Redundant);
        }

        if activate_now {
            self.activate_waiting().await;
        } else {
            info!(worker = %id, "Installed, waiting for activation");
        }
        Ok(id)
    }

    /// Promote the waiting worker to active.
    ///
    /// Runs its activate phase, retires the previous active worker and
    /// posts `CONTROLLER_CHANGED` to every client it claimed. Returns
    /// `None` if nothing was waiting.
    pub async fn activate_waiting(&self) -> Option<ActivationReport> {
        let _guard = self.activation.lock().await;
        let worker = self.slots.read().await.waiting.clone()?;

        self.transition(&worker, WorkerState::Activating);
        let report = worker.activate().await;

        let previous = {
            let mut slots = self.slots.write().await;
            if slots.waiting.as_ref().map(|w| w.id()) == Some(worker.id()) {
                slots.waiting = None;
            }
            slots.active.replace(Arc::clone(&worker))
        };
        if let Some(previous) = previous {
            self.transition(&previous, WorkerState::Redundant);
        }
        self.transition(&worker, WorkerState::Activated);

        let notification = WorkerNotification::ControllerChanged {
            version: worker.version().to_string(),
        };
        self.clients.notify(&report.claimed, &notification).await;
        for client in &report.claimed {
            self.emit(RegistrationEvent::ControllerChange {
                client: *client,
                worker: worker.id(),
            });
        }

        Some(report)
    }

    /// Periodic update check.
    ///
    /// Registers a new worker if `config` names a different version than
    /// the active one; otherwise does nothing.
    pub async fn update(&self, config: WorkerConfig) -> Result<Option<WorkerId>, ServiceWorkerError> {
        *self.last_update_check.write().await = Some(Instant::now());

        let current = self.active().await.map(|w| w.version().to_string());
        if current.as_deref() == Some(config.version.as_str()) {
            debug!(version = %config.version, "No update");
            return Ok(None);
        }

        info!(from = ?current, to = %config.version, "Update found");
        self.register(config).await.map(Some)
    }

    /// Run [`update`](Self::update) if the last check is older than the
    /// config's update interval.
    pub async fn update_if_due(&self, config: WorkerConfig) -> Result<Option<WorkerId>, ServiceWorkerError> {
        if !self.needs_update(config.update_interval()).await {
            return Ok(None);
        }
        self.update(config).await
    }

    /// Whether the last update check is older than `interval`.
    pub async fn needs_update(&self, interval: Duration) -> bool {
        match *self.last_update_check.read().await {
            Some(last) => last.elapsed() > interval,
            None => true,
        }
    }

    /// Route a fetch to the active worker; uncontrolled without one.
    pub async fn fetch(&self, event: &mut FetchEvent) -> FetchOutcome {
        match self.active().await {
            Some(worker) if worker.state().can_intercept_fetch() => worker.handle_fetch(event).await,
            _ => FetchOutcome::Passthrough,
        }
    }

    /// Deliver a page message to one of the workers.
    ///
    /// `SKIP_WAITING` addressed to the waiting worker activates it.
    pub async fn post_message(
        &self,
        target: MessageTarget,
        data: &Value,
    ) -> Result<MessageOutcome, ServiceWorkerError> {
        let worker = {
            let slots = self.slots.read().await;
            match target {
                MessageTarget::Installing => slots.installing.clone(),
                MessageTarget::Waiting => slots.waiting.clone(),
                MessageTarget::Active => slots.active.clone(),
            }
        }
        .ok_or_else(|| ServiceWorkerError::NotFound(format!("no {:?} worker", target).to_lowercase()))?;

        let outcome = worker.handle_message(data).await;
        // An installing worker picks the request up when install finishes,
        // unless it finished while the message was being handled.
        if outcome == MessageOutcome::SkipWaitingRequested {
            let waiting = self.waiting().await.map(|w| w.id());
            if waiting == Some(worker.id()) {
                self.activate_waiting().await;
            }
        }
        Ok(outcome)
    }

    /// Retire every worker. Returns whether anything was registered.
    pub async fn unregister(&self) -> bool {
        let slots = std::mem::take(&mut *self.slots.write().await);
        let workers: Vec<Arc<OfflineWorker>> = [slots.installing, slots.waiting, slots.active]
            .into_iter()
            .flatten()
            .collect();

        for worker in &workers {
            self.clients.release(worker.id()).await;
            self.transition(worker, WorkerState::Redundant);
        }
        info!(scope = %self.scope, retired = workers.len(), "Unregistered");
        !workers.is_empty()
    }

    fn transition(&self, worker: &OfflineWorker, state: WorkerState) {
        worker.set_state(state);
        self.emit(RegistrationEvent::StateChange {
            worker: worker.id(),
            version: worker.version().to_string(),
            state,
        });
    }

    fn emit(&self, event: RegistrationEvent) {
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::ClientType;
    use crate::storage::MemoryBackend;
    use serde_json::json;
    use swcache_net::CannedFetcher;

    const ORIGIN: &str = "https://example.com/";
    const MANIFEST: [&str; 2] = ["/", "/static/admin/offline.html"];

    async fn fetcher() -> Arc<CannedFetcher> {
        let fetcher = Arc::new(CannedFetcher::new());
        fetcher.route("https://example.com/", 200, "text/html", "home").await;
        fetcher
            .route("https://example.com/static/admin/offline.html", 200, "text/html", "offline")
            .await;
        fetcher
    }

    fn config(version: &str) -> WorkerConfig {
        WorkerConfig::default().with_version(version).with_manifest(MANIFEST)
    }

    async fn registration() -> (Registration, mpsc::UnboundedReceiver<RegistrationEvent>) {
        Registration::new(
            Url::parse(ORIGIN).unwrap(),
            Arc::new(MemoryBackend::new()),
            fetcher().await,
        )
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<RegistrationEvent>) -> Vec<RegistrationEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_first_register_activates() {
        let (reg, mut rx) = registration().await;

        let id = reg.register(config("v1")).await.unwrap();

        let active = reg.active().await.unwrap();
        assert_eq!(active.id(), id);
        assert_eq!(active.state(), WorkerState::Activated);
        assert!(reg.waiting().await.is_none());
        assert!(reg.installing().await.is_none());

        let states: Vec<WorkerState> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                RegistrationEvent::StateChange { state, .. } => Some(state),
                _ => None,
            })
            .collect();
        assert_eq!(
            states,
            vec![
                WorkerState::Installing,
                WorkerState::Installed,
                WorkerState::Activating,
                WorkerState::Activated
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_install_keeps_previous_worker() {
        let (reg, _rx) = registration().await;
        reg.register(config("v1")).await.unwrap();

        let broken = config("v2").with_manifest(["/", "/missing.js", "/static/admin/offline.html"]);
        let err = reg.register(broken).await.unwrap_err();

        assert!(matches!(err, ServiceWorkerError::InstallFailed { .. }));
        assert_eq!(reg.active().await.unwrap().version(), "v1");
        assert!(!reg.storage().has("static-v2").await.unwrap());
    }

    #[tokio::test]
    async fn test_update_replaces_and_purges() {
        let (reg, _rx) = registration().await;
        reg.register(config("v1")).await.unwrap();
        let old = reg.active().await.unwrap();

        assert_eq!(reg.update(config("v1")).await.unwrap(), None);
        let new_id = reg.update(config("v2")).await.unwrap().unwrap();

        assert_eq!(reg.active().await.unwrap().id(), new_id);
        assert_eq!(old.state(), WorkerState::Redundant);
        assert_eq!(reg.storage().keys().await.unwrap(), vec!["static-v2".to_string()]);
    }

    #[tokio::test]
    async fn test_controller_change_notifies_claimed_clients() {
        let (reg, mut rx) = registration().await;
        let (page, mut inbox) = reg
            .clients()
            .connect(Url::parse("https://example.com/admin/").unwrap(), ClientType::Window)
            .await;

        let id = reg.register(config("v1")).await.unwrap();

        assert_eq!(
            inbox.recv().await,
            Some(WorkerNotification::ControllerChanged {
                version: "v1".to_string()
            })
        );
        assert!(drain(&mut rx).contains(&RegistrationEvent::ControllerChange {
            client: page,
            worker: id
        }));
    }

    #[tokio::test]
    async fn test_skip_waiting_message_promotes_waiting_worker() {
        let (reg, _rx) = registration().await;
        reg.set_defer_activation(true);
        reg.register(config("v1")).await.unwrap();
        reg.register(config("v2")).await.unwrap();

        assert_eq!(reg.active().await.unwrap().version(), "v1");
        assert_eq!(reg.waiting().await.unwrap().state(), WorkerState::Installed);

        let outcome = reg
            .post_message(MessageTarget::Waiting, &json!({"type": "SKIP_WAITING"}))
            .await
            .unwrap();

        assert_eq!(outcome, MessageOutcome::SkipWaitingRequested);
        assert_eq!(reg.active().await.unwrap().version(), "v2");
        assert!(reg.waiting().await.is_none());
    }

    #[tokio::test]
    async fn test_skip_waiting_sent_while_installing_activates_on_install() {
        let slow = Arc::new(CannedFetcher::new().with_delay(Duration::from_millis(50)));
        slow.route("https://example.com/", 200, "text/html", "home").await;
        slow.route("https://example.com/static/admin/offline.html", 200, "text/html", "offline")
            .await;
        let (reg, _rx) = Registration::new(Url::parse(ORIGIN).unwrap(), Arc::new(MemoryBackend::new()), slow);
        reg.set_defer_activation(true);
        reg.register(config("v1")).await.unwrap();

        let page = async {
            while reg.installing().await.is_none() {
                tokio::task::yield_now().await;
            }
            reg.post_message(MessageTarget::Installing, &json!({"type": "SKIP_WAITING"}))
                .await
                .unwrap()
        };
        let (registered, outcome) = tokio::join!(reg.register(config("v2")), page);

        assert_eq!(outcome, MessageOutcome::SkipWaitingRequested);
        assert_eq!(reg.active().await.unwrap().id(), registered.unwrap());
        assert_eq!(reg.active().await.unwrap().version(), "v2");
        assert!(reg.waiting().await.is_none());
    }

    #[tokio::test]
    async fn test_deferred_install_stays_waiting_without_page_request() {
        let (reg, _rx) = registration().await;
        reg.set_defer_activation(true);
        reg.register(config("v1")).await.unwrap();
        reg.register(config("v2")).await.unwrap();

        let waiting = reg.waiting().await.unwrap();
        assert!(waiting.skip_waiting_requested());
        assert!(!waiting.page_requested_skip_waiting());
        assert_eq!(reg.active().await.unwrap().version(), "v1");
    }

    #[tokio::test]
    async fn test_post_message_to_empty_slot() {
        let (reg, _rx) = registration().await;
        let result = reg
            .post_message(MessageTarget::Active, &json!({"type": "CLEAR_CACHE"}))
            .await;
        assert!(matches!(result, Err(ServiceWorkerError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_fetch_without_active_worker_passes_through() {
        let (reg, _rx) = registration().await;
        let mut event = FetchEvent::new(swcache_net::Request::parse("https://example.com/admin/").unwrap());
        assert!(matches!(reg.fetch(&mut event).await, FetchOutcome::Passthrough));
    }

    #[tokio::test]
    async fn test_unregister_retires_everything() {
        let (reg, _rx) = registration().await;
        assert!(!reg.unregister().await);

        reg.register(config("v1")).await.unwrap();
        let active = reg.active().await.unwrap();

        assert!(reg.unregister().await);
        assert_eq!(active.state(), WorkerState::Redundant);
        assert!(reg.active().await.is_none());
    }

    #[tokio::test]
    async fn test_needs_update() {
        let (reg, _rx) = registration().await;
        assert!(reg.needs_update(Duration::from_secs(1800)).await);

        reg.update(config("v1")).await.unwrap();
        assert!(!reg.needs_update(Duration::from_secs(1800)).await);
    }

    #[tokio::test]
    async fn test_update_if_due_respects_interval() {
        let (reg, _rx) = registration().await;
        reg.register(config("v1")).await.unwrap();

        let mut hourly = config("v2");
        hourly.update_interval_secs = 3600;
        let first = reg.update_if_due(hourly.clone()).await.unwrap();
        assert!(first.is_some());
        assert_eq!(reg.active().await.unwrap().version(), "v2");

        let mut v3 = config("v3");
        v3.update_interval_secs = 3600;
        assert_eq!(reg.update_if_due(v3.clone()).await.unwrap(), None);
        assert_eq!(reg.active().await.unwrap().version(), "v2");

        v3.update_interval_secs = 0;
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(reg.update_if_due(v3).await.unwrap().is_some());
        assert_eq!(reg.active().await.unwrap().version(), "v3");
    }
}
