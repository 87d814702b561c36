//! Controlled pages and the worker → page message channel.

use std::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashMap;
use swcache_net::Url;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};

use crate::message::WorkerNotification;
use crate::worker::WorkerId;
use crate::ServiceWorkerError;

/// Client identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(u64);

impl ClientId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// Client type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientType {
    #[default]
    Window,
    Worker,
    SharedWorker,
}

/// A client (controlled page).
#[derive(Debug, Clone)]
pub struct Client {
    /// Client ID.
    pub id: ClientId,

    /// Client URL.
    pub url: Url,

    /// Client type.
    pub client_type: ClientType,

    /// Worker currently controlling this client.
    pub controller: Option<WorkerId>,

    sender: mpsc::UnboundedSender<WorkerNotification>,
}

impl Client {
    /// Post message to client.
    pub fn post_message(&self, message: WorkerNotification) -> Result<(), ServiceWorkerError> {
        self.sender.send(message).map_err(|_| {
            ServiceWorkerError::StateError(format!("{} is no longer listening", self.id))
        })
    }
}

/// Options for [`Clients::match_all`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ClientMatchOptions {
    /// Also return clients not controlled by the asking worker.
    pub include_uncontrolled: bool,
    /// Restrict to one client type.
    pub client_type: Option<ClientType>,
}

/// Clients API.
#[derive(Debug, Default)]
pub struct Clients {
    clients: RwLock<HashMap<ClientId, Client>>,
}

impl Clients {
    /// Create new clients manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect a page. The receiver yields every message posted to it.
    pub async fn connect(
        &self,
        url: Url,
        client_type: ClientType,
    ) -> (ClientId, mpsc::UnboundedReceiver<WorkerNotification>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let id = ClientId::new();
        let client = Client {
            id,
            url,
            client_type,
            controller: None,
            sender,
        };
        debug!(client = %id, url = %client.url, "Client connected");
        self.clients.write().await.insert(id, client);
        (id, receiver)
    }

    /// Remove a client.
    pub async fn disconnect(&self, id: ClientId) -> Option<Client> {
        self.clients.write().await.remove(&id)
    }

    /// Get a client by ID.
    pub async fn get(&self, id: ClientId) -> Option<Client> {
        self.clients.read().await.get(&id).cloned()
    }

    /// Clients visible to `worker`.
    pub async fn match_all(&self, worker: WorkerId, options: ClientMatchOptions) -> Vec<Client> {
        let mut matched: Vec<Client> = self
            .clients
            .read()
            .await
            .values()
            .filter(|c| options.include_uncontrolled || c.controller == Some(worker))
            .filter(|c| options.client_type.map_or(true, |t| c.client_type == t))
            .cloned()
            .collect();
        matched.sort_by_key(|c| c.id.0);
        matched
    }

    /// Make `worker` the controller of every client under `scope`.
    ///
    /// Returns the clients whose controller changed.
    pub async fn claim(&self, worker: WorkerId, scope: &Url) -> Vec<ClientId> {
        let mut clients = self.clients.write().await;
        let mut changed: Vec<ClientId> = clients
            .values_mut()
            .filter(|c| c.url.as_str().starts_with(scope.as_str()))
            .filter(|c| c.controller != Some(worker))
            .map(|c| {
                c.controller = Some(worker);
                c.id
            })
            .collect();
        changed.sort_by_key(|id| id.0);
        debug!(%worker, claimed = changed.len(), "Claimed clients");
        changed
    }

    /// Drop `worker` as controller everywhere.
    pub async fn release(&self, worker: WorkerId) {
        for client in self.clients.write().await.values_mut() {
            if client.controller == Some(worker) {
                client.controller = None;
            }
        }
    }

    /// Post `message` to each of `ids`, skipping clients that went away.
    ///
    /// Returns how many clients received it.
    pub async fn notify(&self, ids: &[ClientId], message: &WorkerNotification) -> usize {
        let clients = self.clients.read().await;
        let mut delivered = 0;
        for client in ids.iter().filter_map(|id| clients.get(id)) {
            match client.post_message(message.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => warn!(client = %client.id, error = %e, "Failed to post message"),
            }
        }
        delivered
    }
}
