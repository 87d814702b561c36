//! Fetch events and their extended lifetime.

use std::future::Future;

use swcache_net::{Request, Response};
use tokio::task::JoinSet;
use tracing::{trace, warn};

use crate::clients::ClientId;
use crate::ServiceWorkerError;

/// Where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    Network,
    Cache,
    OfflineFallback,
}

impl std::fmt::Display for ResponseSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResponseSource::Network => write!(f, "network"),
            ResponseSource::Cache => write!(f, "cache"),
            ResponseSource::OfflineFallback => write!(f, "offline"),
        }
    }
}

/// Result of dispatching one fetch event.
#[derive(Debug)]
pub enum FetchOutcome {
    /// Not intercepted; the host should perform its default fetch.
    Passthrough,
    /// Respond with this response.
    Respond {
        response: Response,
        source: ResponseSource,
    },
    /// The request failed and no fallback applies.
    Failed(ServiceWorkerError),
}

impl FetchOutcome {
    pub fn respond(response: Response, source: ResponseSource) -> Self {
        FetchOutcome::Respond { response, source }
    }

    pub fn source(&self) -> Option<ResponseSource> {
        match self {
            FetchOutcome::Respond { source, .. } => Some(*source),
            _ => None,
        }
    }

    pub fn into_response(self) -> Option<Response> {
        match self {
            FetchOutcome::Respond { response, .. } => Some(response),
            _ => None,
        }
    }
}

/// One intercepted request.
///
/// Work the handler starts but does not await (cache writes) is registered
/// with [`wait_until`](FetchEvent::wait_until). The host answers the page as
/// soon as the handler returns, then must await [`settled`](FetchEvent::settled)
/// before treating the event as finished.
#[derive(Debug)]
pub struct FetchEvent {
    pub request: Request,
    pub client_id: Option<ClientId>,
    pending: JoinSet<()>,
}

impl FetchEvent {
    pub fn new(request: Request) -> Self {
        Self {
            request,
            client_id: None,
            pending: JoinSet::new(),
        }
    }

    /// Attribute the event to a client.
    pub fn from_client(mut self, client_id: ClientId) -> Self {
        self.client_id = Some(client_id);
        self
    }

    /// Keep the event alive until `work` completes.
    pub fn wait_until<F>(&mut self, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.pending.spawn(work);
    }

    /// Number of extensions not yet joined.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Wait for every extension to finish.
    pub async fn settled(mut self) {
        while let Some(joined) = self.pending.join_next().await {
            if let Err(e) = joined {
                warn!(url = %self.request.url, error = %e, "Extension task failed");
            }
        }
        trace!(url = %self.request.url, "Fetch event settled");
    }
}
