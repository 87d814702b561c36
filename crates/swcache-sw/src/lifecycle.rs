//! Install and activate phases.

use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use swcache_net::{Request, Url};
use tracing::{info, instrument, warn};

use crate::clients::ClientId;
use crate::storage::CacheEntry;
use crate::worker::OfflineWorker;
use crate::ServiceWorkerError;

/// Worker lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum WorkerState {
    /// Created, nothing run yet.
    #[default]
    Parsed,
    /// Install phase running.
    Installing,
    /// Installed, waiting for activation.
    Installed,
    /// Activate phase running.
    Activating,
    /// Active and handling fetches.
    Activated,
    /// Replaced, unregistered, or failed to install.
    Redundant,
}

impl WorkerState {
    /// Whether this state allows fetch interception.
    pub fn can_intercept_fetch(&self) -> bool {
        matches!(self, WorkerState::Activated)
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerState::Parsed => write!(f, "parsed"),
            WorkerState::Installing => write!(f, "installing"),
            WorkerState::Installed => write!(f, "installed"),
            WorkerState::Activating => write!(f, "activating"),
            WorkerState::Activated => write!(f, "activated"),
            WorkerState::Redundant => write!(f, "redundant"),
        }
    }
}

/// What the activate phase did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivationReport {
    /// Namespaces of previous versions that were deleted.
    pub deleted: Vec<String>,
    /// Namespaces whose deletion failed.
    pub failed: Vec<String>,
    /// Clients that switched to this worker.
    pub claimed: Vec<ClientId>,
}

impl OfflineWorker {
    /// Install phase: fetch the whole manifest, then store it.
    ///
    /// Either every manifest URL is stored in the static namespace or
    /// nothing is written and the error names the first failing URL.
    /// Success requests skip-waiting.
    #[instrument(skip_all, fields(worker = %self.id(), version = %self.version()))]
    pub async fn install(&self) -> Result<(), ServiceWorkerError> {
        info!("Installing");
        let urls = self.manifest_urls()?;

        let entries = try_join_all(urls.into_iter().map(|url| self.fetch_manifest_entry(url))).await?;

        let cache = &self.cache_names().static_cache;
        info!(cache = %cache, assets = entries.len(), "Caching static assets");
        self.storage.put_all(cache, entries).await?;

        self.skip_waiting();
        Ok(())
    }

    async fn fetch_manifest_entry(&self, url: Url) -> Result<CacheEntry, ServiceWorkerError> {
        let request = Request::get(url.clone());
        let response = self
            .live_fetch(request.clone())
            .await
            .map_err(|e| ServiceWorkerError::InstallFailed {
                url: url.to_string(),
                reason: e.to_string(),
            })?;

        if !response.ok() {
            return Err(ServiceWorkerError::InstallFailed {
                url: url.to_string(),
                reason: format!("status {}", response.status),
            });
        }

        CacheEntry::from_response(&request, response).await
    }

    /// Activate phase: purge namespaces of other versions, claim clients.
    ///
    /// Deletion is best-effort per namespace; failures are reported, not
    /// returned.
    #[instrument(skip_all, fields(worker = %self.id(), version = %self.version()))]
    pub async fn activate(&self) -> ActivationReport {
        info!("Activating");
        let names = self.cache_names().clone();

        let (deleted, failed) = match self.storage.delete_where(|name| names.is_current(name)).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(error = %e, "Could not enumerate caches, skipping cleanup");
                (Vec::new(), Vec::new())
            }
        };
        for name in &deleted {
            info!(cache = %name, "Deleted old cache");
        }

        let claimed = self.clients.claim(self.id(), self.scope()).await;
        info!(claimed = claimed.len(), "Claimed clients");
        self.log_ready();

        ActivationReport {
            deleted,
            failed,
            claimed,
        }
    }
}
