//! Page ↔ worker message protocol.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::clients::{ClientId, ClientMatchOptions};
use crate::worker::OfflineWorker;

/// Commands a controlled page can send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientCommand {
    /// Activate a waiting worker immediately.
    SkipWaiting,
    /// Delete every cache namespace, then notify controlled pages.
    ClearCache,
}

impl ClientCommand {
    /// Parse a message payload. Unknown or malformed payloads yield `None`.
    pub fn parse(data: &Value) -> Option<Self> {
        serde_json::from_value(data.clone()).ok()
    }
}

/// Messages the worker posts to pages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerNotification {
    /// Every cache namespace was cleared.
    CacheCleared,
    /// A new worker version took control of the page.
    ControllerChanged { version: String },
}

/// Result of handling one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageOutcome {
    /// Unrecognised payload, nothing done.
    Ignored,
    /// Skip-waiting flag set; the host decides on activation.
    SkipWaitingRequested,
    /// Caches cleared and pages notified.
    CachesCleared {
        deleted: Vec<String>,
        failed: Vec<String>,
        notified: usize,
    },
}

impl OfflineWorker {
    /// Handle a message posted by a page.
    #[instrument(skip_all, fields(worker = %self.id()))]
    pub async fn handle_message(&self, data: &Value) -> MessageOutcome {
        let Some(command) = ClientCommand::parse(data) else {
            debug!(%data, "Ignoring unrecognised message");
            return MessageOutcome::Ignored;
        };

        match command {
            ClientCommand::SkipWaiting => {
                info!("Skip waiting requested");
                self.page_skip_waiting();
                MessageOutcome::SkipWaitingRequested
            }
            ClientCommand::ClearCache => self.clear_all_caches().await,
        }
    }

    /// Delete every namespace (best-effort), then post `CACHE_CLEARED` to
    /// each controlled page regardless of delete failures.
    async fn clear_all_caches(&self) -> MessageOutcome {
        let (deleted, failed) = match self.storage.delete_where(|_| false).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(error = %e, "Could not enumerate caches");
                (Vec::new(), Vec::new())
            }
        };
        info!(deleted = deleted.len(), failed = failed.len(), "Cleared caches");

        let targets: Vec<ClientId> = self
            .clients
            .match_all(self.id(), ClientMatchOptions::default())
            .await
            .into_iter()
            .map(|c| c.id)
            .collect();
        let notified = self
            .clients
            .notify(&targets, &WorkerNotification::CacheCleared)
            .await;

        MessageOutcome::CachesCleared {
            deleted,
            failed,
            notified,
        }
    }
}
