//! # swcache Worker
//!
//! Offline-capable request cache modelled on a service worker.
//!
//! ## Features
//!
//! - **Lifecycle**: install (manifest pre-cache), activate (stale cache purge, client claim)
//! - **Cache storage**: pluggable [`CacheBackend`], in-memory and on-disk
//! - **Fetch interception**: ordered rules selecting network-first or cache-first
//! - **Offline fallback**: a pre-cached document for failed navigations
//! - **Messages**: `SKIP_WAITING` and `CLEAR_CACHE` from controlled pages
//!
//! ## Architecture
//!
//! ```text
//! Registration (host)
//!     ├── installing (OfflineWorker)
//!     ├── waiting (OfflineWorker)
//!     ├── active (OfflineWorker)
//!     │       ├── Router ── (pattern → strategy) rules
//!     │       └── Fetcher (network)
//!     └── Clients (controlled pages)
//!
//! CacheStorage
//!     └── CacheBackend (memory | file)
//!             └── namespace → Request → Response snapshot
//! ```

use swcache_common::SwCacheError;
use swcache_net::NetError;
use thiserror::Error;

pub mod clients;
pub mod config;
pub mod event;
pub mod lifecycle;
pub mod message;
pub mod registration;
pub mod router;
pub mod storage;
pub mod strategy;
pub mod worker;

pub use clients::{Client, ClientId, ClientMatchOptions, ClientType, Clients};
pub use config::{CacheNames, WorkerConfig};
pub use event::{FetchEvent, FetchOutcome, ResponseSource};
pub use lifecycle::{ActivationReport, WorkerState};
pub use message::{ClientCommand, MessageOutcome, WorkerNotification};
pub use registration::{MessageTarget, Registration, RegistrationEvent};
pub use router::{CacheSlot, RoutePattern, RouteRule, Router, Strategy};
pub use storage::{CacheBackend, CacheEntry, CacheStorage, FileBackend, MemoryBackend};
pub use worker::{OfflineWorker, WorkerId};

// ==================== Errors ====================

/// Errors that can occur in worker operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceWorkerError {
    #[error("Install failed for {url}: {reason}")]
    InstallFailed { url: String, reason: String },

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Cache error: {0}")]
    CacheError(String),

    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("State error: {0}")]
    StateError(String),

    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl From<NetError> for ServiceWorkerError {
    fn from(err: NetError) -> Self {
        ServiceWorkerError::NetworkError(err.to_string())
    }
}

impl From<std::io::Error> for ServiceWorkerError {
    fn from(err: std::io::Error) -> Self {
        ServiceWorkerError::CacheError(err.to_string())
    }
}

impl From<serde_json::Error> for ServiceWorkerError {
    fn from(err: serde_json::Error) -> Self {
        ServiceWorkerError::CacheError(format!("corrupt namespace file: {}", err))
    }
}

impl From<ServiceWorkerError> for SwCacheError {
    fn from(err: ServiceWorkerError) -> Self {
        match err {
            ServiceWorkerError::NetworkError(_) => SwCacheError::network_with_source("fetch failed", err),
            ServiceWorkerError::CacheError(_) | ServiceWorkerError::QuotaExceeded(_) => {
                SwCacheError::cache_with_source("cache storage failed", err)
            }
            ServiceWorkerError::ConfigError(message) => SwCacheError::config(message),
            ServiceWorkerError::NotFound(what) => SwCacheError::NotFound(what),
            ServiceWorkerError::InstallFailed { .. } | ServiceWorkerError::StateError(_) => {
                SwCacheError::worker_with_source("worker lifecycle failed", err)
            }
        }
    }
}
