//! Worker configuration: cache names, install manifest and routing knobs.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::ServiceWorkerError;

/// Configuration of one worker version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Optional prefix for namespace names (`<prefix>-static-<version>`).
    pub cache_prefix: String,

    /// Version suffix. Bumping it invalidates every cache on activation.
    pub version: String,

    /// Paths fetched and stored during install.
    pub manifest: Vec<String>,

    /// Document served when both network and cache fail. Must be in the manifest.
    pub offline_path: String,

    /// Paths under this root without a static extension are served network-first.
    pub admin_root: String,

    /// Extensions treated as static assets even under the admin root.
    pub static_extensions: Vec<String>,

    /// Bound on a single live fetch. `None` waits without bound.
    pub fetch_timeout_ms: Option<u64>,

    /// Interval between update checks.
    pub update_interval_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            cache_prefix: String::new(),
            version: "v1".to_string(),
            manifest: [
                "/admin/",
                "/static/css/app.css",
                "/static/js/base.js",
                "/static/img/logo.webp",
                "/static/img/favicon/icon-192x192.png",
                "/static/img/favicon/icon-512x512.png",
                "/static/admin/offline.html",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            offline_path: "/static/admin/offline.html".to_string(),
            admin_root: "/admin/".to_string(),
            static_extensions: [
                "css", "js", "png", "jpg", "jpeg", "webp", "svg", "woff", "woff2", "ttf", "eot",
                "ico",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            fetch_timeout_ms: None,
            update_interval_secs: 30 * 60,
        }
    }
}

impl WorkerConfig {
    /// Same configuration with another version suffix.
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Replace the install manifest.
    pub fn with_manifest<I, S>(mut self, manifest: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.manifest = manifest.into_iter().map(Into::into).collect();
        self
    }

    /// Bound live fetches.
    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    /// Namespace names for this version.
    pub fn cache_names(&self) -> CacheNames {
        let name = |kind: &str| {
            if self.cache_prefix.is_empty() {
                format!("{}-{}", kind, self.version)
            } else {
                format!("{}-{}-{}", self.cache_prefix, kind, self.version)
            }
        };
        CacheNames {
            static_cache: name("static"),
            dynamic_cache: name("dynamic"),
        }
    }

    pub fn fetch_timeout(&self) -> Option<Duration> {
        self.fetch_timeout_ms.map(Duration::from_millis)
    }

    pub fn update_interval(&self) -> Duration {
        Duration::from_secs(self.update_interval_secs)
    }

    /// Check the invariants the worker relies on.
    pub fn validate(&self) -> Result<(), ServiceWorkerError> {
        if self.version.trim().is_empty() {
            return Err(ServiceWorkerError::ConfigError(
                "version must not be empty".to_string(),
            ));
        }
        if !self.admin_root.starts_with('/') || !self.admin_root.ends_with('/') {
            return Err(ServiceWorkerError::ConfigError(format!(
                "admin root '{}' must start and end with '/'",
                self.admin_root
            )));
        }
        if !self.manifest.iter().any(|p| p == &self.offline_path) {
            // The fallback has to be cached before it can be served.
            return Err(ServiceWorkerError::ConfigError(format!(
                "offline path '{}' is not part of the install manifest",
                self.offline_path
            )));
        }
        Ok(())
    }
}

/// The two namespaces owned by a worker version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheNames {
    /// Filled at install and by cache-first fills.
    pub static_cache: String,
    /// Filled by network-first responses.
    pub dynamic_cache: String,
}

impl CacheNames {
    /// Whether `name` belongs to this version.
    pub fn is_current(&self, name: &str) -> bool {
        name == self.static_cache || name == self.dynamic_cache
    }
}
