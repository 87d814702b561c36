//! Host configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use swcache_common::{LogConfig, LogFormat, ResultExt, SwCacheError};
use swcache_net::{LoaderConfig, Url};
use swcache_sw::WorkerConfig;

/// Host configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Origin the worker controls
    pub origin: String,

    /// Directory holding the cache namespaces
    pub data_dir: PathBuf,

    /// User agent string
    pub user_agent: String,

    /// Per-request network timeout in seconds; unset waits without bound
    pub request_timeout_secs: Option<u64>,

    /// Log output format: pretty, compact or json
    pub log_format: String,

    /// Worker policy
    pub worker: WorkerConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            origin: "http://localhost:8000/".to_string(),
            data_dir: dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("swcache"),
            user_agent: format!("swcache/{}", env!("CARGO_PKG_VERSION")),
            request_timeout_secs: None,
            log_format: "compact".to_string(),
            worker: WorkerConfig::default(),
        }
    }
}

impl AppConfig {
    /// Default location of the configuration file.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("swcache").join("config.json"))
    }

    /// Load from `path`, or from the default location.
    ///
    /// An explicit path must exist; a missing default file yields defaults.
    pub fn load(path: Option<&Path>) -> swcache_common::Result<Self> {
        let (path, required) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => match Self::default_path() {
                Some(path) => (path, false),
                None => return Ok(Self::default()),
            },
        };

        match std::fs::read_to_string(&path) {
            Ok(text) => {
                let config: Self = serde_json::from_str(&text)
                    .context(format!("parsing {}", path.display()))?;
                config.worker.validate()?;
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !required => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn origin_url(&self) -> swcache_common::Result<Url> {
        Url::parse(&self.origin)
            .map_err(|e| SwCacheError::config(format!("invalid origin '{}': {}", self.origin, e)))
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.data_dir.join("caches")
    }

    pub fn loader_config(&self) -> LoaderConfig {
        LoaderConfig {
            user_agent: self.user_agent.clone(),
            default_timeout: self.request_timeout_secs.map(Duration::from_secs),
            ..Default::default()
        }
    }

    pub fn log_config(&self, verbose: bool) -> swcache_common::Result<LogConfig> {
        let format: LogFormat = self.log_format.parse()?;
        let base = if verbose {
            LogConfig::debug()
        } else {
            LogConfig::default()
        };
        Ok(base.with_format(format))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert!(config.data_dir.ends_with("swcache"));
        assert!(config.request_timeout_secs.is_none());
        assert_eq!(config.worker.version, "v1");
        assert!(config.loader_config().default_timeout.is_none());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"origin": "https://admin.example.com/", "request_timeout_secs": 5, "worker": {"version": "v7"}}"#,
        )
        .unwrap();

        let config = AppConfig::load(Some(&path)).unwrap();

        assert_eq!(config.origin_url().unwrap().host_str(), Some("admin.example.com"));
        assert_eq!(config.worker.version, "v7");
        assert_eq!(config.worker.admin_root, "/admin/");
        assert_eq!(config.loader_config().default_timeout, Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = AppConfig::load(Some(&dir.path().join("absent.json")));
        assert!(matches!(result, Err(SwCacheError::Io(_))));
    }

    #[test]
    fn test_invalid_worker_config_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"worker": {"offline_path": "/nowhere.html"}}"#).unwrap();

        let err = AppConfig::load(Some(&path)).unwrap_err();
        assert_eq!(err.category(), "config");
    }

    #[test]
    fn test_log_format_parsed() {
        let config = AppConfig {
            log_format: "json".to_string(),
            ..Default::default()
        };
        assert_eq!(config.log_config(false).unwrap().format, LogFormat::Json);

        let bad = AppConfig {
            log_format: "xml".to_string(),
            ..Default::default()
        };
        assert!(bad.log_config(false).is_err());
    }
}
