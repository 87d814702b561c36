//! Cache storage: named namespaces of request → response snapshots.
//!
//! The storage is shared, process-wide state that outlives any worker
//! instance, so it is injected as an [`Arc<dyn CacheBackend>`] rather than
//! owned by a worker.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use http::header::VARY;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use serde::{Deserialize, Serialize};
use swcache_net::{Request, Response, Url};
use tracing::{debug, warn};

use crate::ServiceWorkerError;

mod file;
mod memory;

pub use file::FileBackend;
pub use memory::MemoryBackend;

type Result<T> = std::result::Result<T, ServiceWorkerError>;

// ==================== Cache Entry ====================

/// An immutable snapshot of a response, keyed by its request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Request URL without fragment.
    pub url: String,

    /// Request method.
    pub method: String,

    /// Values of the request headers named by the response's `Vary`.
    #[serde(default)]
    pub vary: Vec<(String, Option<String>)>,

    /// Response status.
    pub status: u16,

    /// Response headers. Values hold one char per raw byte, so header
    /// bytes outside ASCII survive the round trip.
    pub headers: Vec<(String, String)>,

    /// Response body.
    #[serde(with = "body_base64")]
    pub body: Vec<u8>,

    /// Cached at timestamp (ms since epoch).
    pub cached_at: u64,
}

impl CacheEntry {
    /// Snapshot `response` as the answer to `request`, consuming the body.
    pub async fn from_response(request: &Request, response: Response) -> Result<Self> {
        let status = response.status.as_u16();
        let headers: Vec<(String, String)> = response
            .headers
            .iter()
            .map(|(name, value)| (name.as_str().to_string(), header_text(value)))
            .collect();

        let vary = vary_names(&response.headers)
            .into_iter()
            .map(|name| {
                let value = request
                    .headers
                    .get(name.as_str())
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                (name, value)
            })
            .collect();

        let body = response.bytes().await?.to_vec();

        Ok(Self {
            url: request.url_without_fragment().to_string(),
            method: request.method.as_str().to_string(),
            vary,
            status,
            headers,
            body,
            cached_at: now_millis(),
        })
    }

    /// Storage key: one entry per method and URL.
    pub fn key(&self) -> String {
        format!("{} {}", self.method, self.url)
    }

    /// Whether this entry answers `request`.
    ///
    /// Only `GET` lookups match. Headers named by `Vary` must carry the
    /// stored values; `Vary: *` never matches.
    pub fn matches(&self, request: &Request) -> bool {
        if request.method != Method::GET || self.method != Method::GET.as_str() {
            return false;
        }
        if self.url != request.url_without_fragment().as_str() {
            return false;
        }
        self.vary.iter().all(|(name, stored)| {
            if name == "*" {
                return false;
            }
            let current = request
                .headers
                .get(name.as_str())
                .and_then(|v| v.to_str().ok());
            current == stored.as_deref()
        })
    }

    /// Size accounted against quotas.
    pub fn size(&self) -> usize {
        self.body.len()
            + self.url.len()
            + self
                .headers
                .iter()
                .map(|(k, v)| k.len() + v.len())
                .sum::<usize>()
    }

    /// Rebuild a response marked as served from cache.
    pub fn to_response(&self) -> Result<Response> {
        let url = Url::parse(&self.url)
            .map_err(|e| ServiceWorkerError::CacheError(format!("stored url {}: {}", self.url, e)))?;
        let status = StatusCode::from_u16(self.status)
            .map_err(|e| ServiceWorkerError::CacheError(e.to_string()))?;

        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            let value = header_bytes(value).and_then(|b| HeaderValue::from_bytes(&b).ok());
            match (HeaderName::try_from(name.as_str()), value) {
                (Ok(n), Some(v)) => {
                    headers.append(n, v);
                }
                _ => debug!(header = %name, "Skipping unrepresentable stored header"),
            }
        }

        Ok(Response::new(url, status, headers, Bytes::from(self.body.clone())).cached())
    }
}

fn header_text(value: &HeaderValue) -> String {
    value.as_bytes().iter().map(|&b| char::from(b)).collect()
}

fn header_bytes(text: &str) -> Option<Vec<u8>> {
    text.chars().map(|c| u8::try_from(c).ok()).collect()
}

fn vary_names(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(VARY)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect()
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

mod body_base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

// ==================== Backend ====================

/// Storage backend for cache namespaces.
///
/// Writes replace whole entries or delete whole namespaces; there is no
/// partial-entry mutation and no cross-namespace transaction.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Create the namespace if it does not exist.
    async fn open(&self, name: &str) -> Result<()>;

    /// Check whether a namespace exists.
    async fn has(&self, name: &str) -> Result<bool>;

    /// Delete a namespace. Returns whether it existed.
    async fn delete(&self, name: &str) -> Result<bool>;

    /// Namespace names in creation order.
    async fn keys(&self) -> Result<Vec<String>>;

    /// Store an entry, replacing any entry with the same key. Creates the
    /// namespace on first write.
    async fn put(&self, name: &str, entry: CacheEntry) -> Result<()>;

    /// Store several entries at once; either all are written or none.
    async fn put_all(&self, name: &str, entries: Vec<CacheEntry>) -> Result<()>;

    /// First entry in the namespace matching `request`.
    async fn match_in(&self, name: &str, request: &Request) -> Result<Option<CacheEntry>>;

    /// All entries of a namespace.
    async fn entries(&self, name: &str) -> Result<Vec<CacheEntry>>;
}

// ==================== Cache Storage ====================

/// Handle over a shared backend (the `caches` global of a worker).
#[derive(Clone)]
pub struct CacheStorage {
    backend: Arc<dyn CacheBackend>,
}

impl std::fmt::Debug for CacheStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStorage").finish_non_exhaustive()
    }
}

impl CacheStorage {
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        Self { backend }
    }

    /// In-memory storage.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()))
    }

    pub async fn open(&self, name: &str) -> Result<()> {
        self.backend.open(name).await
    }

    pub async fn has(&self, name: &str) -> Result<bool> {
        self.backend.has(name).await
    }

    pub async fn delete(&self, name: &str) -> Result<bool> {
        self.backend.delete(name).await
    }

    pub async fn keys(&self) -> Result<Vec<String>> {
        self.backend.keys().await
    }

    pub async fn put_all(&self, name: &str, entries: Vec<CacheEntry>) -> Result<()> {
        self.backend.put_all(name, entries).await
    }

    pub async fn entries(&self, name: &str) -> Result<Vec<CacheEntry>> {
        self.backend.entries(name).await
    }

    pub async fn match_in(&self, name: &str, request: &Request) -> Result<Option<CacheEntry>> {
        self.backend.match_in(name, request).await
    }

    /// Snapshot `response` and store it under `request`.
    pub async fn put_response(&self, name: &str, request: &Request, response: Response) -> Result<()> {
        let entry = CacheEntry::from_response(request, response).await?;
        self.backend.put(name, entry).await
    }

    /// Match across all namespaces in creation order.
    pub async fn match_any(&self, request: &Request) -> Result<Option<CacheEntry>> {
        for name in self.backend.keys().await? {
            if let Some(entry) = self.backend.match_in(&name, request).await? {
                debug!(cache = %name, url = %entry.url, "Cache hit");
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }

    /// Delete every namespace not accepted by `keep`, best-effort.
    ///
    /// Returns the deleted names and the names whose deletion failed.
    pub async fn delete_where<F>(&self, keep: F) -> Result<(Vec<String>, Vec<String>)>
    where
        F: Fn(&str) -> bool,
    {
        let doomed: Vec<String> = self
            .backend
            .keys()
            .await?
            .into_iter()
            .filter(|name| !keep(name))
            .collect();

        let results =
            futures::future::join_all(doomed.iter().map(|name| self.backend.delete(name))).await;

        let mut deleted = Vec::new();
        let mut failed = Vec::new();
        for (name, result) in doomed.into_iter().zip(results) {
            match result {
                Ok(_) => {
                    debug!(cache = %name, "Deleted cache");
                    deleted.push(name);
                }
                Err(e) => {
                    warn!(cache = %name, error = %e, "Failed to delete cache");
                    failed.push(name);
                }
            }
        }
        Ok((deleted, failed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::{ACCEPT_ENCODING, CONTENT_TYPE};

    fn response(url: &str, headers: HeaderMap, body: &'static [u8]) -> Response {
        Response::new(
            Url::parse(url).unwrap(),
            StatusCode::OK,
            headers,
            Bytes::from_static(body),
        )
    }

    #[tokio::test]
    async fn test_entry_round_trip_to_response() {
        let request = Request::parse("https://example.com/static/css/app.css").unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/css"));
        let entry = CacheEntry::from_response(&request, response(request.url.as_str(), headers, b"a{}"))
            .await
            .unwrap();

        assert_eq!(entry.key(), "GET https://example.com/static/css/app.css");
        assert!(entry.matches(&request));

        let rebuilt = entry.to_response().unwrap();
        assert!(rebuilt.from_cache);
        assert_eq!(
            rebuilt.headers.get(CONTENT_TYPE),
            Some(&HeaderValue::from_static("text/css"))
        );
        assert_eq!(rebuilt.bytes().await.unwrap(), Bytes::from_static(b"a{}"));
    }

    #[tokio::test]
    async fn test_non_ascii_header_values_survive() {
        let request = Request::parse("https://example.com/report.pdf").unwrap();
        let disposition = HeaderValue::from_bytes(b"attachment; filename=\"caf\xe9.pdf\"").unwrap();
        let utf8 = HeaderValue::from_bytes("r\u{e9}sum\u{e9}".as_bytes()).unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("content-disposition", disposition.clone());
        headers.insert("x-title", utf8.clone());

        let entry = CacheEntry::from_response(&request, response(request.url.as_str(), headers, b"%PDF"))
            .await
            .unwrap();
        assert_eq!(entry.headers.len(), 2);

        let json = serde_json::to_string(&entry).unwrap();
        let stored: CacheEntry = serde_json::from_str(&json).unwrap();
        let rebuilt = stored.to_response().unwrap();
        assert_eq!(rebuilt.headers.get("content-disposition"), Some(&disposition));
        assert_eq!(rebuilt.headers.get("x-title"), Some(&utf8));
    }

    #[tokio::test]
    async fn test_non_get_never_matches() {
        let get = Request::parse("https://example.com/admin/").unwrap();
        let entry = CacheEntry::from_response(&get, response(get.url.as_str(), HeaderMap::new(), b"x"))
            .await
            .unwrap();

        let post = Request::post(get.url.clone(), Bytes::from_static(b"a=1"));
        assert!(!entry.matches(&post));
    }

    #[tokio::test]
    async fn test_fragment_ignored_query_significant() {
        let request = Request::parse("https://example.com/page?x=1").unwrap();
        let entry = CacheEntry::from_response(&request, response(request.url.as_str(), HeaderMap::new(), b"x"))
            .await
            .unwrap();

        assert!(entry.matches(&Request::parse("https://example.com/page?x=1#top").unwrap()));
        assert!(!entry.matches(&Request::parse("https://example.com/page?x=2").unwrap()));
    }

    #[tokio::test]
    async fn test_vary_headers_respected() {
        let request = Request::parse("https://example.com/data")
            .unwrap()
            .header(ACCEPT_ENCODING, HeaderValue::from_static("gzip"));
        let mut headers = HeaderMap::new();
        headers.insert(VARY, HeaderValue::from_static("Accept-Encoding"));
        let entry = CacheEntry::from_response(&request, response("https://example.com/data", headers, b"x"))
            .await
            .unwrap();

        assert!(entry.matches(&request));
        let other = Request::parse("https://example.com/data")
            .unwrap()
            .header(ACCEPT_ENCODING, HeaderValue::from_static("br"));
        assert!(!entry.matches(&other));
    }

    #[tokio::test]
    async fn test_vary_star_never_matches() {
        let request = Request::parse("https://example.com/data").unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(VARY, HeaderValue::from_static("*"));
        let entry = CacheEntry::from_response(&request, response("https://example.com/data", headers, b"x"))
            .await
            .unwrap();

        assert!(!entry.matches(&request));
    }

    #[test]
    fn test_body_serialized_as_base64() {
        let entry = CacheEntry {
            url: "https://example.com/a".to_string(),
            method: "GET".to_string(),
            vary: Vec::new(),
            status: 200,
            headers: Vec::new(),
            body: vec![0, 159, 146, 150],
            cached_at: 0,
        };
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"AJ+Slg==\""));
        let back: CacheEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(back, entry);
    }

    #[tokio::test]
    async fn test_match_any_searches_in_creation_order() {
        let storage = CacheStorage::in_memory();
        let request = Request::parse("https://example.com/a.js").unwrap();

        storage
            .put_response("first", &request, response(request.url.as_str(), HeaderMap::new(), b"one"))
            .await
            .unwrap();
        storage
            .put_response("second", &request, response(request.url.as_str(), HeaderMap::new(), b"two"))
            .await
            .unwrap();

        let hit = storage.match_any(&request).await.unwrap().unwrap();
        assert_eq!(hit.body, b"one".to_vec());
    }

    #[tokio::test]
    async fn test_delete_where_keeps_selected() {
        let storage = CacheStorage::in_memory();
        for name in ["static-v0", "dynamic-v0", "static-v1"] {
            storage.open(name).await.unwrap();
        }

        let (deleted, failed) = storage.delete_where(|n| n.ends_with("-v1")).await.unwrap();
        assert_eq!(deleted, vec!["static-v0".to_string(), "dynamic-v0".to_string()]);
        assert!(failed.is_empty());
        assert_eq!(storage.keys().await.unwrap(), vec!["static-v1".to_string()]);
    }
}
