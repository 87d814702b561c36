//! In-memory fetcher serving canned responses.
//!
//! Used by the CLI's `--offline` mode and by tests that need a network
//! they can switch off.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{HeaderMap, HeaderValue, StatusCode};
use tokio::sync::RwLock;
use tracing::trace;

use crate::{Fetcher, NetError, Request, Response, Url};

#[derive(Debug, Clone)]
enum Canned {
    Respond {
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
    },
    Fail,
}

/// Fetcher answering from a routing table keyed by URL.
///
/// Unknown URLs get a `404 Not Found`. While offline every request fails.
#[derive(Debug, Default)]
pub struct CannedFetcher {
    routes: RwLock<HashMap<String, Canned>>,
    offline: AtomicBool,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl CannedFetcher {
    /// Create an online fetcher with no routes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a fetcher that fails every request.
    pub fn offline() -> Self {
        let fetcher = Self::default();
        fetcher.offline.store(true, Ordering::SeqCst);
        fetcher
    }

    /// Delay every answer by `delay`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Serve `body` with `status` and a content type for `url`.
    pub async fn route(&self, url: &str, status: u16, content_type: &str, body: impl Into<Bytes>) {
        let mut headers = HeaderMap::new();
        if let Ok(value) = HeaderValue::from_str(content_type) {
            headers.insert(CONTENT_TYPE, value);
        }
        self.route_with_headers(url, status, headers, body).await;
    }

    /// Serve a response with explicit headers for `url`.
    pub async fn route_with_headers(
        &self,
        url: &str,
        status: u16,
        headers: HeaderMap,
        body: impl Into<Bytes>,
    ) {
        let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        self.routes.write().await.insert(
            url.to_string(),
            Canned::Respond {
                status,
                headers,
                body: body.into(),
            },
        );
    }

    /// Make requests to `url` fail with a network error.
    pub async fn fail(&self, url: &str) {
        self.routes.write().await.insert(url.to_string(), Canned::Fail);
    }

    /// Switch the whole network on or off.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Number of fetches attempted so far.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Fetcher for CannedFetcher {
    async fn fetch(&self, request: Request) -> Result<Response, NetError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        if self.offline.load(Ordering::SeqCst) {
            return Err(NetError::Offline(request.url.to_string()));
        }

        let url: Url = request.url_without_fragment();
        let canned = self.routes.read().await.get(url.as_str()).cloned();
        trace!(url = %url, found = canned.is_some(), "Canned fetch");

        match canned {
            Some(Canned::Respond {
                status,
                headers,
                body,
            }) => Ok(Response::new(url, status, headers, body)),
            Some(Canned::Fail) => Err(NetError::RequestFailed(format!(
                "connection reset: {}",
                url
            ))),
            None => Ok(Response::new(
                url,
                StatusCode::NOT_FOUND,
                HeaderMap::new(),
                Bytes::new(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_routes_and_missing() {
        let fetcher = CannedFetcher::new();
        fetcher
            .route("https://example.com/a.css", 200, "text/css", "a{}")
            .await;

        let hit = fetcher
            .fetch(Request::parse("https://example.com/a.css").unwrap())
            .await
            .unwrap();
        assert_eq!(hit.status, StatusCode::OK);
        assert_eq!(hit.text().await.unwrap(), "a{}");

        let miss = fetcher
            .fetch(Request::parse("https://example.com/b.css").unwrap())
            .await
            .unwrap();
        assert_eq!(miss.status, StatusCode::NOT_FOUND);
        assert_eq!(fetcher.call_count(), 2);
    }

    #[tokio::test]
    async fn test_offline_and_failing_routes() {
        let fetcher = CannedFetcher::new();
        fetcher.fail("https://example.com/broken").await;
        assert!(fetcher
            .fetch(Request::parse("https://example.com/broken").unwrap())
            .await
            .is_err());

        fetcher.set_offline(true);
        let result = fetcher
            .fetch(Request::parse("https://example.com/anything").unwrap())
            .await;
        assert!(matches!(result, Err(NetError::Offline(_))));
    }
}
