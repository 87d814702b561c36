//! Network-first and cache-first strategies.

use http::{Method, StatusCode};
use swcache_net::{Request, Response};
use tracing::{debug, warn};

use crate::event::{FetchEvent, FetchOutcome, ResponseSource};
use crate::router::CacheSlot;
use crate::storage::CacheStorage;
use crate::worker::OfflineWorker;
use crate::ServiceWorkerError;

/// Only a plain `GET` answered with `200 OK` is written to cache.
pub fn is_cacheable(request: &Request, response: &Response) -> bool {
    request.method == Method::GET && response.status == StatusCode::OK
}

impl OfflineWorker {
    /// Live fetch first; on network failure any cached match, then the
    /// offline document.
    pub(crate) async fn network_first(&self, event: &mut FetchEvent, slot: CacheSlot) -> FetchOutcome {
        let request = event.request.clone();

        let failure = match self.live_fetch(request.clone()).await {
            Ok(response) => {
                let response = self.store_copy(event, slot, &request, response);
                return FetchOutcome::respond(response, ResponseSource::Network);
            }
            Err(e) => {
                debug!(error = %e, "Network failed, trying cache");
                ServiceWorkerError::from(e)
            }
        };

        match self.storage.match_any(&request).await {
            Ok(Some(entry)) => match entry.to_response() {
                Ok(response) => return FetchOutcome::respond(response, ResponseSource::Cache),
                Err(e) => warn!(error = %e, "Cached entry unreadable"),
            },
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Cache lookup failed"),
        }

        match self.offline_response().await {
            Some(response) => FetchOutcome::respond(response, ResponseSource::OfflineFallback),
            None => FetchOutcome::Failed(failure),
        }
    }

    /// Cached match first; live fetch on miss. On failure only HTML
    /// navigations get the offline document.
    pub(crate) async fn cache_first(&self, event: &mut FetchEvent, slot: CacheSlot) -> FetchOutcome {
        let request = event.request.clone();

        let failure = match self.storage.match_any(&request).await {
            Ok(Some(entry)) => match entry.to_response() {
                Ok(response) => return FetchOutcome::respond(response, ResponseSource::Cache),
                Err(e) => e,
            },
            Ok(None) => match self.live_fetch(request.clone()).await {
                Ok(response) => {
                    let response = self.store_copy(event, slot, &request, response);
                    return FetchOutcome::respond(response, ResponseSource::Network);
                }
                Err(e) => ServiceWorkerError::from(e),
            },
            Err(e) => e,
        };

        debug!(error = %failure, "Cache-first request failed");
        if request.accepts_html() {
            if let Some(response) = self.offline_response().await {
                return FetchOutcome::respond(response, ResponseSource::OfflineFallback);
            }
        }
        FetchOutcome::Failed(failure)
    }

    /// If cacheable, split the response and write one copy in the
    /// background. Returns the copy for the caller.
    fn store_copy(
        &self,
        event: &mut FetchEvent,
        slot: CacheSlot,
        request: &Request,
        response: Response,
    ) -> Response {
        if !is_cacheable(request, &response) {
            debug!(status = %response.status, "Response not cacheable");
            return response;
        }

        let (response, copy) = response.split();
        let storage = self.storage.clone();
        let cache = self.namespace(slot).to_string();
        let request = request.clone();
        event.wait_until(write_quietly(storage, cache, request, copy));
        response
    }
}

/// Store `response`, logging and swallowing failures.
async fn write_quietly(storage: CacheStorage, cache: String, request: Request, response: Response) {
    match storage.put_response(&cache, &request, response).await {
        Ok(()) => debug!(cache = %cache, url = %request.url, "Cached response"),
        Err(e) => warn!(cache = %cache, url = %request.url, error = %e, "Cache write failed"),
    }
}
