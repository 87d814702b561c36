//! In-memory cache backend.

use async_trait::async_trait;
use hashbrown::HashMap;
use swcache_net::Request;
use tokio::sync::RwLock;

use super::{CacheBackend, CacheEntry, Result};
use crate::ServiceWorkerError;

/// A cache instance.
#[derive(Debug, Default)]
struct Cache {
    /// Entries keyed by `CacheEntry::key`.
    entries: HashMap<String, CacheEntry>,
}

impl Cache {
    fn size(&self) -> usize {
        self.entries.values().map(CacheEntry::size).sum()
    }
}

#[derive(Debug, Default)]
struct State {
    /// Creation order of namespace names.
    order: Vec<String>,
    caches: HashMap<String, Cache>,
}

impl State {
    fn open(&mut self, name: &str) -> &mut Cache {
        if !self.caches.contains_key(name) {
            self.order.push(name.to_string());
        }
        self.caches.entry(name.to_string()).or_default()
    }

    fn total_size(&self) -> usize {
        self.caches.values().map(Cache::size).sum()
    }
}

/// Process-local cache storage.
///
/// An optional byte quota makes writes fail with
/// [`ServiceWorkerError::QuotaExceeded`] once the stored total would exceed it.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    state: RwLock<State>,
    quota: Option<usize>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Limit the total stored bytes.
    pub fn with_quota(quota: usize) -> Self {
        Self {
            state: RwLock::new(State::default()),
            quota: Some(quota),
        }
    }

    fn check_quota(&self, state: &State, name: &str, incoming: &[&CacheEntry]) -> Result<()> {
        let Some(quota) = self.quota else {
            return Ok(());
        };
        let replaced: usize = state
            .caches
            .get(name)
            .map(|cache| {
                incoming
                    .iter()
                    .filter_map(|e| cache.entries.get(&e.key()))
                    .map(CacheEntry::size)
                    .sum()
            })
            .unwrap_or(0);
        let added: usize = incoming.iter().map(|e| e.size()).sum();
        let projected = (state.total_size() + added).saturating_sub(replaced);
        if projected > quota {
            return Err(ServiceWorkerError::QuotaExceeded(format!(
                "{} needs {} bytes, quota is {}",
                name, projected, quota
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    async fn open(&self, name: &str) -> Result<()> {
        self.state.write().await.open(name);
        Ok(())
    }

    async fn has(&self, name: &str) -> Result<bool> {
        Ok(self.state.read().await.caches.contains_key(name))
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        let mut state = self.state.write().await;
        state.order.retain(|n| n != name);
        Ok(state.caches.remove(name).is_some())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        Ok(self.state.read().await.order.clone())
    }

    async fn put(&self, name: &str, entry: CacheEntry) -> Result<()> {
        let mut state = self.state.write().await;
        self.check_quota(&state, name, &[&entry])?;
        state.open(name).entries.insert(entry.key(), entry);
        Ok(())
    }

    async fn put_all(&self, name: &str, entries: Vec<CacheEntry>) -> Result<()> {
        let mut state = self.state.write().await;
        let refs: Vec<&CacheEntry> = entries.iter().collect();
        self.check_quota(&state, name, &refs)?;
        let cache = state.open(name);
        for entry in entries {
            cache.entries.insert(entry.key(), entry);
        }
        Ok(())
    }

    async fn match_in(&self, name: &str, request: &Request) -> Result<Option<CacheEntry>> {
        let state = self.state.read().await;
        Ok(state
            .caches
            .get(name)
            .and_then(|cache| cache.entries.values().find(|e| e.matches(request)))
            .cloned())
    }

    async fn entries(&self, name: &str) -> Result<Vec<CacheEntry>> {
        let state = self.state.read().await;
        let cache = state
            .caches
            .get(name)
            .ok_or_else(|| ServiceWorkerError::NotFound(name.to_string()))?;
        let mut entries: Vec<CacheEntry> = cache.entries.values().cloned().collect();
        entries.sort_by(|a, b| a.url.cmp(&b.url));
        Ok(entries)
    }
}
