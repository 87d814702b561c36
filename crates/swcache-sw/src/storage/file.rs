//! On-disk cache backend: one JSON document per namespace.
//!
//! Namespace order is kept in a small index file next to the namespace
//! documents, so listing and lookups never parse entry bodies just to learn
//! which namespaces exist.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use swcache_net::Request;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{now_millis, CacheBackend, CacheEntry, Result};
use crate::ServiceWorkerError;

const EXTENSION: &str = "json";
const INDEX_FILE: &str = "namespaces.index";

#[derive(Debug, Serialize, Deserialize)]
struct NamespaceFile {
    name: String,
    created_at: u64,
    entries: Vec<CacheEntry>,
}

/// Leading fields of a namespace file, read when the index has to be rebuilt.
#[derive(Debug, Deserialize)]
struct NamespaceHeader {
    name: String,
    #[serde(default)]
    created_at: u64,
}

/// Namespace names in creation order.
#[derive(Debug, Default, Serialize, Deserialize)]
struct NamespaceIndex {
    names: Vec<String>,
}

impl NamespaceIndex {
    fn contains(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name)
    }
}

/// Cache storage persisted under a directory.
///
/// Each namespace lives in `<root>/<percent-encoded name>.json` and is
/// rewritten through a temporary file and a rename, so a namespace file is
/// always either the old or the new version. The index is held in memory and
/// written through on every create and delete; one backend owns a directory
/// at a time.
#[derive(Debug)]
pub struct FileBackend {
    root: PathBuf,
    index: Mutex<NamespaceIndex>,
}

impl FileBackend {
    /// Open (and create) the storage directory.
    pub async fn open_dir(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;

        let index = match Self::read_index(&root).await? {
            Some(index) => index,
            None => {
                let index = Self::rebuild_index(&root).await?;
                write_atomic(&root.join(INDEX_FILE), &serde_json::to_vec(&index)?).await?;
                index
            }
        };

        debug!(root = %root.display(), namespaces = index.names.len(), "File cache backend ready");
        Ok(Self {
            root,
            index: Mutex::new(index),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, name: &str) -> PathBuf {
        namespace_path(&self.root, name)
    }

    async fn read_index(root: &Path) -> Result<Option<NamespaceIndex>> {
        match tokio::fs::read(root.join(INDEX_FILE)).await {
            Ok(bytes) => match serde_json::from_slice::<NamespaceIndex>(&bytes) {
                Ok(mut index) => {
                    let mut present = Vec::with_capacity(index.names.len());
                    for name in index.names {
                        if tokio::fs::try_exists(namespace_path(root, &name)).await? {
                            present.push(name);
                        }
                    }
                    index.names = present;
                    Ok(Some(index))
                }
                Err(e) => {
                    warn!(error = %e, "Unreadable namespace index, rebuilding");
                    Ok(None)
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Recover the order from the namespace files' creation stamps.
    async fn rebuild_index(root: &Path) -> Result<NamespaceIndex> {
        let mut headers = Vec::new();
        let mut dir = tokio::fs::read_dir(root).await?;
        while let Some(item) = dir.next_entry().await? {
            let path = item.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            let bytes = tokio::fs::read(&path).await?;
            match serde_json::from_slice::<NamespaceHeader>(&bytes) {
                Ok(header) => headers.push(header),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable namespace file"),
            }
        }
        headers.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.name.cmp(&b.name)));
        Ok(NamespaceIndex {
            names: headers.into_iter().map(|h| h.name).collect(),
        })
    }

    async fn save_index(&self, index: &NamespaceIndex) -> Result<()> {
        write_atomic(&self.root.join(INDEX_FILE), &serde_json::to_vec(index)?).await
    }

    async fn load(&self, name: &str) -> Result<Option<NamespaceFile>> {
        match tokio::fs::read(self.path_for(name)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn store(&self, file: &NamespaceFile) -> Result<()> {
        write_atomic(&self.path_for(&file.name), &serde_json::to_vec(file)?).await
    }

    async fn load_or_new(&self, name: &str) -> Result<NamespaceFile> {
        Ok(self.load(name).await?.unwrap_or_else(|| NamespaceFile {
            name: name.to_string(),
            created_at: now_millis(),
            entries: Vec::new(),
        }))
    }

    /// Append `name` to the index if this is its first appearance.
    async fn record(&self, index: &mut NamespaceIndex, name: &str) -> Result<()> {
        if !index.contains(name) {
            index.names.push(name.to_string());
            self.save_index(index).await?;
        }
        Ok(())
    }

    fn upsert(file: &mut NamespaceFile, entry: CacheEntry) {
        let key = entry.key();
        match file.entries.iter_mut().find(|e| e.key() == key) {
            Some(existing) => *existing = entry,
            None => file.entries.push(entry),
        }
    }
}

fn namespace_path(root: &Path, name: &str) -> PathBuf {
    root.join(format!("{}.{}", urlencoding::encode(name), EXTENSION))
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[async_trait]
impl CacheBackend for FileBackend {
    async fn open(&self, name: &str) -> Result<()> {
        let mut index = self.index.lock().await;
        if self.load(name).await?.is_none() {
            self.store(&self.load_or_new(name).await?).await?;
        }
        self.record(&mut index, name).await
    }

    async fn has(&self, name: &str) -> Result<bool> {
        Ok(self.index.lock().await.contains(name))
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        let mut index = self.index.lock().await;
        let existed = match tokio::fs::remove_file(self.path_for(name)).await {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => return Err(e.into()),
        };
        if index.contains(name) {
            index.names.retain(|n| n != name);
            self.save_index(&index).await?;
        }
        Ok(existed)
    }

    async fn keys(&self) -> Result<Vec<String>> {
        Ok(self.index.lock().await.names.clone())
    }

    async fn put(&self, name: &str, entry: CacheEntry) -> Result<()> {
        let mut index = self.index.lock().await;
        let mut file = self.load_or_new(name).await?;
        Self::upsert(&mut file, entry);
        self.store(&file).await?;
        self.record(&mut index, name).await
    }

    async fn put_all(&self, name: &str, entries: Vec<CacheEntry>) -> Result<()> {
        let mut index = self.index.lock().await;
        let mut file = self.load_or_new(name).await?;
        for entry in entries {
            Self::upsert(&mut file, entry);
        }
        self.store(&file).await?;
        self.record(&mut index, name).await
    }

    async fn match_in(&self, name: &str, request: &Request) -> Result<Option<CacheEntry>> {
        let _index = self.index.lock().await;
        Ok(self
            .load(name)
            .await?
            .and_then(|file| file.entries.into_iter().find(|e| e.matches(request))))
    }

    async fn entries(&self, name: &str) -> Result<Vec<CacheEntry>> {
        let _index = self.index.lock().await;
        self.load(name)
            .await?
            .map(|file| file.entries)
            .ok_or_else(|| ServiceWorkerError::NotFound(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entry(url: &str, body: &[u8]) -> CacheEntry {
        CacheEntry {
            url: url.to_string(),
            method: "GET".to_string(),
            vary: Vec::new(),
            status: 200,
            headers: vec![("content-type".to_string(), "text/plain".to_string())],
            body: body.to_vec(),
            cached_at: 0,
        }
    }

    #[tokio::test]
    async fn test_entries_survive_reopen() {
        let dir = tempdir().unwrap();
        {
            let backend = FileBackend::open_dir(dir.path()).await.unwrap();
            backend
                .put("static-v1", entry("https://example.com/a.css", b"a{}"))
                .await
                .unwrap();
        }

        let reopened = FileBackend::open_dir(dir.path()).await.unwrap();
        assert!(reopened.has("static-v1").await.unwrap());
        let hit = reopened
            .match_in("static-v1", &Request::parse("https://example.com/a.css").unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(hit.body, b"a{}".to_vec());
    }

    #[tokio::test]
    async fn test_names_are_encoded_on_disk() {
        let dir = tempdir().unwrap();
        let backend = FileBackend::open_dir(dir.path()).await.unwrap();
        backend.open("lily/static v1").await.unwrap();

        assert!(dir.path().join("lily%2Fstatic%20v1.json").exists());
        assert_eq!(backend.keys().await.unwrap(), vec!["lily/static v1".to_string()]);
    }

    #[tokio::test]
    async fn test_delete_and_put_all() {
        let dir = tempdir().unwrap();
        let backend = FileBackend::open_dir(dir.path()).await.unwrap();
        backend
            .put_all(
                "static-v1",
                vec![
                    entry("https://example.com/a", b"a"),
                    entry("https://example.com/b", b"b"),
                    entry("https://example.com/a", b"a2"),
                ],
            )
            .await
            .unwrap();

        let entries = backend.entries("static-v1").await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].body, b"a2".to_vec());

        assert!(backend.delete("static-v1").await.unwrap());
        assert!(!backend.delete("static-v1").await.unwrap());
        assert!(backend.keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_skipped_on_rebuild() {
        let dir = tempdir().unwrap();
        {
            let backend = FileBackend::open_dir(dir.path()).await.unwrap();
            backend.open("good").await.unwrap();
        }
        std::fs::write(dir.path().join("bad.json"), b"{not json").unwrap();
        std::fs::remove_file(dir.path().join(INDEX_FILE)).unwrap();

        let backend = FileBackend::open_dir(dir.path()).await.unwrap();
        assert_eq!(backend.keys().await.unwrap(), vec!["good".to_string()]);
        assert!(backend.entries("bad").await.is_err());
    }

    #[tokio::test]
    async fn test_keys_follow_creation_order() {
        let dir = tempdir().unwrap();
        let backend = FileBackend::open_dir(dir.path()).await.unwrap();

        let mut expected = Vec::new();
        for i in 0..50 {
            for name in [format!("static-{}", i), format!("dynamic-{}", i)] {
                backend.open(&name).await.unwrap();
                expected.push(name);
            }
        }

        assert_eq!(backend.keys().await.unwrap(), expected);
    }

    #[tokio::test]
    async fn test_order_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let backend = FileBackend::open_dir(dir.path()).await.unwrap();
            backend.open("zeta").await.unwrap();
            backend
                .put("alpha", entry("https://example.com/a", b"a"))
                .await
                .unwrap();
            backend.open("mid").await.unwrap();
            backend.delete("mid").await.unwrap();
        }

        let reopened = FileBackend::open_dir(dir.path()).await.unwrap();
        assert_eq!(
            reopened.keys().await.unwrap(),
            vec!["zeta".to_string(), "alpha".to_string()]
        );
        assert!(!reopened.has("mid").await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_index_is_rebuilt() {
        let dir = tempdir().unwrap();
        {
            let backend = FileBackend::open_dir(dir.path()).await.unwrap();
            backend.open("static-v1").await.unwrap();
        }
        std::fs::remove_file(dir.path().join(INDEX_FILE)).unwrap();

        let reopened = FileBackend::open_dir(dir.path()).await.unwrap();
        assert_eq!(reopened.keys().await.unwrap(), vec!["static-v1".to_string()]);
        assert!(dir.path().join(INDEX_FILE).exists());
    }
}
