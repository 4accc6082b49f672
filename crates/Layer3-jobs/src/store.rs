//! Blob storage shared between the orchestrator and the remote worker
//!
//! Keys are relative paths (`tasks/<id>/metadata.json`). `get` on a missing
//! key is `Error::NotFound`.

use async_trait::async_trait;
use relay_foundation::{Error, FileStore, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::RwLock;

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn get(&self, path: &str) -> Result<Vec<u8>>;

    /// Replace the blob at `path`; readers see the old or the new bytes
    async fn put(&self, path: &str, data: Vec<u8>) -> Result<()>;

    async fn exists(&self, path: &str) -> Result<bool>;
}

// ============================================================================
// Filesystem
// ============================================================================

/// Blob store on a local or shared directory
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    files: FileStore,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            files: FileStore::new(root),
        }
    }

    pub fn root(&self) -> &std::path::Path {
        self.files.base_dir()
    }

    async fn blocking<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(FileStore) -> Result<T> + Send + 'static,
    {
        let files = self.files.clone();
        tokio::task::spawn_blocking(move || op(files))
            .await
            .map_err(|e| Error::Internal(format!("storage task panicked: {}", e)))?
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn get(&self, path: &str) -> Result<Vec<u8>> {
        let key = path.to_string();
        self.blocking(move |files| files.read(&key)).await
    }

    async fn put(&self, path: &str, data: Vec<u8>) -> Result<()> {
        let key = path.to_string();
        self.blocking(move |files| files.write(&key, &data)).await
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let key = path.to_string();
        self.blocking(move |files| {
            files.file_path(&key)?;
            Ok(files.exists(&key))
        })
        .await
    }
}

// ============================================================================
// Memory
// ============================================================================

/// In-process blob store
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.blobs.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn get(&self, path: &str) -> Result<Vec<u8>> {
        self.blobs
            .read()
            .await
            .get(path)
            .cloned()
            .ok_or_else(|| Error::NotFound(path.to_string()))
    }

    async fn put(&self, path: &str, data: Vec<u8>) -> Result<()> {
        self.blobs.write().await.insert(path.to_string(), data);
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.blobs.read().await.contains_key(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fs_put_get() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());

        assert!(!store.exists("tasks/t1/payload.enc").await.unwrap());
        store.put("tasks/t1/payload.enc", b"sealed".to_vec()).await.unwrap();
        assert!(store.exists("tasks/t1/payload.enc").await.unwrap());
        assert_eq!(store.get("tasks/t1/payload.enc").await.unwrap(), b"sealed");
        assert!(dir.path().join("tasks/t1/payload.enc").is_file());
    }

    #[tokio::test]
    async fn test_fs_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());
        let err = store.get("tasks/none/metadata.json").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_fs_rejects_escaping_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());
        assert!(store.put("../outside", vec![1]).await.is_err());
        assert!(store.exists("/etc/passwd").await.is_err());
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryBlobStore::new();
        store.put("a/b", vec![1, 2]).await.unwrap();
        store.put("a/b", vec![3]).await.unwrap();
        assert_eq!(store.get("a/b").await.unwrap(), vec![3]);
        assert!(matches!(store.get("a/c").await, Err(Error::NotFound(_))));
        assert_eq!(store.keys().await, vec!["a/b".to_string()]);
    }
}
