//! Atomic file store
//!
//! Paths are relative keys (`tasks/<id>/metadata.json`) resolved under one
//! base directory. Writes go to a sibling temp file and are renamed into
//! place, so a reader sees either the old file or the new one.

use crate::{Error, Result};
use std::path::{Component, Path, PathBuf};
use uuid::Uuid;

/// Files under one base directory
#[derive(Debug, Clone)]
pub struct FileStore {
    base_dir: PathBuf,
}

impl FileStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Resolve a relative key. Absolute keys and `..` are rejected.
    pub fn file_path(&self, key: &str) -> Result<PathBuf> {
        let rel = Path::new(key);
        if key.is_empty()
            || !rel
                .components()
                .all(|c| matches!(c, Component::Normal(_)))
        {
            return Err(Error::Storage(format!("invalid storage key '{}'", key)));
        }
        Ok(self.base_dir.join(rel))
    }

    /// Bytes at `key`; `Error::NotFound` if absent
    pub fn read(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.file_path(key)?;
        std::fs::read(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::NotFound(key.to_string()),
            _ => Error::Storage(format!("Failed to read {}: {}", path.display(), e)),
        })
    }

    /// Write via a sibling temp file and rename
    pub fn write(&self, key: &str, data: &[u8]) -> Result<()> {
        let path = self.file_path(key)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Storage(format!("Failed to create directory: {}", e)))?;
        }

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tmp = path.with_file_name(format!(".{}.{}.tmp", file_name, Uuid::new_v4().simple()));

        std::fs::write(&tmp, data)
            .map_err(|e| Error::Storage(format!("Failed to write {}: {}", tmp.display(), e)))?;
        std::fs::rename(&tmp, &path).map_err(|e| {
            let _ = std::fs::remove_file(&tmp);
            Error::Storage(format!("Failed to rename into {}: {}", path.display(), e))
        })
    }

    pub fn exists(&self, key: &str) -> bool {
        self.file_path(key).map(|p| p.exists()).unwrap_or(false)
    }
}
