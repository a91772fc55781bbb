//! Artifact storage
//!
//! The version manager persists packages, backups and history through an
//! [`ArtifactStore`]. Keys are `/`-separated relative names such as
//! `active/<id>` or `backups/<id>/<version>`.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use thiserror::Error;
use tokio::fs;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("No artifact stored under '{0}'")]
    NotFound(String),

    #[error("Invalid storage key '{0}'")]
    InvalidKey(String),

    #[error("Storage I/O failed for '{key}': {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Stored record '{key}' is corrupt: {reason}")]
    Corrupt { key: String, reason: String },
}

impl StorageError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "P600",
            Self::InvalidKey(_) => "P601",
            Self::Io { .. } => "P602",
            Self::Corrupt { .. } => "P603",
        }
    }
}

/// Well-known keys
pub mod keys {
    use semver::Version;

    pub fn active(plugin_id: &str) -> String {
        format!("active/{plugin_id}")
    }

    pub fn backup(plugin_id: &str, version: &Version) -> String {
        format!("backups/{plugin_id}/{version}")
    }

    pub fn history(plugin_id: &str) -> String {
        format!("history/{plugin_id}.json")
    }

    pub const HISTORY_PREFIX: &str = "history/";
}

#[async_trait]
pub trait ArtifactStore: Send + Sync + std::fmt::Debug {
    async fn read(&self, key: &str) -> Result<Vec<u8>, StorageError>;

    /// Replace the value under `key`; readers never observe a partial write
    async fn write(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError>;

    /// Remove `key`; removing a missing key is not an error
    async fn remove(&self, key: &str) -> Result<(), StorageError>;

    /// Keys directly under `prefix` (which ends with `/`)
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError>;
}

fn validate_key(key: &str) -> Result<(), StorageError> {
    let valid = !key.is_empty()
        && !key.starts_with('/')
        && key.split('/').all(|segment| {
            !segment.is_empty()
                && segment != "."
                && segment != ".."
                && segment
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '+'))
        });

    if valid {
        Ok(())
    } else {
        Err(StorageError::InvalidKey(key.to_string()))
    }
}

/// Filesystem store rooted at one directory
#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        validate_key(key)?;
        let path = self.root.join(key);
        if path
            .strip_prefix(&self.root)
            .map(|rel| rel.components().all(|c| matches!(c, Component::Normal(_))))
            .unwrap_or(false)
        {
            Ok(path)
        } else {
            Err(StorageError::InvalidKey(key.to_string()))
        }
    }
}

fn io_error(key: &str) -> impl FnOnce(std::io::Error) -> StorageError + '_ {
    move |source| StorageError::Io {
        key: key.to_string(),
        source,
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn read(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.path_for(key)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StorageError::NotFound(key.to_string())),
            Err(e) => Err(io_error(key)(e)),
        }
    }

    async fn write(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        let parent = path
            .parent()
            .ok_or_else(|| StorageError::InvalidKey(key.to_string()))?;
        fs::create_dir_all(parent).await.map_err(io_error(key))?;

        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| StorageError::InvalidKey(key.to_string()))?;
        let tmp = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

        fs::write(&tmp, bytes).await.map_err(io_error(key))?;
        if let Err(e) = fs::rename(&tmp, &path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(io_error(key)(e));
        }

        debug!(key = %key, bytes = bytes.len(), "Artifact written");
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(key)(e)),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let dir_key = prefix.trim_end_matches('/');
        let dir = self.path_for(dir_key)?;

        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error(prefix)(e)),
        };

        let mut keys = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(io_error(prefix))? {
            let file_type = entry.file_type().await.map_err(io_error(prefix))?;
            if !file_type.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if !name.starts_with('.') {
                    keys.push(format!("{dir_key}/{name}"));
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}

/// In-memory store, with switchable write failures for exercising error paths
#[derive(Debug, Default, Clone)]
pub struct MemoryArtifactStore {
    entries: Arc<RwLock<BTreeMap<String, Vec<u8>>>>,
    fail_writes: Arc<AtomicBool>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following `write` fail with an I/O error
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Overwrite bytes directly, bypassing failure injection
    pub fn put(&self, key: &str, bytes: Vec<u8>) {
        self.entries.write().insert(key.to_string(), bytes);
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.entries.read().get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.read().contains_key(key)
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn read(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        validate_key(key)?;
        self.get(key)
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn write(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError> {
        validate_key(key)?;
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Io {
                key: key.to_string(),
                source: std::io::Error::other("injected write failure"),
            });
        }
        self.put(key, bytes.to_vec());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        validate_key(key)?;
        self.entries.write().remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let entries = self.entries.read();
        Ok(entries
            .keys()
            .filter(|k| {
                k.strip_prefix(prefix)
                    .is_some_and(|rest| !rest.is_empty() && !rest.contains('/'))
            })
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fs_store_roundtrip_and_list() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path());

        store.write("history/a.json", b"[]").await.unwrap();
        store.write("history/b.json", b"[]").await.unwrap();
        store.write("active/a", b"pkg").await.unwrap();

        assert_eq!(store.read("active/a").await.unwrap(), b"pkg");
        assert_eq!(
            store.list(keys::HISTORY_PREFIX).await.unwrap(),
            vec!["history/a.json".to_string(), "history/b.json".to_string()]
        );
    }

    #[tokio::test]
    async fn test_fs_store_overwrite_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path());
        store.write("active/a", b"one").await.unwrap();
        store.write("active/a", b"two").await.unwrap();

        assert_eq!(store.read("active/a").await.unwrap(), b"two");
        let names: Vec<_> = std::fs::read_dir(dir.path().join("active"))
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names.len(), 1);
    }

    #[tokio::test]
    async fn test_fs_store_missing_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path());
        assert!(matches!(
            store.read("active/none").await,
            Err(StorageError::NotFound(_))
        ));
        assert!(store.remove("active/none").await.is_ok());
        assert!(store.list("history/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_keys_cannot_escape_root() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path());
        for key in ["../x", "/etc/passwd", "a/../../b", "a//b", ""] {
            assert!(
                matches!(store.write(key, b"x").await, Err(StorageError::InvalidKey(_))),
                "{key} accepted"
            );
        }
    }

    #[tokio::test]
    async fn test_memory_store_failure_injection() {
        let store = MemoryArtifactStore::new();
        store.write("active/a", b"1").await.unwrap();
        store.set_fail_writes(true);
        assert!(store.write("active/a", b"2").await.is_err());
        assert_eq!(store.read("active/a").await.unwrap(), b"1");
    }

    #[tokio::test]
    async fn test_memory_store_list_is_shallow() {
        let store = MemoryArtifactStore::new();
        store.put("backups/a/1.0.0", vec![]);
        store.put("history/a.json", vec![]);
        assert_eq!(
            store.list("history/").await.unwrap(),
            vec!["history/a.json".to_string()]
        );
    }
}
