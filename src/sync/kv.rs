//! String key-value stores backing the persisted sync queue.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::error::StorageResult;
use crate::storage::lock_err;

/// Minimal durable map from keys to string values.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// `Ok(None)` for a key never written or removed.
    async fn get(&self, key: &str) -> StorageResult<Option<String>>;

    async fn set(&self, key: &str, value: String) -> StorageResult<()>;

    /// Removing a missing key succeeds.
    async fn remove(&self, key: &str) -> StorageResult<()>;
}

/// Process-lifetime store.
#[derive(Debug, Default)]
pub struct MemoryKeyValueStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryKeyValueStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryKeyValueStore {
    async fn get(&self, key: &str) -> StorageResult<Option<String>> {
        let entries = self.entries.lock().map_err(|_| lock_err("kv store"))?;
        Ok(entries.get(key).cloned())
    }

    async fn set(&self, key: &str, value: String) -> StorageResult<()> {
        let mut entries = self.entries.lock().map_err(|_| lock_err("kv store"))?;
        entries.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> StorageResult<()> {
        let mut entries = self.entries.lock().map_err(|_| lock_err("kv store"))?;
        entries.remove(key);
        Ok(())
    }
}

/// One file per key under a directory.
///
/// File names are the hex encoding of the key. A write lands in a temporary
/// file first and is renamed into place, so readers see the old or the new
/// value, never a torn one.
#[derive(Debug, Clone)]
pub struct FileKeyValueStore {
    dir: PathBuf,
    sync_on_write: bool,
}

impl FileKeyValueStore {
    /// # Errors
    ///
    /// Fails if the directory cannot be created.
    pub async fn open(dir: impl Into<PathBuf>) -> StorageResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            sync_on_write: true,
        })
    }

    /// Skips `fsync` after each write.
    #[must_use]
    pub const fn without_sync(mut self) -> Self {
        self.sync_on_write = false;
        self
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let name = key.bytes().fold(String::with_capacity(key.len() * 2), |mut out, b| {
            let _ = write!(out, "{b:02x}");
            out
        });
        self.dir.join(format!("{name}.json"))
    }
}

#[async_trait]
impl KeyValueStore for FileKeyValueStore {
    async fn get(&self, key: &str) -> StorageResult<Option<String>> {
        match fs::read_to_string(self.path_for(key)).await {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn set(&self, key: &str, value: String) -> StorageResult<()> {
        let target = self.path_for(key);
        let tmp = target.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp).await?;
            file.write_all(value.as_bytes()).await?;
            if self.sync_on_write {
                file.sync_all().await?;
            }
        }
        fs::rename(&tmp, &target).await?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> StorageResult<()> {
        match fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
