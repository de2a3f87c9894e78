//! Snapshot files on disk.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{debug, warn};

use super::codec;
use super::file_lock::NamespaceLock;
use super::persistence::{CollectionPersistence, CollectionState};
use crate::config::FileOptions;
use crate::error::{StorageError, StorageResult};

const COLLECTION_EXT: &str = "col";

/// One snapshot file per collection under `<root>/<namespace>/`.
///
/// File names are the hex encoding of the collection name, so any name is
/// filesystem-safe. Writes go to a temporary file that is renamed over the
/// old snapshot, so a crash leaves either the old or the new state.
#[derive(Debug)]
pub struct FilePersistence {
    dir: PathBuf,
    sync_on_write: bool,
    lock: Mutex<Option<NamespaceLock>>,
}

fn hex_name(name: &str) -> String {
    use std::fmt::Write as _;
    name.bytes().fold(String::with_capacity(name.len() * 2), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}

impl FilePersistence {
    /// Opens (creating if needed) the namespace directory and locks it.
    ///
    /// # Errors
    ///
    /// Fails if the directory cannot be created or another process holds the
    /// namespace.
    pub fn open(namespace: &str, options: &FileOptions) -> StorageResult<Self> {
        let dir = options.path.join(namespace);
        fs::create_dir_all(&dir)?;
        let lock = NamespaceLock::acquire(&dir).map_err(|e| {
            if e.kind() == ErrorKind::WouldBlock {
                StorageError::unavailable("file", format!("{}: {e}", dir.display()))
            } else {
                StorageError::Io(e)
            }
        })?;
        debug!(target: "polystore::local", dir = %dir.display(), "namespace locked");
        Ok(Self {
            dir,
            sync_on_write: options.sync_on_write,
            lock: Mutex::new(Some(lock)),
        })
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.{COLLECTION_EXT}", hex_name(name)))
    }

    fn ensure_locked(&self) -> StorageResult<()> {
        let guard = self
            .lock
            .lock()
            .map_err(|_| StorageError::Backend("poisoned lock: file namespace".to_string()))?;
        if guard.is_none() {
            return Err(StorageError::unavailable("file", "namespace closed"));
        }
        Ok(())
    }

    fn read_snapshot(path: &Path) -> StorageResult<CollectionState> {
        let file = File::open(path)?;
        let state = codec::decode_file(&mut BufReader::new(file))?;
        Ok(state)
    }
}

impl CollectionPersistence for FilePersistence {
    fn load_all(&self) -> StorageResult<Vec<CollectionState>> {
        self.ensure_locked()?;
        let mut loaded = BTreeMap::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(COLLECTION_EXT) {
                continue;
            }
            match Self::read_snapshot(&path) {
                Ok(state) => {
                    loaded.insert(state.name.clone(), state);
                }
                Err(e) => {
                    warn!(
                        target: "polystore::local",
                        path = %path.display(),
                        error = %e,
                        "skipping unreadable collection file"
                    );
                }
            }
        }
        debug!(target: "polystore::local", collections = loaded.len(), "collections loaded");
        Ok(loaded.into_values().collect())
    }

    fn save(&self, state: &CollectionState) -> StorageResult<()> {
        self.ensure_locked()?;
        let bytes = codec::encode_file(state)?;
        let target = self.file_for(&state.name);
        let tmp = target.with_extension("tmp");
        {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp)?;
            file.write_all(&bytes)?;
            if self.sync_on_write {
                file.sync_all()?;
            }
        }
        fs::rename(&tmp, &target)?;
        Ok(())
    }

    fn remove(&self, name: &str) -> StorageResult<()> {
        self.ensure_locked()?;
        match fs::remove_file(self.file_for(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn close(&self) -> StorageResult<()> {
        let mut guard = self
            .lock
            .lock()
            .map_err(|_| StorageError::Backend("poisoned lock: file namespace".to_string()))?;
        guard.take();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{data_from, NewRecord};
    use chrono::Utc;
    use serde_json::json;
    use tempfile::tempdir;

    fn options(root: &Path) -> FileOptions {
        FileOptions {
            path: root.to_path_buf(),
            sync_on_write: false,
        }
    }

    #[test]
    fn test_hex_name_is_filesystem_safe() {
        assert_eq!(hex_name("a/b"), "612f62");
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempdir().unwrap();
        let now = Utc::now();
        let mut state = CollectionState::new("weird/name", now);
        state.records.push(
            NewRecord::new("weird/name", data_from(json!({"x": 1})))
                .with_id("r1")
                .into_record(now)
                .unwrap(),
        );
        {
            let persistence = FilePersistence::open("ns", &options(dir.path())).unwrap();
            persistence.save(&state).unwrap();
        }
        let persistence = FilePersistence::open("ns", &options(dir.path())).unwrap();
        assert_eq!(persistence.load_all().unwrap(), vec![state]);
    }

    #[test]
    fn test_corrupt_file_is_skipped() {
        let dir = tempdir().unwrap();
        let persistence = FilePersistence::open("ns", &options(dir.path())).unwrap();
        persistence
            .save(&CollectionState::new("good", Utc::now()))
            .unwrap();
        fs::write(persistence.dir().join("6261.col"), b"garbage").unwrap();
        let loaded = persistence.load_all().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].name, "good");
    }

    #[test]
    fn test_remove_missing_is_ok() {
        let dir = tempdir().unwrap();
        let persistence = FilePersistence::open("ns", &options(dir.path())).unwrap();
        persistence.remove("never-saved").unwrap();
    }

    #[test]
    fn test_second_open_is_refused() {
        let dir = tempdir().unwrap();
        let _first = FilePersistence::open("ns", &options(dir.path())).unwrap();
        let err = FilePersistence::open("ns", &options(dir.path())).unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_closed_persistence_refuses_writes() {
        let dir = tempdir().unwrap();
        let persistence = FilePersistence::open("ns", &options(dir.path())).unwrap();
        persistence.close().unwrap();
        assert!(persistence
            .save(&CollectionState::new("c", Utc::now()))
            .is_err());
        assert!(FilePersistence::open("ns", &options(dir.path())).is_ok());
    }
}
