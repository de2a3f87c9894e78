//! Where the in-process adapter keeps its collections between runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageResult;
use crate::record::Record;
use crate::storage::traits::{IndexDefinition, StoredVector};

/// Everything stored for one collection. Records are kept in insertion
/// order, which is the tie-break order of every sort.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionState {
    pub name: String,
    #[serde(default)]
    pub records: Vec<Record>,
    #[serde(default)]
    pub indexes: Vec<IndexDefinition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vector_dimensions: Option<usize>,
    #[serde(default)]
    pub vectors: Vec<StoredVector>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CollectionState {
    #[must_use]
    pub fn new(name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            records: Vec::new(),
            indexes: Vec::new(),
            vector_dimensions: None,
            vectors: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    #[must_use]
    pub fn position(&self, id: &str) -> Option<usize> {
        self.records.iter().position(|r| r.id == id)
    }

    /// Removes the record and its vector. Returns the removed record.
    pub fn remove(&mut self, id: &str) -> Option<Record> {
        let idx = self.position(id)?;
        self.vectors.retain(|v| v.record_id != id);
        Some(self.records.remove(idx))
    }

    /// Drops records whose TTL elapsed, with their vectors.
    pub fn purge_expired(&mut self, now: DateTime<Utc>) -> usize {
        let expired: Vec<String> = self
            .records
            .iter()
            .filter(|r| r.metadata.is_expired(now))
            .map(|r| r.id.clone())
            .collect();
        for id in &expired {
            self.remove(id);
        }
        expired.len()
    }

    #[must_use]
    pub fn total_size(&self) -> u64 {
        self.records.iter().map(Record::data_size).sum()
    }
}

/// Durable home of collection snapshots.
///
/// Every mutation hands the complete new state of the touched collection to
/// `save`; there is no incremental log.
pub trait CollectionPersistence: Send + Sync {
    /// Whether `save` and friends touch the filesystem. Blocking
    /// persistences are driven from the blocking thread pool.
    const BLOCKING: bool = true;

    /// Loads every stored collection.
    fn load_all(&self) -> StorageResult<Vec<CollectionState>>;

    /// Replaces the stored snapshot of one collection.
    fn save(&self, state: &CollectionState) -> StorageResult<()>;

    /// Forgets a collection.
    fn remove(&self, name: &str) -> StorageResult<()>;

    /// Releases any resources held (locks, handles).
    fn close(&self) -> StorageResult<()> {
        Ok(())
    }
}

/// Keeps nothing: the adapter's in-memory state is the only copy.
#[derive(Debug, Default, Clone, Copy)]
pub struct MemoryPersistence;

impl CollectionPersistence for MemoryPersistence {
    const BLOCKING: bool = false;

    fn load_all(&self) -> StorageResult<Vec<CollectionState>> {
        Ok(Vec::new())
    }

    fn save(&self, _state: &CollectionState) -> StorageResult<()> {
        Ok(())
    }

    fn remove(&self, _name: &str) -> StorageResult<()> {
        Ok(())
    }
}
