//! In-process adapter.
//!
//! Holds every collection in memory, evaluates queries with the reference
//! engine in [`crate::query`], and hands the complete new state of a
//! collection to its [`CollectionPersistence`] after each mutation. A
//! mutation is applied to a copy first, so a failed validation or write
//! leaves the visible state untouched.
//!
//! This adapter is the behavioral reference the other backends are tested
//! against.

#[cfg(feature = "file-store")]
mod codec;
#[cfg(feature = "file-store")]
mod file;
#[cfg(feature = "file-store")]
mod file_lock;
mod persistence;

#[cfg(feature = "file-store")]
pub use file::FilePersistence;
#[cfg(feature = "file-store")]
pub use file_lock::NamespaceLock;
pub use persistence::{CollectionPersistence, CollectionState, MemoryPersistence};

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info};

#[cfg(feature = "file-store")]
use crate::config::FileOptions;
use crate::error::{StorageError, StorageResult, ValidationError};
use crate::query::eval::record_index_key;
use crate::query::{execute, QueryOutcome, SortDirection, StorageQuery};
use crate::record::{validate_collection, NewRecord, Record, RecordPatch};
use crate::storage::lock_err;
use crate::storage::traits::{
    CleanupReport, CollectionSchema, CollectionStats, QueryExplanation, StorageAdapter, StoredVector,
    VectorPrimitives,
};

/// In-process adapter without durability.
pub type MemoryAdapter = LocalAdapter<MemoryPersistence>;

/// In-process adapter persisting to snapshot files.
#[cfg(feature = "file-store")]
pub type FileAdapter = LocalAdapter<FilePersistence>;

/// Scan-based adapter over a pluggable persistence.
#[derive(Debug)]
pub struct LocalAdapter<P: CollectionPersistence> {
    inner: Arc<Inner<P>>,
}

#[derive(Debug)]
struct Inner<P: CollectionPersistence> {
    name: &'static str,
    persistence: P,
    collections: RwLock<BTreeMap<String, CollectionState>>,
    loaded: AtomicBool,
    closed: AtomicBool,
}

impl MemoryAdapter {
    #[must_use]
    pub fn new() -> Self {
        Self::with_persistence("memory", MemoryPersistence)
    }
}

impl Default for MemoryAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "file-store")]
impl FileAdapter {
    /// Opens the namespace under `options.path`.
    ///
    /// # Errors
    ///
    /// Fails if the directory is unusable or locked by another process.
    pub fn open(namespace: &str, options: &FileOptions) -> StorageResult<Self> {
        Ok(Self::with_persistence("file", FilePersistence::open(namespace, options)?))
    }
}

fn check_unique(state: &CollectionState, candidate: &Record) -> StorageResult<()> {
    for index in state.indexes.iter().filter(|i| i.unique) {
        let Some(key) = record_index_key(candidate, &index.fields) else {
            continue;
        };
        let clash = state
            .records
            .iter()
            .filter(|r| r.id != candidate.id)
            .any(|r| record_index_key(r, &index.fields).as_ref() == Some(&key));
        if clash {
            return Err(ValidationError::UniqueViolation {
                collection: state.name.clone(),
                index: index.resolved_name(),
            }
            .into());
        }
    }
    Ok(())
}

impl<P: CollectionPersistence> Inner<P> {
    fn ensure_open(&self) -> StorageResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::unavailable(self.name, "adapter closed"));
        }
        if self.loaded.load(Ordering::Acquire) {
            return Ok(());
        }
        let mut guard = self.collections.write().map_err(|_| lock_err("collections"))?;
        if !self.loaded.load(Ordering::Acquire) {
            for state in self.persistence.load_all()? {
                guard.insert(state.name.clone(), state);
            }
            self.loaded.store(true, Ordering::Release);
            info!(target: "polystore::local", backend = self.name, collections = guard.len(), "adapter loaded");
        }
        Ok(())
    }

    fn with_collection<T>(
        &self,
        collection: &str,
        f: impl FnOnce(Option<&CollectionState>) -> StorageResult<T>,
    ) -> StorageResult<T> {
        self.ensure_open()?;
        let guard = self.collections.read().map_err(|_| lock_err("collections"))?;
        f(guard.get(collection))
    }

    /// Runs `f` against a copy of the collection and commits the copy only
    /// if both `f` and the persistence write succeed. Expired records are
    /// purged from the copy first, so they never collide with new writes.
    fn mutate<T>(
        &self,
        collection: &str,
        register: bool,
        f: impl FnOnce(&mut CollectionState) -> StorageResult<T>,
    ) -> StorageResult<Option<T>> {
        validate_collection(collection)?;
        self.ensure_open()?;
        let now = Utc::now();
        let mut guard = self.collections.write().map_err(|_| lock_err("collections"))?;
        let mut next = match guard.get(collection) {
            Some(state) => state.clone(),
            None if register => {
                debug!(target: "polystore::local", collection, "registering collection");
                CollectionState::new(collection, now)
            }
            None => return Ok(None),
        };
        next.purge_expired(now);
        let out = f(&mut next)?;
        next.updated_at = now;
        self.persistence.save(&next)?;
        guard.insert(collection.to_string(), next);
        Ok(Some(out))
    }

    fn truncate(&self, collection: &str) -> StorageResult<()> {
        validate_collection(collection)?;
        self.ensure_open()?;
        let mut guard = self.collections.write().map_err(|_| lock_err("collections"))?;
        self.persistence.remove(collection)?;
        guard.remove(collection);
        info!(target: "polystore::local", collection, "collection truncated");
        Ok(())
    }

    fn cleanup(&self) -> StorageResult<CleanupReport> {
        self.ensure_open()?;
        let now = Utc::now();
        let mut guard = self.collections.write().map_err(|_| lock_err("collections"))?;
        let mut report = CleanupReport::default();
        for state in guard.values_mut() {
            let mut next = state.clone();
            let removed = next.purge_expired(now);
            if removed == 0 {
                continue;
            }
            next.updated_at = now;
            self.persistence.save(&next)?;
            *state = next;
            report.removed += removed as u64;
            report.collections.push(state.name.clone());
        }
        if report.removed > 0 {
            info!(target: "polystore::local", removed = report.removed, "expired records purged");
        }
        Ok(report)
    }

    /// Empties every collection; the snapshots are written before any of
    /// them is swapped in.
    fn clear_all(&self) -> StorageResult<()> {
        self.ensure_open()?;
        let now = Utc::now();
        let mut guard = self.collections.write().map_err(|_| lock_err("collections"))?;
        let mut cleared = Vec::with_capacity(guard.len());
        for state in guard.values() {
            let mut next = state.clone();
            next.records.clear();
            next.vectors.clear();
            next.updated_at = now;
            self.persistence.save(&next)?;
            cleared.push(next);
        }
        for next in cleared {
            guard.insert(next.name.clone(), next);
        }
        Ok(())
    }
}

impl<P: CollectionPersistence> LocalAdapter<P> {
    #[must_use]
    pub fn with_persistence(name: &'static str, persistence: P) -> Self {
        Self {
            inner: Arc::new(Inner {
                name,
                persistence,
                collections: RwLock::new(BTreeMap::new()),
                loaded: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }),
        }
    }
}

impl<P: CollectionPersistence + 'static> LocalAdapter<P> {
    /// Runs `f` on the blocking pool when the persistence does file I/O,
    /// inline otherwise.
    async fn blocking<T, F>(&self, f: F) -> StorageResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Inner<P>) -> StorageResult<T> + Send + 'static,
    {
        if !P::BLOCKING {
            return f(&*self.inner);
        }
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || f(&*inner))
            .await
            .map_err(|e| StorageError::Backend(format!("{} task failed: {e}", self.inner.name)))?
    }

    async fn ensure_open(&self) -> StorageResult<()> {
        if self.inner.loaded.load(Ordering::Acquire) && !self.inner.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        self.blocking(Inner::ensure_open).await
    }

    async fn with_collection<T>(
        &self,
        collection: &str,
        f: impl FnOnce(Option<&CollectionState>) -> StorageResult<T>,
    ) -> StorageResult<T> {
        self.ensure_open().await?;
        self.inner.with_collection(collection, f)
    }

    async fn mutate<T, F>(&self, collection: &str, register: bool, f: F) -> StorageResult<Option<T>>
    where
        T: Send + 'static,
        F: FnOnce(&mut CollectionState) -> StorageResult<T> + Send + 'static,
    {
        let collection = collection.to_string();
        self.blocking(move |inner| inner.mutate(&collection, register, f)).await
    }
}

#[async_trait]
impl<P: CollectionPersistence + 'static> StorageAdapter for LocalAdapter<P> {
    fn backend_name(&self) -> &'static str {
        self.inner.name
    }

    async fn initialize(&self) -> StorageResult<()> {
        self.ensure_open().await
    }

    async fn create(&self, record: NewRecord) -> StorageResult<Record> {
        let record = record.into_record(Utc::now())?;
        let collection = record.collection.clone();
        let created = self
            .mutate(&collection, true, move |state| {
                if state.position(&record.id).is_some() {
                    return Err(StorageError::AlreadyExists {
                        collection: state.name.clone(),
                        id: record.id.clone(),
                    });
                }
                check_unique(state, &record)?;
                state.records.push(record.clone());
                Ok(record)
            })
            .await?;
        created.ok_or_else(|| StorageError::Backend("collection vanished during create".to_string()))
    }

    async fn read(&self, collection: &str, id: &str) -> StorageResult<Option<Record>> {
        validate_collection(collection)?;
        let now = Utc::now();
        self.with_collection(collection, |state| {
            Ok(state
                .and_then(|s| s.records.iter().find(|r| r.id == id))
                .filter(|r| !r.metadata.is_expired(now))
                .cloned())
        })
        .await
    }

    async fn query(&self, query: &StorageQuery) -> StorageResult<QueryOutcome> {
        let compiled = query.compile()?;
        let now = Utc::now();
        self.with_collection(&compiled.collection, |state| {
            Ok(state.map_or_else(QueryOutcome::default, |s| execute(&s.records, &compiled, now)))
        })
        .await
    }

    async fn update(&self, collection: &str, id: &str, patch: RecordPatch) -> StorageResult<Record> {
        let now = Utc::now();
        let (name, key) = (collection.to_string(), id.to_string());
        let updated = self
            .mutate(collection, false, move |state| {
                let idx = state
                    .position(&key)
                    .ok_or_else(|| StorageError::not_found(&name, &key))?;
                let mut record = state.records[idx].clone();
                record.apply_patch(&patch, now);
                check_unique(state, &record)?;
                state.records[idx] = record.clone();
                Ok(record)
            })
            .await?;
        updated.ok_or_else(|| StorageError::not_found(collection, id))
    }

    async fn delete(&self, collection: &str, id: &str) -> StorageResult<bool> {
        let exists = self
            .with_collection(collection, |state| Ok(state.is_some_and(|s| s.position(id).is_some())))
            .await?;
        if !exists {
            return Ok(false);
        }
        let key = id.to_string();
        Ok(self
            .mutate(collection, false, move |state| Ok(state.remove(&key).is_some()))
            .await?
            .unwrap_or(false))
    }

    /// Swaps the stored copy in a single mutation, so readers never observe
    /// the record missing.
    async fn replace(&self, record: NewRecord) -> StorageResult<Record> {
        if record.id.is_none() {
            return Err(ValidationError::EmptyRecordId.into());
        }
        let record = record.into_record(Utc::now())?;
        let collection = record.collection.clone();
        let stored = self
            .mutate(&collection, true, move |state| {
                check_unique(state, &record)?;
                match state.position(&record.id) {
                    Some(idx) => {
                        state.vectors.retain(|v| v.record_id != record.id);
                        state.records[idx] = record.clone();
                    }
                    None => state.records.push(record.clone()),
                }
                Ok(record)
            })
            .await?;
        stored.ok_or_else(|| StorageError::Backend("collection vanished during replace".to_string()))
    }

    async fn list_collections(&self) -> StorageResult<Vec<String>> {
        self.ensure_open().await?;
        let guard = self.inner.collections.read().map_err(|_| lock_err("collections"))?;
        Ok(guard.keys().cloned().collect())
    }

    async fn collection_stats(&self, collection: &str) -> StorageResult<CollectionStats> {
        validate_collection(collection)?;
        self.with_collection(collection, |state| {
            Ok(state.map_or_else(
                || CollectionStats::empty(collection),
                |s| CollectionStats {
                    name: s.name.clone(),
                    record_count: s.records.len() as u64,
                    total_size: s.total_size(),
                    created_at: Some(s.created_at),
                    updated_at: Some(s.updated_at),
                },
            ))
        })
        .await
    }

    async fn clear(&self, collection: &str) -> StorageResult<()> {
        self.mutate(collection, false, |state| {
            state.records.clear();
            state.vectors.clear();
            Ok(())
        })
        .await?;
        Ok(())
    }

    async fn clear_all(&self) -> StorageResult<()> {
        self.blocking(Inner::clear_all).await
    }

    async fn truncate(&self, collection: &str) -> StorageResult<()> {
        let collection = collection.to_string();
        self.blocking(move |inner| inner.truncate(&collection)).await
    }

    async fn ensure_schema(&self, collection: &str, schema: &CollectionSchema) -> StorageResult<()> {
        schema.validate()?;
        let indexes = schema.indexes.clone();
        self.mutate(collection, true, move |state| {
            for index in indexes {
                let name = index.resolved_name();
                if state.indexes.iter().any(|i| i.resolved_name() == name) {
                    continue;
                }
                let unique = index.unique;
                state.indexes.push(index);
                if unique {
                    for record in &state.records {
                        check_unique(state, record)?;
                    }
                }
            }
            Ok(())
        })
        .await?;
        Ok(())
    }

    async fn cleanup(&self) -> StorageResult<CleanupReport> {
        self.blocking(Inner::cleanup).await
    }

    async fn close(&self) -> StorageResult<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.inner.persistence.close()?;
        debug!(target: "polystore::local", backend = self.inner.name, "adapter closed");
        Ok(())
    }

    async fn explain_query(&self, query: &StorageQuery) -> StorageResult<QueryExplanation> {
        let compiled = query.compile()?;
        let estimated_rows = self
            .with_collection(&compiled.collection, |state| Ok(state.map_or(0, |s| s.records.len() as u64)))
            .await?;

        let mut predicate = compiled.filter.to_string();
        if let Some(range) = &compiled.time_range {
            let _ = write!(
                predicate,
                " AND {} IN [{}, {})",
                range.field(),
                range.from.map_or_else(|| "-inf".to_string(), |t| t.to_rfc3339()),
                range.to.map_or_else(|| "+inf".to_string(), |t| t.to_rfc3339()),
            );
        }
        let params = compiled
            .filter
            .conditions
            .iter()
            .flat_map(|c| c.operators.iter())
            .map(|op| Value::String(op.to_string()))
            .collect();

        let mut plan = vec![format!("SCAN {} ({estimated_rows} records)", compiled.collection)];
        if !compiled.sort.is_empty() {
            let keys: Vec<String> = compiled
                .sort
                .iter()
                .map(|s| match s.direction {
                    SortDirection::Asc => format!("{} asc", s.field),
                    SortDirection::Desc => format!("{} desc", s.field),
                })
                .collect();
            plan.push(format!("SORT {}", keys.join(", ")));
        }
        if let Some(cursor) = &compiled.cursor {
            plan.push(format!("CURSOR {:?} {} = {}", cursor.direction, cursor.field, cursor.value));
        }
        if compiled.offset > 0 {
            plan.push(format!("OFFSET {}", compiled.offset));
        }
        if let Some(limit) = compiled.limit {
            plan.push(format!("LIMIT {limit}"));
        }

        Ok(QueryExplanation {
            backend: self.inner.name.to_string(),
            predicate,
            params,
            estimated_rows,
            plan,
        })
    }
}

#[async_trait]
impl<P: CollectionPersistence + 'static> VectorPrimitives for LocalAdapter<P> {
    async fn ensure_vector_storage(&self, collection: &str, dimensions: usize) -> StorageResult<()> {
        self.mutate(collection, true, move |state| match state.vector_dimensions {
            Some(existing) if existing != dimensions => Err(ValidationError::DimensionMismatch {
                expected: existing,
                actual: dimensions,
            }
            .into()),
            _ => {
                state.vector_dimensions = Some(dimensions);
                Ok(())
            }
        })
        .await?;
        Ok(())
    }

    async fn store_vector(&self, collection: &str, vector: StoredVector) -> StorageResult<()> {
        let record_id = vector.record_id.clone();
        let name = collection.to_string();
        let stored = self
            .mutate(collection, false, move |state| {
                if state.position(&vector.record_id).is_none() {
                    return Err(StorageError::not_found(&name, &vector.record_id));
                }
                let dims = *state.vector_dimensions.get_or_insert(vector.embedding.len());
                if dims != vector.embedding.len() {
                    return Err(ValidationError::DimensionMismatch {
                        expected: dims,
                        actual: vector.embedding.len(),
                    }
                    .into());
                }
                match state.vectors.iter_mut().find(|v| v.record_id == vector.record_id) {
                    Some(slot) => *slot = vector,
                    None => state.vectors.push(vector),
                }
                Ok(())
            })
            .await?;
        stored.ok_or_else(|| StorageError::not_found(collection, &record_id))
    }

    async fn get_all_vectors(&self, collection: &str) -> StorageResult<Vec<StoredVector>> {
        validate_collection(collection)?;
        self.with_collection(collection, |state| Ok(state.map(|s| s.vectors.clone()).unwrap_or_default()))
            .await
    }

    async fn get_vector_count(&self, collection: &str) -> StorageResult<u64> {
        validate_collection(collection)?;
        self.with_collection(collection, |state| Ok(state.map_or(0, |s| s.vectors.len() as u64)))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::data_from;
    use crate::storage::traits::{BatchItem, BatchOperation, IndexDefinition};
    use serde_json::json;

    fn user(id: &str, data: Value) -> NewRecord {
        NewRecord::new("users", data_from(data)).with_id(id)
    }

    #[tokio::test]
    async fn test_create_read_roundtrip() {
        let adapter = MemoryAdapter::new();
        adapter.create(user("r1", json!({"name": "Ada"}))).await.unwrap();
        let record = adapter.read("users", "r1").await.unwrap().unwrap();
        assert_eq!(record.data["name"], json!("Ada"));
        assert_eq!(record.metadata.version, 1);
    }

    #[tokio::test]
    async fn test_duplicate_create_rejected() {
        let adapter = MemoryAdapter::new();
        adapter.create(user("r1", json!({}))).await.unwrap();
        let err = adapter.create(user("r1", json!({}))).await.unwrap_err();
        assert!(matches!(err, StorageError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn test_update_missing_is_not_found_delete_missing_is_false() {
        let adapter = MemoryAdapter::new();
        let err = adapter
            .update("users", "nope", RecordPatch::default())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(!adapter.delete("users", "nope").await.unwrap());
    }

    #[tokio::test]
    async fn test_unique_index_enforced() {
        let adapter = MemoryAdapter::new();
        adapter
            .ensure_schema(
                "users",
                &CollectionSchema::default().with_index(IndexDefinition::unique(&["email"])),
            )
            .await
            .unwrap();
        adapter.create(user("a", json!({"email": "a@x"}))).await.unwrap();
        adapter.create(user("b", json!({}))).await.unwrap();
        adapter.create(user("c", json!({}))).await.unwrap();
        let err = adapter.create(user("d", json!({"email": "a@x"}))).await.unwrap_err();
        assert!(matches!(
            err,
            StorageError::Validation(ValidationError::UniqueViolation { .. })
        ));
        assert!(adapter.read("users", "d").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_clear_keeps_schema_truncate_drops_it() {
        let adapter = MemoryAdapter::new();
        adapter
            .ensure_schema(
                "users",
                &CollectionSchema::default().with_index(IndexDefinition::unique(&["email"])),
            )
            .await
            .unwrap();
        adapter.create(user("a", json!({"email": "a@x"}))).await.unwrap();
        adapter.clear("users").await.unwrap();
        assert_eq!(adapter.list_collections().await.unwrap(), vec!["users"]);
        adapter.create(user("a", json!({"email": "a@x"}))).await.unwrap();
        assert!(adapter.create(user("b", json!({"email": "a@x"}))).await.is_err());

        adapter.truncate("users").await.unwrap();
        assert!(adapter.list_collections().await.unwrap().is_empty());
        adapter.create(user("a", json!({"email": "a@x"}))).await.unwrap();
        adapter.create(user("b", json!({"email": "a@x"}))).await.unwrap();
    }

    #[tokio::test]
    async fn test_batch_is_per_item() {
        let adapter = MemoryAdapter::new();
        let outcome = adapter
            .batch(vec![
                BatchOperation::Create { record: user("a", json!({})) },
                BatchOperation::Update {
                    collection: "users".to_string(),
                    id: "missing".to_string(),
                    patch: RecordPatch::default(),
                },
                BatchOperation::Delete {
                    collection: "users".to_string(),
                    id: "a".to_string(),
                },
            ])
            .await
            .unwrap();
        assert_eq!(outcome.succeeded, 2);
        assert_eq!(outcome.failed, 1);
        assert_eq!(outcome.results[2].data, Some(BatchItem::Deleted(true)));
    }

    #[tokio::test]
    async fn test_stats_and_cleanup() {
        let adapter = MemoryAdapter::new();
        adapter.create(user("a", json!({"x": 1}))).await.unwrap();
        let stats = adapter.collection_stats("users").await.unwrap();
        assert_eq!(stats.record_count, 1);
        assert_eq!(stats.total_size, 7);

        {
            let mut guard = adapter.inner.collections.write().unwrap();
            let state = guard.get_mut("users").unwrap();
            state.records[0].metadata.ttl = Some(1);
            state.records[0].metadata.updated_at = Utc::now() - chrono::Duration::seconds(10);
        }
        assert!(adapter.read("users", "a").await.unwrap().is_none());
        let report = adapter.cleanup().await.unwrap();
        assert_eq!(report.removed, 1);
        assert_eq!(report.collections, vec!["users"]);
    }

    #[tokio::test]
    async fn test_closed_adapter_is_unavailable() {
        let adapter = MemoryAdapter::new();
        adapter.close().await.unwrap();
        let err = adapter.read("users", "a").await.unwrap_err();
        assert!(matches!(err, StorageError::BackendUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_vectors_follow_records() {
        let adapter = MemoryAdapter::new();
        adapter.create(user("a", json!({}))).await.unwrap();
        adapter.ensure_vector_storage("users", 2).await.unwrap();
        adapter
            .store_vector("users", StoredVector::new("a", vec![1.0, 0.0]))
            .await
            .unwrap();
        let err = adapter
            .store_vector("users", StoredVector::new("a", vec![1.0]))
            .await
            .unwrap_err();
        assert!(err.is_validation());
        assert_eq!(adapter.get_vector_count("users").await.unwrap(), 1);
        adapter.delete("users", "a").await.unwrap();
        assert_eq!(adapter.get_vector_count("users").await.unwrap(), 0);
    }

    #[cfg(feature = "file-store")]
    #[tokio::test]
    async fn test_file_adapter_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let options = FileOptions {
            path: dir.path().to_path_buf(),
            sync_on_write: true,
        };
        {
            let adapter = FileAdapter::open("app", &options).unwrap();
            adapter.create(user("r1", json!({"name": "Ada"}))).await.unwrap();
            adapter.close().await.unwrap();
        }
        let adapter = FileAdapter::open("app", &options).unwrap();
        let record = adapter.read("users", "r1").await.unwrap().unwrap();
        assert_eq!(record.data["name"], json!("Ada"));
    }

    #[tokio::test]
    async fn test_replace_keeps_position_and_drops_vector() {
        let adapter = MemoryAdapter::new();
        let first = adapter.create(user("a", json!({"n": 1}))).await.unwrap();
        adapter.create(user("b", json!({"n": 2}))).await.unwrap();
        adapter
            .store_vector("users", StoredVector::new("a", vec![1.0]))
            .await
            .unwrap();

        let mut incoming = first.clone();
        incoming.data = data_from(json!({"n": 10}));
        incoming.metadata.version = 4;
        let stored = adapter.replace(NewRecord::mirror(&incoming)).await.unwrap();
        assert_eq!(stored, incoming);
        let outcome = adapter.query(&StorageQuery::new("users")).await.unwrap();
        assert_eq!(outcome.ids(), vec!["a", "b"]);
        assert_eq!(adapter.get_vector_count("users").await.unwrap(), 0);

        adapter.replace(user("c", json!({"n": 3}))).await.unwrap();
        assert!(adapter.read("users", "c").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_clear_all_keeps_collections() {
        let adapter = MemoryAdapter::new();
        adapter.create(user("a", json!({}))).await.unwrap();
        adapter
            .create(NewRecord::new("posts", data_from(json!({}))).with_id("p"))
            .await
            .unwrap();
        adapter.clear_all().await.unwrap();
        assert_eq!(adapter.list_collections().await.unwrap(), vec!["posts", "users"]);
        assert_eq!(adapter.collection_stats("users").await.unwrap().record_count, 0);
        assert!(adapter.read("posts", "p").await.unwrap().is_none());
    }

    #[cfg(feature = "file-store")]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_file_adapter_concurrent_writes_persist() {
        let dir = tempfile::tempdir().unwrap();
        let options = FileOptions {
            path: dir.path().to_path_buf(),
            sync_on_write: false,
        };
        let adapter = Arc::new(FileAdapter::open("app", &options).unwrap());
        let writers: Vec<_> = (0..16)
            .map(|i| {
                let adapter = Arc::clone(&adapter);
                tokio::spawn(async move { adapter.create(user(&format!("u{i:02}"), json!({"i": i}))).await })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap().unwrap();
        }
        adapter.close().await.unwrap();
        drop(adapter);

        let reopened = FileAdapter::open("app", &options).unwrap();
        assert_eq!(reopened.collection_stats("users").await.unwrap().record_count, 16);
    }

    #[tokio::test]
    async fn test_explain_does_not_execute() {
        let adapter = MemoryAdapter::new();
        adapter.create(user("a", json!({"age": 40}))).await.unwrap();
        let explanation = adapter
            .explain_query(&StorageQuery::new("users").filter(json!({"age": {"$gte": 30}})).limit(5))
            .await
            .unwrap();
        assert_eq!(explanation.predicate, "age >= 30");
        assert_eq!(explanation.estimated_rows, 1);
        assert!(explanation.plan.iter().any(|p| p == "LIMIT 5"));
    }
}
