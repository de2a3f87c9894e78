//! The durable, ordered queue of mutations awaiting the remote.
//!
//! The whole queue is persisted as one JSON array under a single key after
//! every change. A missing key is an empty queue; an unparseable value is
//! reported as `QueueCorruption`, logged, and replaced by an empty queue.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::kv::KeyValueStore;
use crate::error::{StorageError, StorageResult};
use crate::record::{NewRecord, Record, RecordData, RecordMetadata, RecordPatch};
use crate::storage::StorageAdapter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOperationType {
    Create,
    Update,
    Delete,
}

const fn default_increment() -> bool {
    true
}

/// One deferred mutation.
///
/// `data` is the full record data for a create and the merged keys for an
/// update. A create also carries the local metadata so the remote copy keeps
/// the same timestamps and version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOperation {
    /// Position in the queue; strictly increasing per queue instance.
    #[serde(default)]
    pub seq: u64,
    #[serde(rename = "type")]
    pub op_type: SyncOperationType,
    pub collection: String,
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<RecordData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<RecordMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
    #[serde(default = "default_increment")]
    pub increment_version: bool,
    pub enqueued_at: DateTime<Utc>,
}

impl SyncOperation {
    fn base(op_type: SyncOperationType, collection: &str, id: &str) -> Self {
        Self {
            seq: 0,
            op_type,
            collection: collection.to_string(),
            id: id.to_string(),
            data: None,
            metadata: None,
            tags: None,
            ttl: None,
            increment_version: true,
            enqueued_at: Utc::now(),
        }
    }

    /// Replays a locally created record.
    #[must_use]
    pub fn create(record: &Record) -> Self {
        Self {
            data: Some(record.data.clone()),
            metadata: Some(record.metadata.clone()),
            ..Self::base(SyncOperationType::Create, &record.collection, &record.id)
        }
    }

    #[must_use]
    pub fn update(collection: &str, id: &str, patch: &RecordPatch) -> Self {
        Self {
            data: Some(patch.data.clone()),
            tags: patch.tags.clone(),
            ttl: patch.ttl,
            increment_version: patch.increment_version,
            ..Self::base(SyncOperationType::Update, collection, id)
        }
    }

    #[must_use]
    pub fn delete(collection: &str, id: &str) -> Self {
        Self::base(SyncOperationType::Delete, collection, id)
    }

    /// Whether this entry mutates `collection/id`.
    #[must_use]
    pub fn targets(&self, collection: &str, id: &str) -> bool {
        self.collection == collection && self.id == id
    }

    /// Whether `held` is exactly the record this create writes: the echo
    /// of an earlier attempt whose acknowledgement was lost.
    fn is_echo_of(&self, held: &Record) -> bool {
        let Some(metadata) = &self.metadata else {
            return false;
        };
        held.metadata.created_at == metadata.created_at
            && held.metadata.version == metadata.version
            && self.data.as_ref() == Some(&held.data)
    }

    /// Applies the mutation to `remote`.
    ///
    /// A create whose id the remote already holds counts as applied only
    /// when the remote copy is this create's own echo. Any other holder is
    /// a conflict and is returned as `AlreadyExists`.
    ///
    /// # Errors
    ///
    /// Any other remote error, which the drain treats as a rejection.
    pub async fn replay<R: StorageAdapter + ?Sized>(&self, remote: &R) -> StorageResult<()> {
        match self.op_type {
            SyncOperationType::Create => {
                let record = NewRecord {
                    id: Some(self.id.clone()),
                    collection: self.collection.clone(),
                    data: self.data.clone().unwrap_or_default(),
                    tags: self.tags.clone(),
                    ttl: self.ttl,
                    metadata: self.metadata.clone(),
                };
                match remote.create(record).await {
                    Ok(_) => Ok(()),
                    Err(conflict @ StorageError::AlreadyExists { .. }) => {
                        let held = remote.read(&self.collection, &self.id).await?;
                        if held.as_ref().is_some_and(|r| self.is_echo_of(r)) {
                            debug!(
                                target: "polystore::sync",
                                collection = %self.collection,
                                id = %self.id,
                                "remote already holds replayed create"
                            );
                            return Ok(());
                        }
                        warn!(
                            target: "polystore::sync",
                            collection = %self.collection,
                            id = %self.id,
                            "remote holds a different record under a queued create"
                        );
                        Err(conflict)
                    }
                    Err(e) => Err(e),
                }
            }
            SyncOperationType::Update => {
                let patch = RecordPatch {
                    data: self.data.clone().unwrap_or_default(),
                    tags: self.tags.clone(),
                    ttl: self.ttl,
                    increment_version: self.increment_version,
                };
                remote.update(&self.collection, &self.id, patch).await.map(|_| ())
            }
            SyncOperationType::Delete => remote.delete(&self.collection, &self.id).await.map(|_| ()),
        }
    }
}

#[derive(Debug, Default)]
struct QueueState {
    entries: VecDeque<SyncOperation>,
    next_seq: u64,
}

impl QueueState {
    fn from_entries(entries: Vec<SyncOperation>) -> Self {
        let next_seq = entries.iter().map(|e| e.seq + 1).max().unwrap_or(0);
        Self {
            entries: entries.into(),
            next_seq,
        }
    }
}

/// Ordered queue persisted to a [`KeyValueStore`].
///
/// Mutations hold the queue lock while persisting, so the stored array
/// always reflects a prefix-consistent order.
pub struct SyncQueue {
    store: Arc<dyn KeyValueStore>,
    key: String,
    state: Mutex<QueueState>,
}

impl std::fmt::Debug for SyncQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncQueue").field("key", &self.key).finish_non_exhaustive()
    }
}

/// Parses a persisted queue.
///
/// # Errors
///
/// `QueueCorruption` when `raw` is not an array of operations.
pub fn parse_queue(raw: &str) -> StorageResult<Vec<SyncOperation>> {
    serde_json::from_str(raw).map_err(|e| StorageError::QueueCorruption {
        reason: e.to_string(),
    })
}

impl SyncQueue {
    /// Loads the queue stored under `key`.
    ///
    /// A corrupt value is logged, overwritten with an empty queue, and
    /// returned alongside so the caller can surface it.
    ///
    /// # Errors
    ///
    /// Only when the store itself cannot be read.
    pub async fn load(
        store: Arc<dyn KeyValueStore>,
        key: impl Into<String>,
    ) -> StorageResult<(Self, Option<StorageError>)> {
        let key = key.into();
        let (entries, corruption) = match store.get(&key).await? {
            None => (Vec::new(), None),
            Some(raw) => match parse_queue(&raw) {
                Ok(entries) => (entries, None),
                Err(e) => {
                    warn!(target: "polystore::sync", key = %key, error = %e, "resetting corrupt sync queue");
                    if let Err(write) = store.set(&key, "[]".to_string()).await {
                        warn!(target: "polystore::sync", error = %write, "failed to reset sync queue");
                    }
                    (Vec::new(), Some(e))
                }
            },
        };
        debug!(target: "polystore::sync", key = %key, pending = entries.len(), "sync queue loaded");
        let queue = Self {
            store,
            key,
            state: Mutex::new(QueueState::from_entries(entries)),
        };
        Ok((queue, corruption))
    }

    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    async fn persist(&self, state: &QueueState) -> StorageResult<()> {
        let raw = serde_json::to_string(&state.entries)?;
        self.store.set(&self.key, raw).await
    }

    /// Appends `op`, assigning its sequence number.
    ///
    /// The entry is queued in memory even when persisting fails; the error
    /// is returned for the caller to log.
    pub async fn enqueue(&self, mut op: SyncOperation) -> (u64, StorageResult<()>) {
        let mut state = self.state.lock().await;
        op.seq = state.next_seq;
        state.next_seq += 1;
        let seq = op.seq;
        state.entries.push_back(op);
        let persisted = self.persist(&state).await;
        (seq, persisted)
    }

    /// The oldest entry, if any.
    pub async fn front(&self) -> Option<SyncOperation> {
        self.state.lock().await.entries.front().cloned()
    }

    /// Removes the oldest entry if it is `seq`. Returns whether it was.
    ///
    /// # Errors
    ///
    /// Persistence failures; the in-memory removal still stands.
    pub async fn acknowledge(&self, seq: u64) -> StorageResult<bool> {
        let mut state = self.state.lock().await;
        if state.entries.front().map(|e| e.seq) != Some(seq) {
            return Ok(false);
        }
        state.entries.pop_front();
        self.persist(&state).await?;
        Ok(true)
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.entries.is_empty()
    }

    /// Whether a mutation of `collection/id` is still waiting.
    pub async fn has_pending(&self, collection: &str, id: &str) -> bool {
        self.state
            .lock()
            .await
            .entries
            .iter()
            .any(|e| e.targets(collection, id))
    }

    /// Copy of every entry, oldest first.
    pub async fn snapshot(&self) -> Vec<SyncOperation> {
        self.state.lock().await.entries.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::data_from;
    use crate::storage::local::MemoryAdapter;
    use crate::sync::kv::MemoryKeyValueStore;
    use serde_json::json;

    fn store() -> Arc<dyn KeyValueStore> {
        Arc::new(MemoryKeyValueStore::new())
    }

    #[tokio::test]
    async fn test_fifo_and_persisted() {
        let kv = store();
        let (queue, corruption) = SyncQueue::load(Arc::clone(&kv), "q").await.unwrap();
        assert!(corruption.is_none());
        assert!(queue.is_empty().await);

        let (a, _) = queue.enqueue(SyncOperation::delete("notes", "a")).await;
        let (b, _) = queue.enqueue(SyncOperation::delete("notes", "b")).await;
        assert!(b > a);
        assert_eq!(queue.front().await.unwrap().id, "a");

        assert!(!queue.acknowledge(b).await.unwrap());
        assert!(queue.acknowledge(a).await.unwrap());

        let (reloaded, _) = SyncQueue::load(kv, "q").await.unwrap();
        let ids: Vec<_> = reloaded.snapshot().await.into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec!["b"]);
        let (c, _) = reloaded.enqueue(SyncOperation::delete("notes", "c")).await;
        assert!(c > b);
    }

    #[tokio::test]
    async fn test_corrupt_queue_resets_to_empty() {
        let kv = store();
        kv.set("q", "{not json".to_string()).await.unwrap();
        let (queue, corruption) = SyncQueue::load(Arc::clone(&kv), "q").await.unwrap();
        assert!(matches!(corruption, Some(StorageError::QueueCorruption { .. })));
        assert_eq!(queue.len().await, 0);
        assert_eq!(kv.get("q").await.unwrap().as_deref(), Some("[]"));
    }

    #[test]
    fn test_wire_shape() {
        let mut op = SyncOperation::update(
            "notes",
            "n1",
            &RecordPatch::data(data_from(json!({"text": "hi"}))),
        );
        op.seq = 4;
        let v = serde_json::to_value(&op).unwrap();
        assert_eq!(v["type"], json!("update"));
        assert_eq!(v["data"]["text"], json!("hi"));
        assert!(v.get("enqueuedAt").is_some());
        assert_eq!(parse_queue(&format!("[{v}]")).unwrap(), vec![op]);
    }

    #[tokio::test]
    async fn test_replayed_create_only_absorbs_its_own_echo() {
        let remote = MemoryAdapter::new();
        let now = Utc::now();
        let mine = NewRecord::new("notes", data_from(json!({"text": "mine"})))
            .with_id("n1")
            .into_record(now)
            .unwrap();
        let op = SyncOperation::create(&mine);

        remote.create(NewRecord::mirror(&mine)).await.unwrap();
        op.replay(&remote).await.unwrap();

        let mut theirs = mine.clone();
        theirs.id = "n2".to_string();
        theirs.data = data_from(json!({"text": "theirs"}));
        remote.create(NewRecord::mirror(&theirs)).await.unwrap();
        let mut clash = mine.clone();
        clash.id = "n2".to_string();
        let err = SyncOperation::create(&clash).replay(&remote).await.unwrap_err();
        assert!(matches!(err, StorageError::AlreadyExists { .. }));
        assert_eq!(remote.read("notes", "n2").await.unwrap().unwrap().data["text"], json!("theirs"));
    }

    #[tokio::test]
    async fn test_has_pending() {
        let (queue, _) = SyncQueue::load(store(), "q").await.unwrap();
        queue.enqueue(SyncOperation::delete("notes", "a")).await;
        assert!(queue.has_pending("notes", "a").await);
        assert!(!queue.has_pending("notes", "b").await);
        assert!(!queue.has_pending("other", "a").await);
    }
}
