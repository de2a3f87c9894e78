//! Applying remote change notifications to the local cache.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::offline::{OfflineAdapter, SyncEvent};
use crate::error::StorageResult;
use crate::record::{NewRecord, Record};
use crate::storage::StorageAdapter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
}

/// A change the remote side observed, as published on its feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeNotification {
    pub kind: ChangeKind,
    pub collection: String,
    pub id: String,
    /// Current remote state for created/updated changes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record: Option<Record>,
}

impl ChangeNotification {
    #[must_use]
    pub fn created(record: Record) -> Self {
        Self::with_record(ChangeKind::Created, record)
    }

    #[must_use]
    pub fn updated(record: Record) -> Self {
        Self::with_record(ChangeKind::Updated, record)
    }

    #[must_use]
    pub fn deleted(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind: ChangeKind::Deleted,
            collection: collection.into(),
            id: id.into(),
            record: None,
        }
    }

    fn with_record(kind: ChangeKind, record: Record) -> Self {
        Self {
            kind,
            collection: record.collection.clone(),
            id: record.id.clone(),
            record: Some(record),
        }
    }
}

/// What a notification did to the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheAction {
    Updated,
    Evicted,
    /// The collection is not declared cacheable.
    Ignored,
    /// A local mutation of the record is still queued; the local state wins
    /// until it reaches the remote.
    Deferred,
}

impl<L, R> OfflineAdapter<L, R>
where
    L: StorageAdapter + ?Sized + 'static,
    R: StorageAdapter + ?Sized + 'static,
{
    /// Updates or evicts the cached copy of the notified record.
    ///
    /// Cache writes go straight to the local adapter and are never queued.
    /// An update swaps the cached copy with `replace`, so a concurrent
    /// reader sees either the old or the new record.
    ///
    /// # Errors
    ///
    /// Local adapter failures.
    pub async fn apply_notification(&self, change: &ChangeNotification) -> StorageResult<CacheAction> {
        let core = &self.core;
        if !core.config.is_cacheable(&change.collection) {
            return Ok(CacheAction::Ignored);
        }
        let _order = core.write_order.lock().await;
        if core.queue.has_pending(&change.collection, &change.id).await {
            debug!(
                target: "polystore::sync",
                collection = %change.collection,
                id = %change.id,
                "change deferred behind queued local mutation"
            );
            return Ok(CacheAction::Deferred);
        }

        match (change.kind, &change.record) {
            (ChangeKind::Created | ChangeKind::Updated, Some(record)) => {
                core.local.replace(NewRecord::mirror(record)).await?;
                core.emit(SyncEvent::CacheUpdated {
                    collection: change.collection.clone(),
                    id: change.id.clone(),
                });
                Ok(CacheAction::Updated)
            }
            _ => {
                core.local.delete(&change.collection, &change.id).await?;
                core.emit(SyncEvent::CacheEvicted {
                    collection: change.collection.clone(),
                    id: change.id.clone(),
                });
                Ok(CacheAction::Evicted)
            }
        }
    }

    /// Applies every notification from `feed` in the background until the
    /// feed closes or the adapter shuts down.
    pub fn listen(&self, mut feed: broadcast::Receiver<ChangeNotification>) {
        let weak = Arc::downgrade(&self.core);
        self.core.track(tokio::spawn(async move {
            loop {
                let change = match feed.recv().await {
                    Ok(change) => change,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(target: "polystore::sync", missed, "change feed lagged; cache may be stale");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let Some(core) = weak.upgrade() else { break };
                let adapter = OfflineAdapter { core };
                if let Err(e) = adapter.apply_notification(&change).await {
                    warn!(
                        target: "polystore::sync",
                        collection = %change.collection,
                        id = %change.id,
                        error = %e,
                        "change notification not applied"
                    );
                }
            }
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::record::{data_from, RecordPatch};
    use crate::storage::local::MemoryAdapter;
    use crate::sync::Connectivity;
    use serde_json::json;

    async fn adapter() -> OfflineAdapter<MemoryAdapter, MemoryAdapter> {
        OfflineAdapter::builder(Arc::new(MemoryAdapter::new()), Arc::new(MemoryAdapter::new()))
            .connectivity(Connectivity::offline())
            .config(SyncConfig {
                cacheable_collections: vec!["notes".to_string()],
                ..SyncConfig::default()
            })
            .build()
            .await
            .unwrap()
    }

    async fn remote_note(adapter: &OfflineAdapter<MemoryAdapter, MemoryAdapter>, id: &str, text: &str) -> Record {
        adapter
            .remote()
            .create(NewRecord::new("notes", data_from(json!({"text": text}))).with_id(id))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_created_then_updated_then_deleted() {
        let adapter = adapter().await;
        let record = remote_note(&adapter, "n1", "v1").await;
        let action = adapter.apply_notification(&ChangeNotification::created(record)).await.unwrap();
        assert_eq!(action, CacheAction::Updated);
        assert_eq!(adapter.read("notes", "n1").await.unwrap().unwrap().data["text"], json!("v1"));

        let updated = adapter
            .remote()
            .update("notes", "n1", RecordPatch::data(data_from(json!({"text": "v2"}))))
            .await
            .unwrap();
        adapter.apply_notification(&ChangeNotification::updated(updated)).await.unwrap();
        let cached = adapter.local().read("notes", "n1").await.unwrap().unwrap();
        assert_eq!(cached.data["text"], json!("v2"));
        assert_eq!(cached.metadata.version, 2);

        let action = adapter
            .apply_notification(&ChangeNotification::deleted("notes", "n1"))
            .await
            .unwrap();
        assert_eq!(action, CacheAction::Evicted);
        assert!(adapter.local().read("notes", "n1").await.unwrap().is_none());
        assert_eq!(adapter.pending().await, 0);
    }

    /// Cache whose creates always fail, to show an update never degrades
    /// into an eviction.
    struct NoCreates(MemoryAdapter);

    #[async_trait::async_trait]
    impl StorageAdapter for NoCreates {
        fn backend_name(&self) -> &'static str {
            "no-creates"
        }
        async fn initialize(&self) -> StorageResult<()> {
            Ok(())
        }
        async fn create(&self, _record: NewRecord) -> StorageResult<Record> {
            Err(crate::error::StorageError::Backend("create refused".to_string()))
        }
        async fn read(&self, collection: &str, id: &str) -> StorageResult<Option<Record>> {
            self.0.read(collection, id).await
        }
        async fn query(&self, query: &crate::query::StorageQuery) -> StorageResult<crate::query::QueryOutcome> {
            self.0.query(query).await
        }
        async fn update(&self, collection: &str, id: &str, patch: RecordPatch) -> StorageResult<Record> {
            self.0.update(collection, id, patch).await
        }
        async fn delete(&self, collection: &str, id: &str) -> StorageResult<bool> {
            self.0.delete(collection, id).await
        }
        async fn replace(&self, record: NewRecord) -> StorageResult<Record> {
            self.0.replace(record).await
        }
        async fn list_collections(&self) -> StorageResult<Vec<String>> {
            self.0.list_collections().await
        }
        async fn collection_stats(&self, collection: &str) -> StorageResult<crate::storage::CollectionStats> {
            self.0.collection_stats(collection).await
        }
        async fn clear(&self, collection: &str) -> StorageResult<()> {
            self.0.clear(collection).await
        }
        async fn truncate(&self, collection: &str) -> StorageResult<()> {
            self.0.truncate(collection).await
        }
        async fn ensure_schema(&self, collection: &str, schema: &crate::storage::CollectionSchema) -> StorageResult<()> {
            self.0.ensure_schema(collection, schema).await
        }
        async fn cleanup(&self) -> StorageResult<crate::storage::CleanupReport> {
            self.0.cleanup().await
        }
        async fn close(&self) -> StorageResult<()> {
            self.0.close().await
        }
        async fn explain_query(
            &self,
            query: &crate::query::StorageQuery,
        ) -> StorageResult<crate::storage::QueryExplanation> {
            self.0.explain_query(query).await
        }
    }

    #[tokio::test]
    async fn test_update_swaps_cached_copy_in_place() {
        let cache = MemoryAdapter::new();
        let remote = MemoryAdapter::new();
        let v1 = remote
            .create(NewRecord::new("notes", data_from(json!({"text": "v1"}))).with_id("n1"))
            .await
            .unwrap();
        cache.create(NewRecord::mirror(&v1)).await.unwrap();
        let adapter = OfflineAdapter::builder(Arc::new(NoCreates(cache)), Arc::new(remote))
            .connectivity(Connectivity::offline())
            .config(SyncConfig {
                cacheable_collections: vec!["notes".to_string()],
                ..SyncConfig::default()
            })
            .build()
            .await
            .unwrap();

        let v2 = adapter
            .remote()
            .update("notes", "n1", RecordPatch::data(data_from(json!({"text": "v2"}))))
            .await
            .unwrap();
        let action = adapter.apply_notification(&ChangeNotification::updated(v2)).await.unwrap();
        assert_eq!(action, CacheAction::Updated);
        let cached = adapter.local().read("notes", "n1").await.unwrap().unwrap();
        assert_eq!(cached.data["text"], json!("v2"));
        assert_eq!(cached.metadata.version, 2);
    }

    #[tokio::test]
    async fn test_undeclared_collection_is_ignored() {
        let adapter = adapter().await;
        let action = adapter
            .apply_notification(&ChangeNotification::deleted("users", "u1"))
            .await
            .unwrap();
        assert_eq!(action, CacheAction::Ignored);
    }

    #[tokio::test]
    async fn test_queued_local_mutation_wins() {
        let adapter = adapter().await;
        adapter
            .create(NewRecord::new("notes", data_from(json!({"text": "local"}))).with_id("n1"))
            .await
            .unwrap();
        let remote = remote_note(&adapter, "n1", "remote").await;
        let action = adapter.apply_notification(&ChangeNotification::updated(remote)).await.unwrap();
        assert_eq!(action, CacheAction::Deferred);
        assert_eq!(adapter.read("notes", "n1").await.unwrap().unwrap().data["text"], json!("local"));
    }

    #[tokio::test]
    async fn test_listen_applies_feed() {
        let adapter = adapter().await;
        let (tx, rx) = broadcast::channel(8);
        let mut events = adapter.subscribe();
        adapter.listen(rx);
        let record = remote_note(&adapter, "n9", "pushed").await;
        tx.send(ChangeNotification::created(record)).unwrap();
        let event = events.recv().await.unwrap();
        assert_eq!(
            event,
            SyncEvent::CacheUpdated {
                collection: "notes".to_string(),
                id: "n9".to_string()
            }
        );
        assert!(adapter.local().read("notes", "n9").await.unwrap().is_some());
    }
}
