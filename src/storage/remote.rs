//! Remote adapter: forwards every operation to a `polystore` server.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::config::RemoteOptions;
use crate::error::StorageResult;
use crate::query::{QueryOutcome, StorageQuery};
use crate::record::{validate_collection, NewRecord, Record, RecordPatch};
use crate::storage::traits::{
    BatchOperation, BatchOutcome, CleanupReport, CollectionSchema, CollectionStats, QueryExplanation,
    StorageAdapter, StoredVector, VectorPrimitives,
};
use crate::transport::{Call, RemoteClient};

/// Adapter backed by a [`RemoteClient`].
#[derive(Debug, Clone)]
pub struct RemoteAdapter {
    client: Arc<RemoteClient>,
}

impl RemoteAdapter {
    #[must_use]
    pub fn new(namespace: &str, options: RemoteOptions) -> Self {
        Self::with_client(Arc::new(RemoteClient::new(
            options.socket_path,
            namespace,
            Duration::from_millis(options.timeout_ms),
        )))
    }

    /// Wraps an existing client, e.g. one shared with a connectivity probe.
    #[must_use]
    pub fn with_client(client: Arc<RemoteClient>) -> Self {
        Self { client }
    }

    #[must_use]
    pub fn client(&self) -> &Arc<RemoteClient> {
        &self.client
    }
}

fn owned(collection: &str) -> StorageResult<String> {
    validate_collection(collection)?;
    Ok(collection.to_string())
}

#[async_trait]
impl StorageAdapter for RemoteAdapter {
    fn backend_name(&self) -> &'static str {
        "remote"
    }

    async fn initialize(&self) -> StorageResult<()> {
        self.client.connect().await
    }

    async fn create(&self, record: NewRecord) -> StorageResult<Record> {
        validate_collection(&record.collection)?;
        self.client.call(Call::Create { record }).await
    }

    async fn read(&self, collection: &str, id: &str) -> StorageResult<Option<Record>> {
        let collection = owned(collection)?;
        self.client
            .call(Call::Read {
                collection,
                id: id.to_string(),
            })
            .await
    }

    async fn query(&self, query: &StorageQuery) -> StorageResult<QueryOutcome> {
        query.compile()?;
        self.client.call(Call::Query { query: query.clone() }).await
    }

    async fn update(&self, collection: &str, id: &str, patch: RecordPatch) -> StorageResult<Record> {
        let collection = owned(collection)?;
        self.client
            .call(Call::Update {
                collection,
                id: id.to_string(),
                patch,
            })
            .await
    }

    async fn delete(&self, collection: &str, id: &str) -> StorageResult<bool> {
        let collection = owned(collection)?;
        self.client
            .call(Call::Delete {
                collection,
                id: id.to_string(),
            })
            .await
    }

    async fn list_collections(&self) -> StorageResult<Vec<String>> {
        self.client.call(Call::ListCollections {}).await
    }

    async fn collection_stats(&self, collection: &str) -> StorageResult<CollectionStats> {
        let collection = owned(collection)?;
        self.client.call(Call::CollectionStats { collection }).await
    }

    /// One round trip; the server applies the items with its own per-item
    /// semantics.
    async fn batch(&self, operations: Vec<BatchOperation>) -> StorageResult<BatchOutcome> {
        self.client.call(Call::Batch { operations }).await
    }

    async fn clear(&self, collection: &str) -> StorageResult<()> {
        let collection = owned(collection)?;
        self.client.call(Call::Clear { collection }).await
    }

    async fn clear_all(&self) -> StorageResult<()> {
        self.client.call(Call::ClearAll {}).await
    }

    async fn truncate(&self, collection: &str) -> StorageResult<()> {
        let collection = owned(collection)?;
        self.client.call(Call::Truncate { collection }).await
    }

    async fn ensure_schema(&self, collection: &str, schema: &CollectionSchema) -> StorageResult<()> {
        let collection = owned(collection)?;
        schema.validate()?;
        self.client
            .call(Call::EnsureSchema {
                collection,
                schema: schema.clone(),
            })
            .await
    }

    async fn cleanup(&self) -> StorageResult<CleanupReport> {
        self.client.call(Call::Cleanup {}).await
    }

    async fn close(&self) -> StorageResult<()> {
        debug!(target: "polystore::remote", namespace = self.client.namespace(), "closing remote adapter");
        self.client.close().await
    }

    async fn explain_query(&self, query: &StorageQuery) -> StorageResult<QueryExplanation> {
        query.compile()?;
        self.client.call(Call::ExplainQuery { query: query.clone() }).await
    }
}

#[async_trait]
impl VectorPrimitives for RemoteAdapter {
    async fn ensure_vector_storage(&self, collection: &str, dimensions: usize) -> StorageResult<()> {
        let collection = owned(collection)?;
        self.client
            .call(Call::EnsureVectorStorage { collection, dimensions })
            .await
    }

    async fn store_vector(&self, collection: &str, vector: StoredVector) -> StorageResult<()> {
        let collection = owned(collection)?;
        self.client.call(Call::StoreVector { collection, vector }).await
    }

    async fn get_all_vectors(&self, collection: &str) -> StorageResult<Vec<StoredVector>> {
        let collection = owned(collection)?;
        self.client.call(Call::GetAllVectors { collection }).await
    }

    async fn get_vector_count(&self, collection: &str) -> StorageResult<u64> {
        let collection = owned(collection)?;
        self.client.call(Call::GetVectorCount { collection }).await
    }
}
