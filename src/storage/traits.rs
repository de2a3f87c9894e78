//! The storage adapter contract.
//!
//! Every backend implements [`StorageAdapter`] for record CRUD, querying and
//! schema lifecycle, and [`VectorPrimitives`] for the four vector operations
//! the similarity extension builds on. [`StorageBackend`] is the union of the
//! two and is what the factory hands out.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{StorageError, StorageResult, ValidationError};
use crate::query::{QueryOutcome, StorageQuery};
use crate::record::{NewRecord, Record, RecordPatch};
use crate::result::StorageResponse;

/// Registry entry for one collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionStats {
    pub name: String,
    pub record_count: u64,
    /// Sum of serialized `data` sizes in bytes.
    pub total_size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl CollectionStats {
    #[must_use]
    pub fn empty(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            record_count: 0,
            total_size: 0,
            created_at: None,
            updated_at: None,
        }
    }
}

/// A declared (possibly composite) index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub fields: Vec<String>,
    #[serde(default)]
    pub unique: bool,
}

impl IndexDefinition {
    #[must_use]
    pub fn on(fields: &[&str]) -> Self {
        Self {
            name: None,
            fields: fields.iter().map(|f| (*f).to_string()).collect(),
            unique: false,
        }
    }

    #[must_use]
    pub fn unique(fields: &[&str]) -> Self {
        Self {
            unique: true,
            ..Self::on(fields)
        }
    }

    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// The declared name, or one derived from the field list.
    #[must_use]
    pub fn resolved_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| {
            let prefix = if self.unique { "uniq" } else { "idx" };
            format!("{prefix}_{}", self.fields.join("_").replace('.', "_"))
        })
    }
}

/// Field-list schema passed to `ensure_schema`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionSchema {
    #[serde(default)]
    pub indexes: Vec<IndexDefinition>,
}

impl CollectionSchema {
    #[must_use]
    pub fn with_index(mut self, index: IndexDefinition) -> Self {
        self.indexes.push(index);
        self
    }

    /// Checks every index has at least one valid field path.
    ///
    /// # Errors
    ///
    /// Returns a `ValidationError` naming the offending index or path.
    pub fn validate(&self) -> Result<(), ValidationError> {
        for index in &self.indexes {
            if index.fields.is_empty() {
                return Err(ValidationError::InvalidQuery {
                    reason: format!("index '{}' has no fields", index.resolved_name()),
                });
            }
            for field in &index.fields {
                crate::query::filter::validate_path(field)?;
            }
        }
        Ok(())
    }
}

/// One item of a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum BatchOperation {
    Create {
        record: NewRecord,
    },
    Update {
        collection: String,
        id: String,
        patch: RecordPatch,
    },
    Delete {
        collection: String,
        id: String,
    },
}

/// Value produced by one successful batch item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BatchItem {
    Record(Record),
    Deleted(bool),
}

/// Per-item results of a non-atomic batch, in input order.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchOutcome {
    pub results: Vec<StorageResponse<BatchItem>>,
    pub succeeded: usize,
    pub failed: usize,
}

impl BatchOutcome {
    pub fn push(&mut self, result: StorageResult<BatchItem>) {
        if result.is_ok() {
            self.succeeded += 1;
        } else {
            self.failed += 1;
        }
        self.results.push(StorageResponse::from_result(result));
    }

    /// Turns any per-item failure into an aggregate error.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::PartialBatchFailure` when an item failed.
    pub fn ensure_complete(self) -> StorageResult<Self> {
        if self.failed > 0 {
            return Err(StorageError::PartialBatchFailure {
                total: self.results.len(),
                failed: self.failed,
            });
        }
        Ok(self)
    }
}

/// Result of a TTL sweep.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupReport {
    /// Expired records removed.
    pub removed: u64,
    /// Collections that lost at least one record.
    pub collections: Vec<String>,
}

/// Diagnostic dry run of a query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryExplanation {
    pub backend: String,
    /// Translated predicate in the backend's native language.
    pub predicate: String,
    pub params: Vec<Value>,
    pub estimated_rows: u64,
    /// Backend plan steps, when the backend has a planner.
    #[serde(default)]
    pub plan: Vec<String>,
}

/// An embedding attached to a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredVector {
    pub record_id: String,
    pub embedding: Vec<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub generated_at: DateTime<Utc>,
}

impl StoredVector {
    #[must_use]
    pub fn new(record_id: impl Into<String>, embedding: Vec<f32>) -> Self {
        Self {
            record_id: record_id.into(),
            embedding,
            model: None,
            generated_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

/// Record storage capability set.
///
/// # Contract
/// - `read` of a missing id is `Ok(None)`.
/// - `update` of a missing id is `NotFound`.
/// - `delete` of a missing id is `Ok(false)`.
/// - `batch` runs every item; failures are counted, not fatal.
/// - Expired (TTL) records are invisible to `read` and `query`.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Short backend identifier used in logs and explanations.
    fn backend_name(&self) -> &'static str;

    /// Prepares the backend (creates files, tables, connections). Idempotent.
    async fn initialize(&self) -> StorageResult<()>;

    /// Inserts a record. Fails with `AlreadyExists` if the id is taken.
    async fn create(&self, record: NewRecord) -> StorageResult<Record>;

    async fn read(&self, collection: &str, id: &str) -> StorageResult<Option<Record>>;

    async fn query(&self, query: &StorageQuery) -> StorageResult<QueryOutcome>;

    /// Merges `patch` into an existing record.
    async fn update(&self, collection: &str, id: &str, patch: RecordPatch) -> StorageResult<Record>;

    /// Removes a record and its vector. Returns whether it existed.
    async fn delete(&self, collection: &str, id: &str) -> StorageResult<bool>;

    /// Stores `record` under its id as given, metadata included, dropping
    /// any existing copy and its vector. Transactional backends do this in
    /// one step; this default is a delete followed by a create.
    async fn replace(&self, record: NewRecord) -> StorageResult<Record> {
        let Some(id) = record.id.clone() else {
            return Err(ValidationError::EmptyRecordId.into());
        };
        self.delete(&record.collection, &id).await?;
        self.create(record).await
    }

    async fn list_collections(&self) -> StorageResult<Vec<String>>;

    async fn collection_stats(&self, collection: &str) -> StorageResult<CollectionStats>;

    /// Applies each operation in order, independently.
    async fn batch(&self, operations: Vec<BatchOperation>) -> StorageResult<BatchOutcome> {
        let mut outcome = BatchOutcome::default();
        for operation in operations {
            let result = match operation {
                BatchOperation::Create { record } => self.create(record).await.map(BatchItem::Record),
                BatchOperation::Update {
                    collection,
                    id,
                    patch,
                } => self
                    .update(&collection, &id, patch)
                    .await
                    .map(BatchItem::Record),
                BatchOperation::Delete { collection, id } => {
                    self.delete(&collection, &id).await.map(BatchItem::Deleted)
                }
            };
            outcome.push(result);
        }
        Ok(outcome)
    }

    /// Removes every record and vector of a collection, keeping its schema.
    async fn clear(&self, collection: &str) -> StorageResult<()>;

    /// `clear` for every collection. Transactional backends clear them all
    /// in one transaction.
    async fn clear_all(&self) -> StorageResult<()> {
        for collection in self.list_collections().await? {
            self.clear(&collection).await?;
        }
        Ok(())
    }

    /// Drops a collection entirely: records, vectors, indexes, registration.
    async fn truncate(&self, collection: &str) -> StorageResult<()>;

    /// Registers the collection and declares its indexes. Idempotent.
    async fn ensure_schema(&self, collection: &str, schema: &CollectionSchema) -> StorageResult<()>;

    /// Purges expired records.
    async fn cleanup(&self) -> StorageResult<CleanupReport>;

    /// Releases resources. Later calls fail with `BackendUnavailable`.
    async fn close(&self) -> StorageResult<()>;

    /// Reports how `query` would run, without running it.
    async fn explain_query(&self, query: &StorageQuery) -> StorageResult<QueryExplanation>;
}

/// Backend-specific vector storage.
#[async_trait]
pub trait VectorPrimitives: Send + Sync {
    /// Prepares vector storage for `collection` with a fixed dimension.
    /// Re-declaring the same dimension is a no-op; a different one is a
    /// `DimensionMismatch`.
    async fn ensure_vector_storage(&self, collection: &str, dimensions: usize) -> StorageResult<()>;

    /// Stores or replaces the vector of one record.
    async fn store_vector(&self, collection: &str, vector: StoredVector) -> StorageResult<()>;

    async fn get_all_vectors(&self, collection: &str) -> StorageResult<Vec<StoredVector>>;

    async fn get_vector_count(&self, collection: &str) -> StorageResult<u64>;
}

/// A complete backend.
pub trait StorageBackend: StorageAdapter + VectorPrimitives {}

impl<T: StorageAdapter + VectorPrimitives + ?Sized> StorageBackend for T {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn _assert_backend_object_safe(_: &dyn StorageBackend) {}

    #[test]
    fn test_index_name_derivation() {
        assert_eq!(IndexDefinition::on(&["a", "b.c"]).resolved_name(), "idx_a_b_c");
        assert_eq!(IndexDefinition::unique(&["email"]).resolved_name(), "uniq_email");
        assert_eq!(IndexDefinition::on(&["a"]).named("by_a").resolved_name(), "by_a");
    }

    #[test]
    fn test_schema_validation() {
        let schema = CollectionSchema::default().with_index(IndexDefinition::on(&[]));
        assert!(schema.validate().is_err());
        let schema = CollectionSchema::default().with_index(IndexDefinition::on(&["a..b"]));
        assert!(schema.validate().is_err());
    }

    #[test]
    fn test_batch_outcome_counts() {
        let mut outcome = BatchOutcome::default();
        outcome.push(Ok(BatchItem::Deleted(true)));
        outcome.push(Err(StorageError::not_found("users", "x")));
        assert_eq!(outcome.succeeded, 1);
        assert_eq!(outcome.failed, 1);
        assert!(matches!(
            outcome.ensure_complete(),
            Err(StorageError::PartialBatchFailure { total: 2, failed: 1 })
        ));
    }

    #[test]
    fn test_batch_operation_wire_shape() {
        let op: BatchOperation = serde_json::from_value(json!({
            "type": "delete", "collection": "users", "id": "u1"
        }))
        .unwrap();
        assert_eq!(
            op,
            BatchOperation::Delete {
                collection: "users".to_string(),
                id: "u1".to_string()
            }
        );
    }
}
