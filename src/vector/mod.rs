//! Vector similarity search layered over any backend.
//!
//! [`VectorSearch`] owns the ranking, embedding orchestration, backfill and
//! stats logic once; backends only provide the four [`VectorPrimitives`].
//! Candidates are scored in process with the reference metrics in
//! [`similarity`].
//!
//! [`VectorPrimitives`]: crate::storage::VectorPrimitives

pub mod similarity;

pub use similarity::SimilarityMetric;

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::embedding::EmbeddingGenerator;
use crate::error::{StorageResult, ValidationError};
use crate::query::{resolve_field, StorageQuery, UniversalFilter};
use crate::record::{validate_collection, RecordData};
use crate::storage::{StorageBackend, StoredVector};

/// What to search for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum VectorQuery {
    Vector(Vec<f32>),
    /// Embedded with the configured generator first.
    Text(String),
}

const fn default_k() -> usize {
    10
}

/// Parameters of [`VectorSearch::vector_search`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VectorSearchOptions {
    pub collection: String,
    pub query: VectorQuery,
    #[serde(default = "default_k")]
    pub k: usize,
    /// Minimum score kept (inclusive).
    #[serde(default)]
    pub threshold: f32,
    #[serde(default)]
    pub metric: SimilarityMetric,
    /// Restricts candidates to records matching this filter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<UniversalFilter>,
}

impl VectorSearchOptions {
    #[must_use]
    pub fn vector(collection: impl Into<String>, vector: Vec<f32>) -> Self {
        Self {
            collection: collection.into(),
            query: VectorQuery::Vector(vector),
            k: default_k(),
            threshold: 0.0,
            metric: SimilarityMetric::default(),
            filter: None,
        }
    }

    #[must_use]
    pub fn text(collection: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            query: VectorQuery::Text(text.into()),
            ..Self::vector(collection, Vec::new())
        }
    }

    #[must_use]
    pub const fn k(mut self, k: usize) -> Self {
        self.k = k;
        self
    }

    #[must_use]
    pub const fn threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold;
        self
    }

    #[must_use]
    pub const fn metric(mut self, metric: SimilarityMetric) -> Self {
        self.metric = metric;
        self
    }

    #[must_use]
    pub fn filter(mut self, filter: UniversalFilter) -> Self {
        self.filter = Some(filter);
        self
    }
}

/// One search hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VectorMatch {
    pub record_id: String,
    pub score: f32,
    /// The record's data at search time.
    pub data: RecordData,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

const fn default_batch_size() -> usize {
    32
}

/// Parameters of [`VectorSearch::backfill_vectors`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackfillRequest {
    pub collection: String,
    /// Field path holding the text to embed.
    pub text_field: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Model name stored with the vectors; the generator's when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl BackfillRequest {
    #[must_use]
    pub fn new(collection: impl Into<String>, text_field: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            text_field: text_field.into(),
            batch_size: default_batch_size(),
            model: None,
        }
    }

    #[must_use]
    pub const fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }
}

/// Backfill counters, reported after every batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackfillProgress {
    /// Records that had no vector when the backfill started.
    pub total: usize,
    /// Records handled so far, failures included.
    pub processed: usize,
    pub failed: usize,
    /// Milliseconds since the backfill started.
    pub elapsed_time: u64,
    /// Projected milliseconds to finish at the observed rate.
    pub estimated_remaining: u64,
}

/// Vector coverage of a collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VectorStats {
    pub collection: String,
    pub records: u64,
    pub vectors: u64,
    /// `vectors / records`, `0` for an empty collection.
    pub coverage: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dimensions: Option<usize>,
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Similarity search over the vectors of one backend.
pub struct VectorSearch<B: StorageBackend + ?Sized> {
    backend: Arc<B>,
    embedder: Option<Arc<dyn EmbeddingGenerator>>,
}

impl<B: StorageBackend + ?Sized> Clone for VectorSearch<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            embedder: self.embedder.clone(),
        }
    }
}

impl<B: StorageBackend + ?Sized> VectorSearch<B> {
    #[must_use]
    pub fn new(backend: Arc<B>) -> Self {
        Self {
            backend,
            embedder: None,
        }
    }

    #[must_use]
    pub fn with_embedder(mut self, embedder: Arc<dyn EmbeddingGenerator>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    #[must_use]
    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    fn embedder(&self) -> StorageResult<&Arc<dyn EmbeddingGenerator>> {
        self.embedder.as_ref().ok_or_else(|| {
            ValidationError::InvalidQuery {
                reason: "no embedding generator configured".to_string(),
            }
            .into()
        })
    }

    /// Returns the top `k` records scoring at least `threshold`, best first.
    /// Equal scores are ordered by record id.
    ///
    /// # Errors
    ///
    /// `DimensionMismatch` if stored vectors differ in length from the query,
    /// `InvalidQuery` for an empty query or a text query without a generator.
    pub async fn vector_search(&self, options: &VectorSearchOptions) -> StorageResult<Vec<VectorMatch>> {
        validate_collection(&options.collection)?;
        let started = Instant::now();
        let query = match &options.query {
            VectorQuery::Vector(v) => v.clone(),
            VectorQuery::Text(text) => self.embedder()?.embed(text).await?,
        };
        if query.is_empty() {
            return Err(ValidationError::InvalidQuery {
                reason: "query vector is empty".to_string(),
            }
            .into());
        }

        let allowed: Option<HashMap<String, RecordData>> = match &options.filter {
            Some(filter) => {
                let outcome = self
                    .backend
                    .query(&StorageQuery::new(&options.collection).filter(filter.clone()))
                    .await?;
                Some(outcome.records.into_iter().map(|r| (r.id, r.data)).collect())
            }
            None => None,
        };

        let candidates = self.backend.get_all_vectors(&options.collection).await?;
        let mut scored = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            if candidate.embedding.len() != query.len() {
                return Err(ValidationError::DimensionMismatch {
                    expected: candidate.embedding.len(),
                    actual: query.len(),
                }
                .into());
            }
            if allowed.as_ref().is_some_and(|a| !a.contains_key(&candidate.record_id)) {
                continue;
            }
            let score = options.metric.score(&query, &candidate.embedding);
            if score >= options.threshold {
                scored.push((score, candidate));
            }
        }
        scored.sort_by(|(sa, a), (sb, b)| {
            sb.partial_cmp(sa)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.record_id.cmp(&b.record_id))
        });

        let mut matches = Vec::with_capacity(options.k.min(scored.len()));
        for (score, candidate) in scored {
            if matches.len() >= options.k {
                break;
            }
            let data = match &allowed {
                Some(allowed) => allowed.get(&candidate.record_id).cloned(),
                None => self
                    .backend
                    .read(&options.collection, &candidate.record_id)
                    .await?
                    .map(|r| r.data),
            };
            // Vectors of expired or concurrently deleted records are skipped.
            let Some(data) = data else { continue };
            matches.push(VectorMatch {
                record_id: candidate.record_id,
                score,
                data,
                model: candidate.model,
            });
        }
        debug!(
            target: "polystore::vector",
            collection = %options.collection,
            results = matches.len(),
            elapsed_ms = millis(started.elapsed()),
            "vector search"
        );
        Ok(matches)
    }

    /// Stores a precomputed embedding for a record.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown record, `DimensionMismatch` against the
    /// collection's established dimensions.
    pub async fn store_embedding(
        &self,
        collection: &str,
        record_id: &str,
        embedding: Vec<f32>,
        model: Option<String>,
    ) -> StorageResult<()> {
        if embedding.is_empty() {
            return Err(ValidationError::InvalidQuery {
                reason: "embedding is empty".to_string(),
            }
            .into());
        }
        let mut vector = StoredVector::new(record_id, embedding);
        vector.model = model;
        self.backend.store_vector(collection, vector).await
    }

    /// Embeds `text` with the configured generator and stores it for the
    /// record.
    ///
    /// # Errors
    ///
    /// As [`VectorSearch::store_embedding`], plus generator failures.
    pub async fn index_record(&self, collection: &str, record_id: &str, text: &str) -> StorageResult<()> {
        let embedder = self.embedder()?;
        let embedding = embedder.embed(text).await?;
        self.store_embedding(collection, record_id, embedding, Some(embedder.model().to_string()))
            .await
    }

    async fn backfill_one(
        &self,
        embedder: &dyn EmbeddingGenerator,
        request: &BackfillRequest,
        model: &str,
        record_id: String,
        text: Option<Value>,
    ) -> StorageResult<()> {
        let Some(Value::String(text)) = text else {
            return Err(ValidationError::InvalidOperand {
                field: request.text_field.clone(),
                operator: "backfill".to_string(),
                reason: format!("record '{record_id}' has no text in this field"),
            }
            .into());
        };
        let embedding = embedder.embed(&text).await?;
        self.store_embedding(&request.collection, &record_id, embedding, Some(model.to_string()))
            .await
    }

    /// Embeds and stores vectors for every record that has none.
    ///
    /// Batches run one after another; the records of a batch are embedded
    /// concurrently. A record without text in `text_field`, or whose
    /// embedding fails, is counted in `failed` and skipped. `on_progress`
    /// sees the counters after each batch.
    ///
    /// # Errors
    ///
    /// Only for failures outside individual records: no generator, a zero
    /// batch size, or a backend error while listing records.
    pub async fn backfill_vectors(
        &self,
        request: &BackfillRequest,
        mut on_progress: impl FnMut(&BackfillProgress) + Send,
    ) -> StorageResult<BackfillProgress> {
        validate_collection(&request.collection)?;
        if request.batch_size == 0 {
            return Err(ValidationError::InvalidConfig {
                reason: "batchSize must be positive".to_string(),
            }
            .into());
        }
        let embedder = Arc::clone(self.embedder()?);
        let model = request
            .model
            .clone()
            .unwrap_or_else(|| embedder.model().to_string());
        let started = Instant::now();

        let indexed: HashSet<String> = self
            .backend
            .get_all_vectors(&request.collection)
            .await?
            .into_iter()
            .map(|v| v.record_id)
            .collect();
        let pending: Vec<(String, Option<Value>)> = self
            .backend
            .query(&StorageQuery::new(&request.collection))
            .await?
            .records
            .iter()
            .filter(|r| !indexed.contains(&r.id))
            .map(|r| (r.id.clone(), resolve_field(r, &request.text_field)))
            .collect();

        let mut progress = BackfillProgress {
            total: pending.len(),
            ..BackfillProgress::default()
        };
        info!(
            target: "polystore::vector",
            collection = %request.collection,
            total = progress.total,
            "backfill started"
        );

        for batch in pending.chunks(request.batch_size) {
            let results = join_all(batch.iter().cloned().map(|(record_id, text)| {
                self.backfill_one(embedder.as_ref(), request, &model, record_id, text)
            }))
            .await;
            for result in results {
                progress.processed += 1;
                if let Err(e) = result {
                    progress.failed += 1;
                    debug!(target: "polystore::vector", error = %e, "backfill item failed");
                }
            }
            let elapsed = started.elapsed();
            progress.elapsed_time = millis(elapsed);
            let remaining = progress.total - progress.processed;
            progress.estimated_remaining = if progress.processed == 0 {
                0
            } else {
                millis(elapsed.mul_f64(remaining as f64 / progress.processed as f64))
            };
            on_progress(&progress);
        }

        info!(
            target: "polystore::vector",
            collection = %request.collection,
            processed = progress.processed,
            failed = progress.failed,
            elapsed_ms = progress.elapsed_time,
            "backfill finished"
        );
        Ok(progress)
    }

    /// Counts records and vectors of a collection.
    ///
    /// # Errors
    ///
    /// Backend errors only.
    pub async fn vector_stats(&self, collection: &str) -> StorageResult<VectorStats> {
        let records = self.backend.collection_stats(collection).await?.record_count;
        let vectors = self.backend.get_vector_count(collection).await?;
        let dimensions = if vectors == 0 {
            None
        } else {
            self.backend
                .get_all_vectors(collection)
                .await?
                .first()
                .map(|v| v.embedding.len())
        };
        #[allow(clippy::cast_precision_loss)]
        let coverage = if records == 0 {
            0.0
        } else {
            vectors as f64 / records as f64
        };
        Ok(VectorStats {
            collection: collection.to_string(),
            records,
            vectors,
            coverage,
            dimensions,
        })
    }
}
