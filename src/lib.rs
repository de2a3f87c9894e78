//! # polystore - one query language, many storage backends
//!
//! polystore stores structured records in named collections and answers the
//! same queries with the same results whichever backend holds them: an
//! in-process store (memory or snapshot files), SQLite, or a remote engine
//! reached over a Unix socket. Two layers compose on top of any backend:
//! vector similarity search, and an offline-first adapter that writes locally
//! and replays mutations to a remote authority in order.
//!
//! ## Core Concepts
//!
//! - **Record**: an open JSON object plus metadata (timestamps, version, tags, TTL)
//! - **UniversalFilter**: a Mongo-style filter evaluated identically by every backend
//! - **StorageAdapter**: the backend contract; [`storage::open_backend`] picks one from config
//! - **VectorSearch**: top-k similarity over stored embeddings
//! - **OfflineAdapter**: local-first writes with a durable, ordered sync queue
//!
//! ## Usage
//!
//! ```rust,ignore
//! use polystore::{data_from, open_backend, NewRecord, SortField, StorageConfig, StorageQuery};
//! use serde_json::json;
//!
//! let store = open_backend(&StorageConfig::memory("app")).await?;
//! store
//!     .create(NewRecord::new("users", data_from(json!({"name": "Ada", "age": 36}))).with_id("u1"))
//!     .await?;
//!
//! let adults = store
//!     .query(
//!         &StorageQuery::new("users")
//!             .filter(json!({"age": {"$gte": 18}}))
//!             .sort_by(SortField::asc("name")),
//!     )
//!     .await?;
//! ```

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod embedding;
pub mod error;
pub mod query;
pub mod record;
pub mod result;
pub mod storage;
pub mod sync;
pub mod time;
pub mod transport;
pub mod value;
pub mod vector;

pub use config::{BackendType, FileOptions, RemoteOptions, SqliteOptions, StorageConfig, SyncConfig};
pub use embedding::{EmbeddingGenerator, LexicalEmbedding};
pub use error::{ErrorKind, StorageError, StorageResult, ValidationError};
pub use query::{Cursor, QueryOutcome, SortDirection, SortField, StorageQuery, UniversalFilter};
pub use record::{data_from, NewRecord, Record, RecordData, RecordMetadata, RecordPatch};
pub use result::StorageResponse;
pub use storage::{
    open_backend, BatchOperation, BatchOutcome, CollectionSchema, CollectionStats, IndexDefinition,
    StorageAdapter, StorageBackend, StoredVector, VectorPrimitives,
};
pub use sync::{Connectivity, OfflineAdapter, SyncEvent, SyncOperation, SyncStatus};
pub use time::TimeRange;
pub use vector::{SimilarityMetric, VectorMatch, VectorSearch, VectorSearchOptions};
