//! Relational adapter on SQLite.
//!
//! One connection behind a mutex, driven from `spawn_blocking`, so exactly
//! one transaction runs at a time. Every mutation (record rows, vector rows,
//! registry counters) happens inside a single transaction and is rolled back
//! as a whole on any failure.
//!
//! Queries are translated to SQL by [`translate`]; the predicates and sort
//! keys are SQL functions registered by [`functions`] that call the same
//! Rust code as the in-process evaluator.

mod functions;
mod schema;
mod translate;

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, params_from_iter, Connection, ErrorCode, OptionalExtension};
use tracing::{debug, info, warn};

use crate::config::SqliteOptions;
use crate::error::{StorageError, StorageResult, ValidationError};
use crate::query::{QueryOutcome, StorageQuery};
use crate::record::{validate_collection, NewRecord, Record, RecordPatch};
use crate::storage::lock_err;
use crate::storage::traits::{
    CleanupReport, CollectionSchema, CollectionStats, QueryExplanation, StorageAdapter, StoredVector,
    VectorPrimitives,
};

use schema::RecordRow;
use translate::{index_ddl, index_sql_name, param_to_json, translate};

const BACKEND: &str = "sqlite";

fn tx_failure(operation: &'static str, err: rusqlite::Error) -> StorageError {
    StorageError::TransactionFailure {
        operation: operation.to_string(),
        cause: err.to_string(),
    }
}

fn step(operation: &'static str) -> impl Fn(rusqlite::Error) -> StorageError {
    move |err| tx_failure(operation, err)
}

fn read_err(err: rusqlite::Error) -> StorageError {
    StorageError::Backend(err.to_string())
}

/// Maps a failed record write, recognizing constraint violations.
fn write_error(
    conn: &Connection,
    record: &Record,
    operation: &'static str,
    err: rusqlite::Error,
) -> StorageError {
    if let rusqlite::Error::SqliteFailure(code, Some(message)) = &err {
        if code.code == ErrorCode::ConstraintViolation {
            if message.contains("records.collection, records.id") {
                return StorageError::AlreadyExists {
                    collection: record.collection.clone(),
                    id: record.id.clone(),
                };
            }
            if let Some(sql_name) = message.split("index '").nth(1).and_then(|s| s.split('\'').next()) {
                let index = conn
                    .query_row(
                        "SELECT name FROM collection_indexes WHERE sql_name = ?1",
                        params![sql_name],
                        |row| row.get::<_, String>(0),
                    )
                    .unwrap_or_else(|_| sql_name.to_string());
                return ValidationError::UniqueViolation {
                    collection: record.collection.clone(),
                    index,
                }
                .into();
            }
        }
    }
    tx_failure(operation, err)
}

/// Runs `f` in a transaction, committing only if it succeeds.
fn with_tx<T>(
    conn: &mut Connection,
    operation: &'static str,
    f: impl FnOnce(&Connection) -> StorageResult<T>,
) -> StorageResult<T> {
    let tx = conn.transaction().map_err(step(operation))?;
    match f(&tx) {
        Ok(out) => {
            tx.commit().map_err(step(operation))?;
            Ok(out)
        }
        Err(err) => {
            warn!(target: "polystore::sqlite", operation, error = %err, "transaction rolled back");
            Err(err)
        }
    }
}

fn vector_dimensions(conn: &Connection, collection: &str) -> rusqlite::Result<Option<usize>> {
    let dims: Option<Option<i64>> = conn
        .query_row(
            "SELECT vector_dimensions FROM collections WHERE name = ?1",
            params![collection],
            |row| row.get(0),
        )
        .optional()?;
    Ok(dims.flatten().and_then(|d| usize::try_from(d).ok()))
}

fn set_vector_dimensions(conn: &Connection, collection: &str, dims: usize) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE collections SET vector_dimensions = ?2 WHERE name = ?1",
        params![collection, i64::try_from(dims).unwrap_or(i64::MAX)],
    )?;
    Ok(())
}

/// SQLite-backed adapter.
#[derive(Debug, Clone)]
pub struct SqliteAdapter {
    conn: Arc<Mutex<Option<Connection>>>,
}

impl SqliteAdapter {
    /// Opens the database at `options.path`, or a private in-memory database
    /// when no path is set, and installs the schema.
    ///
    /// # Errors
    ///
    /// Returns `BackendUnavailable` if the database cannot be opened or
    /// prepared.
    pub fn open(options: &SqliteOptions) -> StorageResult<Self> {
        let unavailable = |e: rusqlite::Error| StorageError::unavailable(BACKEND, e.to_string());
        let conn = match &options.path {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                Connection::open(path).map_err(unavailable)?
            }
            None => Connection::open_in_memory().map_err(unavailable)?,
        };
        functions::register(&conn).map_err(unavailable)?;
        if let Some(ms) = options.busy_timeout_ms {
            conn.busy_timeout(Duration::from_millis(ms)).map_err(unavailable)?;
        }
        conn.execute_batch(schema::SCHEMA).map_err(unavailable)?;
        debug!(target: "polystore::sqlite", path = ?options.path, "database opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(Some(conn))),
        })
    }

    /// Runs `f` on the connection off the async executor.
    async fn run<T, F>(&self, f: F) -> StorageResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> StorageResult<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|_| lock_err("sqlite connection"))?;
            let conn = guard
                .as_mut()
                .ok_or_else(|| StorageError::unavailable(BACKEND, "adapter closed"))?;
            f(conn)
        })
        .await
        .map_err(|e| StorageError::Backend(format!("sqlite task failed: {e}")))?
    }

    #[cfg(test)]
    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> T) -> T {
        let guard = self.conn.lock().unwrap();
        f(guard.as_ref().unwrap())
    }
}

#[async_trait]
impl StorageAdapter for SqliteAdapter {
    fn backend_name(&self) -> &'static str {
        BACKEND
    }

    async fn initialize(&self) -> StorageResult<()> {
        self.run(|conn| conn.execute_batch(schema::SCHEMA).map_err(read_err))
            .await
    }

    async fn create(&self, record: NewRecord) -> StorageResult<Record> {
        let record = record.into_record(Utc::now())?;
        self.run(move |conn| {
            with_tx(conn, "create", |tx| {
                let now = record.metadata.updated_at;
                schema::purge_expired(tx, Some(&record.collection), now.timestamp_millis())
                    .map_err(step("create"))?;
                schema::register_collection(tx, &record.collection, now).map_err(step("create"))?;
                if schema::find_record(tx, &record.collection, &record.id)?.is_some() {
                    return Err(StorageError::AlreadyExists {
                        collection: record.collection.clone(),
                        id: record.id.clone(),
                    });
                }
                schema::insert_record(tx, &record).map_err(|e| write_error(tx, &record, "create", e))?;
                schema::refresh_stats(tx, &record.collection, now).map_err(step("create"))?;
                Ok(record)
            })
        })
        .await
    }

    async fn read(&self, collection: &str, id: &str) -> StorageResult<Option<Record>> {
        validate_collection(collection)?;
        let (collection, id) = (collection.to_string(), id.to_string());
        let now = Utc::now();
        self.run(move |conn| {
            Ok(schema::find_record(conn, &collection, &id)?.filter(|r| !r.metadata.is_expired(now)))
        })
        .await
    }

    async fn query(&self, query: &StorageQuery) -> StorageResult<QueryOutcome> {
        let compiled = query.compile()?;
        let started = Instant::now();
        let translation = translate(&compiled, Utc::now().timestamp_millis());
        self.run(move |conn| {
            let total: i64 = conn
                .query_row(
                    &translation.count_sql(),
                    params_from_iter(translation.params.iter()),
                    |row| row.get(0),
                )
                .map_err(read_err)?;
            let (sql, params) = translation.select_sql();
            let mut stmt = conn.prepare(&sql).map_err(read_err)?;
            let rows = stmt
                .query_map(params_from_iter(params.iter()), RecordRow::from_row)
                .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
                .map_err(read_err)?;
            let records = rows
                .into_iter()
                .map(RecordRow::into_record)
                .collect::<StorageResult<Vec<_>>>()?;
            Ok(QueryOutcome {
                records,
                total_count: u64::try_from(total).unwrap_or(0),
                query_time: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            })
        })
        .await
    }

    async fn update(&self, collection: &str, id: &str, patch: RecordPatch) -> StorageResult<Record> {
        validate_collection(collection)?;
        let (collection, id) = (collection.to_string(), id.to_string());
        self.run(move |conn| {
            with_tx(conn, "update", |tx| {
                let now = Utc::now();
                schema::purge_expired(tx, Some(&collection), now.timestamp_millis())
                    .map_err(step("update"))?;
                let mut record = schema::find_record(tx, &collection, &id)?
                    .ok_or_else(|| StorageError::not_found(&collection, &id))?;
                record.apply_patch(&patch, now);
                schema::update_record(tx, &record).map_err(|e| write_error(tx, &record, "update", e))?;
                schema::refresh_stats(tx, &collection, now).map_err(step("update"))?;
                Ok(record)
            })
        })
        .await
    }

    async fn delete(&self, collection: &str, id: &str) -> StorageResult<bool> {
        validate_collection(collection)?;
        let (collection, id) = (collection.to_string(), id.to_string());
        self.run(move |conn| {
            with_tx(conn, "delete", |tx| {
                if !schema::collection_exists(tx, &collection).map_err(step("delete"))? {
                    return Ok(false);
                }
                let now = Utc::now();
                schema::purge_expired(tx, Some(&collection), now.timestamp_millis())
                    .map_err(step("delete"))?;
                tx.execute(
                    "DELETE FROM vectors WHERE collection = ?1 AND record_id = ?2",
                    params![collection, id],
                )
                .map_err(step("delete"))?;
                let removed = tx
                    .execute(
                        "DELETE FROM records WHERE collection = ?1 AND id = ?2",
                        params![collection, id],
                    )
                    .map_err(step("delete"))?;
                schema::refresh_stats(tx, &collection, now).map_err(step("delete"))?;
                Ok(removed > 0)
            })
        })
        .await
    }

    async fn replace(&self, record: NewRecord) -> StorageResult<Record> {
        if record.id.is_none() {
            return Err(ValidationError::EmptyRecordId.into());
        }
        let record = record.into_record(Utc::now())?;
        self.run(move |conn| {
            with_tx(conn, "replace", |tx| {
                let now = Utc::now();
                schema::purge_expired(tx, Some(&record.collection), now.timestamp_millis())
                    .map_err(step("replace"))?;
                schema::register_collection(tx, &record.collection, now).map_err(step("replace"))?;
                for sql in [
                    "DELETE FROM vectors WHERE collection = ?1 AND record_id = ?2",
                    "DELETE FROM records WHERE collection = ?1 AND id = ?2",
                ] {
                    tx.execute(sql, params![record.collection, record.id])
                        .map_err(step("replace"))?;
                }
                schema::insert_record(tx, &record).map_err(|e| write_error(tx, &record, "replace", e))?;
                schema::refresh_stats(tx, &record.collection, now).map_err(step("replace"))?;
                Ok(record)
            })
        })
        .await
    }

    async fn list_collections(&self) -> StorageResult<Vec<String>> {
        self.run(|conn| {
            let mut stmt = conn
                .prepare("SELECT name FROM collections ORDER BY name")
                .map_err(read_err)?;
            let names = stmt
                .query_map([], |row| row.get(0))
                .and_then(|rows| rows.collect::<rusqlite::Result<Vec<String>>>())
                .map_err(read_err)?;
            Ok(names)
        })
        .await
    }

    async fn collection_stats(&self, collection: &str) -> StorageResult<CollectionStats> {
        validate_collection(collection)?;
        let collection = collection.to_string();
        self.run(move |conn| {
            Ok(schema::read_stats(conn, &collection)?.unwrap_or_else(|| CollectionStats::empty(collection)))
        })
        .await
    }

    async fn clear(&self, collection: &str) -> StorageResult<()> {
        validate_collection(collection)?;
        let collection = collection.to_string();
        self.run(move |conn| {
            with_tx(conn, "clear", |tx| {
                if !schema::collection_exists(tx, &collection).map_err(step("clear"))? {
                    return Ok(());
                }
                tx.execute("DELETE FROM vectors WHERE collection = ?1", params![collection])
                    .map_err(step("clear"))?;
                tx.execute("DELETE FROM records WHERE collection = ?1", params![collection])
                    .map_err(step("clear"))?;
                schema::refresh_stats(tx, &collection, Utc::now()).map_err(step("clear"))?;
                Ok(())
            })
        })
        .await
    }

    async fn clear_all(&self) -> StorageResult<()> {
        self.run(|conn| {
            with_tx(conn, "clear_all", |tx| {
                tx.execute("DELETE FROM vectors", []).map_err(step("clear_all"))?;
                tx.execute("DELETE FROM records", []).map_err(step("clear_all"))?;
                tx.execute(
                    "UPDATE collections SET record_count = 0, total_size = 0, updated_at = ?1",
                    params![crate::time::format_timestamp(Utc::now())],
                )
                .map_err(step("clear_all"))?;
                Ok(())
            })?;
            info!(target: "polystore::sqlite", "all collections cleared");
            Ok(())
        })
        .await
    }

    async fn truncate(&self, collection: &str) -> StorageResult<()> {
        validate_collection(collection)?;
        let collection = collection.to_string();
        self.run(move |conn| {
            with_tx(conn, "truncate", |tx| {
                let mut stmt = tx
                    .prepare("SELECT sql_name FROM collection_indexes WHERE collection = ?1")
                    .map_err(step("truncate"))?;
                let sql_names = stmt
                    .query_map(params![collection], |row| row.get::<_, String>(0))
                    .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
                    .map_err(step("truncate"))?;
                drop(stmt);
                for sql_name in &sql_names {
                    tx.execute_batch(&format!("DROP INDEX IF EXISTS {}", translate::quote_ident(sql_name)))
                        .map_err(step("truncate"))?;
                }
                for table_sql in [
                    "DELETE FROM collection_indexes WHERE collection = ?1",
                    "DELETE FROM vectors WHERE collection = ?1",
                    "DELETE FROM records WHERE collection = ?1",
                    "DELETE FROM collections WHERE name = ?1",
                ] {
                    tx.execute(table_sql, params![collection]).map_err(step("truncate"))?;
                }
                Ok(())
            })?;
            info!(target: "polystore::sqlite", collection = %collection, "collection truncated");
            Ok(())
        })
        .await
    }

    async fn ensure_schema(&self, collection: &str, schema: &CollectionSchema) -> StorageResult<()> {
        validate_collection(collection)?;
        schema.validate()?;
        let collection = collection.to_string();
        let indexes = schema.indexes.clone();
        self.run(move |conn| {
            with_tx(conn, "ensure_schema", |tx| {
                let now = Utc::now();
                schema::purge_expired(tx, Some(&collection), now.timestamp_millis())
                    .map_err(step("ensure_schema"))?;
                schema::register_collection(tx, &collection, now).map_err(step("ensure_schema"))?;
                for index in &indexes {
                    let name = index.resolved_name();
                    let inserted = tx
                        .execute(
                            "INSERT OR IGNORE INTO collection_indexes (collection, name, fields, is_unique, sql_name)
                             VALUES (?1, ?2, ?3, ?4, ?5)",
                            params![
                                collection,
                                name,
                                serde_json::Value::from(index.fields.clone()).to_string(),
                                index.unique,
                                index_sql_name(&collection, index),
                            ],
                        )
                        .map_err(step("ensure_schema"))?;
                    if inserted == 0 {
                        continue;
                    }
                    tx.execute_batch(&index_ddl(&collection, index)).map_err(|e| match &e {
                        rusqlite::Error::SqliteFailure(code, _)
                            if code.code == ErrorCode::ConstraintViolation =>
                        {
                            StorageError::from(ValidationError::UniqueViolation {
                                collection: collection.clone(),
                                index: name.clone(),
                            })
                        }
                        _ => tx_failure("ensure_schema", e),
                    })?;
                    debug!(target: "polystore::sqlite", collection = %collection, index = %name, "index created");
                }
                Ok(())
            })
        })
        .await
    }

    async fn cleanup(&self) -> StorageResult<CleanupReport> {
        self.run(|conn| {
            let report = with_tx(conn, "cleanup", |tx| {
                let now = Utc::now();
                let purged =
                    schema::purge_expired(tx, None, now.timestamp_millis()).map_err(step("cleanup"))?;
                let mut report = CleanupReport::default();
                for (collection, removed) in purged {
                    schema::refresh_stats(tx, &collection, now).map_err(step("cleanup"))?;
                    report.removed += removed;
                    report.collections.push(collection);
                }
                Ok(report)
            })?;
            if report.removed > 0 {
                info!(target: "polystore::sqlite", removed = report.removed, "expired records purged");
            }
            Ok(report)
        })
        .await
    }

    async fn close(&self) -> StorageResult<()> {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|_| lock_err("sqlite connection"))?;
            if let Some(conn) = guard.take() {
                conn.close().map_err(|(_, e)| read_err(e))?;
                debug!(target: "polystore::sqlite", "database closed");
            }
            Ok(())
        })
        .await
        .map_err(|e| StorageError::Backend(format!("sqlite task failed: {e}")))?
    }

    async fn explain_query(&self, query: &StorageQuery) -> StorageResult<QueryExplanation> {
        let compiled = query.compile()?;
        let translation = translate(&compiled, Utc::now().timestamp_millis());
        self.run(move |conn| {
            let (sql, params) = translation.select_sql();
            let mut stmt = conn
                .prepare(&format!("EXPLAIN QUERY PLAN {sql}"))
                .map_err(read_err)?;
            let plan = stmt
                .query_map(params_from_iter(params.iter()), |row| row.get::<_, String>(3))
                .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
                .map_err(read_err)?;
            let estimated_rows = schema::read_stats(conn, &compiled.collection)?
                .map_or(0, |s| s.record_count);
            Ok(QueryExplanation {
                backend: BACKEND.to_string(),
                predicate: translation.predicate.clone(),
                params: translation.params.iter().map(param_to_json).collect(),
                estimated_rows,
                plan,
            })
        })
        .await
    }
}

#[async_trait]
impl VectorPrimitives for SqliteAdapter {
    async fn ensure_vector_storage(&self, collection: &str, dimensions: usize) -> StorageResult<()> {
        validate_collection(collection)?;
        let collection = collection.to_string();
        self.run(move |conn| {
            with_tx(conn, "ensure_vector_storage", |tx| {
                schema::register_collection(tx, &collection, Utc::now())
                    .map_err(step("ensure_vector_storage"))?;
                match vector_dimensions(tx, &collection).map_err(step("ensure_vector_storage"))? {
                    Some(existing) if existing != dimensions => Err(ValidationError::DimensionMismatch {
                        expected: existing,
                        actual: dimensions,
                    }
                    .into()),
                    _ => set_vector_dimensions(tx, &collection, dimensions)
                        .map_err(step("ensure_vector_storage")),
                }
            })
        })
        .await
    }

    async fn store_vector(&self, collection: &str, vector: StoredVector) -> StorageResult<()> {
        validate_collection(collection)?;
        let collection = collection.to_string();
        self.run(move |conn| {
            with_tx(conn, "store_vector", |tx| {
                let now = Utc::now();
                schema::purge_expired(tx, Some(&collection), now.timestamp_millis())
                    .map_err(step("store_vector"))?;
                if schema::find_record(tx, &collection, &vector.record_id)?.is_none() {
                    return Err(StorageError::not_found(&collection, &vector.record_id));
                }
                let actual = vector.embedding.len();
                match vector_dimensions(tx, &collection).map_err(step("store_vector"))? {
                    Some(expected) if expected != actual => {
                        return Err(ValidationError::DimensionMismatch { expected, actual }.into());
                    }
                    Some(_) => {}
                    None => set_vector_dimensions(tx, &collection, actual).map_err(step("store_vector"))?,
                }
                tx.execute(
                    "INSERT INTO vectors (collection, record_id, embedding, dims, model, generated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                     ON CONFLICT (collection, record_id) DO UPDATE SET
                        embedding = excluded.embedding,
                        dims = excluded.dims,
                        model = excluded.model,
                        generated_at = excluded.generated_at",
                    params![
                        collection,
                        vector.record_id,
                        schema::encode_embedding(&vector.embedding),
                        i64::try_from(actual).unwrap_or(i64::MAX),
                        vector.model,
                        crate::time::format_timestamp(vector.generated_at),
                    ],
                )
                .map_err(step("store_vector"))?;
                Ok(())
            })
        })
        .await
    }

    async fn get_all_vectors(&self, collection: &str) -> StorageResult<Vec<StoredVector>> {
        validate_collection(collection)?;
        let collection = collection.to_string();
        self.run(move |conn| schema::load_vectors(conn, &collection)).await
    }

    async fn get_vector_count(&self, collection: &str) -> StorageResult<u64> {
        validate_collection(collection)?;
        let collection = collection.to_string();
        self.run(move |conn| {
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM vectors WHERE collection = ?1",
                    params![collection],
                    |row| row.get(0),
                )
                .map_err(read_err)?;
            Ok(u64::try_from(count).unwrap_or(0))
        })
        .await
    }
}
