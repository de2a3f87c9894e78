//! Table layout and row mapping.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::{StorageError, StorageResult};
use crate::record::{Record, RecordMetadata};
use crate::storage::traits::{CollectionStats, StoredVector};
use crate::time::format_timestamp;

pub const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS collections (
    name              TEXT PRIMARY KEY,
    record_count      INTEGER NOT NULL DEFAULT 0,
    total_size        INTEGER NOT NULL DEFAULT 0,
    vector_dimensions INTEGER,
    created_at        TEXT NOT NULL,
    updated_at        TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS records (
    seq        INTEGER PRIMARY KEY AUTOINCREMENT,
    collection TEXT NOT NULL,
    id         TEXT NOT NULL,
    data       TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    version    INTEGER NOT NULL,
    tags       TEXT,
    ttl        INTEGER,
    expires_at INTEGER,
    UNIQUE (collection, id)
);

CREATE INDEX IF NOT EXISTS records_expiry ON records(expires_at) WHERE expires_at IS NOT NULL;

CREATE TABLE IF NOT EXISTS collection_indexes (
    collection TEXT NOT NULL,
    name       TEXT NOT NULL,
    fields     TEXT NOT NULL,
    is_unique  INTEGER NOT NULL,
    sql_name   TEXT NOT NULL,
    PRIMARY KEY (collection, name)
);

CREATE TABLE IF NOT EXISTS vectors (
    collection   TEXT NOT NULL,
    record_id    TEXT NOT NULL,
    embedding    BLOB NOT NULL,
    dims         INTEGER NOT NULL,
    model        TEXT,
    generated_at TEXT NOT NULL,
    PRIMARY KEY (collection, record_id)
);
";

fn corrupt(what: &str, err: impl std::fmt::Display) -> StorageError {
    StorageError::Serialization(format!("stored {what} unreadable: {err}"))
}

fn parse_time(what: &str, text: &str) -> StorageResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| corrupt(what, e))
}

/// Raw `records` row in [`super::translate::RECORD_COLUMNS`] order.
pub struct RecordRow {
    id: String,
    collection: String,
    data: String,
    created_at: String,
    updated_at: String,
    version: i64,
    tags: Option<String>,
    ttl: Option<i64>,
}

impl RecordRow {
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            collection: row.get(1)?,
            data: row.get(2)?,
            created_at: row.get(3)?,
            updated_at: row.get(4)?,
            version: row.get(5)?,
            tags: row.get(6)?,
            ttl: row.get(7)?,
        })
    }

    pub fn into_record(self) -> StorageResult<Record> {
        let tags = self
            .tags
            .map(|t| serde_json::from_str(&t))
            .transpose()
            .map_err(|e| corrupt("tags", e))?;
        Ok(Record {
            data: serde_json::from_str(&self.data).map_err(|e| corrupt("data", e))?,
            metadata: RecordMetadata {
                created_at: parse_time("created_at", &self.created_at)?,
                updated_at: parse_time("updated_at", &self.updated_at)?,
                version: u64::try_from(self.version).map_err(|e| corrupt("version", e))?,
                tags,
                ttl: self
                    .ttl
                    .map(u64::try_from)
                    .transpose()
                    .map_err(|e| corrupt("ttl", e))?,
            },
            id: self.id,
            collection: self.collection,
        })
    }
}

/// Writes `record` as a new row.
pub fn insert_record(conn: &Connection, record: &Record) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO records (collection, id, data, created_at, updated_at, version, tags, ttl, expires_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            record.collection,
            record.id,
            serde_json::Value::Object(record.data.clone()).to_string(),
            format_timestamp(record.metadata.created_at),
            format_timestamp(record.metadata.updated_at),
            i64::try_from(record.metadata.version).unwrap_or(i64::MAX),
            record
                .metadata
                .tags
                .as_ref()
                .map(|t| serde_json::Value::from(t.clone()).to_string()),
            record.metadata.ttl.map(|t| i64::try_from(t).unwrap_or(i64::MAX)),
            record.metadata.expires_at_ms(),
        ],
    )?;
    Ok(())
}

/// Rewrites the mutable columns of an existing row.
pub fn update_record(conn: &Connection, record: &Record) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE records SET data = ?3, updated_at = ?4, version = ?5, tags = ?6, ttl = ?7, expires_at = ?8
         WHERE collection = ?1 AND id = ?2",
        params![
            record.collection,
            record.id,
            serde_json::Value::Object(record.data.clone()).to_string(),
            format_timestamp(record.metadata.updated_at),
            i64::try_from(record.metadata.version).unwrap_or(i64::MAX),
            record
                .metadata
                .tags
                .as_ref()
                .map(|t| serde_json::Value::from(t.clone()).to_string()),
            record.metadata.ttl.map(|t| i64::try_from(t).unwrap_or(i64::MAX)),
            record.metadata.expires_at_ms(),
        ],
    )?;
    Ok(())
}

/// Reads one row regardless of expiry.
pub fn find_record(conn: &Connection, collection: &str, id: &str) -> StorageResult<Option<Record>> {
    let row = conn
        .query_row(
            &format!(
                "SELECT {} FROM records WHERE collection = ?1 AND id = ?2",
                super::translate::RECORD_COLUMNS
            ),
            params![collection, id],
            RecordRow::from_row,
        )
        .optional()
        .map_err(|e| StorageError::Backend(e.to_string()))?;
    row.map(RecordRow::into_record).transpose()
}

/// Adds `collection` to the registry if absent.
pub fn register_collection(conn: &Connection, collection: &str, now: DateTime<Utc>) -> rusqlite::Result<()> {
    let now = format_timestamp(now);
    conn.execute(
        "INSERT OR IGNORE INTO collections (name, created_at, updated_at) VALUES (?1, ?2, ?2)",
        params![collection, now],
    )?;
    Ok(())
}

pub fn collection_exists(conn: &Connection, collection: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT EXISTS (SELECT 1 FROM collections WHERE name = ?1)",
        params![collection],
        |row| row.get(0),
    )
}

/// Recomputes the registry counters of `collection` from its rows.
pub fn refresh_stats(conn: &Connection, collection: &str, now: DateTime<Utc>) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE collections SET
            record_count = (SELECT COUNT(*) FROM records WHERE collection = ?1),
            total_size = (SELECT COALESCE(SUM(length(CAST(data AS BLOB))), 0) FROM records WHERE collection = ?1),
            updated_at = ?2
         WHERE name = ?1",
        params![collection, format_timestamp(now)],
    )?;
    Ok(())
}

pub fn read_stats(conn: &Connection, collection: &str) -> StorageResult<Option<CollectionStats>> {
    let row = conn
        .query_row(
            "SELECT record_count, total_size, created_at, updated_at FROM collections WHERE name = ?1",
            params![collection],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            },
        )
        .optional()
        .map_err(|e| StorageError::Backend(e.to_string()))?;
    row.map(|(count, size, created, updated)| {
        Ok(CollectionStats {
            name: collection.to_string(),
            record_count: u64::try_from(count).unwrap_or(0),
            total_size: u64::try_from(size).unwrap_or(0),
            created_at: Some(parse_time("created_at", &created)?),
            updated_at: Some(parse_time("updated_at", &updated)?),
        })
    })
    .transpose()
}

/// Deletes expired rows (and their vectors) of one collection, or of all
/// collections when `collection` is `None`. Returns the affected collections
/// with their removal counts.
pub fn purge_expired(
    conn: &Connection,
    collection: Option<&str>,
    now_ms: i64,
) -> rusqlite::Result<Vec<(String, u64)>> {
    let mut stmt = conn.prepare(
        "SELECT collection, COUNT(*) FROM records
         WHERE expires_at IS NOT NULL AND expires_at <= ?1 AND (?2 IS NULL OR collection = ?2)
         GROUP BY collection ORDER BY collection",
    )?;
    let affected = stmt
        .query_map(params![now_ms, collection], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?
        .map(|r| r.map(|(c, n)| (c, u64::try_from(n).unwrap_or(0))))
        .collect::<rusqlite::Result<Vec<_>>>()?;
    if affected.is_empty() {
        return Ok(affected);
    }
    conn.execute(
        "DELETE FROM vectors WHERE (collection, record_id) IN (
            SELECT collection, id FROM records
            WHERE expires_at IS NOT NULL AND expires_at <= ?1 AND (?2 IS NULL OR collection = ?2))",
        params![now_ms, collection],
    )?;
    conn.execute(
        "DELETE FROM records
         WHERE expires_at IS NOT NULL AND expires_at <= ?1 AND (?2 IS NULL OR collection = ?2)",
        params![now_ms, collection],
    )?;
    Ok(affected)
}

#[must_use]
pub fn encode_embedding(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
}

pub fn decode_embedding(bytes: &[u8]) -> StorageResult<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return Err(corrupt("embedding", format!("{} bytes is not a multiple of 4", bytes.len())));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

pub fn load_vectors(conn: &Connection, collection: &str) -> StorageResult<Vec<StoredVector>> {
    let mut stmt = conn
        .prepare(
            "SELECT record_id, embedding, model, generated_at FROM vectors
             WHERE collection = ?1 ORDER BY rowid",
        )
        .map_err(|e| StorageError::Backend(e.to_string()))?;
    let rows = stmt
        .query_map(params![collection], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Vec<u8>>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, String>(3)?,
            ))
        })
        .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
        .map_err(|e| StorageError::Backend(e.to_string()))?;
    rows.into_iter()
        .map(|(record_id, blob, model, generated_at)| {
            Ok(StoredVector {
                record_id,
                embedding: decode_embedding(&blob)?,
                model,
                generated_at: parse_time("generated_at", &generated_at)?,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{data_from, NewRecord};
    use serde_json::json;

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        super::super::functions::register(&conn).unwrap();
        conn.execute_batch(SCHEMA).unwrap();
        conn
    }

    #[test]
    fn test_record_row_roundtrip() {
        let conn = conn();
        let now = Utc::now();
        let record = NewRecord::new("users", data_from(json!({"name": "Ada", "n": [1, 2]})))
            .with_id("u1")
            .with_tags(vec!["a".to_string()])
            .with_ttl(60)
            .into_record(now)
            .unwrap();
        insert_record(&conn, &record).unwrap();
        let back = find_record(&conn, "users", "u1").unwrap().unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_stats_refresh() {
        let conn = conn();
        let now = Utc::now();
        register_collection(&conn, "users", now).unwrap();
        let record = NewRecord::new("users", data_from(json!({"x": 1})))
            .with_id("a")
            .into_record(now)
            .unwrap();
        insert_record(&conn, &record).unwrap();
        refresh_stats(&conn, "users", now).unwrap();
        let stats = read_stats(&conn, "users").unwrap().unwrap();
        assert_eq!(stats.record_count, 1);
        assert_eq!(stats.total_size, record.data_size());
        assert!(read_stats(&conn, "other").unwrap().is_none());
    }

    #[test]
    fn test_purge_expired_reports_per_collection() {
        let conn = conn();
        let now = Utc::now();
        for (collection, id, ttl) in [("a", "1", Some(1)), ("a", "2", None), ("b", "3", Some(1))] {
            let mut record = NewRecord::new(collection, data_from(json!({}))).with_id(id);
            if let Some(ttl) = ttl {
                record = record.with_ttl(ttl);
            }
            insert_record(&conn, &record.into_record(now).unwrap()).unwrap();
        }
        let later = now.timestamp_millis() + 5_000;
        let removed = purge_expired(&conn, Some("a"), later).unwrap();
        assert_eq!(removed, vec![("a".to_string(), 1)]);
        let removed = purge_expired(&conn, None, later).unwrap();
        assert_eq!(removed, vec![("b".to_string(), 1)]);
    }

    #[test]
    fn test_embedding_codec() {
        let v = vec![1.5_f32, -0.25, 0.0];
        assert_eq!(decode_embedding(&encode_embedding(&v)).unwrap(), v);
        assert!(decode_embedding(&[0, 1, 2]).is_err());
    }
}
