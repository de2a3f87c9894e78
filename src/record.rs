//! Records and their metadata.
//!
//! A [`Record`] is addressed by the pair `(collection, id)`. Its `data` is an
//! open JSON field map; `metadata` is owned by the storage layer.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ValidationError;

/// Open field map holding a record's user data.
pub type RecordData = Map<String, Value>;

/// Storage-owned bookkeeping for a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordMetadata {
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Starts at 1 and increases by one per accepted update.
    pub version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    /// Time-to-live in seconds, counted from `updated_at`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
}

impl RecordMetadata {
    /// Fresh metadata for a record created at `now`.
    #[must_use]
    pub const fn new(now: DateTime<Utc>) -> Self {
        Self {
            created_at: now,
            updated_at: now,
            version: 1,
            tags: None,
            ttl: None,
        }
    }

    /// Unix-millisecond instant at which the record expires, if it has a TTL.
    #[must_use]
    pub fn expires_at_ms(&self) -> Option<i64> {
        let ttl = i64::try_from(self.ttl?).ok()?;
        Some(
            self.updated_at
                .timestamp_millis()
                .saturating_add(ttl.saturating_mul(1000)),
        )
    }

    /// Returns true once the TTL has elapsed.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at_ms()
            .is_some_and(|at| at <= now.timestamp_millis())
    }
}

/// A stored record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub id: String,
    pub collection: String,
    #[serde(default)]
    pub data: RecordData,
    pub metadata: RecordMetadata,
}

impl Record {
    /// Approximate stored size in bytes (serialized data length).
    #[must_use]
    pub fn data_size(&self) -> u64 {
        serde_json::to_vec(&self.data).map_or(0, |bytes| bytes.len() as u64)
    }

    /// Applies a partial update in place.
    ///
    /// Top-level keys of `patch.data` replace the corresponding keys of
    /// `data`; untouched keys are kept. `id`, `collection` and `created_at`
    /// never change.
    pub fn apply_patch(&mut self, patch: &RecordPatch, now: DateTime<Utc>) {
        for (key, value) in &patch.data {
            self.data.insert(key.clone(), value.clone());
        }
        if let Some(tags) = &patch.tags {
            self.metadata.tags = Some(tags.clone());
        }
        if let Some(ttl) = patch.ttl {
            self.metadata.ttl = Some(ttl);
        }
        self.metadata.updated_at = now;
        if patch.increment_version {
            self.metadata.version += 1;
        }
    }
}

/// Input to `create`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewRecord {
    /// Caller-chosen id; a UUID v4 is generated when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub collection: String,
    #[serde(default)]
    pub data: RecordData,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
    /// Explicit metadata, kept verbatim. Used when mirroring a record that
    /// already exists in another tier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<RecordMetadata>,
}

impl NewRecord {
    /// A new record in `collection` with the given data.
    #[must_use]
    pub fn new(collection: impl Into<String>, data: RecordData) -> Self {
        Self {
            collection: collection.into(),
            data,
            ..Self::default()
        }
    }

    /// Sets an explicit id.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Sets tags.
    #[must_use]
    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = Some(tags);
        self
    }

    /// Sets a TTL in seconds.
    #[must_use]
    pub const fn with_ttl(mut self, ttl: u64) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Builds the insert for a copy of an existing record, metadata included.
    #[must_use]
    pub fn mirror(record: &Record) -> Self {
        Self {
            id: Some(record.id.clone()),
            collection: record.collection.clone(),
            data: record.data.clone(),
            tags: None,
            ttl: None,
            metadata: Some(record.metadata.clone()),
        }
    }

    /// Validates the input and materializes the record as of `now`.
    ///
    /// # Errors
    ///
    /// Returns a `ValidationError` for an empty collection name or id.
    pub fn into_record(self, now: DateTime<Utc>) -> Result<Record, ValidationError> {
        validate_collection(&self.collection)?;
        let id = match self.id {
            Some(id) if id.is_empty() => return Err(ValidationError::EmptyRecordId),
            Some(id) => id,
            None => uuid::Uuid::new_v4().to_string(),
        };
        let metadata = self.metadata.unwrap_or_else(|| RecordMetadata {
            tags: self.tags,
            ttl: self.ttl,
            ..RecordMetadata::new(now)
        });
        Ok(Record {
            id,
            collection: self.collection,
            data: self.data,
            metadata,
        })
    }
}

const fn default_increment() -> bool {
    true
}

/// Input to `update`: a partial merge into `data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordPatch {
    #[serde(default)]
    pub data: RecordData,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
    /// When false the version is left as is.
    #[serde(default = "default_increment")]
    pub increment_version: bool,
}

impl Default for RecordPatch {
    fn default() -> Self {
        Self {
            data: RecordData::new(),
            tags: None,
            ttl: None,
            increment_version: true,
        }
    }
}

impl RecordPatch {
    /// A patch replacing the given top-level data keys.
    #[must_use]
    pub fn data(data: RecordData) -> Self {
        Self {
            data,
            ..Self::default()
        }
    }

    /// Leaves the version untouched.
    #[must_use]
    pub const fn without_version_increment(mut self) -> Self {
        self.increment_version = false;
        self
    }
}

/// Rejects empty collection names.
///
/// # Errors
///
/// Returns `ValidationError::EmptyCollection`.
pub fn validate_collection(collection: &str) -> Result<(), ValidationError> {
    if collection.trim().is_empty() {
        return Err(ValidationError::EmptyCollection);
    }
    Ok(())
}

/// Builds a [`RecordData`] from a `serde_json::json!` object literal.
///
/// Non-object values produce an empty map.
#[must_use]
pub fn data_from(value: Value) -> RecordData {
    match value {
        Value::Object(map) => map,
        _ => RecordData::new(),
    }
}

/// Shortcut for tests and callers computing expiry windows.
#[must_use]
pub fn ttl_deadline(now: DateTime<Utc>, ttl_secs: u64) -> DateTime<Utc> {
    let secs = i64::try_from(ttl_secs).unwrap_or(i64::MAX);
    now + Duration::seconds(secs)
}
