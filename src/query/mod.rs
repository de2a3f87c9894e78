//! Backend-agnostic query model and the reference evaluator.
//!
//! A [`StorageQuery`] is validated once by [`StorageQuery::compile`]; the
//! resulting [`CompiledQuery`] is what the in-process evaluator runs and what
//! the relational translator turns into SQL. Every backend must produce the
//! net ordering of the fixed pipeline
//!
//! ```text
//! filter -> sort -> cursor -> offset -> limit
//! ```

pub mod eval;
pub mod filter;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ValidationError;
use crate::record::{validate_collection, Record};
use crate::time::TimeRange;

pub use eval::{execute, matches_record, resolve_field, METADATA_ALIASES};
pub use filter::{FieldCondition, Filter, Operator, RegexPattern, UniversalFilter};

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

/// One sort key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SortField {
    pub field: String,
    #[serde(default)]
    pub direction: SortDirection,
}

impl SortField {
    #[must_use]
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Asc,
        }
    }

    #[must_use]
    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Desc,
        }
    }
}

/// Which side of the cursor value a page continues on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CursorDirection {
    Before,
    After,
}

/// Continuation marker for keyset pagination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cursor {
    pub field: String,
    pub value: Value,
    pub direction: CursorDirection,
}

impl Cursor {
    /// Continue after the record whose `field` resolved to `value`.
    #[must_use]
    pub fn after(field: impl Into<String>, value: Value) -> Self {
        Self {
            field: field.into(),
            value,
            direction: CursorDirection::After,
        }
    }

    /// Continue before the record whose `field` resolved to `value`.
    #[must_use]
    pub fn before(field: impl Into<String>, value: Value) -> Self {
        Self {
            field: field.into(),
            value,
            direction: CursorDirection::Before,
        }
    }

    /// Builds the cursor that continues after `record`.
    #[must_use]
    pub fn after_record(field: impl Into<String>, record: &Record) -> Self {
        let field = field.into();
        let value = resolve_field(record, &field).unwrap_or(Value::Null);
        Self::after(field, value)
    }
}

/// A query against one collection.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageQuery {
    pub collection: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<UniversalFilter>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sort: Vec<SortField>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<Cursor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_range: Option<TimeRange>,
}

impl StorageQuery {
    /// Matches every record of `collection`.
    #[must_use]
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            ..Self::default()
        }
    }

    /// Sets the filter from a `json!` object. Non-object values are rejected
    /// at compile time.
    #[must_use]
    pub fn filter(mut self, filter: UniversalFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    #[must_use]
    pub fn sort_by(mut self, sort: SortField) -> Self {
        self.sort.push(sort);
        self
    }

    #[must_use]
    pub const fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    #[must_use]
    pub const fn offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    #[must_use]
    pub fn cursor(mut self, cursor: Cursor) -> Self {
        self.cursor = Some(cursor);
        self
    }

    #[must_use]
    pub fn time_range(mut self, range: TimeRange) -> Self {
        self.time_range = Some(range);
        self
    }

    /// Validates the query.
    ///
    /// # Errors
    ///
    /// Returns a `ValidationError` for an empty collection, malformed
    /// filter, invalid field paths or inverted time range.
    pub fn compile(&self) -> Result<CompiledQuery, ValidationError> {
        validate_collection(&self.collection)?;
        let filter = match &self.filter {
            Some(raw) => Filter::parse(raw)?,
            None => Filter::default(),
        };
        for sort in &self.sort {
            filter::validate_path(&sort.field)?;
        }
        if let Some(cursor) = &self.cursor {
            filter::validate_path(&cursor.field)?;
        }
        if let Some(range) = &self.time_range {
            range.validate()?;
            filter::validate_path(range.field())?;
        }
        Ok(CompiledQuery {
            collection: self.collection.clone(),
            filter,
            sort: self.sort.clone(),
            limit: self.limit,
            offset: self.offset.unwrap_or(0),
            cursor: self.cursor.clone(),
            time_range: self.time_range.clone(),
        })
    }
}

/// A validated query.
#[derive(Debug, Clone)]
pub struct CompiledQuery {
    pub collection: String,
    pub filter: Filter,
    pub sort: Vec<SortField>,
    pub limit: Option<usize>,
    pub offset: usize,
    pub cursor: Option<Cursor>,
    pub time_range: Option<TimeRange>,
}

impl CompiledQuery {
    /// True when the cursor continues toward larger sort keys.
    ///
    /// `after` means later in the active sort order of the cursor field, so
    /// a descending sort on that field flips it.
    #[must_use]
    pub fn cursor_seeks_greater(&self) -> Option<bool> {
        let cursor = self.cursor.as_ref()?;
        let descending = self
            .sort
            .iter()
            .find(|s| s.field == cursor.field)
            .is_some_and(|s| s.direction == SortDirection::Desc);
        let after = cursor.direction == CursorDirection::After;
        Some(after != descending)
    }
}

/// Records returned by a query plus bookkeeping.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryOutcome {
    pub records: Vec<Record>,
    /// Matches before cursor, offset and limit were applied.
    pub total_count: u64,
    /// Milliseconds spent executing.
    pub query_time: u64,
}

impl QueryOutcome {
    /// Ids of the returned records, in order.
    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        self.records.iter().map(|r| r.id.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_compile_rejects_empty_collection() {
        assert_eq!(
            StorageQuery::new("").compile().unwrap_err(),
            ValidationError::EmptyCollection
        );
    }

    #[test]
    fn test_compile_rejects_non_object_filter() {
        let err = StorageQuery::new("users").filter(json!(5)).compile().unwrap_err();
        assert!(matches!(err, ValidationError::InvalidQuery { .. }));
    }

    #[test]
    fn test_compile_rejects_bad_sort_path() {
        let err = StorageQuery::new("users")
            .sort_by(SortField::asc("a..b"))
            .compile()
            .unwrap_err();
        assert!(matches!(err, ValidationError::InvalidFieldPath { .. }));
    }

    #[test]
    fn test_cursor_direction_follows_sort() {
        let q = StorageQuery::new("users")
            .sort_by(SortField::desc("age"))
            .cursor(Cursor::after("age", json!(30)))
            .compile()
            .unwrap();
        assert_eq!(q.cursor_seeks_greater(), Some(false));

        let q = StorageQuery::new("users")
            .cursor(Cursor::after("age", json!(30)))
            .compile()
            .unwrap();
        assert_eq!(q.cursor_seeks_greater(), Some(true));

        let q = StorageQuery::new("users")
            .cursor(Cursor::before("age", json!(30)))
            .compile()
            .unwrap();
        assert_eq!(q.cursor_seeks_greater(), Some(false));
    }

    #[test]
    fn test_query_serde_camel_case() {
        let q = StorageQuery::new("users").time_range(TimeRange::default());
        let value = serde_json::to_value(&q).unwrap();
        assert!(value.get("timeRange").is_some());
        let back: StorageQuery = serde_json::from_value(value).unwrap();
        assert_eq!(back, q);
    }
}
