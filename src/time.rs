//! Temporal helpers.
//!
//! Timestamps appear in two forms: native `DateTime<Utc>` values on record
//! metadata and ISO-8601-shaped strings inside record data. Both are compared
//! as instants by the query engine, never lexically.

use std::sync::OnceLock;

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Default field a [`TimeRange`] applies to.
pub const DEFAULT_TIME_FIELD: &str = "createdAt";

static ISO_SHAPE: OnceLock<Regex> = OnceLock::new();

fn iso_shape() -> &'static Regex {
    ISO_SHAPE.get_or_init(|| {
        // YYYY-MM-DD with an optional time part and optional zone designator.
        Regex::new(
            r"^\d{4}-\d{2}-\d{2}(?:[T ]\d{2}:\d{2}(?::\d{2}(?:\.\d{1,9})?)?(?:Z|z|[+-]\d{2}:?\d{2})?)?$",
        )
        .expect("static timestamp pattern is valid")
    })
}

/// Returns true if the string has the shape of an ISO-8601 date or date-time.
#[must_use]
pub fn looks_like_timestamp(s: &str) -> bool {
    s.len() >= 10 && s.as_bytes()[4] == b'-' && iso_shape().is_match(s)
}

/// Parses an ISO-8601-shaped string into an instant.
///
/// Date-only strings resolve to midnight UTC; date-times without a zone are
/// taken as UTC. Returns `None` for anything that is not timestamp-shaped or
/// does not denote a valid calendar instant.
#[must_use]
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if !looks_like_timestamp(s) {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f%z") {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// Canonical text form used when a metadata timestamp is exposed as a value.
#[must_use]
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

/// A half-open window `[from, to)` over a timestamp field.
///
/// Either bound may be omitted. The field defaults to `createdAt`.
///
/// # Examples
///
/// ```
/// use polystore::TimeRange;
/// use chrono::{Duration, Utc};
///
/// let now = Utc::now();
/// let range = TimeRange::between(now - Duration::hours(1), now).unwrap();
/// assert!(range.contains(now - Duration::minutes(5)));
/// assert!(!range.contains(now));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeRange {
    /// Field to test; `createdAt` when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,

    /// Start of the range (inclusive).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<DateTime<Utc>>,

    /// End of the range (exclusive).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<DateTime<Utc>>,
}

impl TimeRange {
    /// Creates a closed range over `createdAt`.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::InvalidQuery` if `from >= to`.
    pub fn between(from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Self, ValidationError> {
        let range = Self {
            field: None,
            from: Some(from),
            to: Some(to),
        };
        range.validate()?;
        Ok(range)
    }

    /// Creates an open-ended range starting at `from`.
    #[must_use]
    pub const fn since(from: DateTime<Utc>) -> Self {
        Self {
            field: None,
            from: Some(from),
            to: None,
        }
    }

    /// Targets a different timestamp field.
    #[must_use]
    pub fn on_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    /// The field this range applies to.
    #[must_use]
    pub fn field(&self) -> &str {
        self.field.as_deref().unwrap_or(DEFAULT_TIME_FIELD)
    }

    /// Checks that the bounds are ordered.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::InvalidQuery` if `from >= to`.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if let (Some(from), Some(to)) = (self.from, self.to) {
            if from >= to {
                return Err(ValidationError::InvalidQuery {
                    reason: format!("time range start ({from}) must be before end ({to})"),
                });
            }
        }
        Ok(())
    }

    /// Check if a timestamp falls within this range `[from, to)`.
    #[must_use]
    pub fn contains(&self, time: DateTime<Utc>) -> bool {
        self.from.map_or(true, |from| time >= from) && self.to.map_or(true, |to| time < to)
    }
}
