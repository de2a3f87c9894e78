//! Reference evaluation of compiled queries.
//!
//! The in-process adapter runs queries through [`execute`]. The relational
//! adapter registers the per-value helpers here ([`matches_operator`],
//! [`timestamp_in_range`], [`index_key`]) as SQL functions, so both paths
//! share one implementation of every predicate.

use std::cmp::Ordering;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde_json::Value;

use super::filter::{Filter, Operator};
use super::{CompiledQuery, QueryOutcome, SortDirection};
use crate::record::{Record, RecordData};
use crate::time::{format_timestamp, parse_timestamp, TimeRange};
use crate::value::{compare_values, matches_eq, sort_key, values_equal};

/// Field names that resolve to record metadata rather than `data`.
pub const METADATA_ALIASES: &[&str] = &["id", "collection", "createdAt", "updatedAt", "version"];

/// Resolves a dotted path inside a data map. Numeric segments index arrays.
#[must_use]
pub fn resolve_data_path<'a>(data: &'a RecordData, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = data.get(segments.next()?)?;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Resolves `path` against a record: metadata aliases first, then `data`.
///
/// Metadata timestamps resolve to their canonical RFC 3339 text, so they
/// compare as instants against timestamp-shaped operands.
#[must_use]
pub fn resolve_field(record: &Record, path: &str) -> Option<Value> {
    match path {
        "id" => Some(Value::String(record.id.clone())),
        "collection" => Some(Value::String(record.collection.clone())),
        "createdAt" => Some(Value::String(format_timestamp(record.metadata.created_at))),
        "updatedAt" => Some(Value::String(format_timestamp(record.metadata.updated_at))),
        "version" => Some(Value::from(record.metadata.version)),
        _ => resolve_data_path(&record.data, path).cloned(),
    }
}

/// `$in` membership under `$eq` semantics.
#[must_use]
pub fn in_list(actual: Option<&Value>, list: &[Value]) -> bool {
    list.iter().any(|candidate| matches_eq(actual, candidate))
}

/// `$contains`: substring for strings, element equality for arrays.
#[must_use]
pub fn contains_value(actual: Option<&Value>, needle: &Value) -> bool {
    match (actual, needle) {
        (Some(Value::String(haystack)), Value::String(needle)) => haystack.contains(needle.as_str()),
        (Some(Value::Array(items)), needle) => items.iter().any(|item| values_equal(item, needle)),
        _ => false,
    }
}

/// Evaluates one operator against a resolved (possibly missing) value.
#[must_use]
pub fn matches_operator(actual: Option<&Value>, op: &Operator) -> bool {
    match op {
        Operator::Eq(expected) => matches_eq(actual, expected),
        Operator::Ne(expected) => !matches_eq(actual, expected),
        Operator::Gt(expected) => compare_values(actual, expected) == Some(Ordering::Greater),
        Operator::Gte(expected) => matches!(
            compare_values(actual, expected),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        Operator::Lt(expected) => compare_values(actual, expected) == Some(Ordering::Less),
        Operator::Lte(expected) => matches!(
            compare_values(actual, expected),
            Some(Ordering::Less | Ordering::Equal)
        ),
        Operator::In(list) => in_list(actual, list),
        Operator::Nin(list) => !in_list(actual, list),
        Operator::Exists(expected) => actual.is_some() == *expected,
        Operator::Regex(pattern) => match actual {
            Some(Value::String(text)) => pattern.is_match(text),
            _ => false,
        },
        Operator::Contains(needle) => contains_value(actual, needle),
    }
}

/// True when every condition of `filter` holds for `record`.
#[must_use]
pub fn matches_filter(record: &Record, filter: &Filter) -> bool {
    filter.conditions.iter().all(|condition| {
        let actual = resolve_field(record, &condition.field);
        condition
            .operators
            .iter()
            .all(|op| matches_operator(actual.as_ref(), op))
    })
}

/// Half-open range test over a timestamp-shaped value. Anything that is not
/// a timestamp is outside every range.
#[must_use]
pub fn timestamp_in_range(
    actual: Option<&Value>,
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
) -> bool {
    let Some(Value::String(text)) = actual else {
        return false;
    };
    parse_timestamp(text).is_some_and(|ts| {
        TimeRange {
            field: None,
            from,
            to,
        }
        .contains(ts)
    })
}

/// Filter plus time range.
#[must_use]
pub fn matches_record(record: &Record, query: &CompiledQuery) -> bool {
    if !matches_filter(record, &query.filter) {
        return false;
    }
    query.time_range.as_ref().map_or(true, |range| {
        let actual = resolve_field(record, range.field());
        timestamp_in_range(actual.as_ref(), range.from, range.to)
    })
}

/// Key enforced by unique indexes. `None` when any component is missing or
/// null, which exempts the record from the constraint.
#[must_use]
pub fn index_key(values: &[Option<&Value>]) -> Option<Vec<u8>> {
    let mut key = Vec::new();
    for value in values {
        let value = (*value).filter(|v| !v.is_null())?;
        let part = sort_key(Some(value));
        key.extend_from_slice(&(part.len() as u32).to_be_bytes());
        key.extend_from_slice(&part);
    }
    Some(key)
}

/// Unique-index key of `record` over `fields`.
#[must_use]
pub fn record_index_key(record: &Record, fields: &[String]) -> Option<Vec<u8>> {
    let resolved: Vec<Option<Value>> = fields.iter().map(|f| resolve_field(record, f)).collect();
    let refs: Vec<Option<&Value>> = resolved.iter().map(Option::as_ref).collect();
    index_key(&refs)
}

fn compare_keys(a: &[Vec<u8>], b: &[Vec<u8>], query: &CompiledQuery) -> Ordering {
    for ((ka, kb), sort) in a.iter().zip(b).zip(&query.sort) {
        let ord = match sort.direction {
            SortDirection::Asc => ka.cmp(kb),
            SortDirection::Desc => kb.cmp(ka),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

/// Runs the full pipeline `filter -> sort -> cursor -> offset -> limit` over
/// `records`, given in storage insertion order. Records whose TTL elapsed
/// before `now` are skipped.
#[must_use]
pub fn execute(records: &[Record], query: &CompiledQuery, now: DateTime<Utc>) -> QueryOutcome {
    let started = Instant::now();

    let mut matched: Vec<(Vec<Vec<u8>>, &Record)> = records
        .iter()
        .filter(|r| r.collection == query.collection)
        .filter(|r| !r.metadata.is_expired(now))
        .filter(|r| matches_record(r, query))
        .map(|r| {
            let keys = query
                .sort
                .iter()
                .map(|s| sort_key(resolve_field(r, &s.field).as_ref()))
                .collect();
            (keys, r)
        })
        .collect();
    let total_count = matched.len() as u64;

    // Stable: ties keep insertion order.
    matched.sort_by(|(a, _), (b, _)| compare_keys(a, b, query));

    let mut page: Vec<&Record> = matched.into_iter().map(|(_, r)| r).collect();

    if let (Some(cursor), Some(greater)) = (&query.cursor, query.cursor_seeks_greater()) {
        let bound = sort_key(Some(&cursor.value));
        page.retain(|r| {
            let key = sort_key(resolve_field(r, &cursor.field).as_ref());
            if greater {
                key > bound
            } else {
                key < bound
            }
        });
    }

    let records = page
        .into_iter()
        .skip(query.offset)
        .take(query.limit.unwrap_or(usize::MAX))
        .cloned()
        .collect();

    QueryOutcome {
        records,
        total_count,
        query_time: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{Cursor, SortField, StorageQuery};
    use crate::record::{data_from, NewRecord};
    use chrono::Duration;
    use serde_json::json;

    fn record(id: &str, data: Value) -> Record {
        NewRecord::new("users", data_from(data))
            .with_id(id)
            .into_record(Utc::now())
            .unwrap()
    }

    fn dataset() -> Vec<Record> {
        vec![
            record("a", json!({"name": "Ada", "age": 25, "tags": ["x", "y"]})),
            record("b", json!({"name": "Bob", "age": 31, "address": {"city": "Paris"}})),
            record("c", json!({"name": "cyd", "age": 40, "nick": null})),
            record("d", json!({"name": "Dee"})),
        ]
    }

    fn run(query: StorageQuery) -> QueryOutcome {
        execute(&dataset(), &query.compile().unwrap(), Utc::now())
    }

    #[test]
    fn test_gte_filter() {
        let out = run(StorageQuery::new("users").filter(json!({"age": {"$gte": 30}})));
        assert_eq!(out.ids(), vec!["b", "c"]);
        assert_eq!(out.total_count, 2);
    }

    #[test]
    fn test_relational_operators_false_on_missing() {
        let out = run(StorageQuery::new("users").filter(json!({"age": {"$lt": 100}})));
        assert!(!out.ids().contains(&"d".to_string()));
    }

    #[test]
    fn test_eq_null_matches_missing_and_null() {
        let out = run(StorageQuery::new("users").filter(json!({"nick": null})));
        assert_eq!(out.ids(), vec!["a", "b", "c", "d"]);
        let out = run(StorageQuery::new("users").filter(json!({"nick": {"$ne": null}})));
        assert!(out.records.is_empty());
    }

    #[test]
    fn test_exists_counts_explicit_null() {
        let out = run(StorageQuery::new("users").filter(json!({"nick": {"$exists": true}})));
        assert_eq!(out.ids(), vec!["c"]);
    }

    #[test]
    fn test_nested_path_and_array_index() {
        let out = run(StorageQuery::new("users").filter(json!({"address.city": "Paris"})));
        assert_eq!(out.ids(), vec!["b"]);
        let out = run(StorageQuery::new("users").filter(json!({"tags.1": "y"})));
        assert_eq!(out.ids(), vec!["a"]);
    }

    #[test]
    fn test_in_nin_contains_regex() {
        let out = run(StorageQuery::new("users").filter(json!({"age": {"$in": [25, 40]}})));
        assert_eq!(out.ids(), vec!["a", "c"]);
        let out = run(StorageQuery::new("users").filter(json!({"age": {"$nin": [25, 40]}})));
        assert_eq!(out.ids(), vec!["b", "d"]);
        let out = run(StorageQuery::new("users").filter(json!({"tags": {"$contains": "x"}})));
        assert_eq!(out.ids(), vec!["a"]);
        let out = run(StorageQuery::new("users").filter(json!({"name": {"$contains": "o"}})));
        assert_eq!(out.ids(), vec!["b"]);
        let out = run(
            StorageQuery::new("users").filter(json!({"name": {"$regex": "^[a-c]", "$options": "i"}})),
        );
        assert_eq!(out.ids(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_cross_type_comparison_is_false() {
        let out = run(StorageQuery::new("users").filter(json!({"age": {"$gt": "10"}})));
        assert!(out.records.is_empty());
    }

    #[test]
    fn test_metadata_alias_resolves_to_metadata() {
        let mut records = dataset();
        records[0].data.insert("id".to_string(), json!("shadow"));
        let q = StorageQuery::new("users").filter(json!({"id": "a"})).compile().unwrap();
        assert_eq!(execute(&records, &q, Utc::now()).ids(), vec!["a"]);
        let q = StorageQuery::new("users").filter(json!({"version": 1})).compile().unwrap();
        assert_eq!(execute(&records, &q, Utc::now()).records.len(), 4);
    }

    #[test]
    fn test_sort_missing_first_and_desc_inverts() {
        let out = run(StorageQuery::new("users").sort_by(SortField::asc("age")));
        assert_eq!(out.ids(), vec!["d", "a", "b", "c"]);
        let out = run(StorageQuery::new("users").sort_by(SortField::desc("age")));
        assert_eq!(out.ids(), vec!["c", "b", "a", "d"]);
    }

    #[test]
    fn test_sort_ties_keep_insertion_order() {
        let records = vec![
            record("x", json!({"g": 1})),
            record("y", json!({"g": 0})),
            record("z", json!({"g": 1})),
        ];
        let q = StorageQuery::new("users").sort_by(SortField::desc("g")).compile().unwrap();
        assert_eq!(execute(&records, &q, Utc::now()).ids(), vec!["x", "z", "y"]);
    }

    #[test]
    fn test_cursor_pages_cover_everything_once() {
        let records: Vec<Record> = (0..10)
            .map(|i| record(&format!("r{i}"), json!({"n": (i * 7) % 10})))
            .collect();
        let mut seen = Vec::new();
        let mut cursor: Option<Cursor> = None;
        loop {
            let mut q = StorageQuery::new("users").sort_by(SortField::asc("n")).limit(3);
            if let Some(c) = cursor.take() {
                q = q.cursor(c);
            }
            let out = execute(&records, &q.compile().unwrap(), Utc::now());
            if out.records.is_empty() {
                break;
            }
            cursor = out.records.last().map(|r| Cursor::after_record("n", r));
            seen.extend(out.records.into_iter().map(|r| r.data["n"].as_i64().unwrap()));
        }
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_cursor_after_with_desc_sort() {
        let q = StorageQuery::new("users")
            .sort_by(SortField::desc("age"))
            .cursor(Cursor::after("age", json!(31)))
            .compile()
            .unwrap();
        let out = execute(&dataset(), &q, Utc::now());
        assert_eq!(out.ids(), vec!["a", "d"]);
        assert_eq!(out.total_count, 4);
    }

    #[test]
    fn test_offset_and_limit_after_sort() {
        let out = run(
            StorageQuery::new("users")
                .sort_by(SortField::asc("name"))
                .offset(1)
                .limit(2),
        );
        assert_eq!(out.ids(), vec!["b", "d"]);
        assert_eq!(out.total_count, 4);
    }

    #[test]
    fn test_time_range_on_data_field() {
        let records = vec![
            record("early", json!({"when": "2024-01-01T00:00:00Z"})),
            record("mid", json!({"when": "2024-06-01T00:00:00+02:00"})),
            record("late", json!({"when": "2025-01-01"})),
            record("bad", json!({"when": "soon"})),
        ];
        let from = parse_timestamp("2024-03-01").unwrap();
        let to = parse_timestamp("2025-01-01").unwrap();
        let q = StorageQuery::new("users")
            .time_range(TimeRange::between(from, to).unwrap().on_field("when"))
            .compile()
            .unwrap();
        assert_eq!(execute(&records, &q, Utc::now()).ids(), vec!["mid"]);
    }

    #[test]
    fn test_expired_records_hidden() {
        let now = Utc::now();
        let mut records = dataset();
        records[1].metadata.ttl = Some(1);
        let q = StorageQuery::new("users").compile().unwrap();
        assert_eq!(execute(&records, &q, now + Duration::seconds(5)).records.len(), 3);
    }

    #[test]
    fn test_index_key_exempts_null() {
        assert!(index_key(&[Some(&json!(1)), None]).is_none());
        assert!(index_key(&[Some(&Value::Null)]).is_none());
        assert_eq!(
            index_key(&[Some(&json!(1))]),
            index_key(&[Some(&json!(1.0))])
        );
        assert_ne!(
            index_key(&[Some(&json!("ab")), Some(&json!("c"))]),
            index_key(&[Some(&json!("a")), Some(&json!("bc"))])
        );
    }
}
