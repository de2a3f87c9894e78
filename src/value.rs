//! Type-aware comparison of JSON values.
//!
//! Every backend evaluates predicates through these functions (the relational
//! adapter registers them as SQL functions), so comparison semantics cannot
//! drift between backends.
//!
//! Two orderings exist:
//! - [`compare_values`] is the *predicate* ordering used by `$gt/$gte/$lt/$lte`.
//!   It is partial: operands of incompatible types, or a missing/null operand,
//!   are not comparable and every relational operator on them is false.
//! - [`sort_key`] is the *sort* ordering used by `sort` and cursors. It is
//!   total: null < bool < number < timestamp < string < array < object, and
//!   its byte encoding compares with plain `memcmp`.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::time::parse_timestamp;

/// A JSON value classified for comparison.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Comparable<'a> {
    Null,
    Bool(bool),
    Number(f64),
    /// A timestamp-shaped string, with its parsed instant.
    Instant(DateTime<Utc>, &'a str),
    Text(&'a str),
    Array(&'a [Value]),
    Object(&'a Map<String, Value>),
}

impl<'a> Comparable<'a> {
    /// Classifies a JSON value.
    #[must_use]
    pub fn classify(value: &'a Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(*b),
            Value::Number(n) => Self::Number(n.as_f64().unwrap_or(f64::NAN)),
            Value::String(s) => match parse_timestamp(s) {
                Some(ts) => Self::Instant(ts, s),
                None => Self::Text(s),
            },
            Value::Array(items) => Self::Array(items),
            Value::Object(map) => Self::Object(map),
        }
    }

    const fn rank(&self) -> u8 {
        match self {
            Self::Null => 0,
            Self::Bool(_) => 1,
            Self::Number(_) => 2,
            Self::Instant(..) => 3,
            Self::Text(_) => 4,
            Self::Array(_) => 5,
            Self::Object(_) => 6,
        }
    }
}

/// Predicate ordering of `actual` against `expected`.
///
/// Returns `None` when the operands are not comparable: `actual` is missing,
/// either side is null, or the types differ. Two timestamps compare as
/// instants; a timestamp and a plain string compare as strings.
#[must_use]
pub fn compare_values(actual: Option<&Value>, expected: &Value) -> Option<Ordering> {
    let actual = actual?;
    match (Comparable::classify(actual), Comparable::classify(expected)) {
        (Comparable::Bool(a), Comparable::Bool(b)) => Some(a.cmp(&b)),
        (Comparable::Number(a), Comparable::Number(b)) => a.partial_cmp(&b),
        (Comparable::Instant(a, _), Comparable::Instant(b, _)) => Some(a.cmp(&b)),
        (
            Comparable::Instant(_, a) | Comparable::Text(a),
            Comparable::Instant(_, b) | Comparable::Text(b),
        ) => Some(a.cmp(b)),
        _ => None,
    }
}

/// Equality used by `$eq`, `$in` and `$contains`.
///
/// Scalars follow [`compare_values`] (so `1` equals `1.0` and two spellings
/// of the same instant are equal); arrays and objects compare structurally.
#[must_use]
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (Comparable::classify(a), Comparable::classify(b)) {
        (Comparable::Null, Comparable::Null) => true,
        (Comparable::Array(_) | Comparable::Object(_), _)
        | (_, Comparable::Array(_) | Comparable::Object(_)) => a == b,
        _ => compare_values(Some(a), b) == Some(Ordering::Equal),
    }
}

/// `$eq` semantics: a `null` operand matches a missing or null field; any
/// other operand requires a present, equal value.
#[must_use]
pub fn matches_eq(actual: Option<&Value>, expected: &Value) -> bool {
    if expected.is_null() {
        return actual.map_or(true, Value::is_null);
    }
    actual.is_some_and(|a| values_equal(a, expected))
}

fn encode_f64(x: f64) -> [u8; 8] {
    // Collapse -0.0 onto 0.0 so equal numbers share a key.
    let x = if x == 0.0 { 0.0 } else { x };
    let bits = x.to_bits();
    let ordered = if bits >> 63 == 1 { !bits } else { bits | (1 << 63) };
    ordered.to_be_bytes()
}

/// Byte key whose lexicographic order is the sort order.
///
/// Missing and null values share the lowest key, so they sort first.
#[must_use]
pub fn sort_key(value: Option<&Value>) -> Vec<u8> {
    let Some(value) = value else {
        return vec![0];
    };
    let class = Comparable::classify(value);
    let mut key = vec![class.rank()];
    match class {
        Comparable::Null => {}
        Comparable::Bool(b) => key.push(u8::from(b)),
        Comparable::Number(n) => key.extend_from_slice(&encode_f64(n)),
        Comparable::Instant(ts, _) => {
            #[allow(clippy::cast_sign_loss)]
            let secs = (ts.timestamp() as u64) ^ (1 << 63);
            key.extend_from_slice(&secs.to_be_bytes());
            key.extend_from_slice(&ts.timestamp_subsec_nanos().to_be_bytes());
        }
        Comparable::Text(s) => key.extend_from_slice(s.as_bytes()),
        Comparable::Array(_) | Comparable::Object(_) => {
            key.extend_from_slice(value.to_string().as_bytes());
        }
    }
    key
}

/// Sort ordering of two (possibly missing) values.
#[must_use]
pub fn compare_for_sort(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    sort_key(a).cmp(&sort_key(b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_numbers_compare_natively() {
        assert_eq!(compare_values(Some(&json!(31)), &json!(30)), Some(Ordering::Greater));
        assert_eq!(compare_values(Some(&json!(2.5)), &json!(3)), Some(Ordering::Less));
        assert!(values_equal(&json!(1), &json!(1.0)));
    }

    #[test]
    fn test_timestamps_compare_as_instants() {
        // Lexically "2024-01-15T12..." > "2024-01-15T11...", but as instants
        // 12:00+02:00 is 10:00Z, which is earlier than 11:00Z.
        let a = json!("2024-01-15T12:00:00+02:00");
        let b = json!("2024-01-15T11:00:00Z");
        assert_eq!(compare_values(Some(&a), &b), Some(Ordering::Less));
    }

    #[test]
    fn test_incompatible_types_are_not_comparable() {
        assert_eq!(compare_values(Some(&json!("10")), &json!(5)), None);
        assert_eq!(compare_values(Some(&json!(true)), &json!(1)), None);
        assert!(!values_equal(&json!("1"), &json!(1)));
    }

    #[test]
    fn test_missing_or_null_is_not_comparable() {
        assert_eq!(compare_values(None, &json!(1)), None);
        assert_eq!(compare_values(Some(&Value::Null), &json!(1)), None);
        assert_eq!(compare_values(Some(&json!(1)), &Value::Null), None);
    }

    #[test]
    fn test_timestamp_against_plain_string_is_lexical() {
        assert_eq!(
            compare_values(Some(&json!("2024-01-01")), &json!("apple")),
            Some(Ordering::Less)
        );
    }

    #[test]
    fn test_matches_eq_null_policy() {
        assert!(matches_eq(None, &Value::Null));
        assert!(matches_eq(Some(&Value::Null), &Value::Null));
        assert!(!matches_eq(Some(&json!(0)), &Value::Null));
        assert!(!matches_eq(None, &json!(0)));
    }

    #[test]
    fn test_sort_key_orders_across_types() {
        let ordered = [
            None,
            Some(json!(false)),
            Some(json!(true)),
            Some(json!(-10.5)),
            Some(json!(0)),
            Some(json!(3)),
            Some(json!("2020-01-01")),
            Some(json!("2024-06-01T00:00:00Z")),
            Some(json!("apple")),
            Some(json!("banana")),
            Some(json!([1])),
            Some(json!({"a": 1})),
        ];
        for pair in ordered.windows(2) {
            assert_eq!(
                compare_for_sort(pair[0].as_ref(), pair[1].as_ref()),
                Ordering::Less,
                "{:?} should sort before {:?}",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn test_sort_key_null_equals_missing() {
        assert_eq!(compare_for_sort(None, Some(&Value::Null)), Ordering::Equal);
    }

    #[test]
    fn test_sort_key_negative_zero() {
        assert_eq!(compare_for_sort(Some(&json!(-0.0)), Some(&json!(0))), Ordering::Equal);
    }

    proptest! {
        #[test]
        fn prop_number_sort_key_matches_native_order(a in -1.0e12f64..1.0e12, b in -1.0e12f64..1.0e12) {
            let ka = sort_key(Some(&json!(a)));
            let kb = sort_key(Some(&json!(b)));
            prop_assert_eq!(ka.cmp(&kb), a.partial_cmp(&b).unwrap());
        }

        #[test]
        fn prop_compare_values_is_antisymmetric(a in -1000i64..1000, b in -1000i64..1000) {
            let ab = compare_values(Some(&json!(a)), &json!(b));
            let ba = compare_values(Some(&json!(b)), &json!(a));
            prop_assert_eq!(ab.map(Ordering::reverse), ba);
        }

        #[test]
        fn prop_string_sort_key_matches_str_order(a in "[a-z]{0,8}", b in "[a-z]{0,8}") {
            let ka = sort_key(Some(&json!(a)));
            let kb = sort_key(Some(&json!(b)));
            prop_assert_eq!(ka.cmp(&kb), a.cmp(&b));
        }
    }
}
