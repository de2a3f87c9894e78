//! Key naming between the crate (camelCase) and the remote engine
//! (snake_case).
//!
//! The mapping is escape-based so that `decode(encode(k)) == k` for every
//! key, including keys that already contain underscores or digits:
//!
//! | crate key   | wire key      |
//! |-------------|---------------|
//! | `createdAt` | `created_at`  |
//! | `user_id`   | `user__id`    |
//! | `URL`       | `_u_r_l`      |
//!
//! Only object keys are translated; string values are left alone.

use serde_json::{Map, Value};

/// camelCase key to its wire form.
#[must_use]
pub fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 4);
    for c in key.chars() {
        match c {
            '_' => out.push_str("__"),
            c if c.is_ascii_uppercase() => {
                out.push('_');
                out.push(c.to_ascii_lowercase());
            }
            c => out.push(c),
        }
    }
    out
}

/// Wire key back to its camelCase form.
#[must_use]
pub fn decode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    let mut chars = key.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '_' {
            out.push(c);
            continue;
        }
        match chars.peek().copied() {
            Some('_') => {
                chars.next();
                out.push('_');
            }
            Some(next) if next.is_ascii_lowercase() => {
                chars.next();
                out.push(next.to_ascii_uppercase());
            }
            _ => out.push('_'),
        }
    }
    out
}

fn map_keys(value: Value, f: fn(&str) -> String) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (f(&k), map_keys(v, f)))
                .collect::<Map<_, _>>(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(|v| map_keys(v, f)).collect()),
        other => other,
    }
}

/// Recursively encodes every object key of `value`.
#[must_use]
pub fn encode_value(value: Value) -> Value {
    map_keys(value, encode_key)
}

/// Recursively decodes every object key of `value`.
#[must_use]
pub fn decode_value(value: Value) -> Value {
    map_keys(value, decode_key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_common_keys() {
        assert_eq!(encode_key("createdAt"), "created_at");
        assert_eq!(encode_key("totalCount"), "total_count");
        assert_eq!(encode_key("user_id"), "user__id");
        assert_eq!(decode_key("created_at"), "createdAt");
        assert_eq!(decode_key("user__id"), "user_id");
    }

    #[test]
    fn test_nested_values() {
        let value = json!({"recordId": "a", "data": {"firstName": "Ada", "tags": [{"isNew": true}]}});
        let wire = encode_value(value.clone());
        assert_eq!(wire["data"]["first_name"], json!("Ada"));
        assert_eq!(wire["data"]["tags"][0]["is_new"], json!(true));
        assert_eq!(wire["record_id"], json!("a"));
        assert_eq!(decode_value(wire), value);
    }

    #[test]
    fn test_values_untouched() {
        let wire = encode_value(json!({"k": "camelValue"}));
        assert_eq!(wire["k"], json!("camelValue"));
    }

    proptest! {
        #[test]
        fn prop_key_roundtrip(key in "\\PC{0,24}") {
            prop_assert_eq!(decode_key(&encode_key(&key)), key);
        }

        #[test]
        fn prop_ascii_roundtrip(key in "[A-Za-z0-9_]{0,24}") {
            prop_assert_eq!(decode_key(&encode_key(&key)), key);
        }
    }
}
