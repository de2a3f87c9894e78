//! Application-defined SQL functions.
//!
//! Each function wraps the same Rust predicate the in-process evaluator
//! uses, so a translated query cannot disagree with the reference engine.
//! Values travel as JSON text; SQL `NULL` means "missing".
//!
//! | function                      | returns                                   |
//! |-------------------------------|-------------------------------------------|
//! | `ps_field(data, path)`        | JSON text at `path`, `NULL` when missing  |
//! | `ps_eq(v, operand)`           | `$eq` as 0/1                              |
//! | `ps_cmp(v, operand)`          | -1/0/1, `NULL` when not comparable        |
//! | `ps_in(v, list)`              | `$in` as 0/1                              |
//! | `ps_contains(v, needle)`      | `$contains` as 0/1                        |
//! | `ps_regexp(v, pattern, flags)`| `$regex` as 0/1                           |
//! | `ps_in_range(v, from, to)`    | half-open timestamp range as 0/1          |
//! | `ps_sort_key(v)`              | memcmp-ordered sort key                   |
//! | `ps_index_key(v, ...)`        | unique-index key, `NULL` if any part null |

use std::cmp::Ordering;

use rusqlite::functions::{Context, FunctionFlags};
use rusqlite::types::ValueRef;
use rusqlite::{Connection, Error as SqlError, Result as SqlResult};
use serde_json::Value;

use crate::query::eval::{contains_value, in_list, index_key, resolve_data_path, timestamp_in_range};
use crate::query::filter::cached_regex;
use crate::record::RecordData;
use crate::time::parse_timestamp;
use crate::value::{compare_values, matches_eq, sort_key};

fn user_err(message: impl Into<String>) -> SqlError {
    SqlError::UserFunctionError(message.into().into())
}

/// Reads argument `idx` as an optional JSON value.
fn json_arg(ctx: &Context<'_>, idx: usize) -> SqlResult<Option<Value>> {
    match ctx.get_raw(idx) {
        ValueRef::Null => Ok(None),
        ValueRef::Text(text) => serde_json::from_slice(text)
            .map(Some)
            .map_err(|e| user_err(format!("argument {idx} is not JSON: {e}"))),
        ValueRef::Integer(i) => Ok(Some(Value::from(i))),
        ValueRef::Real(f) => Ok(Some(Value::from(f))),
        ValueRef::Blob(_) => Err(user_err(format!("argument {idx} must not be a blob"))),
    }
}

fn text_arg(ctx: &Context<'_>, idx: usize) -> SqlResult<Option<String>> {
    match ctx.get_raw(idx) {
        ValueRef::Null => Ok(None),
        ValueRef::Text(text) => std::str::from_utf8(text)
            .map(|s| Some(s.to_string()))
            .map_err(|e| user_err(format!("argument {idx} is not UTF-8: {e}"))),
        _ => Err(user_err(format!("argument {idx} must be text"))),
    }
}

fn required_json(ctx: &Context<'_>, idx: usize) -> SqlResult<Value> {
    json_arg(ctx, idx)?.ok_or_else(|| user_err(format!("argument {idx} must not be NULL")))
}

fn ps_field(ctx: &Context<'_>) -> SqlResult<Option<String>> {
    let Some(data) = text_arg(ctx, 0)? else {
        return Ok(None);
    };
    let path = text_arg(ctx, 1)?.ok_or_else(|| user_err("path must not be NULL"))?;
    let data: RecordData =
        serde_json::from_str(&data).map_err(|e| user_err(format!("record data is not an object: {e}")))?;
    Ok(resolve_data_path(&data, &path).map(Value::to_string))
}

fn ps_eq(ctx: &Context<'_>) -> SqlResult<bool> {
    let actual = json_arg(ctx, 0)?;
    Ok(matches_eq(actual.as_ref(), &required_json(ctx, 1)?))
}

fn ps_cmp(ctx: &Context<'_>) -> SqlResult<Option<i64>> {
    let actual = json_arg(ctx, 0)?;
    Ok(
        compare_values(actual.as_ref(), &required_json(ctx, 1)?).map(|ord| match ord {
            Ordering::Less => -1,
            Ordering::Equal => 0,
            Ordering::Greater => 1,
        }),
    )
}

fn ps_in(ctx: &Context<'_>) -> SqlResult<bool> {
    let actual = json_arg(ctx, 0)?;
    match required_json(ctx, 1)? {
        Value::Array(list) => Ok(in_list(actual.as_ref(), &list)),
        _ => Err(user_err("ps_in expects a JSON array")),
    }
}

fn ps_contains(ctx: &Context<'_>) -> SqlResult<bool> {
    let actual = json_arg(ctx, 0)?;
    Ok(contains_value(actual.as_ref(), &required_json(ctx, 1)?))
}

fn ps_regexp(ctx: &Context<'_>) -> SqlResult<bool> {
    let Some(Value::String(text)) = json_arg(ctx, 0)? else {
        return Ok(false);
    };
    let pattern = text_arg(ctx, 1)?.ok_or_else(|| user_err("pattern must not be NULL"))?;
    let flags = text_arg(ctx, 2)?.unwrap_or_default();
    let re = cached_regex(&pattern, flags.contains('i')).map_err(|e| user_err(e.to_string()))?;
    Ok(re.is_match(&text))
}

fn ps_in_range(ctx: &Context<'_>) -> SqlResult<bool> {
    let actual = json_arg(ctx, 0)?;
    let bound = |idx: usize| -> SqlResult<Option<chrono::DateTime<chrono::Utc>>> {
        match text_arg(ctx, idx)? {
            None => Ok(None),
            Some(s) => parse_timestamp(&s)
                .map(Some)
                .ok_or_else(|| user_err(format!("bound '{s}' is not a timestamp"))),
        }
    };
    Ok(timestamp_in_range(actual.as_ref(), bound(1)?, bound(2)?))
}

fn ps_sort_key(ctx: &Context<'_>) -> SqlResult<Vec<u8>> {
    let actual = json_arg(ctx, 0)?;
    Ok(sort_key(actual.as_ref()))
}

fn ps_index_key(ctx: &Context<'_>) -> SqlResult<Option<Vec<u8>>> {
    let values = (0..ctx.len())
        .map(|idx| json_arg(ctx, idx))
        .collect::<SqlResult<Vec<_>>>()?;
    let refs: Vec<Option<&Value>> = values.iter().map(Option::as_ref).collect();
    Ok(index_key(&refs))
}

/// Registers every `ps_*` function on `conn`.
///
/// # Errors
///
/// Fails if SQLite refuses a registration.
pub fn register(conn: &Connection) -> SqlResult<()> {
    let flags = FunctionFlags::SQLITE_UTF8
        | FunctionFlags::SQLITE_DETERMINISTIC
        | FunctionFlags::SQLITE_INNOCUOUS;
    conn.create_scalar_function("ps_field", 2, flags, ps_field)?;
    conn.create_scalar_function("ps_eq", 2, flags, ps_eq)?;
    conn.create_scalar_function("ps_cmp", 2, flags, ps_cmp)?;
    conn.create_scalar_function("ps_in", 2, flags, ps_in)?;
    conn.create_scalar_function("ps_contains", 2, flags, ps_contains)?;
    conn.create_scalar_function("ps_regexp", 3, flags, ps_regexp)?;
    conn.create_scalar_function("ps_in_range", 3, flags, ps_in_range)?;
    conn.create_scalar_function("ps_sort_key", 1, flags, ps_sort_key)?;
    conn.create_scalar_function("ps_index_key", -1, flags, ps_index_key)?;
    Ok(())
}
