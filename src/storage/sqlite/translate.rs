//! `CompiledQuery` to SQL.
//!
//! Field paths are inlined as escaped string literals (they must be constant
//! for expression indexes to match); operand values are always bound.
//! The produced statement keeps the reference pipeline order: the `WHERE`
//! clause is filter and time range, then `ORDER BY` sort keys with `seq` as
//! the insertion-order tie-break, then the cursor bound, then
//! `LIMIT/OFFSET`.

use std::fmt::Write as _;

use rusqlite::types::Value as SqlValue;
use serde_json::Value;

use crate::query::filter::Operator;
use crate::query::{CompiledQuery, SortDirection};
use crate::storage::traits::IndexDefinition;
use crate::time::format_timestamp;
use crate::value::sort_key;

/// Columns read back into a `Record`, in row order.
pub const RECORD_COLUMNS: &str = "id, collection, data, created_at, updated_at, version, tags, ttl";

/// Quotes `s` as an SQL string literal.
#[must_use]
pub fn quote_literal(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

/// Quotes `s` as an SQL identifier.
#[must_use]
pub fn quote_ident(s: &str) -> String {
    format!("\"{}\"", s.replace('"', "\"\""))
}

/// JSON-valued SQL expression for a field path. Metadata aliases read the
/// record columns.
#[must_use]
pub fn field_expr(path: &str) -> String {
    match path {
        "id" => "json_quote(id)".to_string(),
        "collection" => "json_quote(collection)".to_string(),
        "createdAt" => "json_quote(created_at)".to_string(),
        "updatedAt" => "json_quote(updated_at)".to_string(),
        "version" => "json_quote(version)".to_string(),
        _ => format!("ps_field(data, {})", quote_literal(path)),
    }
}

fn json_param(value: &Value) -> SqlValue {
    SqlValue::Text(value.to_string())
}

fn operator_sql(expr: &str, op: &Operator, params: &mut Vec<SqlValue>) -> String {
    match op {
        Operator::Eq(v) => {
            params.push(json_param(v));
            format!("ps_eq({expr}, ?)")
        }
        Operator::Ne(v) => {
            params.push(json_param(v));
            format!("NOT ps_eq({expr}, ?)")
        }
        Operator::Gt(v) | Operator::Gte(v) | Operator::Lt(v) | Operator::Lte(v) => {
            params.push(json_param(v));
            let cmp = match op {
                Operator::Gt(_) => "> 0",
                Operator::Gte(_) => ">= 0",
                Operator::Lt(_) => "< 0",
                _ => "<= 0",
            };
            format!("ps_cmp({expr}, ?) {cmp}")
        }
        Operator::In(list) => {
            params.push(SqlValue::Text(Value::Array(list.clone()).to_string()));
            format!("ps_in({expr}, ?)")
        }
        Operator::Nin(list) => {
            params.push(SqlValue::Text(Value::Array(list.clone()).to_string()));
            format!("NOT ps_in({expr}, ?)")
        }
        Operator::Exists(true) => format!("{expr} IS NOT NULL"),
        Operator::Exists(false) => format!("{expr} IS NULL"),
        Operator::Regex(pattern) => {
            params.push(SqlValue::Text(pattern.source.clone()));
            params.push(SqlValue::Text(pattern.flags().to_string()));
            format!("ps_regexp({expr}, ?, ?)")
        }
        Operator::Contains(v) => {
            params.push(json_param(v));
            format!("ps_contains({expr}, ?)")
        }
    }
}

/// A translated query.
#[derive(Debug, Clone)]
pub struct Translation {
    /// `WHERE` body selecting the matching set (before cursor/offset/limit).
    pub predicate: String,
    pub params: Vec<SqlValue>,
    order_by: String,
    cursor: Option<(String, SqlValue)>,
    limit: i64,
    offset: i64,
}

impl Translation {
    /// `SELECT COUNT(*)` over the matching set.
    #[must_use]
    pub fn count_sql(&self) -> String {
        format!("SELECT COUNT(*) FROM records WHERE {}", self.predicate)
    }

    /// The page query and its parameters.
    #[must_use]
    pub fn select_sql(&self) -> (String, Vec<SqlValue>) {
        let mut sql = format!("SELECT {RECORD_COLUMNS} FROM records WHERE {}", self.predicate);
        let mut params = self.params.clone();
        if let Some((clause, bound)) = &self.cursor {
            let _ = write!(sql, " AND {clause}");
            params.push(bound.clone());
        }
        let _ = write!(sql, " ORDER BY {} LIMIT ? OFFSET ?", self.order_by);
        params.push(SqlValue::Integer(self.limit));
        params.push(SqlValue::Integer(self.offset));
        (sql, params)
    }
}

/// Translates `query`; rows expiring at or before `now_ms` are excluded.
#[must_use]
pub fn translate(query: &CompiledQuery, now_ms: i64) -> Translation {
    let mut clauses = vec![
        "collection = ?".to_string(),
        "(expires_at IS NULL OR expires_at > ?)".to_string(),
    ];
    let mut params = vec![
        SqlValue::Text(query.collection.clone()),
        SqlValue::Integer(now_ms),
    ];

    for condition in &query.filter.conditions {
        let expr = field_expr(&condition.field);
        for op in &condition.operators {
            clauses.push(operator_sql(&expr, op, &mut params));
        }
    }

    if let Some(range) = &query.time_range {
        clauses.push(format!("ps_in_range({}, ?, ?)", field_expr(range.field())));
        for bound in [range.from, range.to] {
            params.push(bound.map_or(SqlValue::Null, |ts| SqlValue::Text(format_timestamp(ts))));
        }
    }

    let mut order: Vec<String> = query
        .sort
        .iter()
        .map(|s| {
            let key = format!("ps_sort_key({})", field_expr(&s.field));
            match s.direction {
                SortDirection::Asc => key,
                SortDirection::Desc => format!("{key} DESC"),
            }
        })
        .collect();
    order.push("seq".to_string());

    let cursor = query.cursor.as_ref().zip(query.cursor_seeks_greater()).map(|(cursor, greater)| {
        let cmp = if greater { ">" } else { "<" };
        (
            format!("ps_sort_key({}) {cmp} ?", field_expr(&cursor.field)),
            SqlValue::Blob(sort_key(Some(&cursor.value))),
        )
    });

    Translation {
        predicate: clauses.join(" AND "),
        params,
        order_by: order.join(", "),
        cursor,
        limit: query.limit.map_or(-1, |l| i64::try_from(l).unwrap_or(i64::MAX)),
        offset: i64::try_from(query.offset).unwrap_or(i64::MAX),
    }
}

/// JSON rendering of a bound parameter, for explanations.
#[must_use]
pub fn param_to_json(value: &SqlValue) -> Value {
    match value {
        SqlValue::Null => Value::Null,
        SqlValue::Integer(i) => Value::from(*i),
        SqlValue::Real(f) => Value::from(*f),
        SqlValue::Text(s) => Value::String(s.clone()),
        SqlValue::Blob(bytes) => {
            let mut hex = String::with_capacity(bytes.len() * 2 + 3);
            hex.push_str("x'");
            for b in bytes {
                let _ = write!(hex, "{b:02x}");
            }
            hex.push('\'');
            Value::String(hex)
        }
    }
}

fn hex(s: &str) -> String {
    s.bytes().fold(String::with_capacity(s.len() * 2), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}

/// SQLite name of a declared index. Unique per `(collection, index)`.
#[must_use]
pub fn index_sql_name(collection: &str, index: &IndexDefinition) -> String {
    format!("ps_{}_{}", hex(collection), hex(&index.resolved_name()))
}

/// `CREATE INDEX` for a declared index, partial on its collection.
///
/// Unique indexes are built on `ps_index_key`, which is `NULL` when any
/// field is missing or null; SQLite treats `NULL`s as distinct, so such
/// records are exempt.
#[must_use]
pub fn index_ddl(collection: &str, index: &IndexDefinition) -> String {
    let name = quote_ident(&index_sql_name(collection, index));
    let exprs: Vec<String> = index.fields.iter().map(|f| field_expr(f)).collect();
    let scope = quote_literal(collection);
    if index.unique {
        format!(
            "CREATE UNIQUE INDEX IF NOT EXISTS {name} ON records(ps_index_key({})) WHERE collection = {scope}",
            exprs.join(", ")
        )
    } else {
        let keys: Vec<String> = exprs.iter().map(|e| format!("ps_sort_key({e})")).collect();
        format!(
            "CREATE INDEX IF NOT EXISTS {name} ON records({}) WHERE collection = {scope}",
            keys.join(", ")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{Cursor, SortField, StorageQuery};
    use serde_json::json;

    #[test]
    fn test_quoting() {
        assert_eq!(quote_literal("o'neil"), "'o''neil'");
        assert_eq!(quote_ident("a\"b"), "\"a\"\"b\"");
    }

    #[test]
    fn test_field_expr_aliases() {
        assert_eq!(field_expr("createdAt"), "json_quote(created_at)");
        assert_eq!(field_expr("address.city"), "ps_field(data, 'address.city')");
    }

    #[test]
    fn test_translate_filter_binds_values() {
        let q = StorageQuery::new("users")
            .filter(json!({"age": {"$gte": 30}, "name": {"$exists": true}}))
            .compile()
            .unwrap();
        let t = translate(&q, 1_000);
        assert_eq!(
            t.predicate,
            "collection = ? AND (expires_at IS NULL OR expires_at > ?) \
             AND ps_cmp(ps_field(data, 'age'), ?) >= 0 AND ps_field(data, 'name') IS NOT NULL"
        );
        assert_eq!(t.params.len(), 3);
        assert_eq!(t.params[2], SqlValue::Text("30".to_string()));
    }

    #[test]
    fn test_select_orders_then_pages() {
        let q = StorageQuery::new("users")
            .sort_by(SortField::desc("age"))
            .cursor(Cursor::after("age", json!(40)))
            .limit(10)
            .compile()
            .unwrap();
        let (sql, params) = translate(&q, 0).select_sql();
        assert!(sql.contains("AND ps_sort_key(ps_field(data, 'age')) < ?"));
        assert!(sql.ends_with("ORDER BY ps_sort_key(ps_field(data, 'age')) DESC, seq LIMIT ? OFFSET ?"));
        assert_eq!(params[params.len() - 2], SqlValue::Integer(10));
        assert_eq!(params[params.len() - 1], SqlValue::Integer(0));
    }

    #[test]
    fn test_index_ddl() {
        let ddl = index_ddl("users", &IndexDefinition::unique(&["email"]));
        assert!(ddl.starts_with("CREATE UNIQUE INDEX IF NOT EXISTS \"ps_7573657273_"));
        assert!(ddl.ends_with("ON records(ps_index_key(ps_field(data, 'email'))) WHERE collection = 'users'"));
    }

    #[test]
    fn test_param_to_json() {
        assert_eq!(param_to_json(&SqlValue::Blob(vec![0, 255])), json!("x'00ff'"));
        assert_eq!(param_to_json(&SqlValue::Integer(3)), json!(3));
    }
}
