//! `UniversalFilter` parsing and validation.
//!
//! A filter is a JSON object mapping field paths to either a literal
//! (equality) or an operator object:
//!
//! ```json
//! { "status": "active", "age": { "$gte": 30, "$lt": 65 }, "name": { "$regex": "^A", "$options": "i" } }
//! ```
//!
//! Multiple operators on one field are ANDed, as are multiple fields.

use std::collections::HashMap;
use std::fmt;
use std::sync::{OnceLock, RwLock};

use regex::{Regex, RegexBuilder};
use serde_json::Value;

use crate::error::ValidationError;

/// Raw filter as supplied by callers; must be a JSON object.
pub type UniversalFilter = Value;

const REGEX_CACHE_MAX: usize = 1024;

static REGEX_CACHE: OnceLock<RwLock<HashMap<(String, bool), Regex>>> = OnceLock::new();

/// Compiles a regex, reusing earlier compilations of the same pattern.
///
/// # Errors
///
/// Returns `ValidationError::InvalidRegex` when the pattern does not compile.
pub fn cached_regex(pattern: &str, case_insensitive: bool) -> Result<Regex, ValidationError> {
    let cache = REGEX_CACHE.get_or_init(|| RwLock::new(HashMap::new()));
    let key = (pattern.to_string(), case_insensitive);

    if let Ok(guard) = cache.read() {
        if let Some(re) = guard.get(&key) {
            return Ok(re.clone());
        }
    }

    let compiled = RegexBuilder::new(pattern)
        .case_insensitive(case_insensitive)
        .build()
        .map_err(|e| ValidationError::InvalidRegex {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;

    if let Ok(mut guard) = cache.write() {
        if guard.len() >= REGEX_CACHE_MAX {
            guard.clear();
        }
        guard.entry(key).or_insert_with(|| compiled.clone());
    }
    Ok(compiled)
}

/// A compiled `$regex` operand.
#[derive(Debug, Clone)]
pub struct RegexPattern {
    pub source: String,
    pub case_insensitive: bool,
    regex: Regex,
}

impl RegexPattern {
    /// Compiles `source`.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::InvalidRegex` when the pattern does not compile.
    pub fn new(source: &str, case_insensitive: bool) -> Result<Self, ValidationError> {
        Ok(Self {
            source: source.to_string(),
            case_insensitive,
            regex: cached_regex(source, case_insensitive)?,
        })
    }

    #[must_use]
    pub fn is_match(&self, text: &str) -> bool {
        self.regex.is_match(text)
    }

    /// Flag string as passed to `$options`.
    #[must_use]
    pub const fn flags(&self) -> &'static str {
        if self.case_insensitive {
            "i"
        } else {
            ""
        }
    }
}

impl PartialEq for RegexPattern {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source && self.case_insensitive == other.case_insensitive
    }
}

/// One predicate on a field.
#[derive(Debug, Clone, PartialEq)]
pub enum Operator {
    Eq(Value),
    Ne(Value),
    Gt(Value),
    Gte(Value),
    Lt(Value),
    Lte(Value),
    In(Vec<Value>),
    Nin(Vec<Value>),
    Exists(bool),
    Regex(RegexPattern),
    Contains(Value),
}

impl Operator {
    /// The operator's name in filter syntax.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Eq(_) => "$eq",
            Self::Ne(_) => "$ne",
            Self::Gt(_) => "$gt",
            Self::Gte(_) => "$gte",
            Self::Lt(_) => "$lt",
            Self::Lte(_) => "$lte",
            Self::In(_) => "$in",
            Self::Nin(_) => "$nin",
            Self::Exists(_) => "$exists",
            Self::Regex(_) => "$regex",
            Self::Contains(_) => "$contains",
        }
    }
}

/// All predicates on one field path.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldCondition {
    pub field: String,
    pub operators: Vec<Operator>,
}

/// A parsed, validated filter. The empty filter matches everything.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Filter {
    pub conditions: Vec<FieldCondition>,
}

/// Rejects empty paths and paths with empty segments.
///
/// # Errors
///
/// Returns `ValidationError::InvalidFieldPath`.
pub fn validate_path(path: &str) -> Result<(), ValidationError> {
    if path.is_empty() || path.split('.').any(str::is_empty) {
        return Err(ValidationError::InvalidFieldPath {
            path: path.to_string(),
        });
    }
    Ok(())
}

fn invalid_operand(field: &str, operator: &str, reason: &str) -> ValidationError {
    ValidationError::InvalidOperand {
        field: field.to_string(),
        operator: operator.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_list(field: &str, operator: &str, value: &Value) -> Result<Vec<Value>, ValidationError> {
    match value {
        Value::Array(items) => Ok(items.clone()),
        _ => Err(invalid_operand(field, operator, "expected an array")),
    }
}

fn is_operator_object(map: &serde_json::Map<String, Value>) -> bool {
    map.keys().any(|k| k.starts_with('$'))
}

fn parse_operators(
    field: &str,
    ops: &serde_json::Map<String, Value>,
) -> Result<Vec<Operator>, ValidationError> {
    if ops.keys().any(|k| !k.starts_with('$')) {
        return Err(ValidationError::InvalidQuery {
            reason: format!("field '{field}' mixes operators with plain keys"),
        });
    }

    let case_insensitive = match ops.get("$options") {
        None => false,
        Some(Value::String(flags)) if flags.chars().all(|c| c == 'i') => !flags.is_empty(),
        Some(_) => return Err(invalid_operand(field, "$options", "only the 'i' flag is supported")),
    };
    if ops.contains_key("$options") && !ops.contains_key("$regex") {
        return Err(invalid_operand(field, "$options", "requires $regex"));
    }

    let mut out = Vec::with_capacity(ops.len());
    for (name, operand) in ops {
        let op = match name.as_str() {
            "$eq" => Operator::Eq(operand.clone()),
            "$ne" => Operator::Ne(operand.clone()),
            "$gt" => Operator::Gt(operand.clone()),
            "$gte" => Operator::Gte(operand.clone()),
            "$lt" => Operator::Lt(operand.clone()),
            "$lte" => Operator::Lte(operand.clone()),
            "$in" => Operator::In(parse_list(field, name, operand)?),
            "$nin" => Operator::Nin(parse_list(field, name, operand)?),
            "$exists" => match operand {
                Value::Bool(b) => Operator::Exists(*b),
                _ => return Err(invalid_operand(field, name, "expected a boolean")),
            },
            "$regex" => match operand {
                Value::String(source) => Operator::Regex(RegexPattern::new(source, case_insensitive)?),
                _ => return Err(invalid_operand(field, name, "expected a pattern string")),
            },
            "$contains" => Operator::Contains(operand.clone()),
            "$options" => continue,
            other => {
                return Err(ValidationError::UnknownOperator {
                    field: field.to_string(),
                    operator: other.to_string(),
                })
            }
        };
        out.push(op);
    }
    Ok(out)
}

impl Filter {
    /// Parses a raw filter.
    ///
    /// # Errors
    ///
    /// Returns a `ValidationError` when the filter is not an object, names an
    /// unknown operator, carries an operand of the wrong type, or uses an
    /// invalid field path.
    pub fn parse(raw: &UniversalFilter) -> Result<Self, ValidationError> {
        let Value::Object(fields) = raw else {
            return Err(ValidationError::InvalidQuery {
                reason: "filter must be a JSON object".to_string(),
            });
        };

        let mut conditions = Vec::with_capacity(fields.len());
        for (field, clause) in fields {
            validate_path(field)?;
            let operators = match clause {
                Value::Object(ops) if is_operator_object(ops) => parse_operators(field, ops)?,
                literal => vec![Operator::Eq(literal.clone())],
            };
            conditions.push(FieldCondition {
                field: field.clone(),
                operators,
            });
        }
        Ok(Self { conditions })
    }

    /// True when the filter has no conditions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.conditions.iter().all(|c| c.operators.is_empty())
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Eq(v) => write!(f, "= {v}"),
            Self::Ne(v) => write!(f, "!= {v}"),
            Self::Gt(v) => write!(f, "> {v}"),
            Self::Gte(v) => write!(f, ">= {v}"),
            Self::Lt(v) => write!(f, "< {v}"),
            Self::Lte(v) => write!(f, "<= {v}"),
            Self::In(vs) => write!(f, "IN {}", Value::Array(vs.clone())),
            Self::Nin(vs) => write!(f, "NOT IN {}", Value::Array(vs.clone())),
            Self::Exists(true) => write!(f, "EXISTS"),
            Self::Exists(false) => write!(f, "NOT EXISTS"),
            Self::Regex(re) => write!(f, "MATCHES /{}/{}", re.source, re.flags()),
            Self::Contains(v) => write!(f, "CONTAINS {v}"),
        }
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "TRUE");
        }
        let mut first = true;
        for condition in &self.conditions {
            for op in &condition.operators {
                if !first {
                    write!(f, " AND ")?;
                }
                first = false;
                write!(f, "{} {op}", condition.field)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_literal_means_equality() {
        let filter = Filter::parse(&json!({"name": "Ada"})).unwrap();
        assert_eq!(filter.conditions.len(), 1);
        assert_eq!(filter.conditions[0].operators, vec![Operator::Eq(json!("Ada"))]);
    }

    #[test]
    fn test_object_literal_without_operators_is_equality() {
        let filter = Filter::parse(&json!({"address": {"city": "Paris"}})).unwrap();
        assert_eq!(
            filter.conditions[0].operators,
            vec![Operator::Eq(json!({"city": "Paris"}))]
        );
    }

    #[test]
    fn test_multiple_operators_on_one_field() {
        let filter = Filter::parse(&json!({"age": {"$gte": 30, "$lt": 65}})).unwrap();
        assert_eq!(filter.conditions[0].operators.len(), 2);
    }

    #[test]
    fn test_unknown_operator_rejected() {
        let err = Filter::parse(&json!({"age": {"$between": [1, 2]}})).unwrap_err();
        assert!(matches!(err, ValidationError::UnknownOperator { .. }));
    }

    #[test]
    fn test_mixed_operator_object_rejected() {
        let err = Filter::parse(&json!({"age": {"$gt": 1, "plain": 2}})).unwrap_err();
        assert!(matches!(err, ValidationError::InvalidQuery { .. }));
    }

    #[test]
    fn test_in_requires_array() {
        let err = Filter::parse(&json!({"tag": {"$in": "a"}})).unwrap_err();
        assert!(matches!(err, ValidationError::InvalidOperand { .. }));
    }

    #[test]
    fn test_exists_requires_bool() {
        let err = Filter::parse(&json!({"tag": {"$exists": 1}})).unwrap_err();
        assert!(matches!(err, ValidationError::InvalidOperand { .. }));
    }

    #[test]
    fn test_invalid_regex_rejected() {
        let err = Filter::parse(&json!({"name": {"$regex": "("}})).unwrap_err();
        assert!(matches!(err, ValidationError::InvalidRegex { .. }));
    }

    #[test]
    fn test_regex_options() {
        let filter = Filter::parse(&json!({"name": {"$regex": "^ada", "$options": "i"}})).unwrap();
        let Operator::Regex(re) = &filter.conditions[0].operators[0] else {
            panic!("expected regex operator");
        };
        assert!(re.is_match("Ada Lovelace"));
        assert_eq!(re.flags(), "i");
    }

    #[test]
    fn test_options_without_regex_rejected() {
        let err = Filter::parse(&json!({"name": {"$eq": "a", "$options": "i"}})).unwrap_err();
        assert!(matches!(err, ValidationError::InvalidOperand { .. }));
    }

    #[test]
    fn test_non_object_filter_rejected() {
        assert!(Filter::parse(&json!([1, 2])).is_err());
    }

    #[test]
    fn test_bad_path_rejected() {
        let err = Filter::parse(&json!({"a.": 1})).unwrap_err();
        assert!(matches!(err, ValidationError::InvalidFieldPath { .. }));
    }

    #[test]
    fn test_display() {
        let filter = Filter::parse(&json!({"age": {"$gte": 30}})).unwrap();
        assert_eq!(filter.to_string(), "age >= 30");
        assert_eq!(Filter::default().to_string(), "TRUE");
    }
}
