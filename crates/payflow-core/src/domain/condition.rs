//! Transition condition expressions
//!
//! Conditions are a closed set of typed operators over dot-path lookups
//! into the payload. Evaluation is pure; anything malformed (bad regex,
//! type mismatch) fails closed to `false` and is logged, never raised.

use crate::types::Payload;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

/// A condition expression attached to a transition
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Condition {
    /// Field equals a value
    Eq { field: String, value: Value },
    /// Field does not equal a value
    Ne { field: String, value: Value },
    /// Field is numerically greater than a value
    Gt { field: String, value: f64 },
    /// Field is numerically greater than or equal to a value
    Gte { field: String, value: f64 },
    /// Field is numerically less than a value
    Lt { field: String, value: f64 },
    /// Field is numerically less than or equal to a value
    Lte { field: String, value: f64 },
    /// Field is one of the listed values
    In { field: String, values: Vec<Value> },
    /// Field is none of the listed values
    NotIn { field: String, values: Vec<Value> },
    /// Field resolves to a non-null value
    Exists { field: String },
    /// Field's string form matches a regular expression
    Matches { field: String, pattern: String },
    /// Field's string form starts with a prefix
    StartsWith { field: String, prefix: String },
    /// Field's string form ends with a suffix
    EndsWith { field: String, suffix: String },
    /// Field's string form contains a substring
    Contains { field: String, substring: String },
    /// All sub-conditions hold
    All(Vec<Condition>),
    /// At least one sub-condition holds
    Any(Vec<Condition>),
    /// The sub-condition does not hold
    Not(Box<Condition>),
}

impl Condition {
    /// Evaluate the condition against a payload
    pub fn evaluate(&self, payload: &Payload) -> bool {
        match self {
            Condition::Eq { field, value } => payload
                .get_path(field)
                .map(|found| values_equal(found, value))
                .unwrap_or(false),
            Condition::Ne { field, value } => payload
                .get_path(field)
                .map(|found| !values_equal(found, value))
                .unwrap_or(false),
            Condition::Gt { field, value } => compare(payload, field, |n| n > *value),
            Condition::Gte { field, value } => compare(payload, field, |n| n >= *value),
            Condition::Lt { field, value } => compare(payload, field, |n| n < *value),
            Condition::Lte { field, value } => compare(payload, field, |n| n <= *value),
            Condition::In { field, values } => payload
                .get_path(field)
                .map(|found| values.iter().any(|v| values_equal(found, v)))
                .unwrap_or(false),
            Condition::NotIn { field, values } => payload
                .get_path(field)
                .map(|found| !values.iter().any(|v| values_equal(found, v)))
                .unwrap_or(false),
            Condition::Exists { field } => payload
                .get_path(field)
                .map(|found| !found.is_null())
                .unwrap_or(false),
            Condition::Matches { field, pattern } => match regex::Regex::new(pattern) {
                Ok(re) => string_test(payload, field, |s| re.is_match(s)),
                Err(e) => {
                    warn!(pattern = %pattern, error = %e, "Malformed condition pattern, failing closed");
                    false
                }
            },
            Condition::StartsWith { field, prefix } => {
                string_test(payload, field, |s| s.starts_with(prefix.as_str()))
            }
            Condition::EndsWith { field, suffix } => {
                string_test(payload, field, |s| s.ends_with(suffix.as_str()))
            }
            Condition::Contains { field, substring } => {
                string_test(payload, field, |s| s.contains(substring.as_str()))
            }
            Condition::All(conditions) => conditions.iter().all(|c| c.evaluate(payload)),
            Condition::Any(conditions) => conditions.iter().any(|c| c.evaluate(payload)),
            Condition::Not(condition) => !condition.evaluate(payload),
        }
    }
}

/// Equality with numeric normalization: `1` and `1.0` compare equal
fn values_equal(left: &Value, right: &Value) -> bool {
    match (left.as_f64(), right.as_f64()) {
        (Some(a), Some(b)) => a == b,
        _ => left == right,
    }
}

fn compare<F: Fn(f64) -> bool>(payload: &Payload, field: &str, test: F) -> bool {
    payload
        .get_path(field)
        .and_then(as_number)
        .map(test)
        .unwrap_or(false)
}

/// Numbers and numeric strings both participate in comparisons; external
/// systems routinely quote amounts
fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn string_test<F: Fn(&str) -> bool>(payload: &Payload, field: &str, test: F) -> bool {
    match payload.get_path(field) {
        Some(Value::String(s)) => test(s),
        Some(Value::Number(n)) => test(&n.to_string()),
        _ => false,
    }
}
