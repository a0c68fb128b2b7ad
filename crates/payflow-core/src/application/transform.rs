//! The field-mapping engine behind TRANSFORM steps and API_CALL body
//! projection
//!
//! All mappings read from a snapshot of the input, so a symmetric swap
//! configuration (a→b, b→a) exchanges values instead of clobbering them.

use crate::domain::flow_definition::{FieldMapping, TransformFn, TransformOp};
use crate::types::Payload;
use crate::EngineError;
use serde_json::Value;
use tracing::warn;

/// Apply mappings onto a copy of the input payload: unmapped fields
/// survive, mapped targets are overwritten
pub fn apply_field_mappings(
    input: &Payload,
    mappings: &[FieldMapping],
) -> Result<Payload, EngineError> {
    let mut output = input.clone();
    write_mappings(input, &mut output, mappings)?;
    Ok(output)
}

/// Project mappings into a fresh payload: only mapped targets appear
/// (used to build outbound request bodies)
pub fn project_field_mappings(
    input: &Payload,
    mappings: &[FieldMapping],
) -> Result<Payload, EngineError> {
    let mut output = Payload::empty();
    write_mappings(input, &mut output, mappings)?;
    Ok(output)
}

fn write_mappings(
    input: &Payload,
    output: &mut Payload,
    mappings: &[FieldMapping],
) -> Result<(), EngineError> {
    for mapping in mappings {
        let source = input.get_path(&mapping.source).cloned();

        let value = match (source, &mapping.default) {
            (Some(value), _) => value,
            (None, Some(default)) => default.clone(),
            (None, None) => continue,
        };

        let value = match &mapping.transform {
            Some(transform) => apply_transform(transform, value)?,
            None => value,
        };

        output.set_path(&mapping.target, value);
    }
    Ok(())
}

/// Apply the imperative transform ops in order
pub fn apply_ops(payload: &mut Payload, ops: &[TransformOp]) -> Result<(), EngineError> {
    for op in ops {
        match op {
            TransformOp::Set { path, value } => payload.set_path(path, value.clone()),
            TransformOp::Copy { from, to } => {
                if let Some(value) = payload.get_path(from).cloned() {
                    payload.set_path(to, value);
                }
            }
            TransformOp::Delete { path } => {
                payload.remove_path(path);
            }
            TransformOp::Derive {
                from,
                to,
                transform,
            } => {
                if let Some(value) = payload.get_path(from).cloned() {
                    let derived = apply_transform(transform, value)?;
                    payload.set_path(to, derived);
                }
            }
        }
    }
    Ok(())
}

/// Apply one transform function to a value
///
/// String transforms on non-string values pass the value through
/// unchanged; a mapping that needs coercion should chain a format
/// transform first. Malformed patterns and dates fail closed with a
/// warning rather than aborting the step.
fn apply_transform(transform: &TransformFn, value: Value) -> Result<Value, EngineError> {
    let result = match transform {
        TransformFn::Constant { value } => value.clone(),
        TransformFn::Uppercase => map_string(value, |s| s.to_uppercase()),
        TransformFn::Lowercase => map_string(value, |s| s.to_lowercase()),
        TransformFn::Trim => map_string(value, |s| s.trim().to_string()),
        TransformFn::PadLeft { width, fill } => map_string(value, |s| pad(&s, *width, *fill, true)),
        TransformFn::PadRight { width, fill } => {
            map_string(value, |s| pad(&s, *width, *fill, false))
        }
        TransformFn::Substring { start, len } => {
            map_string(value, |s| s.chars().skip(*start).take(*len).collect())
        }
        TransformFn::RegexReplace {
            pattern,
            replacement,
        } => match regex::Regex::new(pattern) {
            Ok(re) => map_string(value, |s| re.replace_all(&s, replacement.as_str()).to_string()),
            Err(e) => {
                warn!(pattern = %pattern, error = %e, "Malformed replace pattern, leaving value unchanged");
                value
            }
        },
        TransformFn::NumericFormat { scale } => match number_of(&value) {
            Some(n) => Value::String(format!("{:.*}", *scale as usize, n)),
            None => value,
        },
        TransformFn::DateFormat { from, to } => map_string(value, |s| {
            match chrono::NaiveDateTime::parse_from_str(&s, from)
                .map(|dt| dt.format(to).to_string())
                .or_else(|_| {
                    chrono::NaiveDate::parse_from_str(&s, from)
                        .map(|d| d.format(to).to_string())
                }) {
                Ok(formatted) => formatted,
                Err(e) => {
                    warn!(value = %s, from = %from, error = %e, "Date parse failed, leaving value unchanged");
                    s
                }
            }
        }),
    };
    Ok(result)
}

fn map_string<F: FnOnce(String) -> String>(value: Value, f: F) -> Value {
    match value {
        Value::String(s) => Value::String(f(s)),
        Value::Number(n) => Value::String(f(n.to_string())),
        other => other,
    }
}

fn pad(s: &str, width: usize, fill: char, left: bool) -> String {
    let current = s.chars().count();
    if current >= width {
        return s.to_string();
    }
    let padding: String = std::iter::repeat(fill).take(width - current).collect();
    if left {
        format!("{}{}", padding, s)
    } else {
        format!("{}{}", s, padding)
    }
}

fn number_of(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn mapping(source: &str, target: &str) -> FieldMapping {
        FieldMapping {
            source: source.to_string(),
            target: target.to_string(),
            transform: None,
            default: None,
        }
    }

    #[test]
    fn test_apply_keeps_unmapped_fields() {
        let input = Payload::new(json!({"name": "ada", "kept": 1}));
        let output =
            apply_field_mappings(&input, &[mapping("name", "customer_name")]).unwrap();

        assert_eq!(output.get_str("customer_name").unwrap(), "ada");
        assert_eq!(output.get_path("kept").unwrap().as_i64().unwrap(), 1);
        // The source field survives too; deletion is an explicit op
        assert_eq!(output.get_str("name").unwrap(), "ada");
    }

    #[test]
    fn test_project_builds_from_empty() {
        let input = Payload::new(json!({"name": "ada", "noise": true}));
        let output = project_field_mappings(&input, &[mapping("name", "beneficiary")]).unwrap();

        assert_eq!(output.get_str("beneficiary").unwrap(), "ada");
        assert!(output.get_path("noise").is_none());
    }

    #[test]
    fn test_symmetric_swap_round_trip() {
        let swap = vec![
            mapping("debit_account", "credit_account"),
            mapping("credit_account", "debit_account"),
        ];

        let input = Payload::new(json!({"debit_account": "1111", "credit_account": "2222"}));
        let swapped = apply_field_mappings(&input, &swap).unwrap();

        assert_eq!(swapped.get_str("debit_account").unwrap(), "2222");
        assert_eq!(swapped.get_str("credit_account").unwrap(), "1111");

        // Applying the same swap again recovers the original placement
        let recovered = apply_field_mappings(&swapped, &swap).unwrap();
        assert_eq!(recovered, input);
    }

    #[test]
    fn test_default_used_for_unresolved_source() {
        let with_default = FieldMapping {
            source: "missing".to_string(),
            target: "channel".to_string(),
            transform: None,
            default: Some(json!("MOBILE")),
        };
        let without_default = mapping("also_missing", "ignored");

        let output =
            apply_field_mappings(&Payload::empty(), &[with_default, without_default]).unwrap();

        assert_eq!(output.get_str("channel").unwrap(), "MOBILE");
        assert!(output.get_path("ignored").is_none());
    }

    #[test]
    fn test_string_transforms() {
        let cases: Vec<(TransformFn, Value, Value)> = vec![
            (TransformFn::Uppercase, json!("ada"), json!("ADA")),
            (TransformFn::Lowercase, json!("ADA"), json!("ada")),
            (TransformFn::Trim, json!("  x  "), json!("x")),
            (
                TransformFn::PadLeft {
                    width: 5,
                    fill: '0',
                },
                json!("42"),
                json!("00042"),
            ),
            (
                TransformFn::PadRight {
                    width: 4,
                    fill: ' ',
                },
                json!("ab"),
                json!("ab  "),
            ),
            (
                TransformFn::Substring { start: 2, len: 3 },
                json!("0044123"),
                json!("441"),
            ),
            (
                TransformFn::RegexReplace {
                    pattern: "[^0-9]".to_string(),
                    replacement: "".to_string(),
                },
                json!("+234-801"),
                json!("234801"),
            ),
            (
                TransformFn::Constant {
                    value: json!("FIXED"),
                },
                json!("anything"),
                json!("FIXED"),
            ),
        ];

        for (transform, input, expected) in cases {
            assert_eq!(apply_transform(&transform, input).unwrap(), expected);
        }
    }

    #[test]
    fn test_numeric_format() {
        assert_eq!(
            apply_transform(&TransformFn::NumericFormat { scale: 2 }, json!(12.5)).unwrap(),
            json!("12.50")
        );
        assert_eq!(
            apply_transform(&TransformFn::NumericFormat { scale: 0 }, json!("7.8")).unwrap(),
            json!("8")
        );
        // Non-numeric values pass through
        assert_eq!(
            apply_transform(&TransformFn::NumericFormat { scale: 2 }, json!("abc")).unwrap(),
            json!("abc")
        );
    }

    #[test]
    fn test_date_format() {
        let transform = TransformFn::DateFormat {
            from: "%Y-%m-%d".to_string(),
            to: "%d/%m/%Y".to_string(),
        };
        assert_eq!(
            apply_transform(&transform, json!("2024-03-15")).unwrap(),
            json!("15/03/2024")
        );
        // Unparseable dates are left unchanged
        assert_eq!(
            apply_transform(&transform, json!("not-a-date")).unwrap(),
            json!("not-a-date")
        );
    }

    #[test]
    fn test_malformed_replace_pattern_leaves_value() {
        let transform = TransformFn::RegexReplace {
            pattern: "(bad".to_string(),
            replacement: "x".to_string(),
        };
        assert_eq!(
            apply_transform(&transform, json!("value")).unwrap(),
            json!("value")
        );
    }

    #[test]
    fn test_non_string_passthrough() {
        assert_eq!(
            apply_transform(&TransformFn::Uppercase, json!({"nested": true})).unwrap(),
            json!({"nested": true})
        );
        // Numbers are stringified for string transforms
        assert_eq!(
            apply_transform(
                &TransformFn::PadLeft {
                    width: 4,
                    fill: '0'
                },
                json!(7)
            )
            .unwrap(),
            json!("0007")
        );
    }

    #[test]
    fn test_ops() {
        let mut payload = Payload::new(json!({"a": "x", "drop": 1}));

        apply_ops(
            &mut payload,
            &[
                TransformOp::Set {
                    path: "channel".to_string(),
                    value: json!("WEB"),
                },
                TransformOp::Copy {
                    from: "a".to_string(),
                    to: "b".to_string(),
                },
                TransformOp::Delete {
                    path: "drop".to_string(),
                },
                TransformOp::Derive {
                    from: "a".to_string(),
                    to: "a_upper".to_string(),
                    transform: TransformFn::Uppercase,
                },
            ],
        )
        .unwrap();

        assert_eq!(payload.get_str("channel").unwrap(), "WEB");
        assert_eq!(payload.get_str("b").unwrap(), "x");
        assert!(payload.get_path("drop").is_none());
        assert_eq!(payload.get_str("a_upper").unwrap(), "X");
    }
}
