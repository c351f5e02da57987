//! Value semantics shared by the evaluator and the engine.
//!
//! Rows are flat maps keyed `alias.field`; values are JSON. Truthiness,
//! canonical serialization, ordering, and the longest-prefix field walk
//! all live here.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use icu_collator::{Collator, CollatorOptions};
use serde_json::Value;

/// One row of the in-memory model. Keys are fully qualified as
/// `alias.field`; BTreeMap keeps canonical serialization stable.
pub type Row = BTreeMap<String, Value>;

/// `null`, `0`, `""`, and `false` are falsy; everything else is truthy.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Canonical serialization — object keys are already sorted because
/// `serde_json::Map` is ordered by key.
pub fn canonical(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_default()
}

/// Canonical serialization of a row.
pub fn canonical_row(row: &Row) -> String {
    serde_json::to_string(row).unwrap_or_default()
}

/// Numeric view of a value, if it has one.
pub fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

/// Loose equality: numbers compare numerically, everything else
/// structurally.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (as_number(a), as_number(b)) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

thread_local! {
    /// The per-thread root-locale collator for string ordering. `Collator`
    /// is not `Sync`, so it cannot live in a shared `static`.
    static COLLATOR: Collator = Collator::try_new(&Default::default(), CollatorOptions::new())
        .expect("root collation data is compiled in");
}

/// Ordering between two non-null values. Strings compare by locale-aware
/// collation order; `None` when the pair is not comparable (mixed types).
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(_), Value::Number(_)) => {
            as_number(a)?.partial_cmp(&as_number(b)?)
        }
        (Value::String(x), Value::String(y)) => {
            Some(COLLATOR.with(|c| c.compare(x, y)))
        }
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// Render a scalar for string contexts (`concat`, parameter reads).
pub fn to_display_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Wrap an f64 back into a JSON number, preferring integers when exact.
pub fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.is_finite() && n.abs() < i64::MAX as f64 {
        Value::Number((n as i64).into())
    } else {
        serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

/// Resolve a qualified field against a row using the longest-prefix
/// strategy: progressively longer flat keys are tried before descending
/// into nested objects, which is what permits dotted field names inside
/// records.
pub fn lookup_field(row: &Row, alias: &str, field_path: &str) -> Value {
    let segments: Vec<&str> = field_path.split('.').collect();
    for take in (1..=segments.len()).rev() {
        let key = format!("{alias}.{}", segments[..take].join("."));
        if let Some(value) = row.get(&key) {
            if take == segments.len() {
                return value.clone();
            }
            return lookup_nested(value, &segments[take..]);
        }
    }
    Value::Null
}

fn lookup_nested(value: &Value, segments: &[&str]) -> Value {
    if segments.is_empty() {
        return value.clone();
    }
    let Value::Object(map) = value else {
        return Value::Null;
    };
    for take in (1..=segments.len()).rev() {
        let key = segments[..take].join(".");
        if let Some(inner) = map.get(&key) {
            if take == segments.len() {
                return inner.clone();
            }
            return lookup_nested(inner, &segments[take..]);
        }
    }
    Value::Null
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn truthiness_table() {
        assert!(!is_truthy(&Value::Null));
        assert!(!is_truthy(&json!(false)));
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&json!(0.0)));
        assert!(!is_truthy(&json!("")));
        assert!(is_truthy(&json!(true)));
        assert!(is_truthy(&json!(-1)));
        assert!(is_truthy(&json!("x")));
        assert!(is_truthy(&json!([])));
        assert!(is_truthy(&json!({})));
    }

    #[test]
    fn numbers_compare_across_representations() {
        assert!(values_equal(&json!(1), &json!(1.0)));
        assert_eq!(compare_values(&json!(2), &json!(10)), Some(Ordering::Less));
        assert_eq!(
            compare_values(&json!(2.5), &json!(2)),
            Some(Ordering::Greater)
        );
    }

    #[test]
    fn mixed_types_are_incomparable() {
        assert_eq!(compare_values(&json!("a"), &json!(1)), None);
        assert!(!values_equal(&json!("1"), &json!(1)));
    }

    #[test]
    fn strings_compare_by_collation_not_code_points() {
        // Code-point order would put "B" (0x42) before "a" (0x61).
        assert_eq!(
            compare_values(&json!("a"), &json!("B")),
            Some(Ordering::Less)
        );
        // ...and "é" (0xE9) after "z" (0x7A).
        assert_eq!(
            compare_values(&json!("é"), &json!("z")),
            Some(Ordering::Less)
        );
        assert_eq!(
            compare_values(&json!("avast"), &json!("avast")),
            Some(Ordering::Equal)
        );
    }

    #[test]
    fn number_value_prefers_integers() {
        assert_eq!(number_value(3.0), json!(3));
        assert_eq!(number_value(3.5), json!(3.5));
    }

    #[test]
    fn lookup_flat_key() {
        let mut row = Row::new();
        row.insert("a.name".to_string(), json!("avast"));
        assert_eq!(lookup_field(&row, "a", "name"), json!("avast"));
        assert_eq!(lookup_field(&row, "a", "missing"), Value::Null);
        assert_eq!(lookup_field(&row, "b", "name"), Value::Null);
    }

    #[test]
    fn lookup_descends_into_nested_objects() {
        let mut row = Row::new();
        row.insert("a.author".to_string(), json!({"handle": "alice"}));
        assert_eq!(lookup_field(&row, "a", "author.handle"), json!("alice"));
        assert_eq!(lookup_field(&row, "a", "author.missing"), Value::Null);
    }

    #[test]
    fn lookup_prefers_longest_prefix() {
        // A record with a literal dotted field name must win over the
        // nested interpretation.
        let mut row = Row::new();
        row.insert("a.author.handle".to_string(), json!("flat"));
        row.insert("a.author".to_string(), json!({"handle": "nested"}));
        assert_eq!(lookup_field(&row, "a", "author.handle"), json!("flat"));
    }

    #[test]
    fn lookup_dotted_key_inside_record() {
        let mut row = Row::new();
        row.insert("a.meta".to_string(), json!({"app.avaast.tag": "v1"}));
        assert_eq!(lookup_field(&row, "a", "meta.app.avaast.tag"), json!("v1"));
    }

    #[test]
    fn canonical_is_key_sorted() {
        let a: Value = serde_json::from_str(r#"{"b":1,"a":2}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"a":2,"b":1}"#).unwrap();
        assert_eq!(canonical(&a), canonical(&b));
    }
}
