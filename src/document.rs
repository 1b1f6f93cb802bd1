use std::cmp::Ordering;

use serde_json::Value;

use crate::Document;

/// Keys starting with `$` are selector operators, never field names.
pub(crate) fn is_operator(key: &str) -> bool {
    key.starts_with('$')
}

pub(crate) fn doc_id(doc: &Document) -> Option<i64> {
    doc.get("_id").and_then(Value::as_i64)
}

/// A document matches a selector when every non-operator key of the selector
/// is present in the document with a matching value. Operator keys at the
/// root ($top, $skip, $desc, ...) are windowing and ordering hints and do not
/// constrain the match.
pub fn matches(doc: &Document, selector: &Document) -> bool {
    selector
        .iter()
        .filter(|(key, _)| !is_operator(key))
        .all(|(key, expected)| match doc.get(key) {
            Some(actual) => value_matches(actual, expected),
            None => false,
        })
}

fn value_matches(actual: &Value, expected: &Value) -> bool {
    match expected {
        Value::Object(sub) if sub.is_empty() || sub.keys().any(|k| is_operator(k)) => {
            operators_match(actual, sub)
        }
        Value::Object(sub) => actual
            .as_object()
            .map_or(false, |nested| matches(nested, sub)),
        _ => values_equal(actual, expected),
    }
}

fn operators_match(actual: &Value, ops: &Document) -> bool {
    ops.iter().all(|(op, operand)| match op.as_str() {
        "$eq" => values_equal(actual, operand),
        "$gt" => compare(actual, operand) == Some(Ordering::Greater),
        "$gte" => matches!(
            compare(actual, operand),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        "$lt" => compare(actual, operand) == Some(Ordering::Less),
        "$lte" => matches!(
            compare(actual, operand),
            Some(Ordering::Less | Ordering::Equal)
        ),
        "$in" => operand
            .as_array()
            .map_or(false, |candidates| candidates.iter().any(|c| values_equal(actual, c))),
        // $head, $tail, $desc, $top and $skip shape the index view, not the match
        _ => true,
    })
}

/// Equality with numeric cross-type semantics: 1 and 1.0 are equal.
pub(crate) fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        _ => a == b,
    }
}

/// Ordering for range operators and in-memory sorts. Comparable pairs are
/// numbers (cross int/double), strings and booleans; everything else has no
/// ordering and fails the comparison.
pub(crate) fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// Overwrite keys from `updates` onto `old`: the update side wins, keys only
/// present in the old document are preserved.
pub fn merge(updates: &Document, old: &Document) -> Document {
    let mut merged = updates.clone();
    for (key, value) in old {
        merged.entry(key.clone()).or_insert_with(|| value.clone());
    }
    merged
}

/// Canonical string form of a value. Secondary index keys use this form and
/// order lexicographically on it.
pub fn canonical_string(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        Value::Array(_) | Value::Object(_) => value.to_string(),
    }
}
