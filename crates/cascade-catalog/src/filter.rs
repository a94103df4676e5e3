//! `FilterData` - retain array elements matching every condition.

use serde_json::Value;

use cascade_core::EngineError;

use crate::args::{FilterCondition, FilterOp};

/// Apply `conditions` to an array. Elements survive only when every
/// condition is true; a missing field fails the condition. An empty
/// condition list is the identity.
pub fn apply_filter(data: &Value, conditions: &[FilterCondition]) -> Result<Value, EngineError> {
    let items = data.as_array().ok_or_else(|| EngineError::Data {
        path: String::new(),
        message: format!("FilterData requires an array input, got {}", type_name(data)),
    })?;

    let kept: Vec<Value> = items
        .iter()
        .filter(|item| conditions.iter().all(|c| matches(item, c)))
        .cloned()
        .collect();

    Ok(Value::Array(kept))
}

fn matches(item: &Value, condition: &FilterCondition) -> bool {
    let field = item.get(&condition.field);
    let expected = &condition.value;

    match condition.operator {
        FilterOp::Eq => field == Some(expected),
        FilterOp::Ne => field != Some(expected),
        FilterOp::Gt => compare(field, expected).is_some_and(|o| o.is_gt()),
        FilterOp::Lt => compare(field, expected).is_some_and(|o| o.is_lt()),
        FilterOp::Ge => compare(field, expected).is_some_and(|o| o.is_ge()),
        FilterOp::Le => compare(field, expected).is_some_and(|o| o.is_le()),
        FilterOp::In => expected
            .as_array()
            .is_some_and(|set| field.is_some_and(|v| set.contains(v))),
        FilterOp::Contains => match field {
            Some(Value::String(s)) => expected.as_str().is_some_and(|sub| s.contains(sub)),
            Some(Value::Array(items)) => items.contains(expected),
            _ => false,
        },
        FilterOp::StartsWith => string_pair(field, expected)
            .is_some_and(|(s, prefix)| s.starts_with(prefix)),
        FilterOp::EndsWith => string_pair(field, expected)
            .is_some_and(|(s, suffix)| s.ends_with(suffix)),
    }
}

fn string_pair<'a>(field: Option<&'a Value>, expected: &'a Value) -> Option<(&'a str, &'a str)> {
    Some((field?.as_str()?, expected.as_str()?))
}

/// Ordering between two JSON values: numbers numerically, strings
/// lexicographically, anything else unordered.
pub(crate) fn compare(left: Option<&Value>, right: &Value) -> Option<std::cmp::Ordering> {
    match (left?, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.as_str().cmp(b.as_str())),
        _ => None,
    }
}

pub(crate) fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
