//! `TransformData` - the five transform families.
//!
//! Config shapes:
//! - `sort`: `{"field": "name", "order": "asc"|"desc"}` - stable sort;
//!   elements missing the field sort last regardless of direction.
//! - `group`: `{"field": "name"}` - object keyed by the stringified field
//!   value; elements missing the field group under `"null"`.
//! - `aggregate`: `{"field": "name", "function": "sum"|"min"|"max"|"avg"|"count"}`
//!   - emits a scalar; `count` ignores `field`.
//! - `select`: `{"fields": ["a", "b"]}` - project the listed fields.
//! - `map`: `{"fields": {"out": "in" | {"const": v}}}` - fixed per-field
//!   rewrites: rename/copy a source field or set a constant. No user
//!   expressions.

use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::cmp::Ordering;
use std::collections::BTreeMap;

use cascade_core::EngineError;

use crate::args::{TransformArgs, TransformKind};
use crate::filter::type_name;

pub fn apply_transform(data: &Value, args: &TransformArgs) -> Result<Value, EngineError> {
    let items = data.as_array().ok_or_else(|| EngineError::Data {
        path: args.input_path.clone(),
        message: format!(
            "TransformData requires an array input, got {}",
            type_name(data)
        ),
    })?;

    match args.transform {
        TransformKind::Sort => sort(items, &args.config),
        TransformKind::Group => group(items, &args.config),
        TransformKind::Aggregate => aggregate(items, &args.config),
        TransformKind::Select => select(items, &args.config),
        TransformKind::Map => map(items, &args.config),
    }
}

fn bad_config(transform: TransformKind, e: impl std::fmt::Display) -> EngineError {
    EngineError::Structure(format!("invalid {transform:?} transform config: {e}"))
}

#[derive(Deserialize)]
#[serde(rename_all = "lowercase")]
enum SortOrder {
    Asc,
    Desc,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct SortConfig {
    field: String,
    #[serde(default = "default_order")]
    order: SortOrder,
}

fn default_order() -> SortOrder {
    SortOrder::Asc
}

fn sort(items: &[Value], config: &Value) -> Result<Value, EngineError> {
    let config: SortConfig = serde_json::from_value(config.clone())
        .map_err(|e| bad_config(TransformKind::Sort, e))?;

    let mut out: Vec<Value> = items.to_vec();
    // Missing fields sort last; ties keep input order (sort_by is stable).
    out.sort_by(|a, b| {
        match (a.get(&config.field), b.get(&config.field)) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Greater,
            (Some(_), None) => Ordering::Less,
            (Some(left), Some(right)) => {
                let ordering = json_cmp(left, right);
                match config.order {
                    SortOrder::Asc => ordering,
                    SortOrder::Desc => ordering.reverse(),
                }
            }
        }
    });
    Ok(Value::Array(out))
}

/// Total order over JSON values so sorting never panics: numbers, then
/// strings, then booleans, then everything else by serialized form.
fn json_cmp(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)).then_with(|| a.to_string().cmp(&b.to_string())),
    }
}

fn rank(value: &Value) -> u8 {
    match value {
        Value::Number(_) => 0,
        Value::String(_) => 1,
        Value::Bool(_) => 2,
        Value::Null => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct GroupConfig {
    field: String,
}

fn group(items: &[Value], config: &Value) -> Result<Value, EngineError> {
    let config: GroupConfig = serde_json::from_value(config.clone())
        .map_err(|e| bad_config(TransformKind::Group, e))?;

    let mut groups: BTreeMap<String, Vec<Value>> = BTreeMap::new();
    for item in items {
        let key = match item.get(&config.field) {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => "null".to_string(),
        };
        groups.entry(key).or_default().push(item.clone());
    }

    let mut out = Map::new();
    for (key, members) in groups {
        out.insert(key, Value::Array(members));
    }
    Ok(Value::Object(out))
}

#[derive(Deserialize, Clone, Copy)]
#[serde(rename_all = "lowercase")]
enum AggregateFn {
    Sum,
    Min,
    Max,
    Avg,
    Count,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct AggregateConfig {
    #[serde(default)]
    field: Option<String>,
    function: AggregateFn,
}

fn aggregate(items: &[Value], config: &Value) -> Result<Value, EngineError> {
    let config: AggregateConfig = serde_json::from_value(config.clone())
        .map_err(|e| bad_config(TransformKind::Aggregate, e))?;

    if matches!(config.function, AggregateFn::Count) {
        return Ok(json!(items.len()));
    }

    let field = config.field.as_deref().ok_or_else(|| {
        bad_config(TransformKind::Aggregate, "missing field for numeric aggregate")
    })?;
    let numbers: Vec<f64> = items
        .iter()
        .filter_map(|item| item.get(field).and_then(Value::as_f64))
        .collect();

    let result = match config.function {
        AggregateFn::Sum => numbers.iter().sum::<f64>(),
        AggregateFn::Avg => {
            if numbers.is_empty() {
                0.0
            } else {
                numbers.iter().sum::<f64>() / numbers.len() as f64
            }
        }
        AggregateFn::Min => numbers.iter().copied().fold(f64::INFINITY, f64::min),
        AggregateFn::Max => numbers.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        AggregateFn::Count => unreachable!("handled above"),
    };

    if !result.is_finite() {
        return Err(EngineError::Data {
            path: field.to_string(),
            message: "aggregate over no numeric values".to_string(),
        });
    }
    Ok(json!(result))
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct SelectConfig {
    fields: Vec<String>,
}

fn select(items: &[Value], config: &Value) -> Result<Value, EngineError> {
    let config: SelectConfig = serde_json::from_value(config.clone())
        .map_err(|e| bad_config(TransformKind::Select, e))?;

    let out: Vec<Value> = items
        .iter()
        .map(|item| {
            let mut projected = Map::new();
            for field in &config.fields {
                if let Some(value) = item.get(field) {
                    projected.insert(field.clone(), value.clone());
                }
            }
            Value::Object(projected)
        })
        .collect();
    Ok(Value::Array(out))
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct MapConfig {
    fields: BTreeMap<String, MapRewrite>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum MapRewrite {
    /// Copy a source field under the new name.
    Source(String),
    /// Set a constant.
    Const {
        #[serde(rename = "const")]
        value: Value,
    },
}

fn map(items: &[Value], config: &Value) -> Result<Value, EngineError> {
    let config: MapConfig = serde_json::from_value(config.clone())
        .map_err(|e| bad_config(TransformKind::Map, e))?;

    let out: Vec<Value> = items
        .iter()
        .map(|item| {
            let mut rewritten = Map::new();
            for (target, rewrite) in &config.fields {
                let value = match rewrite {
                    MapRewrite::Source(source) => item.get(source).cloned(),
                    MapRewrite::Const { value } => Some(value.clone()),
                };
                if let Some(value) = value {
                    rewritten.insert(target.clone(), value);
                }
            }
            Value::Object(rewritten)
        })
        .collect();
    Ok(Value::Array(out))
}
