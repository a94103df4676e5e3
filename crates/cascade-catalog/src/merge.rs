//! `MergeData` - combine two or more sources.

use serde_json::{Map, Value};

use cascade_core::EngineError;

use crate::args::MergeStrategy;
use crate::filter::type_name;

/// Merge `sources` (already read from the data model, in declaration order)
/// under the given strategy. `union` and `intersect` treat elements by deep
/// equality and preserve first-occurrence order; `deepMerge` folds objects
/// left to right with right precedence.
pub fn apply_merge(sources: &[Value], strategy: MergeStrategy) -> Result<Value, EngineError> {
    match strategy {
        MergeStrategy::Concat => {
            let mut out = Vec::new();
            for source in sources {
                out.extend(as_array(source)?.iter().cloned());
            }
            Ok(Value::Array(out))
        }
        MergeStrategy::Union => {
            let mut out: Vec<Value> = Vec::new();
            for source in sources {
                for item in as_array(source)? {
                    if !out.contains(item) {
                        out.push(item.clone());
                    }
                }
            }
            Ok(Value::Array(out))
        }
        MergeStrategy::Intersect => {
            let (first, rest) = sources.split_first().ok_or_else(|| {
                EngineError::Validation("MergeData requires at least two sources".into())
            })?;
            let rest: Vec<&Vec<Value>> = rest
                .iter()
                .map(as_array)
                .collect::<Result<_, _>>()?;
            let mut out: Vec<Value> = Vec::new();
            for item in as_array(first)? {
                if out.contains(item) {
                    continue;
                }
                if rest.iter().all(|items| items.contains(item)) {
                    out.push(item.clone());
                }
            }
            Ok(Value::Array(out))
        }
        MergeStrategy::DeepMerge => {
            let mut out = Map::new();
            for source in sources {
                let map = source.as_object().ok_or_else(|| EngineError::Data {
                    path: String::new(),
                    message: format!(
                        "deepMerge requires object sources, got {}",
                        type_name(source)
                    ),
                })?;
                deep_merge_into(&mut out, map);
            }
            Ok(Value::Object(out))
        }
    }
}

fn as_array(value: &Value) -> Result<&Vec<Value>, EngineError> {
    value.as_array().ok_or_else(|| EngineError::Data {
        path: String::new(),
        message: format!("merge requires array sources, got {}", type_name(value)),
    })
}

fn deep_merge_into(target: &mut Map<String, Value>, overlay: &Map<String, Value>) {
    for (key, value) in overlay {
        match (target.get_mut(key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                deep_merge_into(existing, incoming);
            }
            _ => {
                target.insert(key.clone(), value.clone());
            }
        }
    }
}
