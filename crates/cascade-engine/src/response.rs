//! Execution responses and the size-bounded data projection.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use cascade_core::{
    DataModel, ErrorReport, ExecutionId, ExecutionStatus, OperationStatus, ResponseConfig,
};

/// How much of the data model the caller gets back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseFormat {
    /// Long strings elided, long arrays truncated.
    #[default]
    Compact,
    /// Bit-exact data.
    Full,
}

/// Per-operation summary in the execution response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationSummary {
    pub status: OperationStatus,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorReport>,
}

/// The execution response shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResponse {
    pub execution_id: ExecutionId,
    pub status: ExecutionStatus,
    /// Keyed by operation id; BTreeMap keeps the serialized form
    /// deterministic.
    pub operations: BTreeMap<String, OperationSummary>,
    /// First-level data model entries keyed by their full path.
    pub data: Map<String, Value>,
    pub duration_ms: u64,
}

/// Project the data model into the response `data` map.
pub fn project_data(
    model: &DataModel,
    config: &ResponseConfig,
    format: ResponseFormat,
) -> Map<String, Value> {
    let mut out = Map::new();
    for (key, value) in model.entries() {
        let projected = match format {
            ResponseFormat::Full => value.clone(),
            ResponseFormat::Compact => project_value(value, config),
        };
        out.insert(format!("/workflow/{key}"), projected);
    }
    out
}

fn project_value(value: &Value, config: &ResponseConfig) -> Value {
    match value {
        Value::String(s) if s.len() > config.max_string_bytes => {
            Value::String(format!("<elided {} bytes>", s.len()))
        }
        Value::Array(items) => {
            let mut projected: Vec<Value> = items
                .iter()
                .take(config.max_array_items)
                .map(|item| project_value(item, config))
                .collect();
            if items.len() > config.max_array_items {
                projected.push(Value::String(format!("<truncated, {} total>", items.len())));
            }
            Value::Array(projected)
        }
        Value::Object(map) => {
            let mut projected = Map::with_capacity(map.len());
            for (key, child) in map {
                projected.insert(key.clone(), project_value(child, config));
            }
            Value::Object(projected)
        }
        other => other.clone(),
    }
}
