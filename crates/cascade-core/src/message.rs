//! Workflow wire format: JSON Lines message stream.
//!
//! One message per line, UTF-8, at most [`MAX_LINE_BYTES`] per line, empty
//! lines ignored. Two message kinds:
//!
//! ```text
//! {"type":"operationUpdate","operationId":"a","operation":{"ApiCall":{...}}}
//! {"type":"beginExecution","executionId":"e1","operationOrder":["a"]}
//! ```
//!
//! `operation` carries exactly one top-level key naming the catalog kind;
//! its value is the argument payload. Redefining an `operationId` replaces
//! the earlier definition but keeps its first-seen position. The stream ends
//! with exactly one `beginExecution`.

use indexmap::IndexMap;
use serde::Deserialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::error::{Issue, IssueCategory};
use crate::types::{ExecutionId, OperationId};

/// Maximum accepted line length.
pub const MAX_LINE_BYTES: usize = 256 * 1024;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum WorkflowMessage {
    #[serde(rename_all = "camelCase")]
    OperationUpdate {
        operation_id: String,
        operation: Map<String, Value>,
    },
    #[serde(rename_all = "camelCase")]
    BeginExecution {
        execution_id: String,
        operation_order: Vec<String>,
    },
}

/// One operation definition from the stream.
#[derive(Debug, Clone)]
pub struct OperationDef {
    pub id: OperationId,
    /// Raw kind marker; checked against the catalog by the validator.
    pub kind: String,
    pub args: Value,
}

/// A fully parsed workflow, ready for validation.
#[derive(Debug)]
pub struct ParsedWorkflow {
    /// Definitions in first-seen order.
    pub operations: IndexMap<OperationId, OperationDef>,
    pub execution_id: ExecutionId,
    pub order: Vec<OperationId>,
    /// SHA-256 hex of the raw workflow bytes.
    pub workflow_hash: String,
}

impl ParsedWorkflow {
    pub fn get(&self, id: &OperationId) -> Option<&OperationDef> {
        self.operations.get(id)
    }
}

/// Parse a JSONL workflow stream. All structural findings are collected so
/// the caller sees every problem at once.
pub fn parse_workflow(bytes: &[u8]) -> Result<ParsedWorkflow, Vec<Issue>> {
    let structure = |message: String| Issue::error(IssueCategory::Structure, message);
    let mut issues = Vec::new();

    let text = match std::str::from_utf8(bytes) {
        Ok(text) => text,
        Err(e) => return Err(vec![structure(format!("workflow is not valid UTF-8: {e}"))]),
    };

    let mut operations: IndexMap<OperationId, OperationDef> = IndexMap::new();
    let mut begin: Option<(ExecutionId, Vec<OperationId>)> = None;

    for (line_no, line) in text.lines().enumerate() {
        let line_no = line_no + 1;
        if line.trim().is_empty() {
            continue;
        }
        if line.len() > MAX_LINE_BYTES {
            issues.push(structure(format!(
                "line {line_no} exceeds the {MAX_LINE_BYTES} byte limit"
            )));
            continue;
        }
        if begin.is_some() {
            issues.push(structure(format!(
                "line {line_no} appears after beginExecution; beginExecution must be last"
            )));
            continue;
        }

        let raw: Value = match serde_json::from_str(line) {
            Ok(raw) => raw,
            Err(e) => {
                issues.push(structure(format!("line {line_no} is not valid JSON: {e}")));
                continue;
            }
        };

        // The batched frame shape is recognized and rejected explicitly.
        if raw.get("operationUpdate").is_some() || raw.get("beginExecution").is_some() {
            issues.push(
                structure(format!(
                    "line {line_no} uses the batched message form, which is not accepted"
                ))
                .with_suggestion(
                    "Send one {\"type\":\"operationUpdate\",...} message per operation",
                ),
            );
            continue;
        }

        let message: WorkflowMessage = match serde_json::from_value(raw) {
            Ok(message) => message,
            Err(e) => {
                issues.push(structure(format!("line {line_no}: {e}")));
                continue;
            }
        };

        match message {
            WorkflowMessage::OperationUpdate {
                operation_id,
                operation,
            } => {
                if !OperationId::is_valid(&operation_id) {
                    issues.push(structure(format!(
                        "line {line_no}: operationId {operation_id:?} must match [A-Za-z0-9_-]{{1,100}}"
                    )));
                    continue;
                }
                if operation.len() != 1 {
                    issues.push(
                        structure(format!(
                            "line {line_no}: operation must have exactly one kind key, found {}",
                            operation.len()
                        ))
                        .for_operation(operation_id.as_str()),
                    );
                    continue;
                }
                let (kind, args) = operation.into_iter().next().expect("one entry");
                let id = OperationId::new(operation_id);
                operations.insert(
                    id.clone(),
                    OperationDef {
                        id,
                        kind,
                        args,
                    },
                );
            }
            WorkflowMessage::BeginExecution {
                execution_id,
                operation_order,
            } => {
                begin = Some((
                    ExecutionId::new(execution_id),
                    operation_order.into_iter().map(OperationId::new).collect(),
                ));
            }
        }
    }

    let Some((execution_id, order)) = begin else {
        issues.push(structure("workflow has no beginExecution message".into()));
        return Err(issues);
    };
    if operations.is_empty() {
        issues.push(structure("workflow contains no operations".into()));
    }
    if !issues.is_empty() {
        return Err(issues);
    }

    Ok(ParsedWorkflow {
        operations,
        execution_id,
        order,
        workflow_hash: hash_hex(bytes),
    })
}

/// Lowercase SHA-256 hex.
pub fn hash_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        use std::fmt::Write;
        let _ = write!(out, "{byte:02x}");
    }
    out
}
