//! Audit trail event types and sanitization.
//!
//! Events carry timestamps, ids, durations and sanitized argument digests.
//! Credential plaintext never appears in an event: argument trees are
//! scrubbed before digesting, and `CredentialUsed` names the credential id
//! and type only.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Mutex;

use cascade_core::{hash_hex, AgentId, ExecutionId, ExecutionStatus, OperationId, OperationStatus};

use crate::traits::AuditSink;

/// Placeholder written over redacted values.
pub const REDACTED: &str = "<redacted>";

/// Audit event payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum AuditEventKind {
    #[serde(rename_all = "camelCase")]
    ExecutionStarted {
        agent_id: AgentId,
        workflow_hash: String,
        operation_count: usize,
    },
    #[serde(rename_all = "camelCase")]
    ExecutionFinished {
        status: ExecutionStatus,
        duration_ms: u64,
        operations_succeeded: usize,
        operations_failed: usize,
        operations_skipped: usize,
    },
    #[serde(rename_all = "camelCase")]
    OperationStarted {
        operation_id: OperationId,
        kind: String,
        args_digest: String,
    },
    #[serde(rename_all = "camelCase")]
    OperationFinished {
        operation_id: OperationId,
        status: OperationStatus,
        duration_ms: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    CredentialUsed {
        operation_id: OperationId,
        credential_id: String,
        credential_type: String,
        context: String,
    },
}

/// A timestamped audit event, grouped by execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    pub execution_id: ExecutionId,
    #[serde(flatten)]
    pub kind: AuditEventKind,
}

impl AuditEvent {
    pub fn new(execution_id: ExecutionId, kind: AuditEventKind) -> Self {
        Self {
            timestamp: Utc::now(),
            execution_id,
            kind,
        }
    }

    pub fn execution_started(
        execution_id: &ExecutionId,
        agent_id: &AgentId,
        workflow_hash: &str,
        operation_count: usize,
    ) -> Self {
        Self::new(
            execution_id.clone(),
            AuditEventKind::ExecutionStarted {
                agent_id: agent_id.clone(),
                workflow_hash: workflow_hash.to_string(),
                operation_count,
            },
        )
    }

    pub fn execution_finished(
        execution_id: &ExecutionId,
        status: ExecutionStatus,
        duration_ms: u64,
        succeeded: usize,
        failed: usize,
        skipped: usize,
    ) -> Self {
        Self::new(
            execution_id.clone(),
            AuditEventKind::ExecutionFinished {
                status,
                duration_ms,
                operations_succeeded: succeeded,
                operations_failed: failed,
                operations_skipped: skipped,
            },
        )
    }

    pub fn operation_started(
        execution_id: &ExecutionId,
        operation_id: &OperationId,
        kind: &str,
        args: &Value,
    ) -> Self {
        Self::new(
            execution_id.clone(),
            AuditEventKind::OperationStarted {
                operation_id: operation_id.clone(),
                kind: kind.to_string(),
                args_digest: args_digest(args),
            },
        )
    }

    pub fn operation_finished(
        execution_id: &ExecutionId,
        operation_id: &OperationId,
        status: OperationStatus,
        duration_ms: u64,
        error: Option<String>,
    ) -> Self {
        Self::new(
            execution_id.clone(),
            AuditEventKind::OperationFinished {
                operation_id: operation_id.clone(),
                status,
                duration_ms,
                error,
            },
        )
    }

    pub fn credential_used(
        execution_id: &ExecutionId,
        operation_id: &OperationId,
        credential_id: &str,
        credential_type: &str,
        context: &str,
    ) -> Self {
        Self::new(
            execution_id.clone(),
            AuditEventKind::CredentialUsed {
                operation_id: operation_id.clone(),
                credential_id: credential_id.to_string(),
                credential_type: credential_type.to_string(),
                context: context.to_string(),
            },
        )
    }
}

// ============================================================================
// SANITIZATION
// ============================================================================

/// Header keys whose values are always scrubbed.
fn is_sensitive_key(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    key.contains("authorization")
        || key.contains("token")
        || key.contains("secret")
        || key.contains("password")
        || key == "x-api-key"
        || key == "apikey"
}

/// Replace credential markers and authorization-like header values with the
/// redaction placeholder.
pub fn sanitize_args(args: &Value) -> Value {
    sanitize_inner(args, false)
}

fn sanitize_inner(value: &Value, in_headers: bool) -> Value {
    if cascade_core::is_credential_ref(value) {
        return Value::String(REDACTED.to_string());
    }
    match value {
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (key, child) in map {
                let scrub = in_headers && is_sensitive_key(key);
                let sanitized = if scrub && !child.is_object() && !child.is_array() {
                    Value::String(REDACTED.to_string())
                } else {
                    sanitize_inner(child, in_headers || key == "headers")
                };
                out.insert(key.clone(), sanitized);
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| sanitize_inner(item, in_headers))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// SHA-256 hex over the sanitized canonical form of `args`.
pub fn args_digest(args: &Value) -> String {
    hash_hex(crate::cache::canonical_json(&sanitize_args(args)).as_bytes())
}

// ============================================================================
// IN-MEMORY SINK
// ============================================================================

/// Records events in arrival order. The default sink for tests and
/// standalone embedding.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().expect("audit sink lock").clone()
    }

    pub fn for_execution(&self, execution_id: &ExecutionId) -> Vec<AuditEvent> {
        self.events()
            .into_iter()
            .filter(|e| &e.execution_id == execution_id)
            .collect()
    }
}

impl AuditSink for MemoryAuditSink {
    fn append(&self, event: AuditEvent) {
        self.events.lock().expect("audit sink lock").push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sanitize_credential_refs_and_auth_headers() {
        let args = json!({
            "url": "https://api.example.com/users",
            "headers": {
                "Authorization": {"credentialRef": {"id": "github"}},
                "X-Api-Key": "plaintext-key",
                "Accept": "application/json",
            },
            "body": {"note": "visible"},
        });
        let sanitized = sanitize_args(&args);
        assert_eq!(sanitized["headers"]["Authorization"], REDACTED);
        assert_eq!(sanitized["headers"]["X-Api-Key"], REDACTED);
        assert_eq!(sanitized["headers"]["Accept"], "application/json");
        assert_eq!(sanitized["body"]["note"], "visible");
    }

    #[test]
    fn test_digest_is_stable_and_secret_free() {
        let args = json!({"headers": {"Authorization": "Bearer real-secret"}});
        let digest = args_digest(&args);
        assert_eq!(digest.len(), 64);
        assert_eq!(digest, args_digest(&args));
        // the digest of redacted args equals the digest with any other secret
        let other = json!({"headers": {"Authorization": "Bearer other-secret"}});
        assert_eq!(digest, args_digest(&other));
    }

    #[test]
    fn test_memory_sink_preserves_order() {
        let sink = MemoryAuditSink::new();
        let exec = ExecutionId::new("e1");
        sink.append(AuditEvent::execution_started(
            &exec,
            &AgentId::new("a"),
            "hash",
            2,
        ));
        sink.append(AuditEvent::operation_started(
            &exec,
            &OperationId::new("op"),
            "Wait",
            &json!({"duration": 0}),
        ));
        let events = sink.for_execution(&exec);
        assert_eq!(events.len(), 2);
        assert!(matches!(
            events[0].kind,
            AuditEventKind::ExecutionStarted { .. }
        ));
    }

    #[test]
    fn test_event_wire_shape() {
        let event = AuditEvent::credential_used(
            &ExecutionId::new("e1"),
            &OperationId::new("fetch"),
            "github",
            "bearer-token",
            "Authorization header",
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "credentialUsed");
        assert_eq!(json["credentialId"], "github");
        assert_eq!(json["executionId"], "e1");
    }
}
