//! Engine-wide error taxonomy.
//!
//! Every fault the engine can surface maps onto one variant here; the
//! variant name doubles as the machine-readable `type` tag on the wire.
//! [`EngineError::report`] produces the sanitized structure callers see:
//! status codes, hosts and field names survive, secrets and raw bodies do
//! not.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::types::OperationId;

/// Errors raised while parsing, validating or executing a workflow.
#[derive(Error, Debug, Clone)]
pub enum EngineError {
    /// Malformed input, rejected before validation.
    #[error("malformed workflow: {0}")]
    Structure(String),

    /// Schema, permission, dependency or type issue found by the validator.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Agent lacks permission for an operation, API host or credential.
    #[error("not permitted: {0}")]
    Authorization(String),

    /// Path not found or wrong JSON shape at runtime.
    #[error("data error at {path}: {message}")]
    Data { path: String, message: String },

    /// Connection or DNS failure reaching an external endpoint.
    #[error("network error: {0}")]
    Network(String),

    /// Per-operation timeout elapsed.
    #[error("operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// Non-2xx response from an external API.
    #[error("API responded with status {status}")]
    Api {
        status: u16,
        /// `Retry-After` signal in milliseconds, when the API sent one.
        retry_after_ms: Option<u64>,
    },

    /// A rate limit denied the operation. Never retried.
    #[error("rate limit exceeded: {message}")]
    RateLimit { message: String, retry_after_ms: u64 },

    /// A configured execution cap was exceeded.
    #[error("resource cap exceeded: {0}")]
    Resource(String),

    /// The caller cancelled the execution.
    #[error("execution cancelled")]
    Cancelled,

    /// Explicit retryable marker for faults outside the built-in classes.
    #[error("retryable fault: {0}")]
    Retryable(String),

    /// Catch-all for unexpected faults.
    #[error("execution error: {0}")]
    Execution(String),
}

/// Coarse category tags used on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Structure,
    Validation,
    Authorization,
    Data,
    Network,
    Api,
    RateLimit,
    Resource,
    Cancelled,
    Execution,
}

impl EngineError {
    /// Stable machine-readable type tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Structure(_) => "StructureError",
            Self::Validation(_) => "ValidationError",
            Self::Authorization(_) => "AuthorizationError",
            Self::Data { .. } => "DataError",
            Self::Network(_) => "NetworkError",
            Self::Timeout { .. } => "TimeoutError",
            Self::Api { .. } => "ApiError",
            Self::RateLimit { .. } => "RateLimitError",
            Self::Resource(_) => "ResourceError",
            Self::Cancelled => "CancellationError",
            Self::Retryable(_) => "RetryableError",
            Self::Execution(_) => "ExecutionError",
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Structure(_) => ErrorCategory::Structure,
            Self::Validation(_) => ErrorCategory::Validation,
            Self::Authorization(_) => ErrorCategory::Authorization,
            Self::Data { .. } => ErrorCategory::Data,
            Self::Network(_) | Self::Timeout { .. } => ErrorCategory::Network,
            Self::Api { .. } => ErrorCategory::Api,
            Self::RateLimit { .. } => ErrorCategory::RateLimit,
            Self::Resource(_) => ErrorCategory::Resource,
            Self::Cancelled => ErrorCategory::Cancelled,
            Self::Retryable(_) | Self::Execution(_) => ErrorCategory::Execution,
        }
    }

    /// Whether the retry layer may re-attempt an operation that failed with
    /// this error. `RateLimit` is deliberately terminal here.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(_) | Self::Timeout { .. } | Self::Retryable(_) => true,
            Self::Api { status, .. } => {
                matches!(status, 408 | 429) || (500..600).contains(status)
            }
            _ => false,
        }
    }

    /// Whether the caller could plausibly recover by changing the workflow
    /// or waiting.
    pub fn recoverable(&self) -> bool {
        match self {
            Self::Structure(_) | Self::Validation(_) | Self::Data { .. } => true,
            Self::Network(_) | Self::Timeout { .. } | Self::Retryable(_) => true,
            Self::RateLimit { .. } => true,
            Self::Api { status, .. } => *status < 500,
            Self::Authorization(_)
            | Self::Resource(_)
            | Self::Cancelled
            | Self::Execution(_) => false,
        }
    }

    /// Build the sanitized wire report for this error.
    pub fn report(&self, operation_id: Option<&OperationId>) -> ErrorReport {
        let mut context = Map::new();
        let mut suggestions = Vec::new();

        match self {
            Self::Data { path, .. } => {
                context.insert("path".into(), Value::String(path.clone()));
                suggestions
                    .push("Check that an earlier operation writes the referenced path".into());
            }
            Self::Timeout { timeout_ms } => {
                context.insert("timeoutMs".into(), Value::from(*timeout_ms));
                suggestions.push("Increase timeoutMs on the operation or retry later".into());
            }
            Self::Api {
                status,
                retry_after_ms,
            } => {
                context.insert("statusCode".into(), Value::from(*status));
                if let Some(ms) = retry_after_ms {
                    context.insert("retryAfterMs".into(), Value::from(*ms));
                }
                if (500..600).contains(status) {
                    suggestions.push("The upstream API failed; retrying may succeed".into());
                } else {
                    suggestions.push("Check the request arguments against the API contract".into());
                }
            }
            Self::RateLimit { retry_after_ms, .. } => {
                context.insert("retryAfterMs".into(), Value::from(*retry_after_ms));
                suggestions.push("Wait retryAfterMs before submitting another workflow".into());
            }
            Self::Authorization(_) => {
                suggestions.push("Request access to the operation, API or credential".into());
            }
            Self::Resource(_) => {
                suggestions.push("Split the workflow or reduce the data it accumulates".into());
            }
            Self::Network(_) => {
                suggestions.push("The endpoint was unreachable; retrying may succeed".into());
            }
            _ => {}
        }

        ErrorReport {
            kind: self.kind().to_string(),
            category: self.category(),
            message: self.to_string(),
            operation_id: operation_id.cloned(),
            recoverable: self.recoverable(),
            context,
            suggestions,
        }
    }
}

/// Sanitized, machine-readable error structure returned to callers.
///
/// No stack traces, no URLs with credentials, no raw response bodies.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorReport {
    #[serde(rename = "type")]
    pub kind: String,
    pub category: ErrorCategory,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation_id: Option<OperationId>,
    pub recoverable: bool,
    pub context: Map<String, Value>,
    pub suggestions: Vec<String>,
}

// ============================================================================
// VALIDATION ISSUES
// ============================================================================

/// Severity of a validation issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueSeverity {
    Error,
    Warning,
}

/// Which validation phase produced an issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueCategory {
    Structure,
    Permission,
    Dependency,
    Type,
}

/// A single finding from parsing or validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Issue {
    pub severity: IssueSeverity,
    pub category: IssueCategory,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation_id: Option<OperationId>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

impl Issue {
    pub fn error(category: IssueCategory, message: impl Into<String>) -> Self {
        Self {
            severity: IssueSeverity::Error,
            category,
            operation_id: None,
            message: message.into(),
            suggestion: None,
        }
    }

    pub fn warning(category: IssueCategory, message: impl Into<String>) -> Self {
        Self {
            severity: IssueSeverity::Warning,
            category,
            operation_id: None,
            message: message.into(),
            suggestion: None,
        }
    }

    pub fn for_operation(mut self, id: impl Into<OperationId>) -> Self {
        self.operation_id = Some(id.into());
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    pub fn is_error(&self) -> bool {
        self.severity == IssueSeverity::Error
    }
}
