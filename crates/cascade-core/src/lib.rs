//! # cascade-core
//!
//! Core building blocks for the cascade workflow engine:
//! - [`types`] - agent, operation and execution identifiers plus status enums
//! - [`error`] - the engine-wide error taxonomy and sanitized wire reports
//! - [`config`] - engine configuration with serde defaults
//! - [`path`] - the slash-path grammar and argument reference resolution
//! - [`data_model`] - the execution-local JSON tree
//! - [`message`] - the JSONL workflow wire format and parser

pub mod config;
pub mod data_model;
pub mod error;
pub mod message;
pub mod path;
pub mod types;

pub use config::{
    AgentRateLimits, CacheConfig, EngineConfig, ExecutionLimits, RateLimitConfig, ResponseConfig,
    RetryConfig,
};
pub use data_model::DataModel;
pub use error::{EngineError, ErrorCategory, ErrorReport, Issue, IssueCategory, IssueSeverity};
pub use message::{hash_hex, parse_workflow, OperationDef, ParsedWorkflow, MAX_LINE_BYTES};
pub use path::{collect_references, is_credential_ref, resolve_references, DataPath, PathSegment};
pub use types::{AgentId, ExecutionId, ExecutionStatus, OperationId, OperationStatus};
