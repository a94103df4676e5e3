//! # cascade-engine
//!
//! The cascade workflow execution engine: an agent submits a JSONL
//! workflow, the engine validates it against the agent's allowed catalog,
//! executes the operations sequentially with credential injection, rate
//! limiting, caching and retries, and returns a structured response while
//! recording an audit trail.
//!
//! ```rust,no_run
//! use cascade_core::AgentId;
//! use cascade_engine::{Engine, RunOutcome};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), cascade_core::EngineError> {
//! let engine = Engine::builder().build();
//! let workflow = br#"
//! {"type":"operationUpdate","operationId":"w","operation":{"Wait":{"duration":0}}}
//! {"type":"beginExecution","executionId":"e1","operationOrder":["w"]}
//! "#;
//! match engine.run(&AgentId::new("agent-1"), workflow, CancellationToken::new()).await? {
//!     RunOutcome::Invalid(report) => println!("rejected: {:?}", report.errors),
//!     RunOutcome::Completed(response) => println!("status: {}", response.status),
//! }
//! # Ok(())
//! # }
//! ```

pub mod audit;
pub mod cache;
pub mod executor;
pub mod rate_limit;
pub mod response;
pub mod retry;
pub mod traits;
pub mod validator;

pub use audit::{args_digest, sanitize_args, AuditEvent, AuditEventKind, MemoryAuditSink, REDACTED};
pub use cache::{cache_key, canonical_json, CacheStats, ResultCache};
pub use executor::{Engine, EngineBuilder, RunOutcome, CREDENTIAL_PLACEHOLDER};
pub use rate_limit::{RateLimitStatus, RateLimiter};
pub use response::{ExecutionResponse, OperationSummary, ResponseFormat};
pub use retry::RetryPolicy;
pub use traits::{
    AllowedCatalog, AuditSink, CatalogProvider, Credential, CredentialResolver, CredentialType,
    EndpointSpec, Secret, StaticCatalogProvider, StaticCredentialResolver,
};
pub use validator::{ValidationReport, Validator};
