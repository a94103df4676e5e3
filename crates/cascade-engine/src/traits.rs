//! Collaborator seams: catalog snapshots, credential resolution, audit.
//!
//! These traits are the engine's view of the outside world. The transport
//! layer wires real implementations; the `Static*`/`Memory*` types here are
//! the in-memory versions used by tests and standalone embedding.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use tokio::sync::RwLock;

use cascade_core::{AgentId, EngineError};

use crate::audit::AuditEvent;

// ============================================================================
// CATALOG PROVIDER
// ============================================================================

/// One endpoint of an allow-listed API host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EndpointSpec {
    pub method: String,
    pub path: String,
}

/// The slice of the catalog one agent is allowed to use.
#[derive(Debug, Clone, Default)]
pub struct AllowedCatalog {
    /// Operation kind names the agent may execute.
    pub operation_kinds: HashSet<String>,
    /// Allow-listed API hosts. An empty endpoint list means the whole host
    /// is allowed; a non-empty list drives endpoint warnings.
    pub apis: HashMap<String, Vec<EndpointSpec>>,
    /// Credential grants, by id.
    pub credentials: HashMap<String, CredentialType>,
}

impl AllowedCatalog {
    pub fn allows_kind(&self, kind: &str) -> bool {
        self.operation_kinds.contains(kind)
    }

    pub fn allows_host(&self, host: &str) -> bool {
        self.apis.contains_key(host)
    }

    pub fn allows_credential(&self, id: &str) -> bool {
        self.credentials.contains_key(id)
    }
}

/// Read-only source of per-agent catalog snapshots.
#[async_trait]
pub trait CatalogProvider: Send + Sync {
    async fn allowed_catalog(&self, agent: &AgentId) -> Result<AllowedCatalog, EngineError>;
}

/// In-memory provider backed by a per-agent table. Unknown agents get an
/// empty catalog, which the permission phase then rejects.
#[derive(Debug, Default)]
pub struct StaticCatalogProvider {
    agents: RwLock<HashMap<AgentId, AllowedCatalog>>,
}

impl StaticCatalogProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn grant(&self, agent: impl Into<AgentId>, catalog: AllowedCatalog) {
        self.agents.write().await.insert(agent.into(), catalog);
    }
}

#[async_trait]
impl CatalogProvider for StaticCatalogProvider {
    async fn allowed_catalog(&self, agent: &AgentId) -> Result<AllowedCatalog, EngineError> {
        Ok(self
            .agents
            .read()
            .await
            .get(agent)
            .cloned()
            .unwrap_or_default())
    }
}

// ============================================================================
// CREDENTIALS
// ============================================================================

/// How a resolved credential is formatted before injection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum CredentialType {
    BearerToken,
    ApiKey,
    Other(String),
}

impl CredentialType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::BearerToken => "bearer-token",
            Self::ApiKey => "api-key",
            Self::Other(s) => s,
        }
    }

    /// Apply the type's formatting rule to the raw value.
    pub fn format_value(&self, value: &str) -> String {
        match self {
            Self::BearerToken => format!("Bearer {value}"),
            Self::ApiKey | Self::Other(_) => value.to_string(),
        }
    }
}

impl From<String> for CredentialType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "bearer-token" => Self::BearerToken,
            "api-key" => Self::ApiKey,
            _ => Self::Other(s),
        }
    }
}

impl From<CredentialType> for String {
    fn from(t: CredentialType) -> Self {
        t.as_str().to_string()
    }
}

/// A secret value that never prints itself.
#[derive(Clone)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The plaintext. Callers are responsible for keeping it out of logs,
    /// cache keys and responses.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret(<redacted>)")
    }
}

/// A resolved credential: the plaintext plus its formatting rule.
#[derive(Debug, Clone)]
pub struct Credential {
    pub value: Secret,
    pub kind: CredentialType,
}

impl Credential {
    pub fn new(value: impl Into<String>, kind: CredentialType) -> Self {
        Self {
            value: Secret::new(value),
            kind,
        }
    }

    /// The injected string form.
    pub fn formatted(&self) -> String {
        self.kind.format_value(self.value.expose())
    }
}

/// Maps credential ids to plaintext values. Called only from inside the
/// executor; never exposed to agents.
#[async_trait]
pub trait CredentialResolver: Send + Sync {
    async fn resolve(&self, id: &str) -> Result<Credential, EngineError>;
}

/// In-memory resolver for tests and embedding.
#[derive(Debug, Default)]
pub struct StaticCredentialResolver {
    credentials: RwLock<HashMap<String, Credential>>,
}

impl StaticCredentialResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, id: impl Into<String>, credential: Credential) {
        self.credentials.write().await.insert(id.into(), credential);
    }
}

#[async_trait]
impl CredentialResolver for StaticCredentialResolver {
    async fn resolve(&self, id: &str) -> Result<Credential, EngineError> {
        self.credentials
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::Authorization(format!("unknown credential: {id}")))
    }
}

// ============================================================================
// AUDIT SINK
// ============================================================================

/// Append-only audit sink. `append` is atomic and preserves per-execution
/// event order; the engine never reads events back.
pub trait AuditSink: Send + Sync {
    fn append(&self, event: AuditEvent);
}
