//! Typed argument shapes for the built-in operation kinds.
//!
//! Raw `operation` payloads are JSON; these structs are the schema. The
//! validator parses every definition through [`OperationArgs::parse`] so a
//! shape problem is a structure issue before anything runs, and the executor
//! parses again after reference resolution to get concrete values.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

use cascade_core::{is_credential_ref, DataPath, EngineError};

use crate::kind::{OperationKind, OutputType};

fn default_timeout_ms() -> u64 {
    30_000
}

/// HTTP methods accepted by `ApiCall`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HttpMethod {
    GET,
    POST,
    PUT,
    DELETE,
    PATCH,
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::GET => "GET",
            Self::POST => "POST",
            Self::PUT => "PUT",
            Self::DELETE => "DELETE",
            Self::PATCH => "PATCH",
        };
        write!(f, "{s}")
    }
}

/// `ApiCall` - perform an HTTP request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ApiCallArgs {
    pub method: HttpMethod,
    pub url: String,
    /// Header values may be strings or credential reference markers.
    #[serde(default)]
    pub headers: BTreeMap<String, Value>,
    #[serde(default)]
    pub body: Option<Value>,
    pub output_path: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

/// Comparison operators for `FilterData` conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterOp {
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = "in")]
    In,
    #[serde(rename = "contains")]
    Contains,
    #[serde(rename = "startsWith")]
    StartsWith,
    #[serde(rename = "endsWith")]
    EndsWith,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FilterCondition {
    pub field: String,
    #[serde(alias = "op")]
    pub operator: FilterOp,
    pub value: Value,
}

/// `FilterData` - keep array elements matching every condition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct FilterArgs {
    pub input_path: String,
    #[serde(default)]
    pub conditions: Vec<FilterCondition>,
    pub output_path: String,
}

/// Transform families for `TransformData`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransformKind {
    Map,
    Sort,
    Group,
    Aggregate,
    Select,
}

/// `TransformData` - apply a named transform. The `config` shape depends on
/// the transform; [`crate::transform`] documents each.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TransformArgs {
    pub input_path: String,
    pub transform: TransformKind,
    #[serde(default)]
    pub config: Value,
    pub output_path: String,
}

/// Condition operators for `Conditional`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionOp {
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = "exists")]
    Exists,
    #[serde(rename = "empty")]
    Empty,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConditionSpec {
    pub path: String,
    #[serde(alias = "op")]
    pub operator: ConditionOp,
    #[serde(default)]
    pub value: Option<Value>,
}

/// `Conditional` - gate operations elsewhere in the order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ConditionalArgs {
    pub condition: ConditionSpec,
    pub if_true: Vec<String>,
    #[serde(default)]
    pub if_false: Vec<String>,
}

/// `Loop` - run the listed operations once per input element.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LoopArgs {
    pub input_path: String,
    pub operations: Vec<String>,
    #[serde(default)]
    pub output_path: Option<String>,
}

/// Storage namespaces understood by `StoreData`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StorageBackend {
    LocalStorage,
    SessionStorage,
    File,
}

impl StorageBackend {
    pub fn namespace(&self) -> &'static str {
        match self {
            Self::LocalStorage => "localStorage",
            Self::SessionStorage => "sessionStorage",
            Self::File => "file",
        }
    }
}

/// `StoreData` - hand a value to the external storage backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct StoreArgs {
    pub input_path: String,
    pub storage: StorageBackend,
    pub key: String,
}

/// Longest accepted `Wait`, in milliseconds.
pub const MAX_WAIT_MS: u64 = 600_000;

/// `Wait` - suspend the execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WaitArgs {
    pub duration: u64,
}

/// Merge strategies for `MergeData`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MergeStrategy {
    Concat,
    Union,
    Intersect,
    DeepMerge,
}

/// `MergeData` - combine two or more sources.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct MergeArgs {
    pub sources: Vec<String>,
    pub strategy: MergeStrategy,
    pub output_path: String,
}

// ============================================================================
// UNIFIED VIEW
// ============================================================================

/// A kind-tagged, schema-checked argument payload.
#[derive(Debug, Clone)]
pub enum OperationArgs {
    ApiCall(ApiCallArgs),
    Filter(FilterArgs),
    Transform(TransformArgs),
    Conditional(ConditionalArgs),
    Loop(LoopArgs),
    Store(StoreArgs),
    Wait(WaitArgs),
    Merge(MergeArgs),
}

impl OperationArgs {
    /// Parse a raw payload against the schema of `kind`.
    pub fn parse(kind: OperationKind, args: &Value) -> Result<Self, EngineError> {
        let shape = |e: serde_json::Error| {
            EngineError::Structure(format!("invalid {kind} arguments: {e}"))
        };
        let parsed = match kind {
            OperationKind::ApiCall => Self::ApiCall(
                serde_json::from_value(args.clone()).map_err(shape)?,
            ),
            OperationKind::FilterData => {
                Self::Filter(serde_json::from_value(args.clone()).map_err(shape)?)
            }
            OperationKind::TransformData => {
                Self::Transform(serde_json::from_value(args.clone()).map_err(shape)?)
            }
            OperationKind::Conditional => {
                Self::Conditional(serde_json::from_value(args.clone()).map_err(shape)?)
            }
            OperationKind::Loop => {
                Self::Loop(serde_json::from_value(args.clone()).map_err(shape)?)
            }
            OperationKind::StoreData => {
                Self::Store(serde_json::from_value(args.clone()).map_err(shape)?)
            }
            OperationKind::Wait => {
                Self::Wait(serde_json::from_value(args.clone()).map_err(shape)?)
            }
            OperationKind::MergeData => {
                Self::Merge(serde_json::from_value(args.clone()).map_err(shape)?)
            }
        };
        Ok(parsed)
    }

    pub fn kind(&self) -> OperationKind {
        match self {
            Self::ApiCall(_) => OperationKind::ApiCall,
            Self::Filter(_) => OperationKind::FilterData,
            Self::Transform(_) => OperationKind::TransformData,
            Self::Conditional(_) => OperationKind::Conditional,
            Self::Loop(_) => OperationKind::Loop,
            Self::Store(_) => OperationKind::StoreData,
            Self::Wait(_) => OperationKind::Wait,
            Self::Merge(_) => OperationKind::MergeData,
        }
    }

    /// Where this operation writes its result, when it writes one.
    pub fn output_path(&self) -> Option<&str> {
        match self {
            Self::ApiCall(a) => Some(&a.output_path),
            Self::Filter(a) => Some(&a.output_path),
            Self::Transform(a) => Some(&a.output_path),
            Self::Merge(a) => Some(&a.output_path),
            Self::Loop(a) => a.output_path.as_deref(),
            Self::Conditional(_) | Self::Store(_) | Self::Wait(_) => None,
        }
    }

    /// Parsed output path, when one is declared.
    pub fn parsed_output_path(&self) -> Result<Option<DataPath>, EngineError> {
        self.output_path().map(DataPath::parse).transpose()
    }

    /// Declared output shape, consulted by the type validation phase.
    pub fn declared_output(&self) -> OutputType {
        match self {
            Self::ApiCall(_) => OutputType::Dynamic,
            Self::Filter(_) => OutputType::Array,
            Self::Transform(a) => match a.transform {
                TransformKind::Map | TransformKind::Sort | TransformKind::Select => {
                    OutputType::Array
                }
                TransformKind::Group => OutputType::Object,
                TransformKind::Aggregate => OutputType::Scalar,
            },
            Self::Merge(a) => match a.strategy {
                MergeStrategy::DeepMerge => OutputType::Object,
                _ => OutputType::Array,
            },
            Self::Loop(a) => {
                if a.output_path.is_some() {
                    OutputType::Array
                } else {
                    OutputType::None
                }
            }
            Self::Conditional(_) | Self::Store(_) | Self::Wait(_) => OutputType::None,
        }
    }

    /// Whether this concrete operation may be cached. Kind-level
    /// cacheability plus the `ApiCall` rule: GET only, and no credential
    /// reference hiding in the body.
    pub fn is_cacheable(&self) -> bool {
        if !self.kind().descriptor().cacheable {
            return false;
        }
        match self {
            Self::ApiCall(a) => {
                a.method == HttpMethod::GET
                    && !a.body.as_ref().is_some_and(contains_credential_ref)
            }
            _ => true,
        }
    }
}

fn contains_credential_ref(value: &Value) -> bool {
    if is_credential_ref(value) {
        return true;
    }
    match value {
        Value::Object(map) => map.values().any(contains_credential_ref),
        Value::Array(items) => items.iter().any(contains_credential_ref),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_api_call_defaults() {
        let args = OperationArgs::parse(
            OperationKind::ApiCall,
            &json!({"method":"GET","url":"https://api.example.com/u","outputPath":"/workflow/u"}),
        )
        .unwrap();
        let OperationArgs::ApiCall(a) = args else {
            panic!("wrong variant")
        };
        assert_eq!(a.timeout_ms, 30_000);
        assert!(a.headers.is_empty());
        assert!(a.body.is_none());
    }

    #[test]
    fn test_unknown_field_rejected() {
        let err = OperationArgs::parse(
            OperationKind::Wait,
            &json!({"duration": 5, "extra": true}),
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::Structure(_)));
    }

    #[test]
    fn test_filter_operator_aliases() {
        let condition: FilterCondition =
            serde_json::from_value(json!({"field":"points","op":">","value":100})).unwrap();
        assert_eq!(condition.operator, FilterOp::Gt);
        let condition: FilterCondition =
            serde_json::from_value(json!({"field":"points","operator":">=","value":100})).unwrap();
        assert_eq!(condition.operator, FilterOp::Ge);
    }

    #[test]
    fn test_api_call_cacheability() {
        let get = OperationArgs::parse(
            OperationKind::ApiCall,
            &json!({"method":"GET","url":"https://x/","outputPath":"/workflow/a"}),
        )
        .unwrap();
        assert!(get.is_cacheable());

        let post = OperationArgs::parse(
            OperationKind::ApiCall,
            &json!({"method":"POST","url":"https://x/","outputPath":"/workflow/a"}),
        )
        .unwrap();
        assert!(!post.is_cacheable());

        let secret_body = OperationArgs::parse(
            OperationKind::ApiCall,
            &json!({
                "method":"GET","url":"https://x/","outputPath":"/workflow/a",
                "body":{"token":{"credentialRef":{"id":"c1"}}}
            }),
        )
        .unwrap();
        assert!(!secret_body.is_cacheable());
    }

    #[test]
    fn test_declared_outputs() {
        let group = OperationArgs::parse(
            OperationKind::TransformData,
            &json!({"inputPath":"/workflow/a","transform":"group","config":{"field":"k"},"outputPath":"/workflow/g"}),
        )
        .unwrap();
        assert_eq!(group.declared_output(), OutputType::Object);
        assert!(!group.declared_output().satisfies_array());

        let sort = OperationArgs::parse(
            OperationKind::TransformData,
            &json!({"inputPath":"/workflow/a","transform":"sort","config":{"field":"k"},"outputPath":"/workflow/s"}),
        )
        .unwrap();
        assert!(sort.declared_output().satisfies_array());
    }
}
