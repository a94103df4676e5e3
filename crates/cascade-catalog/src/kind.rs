//! Operation kinds and their static descriptors.
//!
//! The catalog is a closed, tagged-variant set: every kind the engine can
//! execute is a variant here, with a descriptor recording how the validator
//! and executor must treat it. There is no open registration.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The eight built-in operation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    ApiCall,
    FilterData,
    TransformData,
    Conditional,
    Loop,
    StoreData,
    Wait,
    MergeData,
}

/// Statically declared output shape of a kind, consulted by the type phase
/// of validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputType {
    /// Always an array.
    Array,
    /// Always an object.
    Object,
    /// A single scalar value.
    Scalar,
    /// Shape depends on the remote response; accepted where arrays are
    /// required.
    Dynamic,
    /// Produces no data model output.
    None,
}

impl OutputType {
    /// Whether a reader that requires an array may consume this output.
    pub fn satisfies_array(&self) -> bool {
        matches!(self, Self::Array | Self::Dynamic)
    }
}

/// Per-kind behavior flags.
#[derive(Debug, Clone, Copy)]
pub struct KindDescriptor {
    pub kind: OperationKind,
    /// Whether any failure class of this kind is retryable.
    pub retryable: bool,
    /// Whether results may be cached at all; `ApiCall` additionally requires
    /// a GET with no credential reference in the body (see
    /// [`crate::args::OperationArgs::is_cacheable`]).
    pub cacheable: bool,
}

impl OperationKind {
    pub const ALL: [OperationKind; 8] = [
        OperationKind::ApiCall,
        OperationKind::FilterData,
        OperationKind::TransformData,
        OperationKind::Conditional,
        OperationKind::Loop,
        OperationKind::StoreData,
        OperationKind::Wait,
        OperationKind::MergeData,
    ];

    pub fn descriptor(&self) -> KindDescriptor {
        let (retryable, cacheable) = match self {
            OperationKind::ApiCall => (true, true),
            OperationKind::FilterData => (false, true),
            OperationKind::TransformData => (false, true),
            OperationKind::MergeData => (false, true),
            OperationKind::Conditional
            | OperationKind::Loop
            | OperationKind::StoreData
            | OperationKind::Wait => (false, false),
        };
        KindDescriptor {
            kind: *self,
            retryable,
            cacheable,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::ApiCall => "ApiCall",
            OperationKind::FilterData => "FilterData",
            OperationKind::TransformData => "TransformData",
            OperationKind::Conditional => "Conditional",
            OperationKind::Loop => "Loop",
            OperationKind::StoreData => "StoreData",
            OperationKind::Wait => "Wait",
            OperationKind::MergeData => "MergeData",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = UnknownKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OperationKind::ALL
            .iter()
            .find(|kind| kind.as_str() == s)
            .copied()
            .ok_or_else(|| UnknownKind(s.to_string()))
    }
}

/// A kind marker that names no catalog entry.
#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown operation kind: {0}")]
pub struct UnknownKind(pub String);
