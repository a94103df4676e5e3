//! # cascade-catalog
//!
//! The fixed catalog of operation kinds the cascade engine can execute:
//! - [`kind`] - the eight kinds and their static descriptors
//! - [`args`] - typed argument schemas
//! - [`http`] - the `ApiCall` executor
//! - [`filter`], [`transform`], [`merge`] - the pure data operations
//! - [`control`] - condition evaluation and cancellable waits
//! - [`storage`] - the external storage seam for `StoreData`
//!
//! Agents cannot register kinds; the catalog is closed by design and the
//! engine dispatches on [`kind::OperationKind`] variants.

pub mod args;
pub mod control;
pub mod filter;
pub mod http;
pub mod kind;
pub mod merge;
pub mod storage;
pub mod transform;

pub use args::{
    ApiCallArgs, ConditionOp, ConditionSpec, ConditionalArgs, FilterArgs, FilterCondition,
    FilterOp, HttpMethod, LoopArgs, MergeArgs, MergeStrategy, OperationArgs, StorageBackend,
    StoreArgs, TransformArgs, TransformKind, WaitArgs, MAX_WAIT_MS,
};
pub use control::{evaluate_condition, wait};
pub use filter::apply_filter;
pub use http::{url_host, url_path, HttpExecutor};
pub use kind::{KindDescriptor, OperationKind, OutputType, UnknownKind};
pub use merge::apply_merge;
pub use storage::{MemoryStorage, Storage};
pub use transform::apply_transform;
