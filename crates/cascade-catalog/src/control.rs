//! Condition evaluation and cancellable waits.

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use cascade_core::EngineError;

use crate::args::{ConditionOp, ConditionSpec};
use crate::filter::compare;

/// Evaluate a `Conditional` condition against the value read at its path
/// (`None` when the path does not exist - only `exists`/`empty` accept
/// that).
pub fn evaluate_condition(
    current: Option<&Value>,
    spec: &ConditionSpec,
) -> Result<bool, EngineError> {
    match spec.operator {
        ConditionOp::Exists => return Ok(current.is_some()),
        ConditionOp::Empty => {
            return Ok(match current {
                None | Some(Value::Null) => true,
                Some(Value::Array(items)) => items.is_empty(),
                Some(Value::Object(map)) => map.is_empty(),
                Some(Value::String(s)) => s.is_empty(),
                Some(_) => false,
            })
        }
        _ => {}
    }

    let current = current.ok_or_else(|| EngineError::Data {
        path: spec.path.clone(),
        message: "condition path not found".to_string(),
    })?;
    let expected = spec.value.as_ref().ok_or_else(|| {
        EngineError::Validation(format!(
            "condition on {} requires a value for this operator",
            spec.path
        ))
    })?;

    Ok(match spec.operator {
        ConditionOp::Eq => current == expected,
        ConditionOp::Ne => current != expected,
        ConditionOp::Gt => compare(Some(current), expected).is_some_and(|o| o.is_gt()),
        ConditionOp::Lt => compare(Some(current), expected).is_some_and(|o| o.is_lt()),
        ConditionOp::Ge => compare(Some(current), expected).is_some_and(|o| o.is_ge()),
        ConditionOp::Le => compare(Some(current), expected).is_some_and(|o| o.is_le()),
        ConditionOp::Exists | ConditionOp::Empty => unreachable!("handled above"),
    })
}

/// Suspend for `duration_ms`, honouring cancellation. A zero duration
/// returns without suspending.
pub async fn wait(duration_ms: u64, cancel: &CancellationToken) -> Result<(), EngineError> {
    if duration_ms == 0 {
        return Ok(());
    }
    tokio::select! {
        _ = cancel.cancelled() => Err(EngineError::Cancelled),
        _ = tokio::time::sleep(std::time::Duration::from_millis(duration_ms)) => Ok(()),
    }
}
