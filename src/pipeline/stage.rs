//! Stage handler contract.

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

use super::context::{ExecutionContext, ExecutionState};
use crate::types::ConclaveError;

/// Outcome of a stage, or of a whole pipeline run.
#[derive(Debug, Clone, Serialize)]
pub struct CheckpointResult {
    pub success: bool,
    pub stage: ExecutionState,
    pub context: Option<ExecutionContext>,
    pub errors: Vec<String>,
}

impl CheckpointResult {
    pub fn ok(stage: ExecutionState, context: ExecutionContext) -> Self {
        Self {
            success: true,
            stage,
            context: Some(context),
            errors: Vec::new(),
        }
    }

    pub fn failed(
        stage: ExecutionState,
        context: Option<ExecutionContext>,
        errors: Vec<String>,
    ) -> Self {
        Self {
            success: false,
            stage,
            context,
            errors,
        }
    }
}

/// Processing function bound to one pipeline state.
///
/// Handlers get their own copy of the context and hand back the (possibly
/// annotated) context in the result. Returning `Err`, or a result with
/// `success = false`, fails the attempt.
#[async_trait]
pub trait StageHandler: Send + Sync {
    async fn handle(&self, context: ExecutionContext) -> Result<CheckpointResult>;
}

/// A returned checkpoint must still describe the same execution.
pub fn validate_checkpoint(
    stage: ExecutionState,
    expected: &ExecutionContext,
    returned: Option<&ExecutionContext>,
) -> Result<(), ConclaveError> {
    let ctx = returned.ok_or_else(|| ConclaveError::InvalidCheckpoint(stage.to_string()))?;

    if ctx.id.is_empty() || ctx.id != expected.id {
        return Err(ConclaveError::InvalidContext {
            stage: stage.to_string(),
            message: format!("context id '{}' does not match '{}'", ctx.id, expected.id),
        });
    }
    if ctx.opportunity.id.is_empty() || ctx.opportunity.id != expected.opportunity.id {
        return Err(ConclaveError::InvalidContext {
            stage: stage.to_string(),
            message: "opportunity reference missing or changed".to_string(),
        });
    }
    Ok(())
}
