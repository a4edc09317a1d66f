//! Dry-run stage handler: walks a context through a stage without touching
//! any chain. Used by the binary and for rehearsing stage configuration.

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use serde_json::json;
use tracing::debug;

use super::context::ExecutionContext;
use super::stage::{CheckpointResult, StageHandler};

#[derive(Debug, Clone, Copy, Default)]
pub struct DryRunStage {
    failure_rate: f64,
}

impl DryRunStage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail each attempt independently with probability `rate`.
    pub fn with_failure_rate(rate: f64) -> Self {
        Self {
            failure_rate: rate.clamp(0.0, 1.0),
        }
    }
}

#[async_trait]
impl StageHandler for DryRunStage {
    async fn handle(&self, mut context: ExecutionContext) -> Result<CheckpointResult> {
        let stage = context.state;
        if self.failure_rate > 0.0 && rand::thread_rng().gen_bool(self.failure_rate) {
            bail!("simulated {stage} failure");
        }

        let key = format!("dry_run.{}", stage.to_string().to_lowercase());
        context.metadata.insert(
            key,
            json!({ "at": Utc::now().to_rfc3339(), "attempt": context.retry_count }),
        );
        debug!(execution_id = %context.id, stage = %stage, "Dry-run stage passed");
        Ok(CheckpointResult::ok(stage, context))
    }
}
