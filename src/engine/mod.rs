//! Core engine: consensus → execution hand-off.
//!
//! `TradingCore` asks the node pool for a verdict on each opportunity and,
//! when the pool decides to execute, runs the opportunity through the
//! execution pipeline with the merged execution parameters attached.

pub mod feed;

use serde::Serialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use crate::pipeline::{CheckpointResult, ExecutionPipeline};
use crate::scaler::NodePoolScaler;
use crate::types::{ConclaveError, Consensus, ExecutionParams, Opportunity, Path};

/// Metadata key carrying the consensus' merged execution parameters.
pub const EXECUTION_PARAMS_KEY: &str = "execution_params";

/// Metadata key carrying a summary of the verdict.
pub const CONSENSUS_KEY: &str = "consensus";

/// What happened to one opportunity.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessOutcome {
    pub consensus: Consensus,
    /// Present only when the pool decided to execute.
    pub execution: Option<CheckpointResult>,
}

impl ProcessOutcome {
    pub fn executed(&self) -> bool {
        self.execution.as_ref().is_some_and(|e| e.success)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CoreCounters {
    pub processed: u64,
    pub executed: u64,
    pub failed: u64,
    pub skipped: u64,
}

pub struct TradingCore {
    scaler: Arc<NodePoolScaler>,
    pipeline: Arc<ExecutionPipeline>,
    max_retries: u32,
    processed: AtomicU64,
    executed: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
}

impl TradingCore {
    pub fn new(scaler: Arc<NodePoolScaler>, pipeline: Arc<ExecutionPipeline>) -> Self {
        let max_retries = pipeline.config().default_max_retries;
        Self {
            scaler,
            pipeline,
            max_retries,
            processed: AtomicU64::new(0),
            executed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
        }
    }

    pub fn scaler(&self) -> &Arc<NodePoolScaler> {
        &self.scaler
    }

    pub fn pipeline(&self) -> &Arc<ExecutionPipeline> {
        &self.pipeline
    }

    /// Decide on `opportunity` and execute it along `path` if approved.
    ///
    /// Only pool-level preconditions (no ready coordinator) are errors; a
    /// rejected or failed opportunity is a normal outcome.
    pub async fn process(
        &self,
        opportunity: Opportunity,
        path: Path,
    ) -> Result<ProcessOutcome, ConclaveError> {
        self.processed.fetch_add(1, Ordering::Relaxed);
        let consensus = self.scaler.evaluate_opportunity(&opportunity).await?;

        if !consensus.should_execute() {
            self.skipped.fetch_add(1, Ordering::Relaxed);
            info!(
                opportunity = %opportunity.id,
                kind = %opportunity.kind,
                decision = %consensus.decision,
                approval = format!("{:.2}", consensus.approval_rate),
                vetoed = consensus.vetoed,
                "Opportunity not executed"
            );
            return Ok(ProcessOutcome {
                consensus,
                execution: None,
            });
        }

        let mut metadata = ExecutionParams::new();
        metadata.insert(
            CONSENSUS_KEY.to_string(),
            json!({
                "coordinator_id": consensus.coordinator_id,
                "approval_rate": consensus.approval_rate,
                "average_confidence": consensus.average_confidence,
                "votes": consensus.votes.len(),
            }),
        );
        if let Some(params) = &consensus.execution_params {
            metadata.insert(EXECUTION_PARAMS_KEY.to_string(), Value::Object(params.clone()));
        }

        let execution = self
            .pipeline
            .execute_with_metadata(opportunity, path, self.max_retries, metadata)
            .await;

        if execution.success {
            self.executed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
            warn!(
                opportunity = %consensus.opportunity_id,
                stage = %execution.stage,
                errors = ?execution.errors,
                "Approved opportunity failed in pipeline"
            );
        }

        Ok(ProcessOutcome {
            consensus,
            execution: Some(execution),
        })
    }

    pub fn counters(&self) -> CoreCounters {
        CoreCounters {
            processed: self.processed.load(Ordering::Relaxed),
            executed: self.executed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
