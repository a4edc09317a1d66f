//! Deterministic collaborators for integration testing.
//!
//! Evaluators and stage handlers whose behaviour is fully controllable from
//! test code, with no randomness and no external dependencies.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use conclave::consensus::{Assessment, Evaluator};
use conclave::pipeline::{CheckpointResult, ExecutionContext, StageHandler};
use conclave::scaler::EvaluatorFactory;
use conclave::types::*;

// ---------------------------------------------------------------------------
// Evaluators
// ---------------------------------------------------------------------------

/// Returns a fixed assessment, optionally after a delay.
pub struct MockEvaluator {
    assessment: Option<Assessment>,
    delay: Duration,
}

impl MockEvaluator {
    pub fn approve(confidence: f64) -> Self {
        Self::returning(Assessment::approve(confidence, "mock approve"))
    }

    pub fn reject(confidence: f64) -> Self {
        Self::returning(Assessment::reject(confidence, "mock reject"))
    }

    /// Every call fails.
    pub fn failing() -> Self {
        Self {
            assessment: None,
            delay: Duration::ZERO,
        }
    }

    fn returning(assessment: Assessment) -> Self {
        Self {
            assessment: Some(assessment),
            delay: Duration::ZERO,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl Evaluator for MockEvaluator {
    async fn evaluate(&self, _opportunity: &Opportunity) -> Result<Assessment> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.assessment
            .clone()
            .ok_or_else(|| anyhow!("mock evaluator failure"))
    }
}

/// Builds approving evaluators that take `delay` to answer.
pub struct MockFactory {
    delay: Duration,
}

impl MockFactory {
    pub fn slow(delay: Duration) -> Self {
        Self { delay }
    }
}

impl EvaluatorFactory for MockFactory {
    fn create(&self, _node: &NodeConfig, _region: &str) -> Result<Arc<dyn Evaluator>> {
        Ok(Arc::new(MockEvaluator::approve(0.9).with_delay(self.delay)))
    }
}

// ---------------------------------------------------------------------------
// Stage handlers
// ---------------------------------------------------------------------------

/// Passes every call and remembers the retry count it last saw.
#[derive(Default)]
pub struct PassingStage {
    calls: AtomicU32,
    last_retry_count: AtomicU32,
}

impl PassingStage {
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_retry_count(&self) -> u32 {
        self.last_retry_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StageHandler for PassingStage {
    async fn handle(&self, context: ExecutionContext) -> Result<CheckpointResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.last_retry_count.store(context.retry_count, Ordering::SeqCst);
        Ok(CheckpointResult::ok(context.state, context))
    }
}

/// Fails its first `failures` calls, then passes.
pub struct FlakyStage {
    failures: u32,
    calls: AtomicU32,
}

impl FlakyStage {
    pub fn new(failures: u32) -> Self {
        Self {
            failures,
            calls: AtomicU32::new(0),
        }
    }

    pub fn always_failing() -> Self {
        Self::new(u32::MAX)
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StageHandler for FlakyStage {
    async fn handle(&self, context: ExecutionContext) -> Result<CheckpointResult> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n < self.failures {
            return Err(anyhow!("bundle relay rejected submission"));
        }
        Ok(CheckpointResult::ok(context.state, context))
    }
}
