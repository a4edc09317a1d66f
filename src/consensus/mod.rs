//! Consensus — weighted voting across independent evaluators.
//!
//! A `ConsensusCoordinator` fans each opportunity out to every registered
//! `Evaluator` under a shared deadline and reduces the votes that arrive in
//! time into a single `Consensus` via `aggregate::tally`.

pub mod aggregate;
pub mod coordinator;
pub mod evaluators;

pub use coordinator::{ConsensusCoordinator, CoordinatorStats};

use anyhow::Result;
use async_trait::async_trait;

use crate::types::{ExecutionParams, Opportunity, VoteChoice};

/// What an evaluator returns for one opportunity.
#[derive(Debug, Clone)]
pub struct Assessment {
    pub choice: VoteChoice,
    /// Confidence (0.0–1.0); clamped when turned into a vote.
    pub confidence: f64,
    pub reasoning: String,
    pub execution_params: Option<ExecutionParams>,
    /// Self-reported processing time; measured wall time is used if absent.
    pub processing_time_ms: Option<u64>,
}

impl Assessment {
    pub fn new(choice: VoteChoice, confidence: f64, reasoning: impl Into<String>) -> Self {
        Self {
            choice,
            confidence,
            reasoning: reasoning.into(),
            execution_params: None,
            processing_time_ms: None,
        }
    }

    pub fn approve(confidence: f64, reasoning: impl Into<String>) -> Self {
        Self::new(VoteChoice::Approve, confidence, reasoning)
    }

    pub fn reject(confidence: f64, reasoning: impl Into<String>) -> Self {
        Self::new(VoteChoice::Reject, confidence, reasoning)
    }

    pub fn abstain(reasoning: impl Into<String>) -> Self {
        Self::new(VoteChoice::Abstain, 0.0, reasoning)
    }

    pub fn with_params(mut self, params: ExecutionParams) -> Self {
        self.execution_params = Some(params);
        self
    }
}

/// A pluggable decision function bound to one logical node.
///
/// Errors and overruns are not fatal to the round: the evaluator simply
/// contributes no vote.
#[async_trait]
pub trait Evaluator: Send + Sync {
    async fn evaluate(&self, opportunity: &Opportunity) -> Result<Assessment>;
}
