//! Shared types for the CONCLAVE core.
//!
//! These types form the data model used by the consensus, scaler and
//! pipeline modules. They carry no behaviour beyond small helpers so that
//! every component can depend on them without circular references.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Execution-parameter overrides an evaluator may attach to an approving
/// vote (slippage caps, gas ceilings, route hints...).
pub type ExecutionParams = serde_json::Map<String, serde_json::Value>;

// ---------------------------------------------------------------------------
// Opportunity
// ---------------------------------------------------------------------------

/// How quickly an opportunity must be acted on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Urgency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Urgency::Low => write!(f, "low"),
            Urgency::Medium => write!(f, "medium"),
            Urgency::High => write!(f, "high"),
            Urgency::Critical => write!(f, "critical"),
        }
    }
}

/// A candidate profitable action awaiting a decision.
///
/// Produced by the upstream detection layer and never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Opportunity {
    pub id: String,
    /// Type tag from the detector: "spatial" | "triangular" | "flash_loan" ...
    #[serde(rename = "type")]
    pub kind: String,
    /// Detector-specific payload, opaque to the core.
    pub payload: serde_json::Value,
    pub expected_value: Decimal,
    /// Risk score (0.0 = safe, 1.0 = reckless)
    pub risk: f64,
    pub urgency: Urgency,
    pub deadline: DateTime<Utc>,
}

impl fmt::Display for Opportunity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} (EV: ${:.2} | risk: {:.2} | {})",
            self.kind, self.id, self.expected_value, self.risk, self.urgency,
        )
    }
}

impl Opportunity {
    /// Build an opportunity with a fresh UUID.
    pub fn new(
        kind: impl Into<String>,
        payload: serde_json::Value,
        expected_value: Decimal,
        risk: f64,
        urgency: Urgency,
        deadline: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind: kind.into(),
            payload,
            expected_value,
            risk: risk.clamp(0.0, 1.0),
            urgency,
            deadline,
        }
    }

    /// Whether the deadline has already passed.
    pub fn is_expired(&self) -> bool {
        self.deadline <= Utc::now()
    }

    /// Time remaining until the deadline (negative once expired).
    pub fn time_remaining(&self) -> chrono::Duration {
        self.deadline - Utc::now()
    }
}

/// Route summary handed over with an accepted opportunity.
///
/// Only `net_profit` is consumed by the core (pipeline priority); the rest
/// is carried through for stage handlers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Path {
    pub id: String,
    pub tokens: Vec<String>,
    pub pools: Vec<String>,
    pub protocols: Vec<String>,
    pub net_profit: Decimal,
}

impl Path {
    pub fn new(net_profit: Decimal) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            net_profit,
            ..Default::default()
        }
    }

    /// Number of swaps along the route.
    pub fn hops(&self) -> usize {
        self.tokens.len().saturating_sub(1)
    }
}

// ---------------------------------------------------------------------------
// Nodes
// ---------------------------------------------------------------------------

/// What an evaluator node focuses on. Ethics nodes hold the veto.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Specialization {
    Risk,
    Opportunity,
    Ethics,
    Speed,
    General,
}

impl Specialization {
    /// Provisioning order used when assigning specializations cyclically.
    pub const ALL: &'static [Specialization] = &[
        Specialization::Risk,
        Specialization::Opportunity,
        Specialization::Ethics,
        Specialization::Speed,
        Specialization::General,
    ];

    /// The specialization for the `n`-th provisioned node.
    pub fn cycle(n: usize) -> Self {
        Self::ALL[n % Self::ALL.len()]
    }
}

impl fmt::Display for Specialization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Specialization::Risk => write!(f, "risk"),
            Specialization::Opportunity => write!(f, "opportunity"),
            Specialization::Ethics => write!(f, "ethics"),
            Specialization::Speed => write!(f, "speed"),
            Specialization::General => write!(f, "general"),
        }
    }
}

/// Identity of one evaluator as seen by a coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub id: String,
    pub weight: f64,
    pub specialization: Specialization,
}

impl NodeConfig {
    pub fn new(id: impl Into<String>, weight: f64, specialization: Specialization) -> Self {
        Self {
            id: id.into(),
            weight,
            specialization,
        }
    }
}

// ---------------------------------------------------------------------------
// Votes & consensus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoteChoice {
    Approve,
    Reject,
    Abstain,
}

impl fmt::Display for VoteChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VoteChoice::Approve => write!(f, "approve"),
            VoteChoice::Reject => write!(f, "reject"),
            VoteChoice::Abstain => write!(f, "abstain"),
        }
    }
}

/// One evaluator's verdict on one opportunity within one round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vote {
    pub evaluator_id: String,
    pub opportunity_id: String,
    pub choice: VoteChoice,
    /// Confidence (0.0–1.0)
    pub confidence: f64,
    pub reasoning: String,
    pub execution_params: Option<ExecutionParams>,
    pub timestamp: DateTime<Utc>,
    pub latency_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Execute,
    Reject,
    Timeout,
    NoConsensus,
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::Execute => write!(f, "execute"),
            Decision::Reject => write!(f, "reject"),
            Decision::Timeout => write!(f, "timeout"),
            Decision::NoConsensus => write!(f, "no-consensus"),
        }
    }
}

/// Aggregated, thresholded outcome of one voting round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Consensus {
    pub opportunity_id: String,
    pub coordinator_id: String,
    pub decision: Decision,
    /// Votes in evaluator registration order.
    pub votes: Vec<Vote>,
    pub approval_rate: f64,
    pub reject_rate: f64,
    pub average_confidence: f64,
    pub consensus_reached: bool,
    pub vetoed: bool,
    pub quorum_required: usize,
    pub execution_params: Option<ExecutionParams>,
    pub latency_ms: u64,
    pub timestamp: DateTime<Utc>,
}

impl fmt::Display for Consensus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} on {} | votes={} (quorum {}) | approve={:.0}% reject={:.0}% | conf={:.2}{} | {}ms",
            self.decision,
            self.opportunity_id,
            self.votes.len(),
            self.quorum_required,
            self.approval_rate * 100.0,
            self.reject_rate * 100.0,
            self.average_confidence,
            if self.vetoed { " | VETO" } else { "" },
            self.latency_ms,
        )
    }
}

impl Consensus {
    pub fn should_execute(&self) -> bool {
        self.decision == Decision::Execute
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Domain-specific error types for CONCLAVE.
///
/// Stage-level variants render with a stable code prefix so that pipeline
/// results can be inspected without matching on the type.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConclaveError {
    #[error("Capacity reached: {0}")]
    Capacity(String),

    #[error("Duplicate instance: {0}")]
    DuplicateInstance(String),

    #[error("Not ready: {0}")]
    NotReady(String),

    #[error("Vote collection failed ({evaluator_id}): {message}")]
    VoteCollection { evaluator_id: String, message: String },

    #[error("STAGE_FAILED: {stage}: {message}")]
    Stage { stage: String, message: String },

    #[error("STAGE_TIMEOUT: {stage} exceeded {timeout_ms}ms")]
    StageTimeout { stage: String, timeout_ms: u64 },

    #[error("NO_HANDLER: no handler registered for {0}")]
    NoHandler(String),

    #[error("INVALID_CHECKPOINT: {0} returned no context")]
    InvalidCheckpoint(String),

    #[error("INVALID_CONTEXT: {stage}: {message}")]
    InvalidContext { stage: String, message: String },

    #[error("PIPELINE_FAILURE: {0}")]
    PipelineFailure(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
