//! Execution contexts and the stage order they move through.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::{ExecutionParams, Opportunity, Path};

// ---------------------------------------------------------------------------
// States
// ---------------------------------------------------------------------------

/// Lifecycle state of an execution. Declaration order is the stage order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionState {
    Pending,
    Detecting,
    Validating,
    Preparing,
    Executing,
    Monitoring,
    Completed,
    Failed,
    Cancelled,
}

/// The states that run a stage handler, in order.
pub const PROCESSING_STAGES: [ExecutionState; 5] = [
    ExecutionState::Detecting,
    ExecutionState::Validating,
    ExecutionState::Preparing,
    ExecutionState::Executing,
    ExecutionState::Monitoring,
];

impl ExecutionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionState::Completed | ExecutionState::Failed | ExecutionState::Cancelled
        )
    }

    /// Position in `PROCESSING_STAGES`, if this state runs a handler.
    pub fn stage_index(&self) -> Option<usize> {
        PROCESSING_STAGES.iter().position(|s| s == self)
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExecutionState::Pending => "Pending",
            ExecutionState::Detecting => "Detecting",
            ExecutionState::Validating => "Validating",
            ExecutionState::Preparing => "Preparing",
            ExecutionState::Executing => "Executing",
            ExecutionState::Monitoring => "Monitoring",
            ExecutionState::Completed => "Completed",
            ExecutionState::Failed => "Failed",
            ExecutionState::Cancelled => "Cancelled",
        };
        write!(f, "{name}")
    }
}

// ---------------------------------------------------------------------------
// Priority
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

impl Priority {
    /// Bucket a route by its net profit (USD).
    pub fn from_net_profit(net_profit: Decimal) -> Self {
        if net_profit > dec!(1000) {
            Priority::Critical
        } else if net_profit > dec!(500) {
            Priority::High
        } else if net_profit > dec!(100) {
            Priority::Medium
        } else {
            Priority::Low
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Medium => write!(f, "medium"),
            Priority::High => write!(f, "high"),
            Priority::Critical => write!(f, "critical"),
        }
    }
}

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// Everything the pipeline knows about one execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub id: String,
    pub opportunity: Opportunity,
    pub path: Path,
    pub state: ExecutionState,
    pub priority: Priority,
    /// Budgeted retries spent so far (reset by rollback).
    pub retry_count: u32,
    pub max_retries: u32,
    pub errors: Vec<String>,
    pub metadata: ExecutionParams,
    /// Every state entered, in order.
    pub state_history: Vec<ExecutionState>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ExecutionContext {
    pub fn new(opportunity: Opportunity, path: Path, max_retries: u32) -> Self {
        let now = Utc::now();
        let priority = Priority::from_net_profit(path.net_profit);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            opportunity,
            path,
            state: ExecutionState::Pending,
            priority,
            retry_count: 0,
            max_retries,
            errors: Vec::new(),
            metadata: ExecutionParams::new(),
            state_history: vec![ExecutionState::Pending],
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Move to `state`, stamping timestamps and history.
    pub fn transition(&mut self, state: ExecutionState) {
        let now = Utc::now();
        self.state = state;
        self.updated_at = now;
        if self.state_history.last() != Some(&state) {
            self.state_history.push(state);
        }
        if state.is_terminal() {
            self.completed_at = Some(now);
        }
    }

    pub fn is_active(&self) -> bool {
        !self.state.is_terminal()
    }

    /// Milliseconds from creation to completion (or to now while active).
    pub fn duration_ms(&self) -> u64 {
        let end = self.completed_at.unwrap_or_else(Utc::now);
        (end - self.created_at).num_milliseconds().max(0) as u64
    }
}

impl fmt::Display for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}] {} | priority={} | retries={}/{}",
            self.id, self.opportunity.kind, self.state, self.priority, self.retry_count, self.max_retries,
        )
    }
}
