//! Logical evaluator nodes managed by the scaler.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::{NodeConfig, Specialization};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Starting,
    Ready,
    Busy,
    Unhealthy,
    Stopped,
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeStatus::Starting => write!(f, "starting"),
            NodeStatus::Ready => write!(f, "ready"),
            NodeStatus::Busy => write!(f, "busy"),
            NodeStatus::Unhealthy => write!(f, "unhealthy"),
            NodeStatus::Stopped => write!(f, "stopped"),
        }
    }
}

/// One logical evaluator instance.
///
/// Weight and specialization are fixed at creation; only the status and the
/// rolling counters change afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    id: String,
    region: String,
    coordinator_id: String,
    specialization: Specialization,
    weight: f64,
    pub status: NodeStatus,
    pub evaluations_processed: u64,
    pub successful_evaluations: u64,
    /// Cumulative mean latency of pool-level evaluations (ms).
    pub average_latency_ms: f64,
    pub created_at: DateTime<Utc>,
    pub last_health_check: Option<DateTime<Utc>>,
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{} @ {}/{}] {} | evals={} | avg={:.1}ms | success={:.0}%",
            self.id,
            self.specialization,
            self.region,
            self.coordinator_id,
            self.status,
            self.evaluations_processed,
            self.average_latency_ms,
            self.success_rate() * 100.0,
        )
    }
}

impl Node {
    pub fn new(
        id: impl Into<String>,
        region: impl Into<String>,
        specialization: Specialization,
        weight: f64,
    ) -> Self {
        Self {
            id: id.into(),
            region: region.into(),
            coordinator_id: String::new(),
            specialization,
            weight,
            status: NodeStatus::Starting,
            evaluations_processed: 0,
            successful_evaluations: 0,
            average_latency_ms: 0.0,
            created_at: Utc::now(),
            last_health_check: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn coordinator_id(&self) -> &str {
        &self.coordinator_id
    }

    pub(crate) fn assign_coordinator(&mut self, coordinator_id: &str) {
        self.coordinator_id = coordinator_id.to_string();
    }

    pub fn specialization(&self) -> Specialization {
        self.specialization
    }

    pub fn weight(&self) -> f64 {
        self.weight
    }

    /// The identity a coordinator registers.
    pub fn config(&self) -> NodeConfig {
        NodeConfig::new(self.id.clone(), self.weight, self.specialization)
    }

    /// Share of evaluations that completed (1.0 before the first one).
    pub fn success_rate(&self) -> f64 {
        if self.evaluations_processed == 0 {
            1.0
        } else {
            self.successful_evaluations as f64 / self.evaluations_processed as f64
        }
    }

    /// Fold one evaluation into the rolling counters.
    pub fn record_evaluation(&mut self, latency_ms: u64, success: bool) {
        self.evaluations_processed += 1;
        if success {
            self.successful_evaluations += 1;
        }
        let n = self.evaluations_processed as f64;
        self.average_latency_ms += (latency_ms as f64 - self.average_latency_ms) / n;
    }

    pub fn is_available(&self) -> bool {
        self.status == NodeStatus::Ready
    }
}
