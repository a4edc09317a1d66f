//! Lifecycle event bus.
//!
//! Coordinators, the scaler and the pipeline publish `CoreEvent`s for
//! observability collaborators. Publishing never blocks: a lagging or absent
//! subscriber only loses events, it can never stall or fail core progress.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

use crate::types::{Decision, Specialization, VoteChoice};

/// Default number of buffered events per subscriber.
const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CoreEvent {
    // -- consensus --
    InstanceRegistered {
        coordinator_id: String,
        instance_id: String,
        specialization: Specialization,
    },
    InstanceUnregistered {
        coordinator_id: String,
        instance_id: String,
    },
    RoundStarted {
        coordinator_id: String,
        opportunity_id: String,
        evaluators: usize,
    },
    VoteReceived {
        coordinator_id: String,
        opportunity_id: String,
        evaluator_id: String,
        choice: VoteChoice,
    },
    ConsensusReached {
        coordinator_id: String,
        opportunity_id: String,
        decision: Decision,
        approval_rate: f64,
        latency_ms: u64,
    },

    // -- scaler --
    CoordinatorCreated {
        coordinator_id: String,
        region: String,
    },
    NodeCreated {
        node_id: String,
        region: String,
        specialization: Specialization,
    },
    NodeRemoved {
        node_id: String,
        reason: String,
    },
    NodeUnhealthy {
        node_id: String,
    },
    NodeRecovered {
        failed_node_id: String,
        replacement_id: String,
    },
    ScaledUp {
        from: usize,
        to: usize,
    },
    ScaledDown {
        from: usize,
        to: usize,
    },

    // -- pipeline --
    StageStarted {
        execution_id: String,
        stage: String,
    },
    StageCompleted {
        execution_id: String,
        stage: String,
        duration_ms: u64,
    },
    StageFailed {
        execution_id: String,
        stage: String,
        error: String,
    },
    StageSkipped {
        execution_id: String,
        stage: String,
    },
    ExecutionCompleted {
        execution_id: String,
        duration_ms: u64,
    },
    ExecutionFailed {
        execution_id: String,
        stage: String,
        errors: Vec<String>,
    },
    ExecutionCancelled {
        execution_id: String,
    },
    ExecutionRolledBack {
        execution_id: String,
        from: String,
        to: String,
    },
}

/// Cloneable publish/subscribe handle shared by all core components.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<CoreEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn publish(&self, event: CoreEvent) {
        debug!(event = ?event, "core event");
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
