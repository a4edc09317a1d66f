//! Liveness probes used by the health-check loop.

use async_trait::async_trait;
use rand::Rng;

use super::node::Node;

/// Decides whether a node is still healthy.
#[async_trait]
pub trait LivenessProbe: Send + Sync {
    async fn is_healthy(&self, node: &Node) -> bool;
}

/// Every node is always healthy.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysHealthy;

#[async_trait]
impl LivenessProbe for AlwaysHealthy {
    async fn is_healthy(&self, _node: &Node) -> bool {
        true
    }
}

/// Fails each sample independently with probability `failure_rate`.
/// Useful for exercising the replacement path in staging.
#[derive(Debug, Clone, Copy)]
pub struct RandomFailureProbe {
    failure_rate: f64,
}

impl RandomFailureProbe {
    pub fn new(failure_rate: f64) -> Self {
        Self {
            failure_rate: failure_rate.clamp(0.0, 1.0),
        }
    }
}

#[async_trait]
impl LivenessProbe for RandomFailureProbe {
    async fn is_healthy(&self, _node: &Node) -> bool {
        !rand::thread_rng().gen_bool(self.failure_rate)
    }
}
