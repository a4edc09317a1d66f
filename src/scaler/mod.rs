//! Node pool scaler.
//!
//! Owns the population of logical evaluator nodes and the regional
//! coordinators they register with. Two background loops run on independent
//! intervals: a health check that replaces failed nodes, and a scale check
//! that grows or shrinks the pool with observed load, separated by a shared
//! cooldown.

pub mod node;
pub mod policy;
pub mod probe;

pub use node::{Node, NodeStatus};
pub use policy::{ScaleDirection, ScalePlan};
pub use probe::{AlwaysHealthy, LivenessProbe, RandomFailureProbe};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::{ConsensusConfig, ScalerConfig};
use crate::consensus::{ConsensusCoordinator, CoordinatorStats, Evaluator};
use crate::events::{CoreEvent, EventBus};
use crate::types::{ConclaveError, Consensus, NodeConfig, Opportunity, Specialization};

/// Builds the decision function for a freshly provisioned node.
pub trait EvaluatorFactory: Send + Sync {
    fn create(&self, node: &NodeConfig, region: &str) -> Result<Arc<dyn Evaluator>>;
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// One applied scale operation.
#[derive(Debug, Clone, Serialize)]
pub struct ScaleRecord {
    pub direction: ScaleDirection,
    pub from: usize,
    pub to: usize,
    pub load: f64,
    pub at: DateTime<Utc>,
    #[serde(skip)]
    pub(crate) instant: Instant,
}

/// Outcome of one health-check pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthReport {
    pub checked: usize,
    pub unhealthy: usize,
    pub replaced: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolStats {
    pub running: bool,
    pub total_nodes: usize,
    pub starting: usize,
    pub ready: usize,
    pub busy: usize,
    pub unhealthy: usize,
    pub stopped: usize,
    pub coordinators: usize,
    pub load: f64,
    pub total_evaluations: u64,
    /// Mean consensus rate over coordinators that have run a round.
    pub consensus_rate: f64,
    pub scale_operations: usize,
}

// ---------------------------------------------------------------------------
// Pool state
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Pool {
    nodes: HashMap<String, Node>,
    coordinators: Vec<Arc<ConsensusCoordinator>>,
    scale_history: VecDeque<ScaleRecord>,
    /// Applied scale operations, including those aged out of the history.
    scale_operations: usize,
    last_scale: Option<Instant>,
    /// Nodes ever provisioned; drives cyclic specialization/region choice.
    provisioned: usize,
    next_node_seq: u64,
    next_coordinator_seq: u64,
    running: bool,
}

impl Pool {
    fn count(&self, status: NodeStatus) -> usize {
        self.nodes.values().filter(|n| n.status == status).count()
    }

    /// Nodes that count towards the pool size.
    fn active_count(&self) -> usize {
        self.nodes
            .values()
            .filter(|n| n.status != NodeStatus::Stopped)
            .count()
    }

    fn coordinator(&self, id: &str) -> Option<Arc<ConsensusCoordinator>> {
        self.coordinators.iter().find(|c| c.id() == id).cloned()
    }
}

struct Shared {
    config: ScalerConfig,
    consensus: ConsensusConfig,
    factory: Arc<dyn EvaluatorFactory>,
    probe: Arc<dyn LivenessProbe>,
    events: EventBus,
    pool: Mutex<Pool>,
}

// ---------------------------------------------------------------------------
// Scaler
// ---------------------------------------------------------------------------

pub struct NodePoolScaler {
    shared: Arc<Shared>,
    shutdown: watch::Sender<bool>,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

impl NodePoolScaler {
    pub fn new(
        config: ScalerConfig,
        consensus: ConsensusConfig,
        factory: Arc<dyn EvaluatorFactory>,
        probe: Arc<dyn LivenessProbe>,
        events: EventBus,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                config,
                consensus,
                factory,
                probe,
                events,
                pool: Mutex::new(Pool::default()),
            }),
            shutdown,
            loops: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &ScalerConfig {
        &self.shared.config
    }

    /// Provision the initial population and start the background loops.
    ///
    /// Returns the number of nodes provisioned. Calling `start` on a running
    /// scaler is a no-op; after `stop` it starts cold with fresh nodes.
    pub async fn start(&self) -> usize {
        let provisioned = {
            let mut pool = self.shared.pool.lock().await;
            if pool.running {
                return 0;
            }

            let stopped: Vec<String> = pool
                .nodes
                .values()
                .filter(|n| n.status == NodeStatus::Stopped)
                .map(|n| n.id().to_string())
                .collect();
            for id in stopped {
                self.shared.retire(&mut pool, &id, "restart").await;
            }

            let target = self.shared.config.initial_nodes();
            let mut provisioned = 0;
            while pool.active_count() < target {
                let (specialization, region) = self.shared.next_assignment(&pool);
                if self.shared.provision(&mut pool, specialization, &region).await.is_none() {
                    break;
                }
                provisioned += 1;
            }
            pool.running = true;
            provisioned
        };

        info!(
            nodes = provisioned,
            regions = ?self.shared.config.regions,
            health_interval_ms = self.shared.config.health_check_interval_ms,
            scale_interval_ms = self.shared.config.scale_check_interval_ms,
            "Node pool started"
        );

        self.shutdown.send_replace(false);
        let health = spawn_loop(
            Arc::clone(&self.shared),
            self.shutdown.subscribe(),
            Duration::from_millis(self.shared.config.health_check_interval_ms),
            LoopKind::Health,
        );
        let scale = spawn_loop(
            Arc::clone(&self.shared),
            self.shutdown.subscribe(),
            Duration::from_millis(self.shared.config.scale_check_interval_ms),
            LoopKind::Scale,
        );
        self.loops.lock().await.extend([health, scale]);

        provisioned
    }

    /// Halt the background loops and mark every node stopped.
    pub async fn stop(&self) {
        self.shutdown.send_replace(true);
        let handles: Vec<JoinHandle<()>> = self.loops.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Scaler loop ended abnormally");
            }
        }

        let mut pool = self.shared.pool.lock().await;
        for node in pool.nodes.values_mut() {
            node.status = NodeStatus::Stopped;
        }
        pool.running = false;
        info!(nodes = pool.nodes.len(), "Node pool stopped");
    }

    /// Run one health-check pass now.
    pub async fn check_health(&self) -> HealthReport {
        self.shared.check_health().await
    }

    /// Run one scale check now. Returns the applied operation, if any.
    pub async fn check_scaling(&self) -> Option<ScaleRecord> {
        self.shared.check_scaling().await
    }

    /// Evaluate an opportunity on the first ready coordinator.
    ///
    /// A bounded set of ready nodes is reserved busy for the duration of the
    /// round and their counters are updated afterwards.
    pub async fn evaluate_opportunity(
        &self,
        opportunity: &Opportunity,
    ) -> Result<Consensus, ConclaveError> {
        let (coordinator, reserved) = {
            let mut pool = self.shared.pool.lock().await;

            let mut chosen = None;
            for coordinator in &pool.coordinators {
                if coordinator.is_ready().await {
                    chosen = Some(Arc::clone(coordinator));
                    break;
                }
            }
            let coordinator = chosen.ok_or_else(|| {
                ConclaveError::NotReady(format!(
                    "no ready coordinator ({} registered)",
                    pool.coordinators.len()
                ))
            })?;

            let mut candidates: Vec<&Node> =
                pool.nodes.values().filter(|n| n.is_available()).collect();
            candidates.sort_by(|a, b| {
                a.evaluations_processed
                    .cmp(&b.evaluations_processed)
                    .then_with(|| a.id().cmp(b.id()))
            });
            let reserved: Vec<String> = candidates
                .into_iter()
                .take(self.shared.config.reservation_size)
                .map(|n| n.id().to_string())
                .collect();
            for id in &reserved {
                if let Some(node) = pool.nodes.get_mut(id) {
                    node.status = NodeStatus::Busy;
                }
            }
            (coordinator, reserved)
        };

        let started = Instant::now();
        let result = coordinator.evaluate_opportunity(opportunity).await;
        let latency_ms = started.elapsed().as_millis() as u64;

        {
            let mut pool = self.shared.pool.lock().await;
            for id in &reserved {
                // The node may have been replaced or retired meanwhile.
                if let Some(node) = pool.nodes.get_mut(id) {
                    if node.status == NodeStatus::Busy {
                        node.status = NodeStatus::Ready;
                    }
                    node.record_evaluation(latency_ms, result.is_ok());
                }
            }
        }

        if let Err(e) = &result {
            warn!(coordinator = %coordinator.id(), error = %e, "Pool evaluation failed");
        }
        result
    }

    pub async fn get_stats(&self) -> PoolStats {
        let (mut stats, coordinators) = {
            let pool = self.shared.pool.lock().await;
            let total = pool.active_count();
            let busy = pool.count(NodeStatus::Busy);
            (
                PoolStats {
                    running: pool.running,
                    total_nodes: total,
                    starting: pool.count(NodeStatus::Starting),
                    ready: pool.count(NodeStatus::Ready),
                    busy,
                    unhealthy: pool.count(NodeStatus::Unhealthy),
                    stopped: pool.count(NodeStatus::Stopped),
                    coordinators: pool.coordinators.len(),
                    load: policy::load(busy, total),
                    total_evaluations: pool.nodes.values().map(|n| n.evaluations_processed).sum(),
                    consensus_rate: 0.0,
                    scale_operations: pool.scale_operations,
                },
                pool.coordinators.clone(),
            )
        };

        let mut rates = Vec::new();
        for coordinator in &coordinators {
            let s = coordinator.stats().await;
            if s.rounds > 0 {
                rates.push(s.consensus_rate());
            }
        }
        if !rates.is_empty() {
            stats.consensus_rate = rates.iter().sum::<f64>() / rates.len() as f64;
        }
        stats
    }

    /// Snapshot of all nodes, ordered by id.
    pub async fn nodes(&self) -> Vec<Node> {
        let pool = self.shared.pool.lock().await;
        let mut nodes: Vec<Node> = pool.nodes.values().cloned().collect();
        nodes.sort_by(|a, b| a.id().cmp(b.id()));
        nodes
    }

    pub async fn coordinators(&self) -> Vec<Arc<ConsensusCoordinator>> {
        self.shared.pool.lock().await.coordinators.clone()
    }

    pub async fn coordinator_stats(&self) -> Vec<CoordinatorStats> {
        let mut out = Vec::new();
        for coordinator in self.coordinators().await {
            out.push(coordinator.stats().await);
        }
        out
    }

    /// Recent consensus records across all coordinators, newest first.
    pub async fn recent_consensus(&self, limit: usize) -> Vec<Consensus> {
        let mut all = Vec::new();
        for coordinator in self.coordinators().await {
            all.extend(coordinator.history(limit).await);
        }
        all.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        all.truncate(limit);
        all
    }

    /// The most recent scale operations, oldest first.
    pub async fn scale_history(&self) -> Vec<ScaleRecord> {
        self.shared.pool.lock().await.scale_history.iter().cloned().collect()
    }

    pub async fn is_running(&self) -> bool {
        self.shared.pool.lock().await.running
    }
}

// ---------------------------------------------------------------------------
// Pool maintenance
// ---------------------------------------------------------------------------

impl Shared {
    fn next_assignment(&self, pool: &Pool) -> (Specialization, String) {
        let n = pool.provisioned;
        let regions = &self.config.regions;
        let region = regions
            .get(n % regions.len().max(1))
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        (Specialization::cycle(n), region)
    }

    /// Create a node, bind it to a coordinator in its region and mark it
    /// ready. Failures are logged and yield `None`.
    async fn provision(
        &self,
        pool: &mut Pool,
        specialization: Specialization,
        region: &str,
    ) -> Option<String> {
        pool.next_node_seq += 1;
        pool.provisioned += 1;
        let id = format!("node-{region}-{:04}", pool.next_node_seq);
        let mut node = Node::new(
            id.clone(),
            region,
            specialization,
            self.config.weight_for(specialization),
        );

        let evaluator = match self.factory.create(&node.config(), region) {
            Ok(e) => e,
            Err(e) => {
                warn!(node_id = %id, error = %format!("{e:#}"), "Evaluator creation failed");
                return None;
            }
        };

        let coordinator = self.coordinator_with_room(pool, region).await;
        let registered = coordinator
            .register_instance(node.config(), Arc::clone(&evaluator))
            .await;
        let coordinator = match registered {
            Ok(()) => coordinator,
            Err(ConclaveError::Capacity(_)) => {
                let fresh = self.open_coordinator(pool, region);
                if let Err(e) = fresh.register_instance(node.config(), evaluator).await {
                    warn!(node_id = %id, error = %e, "Node registration failed");
                    return None;
                }
                fresh
            }
            Err(e) => {
                warn!(node_id = %id, error = %e, "Node registration failed");
                return None;
            }
        };

        node.assign_coordinator(coordinator.id());
        node.status = NodeStatus::Ready;
        debug!(node = %node, "Node ready");
        pool.nodes.insert(id.clone(), node);
        self.events.publish(CoreEvent::NodeCreated {
            node_id: id.clone(),
            region: region.to_string(),
            specialization,
        });
        Some(id)
    }

    /// The region's first coordinator with spare capacity, opening one if
    /// all are full.
    async fn coordinator_with_room(&self, pool: &mut Pool, region: &str) -> Arc<ConsensusCoordinator> {
        for coordinator in pool.coordinators.iter().filter(|c| c.region() == region) {
            if coordinator.has_capacity().await {
                return Arc::clone(coordinator);
            }
        }
        self.open_coordinator(pool, region)
    }

    fn open_coordinator(&self, pool: &mut Pool, region: &str) -> Arc<ConsensusCoordinator> {
        pool.next_coordinator_seq += 1;
        let id = format!("coord-{region}-{}", pool.next_coordinator_seq);
        let coordinator = Arc::new(ConsensusCoordinator::new(
            id.clone(),
            region,
            self.consensus.clone(),
            self.events.clone(),
        ));
        info!(coordinator = %id, region, "Coordinator created");
        self.events.publish(CoreEvent::CoordinatorCreated {
            coordinator_id: id,
            region: region.to_string(),
        });
        pool.coordinators.push(Arc::clone(&coordinator));
        coordinator
    }

    /// Remove a node from its coordinator and the pool. Coordinators left
    /// without evaluators are dropped.
    async fn retire(&self, pool: &mut Pool, node_id: &str, reason: &str) -> bool {
        let Some(node) = pool.nodes.remove(node_id) else {
            return false;
        };

        if let Some(coordinator) = pool.coordinator(node.coordinator_id()) {
            coordinator.unregister_instance(node_id).await;
            if coordinator.instance_count().await == 0 {
                pool.coordinators.retain(|c| c.id() != coordinator.id());
                debug!(coordinator = %coordinator.id(), "Empty coordinator dropped");
            }
        }

        info!(node_id, reason, "Node removed");
        self.events.publish(CoreEvent::NodeRemoved {
            node_id: node_id.to_string(),
            reason: reason.to_string(),
        });
        true
    }

    async fn check_health(&self) -> HealthReport {
        let snapshot: Vec<Node> = {
            let pool = self.pool.lock().await;
            pool.nodes
                .values()
                .filter(|n| {
                    matches!(
                        n.status,
                        NodeStatus::Ready | NodeStatus::Busy | NodeStatus::Unhealthy
                    )
                })
                .cloned()
                .collect()
        };

        // Probe without holding the pool lock.
        let mut failed = Vec::new();
        for node in &snapshot {
            if !self.probe.is_healthy(node).await {
                failed.push(node.id().to_string());
            }
        }

        let mut report = HealthReport {
            checked: snapshot.len(),
            unhealthy: failed.len(),
            replaced: 0,
        };

        let mut pool = self.pool.lock().await;
        let now = Utc::now();
        for node in pool.nodes.values_mut() {
            if snapshot.iter().any(|s| s.id() == node.id()) {
                node.last_health_check = Some(now);
            }
        }

        for id in failed {
            let Some(node) = pool.nodes.get_mut(&id) else {
                continue;
            };
            if matches!(node.status, NodeStatus::Ready | NodeStatus::Busy) {
                node.status = NodeStatus::Unhealthy;
                warn!(node_id = %id, "Node unhealthy");
                self.events.publish(CoreEvent::NodeUnhealthy { node_id: id.clone() });
            }

            // Stateless workers: replace rather than repair.
            let specialization = node.specialization();
            let region = node.region().to_string();
            self.retire(&mut pool, &id, "unhealthy").await;
            match self.provision(&mut pool, specialization, &region).await {
                Some(replacement_id) => {
                    report.replaced += 1;
                    info!(failed = %id, replacement = %replacement_id, "Node replaced");
                    self.events.publish(CoreEvent::NodeRecovered {
                        failed_node_id: id,
                        replacement_id,
                    });
                }
                None => warn!(failed = %id, "Replacement node could not be provisioned"),
            }
        }

        if report.unhealthy > 0 {
            info!(
                checked = report.checked,
                unhealthy = report.unhealthy,
                replaced = report.replaced,
                "Health check complete"
            );
        }
        report
    }

    async fn check_scaling(&self) -> Option<ScaleRecord> {
        let mut pool = self.pool.lock().await;

        let total = pool.active_count();
        let busy = pool.count(NodeStatus::Busy);
        let plan = policy::plan(total, busy, &self.config)?;

        if let Some(last) = pool.last_scale {
            let since = last.elapsed();
            if since < self.config.cooldown() {
                debug!(
                    direction = %plan.direction,
                    since_ms = since.as_millis() as u64,
                    cooldown_ms = self.config.cooldown_ms,
                    "Scale check within cooldown, skipping"
                );
                return None;
            }
        }

        let load = policy::load(busy, total);
        match plan.direction {
            ScaleDirection::Up => {
                for _ in plan.from..plan.to {
                    let (specialization, region) = self.next_assignment(&pool);
                    if self.provision(&mut pool, specialization, &region).await.is_none() {
                        break;
                    }
                }
            }
            ScaleDirection::Down => {
                // Least-utilized first so warmed, high-throughput nodes stay.
                let mut idle: Vec<&Node> = pool.nodes.values().filter(|n| n.is_available()).collect();
                idle.sort_by(|a, b| {
                    a.evaluations_processed
                        .cmp(&b.evaluations_processed)
                        .then_with(|| b.created_at.cmp(&a.created_at))
                });
                let victims: Vec<String> = idle
                    .into_iter()
                    .take(plan.from - plan.to)
                    .map(|n| n.id().to_string())
                    .collect();
                for id in victims {
                    self.retire(&mut pool, &id, "scale-down").await;
                }
            }
        }

        let size = pool.active_count();
        if size == total {
            warn!(direction = %plan.direction, size, "Scale plan could not be applied");
            return None;
        }

        let record = ScaleRecord {
            direction: plan.direction,
            from: total,
            to: size,
            load,
            at: Utc::now(),
            instant: Instant::now(),
        };
        pool.last_scale = Some(record.instant);
        pool.scale_operations += 1;
        if pool.scale_history.len() >= self.config.history_size {
            pool.scale_history.pop_front();
        }
        pool.scale_history.push_back(record.clone());

        info!(
            direction = %record.direction,
            from = record.from,
            to = record.to,
            load = format!("{:.2}", load),
            "Pool scaled"
        );
        self.events.publish(match record.direction {
            ScaleDirection::Up => CoreEvent::ScaledUp { from: total, to: size },
            ScaleDirection::Down => CoreEvent::ScaledDown { from: total, to: size },
        });
        Some(record)
    }
}

// ---------------------------------------------------------------------------
// Background loops
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
enum LoopKind {
    Health,
    Scale,
}

fn spawn_loop(
    shared: Arc<Shared>,
    mut shutdown: watch::Receiver<bool>,
    period: Duration,
    kind: LoopKind,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => match kind {
                    LoopKind::Health => {
                        shared.check_health().await;
                    }
                    LoopKind::Scale => {
                        shared.check_scaling().await;
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!(loop_kind = ?kind, "Scaler loop shutting down");
                        break;
                    }
                }
            }
        }
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::evaluators::HeuristicEvaluatorFactory;
    use crate::types::{Decision, Urgency};
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::collections::HashSet;
    use std::sync::Mutex as StdMutex;

    /// Fails the listed node ids, once each.
    #[derive(Default)]
    struct ScriptedProbe {
        failing: StdMutex<HashSet<String>>,
    }

    impl ScriptedProbe {
        fn fail(&self, id: &str) {
            self.failing.lock().unwrap().insert(id.to_string());
        }
    }

    #[async_trait]
    impl LivenessProbe for ScriptedProbe {
        async fn is_healthy(&self, node: &Node) -> bool {
            !self.failing.lock().unwrap().remove(node.id())
        }
    }

    struct BrokenFactory;

    impl EvaluatorFactory for BrokenFactory {
        fn create(&self, _node: &NodeConfig, _region: &str) -> Result<Arc<dyn Evaluator>> {
            anyhow::bail!("model registry offline")
        }
    }

    fn scaler_config(min: usize, max: usize, initial: usize) -> ScalerConfig {
        ScalerConfig {
            min_nodes: min,
            max_nodes: max,
            initial_nodes: Some(initial),
            health_check_interval_ms: 3_600_000,
            scale_check_interval_ms: 3_600_000,
            cooldown_ms: 60_000,
            regions: vec!["us-east".into(), "eu-west".into()],
            ..ScalerConfig::default()
        }
    }

    fn consensus_config() -> ConsensusConfig {
        ConsensusConfig {
            min_instances: 3,
            max_instances: 10,
            ..ConsensusConfig::default()
        }
    }

    fn build(config: ScalerConfig, probe: Arc<dyn LivenessProbe>) -> NodePoolScaler {
        NodePoolScaler::new(
            config,
            consensus_config(),
            Arc::new(HeuristicEvaluatorFactory),
            probe,
            EventBus::default(),
        )
    }

    async fn set_busy(scaler: &NodePoolScaler, count: usize) {
        let mut pool = scaler.shared.pool.lock().await;
        let mut ids: Vec<String> = pool.nodes.keys().cloned().collect();
        ids.sort();
        for id in ids.iter().take(count) {
            if let Some(n) = pool.nodes.get_mut(id) {
                n.status = NodeStatus::Busy;
            }
        }
    }

    fn benign_opportunity() -> Opportunity {
        Opportunity::new(
            "triangular",
            serde_json::json!({}),
            dec!(120),
            0.1,
            Urgency::High,
            Utc::now() + chrono::Duration::minutes(5),
        )
    }

    #[tokio::test]
    async fn test_start_provisions_cyclically() {
        let scaler = build(scaler_config(5, 50, 10), Arc::new(AlwaysHealthy));
        assert_eq!(scaler.start().await, 10);

        let nodes = scaler.nodes().await;
        assert_eq!(nodes.len(), 10);
        assert!(nodes.iter().all(|n| n.status == NodeStatus::Ready));

        let count = |s: Specialization| nodes.iter().filter(|n| n.specialization() == s).count();
        for s in Specialization::ALL {
            assert_eq!(count(*s), 2);
        }
        let east = nodes.iter().filter(|n| n.region() == "us-east").count();
        assert_eq!(east, 5);

        let coordinators = scaler.coordinators().await;
        assert_eq!(coordinators.len(), 2);
        assert!(nodes.iter().all(|n| !n.coordinator_id().is_empty()));
        scaler.stop().await;
    }

    #[tokio::test]
    async fn test_full_coordinator_spills_into_new_one() {
        let mut cfg = scaler_config(1, 50, 8);
        cfg.regions = vec!["ap-south".into()];
        let scaler = NodePoolScaler::new(
            cfg,
            ConsensusConfig { min_instances: 1, max_instances: 3, ..ConsensusConfig::default() },
            Arc::new(HeuristicEvaluatorFactory),
            Arc::new(AlwaysHealthy),
            EventBus::default(),
        );
        scaler.start().await;
        let stats = scaler.coordinator_stats().await;
        assert_eq!(stats.len(), 3);
        assert_eq!(stats.iter().map(|s| s.instances).collect::<Vec<_>>(), vec![3, 3, 2]);
        scaler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_scale_up_then_cooldown() {
        let scaler = build(scaler_config(5, 50, 20), Arc::new(AlwaysHealthy));
        scaler.start().await;
        set_busy(&scaler, 16).await; // load 0.8

        let record = scaler.check_scaling().await.expect("should scale up");
        assert_eq!(record.direction, ScaleDirection::Up);
        assert_eq!((record.from, record.to), (20, 30));
        assert_eq!(scaler.get_stats().await.total_nodes, 30);

        // Still overloaded, but inside the cooldown window.
        set_busy(&scaler, 28).await;
        assert!(scaler.check_scaling().await.is_none());

        tokio::time::advance(Duration::from_millis(60_001)).await;
        let record = scaler.check_scaling().await.expect("cooldown elapsed");
        assert_eq!((record.from, record.to), (30, 45));

        let history = scaler.scale_history().await;
        assert_eq!(history.len(), 2);
        assert!(history[1].instant - history[0].instant >= Duration::from_millis(60_000));
        scaler.stop().await;
    }

    #[tokio::test]
    async fn test_scale_down_removes_least_used_ready_nodes() {
        let scaler = build(scaler_config(4, 50, 8), Arc::new(AlwaysHealthy));
        scaler.start().await;

        let ids: Vec<String> = scaler.nodes().await.iter().map(|n| n.id().to_string()).collect();
        {
            let mut pool = scaler.shared.pool.lock().await;
            for (i, id) in ids.iter().enumerate() {
                pool.nodes.get_mut(id).unwrap().evaluations_processed = 100 + i as u64;
            }
            // The two coldest nodes; one of them is busy and must survive.
            pool.nodes.get_mut(&ids[5]).unwrap().evaluations_processed = 1;
            pool.nodes.get_mut(&ids[6]).unwrap().evaluations_processed = 2;
            pool.nodes.get_mut(&ids[7]).unwrap().evaluations_processed = 0;
            pool.nodes.get_mut(&ids[7]).unwrap().status = NodeStatus::Busy;
        }

        let record = scaler.check_scaling().await.expect("idle pool shrinks");
        assert_eq!(record.direction, ScaleDirection::Down);
        assert_eq!((record.from, record.to), (8, 6));

        let remaining: Vec<String> = scaler.nodes().await.iter().map(|n| n.id().to_string()).collect();
        assert!(!remaining.contains(&ids[5]));
        assert!(!remaining.contains(&ids[6]));
        assert!(remaining.contains(&ids[7]));
        scaler.stop().await;
    }

    #[tokio::test]
    async fn test_scale_down_never_below_min() {
        let scaler = build(scaler_config(5, 50, 5), Arc::new(AlwaysHealthy));
        scaler.start().await;
        assert!(scaler.check_scaling().await.is_none());
        assert_eq!(scaler.get_stats().await.total_nodes, 5);
        scaler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounds_and_cooldown_hold_over_many_checks() {
        let mut cfg = scaler_config(4, 12, 4);
        cfg.cooldown_ms = 1_000;
        let scaler = build(cfg, Arc::new(AlwaysHealthy));
        scaler.start().await;

        for round in 0..40 {
            let total = scaler.get_stats().await.total_nodes;
            let busy = if round % 7 < 4 { total } else { 0 };
            set_busy(&scaler, busy).await;
            scaler.check_scaling().await;
            {
                let mut pool = scaler.shared.pool.lock().await;
                for n in pool.nodes.values_mut() {
                    n.status = NodeStatus::Ready;
                }
            }
            let size = scaler.get_stats().await.total_nodes;
            assert!((4..=12).contains(&size), "pool size {size} out of bounds");
            tokio::time::advance(Duration::from_millis(400)).await;
        }

        let history = scaler.scale_history().await;
        assert!(history.len() >= 2);
        for pair in history.windows(2) {
            assert!(pair[1].instant - pair[0].instant >= Duration::from_millis(1_000));
        }
        scaler.stop().await;
    }

    #[tokio::test]
    async fn test_unhealthy_node_is_replaced() {
        let probe = Arc::new(ScriptedProbe::default());
        let bus = EventBus::new(256);
        let mut rx = bus.subscribe();
        let scaler = NodePoolScaler::new(
            scaler_config(5, 50, 5),
            consensus_config(),
            Arc::new(HeuristicEvaluatorFactory),
            probe.clone(),
            bus,
        );
        scaler.start().await;

        let victim = scaler.nodes().await.into_iter().find(|n| n.specialization() == Specialization::Ethics).unwrap();
        probe.fail(victim.id());

        let report = scaler.check_health().await;
        assert_eq!(report, HealthReport { checked: 5, unhealthy: 1, replaced: 1 });

        let nodes = scaler.nodes().await;
        assert_eq!(nodes.len(), 5);
        assert!(nodes.iter().all(|n| n.id() != victim.id()));
        let replacement = nodes
            .iter()
            .find(|n| n.specialization() == Specialization::Ethics)
            .unwrap();
        assert_eq!(replacement.region(), victim.region());
        assert_eq!(replacement.status, NodeStatus::Ready);

        let mut saw_unhealthy = false;
        let mut saw_recovered = false;
        while let Ok(event) = rx.try_recv() {
            match event {
                CoreEvent::NodeUnhealthy { node_id } => saw_unhealthy |= node_id == victim.id(),
                CoreEvent::NodeRecovered { failed_node_id, .. } => saw_recovered |= failed_node_id == victim.id(),
                _ => {}
            }
        }
        assert!(saw_unhealthy && saw_recovered);
        scaler.stop().await;
    }

    #[tokio::test]
    async fn test_evaluate_requires_ready_coordinator() {
        let scaler = build(scaler_config(5, 50, 5), Arc::new(AlwaysHealthy));
        let err = scaler.evaluate_opportunity(&benign_opportunity()).await.unwrap_err();
        assert!(matches!(err, ConclaveError::NotReady(_)));
    }

    #[tokio::test]
    async fn test_evaluate_reserves_and_restores_nodes() {
        let mut cfg = scaler_config(5, 50, 6);
        cfg.regions = vec!["us-east".into()];
        cfg.reservation_size = 4;
        let scaler = build(cfg, Arc::new(AlwaysHealthy));
        scaler.start().await;

        let consensus = scaler.evaluate_opportunity(&benign_opportunity()).await.unwrap();
        assert_eq!(consensus.votes.len(), 6);
        assert_eq!(consensus.decision, Decision::Execute);

        let stats = scaler.get_stats().await;
        assert_eq!(stats.busy, 0);
        assert_eq!(stats.ready, 6);
        assert_eq!(stats.total_evaluations, 4);
        assert_eq!(stats.consensus_rate, 1.0);
        assert_eq!(scaler.recent_consensus(10).await.len(), 1);
        scaler.stop().await;
    }

    #[tokio::test]
    async fn test_factory_failure_is_contained() {
        let events = EventBus::default();
        let mut rx = events.subscribe();
        let scaler = NodePoolScaler::new(
            scaler_config(5, 50, 5),
            consensus_config(),
            Arc::new(BrokenFactory),
            Arc::new(AlwaysHealthy),
            events,
        );
        assert_eq!(scaler.start().await, 0);
        assert_eq!(scaler.get_stats().await.total_nodes, 0);
        assert!(scaler.evaluate_opportunity(&benign_opportunity()).await.is_err());

        // No node made it into the pool, so none was announced.
        while let Ok(event) = rx.try_recv() {
            assert!(!matches!(event, CoreEvent::NodeCreated { .. }), "unexpected {event:?}");
        }
        scaler.stop().await;
    }

    #[tokio::test]
    async fn test_node_created_only_for_pooled_nodes() {
        let events = EventBus::default();
        let mut rx = events.subscribe();
        let scaler = NodePoolScaler::new(
            scaler_config(5, 50, 5),
            consensus_config(),
            Arc::new(HeuristicEvaluatorFactory),
            Arc::new(AlwaysHealthy),
            events,
        );
        assert_eq!(scaler.start().await, 5);

        let pooled: HashSet<String> = scaler.nodes().await.iter().map(|n| n.id().to_string()).collect();
        let mut announced = HashSet::new();
        while let Ok(event) = rx.try_recv() {
            if let CoreEvent::NodeCreated { node_id, .. } = event {
                assert!(pooled.contains(&node_id), "{node_id} announced but not pooled");
                announced.insert(node_id);
            }
        }
        assert_eq!(announced, pooled);
        scaler.stop().await;
    }

    #[tokio::test]
    async fn test_scale_history_is_bounded() {
        let mut cfg = scaler_config(4, 12, 4);
        cfg.cooldown_ms = 0;
        cfg.history_size = 3;
        let scaler = build(cfg, Arc::new(AlwaysHealthy));
        scaler.start().await;

        let mut applied = Vec::new();
        for round in 0..8 {
            let total = scaler.get_stats().await.total_nodes;
            set_busy(&scaler, if round % 2 == 0 { total } else { 0 }).await;
            let record = scaler.check_scaling().await.expect("every check should scale");
            applied.push((record.direction, record.from, record.to));
            let mut pool = scaler.shared.pool.lock().await;
            for n in pool.nodes.values_mut() {
                n.status = NodeStatus::Ready;
            }
        }

        let history = scaler.scale_history().await;
        assert_eq!(history.len(), 3);
        let kept: Vec<_> = history.iter().map(|r| (r.direction, r.from, r.to)).collect();
        assert_eq!(kept, applied[5..].to_vec());
        assert_eq!(scaler.get_stats().await.scale_operations, 8);
        scaler.stop().await;
    }

    #[tokio::test]
    async fn test_stop_marks_nodes_stopped_and_restart_is_cold() {
        let scaler = build(scaler_config(5, 50, 5), Arc::new(AlwaysHealthy));
        scaler.start().await;
        scaler.stop().await;

        let stats = scaler.get_stats().await;
        assert!(!stats.running);
        assert_eq!(stats.stopped, 5);
        assert_eq!(stats.total_nodes, 0);

        assert_eq!(scaler.start().await, 5);
        let stats = scaler.get_stats().await;
        assert_eq!(stats.ready, 5);
        assert_eq!(stats.stopped, 0);
        scaler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_health_loop_replaces_nodes() {
        let probe = Arc::new(ScriptedProbe::default());
        let mut cfg = scaler_config(5, 50, 5);
        cfg.health_check_interval_ms = 1_000;
        let scaler = NodePoolScaler::new(
            cfg,
            consensus_config(),
            Arc::new(HeuristicEvaluatorFactory),
            probe.clone(),
            EventBus::default(),
        );
        scaler.start().await;
        let victim = scaler.nodes().await[0].id().to_string();
        probe.fail(&victim);

        tokio::time::sleep(Duration::from_millis(1_500)).await;

        let nodes = scaler.nodes().await;
        assert_eq!(nodes.len(), 5);
        assert!(nodes.iter().all(|n| n.id() != victim));
        scaler.stop().await;
    }
}
