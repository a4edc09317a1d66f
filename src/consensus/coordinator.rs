//! Consensus coordinator.
//!
//! Owns a roster of evaluators (bounded by `max_instances`) and runs one
//! voting round per opportunity: scatter to every evaluator, gather votes
//! until all answered or the round deadline fires, then tally.

use chrono::Utc;
use futures::FutureExt;
use serde::Serialize;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::aggregate::{self, Tally};
use super::{Assessment, Evaluator};
use crate::config::ConsensusConfig;
use crate::events::{CoreEvent, EventBus};
use crate::types::{ConclaveError, Consensus, Decision, NodeConfig, Opportunity, Vote};

// ---------------------------------------------------------------------------
// Roster
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct RegisteredEvaluator {
    node: NodeConfig,
    evaluator: Arc<dyn Evaluator>,
}

/// Running totals for one coordinator.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CoordinatorStats {
    pub coordinator_id: String,
    pub region: String,
    pub instances: usize,
    pub rounds: u64,
    pub consensus_reached: u64,
    pub executed: u64,
    pub rejected: u64,
    pub timed_out: u64,
}

impl CoordinatorStats {
    /// Share of rounds that reached a decision (0.0 when idle).
    pub fn consensus_rate(&self) -> f64 {
        if self.rounds == 0 {
            0.0
        } else {
            self.consensus_reached as f64 / self.rounds as f64
        }
    }
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

pub struct ConsensusCoordinator {
    id: String,
    region: String,
    config: ConsensusConfig,
    roster: RwLock<Vec<RegisteredEvaluator>>,
    history: Mutex<VecDeque<Consensus>>,
    stats: Mutex<CoordinatorStats>,
    events: EventBus,
}

/// What one evaluator task reports back to the round.
enum VoteOutcome {
    Cast(Vote),
    Failed { evaluator_id: String, error: String },
    TimedOut { evaluator_id: String },
}

impl ConsensusCoordinator {
    pub fn new(
        id: impl Into<String>,
        region: impl Into<String>,
        config: ConsensusConfig,
        events: EventBus,
    ) -> Self {
        let id = id.into();
        let region = region.into();
        Self {
            stats: Mutex::new(CoordinatorStats {
                coordinator_id: id.clone(),
                region: region.clone(),
                ..Default::default()
            }),
            history: Mutex::new(VecDeque::with_capacity(config.history_size)),
            roster: RwLock::new(Vec::new()),
            id,
            region,
            config,
            events,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn config(&self) -> &ConsensusConfig {
        &self.config
    }

    /// Add an evaluator to the roster.
    ///
    /// Fails with `Capacity` once `max_instances` are registered and with
    /// `DuplicateInstance` if the id is already on the roster. A node's
    /// weight and specialization are fixed once registered.
    pub async fn register_instance(
        &self,
        node: NodeConfig,
        evaluator: Arc<dyn Evaluator>,
    ) -> Result<(), ConclaveError> {
        let mut roster = self.roster.write().await;

        if roster.iter().any(|r| r.node.id == node.id) {
            warn!(coordinator = %self.id, instance = %node.id, "Duplicate evaluator registration refused");
            return Err(ConclaveError::DuplicateInstance(format!(
                "{} is already registered with coordinator {}",
                node.id, self.id
            )));
        }
        if roster.len() >= self.config.max_instances {
            return Err(ConclaveError::Capacity(format!(
                "coordinator {} is full ({} instances)",
                self.id, self.config.max_instances
            )));
        }

        info!(
            coordinator = %self.id,
            instance = %node.id,
            specialization = %node.specialization,
            weight = node.weight,
            "Evaluator registered"
        );
        self.events.publish(CoreEvent::InstanceRegistered {
            coordinator_id: self.id.clone(),
            instance_id: node.id.clone(),
            specialization: node.specialization,
        });
        roster.push(RegisteredEvaluator { node, evaluator });
        Ok(())
    }

    /// Remove an evaluator. Returns false if it was not registered.
    pub async fn unregister_instance(&self, id: &str) -> bool {
        let mut roster = self.roster.write().await;
        let before = roster.len();
        roster.retain(|r| r.node.id != id);
        let removed = roster.len() < before;
        drop(roster);

        if removed {
            info!(coordinator = %self.id, instance = id, "Evaluator unregistered");
            self.events.publish(CoreEvent::InstanceUnregistered {
                coordinator_id: self.id.clone(),
                instance_id: id.to_string(),
            });
        }
        removed
    }

    pub async fn instance_count(&self) -> usize {
        self.roster.read().await.len()
    }

    pub async fn has_capacity(&self) -> bool {
        self.instance_count().await < self.config.max_instances
    }

    /// Whether enough evaluators are registered to hold a round.
    pub async fn is_ready(&self) -> bool {
        let count = self.instance_count().await;
        count > 0 && count >= self.config.min_instances
    }

    /// Run one voting round for `opportunity`.
    ///
    /// Only "cannot even attempt" conditions are errors; every round that
    /// starts resolves to a `Consensus`, whatever the evaluators do.
    pub async fn evaluate_opportunity(
        &self,
        opportunity: &Opportunity,
    ) -> Result<Consensus, ConclaveError> {
        let roster: Vec<RegisteredEvaluator> = self.roster.read().await.clone();
        if roster.is_empty() || roster.len() < self.config.min_instances {
            return Err(ConclaveError::NotReady(format!(
                "coordinator {} has {} evaluators, needs {}",
                self.id,
                roster.len(),
                self.config.min_instances.max(1)
            )));
        }

        let started = Instant::now();
        self.events.publish(CoreEvent::RoundStarted {
            coordinator_id: self.id.clone(),
            opportunity_id: opportunity.id.clone(),
            evaluators: roster.len(),
        });
        debug!(
            coordinator = %self.id,
            opportunity = %opportunity.id,
            evaluators = roster.len(),
            "Voting round started"
        );

        let nodes: Vec<NodeConfig> = roster.iter().map(|r| r.node.clone()).collect();

        let (votes, round_timed_out) = if opportunity.is_expired() {
            (Vec::new(), false)
        } else {
            self.collect_votes(&roster, opportunity).await
        };

        let tally = aggregate::tally(&nodes, &votes, &self.config);
        let consensus = self.finish_round(opportunity, nodes, votes, tally, started, round_timed_out);

        self.record(&consensus).await;
        Ok(consensus)
    }

    /// Scatter the opportunity to every evaluator and gather what arrives
    /// before the round deadline. Votes come back in registration order.
    async fn collect_votes(
        &self,
        roster: &[RegisteredEvaluator],
        opportunity: &Opportunity,
    ) -> (Vec<Vote>, bool) {
        let shared = Arc::new(opportunity.clone());
        let call_timeout = self.config.evaluator_timeout();
        let mut tasks = JoinSet::new();

        for (position, entry) in roster.iter().enumerate() {
            let evaluator = Arc::clone(&entry.evaluator);
            let evaluator_id = entry.node.id.clone();
            let opportunity = Arc::clone(&shared);
            tasks.spawn(async move {
                let call_started = Instant::now();
                let call = AssertUnwindSafe(evaluator.evaluate(&opportunity)).catch_unwind();
                let outcome = match tokio::time::timeout(call_timeout, call).await {
                    Ok(Ok(Ok(assessment))) => VoteOutcome::Cast(into_vote(
                        assessment,
                        &evaluator_id,
                        &opportunity.id,
                        call_started.elapsed().as_millis() as u64,
                    )),
                    Ok(Ok(Err(e))) => VoteOutcome::Failed {
                        evaluator_id,
                        error: format!("{e:#}"),
                    },
                    Ok(Err(_panic)) => VoteOutcome::Failed {
                        evaluator_id,
                        error: "evaluator panicked".to_string(),
                    },
                    Err(_elapsed) => VoteOutcome::TimedOut { evaluator_id },
                };
                (position, outcome)
            });
        }

        let deadline = tokio::time::sleep(self.config.voting_timeout());
        tokio::pin!(deadline);

        let mut collected: Vec<(usize, Vote)> = Vec::with_capacity(roster.len());
        let mut timed_out = false;

        loop {
            tokio::select! {
                joined = tasks.join_next() => match joined {
                    None => break,
                    Some(Ok((position, VoteOutcome::Cast(vote)))) => {
                        self.events.publish(CoreEvent::VoteReceived {
                            coordinator_id: self.id.clone(),
                            opportunity_id: vote.opportunity_id.clone(),
                            evaluator_id: vote.evaluator_id.clone(),
                            choice: vote.choice,
                        });
                        collected.push((position, vote));
                    }
                    Some(Ok((_, VoteOutcome::Failed { evaluator_id, error }))) => {
                        let err = ConclaveError::VoteCollection { evaluator_id, message: error };
                        warn!(coordinator = %self.id, error = %err, "No vote");
                    }
                    Some(Ok((_, VoteOutcome::TimedOut { evaluator_id }))) => {
                        let err = ConclaveError::VoteCollection {
                            evaluator_id,
                            message: format!("no answer within {}ms", call_timeout.as_millis()),
                        };
                        warn!(coordinator = %self.id, error = %err, "No vote");
                    }
                    Some(Err(e)) => {
                        warn!(coordinator = %self.id, error = %e, "Evaluator task aborted");
                    }
                },
                _ = &mut deadline => {
                    timed_out = true;
                    break;
                }
            }
        }

        if timed_out {
            warn!(
                coordinator = %self.id,
                opportunity = %opportunity.id,
                received = collected.len(),
                pending = tasks.len(),
                "Voting round deadline reached, discarding late votes"
            );
        }
        // Late evaluators are cancelled; nothing they return can be observed.
        tasks.abort_all();

        collected.sort_by_key(|(position, _)| *position);
        (collected.into_iter().map(|(_, v)| v).collect(), timed_out)
    }

    fn finish_round(
        &self,
        opportunity: &Opportunity,
        nodes: Vec<NodeConfig>,
        votes: Vec<Vote>,
        tally: Tally,
        started: Instant,
        round_timed_out: bool,
    ) -> Consensus {
        let latency_ms = started.elapsed().as_millis() as u64;

        // A decision on an opportunity whose deadline passed is worthless.
        let (decision, consensus_reached, execution_params) = if opportunity.is_expired() {
            (Decision::Timeout, false, None)
        } else {
            (tally.decision, tally.consensus_reached, tally.execution_params)
        };

        let consensus = Consensus {
            opportunity_id: opportunity.id.clone(),
            coordinator_id: self.id.clone(),
            decision,
            votes,
            approval_rate: tally.approval_rate,
            reject_rate: tally.reject_rate,
            average_confidence: tally.average_confidence,
            consensus_reached,
            vetoed: tally.vetoed && decision == Decision::Reject,
            quorum_required: tally.quorum_required,
            execution_params,
            latency_ms,
            timestamp: Utc::now(),
        };

        info!(
            coordinator = %self.id,
            opportunity = %opportunity.id,
            decision = %consensus.decision,
            votes = consensus.votes.len(),
            registered = nodes.len(),
            approval = format!("{:.2}", consensus.approval_rate),
            reject = format!("{:.2}", consensus.reject_rate),
            vetoed = consensus.vetoed,
            round_timed_out,
            latency_ms,
            "Voting round complete"
        );
        self.events.publish(CoreEvent::ConsensusReached {
            coordinator_id: self.id.clone(),
            opportunity_id: opportunity.id.clone(),
            decision: consensus.decision,
            approval_rate: consensus.approval_rate,
            latency_ms,
        });
        consensus
    }

    async fn record(&self, consensus: &Consensus) {
        {
            let mut history = self.history.lock().await;
            if history.len() >= self.config.history_size {
                history.pop_front();
            }
            history.push_back(consensus.clone());
        }

        let mut stats = self.stats.lock().await;
        stats.rounds += 1;
        if consensus.consensus_reached {
            stats.consensus_reached += 1;
        }
        match consensus.decision {
            Decision::Execute => stats.executed += 1,
            Decision::Reject => stats.rejected += 1,
            Decision::Timeout => stats.timed_out += 1,
            Decision::NoConsensus => {}
        }
    }

    /// Most recent rounds, newest first.
    pub async fn history(&self, limit: usize) -> Vec<Consensus> {
        self.history
            .lock()
            .await
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    pub async fn stats(&self) -> CoordinatorStats {
        let mut stats = self.stats.lock().await.clone();
        stats.instances = self.instance_count().await;
        stats
    }
}

fn into_vote(assessment: Assessment, evaluator_id: &str, opportunity_id: &str, measured_ms: u64) -> Vote {
    Vote {
        evaluator_id: evaluator_id.to_string(),
        opportunity_id: opportunity_id.to_string(),
        choice: assessment.choice,
        confidence: assessment.confidence.clamp(0.0, 1.0),
        reasoning: assessment.reasoning,
        execution_params: assessment.execution_params,
        timestamp: Utc::now(),
        latency_ms: assessment.processing_time_ms.unwrap_or(measured_ms),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
