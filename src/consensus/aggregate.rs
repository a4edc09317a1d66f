//! Weighted vote aggregation.
//!
//! Pure functions over a roster and the votes collected for one round.
//! Rates are normalised by the total *registered* weight, so evaluators that
//! abstain or never answer dilute both the approval and the reject rate.

use crate::config::ConsensusConfig;
use crate::types::{Decision, ExecutionParams, NodeConfig, Specialization, Vote, VoteChoice};

/// Outcome of reducing one round's votes.
#[derive(Debug, Clone, PartialEq)]
pub struct Tally {
    pub decision: Decision,
    pub approval_rate: f64,
    pub reject_rate: f64,
    pub average_confidence: f64,
    pub quorum_required: usize,
    pub quorum_met: bool,
    pub vetoed: bool,
    pub consensus_reached: bool,
    pub execution_params: Option<ExecutionParams>,
}

/// Votes needed before a round is decidable.
pub fn quorum_required(registered: usize, quorum_threshold: f64) -> usize {
    // Guard against 0.6 * 5 = 3.0000000000000004 rounding up to 4.
    let raw = registered as f64 * quorum_threshold;
    (raw - 1e-9).ceil().max(0.0) as usize
}

/// Reduce `votes` cast by members of `roster` into a decision.
///
/// Votes from evaluators not on the roster are ignored.
pub fn tally(roster: &[NodeConfig], votes: &[Vote], config: &ConsensusConfig) -> Tally {
    let quorum_required = quorum_required(roster.len(), config.quorum_threshold);
    let total_weight: f64 = roster.iter().map(|n| n.weight).sum();

    let mut approval_mass = 0.0;
    let mut reject_mass = 0.0;
    let mut confidence_sum = 0.0;
    let mut counted = 0usize;
    let mut vetoed = false;
    // (roster position, confidence, params) of the best approving override so far
    let mut best_params: Option<(usize, f64, &ExecutionParams)> = None;

    for vote in votes {
        let Some((position, node)) = roster
            .iter()
            .enumerate()
            .find(|(_, n)| n.id == vote.evaluator_id)
        else {
            continue;
        };

        let confidence = vote.confidence.clamp(0.0, 1.0);
        counted += 1;
        confidence_sum += confidence;

        match vote.choice {
            VoteChoice::Approve => {
                approval_mass += node.weight * confidence;
                if let Some(params) = &vote.execution_params {
                    let better = match best_params {
                        None => true,
                        Some((best_pos, best_conf, _)) => {
                            confidence > best_conf
                                || (confidence == best_conf && position < best_pos)
                        }
                    };
                    if better {
                        best_params = Some((position, confidence, params));
                    }
                }
            }
            VoteChoice::Reject => {
                reject_mass += node.weight * confidence;
                if config.enable_ethics_veto && node.specialization == Specialization::Ethics {
                    vetoed = true;
                }
            }
            VoteChoice::Abstain => {}
        }
    }

    let (approval_rate, reject_rate) = if total_weight > 0.0 {
        (
            (approval_mass / total_weight).clamp(0.0, 1.0),
            (reject_mass / total_weight).clamp(0.0, 1.0),
        )
    } else {
        (0.0, 0.0)
    };
    let average_confidence = if counted > 0 {
        confidence_sum / counted as f64
    } else {
        0.0
    };
    let quorum_met = counted > 0 && counted >= quorum_required;

    let (decision, consensus_reached, vetoed) = if !quorum_met {
        (Decision::NoConsensus, false, false)
    } else if vetoed {
        (Decision::Reject, true, true)
    } else if approval_rate >= config.consensus_threshold {
        (Decision::Execute, true, false)
    } else if reject_rate >= config.consensus_threshold {
        (Decision::Reject, true, false)
    } else {
        (Decision::NoConsensus, false, false)
    };

    let execution_params = if decision == Decision::Execute {
        best_params.map(|(_, _, p)| p.clone())
    } else {
        None
    };

    Tally {
        decision,
        approval_rate,
        reject_rate,
        average_confidence,
        quorum_required,
        quorum_met,
        vetoed,
        consensus_reached,
        execution_params,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
