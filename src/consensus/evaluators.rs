//! Built-in heuristic evaluators, one per specialization.
//!
//! These are intentionally simple rule sets so the agent can run without an
//! external decision service. Real deployments plug their own `Evaluator`s
//! in through an `EvaluatorFactory`.

use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::prelude::*;
use rust_decimal_macros::dec;
use serde_json::json;
use std::sync::Arc;

use super::{Assessment, Evaluator};
use crate::scaler::EvaluatorFactory;
use crate::types::{NodeConfig, Opportunity, Specialization, Urgency};

// ---------------------------------------------------------------------------
// Thresholds
// ---------------------------------------------------------------------------

/// Risk score above which the risk evaluator rejects.
const RISK_CEILING: f64 = 0.7;

/// Expected value (USD) below which an opportunity is not worth the gas.
const MIN_EXPECTED_VALUE: Decimal = dec!(1);

/// Opportunity types that extract value from other users' transactions.
const PREDATORY_KINDS: &[&str] = &["sandwich", "frontrun", "front_run", "jit_sandwich"];

/// Seconds-to-deadline under which the speed evaluator considers a
/// high-urgency opportunity still catchable only with aggressive params.
const FAST_LANE_SECS: i64 = 10;

// ---------------------------------------------------------------------------
// Heuristic evaluator
// ---------------------------------------------------------------------------

/// Rule-based evaluator whose rules depend on its specialization.
#[derive(Debug, Clone)]
pub struct HeuristicEvaluator {
    specialization: Specialization,
}

impl HeuristicEvaluator {
    pub fn new(specialization: Specialization) -> Self {
        Self { specialization }
    }

    fn assess(&self, opp: &Opportunity) -> Assessment {
        match self.specialization {
            Specialization::Risk => {
                if opp.risk > RISK_CEILING {
                    Assessment::reject(opp.risk, format!("risk {:.2} above ceiling {RISK_CEILING}", opp.risk))
                } else {
                    let params = json!({ "max_slippage_bps": slippage_for(opp.risk) });
                    Assessment::approve(1.0 - opp.risk, format!("risk {:.2} acceptable", opp.risk))
                        .with_params(params.as_object().cloned().unwrap_or_default())
                }
            }
            Specialization::Opportunity => {
                if opp.expected_value < MIN_EXPECTED_VALUE {
                    Assessment::reject(0.8, format!("expected value ${:.2} too small", opp.expected_value))
                } else {
                    // Confidence saturates at $100 of expected value.
                    let ev = opp.expected_value.to_f64().unwrap_or(0.0);
                    let confidence = (ev / 100.0).clamp(0.5, 1.0);
                    Assessment::approve(confidence, format!("expected value ${:.2}", opp.expected_value))
                }
            }
            Specialization::Ethics => {
                let kind = opp.kind.to_lowercase();
                if PREDATORY_KINDS.contains(&kind.as_str()) {
                    Assessment::reject(1.0, format!("'{}' extracts value from other users", opp.kind))
                } else {
                    Assessment::approve(0.9, "no user harm detected")
                }
            }
            Specialization::Speed => {
                if opp.is_expired() {
                    return Assessment::reject(1.0, "deadline already passed");
                }
                let remaining = opp.time_remaining().num_seconds();
                match opp.urgency {
                    Urgency::High | Urgency::Critical if remaining <= FAST_LANE_SECS => {
                        let params = json!({ "priority_fee_multiplier": 2.0 });
                        Assessment::approve(0.8, format!("{remaining}s left, needs fast lane"))
                            .with_params(params.as_object().cloned().unwrap_or_default())
                    }
                    Urgency::High | Urgency::Critical => {
                        Assessment::approve(0.9, format!("{remaining}s left"))
                    }
                    _ => Assessment::abstain("not time-sensitive"),
                }
            }
            Specialization::General => {
                let ev = opp.expected_value.to_f64().unwrap_or(0.0);
                let score = (ev / 50.0).min(1.0) * (1.0 - opp.risk);
                if score >= 0.3 {
                    Assessment::approve(score.max(0.5), format!("risk-adjusted score {score:.2}"))
                } else {
                    Assessment::reject(1.0 - score, format!("risk-adjusted score {score:.2}"))
                }
            }
        }
    }
}

/// Tighter slippage for riskier routes.
fn slippage_for(risk: f64) -> u32 {
    (50.0 * (1.0 - risk)).round().max(5.0) as u32
}

#[async_trait]
impl Evaluator for HeuristicEvaluator {
    async fn evaluate(&self, opportunity: &Opportunity) -> Result<Assessment> {
        Ok(self.assess(opportunity))
    }
}

/// Factory producing a `HeuristicEvaluator` matching each node's specialization.
#[derive(Debug, Clone, Default)]
pub struct HeuristicEvaluatorFactory;

impl EvaluatorFactory for HeuristicEvaluatorFactory {
    fn create(&self, node: &NodeConfig, _region: &str) -> Result<Arc<dyn Evaluator>> {
        Ok(Arc::new(HeuristicEvaluator::new(node.specialization)))
    }
}
