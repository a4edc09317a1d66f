//! Synthetic opportunity feed.
//!
//! Stands in for the upstream detection/pathfinding layer when the agent runs
//! standalone: produces plausible opportunities with a matching route.

use chrono::{Duration, Utc};
use rand::seq::SliceRandom;
use rand::Rng;
use rust_decimal::Decimal;
use serde_json::json;

use crate::types::{Opportunity, Path, Urgency};

const KINDS: &[&str] = &["spatial", "triangular", "flash_loan", "liquidation", "sandwich"];
const TOKENS: &[&str] = &["WETH", "USDC", "USDT", "DAI", "WBTC", "ARB"];
const PROTOCOLS: &[&str] = &["uniswap-v3", "curve", "balancer", "sushiswap"];

#[derive(Debug, Clone)]
pub struct SyntheticFeed {
    max_expected_value: f64,
}

impl Default for SyntheticFeed {
    fn default() -> Self {
        Self {
            max_expected_value: 300.0,
        }
    }
}

impl SyntheticFeed {
    pub fn new(max_expected_value: f64) -> Self {
        Self {
            max_expected_value: max_expected_value.max(1.0),
        }
    }

    /// Draw one opportunity and its route.
    pub fn next(&self) -> (Opportunity, Path) {
        let mut rng = rand::thread_rng();

        let kind = KINDS.choose(&mut rng).copied().unwrap_or("spatial");
        let ev = rng.gen_range(0.0..self.max_expected_value);
        let expected_value = Decimal::from_f64_retain(ev)
            .unwrap_or_default()
            .round_dp(2);
        let urgency = match rng.gen_range(0..4) {
            0 => Urgency::Low,
            1 => Urgency::Medium,
            2 => Urgency::High,
            _ => Urgency::Critical,
        };
        let deadline = Utc::now() + Duration::seconds(rng.gen_range(5..60));

        let hops = if kind == "triangular" { 3 } else { 2 };
        let mut tokens: Vec<String> = TOKENS
            .choose_multiple(&mut rng, hops)
            .map(|t| t.to_string())
            .collect();
        if let Some(first) = tokens.first().cloned() {
            tokens.push(first);
        }
        let protocols: Vec<String> = (0..hops)
            .filter_map(|_| PROTOCOLS.choose(&mut rng).map(|p| p.to_string()))
            .collect();
        let pools = (0..hops).map(|i| format!("pool-{i}-{:04x}", rng.gen::<u16>())).collect();

        let opportunity = Opportunity::new(
            kind,
            json!({ "tokens": tokens, "protocols": protocols }),
            expected_value,
            rng.gen_range(0.0..1.0),
            urgency,
            deadline,
        );

        // Gas eats part of the gross value.
        let gas = Decimal::from_f64_retain(rng.gen_range(0.0..ev.max(1.0) * 0.3))
            .unwrap_or_default()
            .round_dp(2);
        let path = Path {
            id: uuid::Uuid::new_v4().to_string(),
            tokens,
            pools,
            protocols,
            net_profit: expected_value - gas,
        };

        (opportunity, path)
    }
}
