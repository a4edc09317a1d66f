//! Scale planning: how big the pool should be for the observed load.

use serde::Serialize;
use std::fmt;

use crate::config::ScalerConfig;

/// Growth factor applied on scale-up.
const SCALE_UP_FACTOR: f64 = 1.5;

/// Fraction of the pool released on scale-down.
const SCALE_DOWN_FRACTION: f64 = 0.25;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScaleDirection {
    Up,
    Down,
}

impl fmt::Display for ScaleDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScaleDirection::Up => write!(f, "up"),
            ScaleDirection::Down => write!(f, "down"),
        }
    }
}

/// A planned resize from `from` nodes to `to` nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScalePlan {
    pub direction: ScaleDirection,
    pub from: usize,
    pub to: usize,
}

/// Busy share of the pool (0.0 for an empty pool).
pub fn load(busy: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        busy as f64 / total as f64
    }
}

/// Decide whether to resize. Cooldown is the caller's concern.
pub fn plan(total: usize, busy: usize, config: &ScalerConfig) -> Option<ScalePlan> {
    let load = load(busy, total);

    if load > config.scale_up_threshold && total < config.max_nodes {
        let to = ((total as f64 * SCALE_UP_FACTOR).ceil() as usize)
            .max(total + 1)
            .min(config.max_nodes);
        return Some(ScalePlan {
            direction: ScaleDirection::Up,
            from: total,
            to,
        });
    }

    if load < config.scale_down_threshold && total > config.min_nodes {
        let release = ((total as f64 * SCALE_DOWN_FRACTION).floor() as usize).max(1);
        let to = total.saturating_sub(release).max(config.min_nodes);
        return Some(ScalePlan {
            direction: ScaleDirection::Down,
            from: total,
            to,
        });
    }

    None
}
