//! Configuration loading from TOML.
//!
//! Reads `config.toml` and deserializes into strongly-typed structs. Every
//! tunable has a serde default so a partial file (or an empty one) yields a
//! working configuration; `validate` rejects inconsistent combinations.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::time::Duration;

use crate::pipeline::context::ExecutionState;
use crate::types::{ConclaveError, Specialization};

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub consensus: ConsensusConfig,
    #[serde(default)]
    pub scaler: ScalerConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub dashboard: DashboardConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AgentConfig {
    pub name: String,
    /// Seconds between synthetic opportunities in the demo loop.
    pub feed_interval_secs: u64,
    /// Simulated health-probe failure rate (0.0 disables failures).
    pub simulated_failure_rate: f64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: "CONCLAVE-001".to_string(),
            feed_interval_secs: 5,
            simulated_failure_rate: 0.0,
        }
    }
}

// ---------------------------------------------------------------------------
// Consensus
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct ConsensusConfig {
    /// Minimum registered evaluators before a round may start.
    pub min_instances: usize,
    /// Coordinator capacity.
    pub max_instances: usize,
    /// Weighted share required to execute (or reject).
    pub consensus_threshold: f64,
    /// Fraction of registered evaluators that must vote.
    pub quorum_threshold: f64,
    /// Global deadline for one round.
    pub voting_timeout_ms: u64,
    /// Per-evaluator call deadline; defaults to the round deadline.
    pub evaluator_timeout_ms: Option<u64>,
    pub enable_ethics_veto: bool,
    /// Completed rounds kept in the history ring buffer.
    pub history_size: usize,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            min_instances: 3,
            max_instances: 10,
            consensus_threshold: 0.7,
            quorum_threshold: 0.6,
            voting_timeout_ms: 5_000,
            evaluator_timeout_ms: None,
            enable_ethics_veto: true,
            history_size: 100,
        }
    }
}

impl ConsensusConfig {
    pub fn voting_timeout(&self) -> Duration {
        Duration::from_millis(self.voting_timeout_ms)
    }

    pub fn evaluator_timeout(&self) -> Duration {
        Duration::from_millis(self.evaluator_timeout_ms.unwrap_or(self.voting_timeout_ms))
    }

    pub fn validate(&self) -> Result<(), ConclaveError> {
        if self.max_instances == 0 || self.min_instances > self.max_instances {
            return Err(ConclaveError::Config(format!(
                "consensus: min_instances ({}) must be <= max_instances ({}) and max > 0",
                self.min_instances, self.max_instances
            )));
        }
        for (name, v) in [
            ("consensus_threshold", self.consensus_threshold),
            ("quorum_threshold", self.quorum_threshold),
        ] {
            if !(0.0..=1.0).contains(&v) {
                return Err(ConclaveError::Config(format!(
                    "consensus: {name} must be within [0, 1], got {v}"
                )));
            }
        }
        if self.history_size == 0 {
            return Err(ConclaveError::Config("consensus: history_size must be > 0".into()));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Scaler
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct ScalerConfig {
    pub min_nodes: usize,
    pub max_nodes: usize,
    /// Nodes provisioned by `start`; defaults to `min_nodes`.
    pub initial_nodes: Option<usize>,
    pub scale_up_threshold: f64,
    pub scale_down_threshold: f64,
    pub health_check_interval_ms: u64,
    pub scale_check_interval_ms: u64,
    pub cooldown_ms: u64,
    pub regions: Vec<String>,
    /// Ready nodes reserved busy per pool-level evaluation.
    pub reservation_size: usize,
    pub default_weight: f64,
    pub weights: HashMap<Specialization, f64>,
    /// Applied scale operations kept in the history ring buffer.
    pub history_size: usize,
}

impl Default for ScalerConfig {
    fn default() -> Self {
        Self {
            min_nodes: 5,
            max_nodes: 50,
            initial_nodes: None,
            scale_up_threshold: 0.75,
            scale_down_threshold: 0.25,
            health_check_interval_ms: 10_000,
            scale_check_interval_ms: 30_000,
            cooldown_ms: 60_000,
            regions: vec!["us-east".to_string(), "eu-west".to_string()],
            reservation_size: 5,
            default_weight: 1.0,
            weights: HashMap::new(),
            history_size: 100,
        }
    }
}

impl ScalerConfig {
    pub fn initial_nodes(&self) -> usize {
        self.initial_nodes
            .unwrap_or(self.min_nodes)
            .clamp(self.min_nodes, self.max_nodes)
    }

    pub fn weight_for(&self, specialization: Specialization) -> f64 {
        self.weights
            .get(&specialization)
            .copied()
            .unwrap_or(self.default_weight)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn validate(&self) -> Result<(), ConclaveError> {
        if self.max_nodes == 0 || self.min_nodes > self.max_nodes {
            return Err(ConclaveError::Config(format!(
                "scaler: min_nodes ({}) must be <= max_nodes ({}) and max > 0",
                self.min_nodes, self.max_nodes
            )));
        }
        if self.regions.is_empty() {
            return Err(ConclaveError::Config("scaler: at least one region is required".into()));
        }
        for (name, v) in [
            ("scale_up_threshold", self.scale_up_threshold),
            ("scale_down_threshold", self.scale_down_threshold),
        ] {
            if !(0.0..=1.0).contains(&v) {
                return Err(ConclaveError::Config(format!(
                    "scaler: {name} must be within [0, 1], got {v}"
                )));
            }
        }
        if !(self.default_weight.is_finite() && self.default_weight > 0.0) {
            return Err(ConclaveError::Config(format!(
                "scaler: default_weight must be > 0, got {}",
                self.default_weight
            )));
        }
        if let Some((specialization, w)) = self
            .weights
            .iter()
            .find(|(_, w)| !(w.is_finite() && **w > 0.0))
        {
            return Err(ConclaveError::Config(format!(
                "scaler: weight for {specialization} must be > 0, got {w}"
            )));
        }
        if self.scale_down_threshold >= self.scale_up_threshold {
            return Err(ConclaveError::Config(format!(
                "scaler: scale_down_threshold ({}) must be below scale_up_threshold ({})",
                self.scale_down_threshold, self.scale_up_threshold
            )));
        }
        if self.health_check_interval_ms == 0 || self.scale_check_interval_ms == 0 {
            return Err(ConclaveError::Config("scaler: check intervals must be > 0".into()));
        }
        if self.history_size == 0 {
            return Err(ConclaveError::Config("scaler: history_size must be > 0".into()));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Static behaviour of one pipeline stage.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct StageConfig {
    pub timeout_ms: u64,
    pub retryable: bool,
    pub required: bool,
    pub validate_checkpoint: bool,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            retryable: true,
            required: true,
            validate_checkpoint: false,
        }
    }
}

impl StageConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct PipelineConfig {
    pub default_max_retries: u32,
    /// Base delay before a budgeted retry; doubles with every retry spent.
    pub retry_backoff_ms: u64,
    /// Finished contexts kept for inspection.
    pub history_size: usize,
    pub stages: HashMap<ExecutionState, StageConfig>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            default_max_retries: 3,
            retry_backoff_ms: 100,
            history_size: 100,
            stages: HashMap::new(),
        }
    }
}

impl PipelineConfig {
    /// Stage config from the file, falling back to the built-in profile.
    pub fn stage_config(&self, state: ExecutionState) -> StageConfig {
        self.stages
            .get(&state)
            .cloned()
            .unwrap_or_else(|| default_stage_config(state))
    }
}

/// Built-in per-stage profile: detection and preparation are cheap to
/// repeat, validation is a one-shot gate, execution gets the longest
/// deadline, monitoring is best-effort.
pub fn default_stage_config(state: ExecutionState) -> StageConfig {
    match state {
        ExecutionState::Detecting => StageConfig {
            timeout_ms: 5_000,
            ..StageConfig::default()
        },
        ExecutionState::Validating => StageConfig {
            timeout_ms: 3_000,
            retryable: false,
            validate_checkpoint: true,
            ..StageConfig::default()
        },
        ExecutionState::Preparing => StageConfig {
            timeout_ms: 10_000,
            validate_checkpoint: true,
            ..StageConfig::default()
        },
        ExecutionState::Executing => StageConfig {
            timeout_ms: 30_000,
            retryable: false,
            validate_checkpoint: true,
            ..StageConfig::default()
        },
        ExecutionState::Monitoring => StageConfig {
            timeout_ms: 60_000,
            required: false,
            ..StageConfig::default()
        },
        _ => StageConfig::default(),
    }
}

// ---------------------------------------------------------------------------
// Persistence & dashboard
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, Clone, Default)]
pub struct PersistenceConfig {
    /// Directory for JSON context snapshots; `None` disables persistence.
    pub state_dir: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DashboardConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 8088,
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        Self::from_toml(&contents).with_context(|| format!("Invalid config file: {path}"))
    }

    /// Parse and validate configuration from a TOML string.
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: AppConfig =
            toml::from_str(contents).context("Failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConclaveError> {
        self.consensus.validate()?;
        self.scaler.validate()?;
        if !(0.0..=1.0).contains(&self.agent.simulated_failure_rate) {
            return Err(ConclaveError::Config(
                "agent: simulated_failure_rate must be within [0, 1]".into(),
            ));
        }
        Ok(())
    }
}
