//! Dashboard API route handlers.
//!
//! All endpoints return JSON. State is shared via `Arc<DashboardState>`.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::consensus::CoordinatorStats;
use crate::engine::{CoreCounters, TradingCore};
use crate::pipeline::{ExecutionContext, PipelineStats};
use crate::scaler::{Node, PoolStats, ScaleRecord};
use crate::types::Consensus;

/// Records returned when no `limit` is given.
const DEFAULT_LIMIT: usize = 50;

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

/// Shared state accessible by all route handlers.
pub struct DashboardState {
    pub agent_name: String,
    pub core: Arc<TradingCore>,
    pub started_at: DateTime<Utc>,
}

impl DashboardState {
    pub fn new(agent_name: impl Into<String>, core: Arc<TradingCore>) -> Self {
        Self {
            agent_name: agent_name.into(),
            core,
            started_at: Utc::now(),
        }
    }
}

pub type AppState = Arc<DashboardState>;

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<usize>,
}

impl LimitQuery {
    fn limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_LIMIT)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsResponse {
    pub agent: String,
    pub uptime_secs: i64,
    pub pool: PoolStats,
    pub pipeline: PipelineStats,
    pub decisions: CoreCounters,
    pub coordinators: Vec<CoordinatorStats>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionsResponse {
    pub active: Vec<ExecutionContext>,
    pub recent: Vec<ExecutionContext>,
}

// ---------------------------------------------------------------------------
// Route handlers
// ---------------------------------------------------------------------------

/// GET /api/stats
pub async fn get_stats(State(state): State<AppState>) -> Json<StatsResponse> {
    let core = &state.core;
    Json(StatsResponse {
        agent: state.agent_name.clone(),
        uptime_secs: (Utc::now() - state.started_at).num_seconds(),
        pool: core.scaler().get_stats().await,
        pipeline: core.pipeline().stats().await,
        decisions: core.counters(),
        coordinators: core.scaler().coordinator_stats().await,
    })
}

/// GET /api/consensus?limit=N
pub async fn get_consensus(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> Json<Vec<Consensus>> {
    Json(state.core.scaler().recent_consensus(query.limit()).await)
}

/// GET /api/executions?limit=N
pub async fn get_executions(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> Json<ExecutionsResponse> {
    let pipeline = state.core.pipeline();
    let mut recent = pipeline.recent_executions().await;
    recent.truncate(query.limit());
    Json(ExecutionsResponse {
        active: pipeline.active_executions().await,
        recent,
    })
}

/// GET /api/scaling
pub async fn get_scaling(State(state): State<AppState>) -> Json<Vec<ScaleRecord>> {
    Json(state.core.scaler().scale_history().await)
}

/// GET /api/nodes
pub async fn get_nodes(State(state): State<AppState>) -> Json<Vec<Node>> {
    Json(state.core.scaler().nodes().await)
}

/// GET /health
pub async fn health() -> StatusCode {
    StatusCode::OK
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
