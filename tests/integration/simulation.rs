//! Synthetic trading session.
//!
//! Streams generated opportunities through the full core (pool consensus →
//! execution pipeline with file persistence) and checks the invariants that
//! must hold across the whole session.

use std::sync::Arc;

use conclave::config::{ConsensusConfig, PipelineConfig, ScalerConfig};
use conclave::consensus::evaluators::HeuristicEvaluatorFactory;
use conclave::engine::feed::SyntheticFeed;
use conclave::engine::TradingCore;
use conclave::events::EventBus;
use conclave::pipeline::{
    DryRunStage, ExecutionPipeline, ExecutionState, JsonFilePersistence, PROCESSING_STAGES,
};
use conclave::scaler::{AlwaysHealthy, NodePoolScaler};

const ORDER: [ExecutionState; 7] = [
    ExecutionState::Pending,
    ExecutionState::Detecting,
    ExecutionState::Validating,
    ExecutionState::Preparing,
    ExecutionState::Executing,
    ExecutionState::Monitoring,
    ExecutionState::Completed,
];

/// Non-terminal-failure states visited follow the declared order.
fn follows_stage_order(history: &[ExecutionState]) -> bool {
    let mut order = ORDER.iter();
    history
        .iter()
        .filter(|s| !matches!(s, ExecutionState::Failed | ExecutionState::Cancelled))
        .all(|s| order.any(|o| o == s))
}

#[tokio::test]
async fn test_synthetic_session() {
    let state_dir = std::env::temp_dir().join(format!("conclave_sim_{}", uuid::Uuid::new_v4()));
    let store = Arc::new(JsonFilePersistence::new(&state_dir));
    let events = EventBus::default();

    let scaler = Arc::new(NodePoolScaler::new(
        ScalerConfig {
            min_nodes: 5,
            initial_nodes: Some(10),
            regions: vec!["us-east".into()],
            health_check_interval_ms: 3_600_000,
            scale_check_interval_ms: 3_600_000,
            ..ScalerConfig::default()
        },
        ConsensusConfig::default(),
        Arc::new(HeuristicEvaluatorFactory),
        Arc::new(AlwaysHealthy),
        events.clone(),
    ));
    scaler.start().await;

    let mut pipeline = ExecutionPipeline::new(PipelineConfig::default(), store.clone(), events);
    for state in PROCESSING_STAGES {
        pipeline.register_handler(state, Arc::new(DryRunStage::new())).unwrap();
    }
    let core = TradingCore::new(Arc::clone(&scaler), Arc::new(pipeline));
    let feed = SyntheticFeed::default();

    for _ in 0..40 {
        let (opportunity, path) = feed.next();
        let kind = opportunity.kind.clone();
        let outcome = core.process(opportunity, path).await.unwrap();

        if kind == "sandwich" {
            assert!(outcome.consensus.vetoed, "predatory opportunity must be vetoed");
            assert!(outcome.execution.is_none());
        }
        match &outcome.execution {
            Some(execution) => {
                assert!(outcome.consensus.should_execute());
                let ctx = execution.context.as_ref().unwrap();
                assert!(ctx.state.is_terminal());
                assert!(follows_stage_order(&ctx.state_history));
            }
            None => assert!(!outcome.consensus.should_execute()),
        }
    }

    let counters = core.counters();
    assert_eq!(counters.processed, 40);
    assert_eq!(counters.executed + counters.failed + counters.skipped, 40);
    assert!(core.pipeline().active_executions().await.is_empty());

    // Persisted state matches the in-memory record.
    for ctx in core.pipeline().recent_executions().await {
        let saved = store.load(&ctx.id).await.unwrap().expect("context persisted");
        assert_eq!(saved.state, ctx.state);
        assert_eq!(saved.state_history, ctx.state_history);
    }

    let stats = scaler.get_stats().await;
    assert_eq!(stats.total_nodes, 10);
    assert_eq!(stats.busy, 0);

    scaler.stop().await;
    let _ = std::fs::remove_dir_all(&state_dir);
}
