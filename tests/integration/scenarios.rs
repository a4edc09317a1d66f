//! End-to-end scenarios through the public API.

use chrono::Utc;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

use conclave::config::{ConsensusConfig, PipelineConfig, ScalerConfig, StageConfig};
use conclave::consensus::ConsensusCoordinator;
use conclave::events::EventBus;
use conclave::pipeline::{ExecutionPipeline, ExecutionState, NoopPersistence, PROCESSING_STAGES};
use conclave::scaler::{AlwaysHealthy, NodePoolScaler, ScaleDirection};
use conclave::types::*;

use crate::mocks::{FlakyStage, MockEvaluator, MockFactory, PassingStage};

fn opportunity() -> Opportunity {
    Opportunity::new(
        "spatial",
        serde_json::json!({ "dex_a": "uniswap-v3", "dex_b": "curve" }),
        dec!(64.2),
        0.25,
        Urgency::High,
        Utc::now() + chrono::Duration::minutes(5),
    )
}

fn consensus_config() -> ConsensusConfig {
    ConsensusConfig {
        min_instances: 3,
        max_instances: 10,
        consensus_threshold: 0.7,
        quorum_threshold: 0.6,
        voting_timeout_ms: 100,
        ..ConsensusConfig::default()
    }
}

async fn coordinator(evaluators: Vec<(Specialization, MockEvaluator)>) -> ConsensusCoordinator {
    let c = ConsensusCoordinator::new("coord-test", "us-east", consensus_config(), EventBus::default());
    for (i, (specialization, evaluator)) in evaluators.into_iter().enumerate() {
        assert_ok!(
            c.register_instance(NodeConfig::new(format!("e{i}"), 1.0, specialization), Arc::new(evaluator))
                .await
        );
    }
    c
}

// ---------------------------------------------------------------------------
// Consensus
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_four_of_five_approvals_execute() {
    let c = coordinator(vec![
        (Specialization::Risk, MockEvaluator::approve(1.0)),
        (Specialization::Opportunity, MockEvaluator::approve(1.0)),
        (Specialization::Speed, MockEvaluator::approve(1.0)),
        (Specialization::General, MockEvaluator::approve(1.0)),
        (Specialization::General, MockEvaluator::reject(1.0)),
    ])
    .await;

    let consensus = assert_ok!(c.evaluate_opportunity(&opportunity()).await);
    assert_eq!(consensus.decision, Decision::Execute);
    assert!((consensus.approval_rate - 0.8).abs() < 1e-9);
    assert!(consensus.consensus_reached);
    assert_eq!(consensus.votes.len(), 5);
}

#[tokio::test]
async fn test_ethics_reject_vetoes_majority() {
    let c = coordinator(vec![
        (Specialization::Risk, MockEvaluator::approve(1.0)),
        (Specialization::Opportunity, MockEvaluator::approve(1.0)),
        (Specialization::Speed, MockEvaluator::approve(1.0)),
        (Specialization::General, MockEvaluator::approve(1.0)),
        (Specialization::Ethics, MockEvaluator::reject(1.0)),
    ])
    .await;

    let consensus = assert_ok!(c.evaluate_opportunity(&opportunity()).await);
    assert_eq!(consensus.decision, Decision::Reject);
    assert!(consensus.vetoed);
    assert!((consensus.approval_rate - 0.8).abs() < 1e-9);
    assert!(!consensus.should_execute());
}

#[tokio::test(start_paused = true)]
async fn test_missing_quorum_is_no_consensus() {
    let slow = Duration::from_secs(10);
    let c = coordinator(vec![
        (Specialization::Risk, MockEvaluator::approve(1.0)),
        (Specialization::Opportunity, MockEvaluator::approve(1.0)),
        (Specialization::Speed, MockEvaluator::approve(1.0).with_delay(slow)),
        (Specialization::General, MockEvaluator::approve(1.0).with_delay(slow)),
        (Specialization::Ethics, MockEvaluator::approve(1.0).with_delay(slow)),
    ])
    .await;

    let consensus = assert_ok!(c.evaluate_opportunity(&opportunity()).await);
    assert_eq!(consensus.decision, Decision::NoConsensus);
    assert_eq!(consensus.votes.len(), 2);
    assert_eq!(consensus.quorum_required, 3);
    assert!(!consensus.consensus_reached);
}

#[tokio::test]
async fn test_failing_evaluators_do_not_fail_the_round() {
    let c = coordinator(vec![
        (Specialization::Risk, MockEvaluator::approve(0.9)),
        (Specialization::Opportunity, MockEvaluator::approve(0.9)),
        (Specialization::Speed, MockEvaluator::approve(0.9)),
        (Specialization::General, MockEvaluator::failing()),
    ])
    .await;

    let consensus = assert_ok!(c.evaluate_opportunity(&opportunity()).await);
    assert_eq!(consensus.votes.len(), 3);
    assert!(consensus.votes.iter().all(|v| v.choice == VoteChoice::Approve));
}

#[tokio::test]
async fn test_expired_opportunity_times_out() {
    let c = coordinator(vec![
        (Specialization::Risk, MockEvaluator::approve(1.0)),
        (Specialization::Opportunity, MockEvaluator::approve(1.0)),
        (Specialization::General, MockEvaluator::approve(1.0)),
    ])
    .await;
    let mut opp = opportunity();
    opp.deadline = Utc::now() - chrono::Duration::seconds(1);

    let consensus = assert_ok!(c.evaluate_opportunity(&opp).await);
    assert_eq!(consensus.decision, Decision::Timeout);
    assert!(!consensus.should_execute());
}

#[tokio::test]
async fn test_empty_coordinator_is_not_ready() {
    let c = coordinator(vec![]).await;
    let err = assert_err!(c.evaluate_opportunity(&opportunity()).await);
    assert!(matches!(err, ConclaveError::NotReady(_)));
    assert!(!c.unregister_instance("ghost").await);
}

// ---------------------------------------------------------------------------
// Scaling
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_scale_up_under_load_then_cooldown() {
    let scaler = Arc::new(NodePoolScaler::new(
        ScalerConfig {
            min_nodes: 5,
            max_nodes: 50,
            initial_nodes: Some(20),
            regions: vec!["us-east".into()],
            reservation_size: 16,
            cooldown_ms: 60_000,
            health_check_interval_ms: 3_600_000,
            scale_check_interval_ms: 3_600_000,
            ..ScalerConfig::default()
        },
        ConsensusConfig {
            max_instances: 20,
            voting_timeout_ms: 30_000,
            ..ConsensusConfig::default()
        },
        Arc::new(MockFactory::slow(Duration::from_secs(10))),
        Arc::new(AlwaysHealthy),
        EventBus::default(),
    ));
    assert_eq!(scaler.start().await, 20);

    // A slow round holds 16 of 20 nodes busy: load 0.8.
    let first = {
        let s = Arc::clone(&scaler);
        tokio::spawn(async move {
            let opp = opportunity();
            s.evaluate_opportunity(&opp).await
        })
    };
    while scaler.get_stats().await.busy < 16 {
        tokio::task::yield_now().await;
    }
    assert!((scaler.get_stats().await.load - 0.8).abs() < 1e-9);

    let record = scaler.check_scaling().await.expect("load 0.8 should scale up");
    assert_eq!(record.direction, ScaleDirection::Up);
    assert_eq!((record.from, record.to), (20, 30));

    // A second round saturates the grown pool, but the cooldown holds.
    let second = {
        let s = Arc::clone(&scaler);
        tokio::spawn(async move {
            let opp = opportunity();
            s.evaluate_opportunity(&opp).await
        })
    };
    while scaler.get_stats().await.busy < 30 {
        tokio::task::yield_now().await;
    }
    assert!(scaler.check_scaling().await.is_none());

    let first = first.await.unwrap().unwrap();
    let second = second.await.unwrap().unwrap();
    assert_eq!(first.decision, Decision::Execute);
    assert_eq!(second.decision, Decision::Execute);

    let stats = scaler.get_stats().await;
    assert_eq!(stats.busy, 0);
    assert_eq!(stats.total_evaluations, 30);

    // Idle pool, still cooling down.
    assert!(scaler.check_scaling().await.is_none());
    tokio::time::advance(Duration::from_secs(60)).await;
    let record = scaler.check_scaling().await.expect("idle pool shrinks after cooldown");
    assert_eq!(record.direction, ScaleDirection::Down);
    assert_eq!((record.from, record.to), (30, 23));
    assert_eq!(scaler.scale_history().await.len(), 2);

    scaler.stop().await;
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

fn stage(retryable: bool, required: bool) -> StageConfig {
    StageConfig {
        timeout_ms: 1_000,
        retryable,
        required,
        validate_checkpoint: false,
    }
}

fn pipeline() -> ExecutionPipeline {
    let mut p = ExecutionPipeline::new(PipelineConfig::default(), Arc::new(NoopPersistence), EventBus::default());
    for state in PROCESSING_STAGES {
        assert_ok!(p.register_stage(state, Arc::new(PassingStage::default()), stage(true, true)));
    }
    p
}

#[tokio::test(start_paused = true)]
async fn test_prepare_fails_twice_then_succeeds() {
    let preparing = Arc::new(FlakyStage::new(2));
    let executing = Arc::new(PassingStage::default());
    let mut p = pipeline();
    assert_ok!(p.register_stage(ExecutionState::Preparing, preparing.clone(), stage(true, true)));
    assert_ok!(p.register_stage(ExecutionState::Executing, executing.clone(), stage(false, true)));

    let result = p.execute(opportunity(), Path::new(dec!(250)), 3).await;

    assert!(result.success);
    assert_eq!(preparing.calls(), 3);
    assert_eq!(executing.calls(), 1);
    assert_eq!(executing.last_retry_count(), 1);
    assert_eq!(result.context.unwrap().retry_count, 1);
}

#[tokio::test]
async fn test_required_validation_failure_stops_before_execution() {
    let validating = Arc::new(FlakyStage::always_failing());
    let executing = Arc::new(PassingStage::default());
    let mut p = pipeline();
    assert_ok!(p.register_stage(ExecutionState::Validating, validating.clone(), stage(false, true)));
    assert_ok!(p.register_stage(ExecutionState::Executing, executing.clone(), stage(false, true)));

    let result = p.execute(opportunity(), Path::new(dec!(250)), 3).await;

    assert!(!result.success);
    assert_eq!(result.stage.to_string(), "Validating");
    assert!(!result.errors.is_empty());
    assert_eq!(validating.calls(), 1);
    assert_eq!(executing.calls(), 0);
    let ctx = result.context.unwrap();
    assert!(!ctx.state_history.contains(&ExecutionState::Executing));
    assert!(!p.cancel_execution(&ctx.id).await);
}
