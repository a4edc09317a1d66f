//! CONCLAVE — consensus, node scaling and staged execution core
//!
//! Entry point. Loads configuration, initialises structured logging,
//! brings up the node pool and the execution pipeline, and feeds synthetic
//! opportunities through them until interrupted.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

use conclave::config;
use conclave::consensus::evaluators::HeuristicEvaluatorFactory;
use conclave::dashboard::{self, DashboardState};
use conclave::engine::feed::SyntheticFeed;
use conclave::engine::TradingCore;
use conclave::events::EventBus;
use conclave::pipeline::{
    DryRunStage, ExecutionPipeline, JsonFilePersistence, NoopPersistence, StatePersistence,
    PROCESSING_STAGES,
};
use conclave::scaler::{AlwaysHealthy, LivenessProbe, NodePoolScaler, RandomFailureProbe};

const BANNER: &str = r#"
  ____ ___  _   _  ____ _        ___     _______
 / ___/ _ \| \ | |/ ___| |      / \ \   / / ____|
| |  | | | |  \| | |   | |     / _ \ \ / /|  _|
| |__| |_| | |\  | |___| |___ / ___ \ V / | |___
 \____\___/|_| \_|\____|_____/_/   \_\_/  |_____|

  Weighted consensus · elastic node pool · staged execution
  v0.1.0
"#;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    let cfg = config::AppConfig::load("config.toml")?;

    init_logging();

    println!("{BANNER}");
    info!(
        agent_name = %cfg.agent.name,
        feed_interval_secs = cfg.agent.feed_interval_secs,
        regions = ?cfg.scaler.regions,
        "CONCLAVE starting up"
    );

    // -- Components ------------------------------------------------------

    let events = EventBus::default();
    let event_log = spawn_event_log(&events);

    let probe: Arc<dyn LivenessProbe> = if cfg.agent.simulated_failure_rate > 0.0 {
        Arc::new(RandomFailureProbe::new(cfg.agent.simulated_failure_rate))
    } else {
        Arc::new(AlwaysHealthy)
    };
    let scaler = Arc::new(NodePoolScaler::new(
        cfg.scaler.clone(),
        cfg.consensus.clone(),
        Arc::new(HeuristicEvaluatorFactory),
        probe,
        events.clone(),
    ));

    let persistence: Arc<dyn StatePersistence> = match &cfg.persistence.state_dir {
        Some(dir) => {
            info!(dir = %dir, "Persisting execution contexts");
            Arc::new(JsonFilePersistence::new(dir))
        }
        None => Arc::new(NoopPersistence),
    };
    let mut pipeline = ExecutionPipeline::new(cfg.pipeline.clone(), persistence, events.clone());
    for state in PROCESSING_STAGES {
        pipeline.register_handler(state, Arc::new(DryRunStage::new()))?;
    }

    let core = Arc::new(TradingCore::new(Arc::clone(&scaler), Arc::new(pipeline)));

    let nodes = scaler.start().await;
    info!(nodes, "Node pool ready");

    let dashboard_handle = if cfg.dashboard.enabled {
        let state = Arc::new(DashboardState::new(cfg.agent.name.clone(), Arc::clone(&core)));
        Some(dashboard::spawn_dashboard(state, cfg.dashboard.port).await?)
    } else {
        None
    };

    // -- Main loop -------------------------------------------------------

    let feed = SyntheticFeed::default();
    let mut interval = tokio::time::interval(Duration::from_secs(cfg.agent.feed_interval_secs.max(1)));
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    info!(
        interval_secs = cfg.agent.feed_interval_secs,
        "Entering main loop. Press Ctrl+C to stop."
    );

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let (opportunity, path) = feed.next();
                info!(%opportunity, "New opportunity");
                match core.process(opportunity, path).await {
                    Ok(outcome) => {
                        info!(consensus = %outcome.consensus, executed = outcome.executed(), "Opportunity processed");
                    }
                    Err(e) => {
                        error!(error = %e, "Processing failed, continuing");
                    }
                }
            }
            _ = &mut shutdown => {
                info!("Shutdown signal received.");
                break;
            }
        }
    }

    // -- Shutdown --------------------------------------------------------

    scaler.stop().await;
    if let Some(handle) = dashboard_handle {
        handle.abort();
    }
    event_log.abort();

    let counters = core.counters();
    let pool = scaler.get_stats().await;
    info!(
        processed = counters.processed,
        executed = counters.executed,
        failed = counters.failed,
        skipped = counters.skipped,
        scale_operations = pool.scale_operations,
        "CONCLAVE shut down cleanly."
    );

    Ok(())
}

/// Mirror lifecycle events into the debug log.
fn spawn_event_log(events: &EventBus) -> tokio::task::JoinHandle<()> {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(json) => debug!(target: "conclave::events", "{json}"),
                    Err(e) => warn!(error = %e, "Unserializable event"),
                },
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "Event log lagging, events dropped");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

/// Initialise the tracing subscriber with env-filter and optional JSON output.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("conclave=info"));

    let json_logging = std::env::var("CONCLAVE_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }
}
