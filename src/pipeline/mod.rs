//! Execution pipeline.
//!
//! Drives an accepted opportunity through a fixed sequence of stages
//! (Detecting → Validating → Preparing → Executing → Monitoring), each bound
//! to an external `StageHandler` with its own timeout, retry and
//! requiredness configuration. Every transition is persisted (advisory) and
//! published on the event bus.

pub mod context;
pub mod dry_run;
pub mod persistence;
pub mod stage;

pub use context::{ExecutionContext, ExecutionState, Priority, PROCESSING_STAGES};
pub use dry_run::DryRunStage;
pub use persistence::{JsonFilePersistence, NoopPersistence, StatePersistence};
pub use stage::{CheckpointResult, StageHandler};

use stage::validate_checkpoint;

use futures::FutureExt;
use serde::Serialize;
use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::{PipelineConfig, StageConfig};
use crate::events::{CoreEvent, EventBus};
use crate::types::{ConclaveError, ExecutionParams, Opportunity, Path};

const CANCELLED: &str = "execution cancelled";

struct RegisteredStage {
    handler: Arc<dyn StageHandler>,
    config: StageConfig,
}

struct ActiveExecution {
    context: ExecutionContext,
    cancel: watch::Sender<bool>,
    /// Set by `rollback`, consumed by the run loop at its next stage boundary.
    rollback_to: Option<ExecutionState>,
}

enum Attempt {
    Passed(Option<ExecutionContext>),
    Failed(Vec<String>),
    Panicked(String),
    Cancelled,
}

enum StageOutcome {
    Passed,
    Skipped,
    Failed(Vec<String>),
    Aborted(String),
    Cancelled,
}

enum Boundary {
    Continue,
    Resume(usize),
    Cancelled,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineStats {
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

pub struct ExecutionPipeline {
    config: PipelineConfig,
    stages: HashMap<ExecutionState, RegisteredStage>,
    active: RwLock<HashMap<String, ActiveExecution>>,
    recent: RwLock<VecDeque<ExecutionContext>>,
    persistence: Arc<dyn StatePersistence>,
    events: EventBus,
}

impl ExecutionPipeline {
    pub fn new(
        config: PipelineConfig,
        persistence: Arc<dyn StatePersistence>,
        events: EventBus,
    ) -> Self {
        Self {
            config,
            stages: HashMap::new(),
            active: RwLock::new(HashMap::new()),
            recent: RwLock::new(VecDeque::new()),
            persistence,
            events,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    // -----------------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------------

    /// Bind a handler and its static configuration to a processing state.
    /// Re-registering a state replaces the previous binding.
    pub fn register_stage(
        &mut self,
        state: ExecutionState,
        handler: Arc<dyn StageHandler>,
        config: StageConfig,
    ) -> Result<(), ConclaveError> {
        if state.stage_index().is_none() {
            return Err(ConclaveError::Config(format!(
                "{state} is not a processing stage"
            )));
        }
        debug!(
            stage = %state,
            timeout_ms = config.timeout_ms,
            retryable = config.retryable,
            required = config.required,
            validate_checkpoint = config.validate_checkpoint,
            "Stage registered"
        );
        self.stages.insert(state, RegisteredStage { handler, config });
        Ok(())
    }

    /// Register with the configured (or default) settings for `state`.
    pub fn register_handler(
        &mut self,
        state: ExecutionState,
        handler: Arc<dyn StageHandler>,
    ) -> Result<(), ConclaveError> {
        let config = self.config.stage_config(state);
        self.register_stage(state, handler, config)
    }

    pub fn has_stage(&self, state: ExecutionState) -> bool {
        self.stages.contains_key(&state)
    }

    // -----------------------------------------------------------------------
    // Execution
    // -----------------------------------------------------------------------

    pub async fn execute(
        &self,
        opportunity: Opportunity,
        path: Path,
        max_retries: u32,
    ) -> CheckpointResult {
        self.execute_with_metadata(opportunity, path, max_retries, ExecutionParams::new())
            .await
    }

    /// Run a new execution to a terminal state.
    ///
    /// Never fails outright: stage errors, timeouts, cancellation and
    /// handler panics all come back as a `CheckpointResult` with
    /// `success = false` and populated `errors`.
    pub async fn execute_with_metadata(
        &self,
        opportunity: Opportunity,
        path: Path,
        max_retries: u32,
        metadata: ExecutionParams,
    ) -> CheckpointResult {
        let mut context = ExecutionContext::new(opportunity, path, max_retries);
        context.metadata = metadata;

        let (cancel, cancel_rx) = watch::channel(false);
        self.active.write().await.insert(
            context.id.clone(),
            ActiveExecution {
                context: context.clone(),
                cancel,
                rollback_to: None,
            },
        );
        self.persist(&context).await;

        info!(
            execution_id = %context.id,
            opportunity = %context.opportunity.id,
            kind = %context.opportunity.kind,
            priority = %context.priority,
            net_profit = %context.path.net_profit,
            "Execution started"
        );

        self.run(context, cancel_rx).await
    }

    async fn run(
        &self,
        mut ctx: ExecutionContext,
        mut cancel: watch::Receiver<bool>,
    ) -> CheckpointResult {
        let mut index = 0;
        loop {
            match self.boundary(&mut ctx).await {
                Boundary::Cancelled => return self.cancelled_result(ctx),
                Boundary::Resume(i) => index = i,
                Boundary::Continue => {}
            }
            let Some(&state) = PROCESSING_STAGES.get(index) else {
                break;
            };

            let Some(stage) = self.stages.get(&state) else {
                let err = ConclaveError::NoHandler(state.to_string()).to_string();
                ctx.errors.push(err.clone());
                return self.fail(ctx, state, vec![err]).await;
            };

            ctx.transition(state);
            if !self.store(&ctx).await {
                return self.cancelled_result(ctx);
            }
            self.events.publish(CoreEvent::StageStarted {
                execution_id: ctx.id.clone(),
                stage: state.to_string(),
            });

            let started = Instant::now();
            match self.run_stage(&mut ctx, state, stage, &mut cancel).await {
                StageOutcome::Passed => {
                    let duration_ms = started.elapsed().as_millis() as u64;
                    debug!(execution_id = %ctx.id, stage = %state, duration_ms, "Stage completed");
                    self.events.publish(CoreEvent::StageCompleted {
                        execution_id: ctx.id.clone(),
                        stage: state.to_string(),
                        duration_ms,
                    });
                    index += 1;
                }
                StageOutcome::Skipped => {
                    warn!(execution_id = %ctx.id, stage = %state, "Optional stage failed, skipping");
                    self.events.publish(CoreEvent::StageSkipped {
                        execution_id: ctx.id.clone(),
                        stage: state.to_string(),
                    });
                    index += 1;
                }
                StageOutcome::Failed(errors) => {
                    if self.rollback_pending(&ctx.id).await {
                        info!(
                            execution_id = %ctx.id,
                            stage = %state,
                            "Stage failed with a rollback pending, resuming at rollback target"
                        );
                        continue;
                    }
                    return self.fail(ctx, state, errors).await;
                }
                StageOutcome::Aborted(message) => {
                    let err = ConclaveError::PipelineFailure(message).to_string();
                    ctx.errors.push(err.clone());
                    return self.fail(ctx, state, vec![err]).await;
                }
                StageOutcome::Cancelled => return self.cancelled_result(ctx),
            }
        }

        ctx.transition(ExecutionState::Completed);
        if !self.finish(&ctx).await {
            return self.cancelled_result(ctx);
        }
        let duration_ms = ctx.duration_ms();
        info!(
            execution_id = %ctx.id,
            duration_ms,
            retries = ctx.retry_count,
            "Execution completed"
        );
        self.events.publish(CoreEvent::ExecutionCompleted {
            execution_id: ctx.id.clone(),
            duration_ms,
        });
        CheckpointResult::ok(ExecutionState::Completed, ctx)
    }

    /// Run one stage with its retry policy.
    async fn run_stage(
        &self,
        ctx: &mut ExecutionContext,
        state: ExecutionState,
        stage: &RegisteredStage,
        cancel: &mut watch::Receiver<bool>,
    ) -> StageOutcome {
        let config = &stage.config;
        let mut errors = Vec::new();
        // One immediate retry in place before the budget is touched.
        let mut in_place_retry = config.retryable;

        loop {
            match self.attempt(ctx, state, stage, cancel).await {
                Attempt::Passed(returned) => {
                    if let Some(returned) = returned {
                        adopt_output(ctx, returned);
                    }
                    return StageOutcome::Passed;
                }
                Attempt::Cancelled => return StageOutcome::Cancelled,
                Attempt::Panicked(message) => {
                    return StageOutcome::Aborted(format!("{state} handler panicked: {message}"));
                }
                Attempt::Failed(errs) => {
                    let joined = errs.join("; ");
                    warn!(
                        execution_id = %ctx.id,
                        stage = %state,
                        retry_count = ctx.retry_count,
                        error = %joined,
                        "Stage attempt failed"
                    );
                    self.events.publish(CoreEvent::StageFailed {
                        execution_id: ctx.id.clone(),
                        stage: state.to_string(),
                        error: joined,
                    });
                    errors.extend(errs);
                }
            }

            // An accepted rollback supersedes any further attempt here.
            if self.rollback_pending(&ctx.id).await {
                break;
            }

            if in_place_retry {
                in_place_retry = false;
                debug!(execution_id = %ctx.id, stage = %state, "Retrying stage in place");
                continue;
            }

            if config.retryable && ctx.retry_count < ctx.max_retries {
                let backoff = self.backoff(ctx.retry_count);
                ctx.retry_count += 1;
                if !self.store(ctx).await {
                    return StageOutcome::Cancelled;
                }
                debug!(
                    execution_id = %ctx.id,
                    stage = %state,
                    retry_count = ctx.retry_count,
                    backoff_ms = backoff.as_millis() as u64,
                    "Retrying stage"
                );
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = cancelled(cancel) => return StageOutcome::Cancelled,
                }
                continue;
            }
            break;
        }

        ctx.errors.extend(errors.iter().cloned());
        if config.required {
            StageOutcome::Failed(errors)
        } else {
            StageOutcome::Skipped
        }
    }

    /// One handler call, raced against the stage timeout and cancellation.
    async fn attempt(
        &self,
        ctx: &ExecutionContext,
        state: ExecutionState,
        stage: &RegisteredStage,
        cancel: &mut watch::Receiver<bool>,
    ) -> Attempt {
        let call = AssertUnwindSafe(stage.handler.handle(ctx.clone())).catch_unwind();

        let outcome = tokio::select! {
            biased;
            _ = cancelled(cancel) => return Attempt::Cancelled,
            outcome = tokio::time::timeout(stage.config.timeout(), call) => outcome,
        };

        let result = match outcome {
            Err(_) => {
                let err = ConclaveError::StageTimeout {
                    stage: state.to_string(),
                    timeout_ms: stage.config.timeout_ms,
                };
                return Attempt::Failed(vec![err.to_string()]);
            }
            Ok(Err(panic)) => return Attempt::Panicked(panic_message(&*panic)),
            Ok(Ok(Err(e))) => {
                let err = ConclaveError::Stage {
                    stage: state.to_string(),
                    message: format!("{e:#}"),
                };
                return Attempt::Failed(vec![err.to_string()]);
            }
            Ok(Ok(Ok(result))) => result,
        };

        if !result.success {
            let errors = if result.errors.is_empty() {
                vec![ConclaveError::Stage {
                    stage: state.to_string(),
                    message: "handler reported failure".to_string(),
                }
                .to_string()]
            } else {
                result.errors
            };
            return Attempt::Failed(errors);
        }

        if stage.config.validate_checkpoint {
            if let Err(e) = validate_checkpoint(state, ctx, result.context.as_ref()) {
                return Attempt::Failed(vec![e.to_string()]);
            }
        }

        Attempt::Passed(result.context)
    }

    fn backoff(&self, retries_spent: u32) -> Duration {
        let factor = 1u64 << retries_spent.min(16);
        Duration::from_millis(self.config.retry_backoff_ms.saturating_mul(factor))
    }

    // -----------------------------------------------------------------------
    // Bookkeeping
    // -----------------------------------------------------------------------

    /// Pick up external corrections between stages.
    async fn boundary(&self, ctx: &mut ExecutionContext) -> Boundary {
        let mut active = self.active.write().await;
        let Some(entry) = active.get_mut(&ctx.id) else {
            return Boundary::Cancelled;
        };
        match entry.rollback_to.take() {
            Some(target) => {
                ctx.state = entry.context.state;
                ctx.retry_count = entry.context.retry_count;
                ctx.state_history = entry.context.state_history.clone();
                ctx.updated_at = entry.context.updated_at;
                Boundary::Resume(target.stage_index().unwrap_or(0))
            }
            None => Boundary::Continue,
        }
    }

    async fn rollback_pending(&self, id: &str) -> bool {
        self.active
            .read()
            .await
            .get(id)
            .is_some_and(|e| e.rollback_to.is_some())
    }

    /// Write the run's view back to the active map and persist it.
    /// Returns false once the execution is no longer active.
    async fn store(&self, ctx: &ExecutionContext) -> bool {
        {
            let mut active = self.active.write().await;
            let Some(entry) = active.get_mut(&ctx.id) else {
                return false;
            };
            // A pending rollback owns the stored context until the boundary.
            if entry.rollback_to.is_some() {
                return true;
            }
            entry.context = ctx.clone();
        }
        self.persist(ctx).await;
        true
    }

    /// Move a terminal context out of the active set.
    async fn finish(&self, ctx: &ExecutionContext) -> bool {
        let removed = self.active.write().await.remove(&ctx.id).is_some();
        if removed {
            self.persist(ctx).await;
            self.remember(ctx.clone()).await;
        }
        removed
    }

    async fn fail(
        &self,
        mut ctx: ExecutionContext,
        state: ExecutionState,
        errors: Vec<String>,
    ) -> CheckpointResult {
        ctx.transition(ExecutionState::Failed);
        if !self.finish(&ctx).await {
            return self.cancelled_result(ctx);
        }
        error!(
            execution_id = %ctx.id,
            stage = %state,
            retries = ctx.retry_count,
            errors = ?errors,
            "Execution failed"
        );
        self.events.publish(CoreEvent::ExecutionFailed {
            execution_id: ctx.id.clone(),
            stage: state.to_string(),
            errors: errors.clone(),
        });
        CheckpointResult::failed(state, Some(ctx), errors)
    }

    /// Result for a run that observed its own cancellation. The cancel call
    /// has already recorded and published it.
    fn cancelled_result(&self, mut ctx: ExecutionContext) -> CheckpointResult {
        let stage = ctx.state;
        ctx.transition(ExecutionState::Cancelled);
        ctx.errors.push(CANCELLED.to_string());
        CheckpointResult::failed(stage, Some(ctx), vec![CANCELLED.to_string()])
    }

    async fn persist(&self, ctx: &ExecutionContext) {
        if let Err(e) = self.persistence.save(ctx).await {
            let err = ConclaveError::Persistence(format!("{e:#}"));
            warn!(execution_id = %ctx.id, state = %ctx.state, error = %err, "State not persisted");
        }
    }

    async fn remember(&self, ctx: ExecutionContext) {
        let mut recent = self.recent.write().await;
        recent.push_front(ctx);
        recent.truncate(self.config.history_size);
    }

    // -----------------------------------------------------------------------
    // External control
    // -----------------------------------------------------------------------

    /// Cancel an active execution immediately. An in-flight stage call is
    /// abandoned. Returns false for unknown or finished executions.
    pub async fn cancel_execution(&self, id: &str) -> bool {
        let context = {
            let mut active = self.active.write().await;
            let Some(mut entry) = active.remove(id) else {
                debug!(execution_id = id, "Cancel ignored: not active");
                return false;
            };
            entry.context.transition(ExecutionState::Cancelled);
            entry.context.errors.push(CANCELLED.to_string());
            // No receiver just means the run already returned.
            let _ = entry.cancel.send(true);
            entry.context
        };

        self.persist(&context).await;
        warn!(execution_id = id, "Execution cancelled");
        self.events.publish(CoreEvent::ExecutionCancelled {
            execution_id: id.to_string(),
        });
        self.remember(context).await;
        true
    }

    /// Reset an active execution to an earlier stage and zero its retry
    /// counter. The run resumes from `target` at its next stage boundary.
    pub async fn rollback(&self, id: &str, target: ExecutionState) -> bool {
        let (from, snapshot) = {
            let mut active = self.active.write().await;
            let Some(entry) = active.get_mut(id) else {
                debug!(execution_id = id, "Rollback ignored: not active");
                return false;
            };
            let from = entry.context.state;
            if target.is_terminal() || target >= from {
                warn!(
                    execution_id = id,
                    from = %from,
                    target = %target,
                    "Rollback target must be an earlier stage"
                );
                return false;
            }
            entry.context.transition(target);
            entry.context.retry_count = 0;
            entry.rollback_to = Some(target);
            (from, entry.context.clone())
        };

        self.persist(&snapshot).await;
        info!(execution_id = id, from = %from, to = %target, "Execution rolled back");
        self.events.publish(CoreEvent::ExecutionRolledBack {
            execution_id: id.to_string(),
            from: from.to_string(),
            to: target.to_string(),
        });
        true
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub async fn get_execution(&self, id: &str) -> Option<ExecutionContext> {
        if let Some(entry) = self.active.read().await.get(id) {
            return Some(entry.context.clone());
        }
        self.recent.read().await.iter().find(|c| c.id == id).cloned()
    }

    /// Active executions, oldest first.
    pub async fn active_executions(&self) -> Vec<ExecutionContext> {
        let mut out: Vec<ExecutionContext> = self
            .active
            .read()
            .await
            .values()
            .map(|e| e.context.clone())
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        out
    }

    /// Finished executions, newest first.
    pub async fn recent_executions(&self) -> Vec<ExecutionContext> {
        self.recent.read().await.iter().cloned().collect()
    }

    pub async fn stats(&self) -> PipelineStats {
        let active = self.active.read().await.len();
        let recent = self.recent.read().await;
        let count = |s: ExecutionState| recent.iter().filter(|c| c.state == s).count();
        PipelineStats {
            active,
            completed: count(ExecutionState::Completed),
            failed: count(ExecutionState::Failed),
            cancelled: count(ExecutionState::Cancelled),
        }
    }
}

/// Carry a passed stage's output into the run. Identity, lifecycle and
/// retry bookkeeping stay with the pipeline.
fn adopt_output(ctx: &mut ExecutionContext, returned: ExecutionContext) {
    let ExecutionContext {
        opportunity,
        path,
        errors,
        metadata,
        ..
    } = returned;
    ctx.opportunity = opportunity;
    ctx.path = path;
    ctx.errors = errors;
    ctx.metadata = metadata;
}

/// Resolves once the execution has been cancelled.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    // The sender is only dropped when `cancel_execution` removes the entry.
    let _ = rx.wait_for(|cancelled| *cancelled).await;
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
