//! Scheduler: drives one execution until it completes, fails, is cancelled or
//! pauses for a checkpoint.
//!
//! Sequential definitions run one step at a time and route with the first
//! transition whose condition holds. Parallel definitions run level by level;
//! every ready step of a level is spawned into a `JoinSet` and the next level
//! starts only once the whole level is terminal. A semaphore shared by all
//! executions caps concurrently running steps.
//!
//! The scheduler is the only writer of its `WorkflowExecution`. Step tasks get
//! an owned input map and return a result; context and step results change
//! only after a task has returned.

use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use agentflow_types::config::EngineConfig;
use agentflow_types::execution::{
    Checkpoint, CheckpointReason, ExecutionStateError, ExecutionStatus, LogLevel, StepStatus,
    WorkflowExecution,
};
use agentflow_types::workflow::WorkflowDefinition;
use futures_util::FutureExt;
use serde_json::{Map, Value};
use tokio::sync::{oneshot, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::repository::WorkflowRepository;

use super::checkpoint::{CheckpointError, CheckpointManager};
use super::context::{apply_output_mapping, bound_step_result, build_step_input, check_context_size};
use super::control::{ControlRequest, ExecutionControl};
use super::dag::ExecutionPlan;
use super::definition::ValidationError;
use super::expression::{ConditionEvaluator, ExpressionError};
use super::step_executor::{
    BoxStepExecutor, FailureAction, FailureHandler, StepError, StepExecutorRegistry, StepFailure,
    StepRequest,
};

type StepResult = Result<Map<String, Value>, StepError>;
type CheckpointReply = oneshot::Sender<Result<Checkpoint, CheckpointError>>;

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Timing knobs of a scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub default_step_timeout: Duration,
    /// Time cancelled steps get before their tasks are aborted.
    pub cancellation_grace: Duration,
    pub auto_checkpoint_interval: Option<Duration>,
}

impl From<&EngineConfig> for SchedulerSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            default_step_timeout: Duration::from_secs(config.default_step_timeout_secs),
            cancellation_grace: Duration::from_millis(config.cancellation_grace_ms),
            auto_checkpoint_interval: config
                .auto_checkpoint_interval_secs
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
        }
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that stop a scheduler without a regular outcome.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("execution is {0} and cannot be scheduled")]
    NotRunnable(ExecutionStatus),

    #[error("illegal state change: {0}")]
    State(#[from] ExecutionStateError),

    #[error(transparent)]
    Validation(#[from] ValidationError),
}

// ---------------------------------------------------------------------------
// Internal outcomes
// ---------------------------------------------------------------------------

enum Flow {
    Completed,
    Failed(String),
    Cancelled,
    Paused,
}

enum BatchOutcome {
    /// Every dispatched step is terminal. `failure` carries the first
    /// unhandled step failure.
    Finished { failure: Option<String> },
    /// A checkpoint attempt failed; abandoned steps must be dispatched again.
    Redispatch,
    Cancelled,
    Paused,
}

enum Interrupt {
    Cancel,
    Checkpoint {
        reason: CheckpointReason,
        reply: CheckpointReply,
    },
}

struct AutoCheckpoint {
    interval: Option<Duration>,
    next: Option<Instant>,
}

impl AutoCheckpoint {
    fn new(interval: Option<Duration>) -> Self {
        Self {
            interval,
            next: interval.map(|d| Instant::now() + d),
        }
    }

    fn due(&self) -> bool {
        self.next.is_some_and(|next| Instant::now() >= next)
    }

    fn reset(&mut self) {
        self.next = self.interval.map(|d| Instant::now() + d);
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Runs executions of one workflow definition.
pub struct Scheduler<R: WorkflowRepository> {
    definition: Arc<WorkflowDefinition>,
    plan: ExecutionPlan,
    executors: Arc<StepExecutorRegistry>,
    failure_handler: Option<Arc<dyn FailureHandler>>,
    checkpoints: Arc<CheckpointManager<R>>,
    semaphore: Arc<Semaphore>,
    settings: SchedulerSettings,
}

impl<R: WorkflowRepository> Scheduler<R> {
    pub fn new(
        definition: Arc<WorkflowDefinition>,
        executors: Arc<StepExecutorRegistry>,
        checkpoints: Arc<CheckpointManager<R>>,
        semaphore: Arc<Semaphore>,
        settings: SchedulerSettings,
    ) -> Result<Self, SchedulerError> {
        let plan = ExecutionPlan::build(&definition)?;
        Ok(Self {
            definition,
            plan,
            executors,
            failure_handler: None,
            checkpoints,
            semaphore,
            settings,
        })
    }

    /// Consult `handler` on step failures instead of failing the execution.
    pub fn with_failure_handler(mut self, handler: Arc<dyn FailureHandler>) -> Self {
        self.failure_handler = Some(handler);
        self
    }

    pub fn plan(&self) -> &ExecutionPlan {
        &self.plan
    }

    /// Drive `execution` until it completes, fails, is cancelled or pauses.
    ///
    /// Accepts a pending execution (fresh start) or a running one (restored
    /// from a checkpoint). Returns the resulting status.
    pub async fn run(
        &self,
        execution: &mut WorkflowExecution,
        control: &mut ExecutionControl,
    ) -> Result<ExecutionStatus, SchedulerError> {
        let execution_id = execution.execution_id;
        match execution.status {
            ExecutionStatus::Pending => {
                execution.set_status(ExecutionStatus::Running)?;
                execution.log(LogLevel::Info, None, "execution started");
                tracing::info!(
                    execution_id = %execution_id,
                    workflow_id = %execution.workflow_id,
                    parallel = self.definition.parallel_execution_enabled,
                    "execution started"
                );
            }
            ExecutionStatus::Running => {
                tracing::info!(
                    execution_id = %execution_id,
                    completed_steps = execution.completed_steps().len(),
                    "execution resumed"
                );
            }
            other => return Err(SchedulerError::NotRunnable(other)),
        }
        execution.update_dependencies_met(&self.plan.dependencies);
        control.publish(execution);

        let mut auto = AutoCheckpoint::new(self.settings.auto_checkpoint_interval);
        let flow = if self.definition.parallel_execution_enabled {
            self.run_parallel(execution, control, &mut auto).await?
        } else {
            self.run_sequential(execution, control, &mut auto).await?
        };

        match flow {
            Flow::Completed => {
                execution.set_status(ExecutionStatus::Completed)?;
                execution.log(LogLevel::Info, None, "execution completed");
                tracing::info!(execution_id = %execution_id, "execution completed");
            }
            Flow::Failed(error) => {
                tracing::error!(execution_id = %execution_id, error = %error, "execution failed");
                execution.fail(error)?;
            }
            Flow::Cancelled => {
                execution.set_status(ExecutionStatus::Cancelled)?;
                execution.log(LogLevel::Warn, None, "execution cancelled");
                tracing::info!(execution_id = %execution_id, "execution cancelled");
            }
            Flow::Paused => {
                tracing::info!(
                    execution_id = %execution_id,
                    checkpoint_count = execution.checkpoint_count,
                    "execution paused"
                );
            }
        }
        control.publish(execution);
        Ok(execution.status)
    }

    // -----------------------------------------------------------------------
    // Modes
    // -----------------------------------------------------------------------

    async fn run_sequential(
        &self,
        execution: &mut WorkflowExecution,
        control: &mut ExecutionControl,
        auto: &mut AutoCheckpoint,
    ) -> Result<Flow, SchedulerError> {
        let mut current = execution
            .current_step
            .clone()
            .or_else(|| self.definition.steps.first().map(|s| s.step_id.clone()));

        while let Some(step_id) = current {
            if execution.current_step.as_deref() != Some(step_id.as_str()) {
                execution.current_step = Some(step_id.clone());
                control.publish(execution);
            }
            if let Some(flow) = self.at_boundary(execution, control, auto).await? {
                return Ok(flow);
            }

            if execution.step_status(&step_id) == Some(StepStatus::Pending) {
                match self.run_batch(execution, control, vec![step_id.clone()]).await? {
                    BatchOutcome::Finished { failure: Some(error) } => {
                        return Ok(Flow::Failed(error));
                    }
                    BatchOutcome::Finished { failure: None } => {}
                    BatchOutcome::Redispatch => {
                        current = Some(step_id);
                        continue;
                    }
                    BatchOutcome::Cancelled => return Ok(Flow::Cancelled),
                    BatchOutcome::Paused => return Ok(Flow::Paused),
                }
            }

            let next = match self.next_step(execution, &step_id) {
                Ok(next) => next,
                Err(e) => return Ok(Flow::Failed(e.to_string())),
            };
            tracing::debug!(
                execution_id = %execution.execution_id,
                from = %step_id,
                to = next.as_deref().unwrap_or("<end>"),
                "transition"
            );
            execution.current_step = next.clone();
            control.publish(execution);
            current = next;
        }

        Ok(Flow::Completed)
    }

    async fn run_parallel(
        &self,
        execution: &mut WorkflowExecution,
        control: &mut ExecutionControl,
        auto: &mut AutoCheckpoint,
    ) -> Result<Flow, SchedulerError> {
        for (level, group) in self.plan.groups.iter().enumerate() {
            let mut blocked_logged = false;
            loop {
                if let Some(flow) = self.at_boundary(execution, control, auto).await? {
                    return Ok(flow);
                }

                execution.update_dependencies_met(&self.plan.dependencies);
                let (ready, blocked): (Vec<String>, Vec<String>) = group
                    .iter()
                    .filter(|id| execution.step_status(id) == Some(StepStatus::Pending))
                    .cloned()
                    .partition(|id| {
                        execution
                            .step_dependencies_met
                            .get(id)
                            .copied()
                            .unwrap_or(false)
                    });

                if !blocked_logged {
                    for step_id in &blocked {
                        tracing::warn!(
                            execution_id = %execution.execution_id,
                            step_id = %step_id,
                            "skipping step: a dependency did not complete"
                        );
                        execution.log(
                            LogLevel::Warn,
                            Some(step_id),
                            "skipped: a dependency did not complete",
                        );
                    }
                    blocked_logged = true;
                }

                if ready.is_empty() {
                    break;
                }

                tracing::debug!(
                    execution_id = %execution.execution_id,
                    level,
                    steps = ready.len(),
                    "dispatching level"
                );

                match self.run_batch(execution, control, ready).await? {
                    BatchOutcome::Finished { failure: Some(error) } => {
                        return Ok(Flow::Failed(error));
                    }
                    BatchOutcome::Finished { failure: None } => break,
                    BatchOutcome::Redispatch => continue,
                    BatchOutcome::Cancelled => return Ok(Flow::Cancelled),
                    BatchOutcome::Paused => return Ok(Flow::Paused),
                }
            }
        }

        Ok(Flow::Completed)
    }

    // -----------------------------------------------------------------------
    // Boundaries and checkpoints
    // -----------------------------------------------------------------------

    /// Service cancellation, queued checkpoint requests and a due auto
    /// checkpoint while no step is running.
    async fn at_boundary(
        &self,
        execution: &mut WorkflowExecution,
        control: &mut ExecutionControl,
        auto: &mut AutoCheckpoint,
    ) -> Result<Option<Flow>, SchedulerError> {
        if control.cancel.is_cancelled() {
            return Ok(Some(Flow::Cancelled));
        }

        while let Ok(request) = control.requests.try_recv() {
            let ControlRequest::Checkpoint { reason, reply } = request;
            if self
                .pause_and_checkpoint(execution, reason, Some(reply))
                .await?
            {
                return Ok(Some(Flow::Paused));
            }
            control.publish(execution);
        }

        if auto.due() {
            auto.reset();
            if self
                .pause_and_checkpoint(execution, CheckpointReason::Auto, None)
                .await?
            {
                execution.set_status(ExecutionStatus::Running)?;
            }
            control.publish(execution);
        }

        Ok(None)
    }

    /// Pause and snapshot. Returns `true` when the checkpoint was stored; on
    /// failure the execution is running again.
    async fn pause_and_checkpoint(
        &self,
        execution: &mut WorkflowExecution,
        reason: CheckpointReason,
        reply: Option<CheckpointReply>,
    ) -> Result<bool, SchedulerError> {
        execution.set_status(ExecutionStatus::Paused)?;
        match self.checkpoints.create_checkpoint(execution, reason).await {
            Ok(checkpoint) => {
                if let Some(reply) = reply {
                    let _ = reply.send(Ok(checkpoint));
                }
                Ok(true)
            }
            Err(e) => {
                tracing::warn!(
                    execution_id = %execution.execution_id,
                    reason = ?reason,
                    error = %e,
                    "checkpoint failed, continuing"
                );
                execution.set_status(ExecutionStatus::Running)?;
                execution.log(LogLevel::Warn, None, format!("checkpoint failed: {e}"));
                if let Some(reply) = reply {
                    let _ = reply.send(Err(e));
                }
                Ok(false)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Step dispatch
    // -----------------------------------------------------------------------

    /// Run a set of steps concurrently until all are terminal or an
    /// interrupt arrives.
    async fn run_batch(
        &self,
        execution: &mut WorkflowExecution,
        control: &mut ExecutionControl,
        step_ids: Vec<String>,
    ) -> Result<BatchOutcome, SchedulerError> {
        // Independent of `control.cancel`: steps only learn about an interrupt
        // after the scheduler has chosen it, so a step that stops early is never
        // recorded as a failure.
        let batch_token = CancellationToken::new();
        let mut tasks: JoinSet<(String, StepResult)> = JoinSet::new();
        let mut in_flight: HashSet<String> = HashSet::new();
        let mut failure: Option<String> = None;

        for step_id in step_ids {
            execution.mark_step_status(&step_id, StepStatus::Running)?;
            match self.prepare(execution, &step_id, &batch_token) {
                Ok((executor, request, timeout)) => {
                    tracing::debug!(
                        execution_id = %execution.execution_id,
                        step_id = %step_id,
                        timeout_secs = timeout.as_secs(),
                        "dispatching step"
                    );
                    let semaphore = Arc::clone(&self.semaphore);
                    in_flight.insert(step_id.clone());
                    tasks.spawn(async move {
                        let result = AssertUnwindSafe(invoke(semaphore, executor, request, timeout))
                            .catch_unwind()
                            .await
                            .unwrap_or_else(|_| {
                                Err(StepError::Failed("step executor panicked".to_string()))
                            });
                        (step_id, result)
                    });
                }
                Err(error) => {
                    let outcome = self.record_outcome(execution, &step_id, Err(error))?;
                    note_failure(execution, &mut failure, outcome);
                }
            }
        }
        control.publish(execution);

        let interrupt = loop {
            if tasks.is_empty() {
                break None;
            }
            tokio::select! {
                biased;
                _ = control.cancel.cancelled() => break Some(Interrupt::Cancel),
                Some(request) = control.requests.recv(), if failure.is_none() => {
                    let ControlRequest::Checkpoint { reason, reply } = request;
                    break Some(Interrupt::Checkpoint { reason, reply });
                }
                joined = tasks.join_next() => match joined {
                    Some(Ok((step_id, result))) => {
                        in_flight.remove(&step_id);
                        let outcome = self.record_outcome(execution, &step_id, result)?;
                        note_failure(execution, &mut failure, outcome);
                        control.publish(execution);
                    }
                    Some(Err(e)) => {
                        tracing::warn!(
                            execution_id = %execution.execution_id,
                            error = %e,
                            "step task ended abnormally"
                        );
                    }
                    None => break None,
                },
            }
        };

        let Some(interrupt) = interrupt else {
            // Tasks that vanished without reporting a result.
            let mut lost: Vec<String> = in_flight.into_iter().collect();
            lost.sort();
            for step_id in lost {
                let error = StepError::Failed("step task ended abnormally".to_string());
                let outcome = self.record_outcome(execution, &step_id, Err(error))?;
                note_failure(execution, &mut failure, outcome);
            }
            control.publish(execution);
            return Ok(BatchOutcome::Finished { failure });
        };

        batch_token.cancel();
        self.drain(execution, &mut tasks, &mut in_flight).await?;

        match interrupt {
            Interrupt::Cancel => Ok(BatchOutcome::Cancelled),
            Interrupt::Checkpoint { reason, reply } => {
                if self.pause_and_checkpoint(execution, reason, Some(reply)).await? {
                    Ok(BatchOutcome::Paused)
                } else {
                    control.publish(execution);
                    Ok(BatchOutcome::Redispatch)
                }
            }
        }
    }

    /// Wait up to the grace period for cancelled steps, abort the rest, and
    /// return every unfinished step to `Pending`.
    async fn drain(
        &self,
        execution: &mut WorkflowExecution,
        tasks: &mut JoinSet<(String, StepResult)>,
        in_flight: &mut HashSet<String>,
    ) -> Result<(), SchedulerError> {
        let deadline = tokio::time::sleep(self.settings.cancellation_grace);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = &mut deadline => {
                    tasks.abort_all();
                    break;
                }
                joined = tasks.join_next() => match joined {
                    Some(Ok((step_id, Ok(output)))) => {
                        // Finished before noticing the cancellation; keep it.
                        in_flight.remove(&step_id);
                        self.record_outcome(execution, &step_id, Ok(output))?;
                    }
                    Some(_) => {}
                    None => break,
                },
            }
        }
        while tasks.join_next().await.is_some() {}

        let mut abandoned: Vec<String> = in_flight.drain().collect();
        abandoned.sort();
        for step_id in abandoned {
            execution.revert_abandoned_step(&step_id)?;
            execution.log(
                LogLevel::Warn,
                Some(&step_id),
                "step interrupted; it will run again on resume",
            );
            tracing::warn!(
                execution_id = %execution.execution_id,
                step_id = %step_id,
                "abandoned in-flight step"
            );
        }
        Ok(())
    }

    /// Resolve everything a step task needs.
    fn prepare(
        &self,
        execution: &WorkflowExecution,
        step_id: &str,
        batch_token: &CancellationToken,
    ) -> Result<(Arc<BoxStepExecutor>, StepRequest, Duration), StepError> {
        let step = self
            .definition
            .step(step_id)
            .ok_or_else(|| StepError::Failed(format!("unknown step '{step_id}'")))?;
        let agent = self
            .definition
            .agent_for(step)
            .ok_or_else(|| StepError::UnknownAgent(step.agent_id.clone()))?;
        let executor = self.executors.resolve(agent)?;
        let timeout = step
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.settings.default_step_timeout);

        let request = StepRequest {
            execution_id: execution.execution_id,
            step_id: step_id.to_string(),
            agent: agent.clone(),
            input: build_step_input(step, &execution.context, &execution.step_results),
            cancellation: batch_token.child_token(),
        };
        Ok((executor, request, timeout))
    }

    /// Apply a step's result to the execution. Returns the execution-level
    /// error when the failure is not handled.
    fn record_outcome(
        &self,
        execution: &mut WorkflowExecution,
        step_id: &str,
        result: StepResult,
    ) -> Result<Option<String>, SchedulerError> {
        let execution_id = execution.execution_id;
        match result {
            Ok(output) => {
                let value = bound_step_result(step_id, Value::Object(output));
                if let Some(step) = self.definition.step(step_id) {
                    apply_output_mapping(step, &value, &mut execution.context);
                }
                execution.record_step_result(step_id, value);
                execution.mark_step_status(step_id, StepStatus::Completed)?;
                execution.log(LogLevel::Info, Some(step_id), "step completed");
                tracing::debug!(execution_id = %execution_id, step_id, "step completed");

                match check_context_size(&execution.context) {
                    Ok(()) => Ok(None),
                    Err(e) => Ok(Some(e.to_string())),
                }
            }
            Err(error) => {
                execution.mark_step_status(step_id, StepStatus::Failed)?;
                execution.record_step_error(step_id, error.to_string());
                execution.log(LogLevel::Error, Some(step_id), format!("step failed: {error}"));

                let action = match &self.failure_handler {
                    Some(handler) => handler.on_step_failure(&StepFailure {
                        step_id,
                        error: &error,
                        context: &execution.context,
                        step_results: &execution.step_results,
                    }),
                    None => FailureAction::Abort,
                };

                match action {
                    FailureAction::Continue => {
                        tracing::warn!(
                            execution_id = %execution_id,
                            step_id,
                            error = %error,
                            "step failed, handler chose to continue"
                        );
                        execution.log(LogLevel::Warn, Some(step_id), "failure handled, continuing");
                        Ok(None)
                    }
                    FailureAction::Abort => {
                        tracing::error!(
                            execution_id = %execution_id,
                            step_id,
                            error = %error,
                            "unhandled step failure"
                        );
                        Ok(Some(format!("step '{step_id}' failed: {error}")))
                    }
                }
            }
        }
    }

    /// First transition out of `step_id` whose condition is absent or true.
    fn next_step(
        &self,
        execution: &WorkflowExecution,
        step_id: &str,
    ) -> Result<Option<String>, ExpressionError> {
        let transitions = self.definition.transitions_from(step_id);
        if transitions.is_empty() {
            return Ok(None);
        }
        let evaluator = ConditionEvaluator::new();
        for transition in transitions {
            let taken = match &transition.condition {
                None => true,
                Some(condition) => evaluator.evaluate_condition(
                    condition,
                    &execution.context,
                    &execution.step_results,
                )?,
            };
            if taken {
                return Ok(Some(transition.to_step.clone()));
            }
        }
        Ok(None)
    }
}

/// Keep the first unhandled failure and expose it on the execution at once.
fn note_failure(
    execution: &mut WorkflowExecution,
    failure: &mut Option<String>,
    outcome: Option<String>,
) {
    if let (None, Some(error)) = (failure.as_ref(), outcome) {
        execution.error = Some(error.clone());
        *failure = Some(error);
    }
}

/// Body of a step task: wait for a permit, then run the executor under the
/// step timeout.
async fn invoke(
    semaphore: Arc<Semaphore>,
    executor: Arc<BoxStepExecutor>,
    request: StepRequest,
    timeout: Duration,
) -> StepResult {
    let cancellation = request.cancellation.clone();
    let _permit = tokio::select! {
        permit = semaphore.acquire_owned() => permit.map_err(|_| StepError::Cancelled)?,
        _ = cancellation.cancelled() => return Err(StepError::Cancelled),
    };

    let step_id = request.step_id.clone();
    match tokio::time::timeout(timeout, executor.execute(request)).await {
        Ok(result) => result,
        Err(_) => Err(StepError::Timeout {
            step_id,
            timeout_secs: timeout.as_secs(),
        }),
    }
}

/// Span wrapping one scheduler run.
pub fn execution_span(execution_id: Uuid, workflow_id: &str) -> tracing::Span {
    tracing::info_span!("execution", execution_id = %execution_id, workflow_id)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
