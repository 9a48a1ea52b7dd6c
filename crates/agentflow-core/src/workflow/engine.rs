//! Workflow engine facade.
//!
//! `WorkflowEngine` owns the guarded storage and cache, the executor registry
//! and the table of live executions. Each execution runs in its own task on a
//! `TaskTracker`; the engine talks to it through an `ExecutionHandle` and
//! reads its progress from the published snapshot.
//!
//! All dependencies are passed in explicitly. There is no global state.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use agentflow_types::batch::{BatchHandle, BatchMode, BatchRequest, BatchStatus, BatchStatusReport};
use agentflow_types::config::EngineConfig;
use agentflow_types::error::RepositoryError;
use agentflow_types::execution::{
    Checkpoint, CheckpointReason, ExecutionStateError, ExecutionStatus, LogLevel,
    WorkflowExecution,
};
use agentflow_types::pagination::{ListOptions, Page, SortOrder};
use agentflow_types::workflow::WorkflowDefinition;
use chrono::Utc;
use dashmap::{DashMap, DashSet};
use serde_json::{Map, Value};
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::Instrument;
use uuid::Uuid;

use crate::repository::{CacheStore, WorkflowRepository};
use crate::resilience::{BreakerStatus, CircuitBreaker, GuardedCache, GuardedRepository};

use super::checkpoint::{CheckpointError, CheckpointManager};
use super::context::merge_context;
use super::control::{self, ControlError, ExecutionControl, ExecutionHandle};
use super::definition::{self, ValidationError, WorkflowError};
use super::knowledge::KnowledgeSource;
use super::scheduler::{execution_span, Scheduler, SchedulerError, SchedulerSettings};
use super::step_executor::{
    ContinueOnFailure, FailureHandler, StepExecutorRegistry, CONTINUE_HANDLER,
};

/// Page size used when the engine walks a whole listing.
const SCAN_PAGE_SIZE: usize = 200;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors returned by engine operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("execution not found: {0}")]
    ExecutionNotFound(Uuid),

    #[error("checkpoint not found: {0}")]
    CheckpointNotFound(Uuid),

    #[error("batch not found: {0}")]
    BatchNotFound(Uuid),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("engine is shutting down")]
    ShuttingDown,

    #[error("invalid workflow: {0}")]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Workflow(#[from] WorkflowError),

    #[error("storage error: {0}")]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    State(#[from] ExecutionStateError),
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// Input of [`WorkflowEngine::create_execution`].
#[derive(Debug, Clone, Default)]
pub struct ExecutionRequest {
    pub workflow_id: String,
    /// Merged over the definition's `global_context`.
    pub context: Map<String, Value>,
    pub batch_id: Option<Uuid>,
    /// When set and a knowledge source is attached, its answer is stored
    /// under `context.knowledge`.
    pub knowledge_query: Option<String>,
}

impl ExecutionRequest {
    pub fn new(workflow_id: impl Into<String>, context: Map<String, Value>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            context,
            ..Self::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Live executions
// ---------------------------------------------------------------------------

/// Engine-side record of an execution whose scheduler task has not finished.
#[derive(Clone)]
struct ActiveExecution {
    handle: ExecutionHandle,
    /// Flips to `true` once the final state is persisted.
    done: watch::Receiver<bool>,
}

impl ActiveExecution {
    async fn finished(&self) {
        let mut done = self.done.clone();
        let _ = done.wait_for(|finished| *finished).await;
    }
}

type EngineScheduler<R> = Scheduler<GuardedRepository<R>>;

/// A registered execution waiting for its scheduler task.
struct Launch<R: WorkflowRepository> {
    scheduler: Arc<EngineScheduler<R>>,
    execution: WorkflowExecution,
    control: ExecutionControl,
    done: watch::Sender<bool>,
}

struct EngineInner<R: WorkflowRepository, C: CacheStore> {
    repo: Arc<GuardedRepository<R>>,
    cache: GuardedCache<C>,
    checkpoints: Arc<CheckpointManager<GuardedRepository<R>>>,
    executors: Arc<StepExecutorRegistry>,
    failure_handlers: DashMap<String, Arc<dyn FailureHandler>>,
    knowledge: RwLock<Option<Arc<dyn KnowledgeSource>>>,
    config: EngineConfig,
    settings: SchedulerSettings,
    step_permits: Arc<Semaphore>,
    active: DashMap<Uuid, ActiveExecution>,
    /// Batch items registered but not yet handed to a scheduler task.
    queued: DashMap<Uuid, Launch<R>>,
    resuming: DashSet<Uuid>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl<R: WorkflowRepository, C: CacheStore> EngineInner<R, C> {
    /// Persist the final state, drop the live entry and wake waiters.
    async fn finish(&self, execution: &WorkflowExecution, done: &watch::Sender<bool>) {
        if let Err(e) = self.repo.save_execution(execution).await {
            tracing::error!(
                execution_id = %execution.execution_id,
                error = %e,
                "failed to persist final execution state"
            );
        }
        self.active.remove(&execution.execution_id);
        done.send_replace(true);
    }
}

/// Removes a checkpoint's execution from the resume set when dropped.
struct ResumeGuard<'a> {
    resuming: &'a DashSet<Uuid>,
    execution_id: Uuid,
}

impl Drop for ResumeGuard<'_> {
    fn drop(&mut self) {
        self.resuming.remove(&self.execution_id);
    }
}

fn cache_key(workflow_id: &str) -> String {
    format!("workflow:{workflow_id}")
}

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

/// Entry point for defining, running and supervising workflows.
///
/// Cheap to clone; clones share all state.
pub struct WorkflowEngine<R: WorkflowRepository + 'static, C: CacheStore + 'static> {
    inner: Arc<EngineInner<R, C>>,
}

impl<R: WorkflowRepository + 'static, C: CacheStore + 'static> Clone for WorkflowEngine<R, C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R: WorkflowRepository + 'static, C: CacheStore + 'static> WorkflowEngine<R, C> {
    /// Build an engine over `repo` and `cache`, each wrapped in its own
    /// circuit breaker. The `continue` failure handler is always registered.
    pub fn new(repo: R, cache: C, executors: StepExecutorRegistry, config: EngineConfig) -> Self {
        let storage_breaker =
            Arc::new(CircuitBreaker::from_config("storage", &config.circuit_breaker));
        let cache_breaker =
            Arc::new(CircuitBreaker::from_config("cache", &config.circuit_breaker));
        let repo = Arc::new(GuardedRepository::new(repo, storage_breaker));
        let checkpoints = Arc::new(CheckpointManager::new(
            Arc::clone(&repo),
            config.max_checkpoints_per_execution,
        ));

        let failure_handlers: DashMap<String, Arc<dyn FailureHandler>> = DashMap::new();
        failure_handlers.insert(CONTINUE_HANDLER.to_string(), Arc::new(ContinueOnFailure));

        Self {
            inner: Arc::new(EngineInner {
                repo,
                cache: GuardedCache::new(cache, cache_breaker),
                checkpoints,
                executors: Arc::new(executors),
                failure_handlers,
                knowledge: RwLock::new(None),
                settings: SchedulerSettings::from(&config),
                step_permits: Arc::new(Semaphore::new(config.max_concurrent_steps.max(1))),
                config,
                active: DashMap::new(),
                queued: DashMap::new(),
                resuming: DashSet::new(),
                shutdown: CancellationToken::new(),
                tracker: TaskTracker::new(),
            }),
        }
    }

    /// Register a failure handler that definitions can name in
    /// `error_handler`.
    pub fn with_failure_handler(
        self,
        name: impl Into<String>,
        handler: impl FailureHandler + 'static,
    ) -> Self {
        self.inner
            .failure_handlers
            .insert(name.into(), Arc::new(handler));
        self
    }

    pub fn with_knowledge_source(self, source: impl KnowledgeSource + 'static) -> Self {
        *self
            .inner
            .knowledge
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(source));
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Status of the storage and cache breakers.
    pub fn circuit_breakers(&self) -> Vec<BreakerStatus> {
        vec![
            self.inner.repo.breaker().status(),
            self.inner.cache.breaker().status(),
        ]
    }

    // -----------------------------------------------------------------------
    // Definitions
    // -----------------------------------------------------------------------

    /// Validate and store a definition, then refresh its cache entry.
    pub async fn save_workflow(&self, def: &WorkflowDefinition) -> Result<(), EngineError> {
        self.validate_workflow_definition(def)?;
        self.inner.repo.save_definition(def).await?;
        self.fill_cache(def).await;
        tracing::info!(workflow_id = %def.workflow_id, steps = def.steps.len(), "workflow saved");
        Ok(())
    }

    /// Load a definition, cache first.
    pub async fn get_workflow(
        &self,
        workflow_id: &str,
    ) -> Result<WorkflowDefinition, EngineError> {
        let key = cache_key(workflow_id);
        if let Some(bytes) = self.inner.cache.get(&key).await {
            match serde_json::from_slice::<WorkflowDefinition>(&bytes) {
                Ok(def) => {
                    tracing::debug!(workflow_id, "definition cache hit");
                    return Ok(def);
                }
                Err(e) => {
                    tracing::warn!(
                        workflow_id,
                        error = %e,
                        "discarding undecodable cached definition"
                    );
                    self.inner.cache.invalidate(&key).await;
                }
            }
        }

        let def = self
            .inner
            .repo
            .get_definition(workflow_id)
            .await?
            .ok_or_else(|| EngineError::WorkflowNotFound(workflow_id.to_string()))?;
        self.fill_cache(&def).await;
        Ok(def)
    }

    /// Delete a definition. Returns `true` if it existed.
    pub async fn delete_workflow(&self, workflow_id: &str) -> Result<bool, EngineError> {
        let deleted = self.inner.repo.delete_definition(workflow_id).await?;
        self.inner.cache.invalidate(&cache_key(workflow_id)).await;
        if deleted {
            tracing::info!(workflow_id, "workflow deleted");
        }
        Ok(deleted)
    }

    pub async fn list_workflows(
        &self,
        options: &ListOptions,
    ) -> Result<Page<WorkflowDefinition>, EngineError> {
        Ok(self.inner.repo.list_definitions(options).await?)
    }

    async fn fill_cache(&self, def: &WorkflowDefinition) {
        match serde_json::to_vec(def) {
            Ok(bytes) => {
                let ttl = Duration::from_secs(self.inner.config.definition_cache_ttl_secs);
                self.inner
                    .cache
                    .set(&cache_key(&def.workflow_id), bytes, ttl)
                    .await;
            }
            Err(e) => {
                tracing::warn!(
                    workflow_id = %def.workflow_id,
                    error = %e,
                    "definition not cacheable"
                );
            }
        }
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    /// Definition invariants plus what only the engine knows: every agent
    /// has an executor and the named error handler is registered.
    pub fn validate_workflow_definition(
        &self,
        def: &WorkflowDefinition,
    ) -> Result<(), ValidationError> {
        definition::validate_definition(def)?;

        let mut agent_ids: Vec<&String> = def.agents.keys().collect();
        agent_ids.sort();
        for agent_id in agent_ids {
            let executor = def.agents[agent_id].executor_key();
            if !self.inner.executors.contains(executor) {
                return Err(ValidationError::MissingExecutor {
                    agent_id: agent_id.clone(),
                    executor: executor.to_string(),
                });
            }
        }

        if let Some(handler) = &def.error_handler {
            if !self.inner.failure_handlers.contains_key(handler) {
                return Err(ValidationError::UnknownErrorHandler(handler.clone()));
            }
        }
        Ok(())
    }

    /// Check a raw JSON document (shape, parse, definition rules) and return
    /// the parsed definition.
    pub fn validate_workflow_document(
        &self,
        doc: &Value,
    ) -> Result<WorkflowDefinition, EngineError> {
        let def = definition::parse_workflow_document(doc)?;
        self.validate_workflow_definition(&def)?;
        Ok(def)
    }

    pub fn definition_json_schema(&self) -> Result<Value, EngineError> {
        Ok(definition::definition_json_schema()?)
    }

    // -----------------------------------------------------------------------
    // Executions
    // -----------------------------------------------------------------------

    /// Create an execution and start it in the background.
    ///
    /// The definition is loaded and validated before anything is written.
    /// Returns the pending execution as persisted.
    pub async fn create_execution(
        &self,
        request: ExecutionRequest,
    ) -> Result<WorkflowExecution, EngineError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(EngineError::ShuttingDown);
        }

        let def = self.get_workflow(&request.workflow_id).await?;
        self.validate_workflow_definition(&def)?;
        let def = Arc::new(def);
        let scheduler = Arc::new(self.scheduler_for(Arc::clone(&def))?);

        let mut context = merge_context(&def.global_context, &request.context);
        if let Some(query) = request.knowledge_query.as_deref() {
            self.enrich(query, &mut context).await;
        }

        let execution = self.persist_new(&def, context, request.batch_id).await?;
        tracing::info!(
            execution_id = %execution.execution_id,
            workflow_id = %def.workflow_id,
            "execution created"
        );

        let launch = self.register(scheduler, execution.clone());
        self.spawn(launch, None);
        Ok(execution)
    }

    /// Live snapshot for running executions, the stored record otherwise.
    pub async fn get_execution(
        &self,
        execution_id: Uuid,
    ) -> Result<WorkflowExecution, EngineError> {
        if let Some(active) = self.active(execution_id) {
            return Ok(active.handle.snapshot());
        }
        self.inner
            .repo
            .get_execution(&execution_id)
            .await?
            .ok_or(EngineError::ExecutionNotFound(execution_id))
    }

    /// Wait until the execution's scheduler task has finished and return
    /// the final state.
    pub async fn wait_for_execution(
        &self,
        execution_id: Uuid,
    ) -> Result<WorkflowExecution, EngineError> {
        if let Some(active) = self.active(execution_id) {
            active.finished().await;
        }
        self.get_execution(execution_id).await
    }

    /// Cancel an execution.
    ///
    /// A batch item still waiting for its turn is cancelled at once. A live
    /// execution is cancelled cooperatively and this waits for its scheduler
    /// to stop. A paused, pending or orphaned running record is marked
    /// cancelled in storage. Terminal executions are an error.
    pub async fn cancel_execution(
        &self,
        execution_id: Uuid,
    ) -> Result<WorkflowExecution, EngineError> {
        if let Some((_, launch)) = self.inner.queued.remove(&execution_id) {
            tracing::info!(execution_id = %execution_id, "cancelling queued batch item");
            let execution = self.abandon(launch, "cancelled before it started").await;
            return Ok(execution);
        }

        if let Some(active) = self.active(execution_id) {
            tracing::info!(execution_id = %execution_id, "cancelling execution");
            active.handle.cancel();
            active.finished().await;
            return self.get_execution(execution_id).await;
        }

        let mut execution = self
            .inner
            .repo
            .get_execution(&execution_id)
            .await?
            .ok_or(EngineError::ExecutionNotFound(execution_id))?;
        if execution.status.is_terminal() {
            return Err(EngineError::InvalidState(format!(
                "execution {execution_id} is already {}",
                execution.status
            )));
        }

        let previous = execution.status;
        execution.set_status(ExecutionStatus::Cancelled)?;
        execution.log(
            LogLevel::Warn,
            None,
            format!("cancelled while {previous}"),
        );
        self.inner.repo.save_execution(&execution).await?;
        tracing::info!(execution_id = %execution_id, previous = %previous, "execution cancelled");
        Ok(execution)
    }

    /// Pause a running execution at its next opportunity and snapshot it.
    ///
    /// Returns once the checkpoint is stored and the scheduler has stopped.
    pub async fn checkpoint_workflow(
        &self,
        execution_id: Uuid,
    ) -> Result<Checkpoint, EngineError> {
        if self.inner.queued.contains_key(&execution_id) {
            return Err(EngineError::InvalidState(format!(
                "execution {execution_id} has not started yet"
            )));
        }
        let Some(active) = self.active(execution_id) else {
            let execution = self
                .inner
                .repo
                .get_execution(&execution_id)
                .await?
                .ok_or(EngineError::ExecutionNotFound(execution_id))?;
            return Err(EngineError::InvalidState(format!(
                "execution {execution_id} is {}, not running",
                execution.status
            )));
        };

        let checkpoint = active
            .handle
            .request_checkpoint(CheckpointReason::Manual)
            .await
            .map_err(|e| match e {
                ControlError::Closed(id) => EngineError::InvalidState(format!(
                    "execution {id} finished before it could be checkpointed"
                )),
                ControlError::Checkpoint(e) => EngineError::Checkpoint(e),
            })?;
        active.finished().await;
        Ok(checkpoint)
    }

    /// Restore an execution from a checkpoint and continue it in the
    /// background. Completed steps are not run again.
    pub async fn resume_workflow(
        &self,
        checkpoint_id: Uuid,
    ) -> Result<WorkflowExecution, EngineError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(EngineError::ShuttingDown);
        }

        let checkpoint = self
            .inner
            .repo
            .get_checkpoint(&checkpoint_id)
            .await?
            .ok_or(EngineError::CheckpointNotFound(checkpoint_id))?;
        let execution_id = checkpoint.execution_id;

        if self.inner.active.contains_key(&execution_id)
            || !self.inner.resuming.insert(execution_id)
        {
            return Err(EngineError::InvalidState(format!(
                "execution {execution_id} is still running"
            )));
        }
        let _guard = ResumeGuard {
            resuming: &self.inner.resuming,
            execution_id,
        };

        let def = self.get_workflow(&checkpoint.workflow_id).await?;
        self.validate_workflow_definition(&def)?;
        let scheduler = Arc::new(self.scheduler_for(Arc::new(def))?);

        let execution = self
            .inner
            .checkpoints
            .restore(checkpoint_id)
            .await
            .map_err(|e| match e {
                CheckpointError::NotFound(id) => EngineError::CheckpointNotFound(id),
                other => EngineError::Checkpoint(other),
            })?;

        let launch = self.register(scheduler, execution.clone());
        self.spawn(launch, None);
        Ok(execution)
    }

    pub async fn list_executions(
        &self,
        options: &ListOptions,
    ) -> Result<Page<WorkflowExecution>, EngineError> {
        let page = self.inner.repo.list_executions(options).await?;
        Ok(page.map(|stored| match self.active(stored.execution_id) {
            Some(active) => active.handle.snapshot(),
            None => stored,
        }))
    }

    pub async fn list_checkpoints(
        &self,
        options: &ListOptions,
    ) -> Result<Page<Checkpoint>, EngineError> {
        Ok(self.inner.repo.list_checkpoints(options).await?)
    }

    /// Delete terminal executions (and their checkpoints) that ended more
    /// than `retention` ago. Returns how many were deleted.
    ///
    /// See [`Self::cleanup_expired_executions_default`] for the configured
    /// retention.
    pub async fn cleanup_expired_executions(
        &self,
        retention: Duration,
    ) -> Result<usize, EngineError> {
        let Ok(retention) = chrono::Duration::from_std(retention) else {
            return Ok(0);
        };
        let cutoff = Utc::now() - retention;

        let expired: Vec<Uuid> = self
            .scan_executions(ListOptions::default())
            .await?
            .into_iter()
            .filter(|e| e.status.is_terminal() && e.end_time.is_some_and(|end| end <= cutoff))
            .map(|e| e.execution_id)
            .collect();

        let mut deleted = 0;
        for execution_id in expired {
            if self.inner.repo.delete_execution(&execution_id).await? {
                deleted += 1;
            }
        }
        tracing::info!(deleted, cutoff = %cutoff, "expired executions cleaned up");
        Ok(deleted)
    }

    /// [`Self::cleanup_expired_executions`] with
    /// `EngineConfig::execution_retention_secs`.
    pub async fn cleanup_expired_executions_default(&self) -> Result<usize, EngineError> {
        let retention = Duration::from_secs(self.inner.config.execution_retention_secs);
        self.cleanup_expired_executions(retention).await
    }

    // -----------------------------------------------------------------------
    // Batches
    // -----------------------------------------------------------------------

    /// Create one execution per item, tagged with a fresh batch id.
    ///
    /// Every execution is persisted before this returns; they are started in
    /// the background, at most `batch_concurrency` at a time (one at a time in
    /// sequential mode).
    pub async fn create_batch_execution(
        &self,
        request: BatchRequest,
    ) -> Result<BatchHandle, EngineError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(EngineError::ShuttingDown);
        }
        if request.items.is_empty() {
            return Err(EngineError::InvalidState(
                "a batch needs at least one item".to_string(),
            ));
        }

        let def = self.get_workflow(&request.workflow_id).await?;
        self.validate_workflow_definition(&def)?;
        let def = Arc::new(def);
        let scheduler = Arc::new(self.scheduler_for(Arc::clone(&def))?);

        let batch_id = Uuid::now_v7();
        let base = merge_context(&def.global_context, &request.base_context);
        let mut launches = Vec::with_capacity(request.items.len());
        for item in &request.items {
            match self.persist_new(&def, merge_context(&base, item), Some(batch_id)).await {
                Ok(execution) => launches.push(self.register(Arc::clone(&scheduler), execution)),
                Err(e) => {
                    for launch in launches {
                        self.abandon(launch, "batch creation failed").await;
                    }
                    return Err(e);
                }
            }
        }

        let execution_ids: Vec<Uuid> =
            launches.iter().map(|l| l.execution.execution_id).collect();
        let limit = match request.mode {
            BatchMode::Sequential => 1,
            BatchMode::Concurrent => self.inner.config.batch_concurrency.max(1),
        };
        tracing::info!(
            batch_id = %batch_id,
            workflow_id = %def.workflow_id,
            items = execution_ids.len(),
            mode = ?request.mode,
            "batch created"
        );

        for launch in launches {
            self.inner.queued.insert(launch.execution.execution_id, launch);
        }
        let engine = self.clone();
        let queue = execution_ids.clone();
        self.inner.tracker.spawn(
            async move { engine.feed_batch(queue, limit).await }
                .instrument(tracing::info_span!("batch", batch_id = %batch_id)),
        );

        Ok(BatchHandle {
            batch_id,
            execution_ids,
        })
    }

    /// Aggregate the current status of every execution in a batch.
    pub async fn get_batch_status(&self, batch_id: Uuid) -> Result<BatchStatusReport, EngineError> {
        let options = ListOptions::default()
            .filter("batch_id", batch_id.to_string())
            .sort("created_at", SortOrder::Asc);
        let executions = self.scan_executions(options).await?;
        if executions.is_empty() {
            return Err(EngineError::BatchNotFound(batch_id));
        }

        let statuses: Vec<ExecutionStatus> = executions
            .iter()
            .map(|stored| {
                self.active(stored.execution_id)
                    .map(|active| active.handle.status())
                    .unwrap_or(stored.status)
            })
            .collect();

        let mut report = BatchStatusReport {
            batch_id,
            status: BatchStatus::aggregate(&statuses),
            total: statuses.len(),
            status_counts: Default::default(),
            execution_ids: executions.iter().map(|e| e.execution_id).collect(),
        };
        for status in statuses {
            *report.status_counts.entry(status).or_default() += 1;
        }
        Ok(report)
    }

    /// Start queued items in order as permits free up. Items cancelled while
    /// queued are already gone from `queued` and are skipped.
    async fn feed_batch(&self, queue: Vec<Uuid>, limit: usize) {
        let permits = Arc::new(Semaphore::new(limit));
        let mut queue = queue.into_iter();

        while let Some(execution_id) = queue.next() {
            if !self.inner.queued.contains_key(&execution_id) {
                continue;
            }
            let permit = tokio::select! {
                biased;
                _ = self.inner.shutdown.cancelled() => None,
                permit = Arc::clone(&permits).acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                let remaining: Vec<Uuid> = std::iter::once(execution_id).chain(queue).collect();
                tracing::warn!(
                    remaining = remaining.len(),
                    "batch stopped before all items started"
                );
                for execution_id in remaining {
                    if let Some((_, launch)) = self.inner.queued.remove(&execution_id) {
                        self.abandon(launch, "engine shut down before the item started").await;
                    }
                }
                return;
            };
            if let Some((_, launch)) = self.inner.queued.remove(&execution_id) {
                self.spawn(launch, Some(permit));
            }
        }
    }

    // -----------------------------------------------------------------------
    // Shutdown
    // -----------------------------------------------------------------------

    /// Stop accepting work, checkpoint every live execution and wait for all
    /// scheduler tasks. Returns how many executions were checkpointed.
    ///
    /// An execution whose checkpoint fails is cancelled instead.
    pub async fn shutdown(&self) -> usize {
        self.inner.shutdown.cancel();
        let active: Vec<ActiveExecution> = self
            .inner
            .active
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        tracing::info!(active = active.len(), "engine shutting down");

        let results = futures_util::future::join_all(active.iter().map(|a| async move {
            match a.handle.request_checkpoint(CheckpointReason::Shutdown).await {
                Ok(_) => true,
                Err(ControlError::Closed(_)) => false,
                Err(e) => {
                    tracing::warn!(
                        execution_id = %a.handle.execution_id,
                        error = %e,
                        "shutdown checkpoint failed, cancelling"
                    );
                    a.handle.cancel();
                    false
                }
            }
        }))
        .await;

        self.inner.tracker.close();
        self.inner.tracker.wait().await;

        let checkpointed = results.into_iter().filter(|ok| *ok).count();
        tracing::info!(checkpointed, "engine stopped");
        checkpointed
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn active(&self, execution_id: Uuid) -> Option<ActiveExecution> {
        self.inner
            .active
            .get(&execution_id)
            .map(|entry| entry.value().clone())
    }

    fn scheduler_for(
        &self,
        def: Arc<WorkflowDefinition>,
    ) -> Result<EngineScheduler<R>, EngineError> {
        let handler = match &def.error_handler {
            Some(name) => Some(
                self.inner
                    .failure_handlers
                    .get(name)
                    .map(|h| Arc::clone(h.value()))
                    .ok_or_else(|| ValidationError::UnknownErrorHandler(name.clone()))?,
            ),
            None => None,
        };

        let scheduler = Scheduler::new(
            def,
            Arc::clone(&self.inner.executors),
            Arc::clone(&self.inner.checkpoints),
            Arc::clone(&self.inner.step_permits),
            self.inner.settings.clone(),
        )?;
        Ok(match handler {
            Some(handler) => scheduler.with_failure_handler(handler),
            None => scheduler,
        })
    }

    async fn enrich(&self, query: &str, context: &mut Map<String, Value>) {
        let source = self
            .inner
            .knowledge
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(source) = source else {
            tracing::debug!("knowledge query ignored, no knowledge source attached");
            return;
        };

        let enriched = source.enrich(query, context).await;
        match enriched {
            Ok(knowledge) => {
                context.insert("knowledge".to_string(), Value::Object(knowledge));
            }
            Err(e) => {
                tracing::warn!(error = %e, "knowledge enrichment failed, continuing without it");
            }
        }
    }

    async fn persist_new(
        &self,
        def: &WorkflowDefinition,
        context: Map<String, Value>,
        batch_id: Option<Uuid>,
    ) -> Result<WorkflowExecution, EngineError> {
        let mut execution = WorkflowExecution::new(
            Uuid::now_v7(),
            def.workflow_id.clone(),
            def.step_ids(),
            context,
        );
        execution.batch_id = batch_id;
        execution.log(LogLevel::Info, None, "execution created");
        self.inner.repo.save_execution(&execution).await?;
        Ok(execution)
    }

    /// Make an execution visible as live before its task starts.
    fn register(
        &self,
        scheduler: Arc<EngineScheduler<R>>,
        execution: WorkflowExecution,
    ) -> Launch<R> {
        let (handle, control) = control::channel(execution.clone(), CancellationToken::new());
        let (done, done_rx) = watch::channel(false);
        self.inner.active.insert(
            execution.execution_id,
            ActiveExecution {
                handle,
                done: done_rx,
            },
        );
        Launch {
            scheduler,
            execution,
            control,
            done,
        }
    }

    fn spawn(&self, launch: Launch<R>, permit: Option<OwnedSemaphorePermit>) {
        let Launch {
            scheduler,
            mut execution,
            mut control,
            done,
        } = launch;
        let inner = Arc::clone(&self.inner);
        let span = execution_span(execution.execution_id, &execution.workflow_id);

        self.inner.tracker.spawn(
            async move {
                let _permit = permit;
                if let Err(e) = scheduler.run(&mut execution, &mut control).await {
                    tracing::error!(error = %e, "scheduler stopped with an error");
                    if !execution.status.is_terminal() && execution.fail(e.to_string()).is_ok() {
                        control.publish(&execution);
                    }
                }
                inner.finish(&execution, &done).await;
            }
            .instrument(span),
        );
    }

    /// Cancel a registered execution that never started and return its final
    /// state.
    async fn abandon(&self, launch: Launch<R>, reason: &str) -> WorkflowExecution {
        let Launch {
            mut execution,
            control,
            done,
            ..
        } = launch;
        if execution.set_status(ExecutionStatus::Cancelled).is_ok() {
            execution.log(LogLevel::Warn, None, reason);
        }
        control.publish(&execution);
        self.inner.finish(&execution, &done).await;
        execution
    }

    async fn scan_executions(
        &self,
        options: ListOptions,
    ) -> Result<Vec<WorkflowExecution>, EngineError> {
        let mut options = options;
        options.offset = 0;
        options.limit = SCAN_PAGE_SIZE;

        let mut all = Vec::new();
        loop {
            let page = self.inner.repo.list_executions(&options).await?;
            let more = page.has_more();
            all.extend(page.items);
            if !more {
                return Ok(all);
            }
            options.offset += SCAN_PAGE_SIZE;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
