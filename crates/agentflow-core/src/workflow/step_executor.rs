//! Step executor contract and the object-safe wrappers the scheduler uses.
//!
//! Executors are external collaborators: the engine resolves a step's agent,
//! builds its input, and hands both to the executor registered under the
//! agent's `executor_key`. The pattern mirrors other RPITIT ports:
//! 1. `StepExecutor` is the native async trait implementors write
//! 2. `StepExecutorDyn` is an object-safe twin with boxed futures
//! 3. `BoxStepExecutor` wraps `Box<dyn StepExecutorDyn>` and delegates

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use agentflow_types::workflow::AgentConfig;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Request / error
// ---------------------------------------------------------------------------

/// Everything an executor receives for one step invocation.
#[derive(Debug, Clone)]
pub struct StepRequest {
    pub execution_id: Uuid,
    pub step_id: String,
    pub agent: AgentConfig,
    pub input: Map<String, Value>,
    /// Cancelled when the execution is cancelled or checkpointed. Executors
    /// should return promptly once it fires.
    pub cancellation: CancellationToken,
}

/// Why a step did not produce a result.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StepError {
    #[error("step '{step_id}' timed out after {timeout_secs}s")]
    Timeout { step_id: String, timeout_secs: u64 },

    #[error("step execution failed: {0}")]
    Failed(String),

    #[error("step cancelled")]
    Cancelled,

    #[error("no step executor registered for '{0}'")]
    NoExecutor(String),

    #[error("unknown agent '{0}'")]
    UnknownAgent(String),
}

// ---------------------------------------------------------------------------
// StepExecutor
// ---------------------------------------------------------------------------

/// Performs the work of one step.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait StepExecutor: Send + Sync {
    fn execute(
        &self,
        request: StepRequest,
    ) -> impl Future<Output = Result<Map<String, Value>, StepError>> + Send;
}

/// Object-safe version of [`StepExecutor`] with boxed futures.
pub trait StepExecutorDyn: Send + Sync {
    fn execute_boxed(
        &self,
        request: StepRequest,
    ) -> Pin<Box<dyn Future<Output = Result<Map<String, Value>, StepError>> + Send + '_>>;
}

impl<T: StepExecutor> StepExecutorDyn for T {
    fn execute_boxed(
        &self,
        request: StepRequest,
    ) -> Pin<Box<dyn Future<Output = Result<Map<String, Value>, StepError>> + Send + '_>> {
        Box::pin(self.execute(request))
    }
}

/// Type-erased step executor.
pub struct BoxStepExecutor {
    inner: Box<dyn StepExecutorDyn>,
}

impl BoxStepExecutor {
    pub fn new<T: StepExecutor + 'static>(executor: T) -> Self {
        Self {
            inner: Box::new(executor),
        }
    }

    pub async fn execute(&self, request: StepRequest) -> Result<Map<String, Value>, StepError> {
        self.inner.execute_boxed(request).await
    }
}

/// Adapts a closure returning a future into a [`StepExecutor`].
pub struct FnStepExecutor<F>(pub F);

impl<F, Fut> StepExecutor for FnStepExecutor<F>
where
    F: Fn(StepRequest) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Map<String, Value>, StepError>> + Send,
{
    fn execute(
        &self,
        request: StepRequest,
    ) -> impl Future<Output = Result<Map<String, Value>, StepError>> + Send {
        (self.0)(request)
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Executors keyed by `AgentConfig::executor_key`.
#[derive(Default, Clone)]
pub struct StepExecutorRegistry {
    executors: HashMap<String, Arc<BoxStepExecutor>>,
}

impl StepExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: StepExecutor + 'static>(&mut self, key: impl Into<String>, executor: T) {
        self.executors
            .insert(key.into(), Arc::new(BoxStepExecutor::new(executor)));
    }

    /// Builder-style `register`.
    pub fn with<T: StepExecutor + 'static>(mut self, key: impl Into<String>, executor: T) -> Self {
        self.register(key, executor);
        self
    }

    pub fn contains(&self, key: &str) -> bool {
        self.executors.contains_key(key)
    }

    /// The executor for an agent.
    pub fn resolve(&self, agent: &AgentConfig) -> Result<Arc<BoxStepExecutor>, StepError> {
        let key = agent.executor_key();
        self.executors
            .get(key)
            .cloned()
            .ok_or_else(|| StepError::NoExecutor(key.to_string()))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.executors.keys().map(String::as_str)
    }
}

impl std::fmt::Debug for StepExecutorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut keys: Vec<&str> = self.keys().collect();
        keys.sort_unstable();
        f.debug_struct("StepExecutorRegistry")
            .field("executors", &keys)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Failure handling
// ---------------------------------------------------------------------------

/// What to do after a step fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    /// Record the failure and keep scheduling.
    Continue,
    /// Fail the execution.
    Abort,
}

/// The failure a handler is asked about.
#[derive(Debug)]
pub struct StepFailure<'a> {
    pub step_id: &'a str,
    pub error: &'a StepError,
    pub context: &'a Map<String, Value>,
    pub step_results: &'a HashMap<String, Value>,
}

/// Decides whether an execution survives a step failure.
pub trait FailureHandler: Send + Sync {
    fn on_step_failure(&self, failure: &StepFailure<'_>) -> FailureAction;
}

impl<F> FailureHandler for F
where
    F: Fn(&StepFailure<'_>) -> FailureAction + Send + Sync,
{
    fn on_step_failure(&self, failure: &StepFailure<'_>) -> FailureAction {
        self(failure)
    }
}

/// Name under which [`ContinueOnFailure`] is always registered.
pub const CONTINUE_HANDLER: &str = "continue";

/// Keeps executions running through any step failure.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContinueOnFailure;

impl FailureHandler for ContinueOnFailure {
    fn on_step_failure(&self, _failure: &StepFailure<'_>) -> FailureAction {
        FailureAction::Continue
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
