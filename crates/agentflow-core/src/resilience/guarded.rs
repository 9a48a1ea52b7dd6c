//! Storage and cache wrappers that route every call through a breaker.
//!
//! `GuardedRepository` is itself a `WorkflowRepository`; an open breaker
//! surfaces as `RepositoryError::Unavailable("storage")`. `GuardedCache`
//! never fails: backend errors and an open breaker read as a miss.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use agentflow_types::error::RepositoryError;
use agentflow_types::execution::{Checkpoint, WorkflowExecution};
use agentflow_types::pagination::{ListOptions, Page};
use agentflow_types::workflow::WorkflowDefinition;
use uuid::Uuid;

use crate::repository::{CacheStore, WorkflowRepository};

use super::circuit_breaker::{BreakerError, CircuitBreaker};

// ---------------------------------------------------------------------------
// Repository
// ---------------------------------------------------------------------------

/// A repository behind a circuit breaker.
pub struct GuardedRepository<R> {
    inner: R,
    breaker: Arc<CircuitBreaker>,
}

impl<R: WorkflowRepository> GuardedRepository<R> {
    pub fn new(inner: R, breaker: Arc<CircuitBreaker>) -> Self {
        Self { inner, breaker }
    }

    pub fn inner(&self) -> &R {
        &self.inner
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    async fn guard<T>(
        &self,
        operation: impl Future<Output = Result<T, RepositoryError>>,
    ) -> Result<T, RepositoryError> {
        self.breaker
            .call_classified(operation, trips_storage_breaker)
            .await
            .map_err(|e| match e {
                BreakerError::Open { name } => {
                    tracing::warn!(breaker = %name, "storage call rejected, breaker open");
                    RepositoryError::Unavailable(name)
                }
                BreakerError::Inner(e) => e,
            })
    }
}

/// Lookups that miss and conflicting writes say nothing about the backend's
/// health.
fn trips_storage_breaker(error: &RepositoryError) -> bool {
    !matches!(
        error,
        RepositoryError::NotFound | RepositoryError::Conflict(_)
    )
}

impl<R: WorkflowRepository> WorkflowRepository for GuardedRepository<R> {
    async fn save_definition(&self, def: &WorkflowDefinition) -> Result<(), RepositoryError> {
        self.guard(self.inner.save_definition(def)).await
    }

    async fn get_definition(
        &self,
        workflow_id: &str,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        self.guard(self.inner.get_definition(workflow_id)).await
    }

    async fn delete_definition(&self, workflow_id: &str) -> Result<bool, RepositoryError> {
        self.guard(self.inner.delete_definition(workflow_id)).await
    }

    async fn list_definitions(
        &self,
        options: &ListOptions,
    ) -> Result<Page<WorkflowDefinition>, RepositoryError> {
        self.guard(self.inner.list_definitions(options)).await
    }

    async fn save_execution(&self, execution: &WorkflowExecution) -> Result<(), RepositoryError> {
        self.guard(self.inner.save_execution(execution)).await
    }

    async fn get_execution(
        &self,
        execution_id: &Uuid,
    ) -> Result<Option<WorkflowExecution>, RepositoryError> {
        self.guard(self.inner.get_execution(execution_id)).await
    }

    async fn delete_execution(&self, execution_id: &Uuid) -> Result<bool, RepositoryError> {
        self.guard(self.inner.delete_execution(execution_id)).await
    }

    async fn list_executions(
        &self,
        options: &ListOptions,
    ) -> Result<Page<WorkflowExecution>, RepositoryError> {
        self.guard(self.inner.list_executions(options)).await
    }

    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), RepositoryError> {
        self.guard(self.inner.save_checkpoint(checkpoint)).await
    }

    async fn get_checkpoint(
        &self,
        checkpoint_id: &Uuid,
    ) -> Result<Option<Checkpoint>, RepositoryError> {
        self.guard(self.inner.get_checkpoint(checkpoint_id)).await
    }

    async fn list_checkpoints_for_execution(
        &self,
        execution_id: &Uuid,
    ) -> Result<Vec<Checkpoint>, RepositoryError> {
        self.guard(self.inner.list_checkpoints_for_execution(execution_id))
            .await
    }

    async fn list_checkpoints(
        &self,
        options: &ListOptions,
    ) -> Result<Page<Checkpoint>, RepositoryError> {
        self.guard(self.inner.list_checkpoints(options)).await
    }

    async fn delete_checkpoint(&self, checkpoint_id: &Uuid) -> Result<bool, RepositoryError> {
        self.guard(self.inner.delete_checkpoint(checkpoint_id)).await
    }
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

/// A cache behind a circuit breaker. Every failure degrades to a miss.
pub struct GuardedCache<C> {
    inner: C,
    breaker: Arc<CircuitBreaker>,
}

impl<C: CacheStore> GuardedCache<C> {
    pub fn new(inner: C, breaker: Arc<CircuitBreaker>) -> Self {
        Self { inner, breaker }
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub async fn get(&self, key: &str) -> Option<Vec<u8>> {
        match self.breaker.call(self.inner.get(key)).await {
            Ok(hit) => hit,
            Err(e) => {
                tracing::warn!(key, error = %e, "cache read failed, treating as miss");
                None
            }
        }
    }

    pub async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) {
        if let Err(e) = self.breaker.call(self.inner.set(key, value, ttl)).await {
            tracing::warn!(key, error = %e, "cache write failed");
        }
    }

    pub async fn invalidate(&self, key: &str) {
        if let Err(e) = self.breaker.call(self.inner.invalidate(key)).await {
            tracing::warn!(key, error = %e, "cache invalidation failed");
        }
    }
}
