//! Checkpoint manager: snapshot, restore and prune execution state.
//!
//! A checkpoint is a full copy of a paused `WorkflowExecution`. Creating one
//! persists both the checkpoint and the execution record; the in-memory
//! execution only picks up the new checkpoint count once both writes
//! succeeded, so a failed checkpoint leaves it untouched.

use std::sync::Arc;

use agentflow_types::execution::{
    Checkpoint, CheckpointReason, ExecutionStatus, LogLevel, WorkflowExecution,
};
use chrono::Utc;
use uuid::Uuid;

use crate::repository::WorkflowRepository;

// ---------------------------------------------------------------------------
// CheckpointManager
// ---------------------------------------------------------------------------

/// Creates and restores execution checkpoints.
///
/// Generic over `R: WorkflowRepository` so it works with any storage backend.
pub struct CheckpointManager<R: WorkflowRepository> {
    repo: Arc<R>,
    max_per_execution: usize,
}

impl<R: WorkflowRepository> CheckpointManager<R> {
    /// `max_per_execution` is clamped to at least 1.
    pub fn new(repo: Arc<R>, max_per_execution: usize) -> Self {
        Self {
            repo,
            max_per_execution: max_per_execution.max(1),
        }
    }

    pub fn repo(&self) -> &Arc<R> {
        &self.repo
    }

    // -----------------------------------------------------------------------
    // Create
    // -----------------------------------------------------------------------

    /// Snapshot a paused execution.
    ///
    /// On success `execution` is replaced by the persisted snapshot (its
    /// `checkpoint_count` incremented). On failure it is left unchanged.
    pub async fn create_checkpoint(
        &self,
        execution: &mut WorkflowExecution,
        reason: CheckpointReason,
    ) -> Result<Checkpoint, CheckpointError> {
        if execution.status != ExecutionStatus::Paused {
            return Err(CheckpointError::NotPaused(execution.status));
        }

        let mut snapshot = execution.clone();
        snapshot.checkpoint_count += 1;
        snapshot.updated_at = Utc::now();
        snapshot.log(
            LogLevel::Info,
            None,
            format!("checkpoint #{} ({reason:?})", snapshot.checkpoint_count),
        );

        let checkpoint = Checkpoint {
            checkpoint_id: Uuid::now_v7(),
            execution_id: snapshot.execution_id,
            workflow_id: snapshot.workflow_id.clone(),
            execution_snapshot: snapshot.clone(),
            reason,
            created_at: snapshot.updated_at,
        };

        self.repo
            .save_checkpoint(&checkpoint)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?;

        if let Err(e) = self.repo.save_execution(&snapshot).await {
            // Keep checkpoint history consistent with the execution record.
            if let Err(cleanup) = self.repo.delete_checkpoint(&checkpoint.checkpoint_id).await {
                tracing::warn!(
                    checkpoint_id = %checkpoint.checkpoint_id,
                    error = %cleanup,
                    "failed to remove orphaned checkpoint"
                );
            }
            return Err(CheckpointError::Repository(e.to_string()));
        }

        *execution = snapshot;

        tracing::info!(
            execution_id = %checkpoint.execution_id,
            checkpoint_id = %checkpoint.checkpoint_id,
            checkpoint_count = execution.checkpoint_count,
            reason = ?reason,
            "checkpoint created"
        );

        if let Err(e) = self.prune(checkpoint.execution_id).await {
            tracing::warn!(
                execution_id = %checkpoint.execution_id,
                error = %e,
                "checkpoint pruning failed"
            );
        }

        Ok(checkpoint)
    }

    // -----------------------------------------------------------------------
    // Restore
    // -----------------------------------------------------------------------

    /// Rebuild a running execution from a checkpoint and persist it.
    ///
    /// The execution keeps its `execution_id` and every map verbatim; only
    /// `resume_count`, status and the log change.
    pub async fn restore(&self, checkpoint_id: Uuid) -> Result<WorkflowExecution, CheckpointError> {
        let checkpoint = self
            .repo
            .get_checkpoint(&checkpoint_id)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?
            .ok_or(CheckpointError::NotFound(checkpoint_id))?;

        let mut execution = checkpoint.execution_snapshot;
        if execution.status != ExecutionStatus::Paused {
            return Err(CheckpointError::NotResumable(execution.status));
        }

        // The stored record may have moved on since the snapshot was taken.
        if let Some(current) = self
            .repo
            .get_execution(&execution.execution_id)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?
        {
            if current.status != ExecutionStatus::Paused {
                return Err(CheckpointError::NotResumable(current.status));
            }
        }

        execution
            .set_status(ExecutionStatus::Running)
            .map_err(|e| CheckpointError::Snapshot(e.to_string()))?;
        execution.resume_count += 1;
        execution.log(
            LogLevel::Info,
            None,
            format!(
                "resumed from checkpoint {checkpoint_id} (resume #{})",
                execution.resume_count
            ),
        );

        self.repo
            .save_execution(&execution)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?;

        tracing::info!(
            execution_id = %execution.execution_id,
            checkpoint_id = %checkpoint_id,
            resume_count = execution.resume_count,
            completed_steps = execution.completed_steps().len(),
            "execution restored from checkpoint"
        );

        Ok(execution)
    }

    // -----------------------------------------------------------------------
    // History
    // -----------------------------------------------------------------------

    /// Checkpoints of an execution, oldest first.
    pub async fn list_for_execution(
        &self,
        execution_id: Uuid,
    ) -> Result<Vec<Checkpoint>, CheckpointError> {
        self.repo
            .list_checkpoints_for_execution(&execution_id)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))
    }

    pub async fn latest_for_execution(
        &self,
        execution_id: Uuid,
    ) -> Result<Option<Checkpoint>, CheckpointError> {
        Ok(self.list_for_execution(execution_id).await?.pop())
    }

    /// Delete the oldest checkpoints beyond the retention limit. Returns how
    /// many were removed.
    pub async fn prune(&self, execution_id: Uuid) -> Result<usize, CheckpointError> {
        let checkpoints = self.list_for_execution(execution_id).await?;
        let excess = checkpoints.len().saturating_sub(self.max_per_execution);

        for checkpoint in checkpoints.iter().take(excess) {
            self.repo
                .delete_checkpoint(&checkpoint.checkpoint_id)
                .await
                .map_err(|e| CheckpointError::Repository(e.to_string()))?;
        }

        if excess > 0 {
            tracing::debug!(execution_id = %execution_id, removed = excess, "pruned checkpoints");
        }
        Ok(excess)
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during checkpoint operations.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    /// Underlying repository operation failed.
    #[error("checkpoint repository error: {0}")]
    Repository(String),

    #[error("checkpoint not found: {0}")]
    NotFound(Uuid),

    /// Only paused executions can be snapshotted.
    #[error("execution is {0}, not paused")]
    NotPaused(ExecutionStatus),

    #[error("execution is {0} and cannot be resumed")]
    NotResumable(ExecutionStatus),

    #[error("invalid snapshot: {0}")]
    Snapshot(String),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::memory::InMemoryWorkflowRepository;
    use agentflow_types::execution::StepStatus;
    use serde_json::{json, Map};

    type Manager = CheckpointManager<InMemoryWorkflowRepository>;

    fn manager(max: usize) -> (Arc<InMemoryWorkflowRepository>, Manager) {
        let repo = Arc::new(InMemoryWorkflowRepository::new());
        (repo.clone(), CheckpointManager::new(repo, max))
    }

    /// Running execution with `a` completed and `b` pending, then paused.
    fn paused_execution() -> WorkflowExecution {
        let mut exec = WorkflowExecution::new(
            Uuid::now_v7(),
            "wf",
            vec!["a".to_string(), "b".to_string()],
            json!({ "doc": "x" }).as_object().cloned().unwrap(),
        );
        exec.set_status(ExecutionStatus::Running).unwrap();
        exec.mark_step_status("a", StepStatus::Running).unwrap();
        exec.mark_step_status("a", StepStatus::Completed).unwrap();
        exec.record_step_result("a", json!({ "out": 1 }));
        exec.set_status(ExecutionStatus::Paused).unwrap();
        exec
    }

    #[tokio::test]
    async fn test_create_requires_paused() {
        let (_, mgr) = manager(10);
        let mut exec = WorkflowExecution::new(Uuid::now_v7(), "wf", vec![], Map::new());
        let err = mgr
            .create_checkpoint(&mut exec, CheckpointReason::Manual)
            .await
            .unwrap_err();
        assert!(matches!(err, CheckpointError::NotPaused(ExecutionStatus::Pending)));
        assert_eq!(exec.checkpoint_count, 0);
    }

    #[tokio::test]
    async fn test_create_persists_and_commits_count() {
        let (repo, mgr) = manager(10);
        let mut exec = paused_execution();
        let cp = mgr
            .create_checkpoint(&mut exec, CheckpointReason::Manual)
            .await
            .unwrap();

        assert_eq!(exec.checkpoint_count, 1);
        assert_eq!(cp.execution_snapshot.checkpoint_count, 1);
        let stored = repo.get_execution(&exec.execution_id).await.unwrap().unwrap();
        assert_eq!(stored.checkpoint_count, 1);
        assert_eq!(stored.status, ExecutionStatus::Paused);
    }

    #[tokio::test]
    async fn test_failed_create_leaves_execution_unchanged() {
        let (repo, mgr) = manager(10);
        let mut exec = paused_execution();
        let logs_before = exec.logs.len();
        repo.set_failing(true);

        let err = mgr
            .create_checkpoint(&mut exec, CheckpointReason::Auto)
            .await
            .unwrap_err();
        assert!(matches!(err, CheckpointError::Repository(_)));
        assert_eq!(exec.checkpoint_count, 0);
        assert_eq!(exec.logs.len(), logs_before);
    }

    #[tokio::test]
    async fn test_restore_roundtrip() {
        let (_, mgr) = manager(10);
        let mut exec = paused_execution();
        let cp = mgr
            .create_checkpoint(&mut exec, CheckpointReason::Manual)
            .await
            .unwrap();

        let restored = mgr.restore(cp.checkpoint_id).await.unwrap();
        assert_eq!(restored.execution_id, exec.execution_id);
        assert_eq!(restored.status, ExecutionStatus::Running);
        assert_eq!(restored.resume_count, 1);
        assert_eq!(restored.step_results, exec.step_results);
        assert_eq!(restored.step_statuses, exec.step_statuses);
        assert_eq!(restored.context, exec.context);
        assert_eq!(restored.completed_steps(), vec!["a"]);
    }

    #[tokio::test]
    async fn test_restore_rejects_moved_on_execution() {
        let (repo, mgr) = manager(10);
        let mut exec = paused_execution();
        let cp = mgr
            .create_checkpoint(&mut exec, CheckpointReason::Manual)
            .await
            .unwrap();

        exec.set_status(ExecutionStatus::Cancelled).unwrap();
        repo.save_execution(&exec).await.unwrap();

        let err = mgr.restore(cp.checkpoint_id).await.unwrap_err();
        assert!(matches!(err, CheckpointError::NotResumable(ExecutionStatus::Cancelled)));
    }

    #[tokio::test]
    async fn test_restore_unknown_checkpoint() {
        let (_, mgr) = manager(10);
        assert!(matches!(
            mgr.restore(Uuid::now_v7()).await,
            Err(CheckpointError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_history_pruned_oldest_first() {
        let (_, mgr) = manager(2);
        let mut exec = paused_execution();
        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(
                mgr.create_checkpoint(&mut exec, CheckpointReason::Auto)
                    .await
                    .unwrap()
                    .checkpoint_id,
            );
        }

        let history = mgr.list_for_execution(exec.execution_id).await.unwrap();
        let kept: Vec<Uuid> = history.iter().map(|c| c.checkpoint_id).collect();
        assert_eq!(kept, ids[1..].to_vec());
        assert_eq!(exec.checkpoint_count, 3);

        let latest = mgr.latest_for_execution(exec.execution_id).await.unwrap().unwrap();
        assert_eq!(latest.checkpoint_id, ids[2]);
    }

    #[test]
    fn checkpoint_error_display() {
        let err = CheckpointError::Repository("connection lost".to_string());
        assert!(err.to_string().contains("connection lost"));
        let err = CheckpointError::NotPaused(ExecutionStatus::Running);
        assert_eq!(err.to_string(), "execution is running, not paused");
    }
}
