//! Batch execution types.
//!
//! A batch is a set of executions of one workflow, created together and
//! tagged with a shared `batch_id`. Its status is derived from the statuses of
//! its member executions.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::execution::ExecutionStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Processing,
    Failed,
    PartiallyCompleted,
    Completed,
}

impl BatchStatus {
    /// Derive a batch status from its member execution statuses.
    ///
    /// Any pending/running/paused member keeps the batch `Processing`. Once all
    /// are terminal: all failed is `Failed`, any failed or cancelled is
    /// `PartiallyCompleted`, otherwise `Completed`.
    pub fn aggregate(statuses: &[ExecutionStatus]) -> Self {
        if statuses.iter().any(|s| !s.is_terminal()) {
            return BatchStatus::Processing;
        }
        if !statuses.is_empty() && statuses.iter().all(|s| *s == ExecutionStatus::Failed) {
            return BatchStatus::Failed;
        }
        if statuses
            .iter()
            .any(|s| matches!(s, ExecutionStatus::Failed | ExecutionStatus::Cancelled))
        {
            return BatchStatus::PartiallyCompleted;
        }
        BatchStatus::Completed
    }
}

/// How batch items are started.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchMode {
    /// Start every item at once (bounded by `batch_concurrency`).
    #[default]
    Concurrent,
    /// Start each item after the previous one reached a terminal state.
    Sequential,
}

/// Request to run one workflow over many inputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRequest {
    pub workflow_id: String,
    /// Context shared by every item; item context is merged over it.
    #[serde(default)]
    pub base_context: Map<String, Value>,
    pub items: Vec<Map<String, Value>>,
    #[serde(default)]
    pub mode: BatchMode,
}

/// Returned when a batch is created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchHandle {
    pub batch_id: Uuid,
    pub execution_ids: Vec<Uuid>,
}

/// Aggregated view of a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchStatusReport {
    pub batch_id: Uuid,
    pub status: BatchStatus,
    pub total: usize,
    pub status_counts: HashMap<ExecutionStatus, usize>,
    pub execution_ids: Vec<Uuid>,
}

impl BatchStatusReport {
    pub fn count(&self, status: ExecutionStatus) -> usize {
        self.status_counts.get(&status).copied().unwrap_or(0)
    }
}
