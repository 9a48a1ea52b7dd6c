//! Execution tracking types: the per-run state machine and checkpoints.
//!
//! `WorkflowExecution` is the mutable run-time state of one instantiation of a
//! `WorkflowDefinition`. It is owned by exactly one scheduler and changed only
//! through the methods below, which enforce the step and execution state
//! machines. `Checkpoint` is a persisted snapshot of an execution.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

/// Step ID -> IDs of the steps that must complete before it.
pub type DependencyGraph = HashMap<String, BTreeSet<String>>;

// ---------------------------------------------------------------------------
// Status enums
// ---------------------------------------------------------------------------

/// Status of an individual step within an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, StepStatus::Completed | StepStatus::Failed)
    }
}

/// Overall status of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }

    /// Whether the execution state machine permits `self -> next`.
    pub fn can_transition_to(self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Failed)
                | (Pending, Cancelled)
                | (Running, Paused)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Paused, Running)
                | (Paused, Cancelled)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Paused => "paused",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// State machine errors
// ---------------------------------------------------------------------------

/// Illegal state changes on a `WorkflowExecution`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExecutionStateError {
    #[error("unknown step '{0}'")]
    UnknownStep(String),

    #[error("step '{step_id}' cannot move from {from:?} to {to:?}")]
    InvalidStepTransition {
        step_id: String,
        from: StepStatus,
        to: StepStatus,
    },

    #[error("execution cannot move from {from} to {to}")]
    InvalidStatusTransition {
        from: ExecutionStatus,
        to: ExecutionStatus,
    },
}

// ---------------------------------------------------------------------------
// Execution log
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

/// One entry of an execution's audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionLogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    pub message: String,
}

// ---------------------------------------------------------------------------
// WorkflowExecution
// ---------------------------------------------------------------------------

/// Run-time state of one workflow execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub execution_id: Uuid,
    pub workflow_id: String,
    /// Shared data flowing between steps.
    pub context: Map<String, Value>,
    /// Next step to run (sequential mode).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,
    /// Step IDs in declaration order.
    pub step_order: Vec<String>,
    pub step_results: HashMap<String, Value>,
    #[serde(default)]
    pub step_errors: HashMap<String, String>,
    pub step_statuses: HashMap<String, StepStatus>,
    pub step_dependencies_met: HashMap<String, bool>,
    pub active_steps: HashSet<String>,
    pub status: ExecutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub checkpoint_count: u32,
    pub resume_count: u32,
    #[serde(default)]
    pub logs: Vec<ExecutionLogEntry>,
    /// Terminal error message for failed executions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowExecution {
    /// Create a pending execution with every step `Pending`.
    pub fn new(
        execution_id: Uuid,
        workflow_id: impl Into<String>,
        step_order: Vec<String>,
        context: Map<String, Value>,
    ) -> Self {
        let now = Utc::now();
        let step_statuses = step_order
            .iter()
            .map(|id| (id.clone(), StepStatus::Pending))
            .collect();
        let step_dependencies_met = step_order.iter().map(|id| (id.clone(), false)).collect();

        Self {
            execution_id,
            workflow_id: workflow_id.into(),
            context,
            current_step: None,
            step_order,
            step_results: HashMap::new(),
            step_errors: HashMap::new(),
            step_statuses,
            step_dependencies_met,
            active_steps: HashSet::new(),
            status: ExecutionStatus::Pending,
            start_time: None,
            end_time: None,
            checkpoint_count: 0,
            resume_count: 0,
            logs: Vec::new(),
            error: None,
            batch_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn step_status(&self, step_id: &str) -> Option<StepStatus> {
        self.step_statuses.get(step_id).copied()
    }

    /// Move a step along `Pending -> Running -> {Completed, Failed}`.
    pub fn mark_step_status(
        &mut self,
        step_id: &str,
        status: StepStatus,
    ) -> Result<(), ExecutionStateError> {
        let current = self
            .step_status(step_id)
            .ok_or_else(|| ExecutionStateError::UnknownStep(step_id.to_string()))?;

        let allowed = matches!(
            (current, status),
            (StepStatus::Pending, StepStatus::Running)
                | (StepStatus::Running, StepStatus::Completed)
                | (StepStatus::Running, StepStatus::Failed)
        );
        if !allowed {
            return Err(ExecutionStateError::InvalidStepTransition {
                step_id: step_id.to_string(),
                from: current,
                to: status,
            });
        }

        self.step_statuses.insert(step_id.to_string(), status);
        match status {
            StepStatus::Running => {
                self.active_steps.insert(step_id.to_string());
            }
            _ => {
                self.active_steps.remove(step_id);
            }
        }
        self.touch();
        Ok(())
    }

    /// Return a running step to `Pending` after it was cancelled for a
    /// checkpoint, so that a resume runs it again.
    pub fn revert_abandoned_step(&mut self, step_id: &str) -> Result<(), ExecutionStateError> {
        match self.step_status(step_id) {
            Some(StepStatus::Running) => {
                self.step_statuses
                    .insert(step_id.to_string(), StepStatus::Pending);
                self.active_steps.remove(step_id);
                self.touch();
                Ok(())
            }
            Some(other) => Err(ExecutionStateError::InvalidStepTransition {
                step_id: step_id.to_string(),
                from: other,
                to: StepStatus::Pending,
            }),
            None => Err(ExecutionStateError::UnknownStep(step_id.to_string())),
        }
    }

    /// Change the execution status, stamping start/end times.
    pub fn set_status(&mut self, status: ExecutionStatus) -> Result<(), ExecutionStateError> {
        if !self.status.can_transition_to(status) {
            return Err(ExecutionStateError::InvalidStatusTransition {
                from: self.status,
                to: status,
            });
        }
        let now = Utc::now();
        if status == ExecutionStatus::Running && self.start_time.is_none() {
            self.start_time = Some(now);
        }
        if status.is_terminal() {
            self.end_time = Some(now);
        }
        self.status = status;
        self.updated_at = now;
        Ok(())
    }

    /// Fail the execution with a terminal error message.
    pub fn fail(&mut self, error: impl Into<String>) -> Result<(), ExecutionStateError> {
        let error = error.into();
        self.set_status(ExecutionStatus::Failed)?;
        self.log(LogLevel::Error, None, error.clone());
        self.error = Some(error);
        Ok(())
    }

    /// Recompute, for every step, whether all of its dependencies completed.
    pub fn update_dependencies_met(&mut self, deps: &DependencyGraph) {
        for step_id in &self.step_order {
            let met = deps.get(step_id).is_none_or(|ds| {
                ds.iter()
                    .all(|d| self.step_statuses.get(d) == Some(&StepStatus::Completed))
            });
            self.step_dependencies_met.insert(step_id.clone(), met);
        }
    }

    /// Steps that are `Pending` with all dependencies satisfied, in
    /// declaration order.
    pub fn get_ready_steps(&self) -> Vec<String> {
        self.step_order
            .iter()
            .filter(|id| {
                self.step_statuses.get(*id) == Some(&StepStatus::Pending)
                    && self.step_dependencies_met.get(*id).copied().unwrap_or(false)
            })
            .cloned()
            .collect()
    }

    /// Every step has reached `Completed` or `Failed`.
    pub fn is_workflow_complete(&self) -> bool {
        self.step_statuses.values().all(|s| s.is_terminal())
    }

    pub fn completed_steps(&self) -> Vec<String> {
        self.step_order
            .iter()
            .filter(|id| self.step_statuses.get(*id) == Some(&StepStatus::Completed))
            .cloned()
            .collect()
    }

    /// Number of steps in each status.
    pub fn status_counts(&self) -> HashMap<StepStatus, usize> {
        let mut counts = HashMap::new();
        for status in self.step_statuses.values() {
            *counts.entry(*status).or_insert(0) += 1;
        }
        counts
    }

    pub fn record_step_result(&mut self, step_id: &str, result: Value) {
        self.step_results.insert(step_id.to_string(), result);
        self.touch();
    }

    pub fn record_step_error(&mut self, step_id: &str, error: impl Into<String>) {
        self.step_errors.insert(step_id.to_string(), error.into());
        self.touch();
    }

    /// Append to the execution's audit trail.
    pub fn log(&mut self, level: LogLevel, step_id: Option<&str>, message: impl Into<String>) {
        self.logs.push(ExecutionLogEntry {
            timestamp: Utc::now(),
            level,
            step_id: step_id.map(str::to_string),
            message: message.into(),
        });
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

// ---------------------------------------------------------------------------
// Checkpoint
// ---------------------------------------------------------------------------

/// Why a checkpoint was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointReason {
    Manual,
    Auto,
    Shutdown,
}

impl CheckpointReason {
    pub fn as_str(self) -> &'static str {
        match self {
            CheckpointReason::Manual => "manual",
            CheckpointReason::Auto => "auto",
            CheckpointReason::Shutdown => "shutdown",
        }
    }
}

/// A persisted snapshot of an execution's full state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub checkpoint_id: Uuid,
    pub execution_id: Uuid,
    pub workflow_id: String,
    pub execution_snapshot: WorkflowExecution,
    pub reason: CheckpointReason,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
