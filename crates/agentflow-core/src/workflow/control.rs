//! Control channel between the engine and a running scheduler.
//!
//! The scheduler task exclusively owns its `WorkflowExecution`. The engine
//! keeps an `ExecutionHandle`: a cancellation token, a request channel for
//! checkpoints, and a `watch` receiver of the latest execution snapshot.

use agentflow_types::execution::{Checkpoint, CheckpointReason, ExecutionStatus, WorkflowExecution};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::checkpoint::CheckpointError;

const REQUEST_BUFFER: usize = 8;

/// A request the scheduler services at its next opportunity.
#[derive(Debug)]
pub enum ControlRequest {
    /// Pause, snapshot, and stay paused.
    Checkpoint {
        reason: CheckpointReason,
        reply: oneshot::Sender<Result<Checkpoint, CheckpointError>>,
    },
}

/// Scheduler side of the channel.
#[derive(Debug)]
pub struct ExecutionControl {
    pub cancel: CancellationToken,
    pub requests: mpsc::Receiver<ControlRequest>,
    pub snapshots: watch::Sender<WorkflowExecution>,
}

impl ExecutionControl {
    /// Publish the execution's current state to every handle.
    pub fn publish(&self, execution: &WorkflowExecution) {
        self.snapshots.send_replace(execution.clone());
    }
}

/// Engine side of the channel.
#[derive(Debug, Clone)]
pub struct ExecutionHandle {
    pub execution_id: Uuid,
    cancel: CancellationToken,
    requests: mpsc::Sender<ControlRequest>,
    snapshots: watch::Receiver<WorkflowExecution>,
}

/// Errors from talking to a scheduler.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    /// The scheduler finished (or died) before answering.
    #[error("execution {0} is no longer running")]
    Closed(Uuid),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

/// Create a connected handle/control pair seeded with `initial`.
pub fn channel(
    initial: WorkflowExecution,
    cancel: CancellationToken,
) -> (ExecutionHandle, ExecutionControl) {
    let execution_id = initial.execution_id;
    let (request_tx, request_rx) = mpsc::channel(REQUEST_BUFFER);
    let (snapshot_tx, snapshot_rx) = watch::channel(initial);
    (
        ExecutionHandle {
            execution_id,
            cancel: cancel.clone(),
            requests: request_tx,
            snapshots: snapshot_rx,
        },
        ExecutionControl {
            cancel,
            requests: request_rx,
            snapshots: snapshot_tx,
        },
    )
}

impl ExecutionHandle {
    /// Latest published state.
    pub fn snapshot(&self) -> WorkflowExecution {
        self.snapshots.borrow().clone()
    }

    pub fn status(&self) -> ExecutionStatus {
        self.snapshots.borrow().status
    }

    /// Request cooperative cancellation.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Ask the scheduler to pause and checkpoint, and wait for the result.
    pub async fn request_checkpoint(
        &self,
        reason: CheckpointReason,
    ) -> Result<Checkpoint, ControlError> {
        let (reply, response) = oneshot::channel();
        self.requests
            .send(ControlRequest::Checkpoint { reason, reply })
            .await
            .map_err(|_| ControlError::Closed(self.execution_id))?;
        response
            .await
            .map_err(|_| ControlError::Closed(self.execution_id))?
            .map_err(ControlError::from)
    }

    /// Wait until the execution is paused or terminal, returning that state.
    ///
    /// Returns the last published state if the scheduler goes away first.
    pub async fn settled(&self) -> WorkflowExecution {
        let mut rx = self.snapshots.clone();
        let settled = rx
            .wait_for(|e| e.status == ExecutionStatus::Paused || e.status.is_terminal())
            .await
            .map(|e| (*e).clone());
        match settled {
            Ok(execution) => execution,
            Err(_) => rx.borrow().clone(),
        }
    }
}
