//! Repository and cache trait definitions (ports).
//!
//! These traits define the storage interface that the infrastructure layer
//! (agentflow-infra) implements. The core crate never depends on any
//! specific storage technology; `memory` provides in-process
//! implementations used by tests and embedded deployments.

pub mod cache;
pub mod memory;

use agentflow_types::error::RepositoryError;
use agentflow_types::execution::{Checkpoint, WorkflowExecution};
use agentflow_types::pagination::{ListOptions, Page};
use agentflow_types::workflow::WorkflowDefinition;
use uuid::Uuid;

pub use cache::CacheStore;

/// Repository trait for workflow persistence.
///
/// Covers three entity families:
/// - **Definitions:** keyed by the user-chosen `workflow_id`.
/// - **Executions:** full execution state keyed by `execution_id`.
/// - **Checkpoints:** execution snapshots keyed by `checkpoint_id`.
///
/// List queries filter on top-level fields of the serialized entity (equality
/// only) and sort on one top-level field.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait WorkflowRepository: Send + Sync {
    // -----------------------------------------------------------------------
    // Definitions
    // -----------------------------------------------------------------------

    /// Upsert a workflow definition (insert or replace by `workflow_id`).
    fn save_definition(
        &self,
        def: &WorkflowDefinition,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_definition(
        &self,
        workflow_id: &str,
    ) -> impl std::future::Future<
        Output = Result<Option<WorkflowDefinition>, RepositoryError>,
    > + Send;

    /// Delete a definition. Returns `true` if it existed.
    fn delete_definition(
        &self,
        workflow_id: &str,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    fn list_definitions(
        &self,
        options: &ListOptions,
    ) -> impl std::future::Future<
        Output = Result<Page<WorkflowDefinition>, RepositoryError>,
    > + Send;

    // -----------------------------------------------------------------------
    // Executions
    // -----------------------------------------------------------------------

    /// Upsert an execution (insert or replace by `execution_id`).
    fn save_execution(
        &self,
        execution: &WorkflowExecution,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_execution(
        &self,
        execution_id: &Uuid,
    ) -> impl std::future::Future<
        Output = Result<Option<WorkflowExecution>, RepositoryError>,
    > + Send;

    /// Delete an execution and its checkpoints. Returns `true` if it existed.
    fn delete_execution(
        &self,
        execution_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    fn list_executions(
        &self,
        options: &ListOptions,
    ) -> impl std::future::Future<Output = Result<Page<WorkflowExecution>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Checkpoints
    // -----------------------------------------------------------------------

    fn save_checkpoint(
        &self,
        checkpoint: &Checkpoint,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_checkpoint(
        &self,
        checkpoint_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<Checkpoint>, RepositoryError>> + Send;

    /// Checkpoints of one execution, oldest first.
    fn list_checkpoints_for_execution(
        &self,
        execution_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<Checkpoint>, RepositoryError>> + Send;

    fn list_checkpoints(
        &self,
        options: &ListOptions,
    ) -> impl std::future::Future<Output = Result<Page<Checkpoint>, RepositoryError>> + Send;

    /// Delete a checkpoint. Returns `true` if it existed.
    fn delete_checkpoint(
        &self,
        checkpoint_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;
}

/// Fields accepted by list filters and sorts: plain identifiers only.
///
/// Storage backends interpolate the field into a JSON path, so anything else
/// is rejected as a query error.
pub fn validate_field_name(field: &str) -> Result<(), RepositoryError> {
    let valid = !field.is_empty()
        && field.len() <= 64
        && field
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(RepositoryError::Query(format!("invalid field name '{field}'")))
    }
}
