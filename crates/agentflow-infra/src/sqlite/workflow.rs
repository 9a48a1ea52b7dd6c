//! SQLite workflow repository.
//!
//! Implements `WorkflowRepository` from `agentflow-core` over a
//! [`DatabasePool`]. Definitions, executions and checkpoints are stored as JSON
//! documents; list filters and sorts address top-level fields of the document
//! through `json_extract`, so they behave like the in-memory repository.
//!
//! The pool can be handed in ready-made or opened on first use with
//! [`SqliteWorkflowRepository::lazy`].

use agentflow_core::repository::{WorkflowRepository, validate_field_name};
use agentflow_types::error::RepositoryError;
use agentflow_types::execution::{Checkpoint, WorkflowExecution};
use agentflow_types::pagination::{FieldFilter, ListOptions, Page, SortOrder};
use agentflow_types::workflow::WorkflowDefinition;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value;
use sqlx::{QueryBuilder, Row, Sqlite};
use tokio::sync::OnceCell;
use uuid::Uuid;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `WorkflowRepository`.
pub struct SqliteWorkflowRepository {
    database_url: Option<String>,
    pool: OnceCell<DatabasePool>,
}

impl SqliteWorkflowRepository {
    /// Repository over an open pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self {
            database_url: None,
            pool: OnceCell::new_with(Some(pool)),
        }
    }

    /// Repository that connects (and migrates) on its first query.
    ///
    /// A failed connection surfaces as `RepositoryError::Connection` and is
    /// retried on the next call.
    pub fn lazy(database_url: impl Into<String>) -> Self {
        Self {
            database_url: Some(database_url.into()),
            pool: OnceCell::new(),
        }
    }

    async fn pool(&self) -> Result<&DatabasePool, RepositoryError> {
        self.pool
            .get_or_try_init(|| async {
                let url = self
                    .database_url
                    .as_deref()
                    .ok_or(RepositoryError::Connection)?;
                DatabasePool::new(url).await.map_err(|e| {
                    tracing::warn!(error = %e, "failed to open workflow database");
                    RepositoryError::Connection
                })
            })
            .await
    }

    /// One page of `table` documents matching `options`.
    async fn list_documents<T: DeserializeOwned>(
        &self,
        table: &str,
        key_column: &str,
        options: &ListOptions,
    ) -> Result<Page<T>, RepositoryError> {
        for filter in &options.filters {
            validate_field_name(&filter.field)?;
        }
        let sort_field = options.sort_field();
        validate_field_name(sort_field)?;
        let pool = self.pool().await?;

        let mut count = QueryBuilder::<Sqlite>::new(format!("SELECT COUNT(*) FROM {table}"));
        push_filters(&mut count, &options.filters);
        let total: i64 = count
            .build_query_scalar()
            .fetch_one(&pool.reader)
            .await
            .map_err(query_error)?;

        let direction = match options.order {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        };
        let mut select = QueryBuilder::<Sqlite>::new(format!("SELECT data FROM {table}"));
        push_filters(&mut select, &options.filters);
        select.push(format!(
            " ORDER BY json_extract(data, '$.{sort_field}') {direction}, {key_column} {direction}"
        ));
        select.push(" LIMIT ").push_bind(to_i64(options.limit));
        select.push(" OFFSET ").push_bind(to_i64(options.offset));

        let rows = select
            .build()
            .fetch_all(&pool.reader)
            .await
            .map_err(query_error)?;
        let mut items = Vec::with_capacity(rows.len());
        for row in &rows {
            items.push(decode_row(row)?);
        }

        Ok(Page {
            items,
            total: usize::try_from(total).unwrap_or_default(),
            offset: options.offset,
            limit: options.limit,
        })
    }

    async fn get_document<T: DeserializeOwned>(
        &self,
        sql: &str,
        key: String,
    ) -> Result<Option<T>, RepositoryError> {
        let pool = self.pool().await?;
        let row = sqlx::query(sql)
            .bind(key)
            .fetch_optional(&pool.reader)
            .await
            .map_err(query_error)?;
        row.as_ref().map(decode_row).transpose()
    }

    async fn delete_row(&self, sql: &str, key: String) -> Result<bool, RepositoryError> {
        let pool = self.pool().await?;
        let result = sqlx::query(sql)
            .bind(key)
            .execute(&pool.writer)
            .await
            .map_err(query_error)?;
        Ok(result.rows_affected() > 0)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn query_error(e: sqlx::Error) -> RepositoryError {
    RepositoryError::Query(e.to_string())
}

fn to_i64(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn encode<T: serde::Serialize>(entity: &T, what: &str) -> Result<String, RepositoryError> {
    serde_json::to_string(entity)
        .map_err(|e| RepositoryError::Query(format!("serialize {what}: {e}")))
}

fn decode_row<T: DeserializeOwned>(row: &sqlx::sqlite::SqliteRow) -> Result<T, RepositoryError> {
    let data: String = row.try_get("data").map_err(query_error)?;
    serde_json::from_str(&data)
        .map_err(|e| RepositoryError::Query(format!("invalid stored document: {e}")))
}

/// Append `WHERE json_extract(data, '$.field') = ?` clauses. Field names must
/// already be validated.
fn push_filters(query: &mut QueryBuilder<'_, Sqlite>, filters: &[FieldFilter]) {
    for (i, filter) in filters.iter().enumerate() {
        query.push(if i == 0 { " WHERE " } else { " AND " });
        query.push(format!("json_extract(data, '$.{}')", filter.field));
        match &filter.value {
            Value::Null => {
                query.push(" IS NULL");
            }
            Value::Bool(b) => {
                query.push(" = ").push_bind(i64::from(*b));
            }
            Value::Number(n) => match n.as_i64() {
                Some(i) => {
                    query.push(" = ").push_bind(i);
                }
                None => {
                    query.push(" = ").push_bind(n.as_f64().unwrap_or_default());
                }
            },
            Value::String(s) => {
                query.push(" = ").push_bind(s.clone());
            }
            other => {
                query.push(" = json(").push_bind(other.to_string()).push(")");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// WorkflowRepository impl
// ---------------------------------------------------------------------------

impl WorkflowRepository for SqliteWorkflowRepository {
    async fn save_definition(&self, def: &WorkflowDefinition) -> Result<(), RepositoryError> {
        let data = encode(def, "definition")?;
        let now = format_datetime(&Utc::now());
        let pool = self.pool().await?;

        sqlx::query(
            r#"INSERT INTO workflow_definitions (workflow_id, name, data, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?)
               ON CONFLICT(workflow_id) DO UPDATE SET
                 name = excluded.name,
                 data = excluded.data,
                 updated_at = excluded.updated_at"#,
        )
        .bind(&def.workflow_id)
        .bind(&def.name)
        .bind(&data)
        .bind(&now)
        .bind(&now)
        .execute(&pool.writer)
        .await
        .map_err(query_error)?;

        Ok(())
    }

    async fn get_definition(
        &self,
        workflow_id: &str,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        self.get_document(
            "SELECT data FROM workflow_definitions WHERE workflow_id = ?",
            workflow_id.to_string(),
        )
        .await
    }

    async fn delete_definition(&self, workflow_id: &str) -> Result<bool, RepositoryError> {
        self.delete_row(
            "DELETE FROM workflow_definitions WHERE workflow_id = ?",
            workflow_id.to_string(),
        )
        .await
    }

    async fn list_definitions(
        &self,
        options: &ListOptions,
    ) -> Result<Page<WorkflowDefinition>, RepositoryError> {
        self.list_documents("workflow_definitions", "workflow_id", options)
            .await
    }

    async fn save_execution(&self, execution: &WorkflowExecution) -> Result<(), RepositoryError> {
        let data = encode(execution, "execution")?;
        let pool = self.pool().await?;

        // Upsert rather than REPLACE: a delete would cascade to checkpoints.
        sqlx::query(
            r#"INSERT INTO workflow_executions
               (execution_id, workflow_id, status, batch_id, data, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(execution_id) DO UPDATE SET
                 status = excluded.status,
                 data = excluded.data,
                 updated_at = excluded.updated_at"#,
        )
        .bind(execution.execution_id.to_string())
        .bind(&execution.workflow_id)
        .bind(execution.status.as_str())
        .bind(execution.batch_id.map(|id| id.to_string()))
        .bind(&data)
        .bind(format_datetime(&execution.created_at))
        .bind(format_datetime(&execution.updated_at))
        .execute(&pool.writer)
        .await
        .map_err(query_error)?;

        Ok(())
    }

    async fn get_execution(
        &self,
        execution_id: &Uuid,
    ) -> Result<Option<WorkflowExecution>, RepositoryError> {
        self.get_document(
            "SELECT data FROM workflow_executions WHERE execution_id = ?",
            execution_id.to_string(),
        )
        .await
    }

    async fn delete_execution(&self, execution_id: &Uuid) -> Result<bool, RepositoryError> {
        self.delete_row(
            "DELETE FROM workflow_executions WHERE execution_id = ?",
            execution_id.to_string(),
        )
        .await
    }

    async fn list_executions(
        &self,
        options: &ListOptions,
    ) -> Result<Page<WorkflowExecution>, RepositoryError> {
        self.list_documents("workflow_executions", "execution_id", options)
            .await
    }

    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), RepositoryError> {
        let data = encode(checkpoint, "checkpoint")?;
        let pool = self.pool().await?;

        let result = sqlx::query(
            r#"INSERT INTO workflow_checkpoints
               (checkpoint_id, execution_id, workflow_id, reason, data, created_at)
               VALUES (?, ?, ?, ?, ?, ?)
               ON CONFLICT(checkpoint_id) DO UPDATE SET data = excluded.data"#,
        )
        .bind(checkpoint.checkpoint_id.to_string())
        .bind(checkpoint.execution_id.to_string())
        .bind(&checkpoint.workflow_id)
        .bind(checkpoint.reason.as_str())
        .bind(&data)
        .bind(format_datetime(&checkpoint.created_at))
        .execute(&pool.writer)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_foreign_key_violation() => {
                Err(RepositoryError::Conflict(format!(
                    "execution {} does not exist",
                    checkpoint.execution_id
                )))
            }
            Err(e) => Err(query_error(e)),
        }
    }

    async fn get_checkpoint(
        &self,
        checkpoint_id: &Uuid,
    ) -> Result<Option<Checkpoint>, RepositoryError> {
        self.get_document(
            "SELECT data FROM workflow_checkpoints WHERE checkpoint_id = ?",
            checkpoint_id.to_string(),
        )
        .await
    }

    async fn list_checkpoints_for_execution(
        &self,
        execution_id: &Uuid,
    ) -> Result<Vec<Checkpoint>, RepositoryError> {
        let pool = self.pool().await?;
        let rows = sqlx::query(
            r#"SELECT data FROM workflow_checkpoints
               WHERE execution_id = ?
               ORDER BY created_at ASC, checkpoint_id ASC"#,
        )
        .bind(execution_id.to_string())
        .fetch_all(&pool.reader)
        .await
        .map_err(query_error)?;

        rows.iter().map(decode_row).collect()
    }

    async fn list_checkpoints(
        &self,
        options: &ListOptions,
    ) -> Result<Page<Checkpoint>, RepositoryError> {
        self.list_documents("workflow_checkpoints", "checkpoint_id", options)
            .await
    }

    async fn delete_checkpoint(&self, checkpoint_id: &Uuid) -> Result<bool, RepositoryError> {
        self.delete_row(
            "DELETE FROM workflow_checkpoints WHERE checkpoint_id = ?",
            checkpoint_id.to_string(),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentflow_types::execution::{CheckpointReason, ExecutionStatus};
    use agentflow_types::workflow::{AgentConfig, StepConfig};
    use serde_json::{Map, json};
    use std::collections::HashMap;

    async fn repo() -> (tempfile::TempDir, SqliteWorkflowRepository) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("wf.db").display());
        let pool = DatabasePool::new(&url).await.unwrap();
        (dir, SqliteWorkflowRepository::new(pool))
    }

    fn definition(workflow_id: &str) -> WorkflowDefinition {
        let mut agents = HashMap::new();
        agents.insert(
            "parser".to_string(),
            AgentConfig::DocumentParser {
                formats: vec!["pdf".to_string()],
            },
        );
        WorkflowDefinition {
            workflow_id: workflow_id.to_string(),
            name: format!("{workflow_id} workflow"),
            description: None,
            steps: vec![StepConfig::new("parse", "parser")],
            transitions: HashMap::new(),
            agents,
            parallel_execution_enabled: false,
            global_context: Map::new(),
            error_handler: None,
            metadata: HashMap::new(),
        }
    }

    fn execution(workflow_id: &str, batch_id: Option<Uuid>) -> WorkflowExecution {
        let mut exec = WorkflowExecution::new(
            Uuid::now_v7(),
            workflow_id,
            vec!["parse".to_string()],
            json!({ "doc": "invoice.pdf" }).as_object().cloned().unwrap(),
        );
        exec.batch_id = batch_id;
        exec
    }

    fn checkpoint(exec: &WorkflowExecution, reason: CheckpointReason) -> Checkpoint {
        Checkpoint {
            checkpoint_id: Uuid::now_v7(),
            execution_id: exec.execution_id,
            workflow_id: exec.workflow_id.clone(),
            execution_snapshot: exec.clone(),
            reason,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_definition_upsert_get_delete() {
        let (_dir, repo) = repo().await;
        let mut def = definition("intake");
        repo.save_definition(&def).await.unwrap();

        def.name = "Document intake".to_string();
        repo.save_definition(&def).await.unwrap();

        let loaded = repo.get_definition("intake").await.unwrap().unwrap();
        assert_eq!(loaded.name, "Document intake");
        assert_eq!(loaded.agents["parser"], def.agents["parser"]);

        let page = repo.list_definitions(&ListOptions::default()).await.unwrap();
        assert_eq!(page.total, 1);

        assert!(repo.delete_definition("intake").await.unwrap());
        assert!(!repo.delete_definition("intake").await.unwrap());
        assert!(repo.get_definition("intake").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_execution_round_trip_keeps_state() {
        let (_dir, repo) = repo().await;
        let mut exec = execution("intake", None);
        repo.save_execution(&exec).await.unwrap();

        exec.set_status(ExecutionStatus::Running).unwrap();
        exec.record_step_result("parse", json!({ "pages": 3 }));
        repo.save_execution(&exec).await.unwrap();

        let loaded = repo.get_execution(&exec.execution_id).await.unwrap().unwrap();
        assert_eq!(loaded.status, ExecutionStatus::Running);
        assert_eq!(loaded.step_results["parse"], json!({ "pages": 3 }));
        assert_eq!(loaded.context["doc"], json!("invoice.pdf"));
        assert!(loaded.start_time.is_some());
    }

    #[tokio::test]
    async fn test_list_executions_filters_and_paginates() {
        let (_dir, repo) = repo().await;
        let batch_id = Uuid::now_v7();
        for _ in 0..3 {
            repo.save_execution(&execution("intake", Some(batch_id)))
                .await
                .unwrap();
        }
        repo.save_execution(&execution("intake", None)).await.unwrap();
        repo.save_execution(&execution("billing", None)).await.unwrap();

        let batch = repo
            .list_executions(&ListOptions::default().filter("batch_id", batch_id.to_string()))
            .await
            .unwrap();
        assert_eq!(batch.total, 3);
        assert!(batch.items.iter().all(|e| e.batch_id == Some(batch_id)));

        let first = repo
            .list_executions(
                &ListOptions::page(0, 2)
                    .filter("workflow_id", "intake")
                    .sort("created_at", SortOrder::Asc),
            )
            .await
            .unwrap();
        assert_eq!(first.total, 4);
        assert_eq!(first.items.len(), 2);
        assert!(first.has_more());
        assert!(first.items[0].created_at <= first.items[1].created_at);

        let pending = repo
            .list_executions(&ListOptions::default().filter("status", "pending"))
            .await
            .unwrap();
        assert_eq!(pending.total, 5);
    }

    #[tokio::test]
    async fn test_invalid_field_names_are_rejected() {
        let (_dir, repo) = repo().await;
        let options = ListOptions::default().filter("status') OR 1=1 --", "x");
        assert!(matches!(
            repo.list_executions(&options).await,
            Err(RepositoryError::Query(_))
        ));
    }

    #[tokio::test]
    async fn test_checkpoints_ordered_and_cascade_with_execution() {
        let (_dir, repo) = repo().await;
        let exec = execution("intake", None);
        repo.save_execution(&exec).await.unwrap();

        let first = checkpoint(&exec, CheckpointReason::Auto);
        let second = checkpoint(&exec, CheckpointReason::Manual);
        repo.save_checkpoint(&first).await.unwrap();
        repo.save_checkpoint(&second).await.unwrap();

        let listed = repo
            .list_checkpoints_for_execution(&exec.execution_id)
            .await
            .unwrap();
        let ids: Vec<Uuid> = listed.iter().map(|c| c.checkpoint_id).collect();
        assert_eq!(ids, vec![first.checkpoint_id, second.checkpoint_id]);

        let manual = repo
            .list_checkpoints(&ListOptions::default().filter("reason", "manual"))
            .await
            .unwrap();
        assert_eq!(manual.total, 1);

        let pool = repo.pool().await.unwrap();
        let reasons: Vec<(String,)> = sqlx::query_as(
            "SELECT reason FROM workflow_checkpoints ORDER BY created_at ASC, checkpoint_id ASC",
        )
        .fetch_all(&pool.reader)
        .await
        .unwrap();
        assert_eq!(
            reasons,
            vec![("auto".to_string(),), ("manual".to_string(),)]
        );

        assert!(repo.delete_execution(&exec.execution_id).await.unwrap());
        assert!(repo.get_checkpoint(&first.checkpoint_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_checkpoint_for_unknown_execution_conflicts() {
        let (_dir, repo) = repo().await;
        let exec = execution("intake", None);
        let result = repo
            .save_checkpoint(&checkpoint(&exec, CheckpointReason::Manual))
            .await;
        assert!(matches!(result, Err(RepositoryError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_lazy_repository_connects_on_first_use() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("lazy.db").display());
        let repo = SqliteWorkflowRepository::lazy(url);
        assert!(!dir.path().join("lazy.db").exists());

        repo.save_definition(&definition("intake")).await.unwrap();
        assert!(repo.get_definition("intake").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_lazy_repository_reports_connection_failure() {
        let repo = SqliteWorkflowRepository::lazy("sqlite:///nonexistent-dir/agentflow/wf.db");
        assert_eq!(
            repo.get_definition("intake").await.unwrap_err(),
            RepositoryError::Connection
        );
    }
}
