//! In-process implementations of the storage and cache ports.
//!
//! `InMemoryWorkflowRepository` keeps entities in `DashMap`s and implements
//! filtering/sorting over their JSON form, mirroring what the SQLite backend
//! does with `json_extract`. `InMemoryCache` is a TTL-aware byte cache.

use std::cmp::Ordering;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::time::Duration;

use agentflow_types::error::{CacheError, RepositoryError};
use agentflow_types::execution::{Checkpoint, WorkflowExecution};
use agentflow_types::pagination::{ListOptions, Page, SortOrder};
use agentflow_types::workflow::WorkflowDefinition;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;
use uuid::Uuid;

use super::cache::CacheStore;
use super::{validate_field_name, WorkflowRepository};

// ---------------------------------------------------------------------------
// Repository
// ---------------------------------------------------------------------------

/// `DashMap`-backed workflow repository.
#[derive(Debug, Default)]
pub struct InMemoryWorkflowRepository {
    definitions: DashMap<String, WorkflowDefinition>,
    executions: DashMap<Uuid, WorkflowExecution>,
    checkpoints: DashMap<Uuid, Checkpoint>,
    failing: AtomicBool,
}

impl InMemoryWorkflowRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail with `RepositoryError::Connection`
    /// until switched off. Simulates a storage outage.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, AtomicOrdering::SeqCst);
    }

    fn check(&self) -> Result<(), RepositoryError> {
        if self.failing.load(AtomicOrdering::SeqCst) {
            Err(RepositoryError::Connection)
        } else {
            Ok(())
        }
    }
}

impl WorkflowRepository for InMemoryWorkflowRepository {
    async fn save_definition(&self, def: &WorkflowDefinition) -> Result<(), RepositoryError> {
        self.check()?;
        self.definitions
            .insert(def.workflow_id.clone(), def.clone());
        Ok(())
    }

    async fn get_definition(
        &self,
        workflow_id: &str,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        self.check()?;
        Ok(self.definitions.get(workflow_id).map(|d| d.clone()))
    }

    async fn delete_definition(&self, workflow_id: &str) -> Result<bool, RepositoryError> {
        self.check()?;
        Ok(self.definitions.remove(workflow_id).is_some())
    }

    async fn list_definitions(
        &self,
        options: &ListOptions,
    ) -> Result<Page<WorkflowDefinition>, RepositoryError> {
        self.check()?;
        let items = self
            .definitions
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        paginate(items, options)
    }

    async fn save_execution(&self, execution: &WorkflowExecution) -> Result<(), RepositoryError> {
        self.check()?;
        self.executions
            .insert(execution.execution_id, execution.clone());
        Ok(())
    }

    async fn get_execution(
        &self,
        execution_id: &Uuid,
    ) -> Result<Option<WorkflowExecution>, RepositoryError> {
        self.check()?;
        Ok(self.executions.get(execution_id).map(|e| e.clone()))
    }

    async fn delete_execution(&self, execution_id: &Uuid) -> Result<bool, RepositoryError> {
        self.check()?;
        self.checkpoints
            .retain(|_, cp| cp.execution_id != *execution_id);
        Ok(self.executions.remove(execution_id).is_some())
    }

    async fn list_executions(
        &self,
        options: &ListOptions,
    ) -> Result<Page<WorkflowExecution>, RepositoryError> {
        self.check()?;
        let items = self
            .executions
            .iter()
            .map(|e| (e.key().to_string(), e.value().clone()))
            .collect();
        paginate(items, options)
    }

    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), RepositoryError> {
        self.check()?;
        self.checkpoints
            .insert(checkpoint.checkpoint_id, checkpoint.clone());
        Ok(())
    }

    async fn get_checkpoint(
        &self,
        checkpoint_id: &Uuid,
    ) -> Result<Option<Checkpoint>, RepositoryError> {
        self.check()?;
        Ok(self.checkpoints.get(checkpoint_id).map(|c| c.clone()))
    }

    async fn list_checkpoints_for_execution(
        &self,
        execution_id: &Uuid,
    ) -> Result<Vec<Checkpoint>, RepositoryError> {
        self.check()?;
        let mut checkpoints: Vec<Checkpoint> = self
            .checkpoints
            .iter()
            .filter(|c| c.execution_id == *execution_id)
            .map(|c| c.clone())
            .collect();
        // UUIDv7 ids are time-ordered; they break created_at ties.
        checkpoints.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.checkpoint_id.cmp(&b.checkpoint_id))
        });
        Ok(checkpoints)
    }

    async fn list_checkpoints(
        &self,
        options: &ListOptions,
    ) -> Result<Page<Checkpoint>, RepositoryError> {
        self.check()?;
        let items = self
            .checkpoints
            .iter()
            .map(|e| (e.key().to_string(), e.value().clone()))
            .collect();
        paginate(items, options)
    }

    async fn delete_checkpoint(&self, checkpoint_id: &Uuid) -> Result<bool, RepositoryError> {
        self.check()?;
        Ok(self.checkpoints.remove(checkpoint_id).is_some())
    }
}

/// Filter, sort and slice `(key, entity)` pairs by their JSON form.
fn paginate<T: Serialize>(
    items: Vec<(String, T)>,
    options: &ListOptions,
) -> Result<Page<T>, RepositoryError> {
    for filter in &options.filters {
        validate_field_name(&filter.field)?;
    }
    let sort_field = options.sort_field();
    validate_field_name(sort_field)?;

    let mut rows = Vec::with_capacity(items.len());
    for (key, item) in items {
        let json =
            serde_json::to_value(&item).map_err(|e| RepositoryError::Query(e.to_string()))?;
        let matches = options
            .filters
            .iter()
            .all(|f| json.get(&f.field) == Some(&f.value));
        if matches {
            let sort_key = json.get(sort_field).cloned().unwrap_or(Value::Null);
            rows.push((sort_key, key, item));
        }
    }

    rows.sort_by(|(a, ka, _), (b, kb, _)| {
        let ord = compare_json(a, b).then_with(|| ka.cmp(kb));
        match options.order {
            SortOrder::Asc => ord,
            SortOrder::Desc => ord.reverse(),
        }
    });

    let total = rows.len();
    let items = rows
        .into_iter()
        .skip(options.offset)
        .take(options.limit)
        .map(|(_, _, item)| item)
        .collect();

    Ok(Page {
        items,
        total,
        offset: options.offset,
        limit: options.limit,
    })
}

/// Total order over JSON scalars: null < bool < number < string < other.
fn compare_json(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) | Value::Object(_) => 4,
        }
    }
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Vec<u8>,
    expires_at: Instant,
}

/// `DashMap`-backed cache with lazy expiry.
#[derive(Debug, Default)]
pub struct InMemoryCache {
    entries: DashMap<String, CacheEntry>,
    failing: AtomicBool,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail until switched off.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, AtomicOrdering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn check(&self) -> Result<(), CacheError> {
        if self.failing.load(AtomicOrdering::SeqCst) {
            Err(CacheError::Backend("simulated outage".to_string()))
        } else {
            Ok(())
        }
    }
}

impl CacheStore for InMemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        self.check()?;
        let now = Instant::now();
        let hit = self
            .entries
            .get(key)
            .filter(|e| e.expires_at > now)
            .map(|e| e.value.clone());
        if hit.is_none() {
            self.entries.remove_if(key, |_, e| e.expires_at <= now);
        }
        Ok(hit)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError> {
        self.check()?;
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn invalidate(&self, key: &str) -> Result<(), CacheError> {
        self.check()?;
        self.entries.remove(key);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
