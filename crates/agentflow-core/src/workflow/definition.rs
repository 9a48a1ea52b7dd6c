//! Workflow definition parsing and validation.
//!
//! Converts YAML/JSON documents into the canonical `WorkflowDefinition`,
//! checks the structural shape of raw documents before deserialization, and
//! validates definition invariants (unique step IDs, known agents, valid
//! transitions, acyclic dependencies).

use std::collections::HashSet;

use agentflow_types::workflow::WorkflowDefinition;
use serde_json::Value;
use thiserror::Error;

use super::dag;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// A definition or document violates a structural invariant.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("workflow_id must not be empty")]
    EmptyWorkflowId,

    #[error("workflow name must not be empty")]
    EmptyName,

    #[error("workflow must have at least one step")]
    NoSteps,

    #[error("duplicate step ID: '{0}'")]
    DuplicateStep(String),

    #[error("step '{step_id}' references unknown agent '{agent_id}'")]
    UnknownAgent { step_id: String, agent_id: String },

    #[error("transition {from_step} -> {to_step} references an unknown step")]
    UnknownTransitionStep { from_step: String, to_step: String },

    #[error("agent '{agent_id}' is invalid: {reason}")]
    InvalidAgent { agent_id: String, reason: String },

    #[error("step '{0}' timeout must be > 0")]
    InvalidTimeout(String),

    #[error("no step executor registered for '{executor}' (agent '{agent_id}')")]
    MissingExecutor { agent_id: String, executor: String },

    #[error("error handler '{0}' is not registered")]
    UnknownErrorHandler(String),

    /// The dependency graph induced by transitions contains a cycle.
    #[error("dependency cycle among steps: {}", .steps.join(", "))]
    DependencyCycle { steps: Vec<String> },

    /// The raw document does not have the required shape.
    #[error("schema violation at {path}: {message}")]
    Schema { path: String, message: String },
}

impl ValidationError {
    pub fn is_cycle(&self) -> bool {
        matches!(self, ValidationError::DependencyCycle { .. })
    }

    fn schema(path: impl Into<String>, message: impl Into<String>) -> Self {
        ValidationError::Schema {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Errors that can occur during workflow operations.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// YAML/JSON parse failure.
    #[error("parse error: {0}")]
    Parse(String),

    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    /// JEXL expression error.
    #[error("expression error: {0}")]
    Expression(String),

    /// Runtime execution failure.
    #[error("execution error: {0}")]
    Execution(String),
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a YAML string into a validated `WorkflowDefinition`.
pub fn parse_workflow_yaml(yaml: &str) -> Result<WorkflowDefinition, WorkflowError> {
    let def: WorkflowDefinition =
        serde_yaml_ng::from_str(yaml).map_err(|e| WorkflowError::Parse(e.to_string()))?;
    validate_definition(&def)?;
    Ok(def)
}

/// Check a raw JSON document against the structural schema, then parse and
/// validate it.
pub fn parse_workflow_document(doc: &Value) -> Result<WorkflowDefinition, WorkflowError> {
    validate_document(doc)?;
    let def: WorkflowDefinition =
        serde_json::from_value(doc.clone()).map_err(|e| WorkflowError::Parse(e.to_string()))?;
    validate_definition(&def)?;
    Ok(def)
}

pub fn serialize_workflow_yaml(def: &WorkflowDefinition) -> Result<String, WorkflowError> {
    serde_yaml_ng::to_string(def).map_err(|e| WorkflowError::Parse(e.to_string()))
}

/// JSON Schema of `WorkflowDefinition`, for editors and external validators.
pub fn definition_json_schema() -> Result<Value, WorkflowError> {
    serde_json::to_value(schemars::schema_for!(WorkflowDefinition))
        .map_err(|e| WorkflowError::Parse(e.to_string()))
}

// ---------------------------------------------------------------------------
// Document shape
// ---------------------------------------------------------------------------

/// Check the minimal shape of a raw workflow document.
///
/// Requires `workflow_id`, `name`, `steps[]` (each with `step_id` and
/// `agent_id`) and `agents` (each with a `type`). `transitions` is optional
/// but must map step IDs to arrays of `{ to_step }` objects.
pub fn validate_document(doc: &Value) -> Result<(), ValidationError> {
    let root = doc
        .as_object()
        .ok_or_else(|| ValidationError::schema("$", "document must be an object"))?;

    for field in ["workflow_id", "name"] {
        match root.get(field) {
            Some(Value::String(_)) => {}
            Some(_) => return Err(ValidationError::schema(field, "must be a string")),
            None => return Err(ValidationError::schema(field, "is required")),
        }
    }

    let steps = root
        .get("steps")
        .ok_or_else(|| ValidationError::schema("steps", "is required"))?
        .as_array()
        .ok_or_else(|| ValidationError::schema("steps", "must be an array"))?;
    for (i, step) in steps.iter().enumerate() {
        let obj = step
            .as_object()
            .ok_or_else(|| ValidationError::schema(format!("steps[{i}]"), "must be an object"))?;
        for field in ["step_id", "agent_id"] {
            if !obj.get(field).is_some_and(Value::is_string) {
                return Err(ValidationError::schema(
                    format!("steps[{i}].{field}"),
                    "is required and must be a string",
                ));
            }
        }
    }

    let agents = root
        .get("agents")
        .ok_or_else(|| ValidationError::schema("agents", "is required"))?
        .as_object()
        .ok_or_else(|| ValidationError::schema("agents", "must be an object"))?;
    for (agent_id, agent) in agents {
        if !agent.get("type").is_some_and(Value::is_string) {
            return Err(ValidationError::schema(
                format!("agents.{agent_id}.type"),
                "is required and must be a string",
            ));
        }
    }

    if let Some(transitions) = root.get("transitions") {
        let transitions = transitions
            .as_object()
            .ok_or_else(|| ValidationError::schema("transitions", "must be an object"))?;
        for (from, edges) in transitions {
            let edges = edges.as_array().ok_or_else(|| {
                ValidationError::schema(format!("transitions.{from}"), "must be an array")
            })?;
            for (i, edge) in edges.iter().enumerate() {
                if !edge.get("to_step").is_some_and(Value::is_string) {
                    return Err(ValidationError::schema(
                        format!("transitions.{from}[{i}].to_step"),
                        "is required and must be a string",
                    ));
                }
            }
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate the invariants of a `WorkflowDefinition`.
///
/// Checks:
/// - `workflow_id` and name are non-empty
/// - At least one step exists and step IDs are unique
/// - Every step references a declared agent
/// - Every agent config passes its own validation
/// - Every transition endpoint is a declared step
/// - Step timeouts are > 0 when set
/// - The dependency graph is acyclic
///
/// Executor availability and error handler registration depend on the engine
/// and are checked there.
pub fn validate_definition(def: &WorkflowDefinition) -> Result<(), ValidationError> {
    if def.workflow_id.trim().is_empty() {
        return Err(ValidationError::EmptyWorkflowId);
    }
    if def.name.trim().is_empty() {
        return Err(ValidationError::EmptyName);
    }
    if def.steps.is_empty() {
        return Err(ValidationError::NoSteps);
    }

    let mut seen_ids = HashSet::new();
    for step in &def.steps {
        if !seen_ids.insert(step.step_id.as_str()) {
            return Err(ValidationError::DuplicateStep(step.step_id.clone()));
        }
    }

    for step in &def.steps {
        if !def.agents.contains_key(&step.agent_id) {
            return Err(ValidationError::UnknownAgent {
                step_id: step.step_id.clone(),
                agent_id: step.agent_id.clone(),
            });
        }
        if step.timeout_secs == Some(0) {
            return Err(ValidationError::InvalidTimeout(step.step_id.clone()));
        }
    }

    // Sorted for a deterministic first error.
    let mut agent_ids: Vec<&String> = def.agents.keys().collect();
    agent_ids.sort();
    for agent_id in agent_ids {
        def.agents[agent_id]
            .validate()
            .map_err(|reason| ValidationError::InvalidAgent {
                agent_id: agent_id.clone(),
                reason,
            })?;
    }

    let mut sources: Vec<&String> = def.transitions.keys().collect();
    sources.sort();
    for from in sources {
        for transition in &def.transitions[from] {
            if !seen_ids.contains(from.as_str()) || !seen_ids.contains(transition.to_step.as_str())
            {
                return Err(ValidationError::UnknownTransitionStep {
                    from_step: from.clone(),
                    to_step: transition.to_step.clone(),
                });
            }
        }
    }

    let deps = dag::build_dependency_graph(def);
    dag::topological_sort(def, &deps)?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
