//! Workflow definition types for agentflow.
//!
//! `WorkflowDefinition` is the immutable description of a workflow: its steps,
//! the agents those steps are bound to, the transitions that connect them and
//! whether the engine may run independent steps in parallel. Definitions are
//! stored as JSON documents and may also be authored in YAML.

use std::collections::{BTreeMap, HashMap};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// Workflow Definition
// ---------------------------------------------------------------------------

/// The canonical workflow definition.
///
/// Shared read-only by every execution created from it.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct WorkflowDefinition {
    /// User-chosen identifier (e.g. "document-intake"). Storage key.
    pub workflow_id: String,
    /// Human-readable workflow name.
    pub name: String,
    /// Optional longer description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Steps in declaration order.
    pub steps: Vec<StepConfig>,
    /// Outgoing transitions keyed by the source step ID.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub transitions: HashMap<String, Vec<Transition>>,
    /// Agent configurations keyed by agent ID.
    pub agents: HashMap<String, AgentConfig>,
    /// Run independent steps concurrently, level by level.
    #[serde(default)]
    pub parallel_execution_enabled: bool,
    /// Context every execution starts from (request context is merged over it).
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub global_context: Map<String, Value>,
    /// Name of a registered failure handler. `None` means any step failure
    /// fails the whole execution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_handler: Option<String>,
    /// Extensible metadata.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

impl WorkflowDefinition {
    /// Look up a step by ID.
    pub fn step(&self, step_id: &str) -> Option<&StepConfig> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }

    /// Step IDs in declaration order.
    pub fn step_ids(&self) -> Vec<String> {
        self.steps.iter().map(|s| s.step_id.clone()).collect()
    }

    /// Transitions leaving `step_id` (empty when none are declared).
    pub fn transitions_from(&self, step_id: &str) -> &[Transition] {
        self.transitions
            .get(step_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// The agent bound to a step, if both exist.
    pub fn agent_for(&self, step: &StepConfig) -> Option<&AgentConfig> {
        self.agents.get(&step.agent_id)
    }
}

// ---------------------------------------------------------------------------
// Step Configuration
// ---------------------------------------------------------------------------

/// A single step in the workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StepConfig {
    /// Unique within a workflow.
    pub step_id: String,
    /// Key into `WorkflowDefinition::agents`.
    pub agent_id: String,
    /// Input field -> source path (`context.<path>`, `results.<step>.<path>`
    /// or a literal).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub input_mapping: BTreeMap<String, String>,
    /// Context field -> path into the step result.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub output_mapping: BTreeMap<String, String>,
    /// Step-level timeout in seconds (overrides the engine default).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl StepConfig {
    /// Build a step with no mappings.
    pub fn new(step_id: impl Into<String>, agent_id: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            agent_id: agent_id.into(),
            input_mapping: BTreeMap::new(),
            output_mapping: BTreeMap::new(),
            timeout_secs: None,
        }
    }
}

/// A directed edge between two steps.
///
/// The source step is the key of `WorkflowDefinition::transitions`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Transition {
    /// Destination step ID.
    pub to_step: String,
    /// Optional JEXL predicate over `{ context, results }`. Only consulted by
    /// the sequential scheduler.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

impl Transition {
    pub fn to(step_id: impl Into<String>) -> Self {
        Self {
            to_step: step_id.into(),
            condition: None,
        }
    }

    pub fn when(step_id: impl Into<String>, condition: impl Into<String>) -> Self {
        Self {
            to_step: step_id.into(),
            condition: Some(condition.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Agent Configuration
// ---------------------------------------------------------------------------

/// Configuration of the agent that performs a step.
///
/// Internally tagged by `type`:
/// ```yaml
/// agents:
///   summarizer:
///     type: llm
///     model: claude-sonnet
///     temperature: 0.2
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentConfig {
    /// Extracts text and structure from documents.
    DocumentParser {
        #[serde(default)]
        formats: Vec<String>,
    },
    /// Assigns tags using heuristics or a taxonomy.
    Tagger {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        taxonomy: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_tags: Option<u32>,
    },
    /// Renders a prompt template against the step input.
    PromptRenderer { template: String },
    /// Classifies the intent of an input.
    IntentRecognizer {
        #[serde(default)]
        intents: Vec<String>,
    },
    /// Calls a language model.
    Llm {
        model: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        temperature: Option<f32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_tokens: Option<u32>,
    },
    /// Any other executor, registered under `handler`.
    Custom {
        handler: String,
        #[serde(default, skip_serializing_if = "Map::is_empty")]
        options: Map<String, Value>,
    },
}

impl AgentConfig {
    /// Name of the step executor that runs this agent kind.
    pub fn executor_key(&self) -> &str {
        match self {
            AgentConfig::DocumentParser { .. } => "document_parser",
            AgentConfig::Tagger { .. } => "tagger",
            AgentConfig::PromptRenderer { .. } => "prompt_renderer",
            AgentConfig::IntentRecognizer { .. } => "intent_recognizer",
            AgentConfig::Llm { .. } => "llm",
            AgentConfig::Custom { handler, .. } => handler.as_str(),
        }
    }

    /// Check variant-specific constraints.
    ///
    /// Returns a human-readable reason on failure.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            AgentConfig::PromptRenderer { template } if template.trim().is_empty() => {
                Err("prompt_renderer template must not be empty".to_string())
            }
            AgentConfig::Llm { model, .. } if model.trim().is_empty() => {
                Err("llm model must not be empty".to_string())
            }
            AgentConfig::Llm {
                temperature: Some(t),
                ..
            } if !(0.0..=2.0).contains(t) => Err(format!(
                "llm temperature {t} out of range (0.0..=2.0)"
            )),
            AgentConfig::Tagger {
                max_tags: Some(0), ..
            } => Err("tagger max_tags must be > 0".to_string()),
            AgentConfig::Custom { handler, .. } if handler.trim().is_empty() => {
                Err("custom agent handler must not be empty".to_string())
            }
            _ => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_definition() -> WorkflowDefinition {
        let mut agents = HashMap::new();
        agents.insert(
            "parser".to_string(),
            AgentConfig::DocumentParser {
                formats: vec!["pdf".to_string()],
            },
        );
        agents.insert(
            "writer".to_string(),
            AgentConfig::Llm {
                model: "claude-sonnet".to_string(),
                temperature: Some(0.2),
                max_tokens: None,
            },
        );

        let mut transitions = HashMap::new();
        transitions.insert("parse".to_string(), vec![Transition::to("summarize")]);

        WorkflowDefinition {
            workflow_id: "intake".to_string(),
            name: "Document intake".to_string(),
            description: None,
            steps: vec![
                StepConfig::new("parse", "parser"),
                StepConfig::new("summarize", "writer"),
            ],
            transitions,
            agents,
            parallel_execution_enabled: false,
            global_context: Map::new(),
            error_handler: None,
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn test_definition_json_roundtrip() {
        let def = sample_definition();
        let json = serde_json::to_string(&def).unwrap();
        let parsed: WorkflowDefinition = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.workflow_id, "intake");
        assert_eq!(parsed.steps.len(), 2);
        assert_eq!(parsed.transitions_from("parse")[0].to_step, "summarize");
        assert!(parsed.transitions_from("summarize").is_empty());
    }

    #[test]
    fn test_agent_config_tagged_serde() {
        let agent: AgentConfig = serde_json::from_value(json!({
            "type": "llm",
            "model": "claude-haiku",
            "max_tokens": 512
        }))
        .unwrap();
        assert_eq!(agent.executor_key(), "llm");
        assert!(matches!(
            agent,
            AgentConfig::Llm {
                max_tokens: Some(512),
                ..
            }
        ));

        let custom: AgentConfig = serde_json::from_value(json!({
            "type": "custom",
            "handler": "geo_lookup",
            "options": { "region": "eu" }
        }))
        .unwrap();
        assert_eq!(custom.executor_key(), "geo_lookup");
    }

    #[test]
    fn test_unknown_agent_type_rejected() {
        let result: Result<AgentConfig, _> =
            serde_json::from_value(json!({ "type": "telepathy" }));
        assert!(result.is_err());
    }

    #[test]
    fn test_agent_config_validation() {
        assert!(AgentConfig::PromptRenderer {
            template: "  ".to_string()
        }
        .validate()
        .is_err());
        assert!(AgentConfig::Llm {
            model: "m".to_string(),
            temperature: Some(3.5),
            max_tokens: None
        }
        .validate()
        .unwrap_err()
        .contains("out of range"));
        assert!(AgentConfig::IntentRecognizer { intents: vec![] }
            .validate()
            .is_ok());
    }

    #[test]
    fn test_transition_condition_defaults_to_none() {
        let t: Transition = serde_json::from_value(json!({ "to_step": "b" })).unwrap();
        assert_eq!(t.to_step, "b");
        assert!(t.condition.is_none());
    }

    #[test]
    fn test_step_mappings_default_empty() {
        let step: StepConfig =
            serde_json::from_value(json!({ "step_id": "a", "agent_id": "x" })).unwrap();
        assert!(step.input_mapping.is_empty());
        assert!(step.output_mapping.is_empty());
        assert!(step.timeout_secs.is_none());
    }
}
