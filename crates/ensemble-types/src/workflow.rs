//! Workflow and step definition types for Ensemble.
//!
//! `WorkflowDefinition` is the canonical representation of a workflow: an
//! ordered list of step definitions forming a dependency DAG, plus the
//! execution-wide failure policy and timeout. Definitions are owned by an
//! external repository and are immutable for the lifetime of an execution.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Workflow Definition
// ---------------------------------------------------------------------------

/// The canonical workflow definition.
///
/// Loaded through the storage collaborator at execution start; the engine
/// never mutates it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// UUIDv7 assigned on first save.
    pub id: Uuid,
    /// Human-readable workflow name.
    pub name: String,
    /// Optional longer description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// What happens to the execution when a step exhausts its retries.
    #[serde(default)]
    pub on_step_failure: FailurePolicy,
    /// Execution-wide timeout in seconds (overrides the engine default).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Default variables seeded into the execution context; callers may
    /// overlay these with per-execution input variables.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub variables: HashMap<String, Value>,
    /// Step definitions forming the workflow DAG.
    pub steps: Vec<StepDefinition>,
}

/// What the engine does with the execution after a step fails terminally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Finish the current level, then fail the execution.
    Abort,
    /// Record the failure and keep scheduling later levels.
    Continue,
}

impl Default for FailurePolicy {
    fn default() -> Self {
        Self::Abort
    }
}

// ---------------------------------------------------------------------------
// Step Definition
// ---------------------------------------------------------------------------

/// A single step in the workflow DAG.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefinition {
    /// User-defined step ID (e.g. "gather-data"). Unique within a workflow.
    pub id: String,
    /// Human-readable step name.
    pub name: String,
    /// The kind of step.
    #[serde(rename = "type")]
    pub step_type: StepType,
    /// Declared ordering hint; ties within a level break on `(order, id)`.
    #[serde(default)]
    pub order: u32,
    /// Step IDs this step depends on (DAG edges).
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Step-specific configuration payload.
    pub config: StepConfig,
    /// Step-level timeout in seconds (default 300).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Number of retries after the first failed attempt (default 0).
    #[serde(default)]
    pub max_retries: u32,
    /// Capabilities an agent instance must advertise to run this step.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_capabilities: Vec<String>,
    /// Pin the step to a specific agent instance, bypassing selection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_instance_id: Option<Uuid>,
    /// How an instance is selected when the step is not pinned.
    #[serde(default)]
    pub assignment_strategy: AssignmentStrategy,
}

/// The kind of step in a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Task,
    Agent,
    Condition,
    Parallel,
}

/// Step-specific configuration payload.
///
/// Internally tagged by `type` to match YAML structure:
/// ```yaml
/// config:
///   type: agent
///   task: "Summarize the gathered articles"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepConfig {
    /// Delegate an opaque action to the external action executor.
    Task {
        action: String,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        params: HashMap<String, Value>,
    },
    /// Run a task against a reserved agent instance.
    Agent {
        task: String,
        /// Input map; string values may be `steps.<id>.<field>` references.
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        input: HashMap<String, Value>,
    },
    /// Evaluate a boolean condition and skip the unreached branch steps.
    Condition {
        condition: String,
        #[serde(default)]
        then_steps: Vec<String>,
        #[serde(default)]
        else_steps: Vec<String>,
    },
    /// Fan out inline child steps concurrently and await all of them.
    Parallel { steps: Vec<StepDefinition> },
}

/// How an agent instance is selected for an unpinned AGENT step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStrategy {
    /// Rotate through eligible instances in id order.
    RoundRobin,
    /// Pick the instance with the fewest active assignments.
    LeastLoaded,
    /// Pick the first eligible instance in id order.
    FirstAvailable,
}

impl Default for AssignmentStrategy {
    fn default() -> Self {
        Self::RoundRobin
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
