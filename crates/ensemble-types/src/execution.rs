//! Execution tracking types: workflow executions and per-step records.
//!
//! One `WorkflowExecution` row per run, one `StepExecutionRecord` row per
//! step attempt. Together they reconstruct the execution timeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Overall status of a workflow execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    /// Whether the execution can no longer change state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Status of an individual step within an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    /// Whether the step has reached a terminal per-step state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

/// A single execution instance of a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecution {
    /// UUIDv7 execution ID.
    pub id: Uuid,
    /// ID of the workflow definition being executed.
    pub workflow_id: Uuid,
    /// Workspace the execution runs in.
    pub workspace_id: Uuid,
    /// Project the execution runs in.
    pub project_id: Uuid,
    /// Current execution status.
    pub status: ExecutionStatus,
    /// JSON snapshot of the workflow context (variables, outputs, statuses).
    pub context: serde_json::Value,
    /// When the execution started.
    pub started_at: DateTime<Utc>,
    /// When the execution reached a terminal state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Error message if the execution failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Record of a single step attempt within an execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepExecutionRecord {
    /// UUIDv7 step execution ID (one per attempt).
    pub id: Uuid,
    /// Parent execution ID.
    pub execution_id: Uuid,
    /// Step ID matching `StepDefinition.id`.
    pub step_id: String,
    /// Step name (denormalized for display).
    pub step_name: String,
    /// Current step status.
    pub status: StepStatus,
    /// Attempt number (1-based, increments on retry).
    pub attempt: u32,
    /// JSON output produced by this step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    /// Error message if the attempt failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When the attempt started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the attempt completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}
