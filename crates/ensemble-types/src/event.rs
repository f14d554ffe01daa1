//! Event types for the Ensemble workflow event bus.
//!
//! `WorkflowEvent` is the unified event type broadcast during workflow
//! execution. All variants are Clone + Send + Sync for use with tokio
//! broadcast channels. Delivery is at-least-once, fire-and-forget.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Events emitted during workflow execution.
///
/// Used by the event bus to communicate workflow and step lifecycle
/// transitions to subscribers (API layer, logging, dashboards).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    /// An execution has started running.
    WorkflowStarted {
        workflow_id: Uuid,
        execution_id: Uuid,
        workflow_name: String,
    },

    /// An execution finished with every step settled and none failed.
    WorkflowCompleted {
        workflow_id: Uuid,
        execution_id: Uuid,
        duration_ms: u64,
        steps_completed: u32,
    },

    /// An execution failed.
    WorkflowFailed {
        workflow_id: Uuid,
        execution_id: Uuid,
        error: String,
    },

    /// An execution was cancelled cooperatively.
    WorkflowCancelled {
        workflow_id: Uuid,
        execution_id: Uuid,
    },

    /// A step attempt has started.
    StepStarted {
        execution_id: Uuid,
        step_id: String,
        step_name: String,
        step_type: String,
        attempt: u32,
    },

    /// A step completed successfully.
    StepCompleted {
        execution_id: Uuid,
        step_id: String,
        step_name: String,
        duration_ms: u64,
    },

    /// A step attempt failed.
    StepFailed {
        execution_id: Uuid,
        step_id: String,
        step_name: String,
        error: String,
        will_retry: bool,
    },

    /// A step was skipped (unreached condition branch).
    StepSkipped {
        execution_id: Uuid,
        step_id: String,
        reason: String,
    },
}

impl WorkflowEvent {
    /// Stable event-type tag, matching the serialized `event_type` field.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::WorkflowStarted { .. } => "workflow_started",
            Self::WorkflowCompleted { .. } => "workflow_completed",
            Self::WorkflowFailed { .. } => "workflow_failed",
            Self::WorkflowCancelled { .. } => "workflow_cancelled",
            Self::StepStarted { .. } => "step_started",
            Self::StepCompleted { .. } => "step_completed",
            Self::StepFailed { .. } => "step_failed",
            Self::StepSkipped { .. } => "step_skipped",
        }
    }

    /// The execution this event belongs to.
    pub fn execution_id(&self) -> Uuid {
        match self {
            Self::WorkflowStarted { execution_id, .. }
            | Self::WorkflowCompleted { execution_id, .. }
            | Self::WorkflowFailed { execution_id, .. }
            | Self::WorkflowCancelled { execution_id, .. }
            | Self::StepStarted { execution_id, .. }
            | Self::StepCompleted { execution_id, .. }
            | Self::StepFailed { execution_id, .. }
            | Self::StepSkipped { execution_id, .. } => *execution_id,
        }
    }
}
