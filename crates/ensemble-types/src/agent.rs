//! Agent instance types for Ensemble.
//!
//! An `AgentInstance` is a worker the controller can bind steps to. Instances
//! advertise capabilities and may be scoped to a workspace/project; an
//! instance with no scope is eligible everywhere.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A concrete agent worker known to the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInstance {
    pub id: Uuid,
    pub name: String,
    /// Capabilities this instance advertises (e.g. "research", "code").
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Workspace this instance is scoped to (None = any workspace).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_id: Option<Uuid>,
    /// Project this instance is scoped to (None = any project).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<Uuid>,
    pub status: AgentInstanceStatus,
}

/// Liveness/availability status of an agent instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentInstanceStatus {
    Idle,
    Busy,
    Offline,
    Errored,
}

impl AgentInstance {
    /// Whether this instance advertises every required capability.
    pub fn has_capabilities(&self, required: &[String]) -> bool {
        required.iter().all(|c| self.capabilities.contains(c))
    }

    /// Whether this instance may serve the given workspace/project.
    pub fn in_scope(&self, workspace_id: Uuid, project_id: Uuid) -> bool {
        self.workspace_id.is_none_or(|w| w == workspace_id)
            && self.project_id.is_none_or(|p| p == project_id)
    }

    /// Whether the instance can accept work at all.
    pub fn is_available(&self) -> bool {
        matches!(
            self.status,
            AgentInstanceStatus::Idle | AgentInstanceStatus::Busy
        )
    }
}
