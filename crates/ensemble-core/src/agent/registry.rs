//! Agent registry trait definition.
//!
//! The registry is the controller's view of the fleet: which instances
//! exist, what they can do, and whether they are available. An
//! infrastructure layer implements this trait.

use ensemble_types::agent::{AgentInstance, AgentInstanceStatus};
use ensemble_types::error::RegistryError;
use uuid::Uuid;

/// Lookup and status updates for agent instances.
///
/// Uses native async fn in traits (RPITIT), no async_trait macro.
pub trait AgentRegistry: Send + Sync {
    /// List instances that advertise every required capability and are in
    /// scope for the given workspace/project. Availability filtering
    /// (reservations, exclusions) is the controller's job.
    fn list_eligible_instances(
        &self,
        capabilities: &[String],
        workspace_id: Uuid,
        project_id: Uuid,
    ) -> impl Future<Output = Result<Vec<AgentInstance>, RegistryError>> + Send;

    /// Get a single instance by ID.
    fn get_instance(
        &self,
        id: &Uuid,
    ) -> impl Future<Output = Result<Option<AgentInstance>, RegistryError>> + Send;

    /// Update an instance's availability status.
    fn update_instance_status(
        &self,
        id: &Uuid,
        status: AgentInstanceStatus,
    ) -> impl Future<Output = Result<(), RegistryError>> + Send;
}
