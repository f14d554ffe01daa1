//! Workflow repository trait definition.
//!
//! Defines the storage interface for workflow definitions, executions, and
//! step execution records. An infrastructure layer implements this trait;
//! the engine only ever talks to the trait.

use ensemble_types::error::RepositoryError;
use ensemble_types::execution::{
    ExecutionStatus, StepExecutionRecord, StepStatus, WorkflowExecution,
};
use ensemble_types::workflow::WorkflowDefinition;
use uuid::Uuid;

/// Repository trait for workflow persistence.
///
/// Covers three entity families:
/// - **Definitions:** read access to workflow definitions (owned elsewhere).
/// - **Executions:** create/update/query workflow execution records.
/// - **Steps:** create/update/query per-attempt step execution records.
///
/// Uses native async fn in traits (RPITIT), no async_trait macro.
pub trait WorkflowRepository: Send + Sync {
    // -----------------------------------------------------------------------
    // Definitions
    // -----------------------------------------------------------------------

    /// Get a workflow definition by its UUID.
    fn get_definition(
        &self,
        id: &Uuid,
    ) -> impl Future<Output = Result<Option<WorkflowDefinition>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Executions
    // -----------------------------------------------------------------------

    /// Create a new workflow execution record.
    fn create_execution(
        &self,
        execution: &WorkflowExecution,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    /// Update an execution's status (and optionally error message / context).
    fn update_execution_status(
        &self,
        execution_id: &Uuid,
        status: ExecutionStatus,
        error: Option<&str>,
        context: Option<&serde_json::Value>,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    /// Get a workflow execution by its UUID.
    fn get_execution(
        &self,
        execution_id: &Uuid,
    ) -> impl Future<Output = Result<Option<WorkflowExecution>, RepositoryError>> + Send;

    /// List executions for a given workflow, ordered by started_at DESC.
    fn list_executions(
        &self,
        workflow_id: &Uuid,
        limit: u32,
    ) -> impl Future<Output = Result<Vec<WorkflowExecution>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Steps
    // -----------------------------------------------------------------------

    /// Create a new step execution record (one per attempt).
    fn create_step_record(
        &self,
        record: &StepExecutionRecord,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    /// Update a step record's status and optionally its output/error.
    fn update_step_record(
        &self,
        record_id: &Uuid,
        status: StepStatus,
        output: Option<&serde_json::Value>,
        error: Option<&str>,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    /// List all step records for a given execution, ordered by started_at ASC.
    fn list_step_records(
        &self,
        execution_id: &Uuid,
    ) -> impl Future<Output = Result<Vec<StepExecutionRecord>, RepositoryError>> + Send;
}
