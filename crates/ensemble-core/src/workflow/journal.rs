//! Best-effort persistence of execution status transitions.
//!
//! Wraps `WorkflowRepository` with a higher-level API for recording every
//! execution and step transition (pending -> running -> completed/failed/
//! skipped), enabling timeline reconstruction. Journal writes are
//! infrastructure: a failed write is logged and never fails the workflow.

use chrono::Utc;
use ensemble_types::execution::{
    ExecutionStatus, StepExecutionRecord, StepStatus, WorkflowExecution,
};
use serde_json::Value;
use uuid::Uuid;

use crate::repository::workflow::WorkflowRepository;

/// Records execution timeline entries through the storage collaborator.
///
/// Generic over `R: WorkflowRepository` so it works with any storage backend
/// (SQLite, in-memory mock, etc.).
pub struct ExecutionJournal<R: WorkflowRepository> {
    repo: R,
}

impl<R: WorkflowRepository> ExecutionJournal<R> {
    /// Create a new journal backed by the given repository.
    pub fn new(repo: R) -> Self {
        Self { repo }
    }

    /// Access the underlying repository.
    pub fn repo(&self) -> &R {
        &self.repo
    }

    // -----------------------------------------------------------------------
    // Execution-level transitions
    // -----------------------------------------------------------------------

    /// Record the creation of an execution.
    pub async fn record_execution_created(&self, execution: &WorkflowExecution) {
        if let Err(e) = self.repo.create_execution(execution).await {
            tracing::warn!(
                execution_id = %execution.id,
                error = %e,
                "failed to persist execution record"
            );
        }
    }

    /// Record an execution status transition, optionally with error/context.
    pub async fn record_execution_status(
        &self,
        execution_id: Uuid,
        status: ExecutionStatus,
        error: Option<&str>,
        context: Option<&Value>,
    ) {
        if let Err(e) = self
            .repo
            .update_execution_status(&execution_id, status, error, context)
            .await
        {
            tracing::warn!(
                execution_id = %execution_id,
                status = ?status,
                error = %e,
                "failed to persist execution status"
            );
        } else {
            tracing::debug!(execution_id = %execution_id, status = ?status, "recorded execution status");
        }
    }

    // -----------------------------------------------------------------------
    // Step-level transitions
    // -----------------------------------------------------------------------

    /// Record a step attempt starting (Pending -> Running).
    ///
    /// Returns the new step execution record ID. The ID is minted even when
    /// the write fails so the in-memory pipeline keeps a consistent key.
    pub async fn record_step_start(
        &self,
        execution_id: Uuid,
        step_id: &str,
        step_name: &str,
        attempt: u32,
    ) -> Uuid {
        let record_id = Uuid::now_v7();
        let record = StepExecutionRecord {
            id: record_id,
            execution_id,
            step_id: step_id.to_string(),
            step_name: step_name.to_string(),
            status: StepStatus::Running,
            attempt,
            output: None,
            error: None,
            started_at: Some(Utc::now()),
            completed_at: None,
        };

        if let Err(e) = self.repo.create_step_record(&record).await {
            tracing::warn!(
                execution_id = %execution_id,
                step_id,
                error = %e,
                "failed to persist step start"
            );
        }

        record_id
    }

    /// Record a step attempt completing successfully.
    pub async fn record_step_completed(&self, record_id: Uuid, output: Option<&Value>) {
        if let Err(e) = self
            .repo
            .update_step_record(&record_id, StepStatus::Completed, output, None)
            .await
        {
            tracing::warn!(record_id = %record_id, error = %e, "failed to persist step completion");
        }
    }

    /// Record a step attempt failing.
    pub async fn record_step_failed(&self, record_id: Uuid, error: &str) {
        if let Err(e) = self
            .repo
            .update_step_record(&record_id, StepStatus::Failed, None, Some(error))
            .await
        {
            tracing::warn!(record_id = %record_id, error = %e, "failed to persist step failure");
        }
    }

    /// Record a step as skipped (unreached condition branch).
    pub async fn record_step_skipped(&self, execution_id: Uuid, step_id: &str, step_name: &str) {
        let record = StepExecutionRecord {
            id: Uuid::now_v7(),
            execution_id,
            step_id: step_id.to_string(),
            step_name: step_name.to_string(),
            status: StepStatus::Skipped,
            attempt: 0,
            output: None,
            error: None,
            started_at: Some(Utc::now()),
            completed_at: Some(Utc::now()),
        };

        if let Err(e) = self.repo.create_step_record(&record).await {
            tracing::warn!(
                execution_id = %execution_id,
                step_id,
                error = %e,
                "failed to persist step skip"
            );
        }
    }
}
