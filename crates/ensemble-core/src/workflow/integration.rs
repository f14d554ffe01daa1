//! Integration layer: background submission and merged statistics.
//!
//! `WorkflowEngineIntegration` decouples callers from in-process execution by
//! submitting `execute_workflow` to a `TaskRunner` collaborator, forwards
//! cancellation, and merges engine, controller, and task-runner statistics
//! into one report.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use ensemble_types::assignment::AssignmentStats;
use serde_json::Value;
use uuid::Uuid;

use crate::agent::registry::AgentRegistry;
use crate::repository::workflow::WorkflowRepository;

use super::engine::{EngineStats, WorkflowEngine};

// ---------------------------------------------------------------------------
// TaskRunner collaborator
// ---------------------------------------------------------------------------

/// Point-in-time task-runner counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct TaskRunnerStats {
    pub submitted: u64,
    pub completed: u64,
}

impl TaskRunnerStats {
    /// Units of work submitted but not yet finished.
    pub fn running(&self) -> u64 {
        self.submitted.saturating_sub(self.completed)
    }
}

/// A background task runner accepting opaque units of work.
///
/// Object-safe by construction: the unit of work arrives pre-boxed, so no
/// Box*Dyn wrapper is needed.
pub trait TaskRunner: Send + Sync {
    /// Submit a unit of work; returns a task ID immediately.
    fn submit(&self, work: Pin<Box<dyn Future<Output = ()> + Send + 'static>>) -> Uuid;

    /// Point-in-time counters.
    fn get_stats(&self) -> TaskRunnerStats;
}

/// Default in-process runner backed by `tokio::spawn`.
pub struct TokioTaskRunner {
    submitted: AtomicU64,
    completed: Arc<AtomicU64>,
}

impl TokioTaskRunner {
    pub fn new() -> Self {
        Self {
            submitted: AtomicU64::new(0),
            completed: Arc::new(AtomicU64::new(0)),
        }
    }
}

impl Default for TokioTaskRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskRunner for TokioTaskRunner {
    fn submit(&self, work: Pin<Box<dyn Future<Output = ()> + Send + 'static>>) -> Uuid {
        let task_id = Uuid::now_v7();
        self.submitted.fetch_add(1, Ordering::Relaxed);
        let completed = Arc::clone(&self.completed);
        tokio::spawn(async move {
            work.await;
            completed.fetch_add(1, Ordering::Relaxed);
        });
        tracing::debug!(task_id = %task_id, "submitted background task");
        task_id
    }

    fn get_stats(&self) -> TaskRunnerStats {
        TaskRunnerStats {
            submitted: self.submitted.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
        }
    }
}

// ---------------------------------------------------------------------------
// Merged statistics
// ---------------------------------------------------------------------------

/// One merged report across engine, controller, and task runner.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct IntegrationStats {
    pub engine: EngineStats,
    pub assignments: AssignmentStats,
    pub task_runner: TaskRunnerStats,
}

// ---------------------------------------------------------------------------
// WorkflowEngineIntegration
// ---------------------------------------------------------------------------

/// Submits workflow executions to a background task runner.
pub struct WorkflowEngineIntegration<R: WorkflowRepository, G: AgentRegistry> {
    engine: Arc<WorkflowEngine<R, G>>,
    runner: Arc<dyn TaskRunner>,
}

impl<R, G> WorkflowEngineIntegration<R, G>
where
    R: WorkflowRepository + 'static,
    G: AgentRegistry + 'static,
{
    pub fn new(engine: Arc<WorkflowEngine<R, G>>, runner: Arc<dyn TaskRunner>) -> Self {
        Self { engine, runner }
    }

    /// Access the wrapped engine.
    pub fn engine(&self) -> &Arc<WorkflowEngine<R, G>> {
        &self.engine
    }

    /// Submit a workflow execution to the background task runner.
    ///
    /// Returns the runner's task ID immediately. The execution's own ID and
    /// outcome are observable via storage, events, and stats -- submission
    /// failures are logged, never raised back to the caller.
    pub fn execute_workflow(
        &self,
        workflow_id: Uuid,
        workspace_id: Uuid,
        project_id: Uuid,
        input_variables: HashMap<String, Value>,
    ) -> Uuid {
        let engine = Arc::clone(&self.engine);
        self.runner.submit(Box::pin(async move {
            match engine
                .execute_workflow(workflow_id, workspace_id, project_id, input_variables)
                .await
            {
                Ok(execution_id) => {
                    tracing::info!(
                        workflow_id = %workflow_id,
                        execution_id = %execution_id,
                        "workflow execution started from background task"
                    );
                }
                Err(e) => {
                    tracing::error!(
                        workflow_id = %workflow_id,
                        error = %e,
                        "workflow execution could not start"
                    );
                }
            }
        }))
    }

    /// Forwarded to the engine; same true/false contract.
    pub async fn cancel_workflow_execution(&self, execution_id: Uuid) -> bool {
        self.engine.cancel_workflow_execution(execution_id).await
    }

    /// Merge engine, controller, and task-runner statistics.
    pub fn get_integration_stats(&self) -> IntegrationStats {
        IntegrationStats {
            engine: self.engine.stats(),
            assignments: self.engine.assignment_stats(),
            task_runner: self.runner.get_stats(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
