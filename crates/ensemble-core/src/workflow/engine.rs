//! Workflow engine: level-wise parallel DAG execution.
//!
//! The engine drives one execution at a time through its levels. Steps within
//! a level run concurrently via `tokio::task::JoinSet`; the engine suspends
//! until every step in the level reaches a terminal per-step state before
//! computing the next level, so a later level never observes a predecessor's
//! missing output.
//!
//! # Execution flow
//!
//! 1. Load the definition through the storage collaborator and validate it
//!    (a cycle fails the execution before any step runs).
//! 2. Create the execution record and `WorkflowContext`, register the
//!    cancellation token, and spawn the level loop.
//! 3. Per level: dispatch every runnable step concurrently, join all,
//!    apply outputs/statuses on the coordinating task, persist the context.
//! 4. On settlement, record the terminal status and publish the lifecycle
//!    event.
//!
//! Cancellation is cooperative: the token is checked at level and step
//! dispatch boundaries. In-flight work may complete and its output is
//! accepted, but no further level is scheduled.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use ensemble_types::assignment::AssignmentStats;
use ensemble_types::event::WorkflowEvent;
use ensemble_types::execution::{ExecutionStatus, StepStatus, WorkflowExecution};
use ensemble_types::workflow::{
    FailurePolicy, StepConfig, StepDefinition, WorkflowDefinition,
};
use serde_json::{Value, json};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::agent::controller::MultiAgentController;
use crate::agent::registry::AgentRegistry;
use crate::event::EventBus;
use crate::repository::workflow::WorkflowRepository;

use super::action::BoxActionExecutor;
use super::context::WorkflowContext;
use super::definition::{WorkflowError, validate_definition};
use super::expression::ConditionEvaluator;
use super::journal::ExecutionJournal;
use super::resolver::resolve_execution_order;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Default execution-wide timeout (30 minutes).
pub const DEFAULT_EXECUTION_TIMEOUT_SECS: u64 = 1800;

/// Default step-level timeout (5 minutes).
pub const DEFAULT_STEP_TIMEOUT_SECS: u64 = 300;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during workflow execution.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Definition-level error (parse, validation, DAG).
    #[error("workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    /// The workflow definition does not exist.
    #[error("workflow definition not found: {0}")]
    WorkflowNotFound(Uuid),

    /// Definition loading failed at the storage layer.
    #[error("repository error: {0}")]
    Repository(String),

    /// A step failed terminally.
    #[error("step '{step_id}' failed: {error}")]
    StepFailed { step_id: String, error: String },

    /// The execution exceeded its overall timeout.
    #[error("execution timed out")]
    ExecutionTimeout,
}

// ---------------------------------------------------------------------------
// Step outcome (internal)
// ---------------------------------------------------------------------------

/// Terminal per-step result returned by a dispatched step task.
#[derive(Debug)]
enum StepOutcome {
    /// The step produced an output; `skipped` lists branch steps an
    /// unreached CONDITION branch marks as skipped (usually empty).
    Completed {
        output: HashMap<String, Value>,
        skipped: Vec<String>,
    },
    /// The step failed terminally after retries/failover.
    Failed { error: String },
}

/// How the level loop ended.
enum ExecutionOutcome {
    Completed,
    Cancelled,
}

/// Point-in-time engine counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct EngineStats {
    pub active_executions: usize,
}

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

/// Drives workflow executions: level resolution, concurrent dispatch,
/// timeout/retry, persistence, events, and cooperative cancellation.
///
/// Generic over the storage backend `R` and agent registry `G`.
pub struct WorkflowEngine<R: WorkflowRepository, G: AgentRegistry> {
    journal: ExecutionJournal<R>,
    event_bus: EventBus,
    controller: Arc<MultiAgentController<G>>,
    action_executor: BoxActionExecutor,
    /// Cancellation tokens for in-flight executions, keyed by execution ID.
    active_executions: DashMap<Uuid, CancellationToken>,
}

impl<R, G> WorkflowEngine<R, G>
where
    R: WorkflowRepository + 'static,
    G: AgentRegistry + 'static,
{
    /// Create a new engine.
    pub fn new(
        repo: R,
        event_bus: EventBus,
        controller: Arc<MultiAgentController<G>>,
        action_executor: BoxActionExecutor,
    ) -> Self {
        Self {
            journal: ExecutionJournal::new(repo),
            event_bus,
            controller,
            action_executor,
            active_executions: DashMap::new(),
        }
    }

    /// Access the underlying journal (and through it, the repository).
    pub fn journal(&self) -> &ExecutionJournal<R> {
        &self.journal
    }

    // -----------------------------------------------------------------------
    // Public contract
    // -----------------------------------------------------------------------

    /// Start a workflow execution and return its ID immediately.
    ///
    /// Loads and validates the definition (cycles and unknown references fail
    /// here, before any step runs), creates the execution record and context,
    /// registers the execution as active, and spawns the level loop onto the
    /// runtime. The returned ID can be used to cancel or observe the
    /// execution; its outcome is reported via storage and events, never
    /// through this call.
    pub async fn execute_workflow(
        self: &Arc<Self>,
        workflow_id: Uuid,
        workspace_id: Uuid,
        project_id: Uuid,
        input_variables: HashMap<String, Value>,
    ) -> Result<Uuid, EngineError> {
        let definition = self
            .journal
            .repo()
            .get_definition(&workflow_id)
            .await
            .map_err(|e| EngineError::Repository(e.to_string()))?
            .ok_or(EngineError::WorkflowNotFound(workflow_id))?;

        validate_definition(&definition)?;
        resolve_execution_order(&definition.steps)?;

        let execution_id = Uuid::now_v7();
        let mut variables = definition.variables.clone();
        variables.extend(input_variables);
        let ctx = WorkflowContext::new(execution_id, workspace_id, project_id, variables);

        let execution = WorkflowExecution {
            id: execution_id,
            workflow_id,
            workspace_id,
            project_id,
            status: ExecutionStatus::Pending,
            context: ctx.to_json(),
            started_at: Utc::now(),
            completed_at: None,
            error: None,
        };
        self.journal.record_execution_created(&execution).await;

        let cancel_token = CancellationToken::new();
        self.active_executions
            .insert(execution_id, cancel_token.clone());

        tracing::info!(
            execution_id = %execution_id,
            workflow = definition.name.as_str(),
            "starting workflow execution"
        );

        let engine = Arc::clone(self);
        tokio::spawn(async move {
            engine.run_execution(definition, ctx, cancel_token).await;
        });

        Ok(execution_id)
    }

    /// Cancel an active execution.
    ///
    /// Returns `true` and de-registers the execution if it was active; the
    /// cancellation is honored at the next level/step dispatch boundary.
    /// Returns `false` for unknown or already-terminal IDs.
    pub async fn cancel_workflow_execution(&self, execution_id: Uuid) -> bool {
        let Some((_, token)) = self.active_executions.remove(&execution_id) else {
            return false;
        };
        token.cancel();
        self.journal
            .record_execution_status(
                execution_id,
                ExecutionStatus::Cancelled,
                Some("cancelled by caller"),
                None,
            )
            .await;
        tracing::info!(execution_id = %execution_id, "workflow execution cancelled");
        true
    }

    /// Point-in-time engine counters.
    pub fn stats(&self) -> EngineStats {
        EngineStats {
            active_executions: self.active_executions.len(),
        }
    }

    /// Controller counters, exposed for merged statistics reports.
    pub fn assignment_stats(&self) -> AssignmentStats {
        self.controller.get_assignment_stats()
    }

    /// Whether an execution is still registered as active.
    pub fn is_active(&self, execution_id: &Uuid) -> bool {
        self.active_executions.contains_key(execution_id)
    }

    // -----------------------------------------------------------------------
    // Level loop
    // -----------------------------------------------------------------------

    /// Run the level loop to settlement and record the terminal state.
    async fn run_execution(
        self: Arc<Self>,
        definition: WorkflowDefinition,
        mut ctx: WorkflowContext,
        cancel_token: CancellationToken,
    ) {
        let execution_id = ctx.execution_id;
        let run_start = std::time::Instant::now();

        self.journal
            .record_execution_status(execution_id, ExecutionStatus::Running, None, None)
            .await;
        self.event_bus.publish(WorkflowEvent::WorkflowStarted {
            workflow_id: definition.id,
            execution_id,
            workflow_name: definition.name.clone(),
        });

        let execution_timeout = Duration::from_secs(
            definition
                .timeout_secs
                .unwrap_or(DEFAULT_EXECUTION_TIMEOUT_SECS),
        );

        let outcome = match tokio::time::timeout(
            execution_timeout,
            self.run_levels(&definition, &mut ctx, &cancel_token),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(EngineError::ExecutionTimeout),
        };

        self.active_executions.remove(&execution_id);

        match outcome {
            Ok(ExecutionOutcome::Completed) => {
                self.journal
                    .record_execution_status(
                        execution_id,
                        ExecutionStatus::Completed,
                        None,
                        Some(&ctx.to_json()),
                    )
                    .await;
                let steps_completed = ctx
                    .step_statuses
                    .values()
                    .filter(|s| **s == StepStatus::Completed)
                    .count() as u32;
                self.event_bus.publish(WorkflowEvent::WorkflowCompleted {
                    workflow_id: definition.id,
                    execution_id,
                    duration_ms: run_start.elapsed().as_millis() as u64,
                    steps_completed,
                });
                tracing::info!(execution_id = %execution_id, "workflow execution completed");
            }
            Ok(ExecutionOutcome::Cancelled) => {
                self.journal
                    .record_execution_status(
                        execution_id,
                        ExecutionStatus::Cancelled,
                        Some("cancelled by caller"),
                        Some(&ctx.to_json()),
                    )
                    .await;
                self.event_bus.publish(WorkflowEvent::WorkflowCancelled {
                    workflow_id: definition.id,
                    execution_id,
                });
                tracing::info!(execution_id = %execution_id, "workflow execution stopped after cancellation");
            }
            Err(e) => {
                let err_msg = e.to_string();
                self.journal
                    .record_execution_status(
                        execution_id,
                        ExecutionStatus::Failed,
                        Some(&err_msg),
                        Some(&ctx.to_json()),
                    )
                    .await;
                self.event_bus.publish(WorkflowEvent::WorkflowFailed {
                    workflow_id: definition.id,
                    execution_id,
                    error: err_msg.clone(),
                });
                tracing::warn!(
                    execution_id = %execution_id,
                    error = err_msg.as_str(),
                    "workflow execution failed"
                );
            }
        }
    }

    /// Execute levels in order; each level is a fan-out/fan-in barrier.
    async fn run_levels(
        self: &Arc<Self>,
        definition: &WorkflowDefinition,
        ctx: &mut WorkflowContext,
        cancel_token: &CancellationToken,
    ) -> Result<ExecutionOutcome, EngineError> {
        let execution_id = ctx.execution_id;

        // Clone levels into owned vectors so spawned tasks don't borrow from
        // `definition`.
        let levels: Vec<Vec<StepDefinition>> = resolve_execution_order(&definition.steps)?
            .into_iter()
            .map(|level| level.into_iter().cloned().collect())
            .collect();

        let mut failed_steps: Vec<(String, String)> = Vec::new();

        for (level_idx, level) in levels.iter().enumerate() {
            if cancel_token.is_cancelled() {
                return Ok(ExecutionOutcome::Cancelled);
            }

            tracing::debug!(
                execution_id = %execution_id,
                level = level_idx,
                steps = level.len(),
                "processing level"
            );

            let mut join_set: JoinSet<(String, StepOutcome)> = JoinSet::new();

            for step in level {
                // Unreached condition branches were marked when the
                // condition settled; they never run.
                if ctx.step_status(&step.id) == StepStatus::Skipped {
                    self.journal
                        .record_step_skipped(execution_id, &step.id, &step.name)
                        .await;
                    self.event_bus.publish(WorkflowEvent::StepSkipped {
                        execution_id,
                        step_id: step.id.clone(),
                        reason: "unreached condition branch".to_string(),
                    });
                    continue;
                }

                // Dispatch boundary: once cancelled, launch nothing new.
                if cancel_token.is_cancelled() {
                    continue;
                }

                ctx.set_step_status(&step.id, StepStatus::Running);

                let engine = Arc::clone(self);
                let step = step.clone();
                let step_ctx = ctx.clone();
                join_set.spawn(async move {
                    let outcome = engine.dispatch_step(&step, &step_ctx).await;
                    (step.id, outcome)
                });
            }

            // Fan-in: let the whole level settle before evaluating failures,
            // so sibling outcomes are deterministic.
            while let Some(joined) = join_set.join_next().await {
                match joined {
                    Ok((step_id, StepOutcome::Completed { output, skipped })) => {
                        if let Err(e) = ctx.set_step_output(&step_id, output) {
                            tracing::warn!(
                                step_id = step_id.as_str(),
                                error = %e,
                                "dropped duplicate step output"
                            );
                        }
                        for skip_id in skipped {
                            ctx.set_step_status(&skip_id, StepStatus::Skipped);
                        }
                    }
                    Ok((step_id, StepOutcome::Failed { error })) => {
                        ctx.set_step_status(&step_id, StepStatus::Failed);
                        failed_steps.push((step_id, error));
                    }
                    Err(join_err) => {
                        return Err(EngineError::Workflow(WorkflowError::ExecutionError(
                            format!("step task join error: {join_err}"),
                        )));
                    }
                }
            }

            // Persist the context snapshot after the level settles.
            self.journal
                .record_execution_status(
                    execution_id,
                    ExecutionStatus::Running,
                    None,
                    Some(&ctx.to_json()),
                )
                .await;

            if !failed_steps.is_empty() && definition.on_step_failure == FailurePolicy::Abort {
                let (step_id, error) = failed_steps.swap_remove(0);
                return Err(EngineError::StepFailed { step_id, error });
            }
        }

        if cancel_token.is_cancelled() {
            return Ok(ExecutionOutcome::Cancelled);
        }

        // Continue policy: the execution completes only if no step failed.
        if let Some((step_id, error)) = failed_steps.into_iter().next() {
            return Err(EngineError::StepFailed { step_id, error });
        }

        Ok(ExecutionOutcome::Completed)
    }

    // -----------------------------------------------------------------------
    // Step dispatch
    // -----------------------------------------------------------------------

    /// Dispatch one step by type and convert every error into a terminal
    /// per-step outcome. Nothing propagates back to the caller of
    /// `execute_workflow`.
    async fn dispatch_step(
        self: &Arc<Self>,
        step: &StepDefinition,
        ctx: &WorkflowContext,
    ) -> StepOutcome {
        match &step.config {
            StepConfig::Condition {
                condition,
                then_steps,
                else_steps,
            } => {
                self.run_condition_step(step, condition, then_steps, else_steps, ctx)
                    .await
            }
            StepConfig::Parallel { steps } => self.run_parallel_step(step, steps, ctx).await,
            StepConfig::Task { .. } | StepConfig::Agent { .. } => {
                self.run_leaf_step(step, ctx).await
            }
        }
    }

    /// Run a TASK or AGENT step (the leaf kinds a PARALLEL step fans out).
    async fn run_leaf_step(&self, step: &StepDefinition, ctx: &WorkflowContext) -> StepOutcome {
        match &step.config {
            StepConfig::Task { action, params } => {
                self.run_task_step(step, action, params, ctx).await
            }
            StepConfig::Agent { input, .. } => self.run_agent_step(step, input, ctx).await,
            other => StepOutcome::Failed {
                error: format!(
                    "step '{}' has config {:?} where a task or agent step was expected",
                    step.id, other
                ),
            },
        }
    }

    /// TASK: delegate to the action executor under timeout, retrying locally
    /// up to `max_retries` times. Each attempt gets its own record.
    async fn run_task_step(
        &self,
        step: &StepDefinition,
        action: &str,
        params: &HashMap<String, Value>,
        ctx: &WorkflowContext,
    ) -> StepOutcome {
        let execution_id = ctx.execution_id;
        let timeout_secs = step.timeout_secs.unwrap_or(DEFAULT_STEP_TIMEOUT_SECS);
        let attempts = step.max_retries + 1;
        let mut last_error = String::new();
        let resolved = ctx.resolve_input(params);

        for attempt in 1..=attempts {
            let record_id = self
                .journal
                .record_step_start(execution_id, &step.id, &step.name, attempt)
                .await;
            self.event_bus.publish(WorkflowEvent::StepStarted {
                execution_id,
                step_id: step.id.clone(),
                step_name: step.name.clone(),
                step_type: "task".to_string(),
                attempt,
            });
            let started = std::time::Instant::now();

            let result = tokio::time::timeout(
                Duration::from_secs(timeout_secs),
                self.action_executor.execute(action, &resolved, ctx),
            )
            .await;

            match result {
                Ok(Ok(output)) => {
                    self.journal
                        .record_step_completed(record_id, Some(&output_to_value(&output)))
                        .await;
                    self.event_bus.publish(WorkflowEvent::StepCompleted {
                        execution_id,
                        step_id: step.id.clone(),
                        step_name: step.name.clone(),
                        duration_ms: started.elapsed().as_millis() as u64,
                    });
                    return StepOutcome::Completed {
                        output,
                        skipped: vec![],
                    };
                }
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => last_error = format!("step timed out after {timeout_secs}s"),
            }

            let will_retry = attempt < attempts;
            self.journal.record_step_failed(record_id, &last_error).await;
            self.event_bus.publish(WorkflowEvent::StepFailed {
                execution_id,
                step_id: step.id.clone(),
                step_name: step.name.clone(),
                error: last_error.clone(),
                will_retry,
            });
            if will_retry {
                tracing::warn!(
                    step_id = step.id.as_str(),
                    attempt,
                    error = last_error.as_str(),
                    "task step failed, retrying"
                );
            }
        }

        StepOutcome::Failed { error: last_error }
    }

    /// AGENT: delegate to the controller, which owns per-instance retries
    /// and failover. One record covers the whole controller run.
    async fn run_agent_step(
        &self,
        step: &StepDefinition,
        input: &HashMap<String, Value>,
        ctx: &WorkflowContext,
    ) -> StepOutcome {
        let execution_id = ctx.execution_id;
        let timeout_secs = step.timeout_secs.unwrap_or(DEFAULT_STEP_TIMEOUT_SECS);
        let record_id = self
            .journal
            .record_step_start(execution_id, &step.id, &step.name, 1)
            .await;
        self.event_bus.publish(WorkflowEvent::StepStarted {
            execution_id,
            step_id: step.id.clone(),
            step_name: step.name.clone(),
            step_type: "agent".to_string(),
            attempt: 1,
        });
        let started = std::time::Instant::now();
        let resolved = ctx.resolve_input(input);

        match self
            .controller
            .execute_agent_step(record_id, step, ctx, &resolved, timeout_secs, step.max_retries)
            .await
        {
            Ok(output) => {
                self.journal
                    .record_step_completed(record_id, Some(&output_to_value(&output)))
                    .await;
                self.event_bus.publish(WorkflowEvent::StepCompleted {
                    execution_id,
                    step_id: step.id.clone(),
                    step_name: step.name.clone(),
                    duration_ms: started.elapsed().as_millis() as u64,
                });
                StepOutcome::Completed {
                    output,
                    skipped: vec![],
                }
            }
            Err(e) => {
                let error = e.to_string();
                self.journal.record_step_failed(record_id, &error).await;
                self.event_bus.publish(WorkflowEvent::StepFailed {
                    execution_id,
                    step_id: step.id.clone(),
                    step_name: step.name.clone(),
                    error: error.clone(),
                    will_retry: false,
                });
                StepOutcome::Failed { error }
            }
        }
    }

    /// CONDITION: evaluate the boolean over the context and mark the
    /// unreached branch steps as skipped.
    async fn run_condition_step(
        &self,
        step: &StepDefinition,
        condition: &str,
        then_steps: &[String],
        else_steps: &[String],
        ctx: &WorkflowContext,
    ) -> StepOutcome {
        let execution_id = ctx.execution_id;
        let record_id = self
            .journal
            .record_step_start(execution_id, &step.id, &step.name, 1)
            .await;
        self.event_bus.publish(WorkflowEvent::StepStarted {
            execution_id,
            step_id: step.id.clone(),
            step_name: step.name.clone(),
            step_type: "condition".to_string(),
            attempt: 1,
        });
        let started = std::time::Instant::now();

        let condition_met = match evaluate_condition(condition, ctx) {
            Ok(met) => met,
            Err(e) => {
                let error = format!("condition evaluation failed: {e}");
                self.journal.record_step_failed(record_id, &error).await;
                self.event_bus.publish(WorkflowEvent::StepFailed {
                    execution_id,
                    step_id: step.id.clone(),
                    step_name: step.name.clone(),
                    error: error.clone(),
                    will_retry: false,
                });
                return StepOutcome::Failed { error };
            }
        };

        let (selected, unreached) = if condition_met {
            (then_steps, else_steps)
        } else {
            (else_steps, then_steps)
        };

        let output = HashMap::from([
            ("condition_met".to_string(), json!(condition_met)),
            ("selected_steps".to_string(), json!(selected)),
        ]);
        self.journal
            .record_step_completed(record_id, Some(&output_to_value(&output)))
            .await;
        self.event_bus.publish(WorkflowEvent::StepCompleted {
            execution_id,
            step_id: step.id.clone(),
            step_name: step.name.clone(),
            duration_ms: started.elapsed().as_millis() as u64,
        });

        tracing::debug!(
            step_id = step.id.as_str(),
            condition,
            result = condition_met,
            "condition branch selected"
        );

        StepOutcome::Completed {
            output,
            skipped: unreached.to_vec(),
        }
    }

    /// PARALLEL: fan out the declared child steps concurrently and await all.
    async fn run_parallel_step(
        self: &Arc<Self>,
        step: &StepDefinition,
        children: &[StepDefinition],
        ctx: &WorkflowContext,
    ) -> StepOutcome {
        let execution_id = ctx.execution_id;
        let record_id = self
            .journal
            .record_step_start(execution_id, &step.id, &step.name, 1)
            .await;
        self.event_bus.publish(WorkflowEvent::StepStarted {
            execution_id,
            step_id: step.id.clone(),
            step_name: step.name.clone(),
            step_type: "parallel".to_string(),
            attempt: 1,
        });
        let started = std::time::Instant::now();

        let mut join_set: JoinSet<(String, StepOutcome)> = JoinSet::new();
        for child in children {
            let engine = Arc::clone(self);
            let child = child.clone();
            let child_ctx = ctx.clone();
            join_set.spawn(async move {
                let outcome = engine.run_leaf_step(&child, &child_ctx).await;
                (child.id, outcome)
            });
        }

        let mut outputs: HashMap<String, Value> = HashMap::new();
        let mut errors: Vec<String> = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((child_id, StepOutcome::Completed { output, .. })) => {
                    outputs.insert(child_id, output_to_value(&output));
                }
                Ok((child_id, StepOutcome::Failed { error })) => {
                    errors.push(format!("child '{child_id}' failed: {error}"));
                }
                Err(join_err) => {
                    errors.push(format!("child task join error: {join_err}"));
                }
            }
        }

        if !errors.is_empty() {
            let error = errors.join("; ");
            self.journal.record_step_failed(record_id, &error).await;
            self.event_bus.publish(WorkflowEvent::StepFailed {
                execution_id,
                step_id: step.id.clone(),
                step_name: step.name.clone(),
                error: error.clone(),
                will_retry: false,
            });
            return StepOutcome::Failed { error };
        }

        self.journal
            .record_step_completed(record_id, Some(&output_to_value(&outputs)))
            .await;
        self.event_bus.publish(WorkflowEvent::StepCompleted {
            execution_id,
            step_id: step.id.clone(),
            step_name: step.name.clone(),
            duration_ms: started.elapsed().as_millis() as u64,
        });

        StepOutcome::Completed {
            output: outputs,
            skipped: vec![],
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Evaluate a CONDITION expression synchronously.
///
/// The evaluator is built per call and never lives across an await point,
/// keeping the dispatched step futures `Send`.
fn evaluate_condition(
    condition: &str,
    ctx: &WorkflowContext,
) -> Result<bool, super::expression::ExpressionError> {
    let evaluator = ConditionEvaluator::new();
    evaluator.evaluate_in_workflow_context(condition, ctx)
}

/// Convert an output map to a JSON value for records and events.
fn output_to_value(output: &HashMap<String, Value>) -> Value {
    serde_json::to_value(output).unwrap_or(json!({}))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use ensemble_types::agent::{AgentInstance, AgentInstanceStatus};
    use ensemble_types::error::{RegistryError, RepositoryError};
    use ensemble_types::execution::StepExecutionRecord;
    use ensemble_types::workflow::{AssignmentStrategy, StepType};

    use crate::agent::invoker::{AgentInvoker, BoxAgentInvoker, InvokeError};
    use crate::workflow::action::{ActionError, ActionExecutor};

    use super::*;

    // -- Mock repository ----------------------------------------------------

    #[derive(Default)]
    struct MockRepoInner {
        definitions: Mutex<HashMap<Uuid, WorkflowDefinition>>,
        executions: Mutex<HashMap<Uuid, WorkflowExecution>>,
        step_records: Mutex<Vec<StepExecutionRecord>>,
    }

    #[derive(Clone, Default)]
    struct MockRepo(Arc<MockRepoInner>);

    impl MockRepo {
        fn insert_definition(&self, def: WorkflowDefinition) {
            self.0.definitions.lock().unwrap().insert(def.id, def);
        }

        fn execution(&self, id: &Uuid) -> Option<WorkflowExecution> {
            self.0.executions.lock().unwrap().get(id).cloned()
        }

        fn records_for_step(&self, step_id: &str) -> Vec<StepExecutionRecord> {
            self.0
                .step_records
                .lock()
                .unwrap()
                .iter()
                .filter(|r| r.step_id == step_id)
                .cloned()
                .collect()
        }
    }

    impl WorkflowRepository for MockRepo {
        async fn get_definition(
            &self,
            id: &Uuid,
        ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
            Ok(self.0.definitions.lock().unwrap().get(id).cloned())
        }

        async fn create_execution(
            &self,
            execution: &WorkflowExecution,
        ) -> Result<(), RepositoryError> {
            self.0
                .executions
                .lock()
                .unwrap()
                .insert(execution.id, execution.clone());
            Ok(())
        }

        async fn update_execution_status(
            &self,
            execution_id: &Uuid,
            status: ExecutionStatus,
            error: Option<&str>,
            context: Option<&Value>,
        ) -> Result<(), RepositoryError> {
            let mut executions = self.0.executions.lock().unwrap();
            let execution = executions
                .get_mut(execution_id)
                .ok_or(RepositoryError::NotFound)?;
            // First terminal status wins, matching a store that rejects
            // transitions out of terminal states.
            if execution.status.is_terminal() {
                return Ok(());
            }
            execution.status = status;
            execution.error = error.map(String::from);
            if let Some(ctx) = context {
                execution.context = ctx.clone();
            }
            if status.is_terminal() {
                execution.completed_at = Some(Utc::now());
            }
            Ok(())
        }

        async fn get_execution(
            &self,
            execution_id: &Uuid,
        ) -> Result<Option<WorkflowExecution>, RepositoryError> {
            Ok(self.0.executions.lock().unwrap().get(execution_id).cloned())
        }

        async fn list_executions(
            &self,
            workflow_id: &Uuid,
            limit: u32,
        ) -> Result<Vec<WorkflowExecution>, RepositoryError> {
            let mut executions: Vec<WorkflowExecution> = self
                .0
                .executions
                .lock()
                .unwrap()
                .values()
                .filter(|e| e.workflow_id == *workflow_id)
                .cloned()
                .collect();
            executions.sort_by(|a, b| b.started_at.cmp(&a.started_at));
            executions.truncate(limit as usize);
            Ok(executions)
        }

        async fn create_step_record(
            &self,
            record: &StepExecutionRecord,
        ) -> Result<(), RepositoryError> {
            self.0.step_records.lock().unwrap().push(record.clone());
            Ok(())
        }

        async fn update_step_record(
            &self,
            record_id: &Uuid,
            status: StepStatus,
            output: Option<&Value>,
            error: Option<&str>,
        ) -> Result<(), RepositoryError> {
            let mut records = self.0.step_records.lock().unwrap();
            let record = records
                .iter_mut()
                .find(|r| r.id == *record_id)
                .ok_or(RepositoryError::NotFound)?;
            record.status = status;
            record.output = output.cloned();
            record.error = error.map(String::from);
            record.completed_at = Some(Utc::now());
            Ok(())
        }

        async fn list_step_records(
            &self,
            execution_id: &Uuid,
        ) -> Result<Vec<StepExecutionRecord>, RepositoryError> {
            Ok(self
                .0
                .step_records
                .lock()
                .unwrap()
                .iter()
                .filter(|r| r.execution_id == *execution_id)
                .cloned()
                .collect())
        }
    }

    // -- Mock registry ------------------------------------------------------

    struct MockRegistry {
        instances: Mutex<HashMap<Uuid, AgentInstance>>,
    }

    impl MockRegistry {
        fn with_instances(instances: Vec<AgentInstance>) -> Arc<Self> {
            Arc::new(Self {
                instances: Mutex::new(instances.into_iter().map(|i| (i.id, i)).collect()),
            })
        }
    }

    impl AgentRegistry for MockRegistry {
        async fn list_eligible_instances(
            &self,
            capabilities: &[String],
            workspace_id: Uuid,
            project_id: Uuid,
        ) -> Result<Vec<AgentInstance>, RegistryError> {
            Ok(self
                .instances
                .lock()
                .unwrap()
                .values()
                .filter(|i| i.has_capabilities(capabilities))
                .filter(|i| i.in_scope(workspace_id, project_id))
                .cloned()
                .collect())
        }

        async fn get_instance(&self, id: &Uuid) -> Result<Option<AgentInstance>, RegistryError> {
            Ok(self.instances.lock().unwrap().get(id).cloned())
        }

        async fn update_instance_status(
            &self,
            id: &Uuid,
            status: AgentInstanceStatus,
        ) -> Result<(), RegistryError> {
            if let Some(instance) = self.instances.lock().unwrap().get_mut(id) {
                instance.status = status;
            }
            Ok(())
        }
    }

    // -- Mock action executors ----------------------------------------------

    /// Records every invocation and returns `{"result": "<action>-out"}`.
    #[derive(Default)]
    struct RecordingAction {
        calls: Arc<Mutex<Vec<(String, HashMap<String, Value>)>>>,
    }

    impl ActionExecutor for RecordingAction {
        async fn execute(
            &self,
            action: &str,
            params: &HashMap<String, Value>,
            _ctx: &WorkflowContext,
        ) -> Result<HashMap<String, Value>, ActionError> {
            self.calls
                .lock()
                .unwrap()
                .push((action.to_string(), params.clone()));
            if action == "boom" {
                return Err(ActionError::Failed("action exploded".to_string()));
            }
            Ok(HashMap::from([(
                "result".to_string(),
                json!(format!("{action}-out")),
            )]))
        }
    }

    /// Fails the first `failures` invocations, then succeeds.
    struct FlakyAction {
        remaining_failures: Mutex<u32>,
    }

    impl ActionExecutor for FlakyAction {
        async fn execute(
            &self,
            action: &str,
            _params: &HashMap<String, Value>,
            _ctx: &WorkflowContext,
        ) -> Result<HashMap<String, Value>, ActionError> {
            {
                let mut remaining = self.remaining_failures.lock().unwrap();
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(ActionError::Failed("transient failure".to_string()));
                }
            }
            Ok(HashMap::from([(
                "result".to_string(),
                json!(format!("{action}-out")),
            )]))
        }
    }

    /// Sleeps before succeeding; used for cancellation/timeout tests.
    struct SlowAction {
        delay: Duration,
    }

    impl ActionExecutor for SlowAction {
        async fn execute(
            &self,
            _action: &str,
            _params: &HashMap<String, Value>,
            _ctx: &WorkflowContext,
        ) -> Result<HashMap<String, Value>, ActionError> {
            tokio::time::sleep(self.delay).await;
            Ok(HashMap::from([("result".to_string(), json!("slow-out"))]))
        }
    }

    /// Echoes the input back, tagging which instance served it.
    struct EchoInvoker;

    impl AgentInvoker for EchoInvoker {
        async fn invoke(
            &self,
            instance: &AgentInstance,
            _step: &StepDefinition,
            input: &HashMap<String, Value>,
        ) -> Result<HashMap<String, Value>, InvokeError> {
            let mut output = input.clone();
            output.insert("served_by".to_string(), json!(instance.id.to_string()));
            Ok(output)
        }
    }

    // -- Fixtures -----------------------------------------------------------

    fn task_step(id: &str, action: &str, deps: Vec<&str>) -> StepDefinition {
        StepDefinition {
            id: id.to_string(),
            name: id.to_string(),
            step_type: StepType::Task,
            order: 0,
            depends_on: deps.into_iter().map(String::from).collect(),
            config: StepConfig::Task {
                action: action.to_string(),
                params: HashMap::new(),
            },
            timeout_secs: Some(5),
            max_retries: 0,
            required_capabilities: vec![],
            agent_instance_id: None,
            assignment_strategy: AssignmentStrategy::RoundRobin,
        }
    }

    fn workflow(steps: Vec<StepDefinition>) -> WorkflowDefinition {
        WorkflowDefinition {
            id: Uuid::now_v7(),
            name: "test-flow".to_string(),
            description: None,
            on_step_failure: FailurePolicy::Abort,
            timeout_secs: Some(30),
            variables: HashMap::new(),
            steps,
        }
    }

    fn idle_instance(name: &str) -> AgentInstance {
        AgentInstance {
            id: Uuid::now_v7(),
            name: name.to_string(),
            capabilities: vec!["research".to_string()],
            workspace_id: None,
            project_id: None,
            status: AgentInstanceStatus::Idle,
        }
    }

    struct Harness {
        engine: Arc<WorkflowEngine<MockRepo, MockRegistry>>,
        repo: MockRepo,
        bus: EventBus,
    }

    fn harness(action: impl ActionExecutor + 'static, instances: Vec<AgentInstance>) -> Harness {
        let repo = MockRepo::default();
        let bus = EventBus::new(256);
        let registry = MockRegistry::with_instances(instances);
        let controller = Arc::new(MultiAgentController::new(
            registry,
            BoxAgentInvoker::new(EchoInvoker),
        ));
        let engine = Arc::new(WorkflowEngine::new(
            repo.clone(),
            bus.clone(),
            controller,
            BoxActionExecutor::new(action),
        ));
        Harness { engine, repo, bus }
    }

    /// Poll the repository until the execution settles.
    async fn wait_terminal(repo: &MockRepo, execution_id: Uuid) -> WorkflowExecution {
        for _ in 0..250 {
            if let Some(execution) = repo.execution(&execution_id) {
                if execution.status.is_terminal() {
                    return execution;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("execution {execution_id} did not settle in time");
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn execute_returns_id_immediately_and_completes() {
        let h = harness(
            SlowAction {
                delay: Duration::from_millis(200),
            },
            vec![],
        );
        let def = workflow(vec![task_step("only", "work", vec![])]);
        let workflow_id = def.id;
        h.repo.insert_definition(def);

        let execution_id = h
            .engine
            .execute_workflow(workflow_id, Uuid::now_v7(), Uuid::now_v7(), HashMap::new())
            .await
            .unwrap();

        assert!(
            h.engine.is_active(&execution_id),
            "execution registered as active right away"
        );

        let execution = wait_terminal(&h.repo, execution_id).await;
        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert!(!h.engine.is_active(&execution_id));
        assert_eq!(h.engine.stats().active_executions, 0);
    }

    #[tokio::test]
    async fn outputs_flow_between_levels() {
        let action = RecordingAction::default();
        let calls = Arc::clone(&action.calls);
        let h = harness(action, vec![]);

        let mut consumer = task_step("consume", "consume", vec!["produce"]);
        consumer.config = StepConfig::Task {
            action: "consume".to_string(),
            params: HashMap::from([("prev".to_string(), json!("steps.produce.result"))]),
        };
        let def = workflow(vec![task_step("produce", "produce", vec![]), consumer]);
        let workflow_id = def.id;
        h.repo.insert_definition(def);

        let execution_id = h
            .engine
            .execute_workflow(workflow_id, Uuid::now_v7(), Uuid::now_v7(), HashMap::new())
            .await
            .unwrap();
        let execution = wait_terminal(&h.repo, execution_id).await;

        assert_eq!(execution.status, ExecutionStatus::Completed);
        let recorded = calls.lock().unwrap();
        let consume_call = recorded.iter().find(|(a, _)| a == "consume").unwrap();
        assert_eq!(
            consume_call.1["prev"],
            json!("produce-out"),
            "later level sees the resolved earlier output"
        );

        // Final context snapshot carries both outputs
        let ctx = WorkflowContext::from_json(execution.context).unwrap();
        assert_eq!(ctx.step_status("produce"), StepStatus::Completed);
        assert_eq!(ctx.step_status("consume"), StepStatus::Completed);
    }

    #[tokio::test]
    async fn diamond_runs_levels_in_order() {
        let action = RecordingAction::default();
        let calls = Arc::clone(&action.calls);
        let h = harness(action, vec![]);

        let def = workflow(vec![
            task_step("a", "run-a", vec![]),
            task_step("b", "run-b", vec!["a"]),
            task_step("c", "run-c", vec!["a"]),
            task_step("d", "run-d", vec!["b", "c"]),
        ]);
        let workflow_id = def.id;
        h.repo.insert_definition(def);

        let execution_id = h
            .engine
            .execute_workflow(workflow_id, Uuid::now_v7(), Uuid::now_v7(), HashMap::new())
            .await
            .unwrap();
        let execution = wait_terminal(&h.repo, execution_id).await;
        assert_eq!(execution.status, ExecutionStatus::Completed);

        let order: Vec<String> = calls.lock().unwrap().iter().map(|(a, _)| a.clone()).collect();
        let position = |name: &str| order.iter().position(|a| a == name).unwrap();
        assert_eq!(position("run-a"), 0);
        assert!(position("run-d") > position("run-b"));
        assert!(position("run-d") > position("run-c"));
        assert_eq!(order.len(), 4);
    }

    // -----------------------------------------------------------------------
    // Definition errors fail before any step runs
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn cycle_fails_before_any_step() {
        let action = RecordingAction::default();
        let calls = Arc::clone(&action.calls);
        let h = harness(action, vec![]);

        let def = workflow(vec![
            task_step("a", "run-a", vec!["b"]),
            task_step("b", "run-b", vec!["a"]),
        ]);
        let workflow_id = def.id;
        h.repo.insert_definition(def);

        let err = h
            .engine
            .execute_workflow(workflow_id, Uuid::now_v7(), Uuid::now_v7(), HashMap::new())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            EngineError::Workflow(WorkflowError::CircularDependency(_))
        ));
        assert!(calls.lock().unwrap().is_empty(), "no step ran");
        assert!(
            h.repo.0.executions.lock().unwrap().is_empty(),
            "no execution record created"
        );
    }

    #[tokio::test]
    async fn unknown_workflow_is_rejected() {
        let h = harness(RecordingAction::default(), vec![]);
        let err = h
            .engine
            .execute_workflow(Uuid::now_v7(), Uuid::now_v7(), Uuid::now_v7(), HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::WorkflowNotFound(_)));
    }

    // -----------------------------------------------------------------------
    // Condition branches
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn false_condition_skips_then_branch() {
        let action = RecordingAction::default();
        let calls = Arc::clone(&action.calls);
        let h = harness(action, vec![]);

        let mut condition = task_step("gate", "unused", vec![]);
        condition.step_type = StepType::Condition;
        condition.config = StepConfig::Condition {
            condition: "variables.go == true".to_string(),
            then_steps: vec!["publish".to_string()],
            else_steps: vec![],
        };
        let mut def = workflow(vec![condition, task_step("publish", "publish", vec!["gate"])]);
        def.variables = HashMap::from([("go".to_string(), json!(false))]);
        let workflow_id = def.id;
        h.repo.insert_definition(def);

        let execution_id = h
            .engine
            .execute_workflow(workflow_id, Uuid::now_v7(), Uuid::now_v7(), HashMap::new())
            .await
            .unwrap();
        let execution = wait_terminal(&h.repo, execution_id).await;

        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert!(
            !calls.lock().unwrap().iter().any(|(a, _)| a == "publish"),
            "skipped step never runs"
        );

        let ctx = WorkflowContext::from_json(execution.context).unwrap();
        assert_eq!(ctx.step_status("publish"), StepStatus::Skipped);
        let skipped_records = h.repo.records_for_step("publish");
        assert_eq!(skipped_records.len(), 1);
        assert_eq!(skipped_records[0].status, StepStatus::Skipped);
    }

    #[tokio::test]
    async fn true_condition_runs_then_branch() {
        let action = RecordingAction::default();
        let calls = Arc::clone(&action.calls);
        let h = harness(action, vec![]);

        let mut condition = task_step("gate", "unused", vec![]);
        condition.step_type = StepType::Condition;
        condition.config = StepConfig::Condition {
            condition: "variables.go == true".to_string(),
            then_steps: vec!["publish".to_string()],
            else_steps: vec![],
        };
        let mut def = workflow(vec![condition, task_step("publish", "publish", vec!["gate"])]);
        def.variables = HashMap::from([("go".to_string(), json!(true))]);
        let workflow_id = def.id;
        h.repo.insert_definition(def);

        let execution_id = h
            .engine
            .execute_workflow(workflow_id, Uuid::now_v7(), Uuid::now_v7(), HashMap::new())
            .await
            .unwrap();
        let execution = wait_terminal(&h.repo, execution_id).await;

        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert!(calls.lock().unwrap().iter().any(|(a, _)| a == "publish"));
    }

    // -----------------------------------------------------------------------
    // Failure policies, retries
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn failing_step_aborts_execution_but_keeps_outputs() {
        let h = harness(RecordingAction::default(), vec![]);

        let def = workflow(vec![
            task_step("ok", "fine", vec![]),
            task_step("bad", "boom", vec!["ok"]),
            task_step("never", "after", vec!["bad"]),
        ]);
        let workflow_id = def.id;
        h.repo.insert_definition(def);

        let execution_id = h
            .engine
            .execute_workflow(workflow_id, Uuid::now_v7(), Uuid::now_v7(), HashMap::new())
            .await
            .unwrap();
        let execution = wait_terminal(&h.repo, execution_id).await;

        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert!(execution.error.unwrap().contains("bad"));

        let ctx = WorkflowContext::from_json(execution.context).unwrap();
        assert_eq!(
            ctx.step_status("ok"),
            StepStatus::Completed,
            "completed outputs preserved on failure"
        );
        assert!(ctx.get_step_output("ok").is_some());
        assert_eq!(ctx.step_status("never"), StepStatus::Pending);
    }

    #[tokio::test]
    async fn continue_policy_schedules_later_levels() {
        let action = RecordingAction::default();
        let calls = Arc::clone(&action.calls);
        let h = harness(action, vec![]);

        let mut def = workflow(vec![
            task_step("bad", "boom", vec![]),
            task_step("after", "after", vec!["bad"]),
        ]);
        def.on_step_failure = FailurePolicy::Continue;
        let workflow_id = def.id;
        h.repo.insert_definition(def);

        let execution_id = h
            .engine
            .execute_workflow(workflow_id, Uuid::now_v7(), Uuid::now_v7(), HashMap::new())
            .await
            .unwrap();
        let execution = wait_terminal(&h.repo, execution_id).await;

        assert!(
            calls.lock().unwrap().iter().any(|(a, _)| a == "after"),
            "later level still ran"
        );
        assert_eq!(
            execution.status,
            ExecutionStatus::Failed,
            "completed iff no step failed"
        );
    }

    #[tokio::test]
    async fn retry_succeeds_on_second_attempt() {
        let h = harness(
            FlakyAction {
                remaining_failures: Mutex::new(1),
            },
            vec![],
        );

        let mut step = task_step("flaky", "wobble", vec![]);
        step.max_retries = 1;
        let def = workflow(vec![step]);
        let workflow_id = def.id;
        h.repo.insert_definition(def);

        let execution_id = h
            .engine
            .execute_workflow(workflow_id, Uuid::now_v7(), Uuid::now_v7(), HashMap::new())
            .await
            .unwrap();
        let execution = wait_terminal(&h.repo, execution_id).await;

        assert_eq!(execution.status, ExecutionStatus::Completed);
        let records = h.repo.records_for_step("flaky");
        assert_eq!(records.len(), 2, "one record per attempt");
        assert_eq!(records[0].attempt, 1);
        assert_eq!(records[0].status, StepStatus::Failed);
        assert_eq!(records[1].attempt, 2);
        assert_eq!(records[1].status, StepStatus::Completed);
    }

    // -----------------------------------------------------------------------
    // Cancellation
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn cancel_active_execution_returns_true_then_false() {
        let h = harness(
            SlowAction {
                delay: Duration::from_secs(2),
            },
            vec![],
        );
        let def = workflow(vec![
            task_step("slow", "work", vec![]),
            task_step("later", "work", vec!["slow"]),
        ]);
        let workflow_id = def.id;
        h.repo.insert_definition(def);

        let execution_id = h
            .engine
            .execute_workflow(workflow_id, Uuid::now_v7(), Uuid::now_v7(), HashMap::new())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(h.engine.cancel_workflow_execution(execution_id).await);
        assert!(!h.engine.is_active(&execution_id));

        let execution = h.repo.execution(&execution_id).unwrap();
        assert_eq!(execution.status, ExecutionStatus::Cancelled);

        // Already terminal
        assert!(!h.engine.cancel_workflow_execution(execution_id).await);
        // Unknown id
        assert!(!h.engine.cancel_workflow_execution(Uuid::now_v7()).await);
    }

    // -----------------------------------------------------------------------
    // Agent and parallel steps
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn agent_step_runs_through_controller() {
        let instance = idle_instance("worker");
        let h = harness(RecordingAction::default(), vec![instance]);

        let mut step = task_step("research", "unused", vec![]);
        step.step_type = StepType::Agent;
        step.required_capabilities = vec!["research".to_string()];
        step.config = StepConfig::Agent {
            task: "find articles".to_string(),
            input: HashMap::from([("topic".to_string(), json!("rust"))]),
        };
        let def = workflow(vec![step]);
        let workflow_id = def.id;
        h.repo.insert_definition(def);

        let execution_id = h
            .engine
            .execute_workflow(workflow_id, Uuid::now_v7(), Uuid::now_v7(), HashMap::new())
            .await
            .unwrap();
        let execution = wait_terminal(&h.repo, execution_id).await;

        assert_eq!(execution.status, ExecutionStatus::Completed);
        let ctx = WorkflowContext::from_json(execution.context).unwrap();
        let output = ctx.get_step_output("research").unwrap();
        assert_eq!(output["topic"], json!("rust"));
        assert!(output.contains_key("served_by"));
        assert_eq!(h.engine.assignment_stats().active_reservations, 0);
    }

    #[tokio::test]
    async fn agent_step_without_instances_fails_execution() {
        let h = harness(RecordingAction::default(), vec![]);

        let mut step = task_step("research", "unused", vec![]);
        step.step_type = StepType::Agent;
        step.required_capabilities = vec!["research".to_string()];
        step.config = StepConfig::Agent {
            task: "find articles".to_string(),
            input: HashMap::new(),
        };
        let def = workflow(vec![step]);
        let workflow_id = def.id;
        h.repo.insert_definition(def);

        let execution_id = h
            .engine
            .execute_workflow(workflow_id, Uuid::now_v7(), Uuid::now_v7(), HashMap::new())
            .await
            .unwrap();
        let execution = wait_terminal(&h.repo, execution_id).await;

        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert!(execution.error.unwrap().contains("no eligible agent instance"));
    }

    #[tokio::test]
    async fn parallel_step_fans_out_children() {
        let action = RecordingAction::default();
        let calls = Arc::clone(&action.calls);
        let h = harness(action, vec![]);

        let mut parent = task_step("spread", "unused", vec![]);
        parent.step_type = StepType::Parallel;
        parent.config = StepConfig::Parallel {
            steps: vec![
                task_step("left", "run-left", vec![]),
                task_step("right", "run-right", vec![]),
            ],
        };
        let def = workflow(vec![parent]);
        let workflow_id = def.id;
        h.repo.insert_definition(def);

        let execution_id = h
            .engine
            .execute_workflow(workflow_id, Uuid::now_v7(), Uuid::now_v7(), HashMap::new())
            .await
            .unwrap();
        let execution = wait_terminal(&h.repo, execution_id).await;

        assert_eq!(execution.status, ExecutionStatus::Completed);
        let recorded: Vec<String> = calls.lock().unwrap().iter().map(|(a, _)| a.clone()).collect();
        assert!(recorded.contains(&"run-left".to_string()));
        assert!(recorded.contains(&"run-right".to_string()));

        let ctx = WorkflowContext::from_json(execution.context).unwrap();
        let output = ctx.get_step_output("spread").unwrap();
        assert_eq!(output["left"]["result"], json!("run-left-out"));
        assert_eq!(output["right"]["result"], json!("run-right-out"));
    }

    // -----------------------------------------------------------------------
    // Timeouts and events
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn execution_timeout_fails_the_run() {
        let h = harness(
            SlowAction {
                delay: Duration::from_secs(10),
            },
            vec![],
        );
        let mut def = workflow(vec![task_step("slow", "work", vec![])]);
        def.timeout_secs = Some(1);
        let workflow_id = def.id;
        h.repo.insert_definition(def);

        let execution_id = h
            .engine
            .execute_workflow(workflow_id, Uuid::now_v7(), Uuid::now_v7(), HashMap::new())
            .await
            .unwrap();
        let execution = wait_terminal(&h.repo, execution_id).await;

        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert!(execution.error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn lifecycle_events_are_published_in_order() {
        let h = harness(RecordingAction::default(), vec![]);
        let mut rx = h.bus.subscribe();

        let def = workflow(vec![task_step("only", "work", vec![])]);
        let workflow_id = def.id;
        h.repo.insert_definition(def);

        let execution_id = h
            .engine
            .execute_workflow(workflow_id, Uuid::now_v7(), Uuid::now_v7(), HashMap::new())
            .await
            .unwrap();
        wait_terminal(&h.repo, execution_id).await;
        // The terminal status is recorded just before the final event is
        // published; give the run task a beat to finish publishing.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            seen.push(event.event_type().to_string());
        }
        assert_eq!(
            seen,
            vec![
                "workflow_started",
                "step_started",
                "step_completed",
                "workflow_completed"
            ]
        );
    }

    // -----------------------------------------------------------------------
    // Integration layer
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn integration_submits_and_merges_stats() {
        use crate::workflow::integration::{TokioTaskRunner, WorkflowEngineIntegration};

        let h = harness(RecordingAction::default(), vec![]);
        let def = workflow(vec![task_step("only", "work", vec![])]);
        let workflow_id = def.id;
        h.repo.insert_definition(def);

        let integration = WorkflowEngineIntegration::new(
            Arc::clone(&h.engine),
            Arc::new(TokioTaskRunner::new()),
        );

        let task_id = integration.execute_workflow(
            workflow_id,
            Uuid::now_v7(),
            Uuid::now_v7(),
            HashMap::new(),
        );
        assert!(!task_id.is_nil());

        // The background task starts the execution; wait until it settles.
        let execution = 'outer: {
            for _ in 0..250 {
                let executions: Vec<WorkflowExecution> = h
                    .repo
                    .0
                    .executions
                    .lock()
                    .unwrap()
                    .values()
                    .cloned()
                    .collect();
                if let Some(execution) = executions.iter().find(|e| e.status.is_terminal()) {
                    break 'outer execution.clone();
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            panic!("submitted execution did not settle");
        };
        assert_eq!(execution.status, ExecutionStatus::Completed);

        let stats = integration.get_integration_stats();
        assert_eq!(stats.task_runner.submitted, 1);
        assert_eq!(stats.engine.active_executions, 0);
        assert_eq!(stats.assignments.active_assignments, 0);

        // Cancellation of an already-terminal execution forwards as false.
        assert!(!integration.cancel_workflow_execution(execution.id).await);
    }
}
