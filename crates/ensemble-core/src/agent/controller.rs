//! Multi-agent controller: assignment, reservation, and failover.
//!
//! Binds AGENT steps to capability-matching instances under exclusive
//! reservation, runs the agent's unit of work under timeout, and moves the
//! step to an alternate instance when the assigned one fails -- bounded by a
//! failover budget.
//!
//! All registries (`active_assignments`, `active_reservations`,
//! `failover_records`) are concurrent maps with insert-on-start /
//! remove-on-terminal discipline; no lock spans executions.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use ensemble_types::agent::{AgentInstance, AgentInstanceStatus};
use ensemble_types::assignment::{Assignment, AssignmentStats, FailoverRecord, Reservation};
use ensemble_types::error::RegistryError;
use ensemble_types::workflow::{AssignmentStrategy, StepDefinition};
use serde_json::Value;
use uuid::Uuid;

use crate::workflow::context::WorkflowContext;

use super::context_service::BoxContextService;
use super::invoker::BoxAgentInvoker;
use super::registry::AgentRegistry;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Default number of alternate instances a step may be moved to.
pub const DEFAULT_MAX_FAILOVER_ATTEMPTS: u32 = 3;

/// Default reservation lifetime in seconds.
pub const DEFAULT_RESERVATION_DURATION_SECS: u64 = 600;

/// Tunables for the controller.
#[derive(Debug, Clone, Copy)]
pub struct ControllerConfig {
    /// Failover budget per step execution.
    pub max_failover_attempts: u32,
    /// How long a reservation lasts before it is considered expired.
    pub reservation_duration_secs: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            max_failover_attempts: DEFAULT_MAX_FAILOVER_ATTEMPTS,
            reservation_duration_secs: DEFAULT_RESERVATION_DURATION_SECS,
        }
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors from agent assignment and execution.
#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    /// No instance matches the step's capabilities/scope (or all are taken).
    #[error("no eligible agent instance for step '{step_id}'")]
    NoEligibleInstance { step_id: String },

    /// The pinned instance is unknown, out of scope, or already failed.
    #[error("pinned agent instance {0} is unavailable")]
    PinnedInstanceUnavailable(Uuid),

    /// The instance already has an active reservation.
    #[error("agent instance {0} is already reserved")]
    InstanceReserved(Uuid),

    /// The failover budget was exhausted; the step fails terminally.
    #[error("step '{step_id}' exhausted {attempts} failover attempts: {last_error}")]
    FailoverExhausted {
        step_id: String,
        attempts: u32,
        last_error: String,
    },

    /// Registry lookup failed.
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
}

// ---------------------------------------------------------------------------
// MultiAgentController
// ---------------------------------------------------------------------------

/// Assigns agent instances to steps, reserves their capacity, executes the
/// step against them, and fails over to alternates on error.
pub struct MultiAgentController<G: AgentRegistry> {
    registry: Arc<G>,
    invoker: BoxAgentInvoker,
    /// Optional shared-state lookup merged into invocation input.
    context_service: Option<BoxContextService>,
    config: ControllerConfig,
    /// Active assignments keyed by step execution ID.
    active_assignments: DashMap<Uuid, Assignment>,
    /// Active reservations keyed by instance ID -- at most one per instance.
    active_reservations: DashMap<Uuid, Reservation>,
    /// Failover history keyed by step execution ID.
    failover_records: DashMap<Uuid, FailoverRecord>,
    round_robin_cursor: AtomicUsize,
}

impl<G: AgentRegistry> MultiAgentController<G> {
    /// Create a controller with default configuration.
    pub fn new(registry: Arc<G>, invoker: BoxAgentInvoker) -> Self {
        Self::with_config(registry, invoker, ControllerConfig::default())
    }

    /// Create a controller with explicit configuration.
    pub fn with_config(
        registry: Arc<G>,
        invoker: BoxAgentInvoker,
        config: ControllerConfig,
    ) -> Self {
        Self {
            registry,
            invoker,
            context_service: None,
            config,
            active_assignments: DashMap::new(),
            active_reservations: DashMap::new(),
            failover_records: DashMap::new(),
            round_robin_cursor: AtomicUsize::new(0),
        }
    }

    /// Attach an optional shared-state lookup service.
    pub fn with_context_service(mut self, service: BoxContextService) -> Self {
        self.context_service = Some(service);
        self
    }

    // -----------------------------------------------------------------------
    // Assignment
    // -----------------------------------------------------------------------

    /// Assign an agent instance to a step execution.
    ///
    /// Pinned steps always go to their pinned instance; otherwise selection
    /// runs over capability-matching, workspace/project-eligible, unreserved,
    /// non-excluded instances per the step's assignment strategy.
    pub async fn assign_agent(
        &self,
        step_execution_id: Uuid,
        step: &StepDefinition,
        ctx: &WorkflowContext,
        excluded: &[Uuid],
    ) -> Result<Assignment, ControllerError> {
        let instance = self.select_instance(step, ctx, excluded).await?;
        Ok(self.build_assignment(step_execution_id, step, &instance))
    }

    /// Pick the instance for a step without building the assignment.
    async fn select_instance(
        &self,
        step: &StepDefinition,
        ctx: &WorkflowContext,
        excluded: &[Uuid],
    ) -> Result<AgentInstance, ControllerError> {
        if let Some(pinned_id) = step.agent_instance_id {
            // Pinned instances are never failed over.
            if excluded.contains(&pinned_id) {
                return Err(ControllerError::PinnedInstanceUnavailable(pinned_id));
            }
            let instance = self
                .registry
                .get_instance(&pinned_id)
                .await?
                .filter(|i| i.is_available())
                .filter(|i| i.in_scope(ctx.workspace_id, ctx.project_id))
                .filter(|i| i.has_capabilities(&step.required_capabilities))
                .ok_or(ControllerError::PinnedInstanceUnavailable(pinned_id))?;
            return Ok(instance);
        }

        let mut candidates: Vec<AgentInstance> = self
            .registry
            .list_eligible_instances(
                &step.required_capabilities,
                ctx.workspace_id,
                ctx.project_id,
            )
            .await?
            .into_iter()
            .filter(|i| i.is_available())
            .filter(|i| !excluded.contains(&i.id))
            .filter(|i| !self.is_reserved(i.id))
            .collect();

        if candidates.is_empty() {
            return Err(ControllerError::NoEligibleInstance {
                step_id: step.id.clone(),
            });
        }

        // Deterministic base order so strategies are reproducible.
        candidates.sort_by_key(|i| i.id);

        let chosen = match step.assignment_strategy {
            AssignmentStrategy::RoundRobin => {
                let cursor = self.round_robin_cursor.fetch_add(1, Ordering::Relaxed);
                candidates.swap_remove(cursor % candidates.len())
            }
            AssignmentStrategy::LeastLoaded => {
                let position = candidates
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, i)| self.assignment_count(i.id))
                    .map(|(pos, _)| pos)
                    .unwrap_or(0);
                candidates.swap_remove(position)
            }
            AssignmentStrategy::FirstAvailable => candidates.swap_remove(0),
        };

        Ok(chosen)
    }

    fn build_assignment(
        &self,
        step_execution_id: Uuid,
        step: &StepDefinition,
        instance: &AgentInstance,
    ) -> Assignment {
        Assignment {
            step_execution_id,
            instance_id: instance.id,
            strategy: step.assignment_strategy,
            capability_match: step.required_capabilities.clone(),
            assigned_at: Utc::now(),
        }
    }

    fn assignment_count(&self, instance_id: Uuid) -> usize {
        self.active_assignments
            .iter()
            .filter(|entry| entry.value().instance_id == instance_id)
            .count()
    }

    // -----------------------------------------------------------------------
    // Reservations
    // -----------------------------------------------------------------------

    /// Reserve an instance's capacity for a step execution.
    ///
    /// Mandatory before work starts, so two concurrent steps can never reuse
    /// one instance. An instance with an active, unexpired reservation cannot
    /// be reserved again.
    pub fn reserve_resources(
        &self,
        assignment: &Assignment,
        duration_secs: u64,
    ) -> Result<Reservation, ControllerError> {
        match self.active_reservations.entry(assignment.instance_id) {
            dashmap::Entry::Occupied(mut occupied) => {
                let existing = occupied.get();
                if existing.active && !existing.is_expired(Utc::now()) {
                    return Err(ControllerError::InstanceReserved(assignment.instance_id));
                }
                // Expired or inactive reservations are replaced in place.
                let reservation = Reservation::new(assignment.clone(), duration_secs);
                occupied.insert(reservation.clone());
                Ok(reservation)
            }
            dashmap::Entry::Vacant(vacant) => {
                let reservation = Reservation::new(assignment.clone(), duration_secs);
                vacant.insert(reservation.clone());
                Ok(reservation)
            }
        }
    }

    /// Release a reservation. Idempotent: releasing twice is a no-op.
    ///
    /// Only removes the tracked entry if it still belongs to this
    /// reservation's step execution, so a later reservation of the same
    /// instance is never clobbered.
    pub fn release_resources(&self, reservation: &Reservation) {
        let removed = self.active_reservations.remove_if(
            &reservation.assignment.instance_id,
            |_, tracked| {
                tracked.assignment.step_execution_id == reservation.assignment.step_execution_id
            },
        );
        if removed.is_some() {
            tracing::debug!(
                instance_id = %reservation.assignment.instance_id,
                step_execution_id = %reservation.assignment.step_execution_id,
                "released reservation"
            );
        }
    }

    fn is_reserved(&self, instance_id: Uuid) -> bool {
        // Lazily drop expired reservations on the way through.
        self.active_reservations
            .remove_if(&instance_id, |_, r| !r.active || r.is_expired(Utc::now()));
        self.active_reservations.contains_key(&instance_id)
    }

    // -----------------------------------------------------------------------
    // Execution with failover
    // -----------------------------------------------------------------------

    /// Execute an AGENT step: assign, reserve, invoke under timeout, and
    /// fail over to alternate instances on error.
    ///
    /// Per-instance the invocation is attempted `max_retries + 1` times; when
    /// an instance exhausts its attempts, a failover hop is recorded and a
    /// different eligible instance is tried, up to
    /// `config.max_failover_attempts` hops. Exhausting the budget is
    /// terminal for the step.
    pub async fn execute_agent_step(
        &self,
        step_execution_id: Uuid,
        step: &StepDefinition,
        ctx: &WorkflowContext,
        input_data: &HashMap<String, Value>,
        timeout_secs: u64,
        max_retries: u32,
    ) -> Result<HashMap<String, Value>, ControllerError> {
        let input = self.augment_input(ctx, input_data).await;
        let mut excluded: Vec<Uuid> = Vec::new();

        loop {
            let instance = self.select_instance(step, ctx, &excluded).await?;
            let assignment = self.build_assignment(step_execution_id, step, &instance);

            if let Some(mut record) = self.failover_records.get_mut(&step_execution_id) {
                record.record_replacement(instance.id);
            }

            let reservation =
                self.reserve_resources(&assignment, self.config.reservation_duration_secs)?;
            self.active_assignments
                .insert(step_execution_id, assignment.clone());
            self.update_status_best_effort(instance.id, AgentInstanceStatus::Busy)
                .await;

            tracing::debug!(
                step_id = step.id.as_str(),
                instance_id = %instance.id,
                strategy = ?assignment.strategy,
                "agent step assigned"
            );

            match self
                .run_attempts(&instance, step, &input, timeout_secs, max_retries)
                .await
            {
                Ok(output) => {
                    self.release_resources(&reservation);
                    self.active_assignments.remove(&step_execution_id);
                    self.update_status_best_effort(instance.id, AgentInstanceStatus::Idle)
                        .await;
                    return Ok(output);
                }
                Err(last_error) => {
                    self.release_resources(&reservation);
                    self.active_assignments.remove(&step_execution_id);
                    self.update_status_best_effort(instance.id, AgentInstanceStatus::Errored)
                        .await;

                    let (attempts, exhausted) = {
                        let mut record = self
                            .failover_records
                            .entry(step_execution_id)
                            .or_insert_with(|| {
                                FailoverRecord::new(
                                    step_execution_id,
                                    self.config.max_failover_attempts,
                                )
                            });
                        record.record_failure(instance.id, last_error.as_str());
                        (record.attempts, !record.can_fail_over())
                    };

                    if exhausted {
                        return Err(ControllerError::FailoverExhausted {
                            step_id: step.id.clone(),
                            attempts,
                            last_error,
                        });
                    }

                    tracing::warn!(
                        step_id = step.id.as_str(),
                        instance_id = %instance.id,
                        attempts,
                        error = last_error.as_str(),
                        "agent instance failed, failing over"
                    );
                    excluded.push(instance.id);
                }
            }
        }
    }

    /// Run up to `max_retries + 1` invocation attempts on one instance.
    ///
    /// Returns the output on success, or the last error message once the
    /// instance is out of attempts.
    async fn run_attempts(
        &self,
        instance: &AgentInstance,
        step: &StepDefinition,
        input: &HashMap<String, Value>,
        timeout_secs: u64,
        max_retries: u32,
    ) -> Result<HashMap<String, Value>, String> {
        let attempts = max_retries + 1;
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            let result = tokio::time::timeout(
                Duration::from_secs(timeout_secs),
                self.invoker.invoke(instance, step, input),
            )
            .await;

            match result {
                Ok(Ok(output)) => return Ok(output),
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => last_error = format!("invocation timed out after {timeout_secs}s"),
            }

            if attempt < attempts {
                tracing::warn!(
                    step_id = step.id.as_str(),
                    instance_id = %instance.id,
                    attempt,
                    error = last_error.as_str(),
                    "agent attempt failed, retrying on same instance"
                );
            }
        }

        Err(last_error)
    }

    /// Merge shared-state fields from the context service into the input.
    ///
    /// Looks up the workspace scope; explicit input keys always win.
    async fn augment_input(
        &self,
        ctx: &WorkflowContext,
        input: &HashMap<String, Value>,
    ) -> HashMap<String, Value> {
        let mut merged = input.clone();
        if let Some(service) = &self.context_service {
            match service
                .get("workspace", &ctx.workspace_id.to_string())
                .await
            {
                Ok(Some(Value::Object(shared))) => {
                    for (k, v) in shared {
                        merged.entry(k).or_insert(v);
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "context service lookup failed, continuing without");
                }
            }
        }
        merged
    }

    async fn update_status_best_effort(&self, instance_id: Uuid, status: AgentInstanceStatus) {
        if let Err(e) = self
            .registry
            .update_instance_status(&instance_id, status)
            .await
        {
            tracing::warn!(
                instance_id = %instance_id,
                status = ?status,
                error = %e,
                "failed to update instance status"
            );
        }
    }

    // -----------------------------------------------------------------------
    // Stats
    // -----------------------------------------------------------------------

    /// Non-blocking point-in-time counts of controller state.
    pub fn get_assignment_stats(&self) -> AssignmentStats {
        AssignmentStats {
            active_assignments: self.active_assignments.len(),
            active_reservations: self.active_reservations.len(),
            failover_records: self.failover_records.len(),
        }
    }

    /// Failover history for a step execution, if any failures occurred.
    pub fn failover_record(&self, step_execution_id: &Uuid) -> Option<FailoverRecord> {
        self.failover_records
            .get(step_execution_id)
            .map(|r| r.clone())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
