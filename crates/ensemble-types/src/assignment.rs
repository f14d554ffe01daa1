//! Assignment, reservation, and failover tracking types.
//!
//! An `Assignment` binds a step execution to an agent instance. A
//! `Reservation` is the exclusive, time-bounded claim on that instance's
//! capacity. A `FailoverRecord` accumulates the history of instances a step
//! was moved away from after failures.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::workflow::AssignmentStrategy;

/// Binding between a step execution and the agent instance chosen for it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assignment {
    /// The step execution this assignment belongs to.
    pub step_execution_id: Uuid,
    /// The chosen agent instance.
    pub instance_id: Uuid,
    /// Strategy that produced this assignment.
    pub strategy: AssignmentStrategy,
    /// The required capabilities the instance satisfied.
    pub capability_match: Vec<String>,
    pub assigned_at: DateTime<Utc>,
}

/// Exclusive, time-bounded claim on an agent instance's capacity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reservation {
    pub assignment: Assignment,
    /// Descriptor of what is reserved (currently the instance itself).
    pub resource: String,
    pub duration_secs: u64,
    pub expires_at: DateTime<Utc>,
    pub active: bool,
}

impl Reservation {
    /// Build a reservation for an assignment, expiring `duration_secs` from now.
    pub fn new(assignment: Assignment, duration_secs: u64) -> Self {
        let expires_at = Utc::now() + Duration::seconds(duration_secs as i64);
        Self {
            resource: format!("agent-instance:{}", assignment.instance_id),
            assignment,
            duration_secs,
            expires_at,
            active: true,
        }
    }

    /// Whether the reservation has outlived its duration.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// One hop in a step's failover history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverEntry {
    /// The instance the step is being moved away from.
    pub from_instance: Uuid,
    /// The replacement instance, once one is chosen.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_instance: Option<Uuid>,
    /// Why the original instance was abandoned.
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// Accumulated failover state for one step execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverRecord {
    pub step_execution_id: Uuid,
    /// Failovers performed so far. Always equals `history.len()`.
    pub attempts: u32,
    /// Budget; reaching it is terminal for the step.
    pub max_attempts: u32,
    pub history: Vec<FailoverEntry>,
}

impl FailoverRecord {
    pub fn new(step_execution_id: Uuid, max_attempts: u32) -> Self {
        Self {
            step_execution_id,
            attempts: 0,
            max_attempts,
            history: Vec::new(),
        }
    }

    /// Record one failover hop away from `from_instance`.
    pub fn record_failure(&mut self, from_instance: Uuid, reason: impl Into<String>) {
        self.attempts += 1;
        self.history.push(FailoverEntry {
            from_instance,
            to_instance: None,
            reason: reason.into(),
            at: Utc::now(),
        });
    }

    /// Note the replacement instance on the most recent hop.
    pub fn record_replacement(&mut self, to_instance: Uuid) {
        if let Some(entry) = self.history.last_mut() {
            entry.to_instance = Some(to_instance);
        }
    }

    /// Whether another failover is allowed.
    pub fn can_fail_over(&self) -> bool {
        self.attempts < self.max_attempts
    }
}

/// Point-in-time counts reported by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentStats {
    pub active_assignments: usize,
    pub active_reservations: usize,
    pub failover_records: usize,
}
