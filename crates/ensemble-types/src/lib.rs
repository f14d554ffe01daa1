//! Shared domain types for the Ensemble workflow orchestrator.
//!
//! This crate contains the core domain types used across Ensemble:
//! workflow/step definitions, execution records, agent instances,
//! assignment/reservation/failover tracking, and lifecycle events.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod agent;
pub mod assignment;
pub mod error;
pub mod event;
pub mod execution;
pub mod workflow;
