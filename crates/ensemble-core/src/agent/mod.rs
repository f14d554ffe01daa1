//! Multi-agent control plane.
//!
//! The controller binds AGENT steps to capability-matching instances under
//! exclusive reservation and fails over to alternates on error:
//! - `registry` -- the fleet lookup collaborator
//! - `invoker` -- the opaque AGENT unit of work behind a trait
//! - `context_service` -- optional shared-state lookup
//! - `controller` -- assignment, reservation, failover

pub mod context_service;
pub mod controller;
pub mod invoker;
pub mod registry;
