//! Workflow execution engine and multi-agent controller for Ensemble.
//!
//! This crate defines the orchestration core plus the "ports" (repository,
//! registry, invoker, task-runner traits) that an infrastructure layer
//! implements. It depends only on `ensemble-types` -- never on a database,
//! HTTP, or LLM crate.

pub mod agent;
pub mod event;
pub mod repository;
pub mod workflow;
