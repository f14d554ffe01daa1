//! Workflow definition parsing and structural validation.
//!
//! Converts between YAML and the canonical `WorkflowDefinition`, and checks
//! the structural constraints the resolver and engine rely on (unique IDs,
//! valid dependency references, well-formed branches). Definitions live in an
//! external repository; this module never touches storage.

use std::collections::HashSet;

use ensemble_types::workflow::{StepConfig, StepType, WorkflowDefinition};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during workflow definition and resolution.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// YAML/JSON parse failure.
    #[error("parse error: {0}")]
    ParseError(String),

    /// Structural validation failure.
    #[error("validation error: {0}")]
    ValidationError(String),

    /// Dependency graph contains a cycle.
    #[error("circular dependency among steps: {0}")]
    CircularDependency(String),

    /// A step references an unknown dependency.
    #[error("unknown dependency: {0}")]
    UnknownDependency(String),

    /// JEXL condition evaluation error.
    #[error("expression error: {0}")]
    ExpressionError(String),

    /// Runtime execution failure.
    #[error("execution error: {0}")]
    ExecutionError(String),
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a YAML string into a validated `WorkflowDefinition`.
///
/// Runs `validate_definition` after deserialization, so the returned value
/// is guaranteed to be structurally valid.
pub fn parse_workflow_yaml(yaml: &str) -> Result<WorkflowDefinition, WorkflowError> {
    let def: WorkflowDefinition =
        serde_yaml_ng::from_str(yaml).map_err(|e| WorkflowError::ParseError(e.to_string()))?;
    validate_definition(&def)?;
    Ok(def)
}

/// Serialize a `WorkflowDefinition` to a YAML string.
pub fn serialize_workflow_yaml(def: &WorkflowDefinition) -> Result<String, WorkflowError> {
    serde_yaml_ng::to_string(def).map_err(|e| WorkflowError::ParseError(e.to_string()))
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate structural constraints on a `WorkflowDefinition`.
///
/// Checks:
/// - Name is non-empty and contains only alphanumeric characters and hyphens
/// - At least one step exists
/// - All step IDs (including parallel children) are unique
/// - All `depends_on` references point to existing step IDs
/// - Condition branch references point to existing steps that depend on the
///   condition step (so branches always land in strictly later levels)
/// - Parallel children are Task or Agent steps with no dependencies
/// - Timeout > 0 if set
pub fn validate_definition(def: &WorkflowDefinition) -> Result<(), WorkflowError> {
    if def.name.is_empty() {
        return Err(WorkflowError::ValidationError(
            "workflow name must not be empty".to_string(),
        ));
    }
    if !def.name.chars().all(|c| c.is_alphanumeric() || c == '-') {
        return Err(WorkflowError::ValidationError(format!(
            "workflow name '{}' contains invalid characters (only alphanumeric and hyphens allowed)",
            def.name
        )));
    }

    if def.steps.is_empty() {
        return Err(WorkflowError::ValidationError(
            "workflow must have at least one step".to_string(),
        ));
    }

    // Unique step IDs, counting parallel children
    let mut seen_ids = HashSet::new();
    for step in &def.steps {
        if !seen_ids.insert(step.id.as_str()) {
            return Err(WorkflowError::ValidationError(format!(
                "duplicate step ID: '{}'",
                step.id
            )));
        }
        if let StepConfig::Parallel { steps } = &step.config {
            for child in steps {
                if !seen_ids.insert(child.id.as_str()) {
                    return Err(WorkflowError::ValidationError(format!(
                        "duplicate step ID: '{}'",
                        child.id
                    )));
                }
            }
        }
    }

    // depends_on references must be valid; parallel children never appear in
    // the top-level DAG, so collect only top-level ids for that check.
    let top_level: HashSet<&str> = def.steps.iter().map(|s| s.id.as_str()).collect();
    for step in &def.steps {
        for dep in &step.depends_on {
            if !top_level.contains(dep.as_str()) {
                return Err(WorkflowError::UnknownDependency(format!(
                    "step '{}' depends on unknown step '{}'",
                    step.id, dep
                )));
            }
        }
    }

    for step in &def.steps {
        match &step.config {
            StepConfig::Condition {
                then_steps,
                else_steps,
                ..
            } => {
                for ref_id in then_steps.iter().chain(else_steps.iter()) {
                    let Some(target) = def.steps.iter().find(|s| s.id == *ref_id) else {
                        return Err(WorkflowError::ValidationError(format!(
                            "condition step '{}' references unknown step '{}'",
                            step.id, ref_id
                        )));
                    };
                    if !target.depends_on.contains(&step.id) {
                        return Err(WorkflowError::ValidationError(format!(
                            "branch step '{}' must depend on condition step '{}'",
                            ref_id, step.id
                        )));
                    }
                }
            }
            StepConfig::Parallel { steps } => {
                for child in steps {
                    if !matches!(child.step_type, StepType::Task | StepType::Agent) {
                        return Err(WorkflowError::ValidationError(format!(
                            "parallel step '{}' child '{}' must be a task or agent step",
                            step.id, child.id
                        )));
                    }
                    if !child.depends_on.is_empty() {
                        return Err(WorkflowError::ValidationError(format!(
                            "parallel child '{}' must not declare dependencies",
                            child.id
                        )));
                    }
                }
            }
            _ => {}
        }
    }

    if let Some(t) = def.timeout_secs {
        if t == 0 {
            return Err(WorkflowError::ValidationError(
                "timeout must be > 0".to_string(),
            ));
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
