//! Dependency resolver: DAG leveling and cycle detection.
//!
//! Uses `petgraph` to model step dependencies as a directed graph, then
//! extracts parallel execution levels Kahn-style: each pass takes every
//! not-yet-placed step whose dependencies are all already placed. A pass that
//! places nothing while steps remain means a cycle.

use std::collections::HashSet;

use ensemble_types::workflow::StepDefinition;
use petgraph::Direction;
use petgraph::graph::DiGraph;

use super::definition::WorkflowError;

/// Resolve workflow steps into ordered parallel-execution levels.
///
/// Each level contains steps that can execute concurrently because all their
/// dependencies are satisfied by prior levels. Steps within a level sort by
/// `(order, id)` so the result is reproducible regardless of input order.
///
/// Returns `Vec<Vec<&StepDefinition>>` where index 0 is the first level to
/// execute. Pure function: no I/O, no persistence.
pub fn resolve_execution_order<'a>(
    steps: &'a [StepDefinition],
) -> Result<Vec<Vec<&'a StepDefinition>>, WorkflowError> {
    if steps.is_empty() {
        return Ok(vec![]);
    }

    // Build directed graph: edge from dependency -> dependent
    let mut graph = DiGraph::<&str, ()>::new();
    let node_indices: Vec<_> = steps.iter().map(|s| graph.add_node(s.id.as_str())).collect();
    let id_to_pos: std::collections::HashMap<&str, usize> = steps
        .iter()
        .enumerate()
        .map(|(i, s)| (s.id.as_str(), i))
        .collect();

    for (pos, step) in steps.iter().enumerate() {
        for dep in &step.depends_on {
            let from_pos = id_to_pos.get(dep.as_str()).ok_or_else(|| {
                WorkflowError::UnknownDependency(format!(
                    "step '{}' depends on unknown step '{}'",
                    step.id, dep
                ))
            })?;
            graph.add_edge(node_indices[*from_pos], node_indices[pos], ());
        }
    }

    // Kahn-style leveling: each pass places every step whose dependencies are
    // already placed. A pass that places nothing while steps remain is a cycle.
    let mut placed: HashSet<usize> = HashSet::new();
    let mut levels: Vec<Vec<&StepDefinition>> = Vec::new();

    while placed.len() < steps.len() {
        let mut ready: Vec<usize> = (0..steps.len())
            .filter(|pos| !placed.contains(pos))
            .filter(|pos| {
                // Nodes were added in step order, so NodeIndex::index() is the
                // position in `steps`.
                graph
                    .neighbors_directed(node_indices[*pos], Direction::Incoming)
                    .all(|dep_idx| placed.contains(&dep_idx.index()))
            })
            .collect();

        if ready.is_empty() {
            let mut stuck: Vec<&str> = (0..steps.len())
                .filter(|pos| !placed.contains(pos))
                .map(|pos| steps[pos].id.as_str())
                .collect();
            stuck.sort_unstable();
            return Err(WorkflowError::CircularDependency(stuck.join(", ")));
        }

        ready.sort_by(|a, b| {
            (steps[*a].order, steps[*a].id.as_str()).cmp(&(steps[*b].order, steps[*b].id.as_str()))
        });

        placed.extend(ready.iter().copied());
        levels.push(ready.into_iter().map(|pos| &steps[pos]).collect());
    }

    Ok(levels)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
