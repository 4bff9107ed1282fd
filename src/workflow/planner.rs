//! Execution Planner
//!
//! Compiles a validated definition into an [`ExecutionPlan`]:
//! - Per-node dependency lists (reverse adjacency)
//! - Parallel-group tags for fan-out successors
//! - Estimated durations and resolved retry policies
//! - Critical path as the longest duration-weighted chain

use std::collections::HashMap;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use super::model::{NodeType, RetryPolicy, WorkflowDefinition};
use super::validator::{topological_order, validate_definition};
use crate::error::{EngineError, Result};

/// One scheduled node in a plan.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionStep {
    pub node_id: String,
    pub node_type: NodeType,

    /// Nodes that must be COMPLETED before this one may run
    pub dependencies: Vec<String>,

    /// Set for every direct successor of a `parallel` node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel_group: Option<String>,

    /// Milliseconds
    pub estimated_duration: u64,
    pub retry_policy: RetryPolicy,
}

/// Compiled, read-mostly schedule for one instance.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionPlan {
    /// Steps in topological order
    pub execution_steps: Vec<ExecutionStep>,
    pub critical_path: Vec<String>,

    /// Sum of all step estimates in milliseconds
    pub total_estimated_duration: u64,
}

impl ExecutionPlan {
    pub fn step(&self, node_id: &str) -> Option<&ExecutionStep> {
        self.execution_steps.iter().find(|s| s.node_id == node_id)
    }

    pub fn dependencies(&self, node_id: &str) -> &[String] {
        self.step(node_id)
            .map(|s| s.dependencies.as_slice())
            .unwrap_or(&[])
    }

    /// Steps with no dependencies; the scheduler seeds these on start.
    pub fn root_steps(&self) -> impl Iterator<Item = &ExecutionStep> {
        self.execution_steps
            .iter()
            .filter(|s| s.dependencies.is_empty())
    }

    /// Sum of estimates along the critical path.
    pub fn critical_path_duration(&self) -> u64 {
        self.critical_path
            .iter()
            .filter_map(|id| self.step(id))
            .fold(0u64, |acc, s| acc.saturating_add(s.estimated_duration))
    }

    pub fn len(&self) -> usize {
        self.execution_steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.execution_steps.is_empty()
    }
}

/// Builds the execution plan for `instance_id`.
///
/// Fails with `DefinitionInvalid` when the definition does not validate.
/// Retry fields missing on a node are filled from `defaults`.
pub fn build_plan(
    definition: &WorkflowDefinition,
    instance_id: &str,
    defaults: &RetryPolicy,
) -> Result<ExecutionPlan> {
    validate_definition(definition)?;

    let order = topological_order(definition)
        .ok_or_else(|| EngineError::DefinitionInvalid("definition contains a cycle".to_string()))?;

    let mut dependencies: HashMap<&str, Vec<String>> = HashMap::new();
    let mut parallel_groups: HashMap<&str, String> = HashMap::new();

    for edge in &definition.edges {
        let deps = dependencies.entry(edge.to.as_str()).or_default();
        if !deps.contains(&edge.from) {
            deps.push(edge.from.clone());
        }

        let from_parallel = definition
            .get_node(&edge.from)
            .map(|n| n.node_type == NodeType::Parallel)
            .unwrap_or(false);
        if from_parallel {
            parallel_groups
                .entry(edge.to.as_str())
                .or_insert_with(|| format!("parallel_{}", edge.from));
        }
    }

    let mut steps = Vec::with_capacity(order.len());
    for node_id in &order {
        let node = definition
            .get_node(node_id)
            .ok_or_else(|| EngineError::DefinitionInvalid(format!("unknown node '{}'", node_id)))?;

        steps.push(ExecutionStep {
            node_id: node.id.clone(),
            node_type: node.node_type,
            dependencies: dependencies.remove(node.id.as_str()).unwrap_or_default(),
            parallel_group: parallel_groups.get(node.id.as_str()).cloned(),
            estimated_duration: node.estimated_duration_ms(),
            retry_policy: node.retry_policy(defaults),
        });
    }

    let critical_path = longest_path(&steps);
    let total_estimated_duration = steps
        .iter()
        .fold(0u64, |acc, s| acc.saturating_add(s.estimated_duration));

    info!(
        "Execution plan for instance {}: {} steps, critical path {:?}",
        instance_id,
        steps.len(),
        critical_path
    );

    Ok(ExecutionPlan {
        execution_steps: steps,
        critical_path,
        total_estimated_duration,
    })
}

/// Longest duration-weighted path over steps given in topological order.
fn longest_path(steps: &[ExecutionStep]) -> Vec<String> {
    let index: HashMap<&str, usize> = steps
        .iter()
        .enumerate()
        .map(|(i, s)| (s.node_id.as_str(), i))
        .collect();

    // (accumulated duration ending at node, predecessor on that path)
    let mut best: Vec<(u64, Option<usize>)> = Vec::with_capacity(steps.len());

    for step in steps {
        let mut entry = (step.estimated_duration, None);
        for dep in &step.dependencies {
            if let Some(&d) = index.get(dep.as_str()) {
                let candidate = best[d].0.saturating_add(step.estimated_duration);
                if candidate > entry.0 {
                    entry = (candidate, Some(d));
                }
            }
        }
        best.push(entry);
    }

    let Some(mut current) = best
        .iter()
        .enumerate()
        .max_by(|(ia, a), (ib, b)| a.0.cmp(&b.0).then(ib.cmp(ia)))
        .map(|(i, _)| i)
    else {
        return Vec::new();
    };

    let mut path = vec![steps[current].node_id.clone()];
    while let Some(prev) = best[current].1 {
        path.push(steps[prev].node_id.clone());
        current = prev;
    }
    path.reverse();

    debug!("Critical path: {:?}", path);
    path
}
