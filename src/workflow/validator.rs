//! Definition Validation
//!
//! Structural checks run before an execution plan is built:
//! - Node field and id validation
//! - Edge reference integrity
//! - Reachability from start nodes
//! - Cycle detection via topological sorting
//! - Per-type configuration (decision conditions, task kinds)

use std::collections::{HashMap, HashSet, VecDeque};

use log::{debug, info};

use super::expression;
use super::model::{Node, NodeType, TaskKind, WorkflowDefinition};
use crate::error::{EngineError, Result};

/// Validation error types for user-friendly error messages.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    EmptyDefinition,
    EmptyNodeId,
    DuplicateNodeId(String),
    NoStartNode,
    DanglingEdge { from: String, to: String, missing: String },
    Unreachable(String),
    CyclicDependency,
    StartHasIncoming(String),
    EndHasOutgoing(String),
    MissingCondition(String),
    InvalidCondition { node: String, reason: String },
    MissingTaskType(String),
    UnknownTaskType { node: String, task_type: String },
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyDefinition => write!(f, "Definition has no nodes"),
            Self::EmptyNodeId => write!(f, "Node has empty or whitespace-only ID"),
            Self::DuplicateNodeId(id) => write!(f, "Duplicate node ID: '{}'", id),
            Self::NoStartNode => write!(f, "Definition has no start node"),
            Self::DanglingEdge { from, to, missing } => {
                write!(f, "Edge {} -> {} references unknown node '{}'", from, to, missing)
            }
            Self::Unreachable(id) => write!(f, "Node '{}' is unreachable from any start node", id),
            Self::CyclicDependency => {
                write!(f, "Definition contains a cycle (nodes depend on each other in a loop)")
            }
            Self::StartHasIncoming(id) => write!(f, "Start node '{}' has incoming edges", id),
            Self::EndHasOutgoing(id) => write!(f, "End node '{}' has outgoing edges", id),
            Self::MissingCondition(id) => write!(f, "Decision node '{}' has no condition", id),
            Self::InvalidCondition { node, reason } => {
                write!(f, "Decision node '{}' has an invalid condition: {}", node, reason)
            }
            Self::MissingTaskType(id) => write!(f, "Task node '{}' has no taskType", id),
            Self::UnknownTaskType { node, task_type } => {
                write!(f, "Task node '{}' has unknown taskType '{}'", node, task_type)
            }
        }
    }
}

/// Validates node-level configuration.
fn validate_node(node: &Node) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if node.id.trim().is_empty() {
        errors.push(ValidationError::EmptyNodeId);
        return errors;
    }

    match node.node_type {
        NodeType::Decision => match node.condition() {
            None => errors.push(ValidationError::MissingCondition(node.id.clone())),
            Some(condition) => {
                if let Err(e) = expression::parse(condition) {
                    errors.push(ValidationError::InvalidCondition {
                        node: node.id.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        },
        NodeType::Task => match node.task_type() {
            None => errors.push(ValidationError::MissingTaskType(node.id.clone())),
            Some(task_type) => {
                if task_type.parse::<TaskKind>().is_err() {
                    errors.push(ValidationError::UnknownTaskType {
                        node: node.id.clone(),
                        task_type: task_type.to_string(),
                    });
                }
            }
        },
        _ => {}
    }

    errors
}

/// Collects every validation error in a definition.
///
/// Performs the following checks:
/// 1. Definition is not empty
/// 2. No empty or duplicate node IDs
/// 3. Every edge references existing nodes
/// 4. At least one start node; start nodes have no incoming edges,
///    end nodes no outgoing edges
/// 5. Every node is reachable from a start node
/// 6. No cycles
/// 7. Decision and task nodes carry valid configuration
pub fn collect_errors(definition: &WorkflowDefinition) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if definition.nodes.is_empty() {
        errors.push(ValidationError::EmptyDefinition);
        return errors;
    }

    let mut ids: HashSet<&str> = HashSet::new();
    for node in &definition.nodes {
        if !node.id.trim().is_empty() && !ids.insert(node.id.as_str()) {
            errors.push(ValidationError::DuplicateNodeId(node.id.clone()));
        }
        errors.extend(validate_node(node));
    }

    for edge in &definition.edges {
        for endpoint in [&edge.from, &edge.to] {
            if !ids.contains(endpoint.as_str()) {
                errors.push(ValidationError::DanglingEdge {
                    from: edge.from.clone(),
                    to: edge.to.clone(),
                    missing: endpoint.clone(),
                });
            }
        }
    }

    let starts = definition.start_nodes();
    if starts.is_empty() {
        errors.push(ValidationError::NoStartNode);
    }

    for node in &definition.nodes {
        match node.node_type {
            NodeType::Start if definition.edges.iter().any(|e| e.to == node.id) => {
                errors.push(ValidationError::StartHasIncoming(node.id.clone()));
            }
            NodeType::End if definition.edges.iter().any(|e| e.from == node.id) => {
                errors.push(ValidationError::EndHasOutgoing(node.id.clone()));
            }
            _ => {}
        }
    }

    // Structural errors make reachability and ordering meaningless
    if !errors.is_empty() {
        return errors;
    }

    let reachable = reachable_from_starts(definition);
    for node in &definition.nodes {
        if !reachable.contains(node.id.as_str()) {
            errors.push(ValidationError::Unreachable(node.id.clone()));
        }
    }

    if topological_order(definition).is_none() {
        errors.push(ValidationError::CyclicDependency);
    }

    errors
}

/// Validates a definition, joining all problems into `DefinitionInvalid`.
pub fn validate_definition(definition: &WorkflowDefinition) -> Result<()> {
    info!(
        "Validating definition '{}' with {} nodes, {} edges",
        definition.id,
        definition.nodes.len(),
        definition.edges.len()
    );

    let errors = collect_errors(definition);
    if !errors.is_empty() {
        let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
        return Err(EngineError::DefinitionInvalid(messages.join("\n")));
    }

    debug!("Definition '{}' is valid", definition.id);
    Ok(())
}

/// Breadth-first walk from every start node.
fn reachable_from_starts(definition: &WorkflowDefinition) -> HashSet<&str> {
    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
    for edge in &definition.edges {
        adjacency.entry(edge.from.as_str()).or_default().push(edge.to.as_str());
    }

    let mut seen: HashSet<&str> = HashSet::new();
    let mut queue: VecDeque<&str> = definition
        .start_nodes()
        .into_iter()
        .map(|n| n.id.as_str())
        .collect();

    while let Some(current) = queue.pop_front() {
        if !seen.insert(current) {
            continue;
        }
        if let Some(next) = adjacency.get(current) {
            queue.extend(next.iter().copied());
        }
    }

    seen
}

/// Topological order of node ids using Kahn's algorithm.
///
/// Returns `None` when the graph contains a cycle. Ties are broken by
/// definition order so the result is deterministic.
pub fn topological_order(definition: &WorkflowDefinition) -> Option<Vec<String>> {
    let mut in_degree: HashMap<&str, usize> = definition
        .nodes
        .iter()
        .map(|n| (n.id.as_str(), 0))
        .collect();

    for node in &definition.nodes {
        for succ in definition.successors(&node.id) {
            if let Some(degree) = in_degree.get_mut(succ.as_str()) {
                *degree += 1;
            }
        }
    }

    let mut queue: VecDeque<&str> = definition
        .nodes
        .iter()
        .filter(|n| in_degree.get(n.id.as_str()) == Some(&0))
        .map(|n| n.id.as_str())
        .collect();

    let mut order = Vec::with_capacity(definition.nodes.len());

    while let Some(current) = queue.pop_front() {
        order.push(current.to_string());

        for succ in definition.successors(current) {
            if let Some((id, degree)) = in_degree.get_key_value(succ.as_str()).map(|(k, v)| (*k, *v)) {
                let remaining = degree - 1;
                in_degree.insert(id, remaining);
                if remaining == 0 {
                    queue.push_back(id);
                }
            }
        }
    }

    if order.len() != definition.nodes.len() {
        return None;
    }

    debug!("Topological order: {:?}", order);
    Some(order)
}
