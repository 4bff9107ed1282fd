//! Workflow Data Model
//!
//! Core data structures describing a workflow definition: typed nodes,
//! edges between them and per-node retry policy.
//!
//! # Example YAML Format
//!
//! ```yaml
//! id: milestone_approval
//! name: Milestone approval
//! nodes:
//!   - id: start
//!     type: start
//!   - id: verify
//!     type: task
//!     maxRetries: 2
//!     backoffStrategy: linear
//!     retryDelay: 1000
//!     config:
//!       taskType: verification
//!       milestoneId: M-42
//!   - id: check_amount
//!     type: decision
//!     config:
//!       condition: amount > 100
//!   - id: escalate
//!     type: task
//!     config:
//!       taskType: escalation
//!   - id: end
//!     type: end
//!   - id: close
//!     type: end
//! edges:
//!   - { from: start, to: verify }
//!   - { from: verify, to: check_amount }
//!   - { from: check_amount, to: escalate, condition: true }
//!   - { from: check_amount, to: close, condition: false }
//!   - { from: escalate, to: end }
//! ```

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Kind of a node in the workflow graph.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Start,
    Task,
    Decision,
    Parallel,
    Merge,
    End,
}

impl NodeType {
    /// Returns the lowercase name used in definition files.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Task => "task",
            Self::Decision => "decision",
            Self::Parallel => "parallel",
            Self::Merge => "merge",
            Self::End => "end",
        }
    }

    /// Default duration estimate in milliseconds.
    pub fn default_duration_ms(&self) -> u64 {
        match self {
            Self::Start | Self::Parallel | Self::Merge | Self::End => 1_000,
            Self::Decision => 2_000,
            Self::Task => 5_000,
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// External collaborator a task node delegates to.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Verification,
    EvidenceCollection,
    Escalation,
    Notification,
    Approval,
}

impl TaskKind {
    pub const ALL: [TaskKind; 5] = [
        Self::Verification,
        Self::EvidenceCollection,
        Self::Escalation,
        Self::Notification,
        Self::Approval,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Verification => "verification",
            Self::EvidenceCollection => "evidence_collection",
            Self::Escalation => "escalation",
            Self::Notification => "notification",
            Self::Approval => "approval",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "verification" => Ok(Self::Verification),
            "evidence_collection" | "evidence" => Ok(Self::EvidenceCollection),
            "escalation" => Ok(Self::Escalation),
            "notification" => Ok(Self::Notification),
            "approval" => Ok(Self::Approval),
            other => Err(format!("Unknown task type '{}'", other)),
        }
    }
}

/// How the delay between retries grows.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    Linear,
    #[default]
    Exponential,
}

/// Retry settings resolved for one node.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_strategy: BackoffStrategy,
    /// Base delay in milliseconds
    pub retry_delay: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_strategy: BackoffStrategy::Exponential,
            retry_delay: 5_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt numbered `retry_count` (1 for the first retry).
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let millis = match self.backoff_strategy {
            BackoffStrategy::Linear => self.retry_delay.saturating_mul(u64::from(retry_count)),
            BackoffStrategy::Exponential => {
                let factor = 2u64.checked_pow(retry_count).unwrap_or(u64::MAX);
                self.retry_delay.saturating_mul(factor)
            }
        };
        Duration::from_millis(millis)
    }
}

/// A single typed node of a workflow graph.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    /// Unique identifier within the definition
    pub id: String,

    #[serde(rename = "type")]
    pub node_type: NodeType,

    /// Optional display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Free-form per-node configuration (task parameters, condition, timeout)
    #[serde(default, alias = "data", skip_serializing_if = "Map::is_empty")]
    pub config: Map<String, Value>,

    #[serde(default, alias = "max_retries", skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,

    #[serde(default, alias = "backoff_strategy", skip_serializing_if = "Option::is_none")]
    pub backoff_strategy: Option<BackoffStrategy>,

    /// Base retry delay in milliseconds
    #[serde(default, alias = "retry_delay", skip_serializing_if = "Option::is_none")]
    pub retry_delay: Option<u64>,
}

impl Node {
    /// Creates a node with empty configuration.
    pub fn new(id: impl Into<String>, node_type: NodeType) -> Self {
        Self {
            id: id.into().trim().to_string(),
            node_type,
            name: None,
            config: Map::new(),
            max_retries: None,
            backoff_strategy: None,
            retry_delay: None,
        }
    }

    pub fn start(id: impl Into<String>) -> Self {
        Self::new(id, NodeType::Start)
    }

    pub fn end(id: impl Into<String>) -> Self {
        Self::new(id, NodeType::End)
    }

    pub fn parallel(id: impl Into<String>) -> Self {
        Self::new(id, NodeType::Parallel)
    }

    pub fn merge(id: impl Into<String>) -> Self {
        Self::new(id, NodeType::Merge)
    }

    /// Creates a task node delegating to `kind`.
    ///
    /// # Example
    ///
    /// ```
    /// use milestone_flow::workflow::{Node, TaskKind, BackoffStrategy};
    ///
    /// let node = Node::task("verify", TaskKind::Verification)
    ///     .with_config("milestoneId", "M-1")
    ///     .with_retry(2, BackoffStrategy::Linear, 1000);
    /// assert_eq!(node.task_type(), Some("verification"));
    /// ```
    pub fn task(id: impl Into<String>, kind: TaskKind) -> Self {
        Self::new(id, NodeType::Task).with_config("taskType", kind.as_str())
    }

    /// Creates a decision node evaluating `condition` against its input.
    pub fn decision(id: impl Into<String>, condition: impl Into<String>) -> Self {
        Self::new(id, NodeType::Decision).with_config("condition", condition.into())
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets a configuration entry.
    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    /// Sets the retry policy fields.
    pub fn with_retry(mut self, max_retries: u32, backoff: BackoffStrategy, delay_ms: u64) -> Self {
        self.max_retries = Some(max_retries);
        self.backoff_strategy = Some(backoff);
        self.retry_delay = Some(delay_ms);
        self
    }

    /// Sets the execution timeout in milliseconds.
    pub fn with_timeout(self, timeout_ms: u64) -> Self {
        self.with_config("timeout", timeout_ms)
    }

    /// Returns a string configuration value.
    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(Value::as_str)
    }

    fn config_u64(&self, key: &str) -> Option<u64> {
        self.config.get(key).and_then(Value::as_u64)
    }

    /// Task type name from `taskType` (or `task_type`).
    pub fn task_type(&self) -> Option<&str> {
        self.config_str("taskType")
            .or_else(|| self.config_str("task_type"))
    }

    /// Decision condition expression.
    pub fn condition(&self) -> Option<&str> {
        self.config_str("condition")
    }

    /// Execution timeout in milliseconds, if configured.
    pub fn timeout_ms(&self) -> Option<u64> {
        self.config_u64("timeout")
    }

    /// Estimated duration: config override, else the per-type default.
    pub fn estimated_duration_ms(&self) -> u64 {
        self.config_u64("estimatedDuration")
            .or_else(|| self.config_u64("estimated_duration"))
            .unwrap_or_else(|| self.node_type.default_duration_ms())
    }

    /// Resolves the retry policy, filling gaps from `defaults`.
    pub fn retry_policy(&self, defaults: &RetryPolicy) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries.unwrap_or(defaults.max_retries),
            backoff_strategy: self.backoff_strategy.unwrap_or(defaults.backoff_strategy),
            retry_delay: self.retry_delay.unwrap_or(defaults.retry_delay),
        }
    }
}

/// A directed edge, optionally tagged with the decision outcome it follows.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Edge {
    pub from: String,
    pub to: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<bool>,
}

impl Edge {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            condition: None,
        }
    }

    /// Edge taken only when the source decision evaluates to `outcome`.
    pub fn when(from: impl Into<String>, to: impl Into<String>, outcome: bool) -> Self {
        Self {
            condition: Some(outcome),
            ..Self::new(from, to)
        }
    }
}

/// Immutable graph description authored outside the engine.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct WorkflowDefinition {
    /// Falls back to the file stem when loaded from disk without one
    #[serde(default)]
    pub id: String,

    #[serde(default)]
    pub name: String,

    #[serde(default = "default_version")]
    pub version: u32,

    pub nodes: Vec<Node>,

    #[serde(default)]
    pub edges: Vec<Edge>,
}

fn default_version() -> u32 {
    1
}

impl WorkflowDefinition {
    /// Creates an empty definition.
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            version: 1,
            nodes: Vec::new(),
            edges: Vec::new(),
        }
    }

    /// Builder: appends a node.
    pub fn with_node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    /// Builder: appends an edge.
    pub fn with_edge(mut self, edge: Edge) -> Self {
        self.edges.push(edge);
        self
    }

    /// Adds a node, rejecting duplicate ids.
    pub fn add_node(&mut self, node: Node) -> Result<(), String> {
        if self.nodes.iter().any(|n| n.id == node.id) {
            return Err(format!("Node '{}' already exists", node.id));
        }
        self.nodes.push(node);
        Ok(())
    }

    /// Connects two existing nodes.
    pub fn connect(&mut self, from: &str, to: &str) -> Result<(), String> {
        for id in [from, to] {
            if self.get_node(id).is_none() {
                return Err(format!("Node '{}' not found", id));
            }
        }
        self.edges.push(Edge::new(from, to));
        Ok(())
    }

    pub fn get_node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Outgoing edges of a node, in definition order.
    pub fn outgoing(&self, id: &str) -> impl Iterator<Item = &Edge> {
        let id = id.to_string();
        self.edges.iter().filter(move |e| e.from == id)
    }

    /// Direct successor ids, deduplicated, in definition order.
    pub fn successors(&self, id: &str) -> Vec<String> {
        let mut seen = HashSet::new();
        self.outgoing(id)
            .filter(|e| seen.insert(e.to.clone()))
            .map(|e| e.to.clone())
            .collect()
    }

    /// Direct predecessor ids, deduplicated, in definition order.
    pub fn predecessors(&self, id: &str) -> Vec<String> {
        let mut seen = HashSet::new();
        self.edges
            .iter()
            .filter(|e| e.to == id && seen.insert(e.from.clone()))
            .map(|e| e.from.clone())
            .collect()
    }

    /// Nodes typed `start`.
    pub fn start_nodes(&self) -> Vec<&Node> {
        self.nodes
            .iter()
            .filter(|n| n.node_type == NodeType::Start)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linear() -> WorkflowDefinition {
        WorkflowDefinition::new("linear")
            .with_node(Node::start("start"))
            .with_node(Node::task("a", TaskKind::Verification))
            .with_node(Node::end("end"))
            .with_edge(Edge::new("start", "a"))
            .with_edge(Edge::new("a", "end"))
    }

    #[test]
    fn test_node_builders() {
        let node = Node::task("verify", TaskKind::EvidenceCollection)
            .with_name("Collect evidence")
            .with_timeout(1500);

        assert_eq!(node.node_type, NodeType::Task);
        assert_eq!(node.task_type(), Some("evidence_collection"));
        assert_eq!(node.timeout_ms(), Some(1500));
        assert_eq!(node.name.as_deref(), Some("Collect evidence"));
    }

    #[test]
    fn test_decision_condition() {
        let node = Node::decision("check", "amount > 100");
        assert_eq!(node.condition(), Some("amount > 100"));
        assert_eq!(node.node_type, NodeType::Decision);
    }

    #[test]
    fn test_estimated_duration_defaults() {
        assert_eq!(Node::start("s").estimated_duration_ms(), 1_000);
        assert_eq!(Node::decision("d", "true").estimated_duration_ms(), 2_000);
        assert_eq!(Node::task("t", TaskKind::Approval).estimated_duration_ms(), 5_000);

        let custom = Node::task("t", TaskKind::Approval).with_config("estimatedDuration", 42u64);
        assert_eq!(custom.estimated_duration_ms(), 42);
    }

    #[test]
    fn test_retry_policy_resolution() {
        let defaults = RetryPolicy::default();
        let node = Node::task("t", TaskKind::Notification);
        assert_eq!(node.retry_policy(&defaults), defaults);

        let node = node.with_retry(2, BackoffStrategy::Linear, 10);
        let policy = node.retry_policy(&defaults);
        assert_eq!(policy.max_retries, 2);
        assert_eq!(policy.backoff_strategy, BackoffStrategy::Linear);
        assert_eq!(policy.retry_delay, 10);
    }

    #[test]
    fn test_backoff_delays() {
        let linear = RetryPolicy {
            max_retries: 3,
            backoff_strategy: BackoffStrategy::Linear,
            retry_delay: 100,
        };
        assert_eq!(linear.delay_for(1), Duration::from_millis(100));
        assert_eq!(linear.delay_for(3), Duration::from_millis(300));

        let exponential = RetryPolicy {
            backoff_strategy: BackoffStrategy::Exponential,
            ..linear
        };
        assert_eq!(exponential.delay_for(1), Duration::from_millis(200));
        assert_eq!(exponential.delay_for(3), Duration::from_millis(800));
    }

    #[test]
    fn test_backoff_saturates() {
        let policy = RetryPolicy {
            max_retries: 100,
            backoff_strategy: BackoffStrategy::Exponential,
            retry_delay: u64::MAX / 2,
        };
        assert_eq!(policy.delay_for(80), Duration::from_millis(u64::MAX));
    }

    #[test]
    fn test_task_kind_parsing() {
        assert_eq!("verification".parse::<TaskKind>(), Ok(TaskKind::Verification));
        assert_eq!("Evidence".parse::<TaskKind>(), Ok(TaskKind::EvidenceCollection));
        assert!("teleport".parse::<TaskKind>().is_err());

        for kind in TaskKind::ALL {
            assert_eq!(kind.as_str().parse::<TaskKind>(), Ok(kind));
        }
    }

    #[test]
    fn test_successors_and_predecessors() {
        let def = linear();
        assert_eq!(def.successors("start"), vec!["a"]);
        assert_eq!(def.predecessors("end"), vec!["a"]);
        assert!(def.successors("end").is_empty());
        assert_eq!(def.start_nodes().len(), 1);
    }

    #[test]
    fn test_add_node_duplicate() {
        let mut def = WorkflowDefinition::new("wf");
        assert!(def.add_node(Node::start("s")).is_ok());
        assert!(def.add_node(Node::start("s")).is_err());
        assert_eq!(def.len(), 1);
    }

    #[test]
    fn test_connect_unknown_node() {
        let mut def = WorkflowDefinition::new("wf");
        def.add_node(Node::start("s")).unwrap();
        assert!(def.connect("s", "ghost").is_err());
        assert!(def.edges.is_empty());
    }

    #[test]
    fn test_node_deserialize_camel_case() {
        let json = r#"{
            "id": "t",
            "type": "task",
            "maxRetries": 2,
            "backoffStrategy": "linear",
            "retryDelay": 50,
            "data": { "taskType": "approval" }
        }"#;
        let node: Node = serde_json::from_str(json).unwrap();
        assert_eq!(node.max_retries, Some(2));
        assert_eq!(node.backoff_strategy, Some(BackoffStrategy::Linear));
        assert_eq!(node.retry_delay, Some(50));
        assert_eq!(node.task_type(), Some("approval"));
    }

    #[test]
    fn test_edge_condition_serialization() {
        let edge = Edge::when("d", "x", true);
        let json = serde_json::to_value(&edge).unwrap();
        assert_eq!(json["condition"], Value::Bool(true));

        let plain = serde_json::to_value(Edge::new("a", "b")).unwrap();
        assert!(plain.get("condition").is_none());
    }
}
