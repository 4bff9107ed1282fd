//! Instance and Node State
//!
//! Runtime records the engine persists through the repositories:
//! one [`WorkflowInstance`] per execution of a definition and one
//! [`NodeState`] row per `(instance, node)` pair.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::model::NodeType;
use super::planner::ExecutionPlan;

/// Lifecycle status of a workflow instance.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    Initiated,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
    Terminated,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initiated => "INITIATED",
            Self::Running => "RUNNING",
            Self::Paused => "PAUSED",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
            Self::Terminated => "TERMINATED",
        }
    }

    /// No further scheduling happens in a terminal status without an explicit retry.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Terminated
        )
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Execution status of a single node.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One execution of a workflow definition.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowInstance {
    pub id: String,
    pub definition_id: String,
    pub status: InstanceStatus,

    /// Computed on start and on every instance-level retry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_plan: Option<ExecutionPlan>,

    pub progress_percentage: f64,
    pub retry_count: u32,

    /// Input handed to the start nodes
    #[serde(default)]
    pub input: Value,

    pub created_date: DateTime<Utc>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub last_activity_date: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    pub pause_reason: Option<String>,
}

impl WorkflowInstance {
    /// Creates an `INITIATED` instance with a random id.
    pub fn new(definition_id: impl Into<String>, input: Value) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), definition_id, input)
    }

    pub fn with_id(id: impl Into<String>, definition_id: impl Into<String>, input: Value) -> Self {
        Self {
            id: id.into(),
            definition_id: definition_id.into(),
            status: InstanceStatus::Initiated,
            execution_plan: None,
            progress_percentage: 0.0,
            retry_count: 0,
            input,
            created_date: Utc::now(),
            start_date: None,
            end_date: None,
            last_activity_date: None,
            failure_reason: None,
            pause_reason: None,
        }
    }

    /// Records activity on the instance.
    pub fn touch(&mut self) {
        self.last_activity_date = Some(Utc::now());
    }

    /// Moves the instance into a terminal status, stamping the end date.
    pub fn finish(&mut self, status: InstanceStatus, failure_reason: Option<String>) {
        self.status = status;
        self.end_date = Some(Utc::now());
        self.failure_reason = failure_reason;
        if status == InstanceStatus::Completed {
            self.progress_percentage = 100.0;
        }
        self.touch();
    }
}

/// Persisted execution state of one node within one instance.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct NodeState {
    pub instance_id: String,
    pub node_id: String,
    pub node_type: NodeType,
    pub status: NodeStatus,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub input: Value,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub duration_ms: Option<u64>,

    /// Retries consumed so far in the current instance attempt
    pub retry_count: u32,
}

impl NodeState {
    pub fn new(instance_id: &str, node_id: &str, node_type: NodeType) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            node_id: node_id.to_string(),
            node_type,
            status: NodeStatus::Pending,
            start_date: None,
            end_date: None,
            input: Value::Null,
            output: None,
            error: None,
            duration_ms: None,
            retry_count: 0,
        }
    }

    pub fn mark_running(&mut self, input: Value, retry_count: u32) {
        self.status = NodeStatus::Running;
        self.start_date = Some(Utc::now());
        self.end_date = None;
        self.input = input;
        self.error = None;
        self.retry_count = retry_count;
    }

    pub fn mark_completed(&mut self, output: Value, duration_ms: u64) {
        self.status = NodeStatus::Completed;
        self.end_date = Some(Utc::now());
        self.output = Some(output);
        self.error = None;
        self.duration_ms = Some(duration_ms);
    }

    pub fn mark_failed(&mut self, error: impl Into<String>, duration_ms: u64) {
        self.status = NodeStatus::Failed;
        self.end_date = Some(Utc::now());
        self.error = Some(error.into());
        self.duration_ms = Some(duration_ms);
    }

    pub fn mark_cancelled(&mut self) {
        self.status = NodeStatus::Cancelled;
        self.end_date = Some(Utc::now());
    }

    /// Puts the row back to `PENDING` with cleared dates for an instance retry.
    pub fn reset(&mut self) {
        self.status = NodeStatus::Pending;
        self.start_date = None;
        self.end_date = None;
        self.output = None;
        self.error = None;
        self.duration_ms = None;
        self.retry_count = 0;
    }
}
