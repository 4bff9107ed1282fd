//! Execution Context
//!
//! The ephemeral unit of scheduled work. A context lives from the moment a
//! node becomes dispatchable until its attempt finishes.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};

use crate::workflow::NodeType;

/// Key of a node within an instance: `(instance_id, node_id)`.
pub type NodeKey = (String, String);

/// Everything a node executor needs for one attempt.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub instance_id: String,
    pub node_id: String,
    pub node_type: NodeType,

    /// Data forwarded by the predecessor (or the instance input for roots)
    pub input: Value,
    pub metadata: Map<String, Value>,

    pub start_time: Instant,
    pub started_at: DateTime<Utc>,

    pub retry_count: u32,
    pub max_retries: u32,
    pub timeout: Option<Duration>,
}

impl ExecutionContext {
    pub fn new(
        instance_id: impl Into<String>,
        node_id: impl Into<String>,
        node_type: NodeType,
        input: Value,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            node_id: node_id.into(),
            node_type,
            input,
            metadata: Map::new(),
            start_time: Instant::now(),
            started_at: Utc::now(),
            retry_count: 0,
            max_retries: 0,
            timeout: None,
        }
    }

    pub fn with_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn key(&self) -> NodeKey {
        (self.instance_id.clone(), self.node_id.clone())
    }

    /// Resets the clock at dispatch.
    pub fn restart_clock(&mut self) {
        self.start_time = Instant::now();
        self.started_at = Utc::now();
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn has_retries_left(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Context for a successor, carrying forward data and metadata.
    pub fn successor(&self, node_id: &str, node_type: NodeType, input: Value) -> Self {
        Self {
            metadata: self.metadata.clone(),
            ..Self::new(self.instance_id.clone(), node_id, node_type, input)
        }
    }
}

/// Result of one node executor attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResult {
    pub success: bool,

    /// Recorded on the node state row and in history
    pub output: Value,
    pub error: Option<String>,
    pub duration_ms: u64,

    /// Successors to enqueue
    pub next_nodes: Vec<String>,

    /// Data handed to every successor
    pub forward: Value,

    /// Set by `end` nodes
    pub completes_instance: bool,
}

impl ExecutionResult {
    pub fn success(output: Value, next_nodes: Vec<String>, forward: Value) -> Self {
        Self {
            success: true,
            output,
            error: None,
            duration_ms: 0,
            next_nodes,
            forward,
            completes_instance: false,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: Value::Null,
            error: Some(error.into()),
            duration_ms: 0,
            next_nodes: Vec::new(),
            forward: Value::Null,
            completes_instance: false,
        }
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }
}

/// Overlays the fields of `output` onto `input`.
///
/// Non-object values replace the input wholesale unless null.
pub fn overlay(input: &Value, output: &Value) -> Value {
    match (input, output) {
        (Value::Object(base), Value::Object(extra)) => {
            let mut merged = base.clone();
            for (k, v) in extra {
                merged.insert(k.clone(), v.clone());
            }
            Value::Object(merged)
        }
        (_, Value::Null) => input.clone(),
        (Value::Null, _) => output.clone(),
        (_, other) => json!({ "input": input, "result": other }),
    }
}
