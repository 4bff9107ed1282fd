//! External Collaborators
//!
//! Narrow async interfaces to the business services task nodes delegate
//! to, plus the sink the engine announces instance events through. The
//! simulated implementations log and return generated ids; they back the
//! CLI runner.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use log::info;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::Result;

/// Identifier and status returned by a delegate that creates a record.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DelegateRecord {
    pub id: String,
    pub status: String,
}

/// Business services invoked by task nodes.
///
/// Each call is a single suspend point; an `Err` becomes a node failure.
#[async_trait]
pub trait TaskDelegates: Send + Sync {
    async fn create_verification(&self, params: Value) -> Result<DelegateRecord>;

    async fn create_evidence(&self, params: Value) -> Result<DelegateRecord>;

    async fn create_escalation(&self, params: Value) -> Result<DelegateRecord>;

    /// Sends a notification email; returns once accepted.
    async fn send_notification(&self, payload: Value) -> Result<()>;
}

/// Instance-level events announced by the engine.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceEventKind {
    Paused,
    Resumed,
    Cancelled,
    Completed,
    Failed,
}

impl InstanceEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Paused => "WORKFLOW_PAUSED",
            Self::Resumed => "WORKFLOW_RESUMED",
            Self::Cancelled => "WORKFLOW_CANCELLED",
            Self::Completed => "WORKFLOW_COMPLETED",
            Self::Failed => "WORKFLOW_FAILED",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::Paused => "Workflow Paused",
            Self::Resumed => "Workflow Resumed",
            Self::Cancelled => "Workflow Cancelled",
            Self::Completed => "Workflow Completed",
            Self::Failed => "Workflow Failed",
        }
    }
}

impl fmt::Display for InstanceEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct InstanceEvent {
    pub kind: InstanceEventKind,
    pub instance_id: String,
    pub title: String,
    pub message: String,
    pub data: Value,
}

impl InstanceEvent {
    pub fn new(kind: InstanceEventKind, instance_id: &str, message: impl Into<String>) -> Self {
        Self {
            kind,
            instance_id: instance_id.to_string(),
            title: kind.title().to_string(),
            message: message.into(),
            data: json!({ "instanceId": instance_id }),
        }
    }

    pub fn with_data(mut self, key: &str, value: impl Into<Value>) -> Self {
        if let Value::Object(map) = &mut self.data {
            map.insert(key.to_string(), value.into());
        }
        self
    }
}

/// Receives instance events. Failures are logged by the engine, never fatal.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, event: InstanceEvent) -> Result<()>;
}

/// Delegates that log each call and hand back a fresh id.
#[derive(Debug, Clone, Default)]
pub struct SimulatedDelegates {
    latency: Duration,
}

impl SimulatedDelegates {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a fixed delay to every call.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    async fn create(&self, what: &str, params: &Value) -> Result<DelegateRecord> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let record = DelegateRecord {
            id: Uuid::new_v4().to_string(),
            status: "PENDING".to_string(),
        };
        info!("Created {} {} with {}", what, record.id, params);
        Ok(record)
    }
}

#[async_trait]
impl TaskDelegates for SimulatedDelegates {
    async fn create_verification(&self, params: Value) -> Result<DelegateRecord> {
        self.create("verification", &params).await
    }

    async fn create_evidence(&self, params: Value) -> Result<DelegateRecord> {
        self.create("evidence", &params).await
    }

    async fn create_escalation(&self, params: Value) -> Result<DelegateRecord> {
        self.create("escalation", &params).await
    }

    async fn send_notification(&self, payload: Value) -> Result<()> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        info!("Sent notification: {}", payload);
        Ok(())
    }
}

/// Sink that writes events to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotificationSink;

#[async_trait]
impl NotificationSink for LogNotificationSink {
    async fn notify(&self, event: InstanceEvent) -> Result<()> {
        info!("[{}] {}: {}", event.kind, event.title, event.message);
        Ok(())
    }
}

/// Scripted collaborators for engine tests.
#[cfg(test)]
pub(crate) mod scripted {
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::Value;

    use super::{DelegateRecord, InstanceEvent, InstanceEventKind, NotificationSink, TaskDelegates};
    use crate::error::{EngineError, Result};

    #[derive(Debug, Clone, Copy)]
    pub enum Behavior {
        Succeed,
        Fail,
        /// Fails the first n calls for a node, then succeeds
        FailTimes(u32),
        Delay(Duration),
    }

    #[derive(Default)]
    struct Counters {
        calls: HashMap<String, u32>,
        in_flight: HashMap<String, u32>,
        max_in_flight: HashMap<String, u32>,
    }

    /// Delegates whose behavior is chosen per node id.
    pub struct ScriptedDelegates {
        default: Behavior,
        overrides: HashMap<String, Behavior>,
        counters: Mutex<Counters>,
    }

    struct InFlight<'a> {
        delegates: &'a ScriptedDelegates,
        node: String,
    }

    impl Drop for InFlight<'_> {
        fn drop(&mut self) {
            let mut counters = self.delegates.counters.lock().unwrap();
            if let Some(n) = counters.in_flight.get_mut(&self.node) {
                *n = n.saturating_sub(1);
            }
        }
    }

    impl ScriptedDelegates {
        pub fn new(default: Behavior) -> Self {
            Self {
                default,
                overrides: HashMap::new(),
                counters: Mutex::new(Counters::default()),
            }
        }

        pub fn with(mut self, node_id: &str, behavior: Behavior) -> Self {
            self.overrides.insert(node_id.to_string(), behavior);
            self
        }

        pub fn calls(&self, node_id: &str) -> u32 {
            self.counters.lock().unwrap().calls.get(node_id).copied().unwrap_or(0)
        }

        pub fn max_in_flight(&self, node_id: &str) -> u32 {
            self.counters
                .lock()
                .unwrap()
                .max_in_flight
                .get(node_id)
                .copied()
                .unwrap_or(0)
        }

        async fn run(&self, params: &Value) -> Result<DelegateRecord> {
            let node = params
                .get("nodeId")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();

            let call = {
                let mut counters = self.counters.lock().unwrap();
                let calls = counters.calls.entry(node.clone()).or_insert(0);
                *calls += 1;
                let call = *calls;
                let in_flight = counters.in_flight.entry(node.clone()).or_insert(0);
                *in_flight += 1;
                let current = *in_flight;
                let max = counters.max_in_flight.entry(node.clone()).or_insert(0);
                *max = (*max).max(current);
                call
            };
            let _guard = InFlight {
                delegates: self,
                node: node.clone(),
            };

            let behavior = self.overrides.get(&node).copied().unwrap_or(self.default);
            match behavior {
                Behavior::Succeed => {}
                Behavior::Fail => return Err(EngineError::Delegate(format!("{} rejected", node))),
                Behavior::FailTimes(n) if call <= n => {
                    return Err(EngineError::Delegate(format!("{} attempt {} rejected", node, call)))
                }
                Behavior::FailTimes(_) => {}
                Behavior::Delay(d) => tokio::time::sleep(d).await,
            }

            Ok(DelegateRecord {
                id: format!("{}-{}", node, call),
                status: "PENDING".to_string(),
            })
        }
    }

    #[async_trait]
    impl TaskDelegates for ScriptedDelegates {
        async fn create_verification(&self, params: Value) -> Result<DelegateRecord> {
            self.run(&params).await
        }

        async fn create_evidence(&self, params: Value) -> Result<DelegateRecord> {
            self.run(&params).await
        }

        async fn create_escalation(&self, params: Value) -> Result<DelegateRecord> {
            self.run(&params).await
        }

        async fn send_notification(&self, payload: Value) -> Result<()> {
            self.run(&payload).await.map(|_| ())
        }
    }

    /// Sink that keeps every event.
    #[derive(Default)]
    pub struct RecordingSink {
        events: Mutex<Vec<InstanceEvent>>,
    }

    impl RecordingSink {
        pub fn kinds(&self) -> Vec<InstanceEventKind> {
            self.events.lock().unwrap().iter().map(|e| e.kind).collect()
        }
    }

    #[async_trait]
    impl NotificationSink for RecordingSink {
        async fn notify(&self, event: InstanceEvent) -> Result<()> {
            self.events.lock().unwrap().push(event);
            Ok(())
        }
    }

    /// Sink that always fails.
    pub struct BrokenSink;

    #[async_trait]
    impl NotificationSink for BrokenSink {
        async fn notify(&self, _event: InstanceEvent) -> Result<()> {
            Err(EngineError::Delegate("sink offline".to_string()))
        }
    }
}
