//! Node Executors
//!
//! One executor per node type. Control nodes (`start`, `parallel`,
//! `merge`, `decision`, `end`) are pure functions of the definition and
//! the context; `task` nodes dispatch through a [`TaskRegistry`] that maps
//! each [`TaskKind`] to a registered [`TaskHandler`].
//!
//! Successors receive the node's input with the task output overlaid, so
//! data entered at the start of an instance stays visible to later
//! decisions.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use log::{debug, info};
use serde_json::{json, Map, Value};

use super::context::{overlay, ExecutionContext, ExecutionResult};
use super::delegates::TaskDelegates;
use crate::error::{EngineError, Result};
use crate::workflow::{expression, Node, NodeType, TaskKind, WorkflowDefinition};

/// Executes one kind of task on behalf of a task node.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Returns the task output recorded on the node state.
    async fn execute(&self, ctx: &ExecutionContext, node: &Node) -> Result<Value>;
}

/// Builds delegate parameters from node config, falling back to the
/// context input for listed keys.
fn task_params(ctx: &ExecutionContext, node: &Node, fallbacks: &[&str]) -> Value {
    let mut params: Map<String, Value> = node
        .config
        .iter()
        .filter(|(k, _)| k.as_str() != "taskType" && k.as_str() != "task_type")
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    for key in fallbacks {
        if !params.contains_key(*key) {
            if let Some(value) = ctx.input.get(*key) {
                params.insert(key.to_string(), value.clone());
            }
        }
    }

    params.insert("instanceId".into(), json!(ctx.instance_id));
    params.insert("nodeId".into(), json!(ctx.node_id));
    params.insert("attempt".into(), json!(ctx.retry_count + 1));
    Value::Object(params)
}

pub struct VerificationTask {
    delegates: Arc<dyn TaskDelegates>,
}

#[async_trait]
impl TaskHandler for VerificationTask {
    async fn execute(&self, ctx: &ExecutionContext, node: &Node) -> Result<Value> {
        let params = task_params(ctx, node, &["milestoneId", "verificationType"]);
        let record = self.delegates.create_verification(params).await?;
        Ok(json!({
            "verificationId": record.id,
            "status": record.status,
            "message": "Verification task completed",
        }))
    }
}

pub struct EvidenceCollectionTask {
    delegates: Arc<dyn TaskDelegates>,
}

#[async_trait]
impl TaskHandler for EvidenceCollectionTask {
    async fn execute(&self, ctx: &ExecutionContext, node: &Node) -> Result<Value> {
        let params = task_params(ctx, node, &["milestoneId", "title", "description"]);
        let record = self.delegates.create_evidence(params).await?;
        Ok(json!({
            "evidenceId": record.id,
            "status": record.status,
            "message": "Evidence collection task completed",
        }))
    }
}

pub struct EscalationTask {
    delegates: Arc<dyn TaskDelegates>,
}

#[async_trait]
impl TaskHandler for EscalationTask {
    async fn execute(&self, ctx: &ExecutionContext, node: &Node) -> Result<Value> {
        let params = task_params(ctx, node, &["milestoneId", "title", "severity"]);
        let record = self.delegates.create_escalation(params).await?;
        Ok(json!({
            "escalationId": record.id,
            "status": record.status,
            "message": "Escalation task completed",
        }))
    }
}

pub struct NotificationTask {
    delegates: Arc<dyn TaskDelegates>,
}

#[async_trait]
impl TaskHandler for NotificationTask {
    async fn execute(&self, ctx: &ExecutionContext, node: &Node) -> Result<Value> {
        let recipients = node.config.get("recipients").cloned().unwrap_or(json!([]));
        let payload = json!({
            "to": recipients,
            "subject": node.config.get("subject"),
            "template": node.config.get("template"),
            "data": node.config.get("data").cloned().unwrap_or_else(|| ctx.input.clone()),
            "instanceId": ctx.instance_id,
            "nodeId": ctx.node_id,
        });
        self.delegates.send_notification(payload).await?;
        Ok(json!({
            "message": "Notification task completed",
            "recipients": recipients,
        }))
    }
}

/// Approvals are verifications of type `APPROVAL`.
pub struct ApprovalTask {
    delegates: Arc<dyn TaskDelegates>,
}

#[async_trait]
impl TaskHandler for ApprovalTask {
    async fn execute(&self, ctx: &ExecutionContext, node: &Node) -> Result<Value> {
        let mut params = task_params(ctx, node, &["milestoneId"]);
        if let Value::Object(map) = &mut params {
            map.insert("verificationType".into(), json!("APPROVAL"));
        }
        let record = self.delegates.create_verification(params).await?;
        Ok(json!({
            "approvalId": record.id,
            "status": record.status,
            "message": "Approval task completed",
        }))
    }
}

/// Handlers keyed by task kind.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    handlers: HashMap<TaskKind, Arc<dyn TaskHandler>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with a handler for every kind, all backed by `delegates`.
    pub fn with_delegates(delegates: Arc<dyn TaskDelegates>) -> Self {
        let mut registry = Self::new();
        registry.register(
            TaskKind::Verification,
            Arc::new(VerificationTask { delegates: Arc::clone(&delegates) }),
        );
        registry.register(
            TaskKind::EvidenceCollection,
            Arc::new(EvidenceCollectionTask { delegates: Arc::clone(&delegates) }),
        );
        registry.register(
            TaskKind::Escalation,
            Arc::new(EscalationTask { delegates: Arc::clone(&delegates) }),
        );
        registry.register(
            TaskKind::Notification,
            Arc::new(NotificationTask { delegates: Arc::clone(&delegates) }),
        );
        registry.register(TaskKind::Approval, Arc::new(ApprovalTask { delegates }));
        registry
    }

    /// Registers or replaces the handler for `kind`.
    pub fn register(&mut self, kind: TaskKind, handler: Arc<dyn TaskHandler>) {
        self.handlers.insert(kind, handler);
    }

    pub fn get(&self, kind: TaskKind) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(&kind).cloned()
    }

    /// Fails with `DefinitionInvalid` if a task node has no handler.
    pub fn check_definition(&self, definition: &WorkflowDefinition) -> Result<()> {
        let mut missing = Vec::new();
        for node in definition.nodes.iter().filter(|n| n.node_type == NodeType::Task) {
            let kind = resolve_kind(node)?;
            if !self.handlers.contains_key(&kind) {
                missing.push(format!("{} ({})", node.id, kind));
            }
        }

        if missing.is_empty() {
            Ok(())
        } else {
            Err(EngineError::DefinitionInvalid(format!(
                "no task handler registered for: {}",
                missing.join(", ")
            )))
        }
    }
}

fn resolve_kind(node: &Node) -> Result<TaskKind> {
    let name = node.task_type().ok_or_else(|| {
        EngineError::DefinitionInvalid(format!("Task node '{}' has no taskType", node.id))
    })?;
    name.parse::<TaskKind>().map_err(EngineError::DefinitionInvalid)
}

/// Runs nodes of every type against one definition.
#[derive(Clone)]
pub struct NodeExecutor {
    tasks: TaskRegistry,
}

impl NodeExecutor {
    pub fn new(tasks: TaskRegistry) -> Self {
        Self { tasks }
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.tasks
    }

    /// Executes the context's node. `Err` means the attempt failed.
    pub async fn execute(
        &self,
        definition: &WorkflowDefinition,
        ctx: &ExecutionContext,
    ) -> Result<ExecutionResult> {
        let node = definition
            .get_node(&ctx.node_id)
            .ok_or_else(|| EngineError::node(&ctx.node_id, "node not found in definition"))?;

        debug!(
            "Executing {} node '{}' for instance {}",
            node.node_type, node.id, ctx.instance_id
        );

        match node.node_type {
            NodeType::Start => Ok(execute_start(definition, ctx)),
            NodeType::Task => self.execute_task(definition, node, ctx).await,
            NodeType::Decision => execute_decision(definition, node, ctx),
            NodeType::Parallel => Ok(execute_parallel(definition, ctx)),
            NodeType::Merge => Ok(execute_merge(definition, ctx)),
            NodeType::End => Ok(execute_end(ctx)),
        }
    }

    async fn execute_task(
        &self,
        definition: &WorkflowDefinition,
        node: &Node,
        ctx: &ExecutionContext,
    ) -> Result<ExecutionResult> {
        let kind = resolve_kind(node)?;
        let handler = self
            .tasks
            .get(kind)
            .ok_or_else(|| EngineError::node(&node.id, format!("no handler for task kind {}", kind)))?;

        info!("Running {} task '{}' (attempt {})", kind, node.id, ctx.retry_count + 1);

        let output = handler
            .execute(ctx, node)
            .await
            .map_err(|e| EngineError::node(&node.id, e.to_string()))?;

        let forward = overlay(&ctx.input, &output);
        Ok(ExecutionResult::success(output, definition.successors(&node.id), forward))
    }
}

/// Emits every direct successor.
pub fn execute_start(definition: &WorkflowDefinition, ctx: &ExecutionContext) -> ExecutionResult {
    ExecutionResult::success(
        json!({ "started": true, "timestamp": Utc::now() }),
        definition.successors(&ctx.node_id),
        ctx.input.clone(),
    )
}

/// Evaluates the condition against the input and follows only the edges
/// tagged with the outcome.
pub fn execute_decision(
    definition: &WorkflowDefinition,
    node: &Node,
    ctx: &ExecutionContext,
) -> Result<ExecutionResult> {
    let condition = node
        .condition()
        .ok_or_else(|| EngineError::node(&node.id, "decision node has no condition"))?;

    let outcome = expression::evaluate(condition, &ctx.input)?;

    let next: Vec<String> = definition
        .outgoing(&node.id)
        .filter(|e| e.condition == Some(outcome))
        .map(|e| e.to.clone())
        .collect();

    info!(
        "Decision '{}' evaluated `{}` to {}; next: {:?}",
        node.id, condition, outcome, next
    );

    Ok(ExecutionResult::success(
        json!({ "decision": outcome, "condition": condition }),
        next,
        ctx.input.clone(),
    ))
}

/// The fan-out point: every direct successor becomes eligible.
pub fn execute_parallel(definition: &WorkflowDefinition, ctx: &ExecutionContext) -> ExecutionResult {
    let next = definition.successors(&ctx.node_id);
    ExecutionResult::success(
        json!({ "parallel": true, "branches": next.len() }),
        next,
        ctx.input.clone(),
    )
}

/// Runs once every incoming branch has completed; the scheduler's barrier
/// guarantees that before the context is ever dispatched.
pub fn execute_merge(definition: &WorkflowDefinition, ctx: &ExecutionContext) -> ExecutionResult {
    let incoming = definition.predecessors(&ctx.node_id);
    ExecutionResult::success(
        json!({ "merged": true, "branches": incoming.len() }),
        definition.successors(&ctx.node_id),
        ctx.input.clone(),
    )
}

/// Completes the owning instance; emits nothing.
pub fn execute_end(ctx: &ExecutionContext) -> ExecutionResult {
    let mut result = ExecutionResult::success(
        json!({ "completed": true, "timestamp": Utc::now() }),
        Vec::new(),
        ctx.input.clone(),
    );
    result.completes_instance = true;
    result
}
