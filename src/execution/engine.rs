//! Workflow Execution Engine
//!
//! Drives workflow instances from start to a terminal status:
//! - Plan building and root seeding on start
//! - A dispatcher tick moving ready contexts into spawned node tasks
//! - Retry with backoff, instance failure once retries are exhausted
//! - Pause/resume/cancel/retry lifecycle controls
//! - A monitor tick for timeouts, progress, stalls and completion
//!
//! All instance-level transitions and result applications for one
//! instance run under that instance's async lock.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::config::EngineConfig;
use super::context::{ExecutionContext, ExecutionResult};
use super::delegates::{
    InstanceEvent, InstanceEventKind, LogNotificationSink, NotificationSink, SimulatedDelegates,
    TaskDelegates,
};
use super::nodes::{NodeExecutor, TaskHandler, TaskRegistry};
use super::scheduler::{ActiveInfo, Scheduler};
use super::store::{
    DefinitionRepository, InMemoryDefinitions, InMemoryInstances, InMemoryStates,
    InstanceRepository, StateRepository,
};
use crate::error::{EngineError, Result};
use crate::monitoring::{ExecutionRecord, ResourceMonitor};
use crate::workflow::{
    build_plan, validate_definition, ExecutionPlan, ExecutionStep, InstanceStatus, Node,
    NodeState, NodeStatus, NodeType, TaskKind, WorkflowDefinition, WorkflowInstance,
};

/// Snapshot returned by [`Engine::get_execution_status`].
#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionStatus {
    pub instance_id: String,
    pub status: InstanceStatus,
    pub progress: f64,
    pub active_nodes: Vec<String>,
    pub completed_nodes: Vec<String>,
    pub failed_nodes: Vec<String>,
    pub current_step: Option<String>,
    pub estimated_completion: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    pub retry_count: u32,
    pub history: Vec<ExecutionRecord>,
}

/// Definition and plan cached per instance.
struct InstanceRuntime {
    definition: Arc<WorkflowDefinition>,
    plan: Arc<ExecutionPlan>,
}

struct EngineInner {
    config: EngineConfig,
    definitions: Arc<dyn DefinitionRepository>,
    instances: Arc<dyn InstanceRepository>,
    states: Arc<dyn StateRepository>,
    notifier: Arc<dyn NotificationSink>,
    executor: NodeExecutor,
    scheduler: Scheduler,
    runtimes: Mutex<HashMap<String, Arc<InstanceRuntime>>>,
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    resources: Mutex<ResourceMonitor>,
}

/// Assembles an [`Engine`]. Every collaborator defaults to the in-memory
/// or simulated implementation.
pub struct EngineBuilder {
    config: EngineConfig,
    definitions: Arc<dyn DefinitionRepository>,
    instances: Arc<dyn InstanceRepository>,
    states: Arc<dyn StateRepository>,
    notifier: Arc<dyn NotificationSink>,
    tasks: TaskRegistry,
}

impl EngineBuilder {
    fn new(config: EngineConfig) -> Self {
        Self {
            config,
            definitions: Arc::new(InMemoryDefinitions::new()),
            instances: Arc::new(InMemoryInstances::new()),
            states: Arc::new(InMemoryStates::new()),
            notifier: Arc::new(LogNotificationSink),
            tasks: TaskRegistry::with_delegates(Arc::new(SimulatedDelegates::new())),
        }
    }

    pub fn definitions(mut self, repo: Arc<dyn DefinitionRepository>) -> Self {
        self.definitions = repo;
        self
    }

    pub fn instances(mut self, repo: Arc<dyn InstanceRepository>) -> Self {
        self.instances = repo;
        self
    }

    pub fn states(mut self, repo: Arc<dyn StateRepository>) -> Self {
        self.states = repo;
        self
    }

    pub fn notifier(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.notifier = sink;
        self
    }

    /// Backs every task kind with `delegates`.
    pub fn delegates(mut self, delegates: Arc<dyn TaskDelegates>) -> Self {
        self.tasks = TaskRegistry::with_delegates(delegates);
        self
    }

    /// Overrides the handler of one task kind.
    pub fn task_handler(mut self, kind: TaskKind, handler: Arc<dyn TaskHandler>) -> Self {
        self.tasks.register(kind, handler);
        self
    }

    pub fn build(self) -> Engine {
        let monitor_interval = self.config.monitor_interval();
        Engine {
            inner: Arc::new(EngineInner {
                config: self.config,
                definitions: self.definitions,
                instances: self.instances,
                states: self.states,
                notifier: self.notifier,
                executor: NodeExecutor::new(self.tasks),
                scheduler: Scheduler::new(),
                runtimes: Mutex::new(HashMap::new()),
                locks: Mutex::new(HashMap::new()),
                resources: Mutex::new(
                    ResourceMonitor::new().with_min_interval(monitor_interval / 2),
                ),
            }),
        }
    }
}

/// Handle to the background dispatcher and monitor loops.
pub struct EngineHandle {
    shutdown: CancellationToken,
    dispatcher: JoinHandle<()>,
    monitor: JoinHandle<()>,
}

impl EngineHandle {
    /// Stops both loops and waits for them to exit.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(e) = self.dispatcher.await {
            error!("Dispatcher loop panicked: {}", e);
        }
        if let Err(e) = self.monitor.await {
            error!("Monitor loop panicked: {}", e);
        }
    }
}

/// Workflow execution engine. Cheap to clone; clones share all state.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use std::time::Duration;
/// use milestone_flow::execution::{Engine, EngineConfig, SimulatedDelegates};
/// use milestone_flow::workflow::load_definition;
///
/// # async fn run() -> milestone_flow::Result<()> {
/// let engine = Engine::builder(EngineConfig::default())
///     .delegates(Arc::new(SimulatedDelegates::new()))
///     .build();
///
/// let definition = load_definition("approval.yaml")?;
/// let definition_id = definition.id.clone();
/// engine.register_definition(definition).await?;
///
/// let handle = engine.spawn();
/// let id = engine
///     .execute_workflow(&definition_id, serde_json::json!({"amount": 150}))
///     .await?;
/// let instance = engine.wait_until_terminal(&id, Duration::from_secs(60)).await?;
/// println!("{} finished as {}", id, instance.status);
/// handle.shutdown().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

fn invalid(instance: &WorkflowInstance, operation: &'static str) -> EngineError {
    EngineError::InvalidTransition {
        instance_id: instance.id.clone(),
        operation,
        status: instance.status,
    }
}

impl Engine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    fn lock_for(&self, instance_id: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.inner.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(instance_id.to_string()).or_default())
    }

    fn runtimes(&self) -> MutexGuard<'_, HashMap<String, Arc<InstanceRuntime>>> {
        self.inner.runtimes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, event: InstanceEvent) {
        let notifier = Arc::clone(&self.inner.notifier);
        tokio::spawn(async move {
            let kind = event.kind;
            let instance_id = event.instance_id.clone();
            if let Err(e) = notifier.notify(event).await {
                warn!(
                    "Failed to send {} notification for instance {}: {}",
                    kind, instance_id, e
                );
            }
        });
    }

    // ---- definitions and instances ----

    /// Validates and stores a definition.
    pub async fn register_definition(&self, definition: WorkflowDefinition) -> Result<()> {
        validate_definition(&definition)?;
        self.inner.executor.registry().check_definition(&definition)?;
        info!("Registered definition '{}'", definition.id);
        self.inner.definitions.save_definition(definition).await
    }

    /// Creates an `INITIATED` instance and returns its id.
    pub async fn create_instance(&self, definition_id: &str, input: Value) -> Result<String> {
        self.inner.definitions.get_definition(definition_id).await?;
        let instance = WorkflowInstance::new(definition_id, input);
        let id = instance.id.clone();
        self.inner.instances.create(instance).await?;
        info!("Created instance {} of definition '{}'", id, definition_id);
        Ok(id)
    }

    /// Creates and starts an instance.
    pub async fn execute_workflow(&self, definition_id: &str, input: Value) -> Result<String> {
        let id = self.create_instance(definition_id, input).await?;
        self.start_instance(&id).await?;
        Ok(id)
    }

    /// Builds the plan for an instance and caches it with the definition.
    async fn prepare_runtime(&self, instance: &WorkflowInstance) -> Result<Arc<InstanceRuntime>> {
        let definition = self
            .inner
            .definitions
            .get_definition(&instance.definition_id)
            .await?;
        self.inner.executor.registry().check_definition(&definition)?;
        let plan = build_plan(&definition, &instance.id, &self.inner.config.retry_defaults())?;

        let runtime = Arc::new(InstanceRuntime {
            definition: Arc::new(definition),
            plan: Arc::new(plan),
        });
        self.runtimes()
            .insert(instance.id.clone(), Arc::clone(&runtime));
        Ok(runtime)
    }

    async fn runtime(&self, instance_id: &str) -> Result<Arc<InstanceRuntime>> {
        if let Some(runtime) = self.runtimes().get(instance_id) {
            return Ok(Arc::clone(runtime));
        }

        let instance = self.inner.instances.get(instance_id).await?;
        let Some(plan) = instance.execution_plan.clone() else {
            return self.prepare_runtime(&instance).await;
        };
        let definition = self
            .inner
            .definitions
            .get_definition(&instance.definition_id)
            .await?;

        let runtime = Arc::new(InstanceRuntime {
            definition: Arc::new(definition),
            plan: Arc::new(plan),
        });
        self.runtimes()
            .insert(instance_id.to_string(), Arc::clone(&runtime));
        Ok(runtime)
    }

    fn step_context(
        &self,
        runtime: &InstanceRuntime,
        step: &ExecutionStep,
        base: ExecutionContext,
    ) -> ExecutionContext {
        let timeout = runtime
            .definition
            .get_node(&step.node_id)
            .and_then(Node::timeout_ms)
            .map(Duration::from_millis);
        base.with_retries(step.retry_policy.max_retries)
            .with_timeout(timeout)
    }

    fn seed_roots(&self, instance: &WorkflowInstance, runtime: &InstanceRuntime) {
        for step in runtime.plan.root_steps() {
            let base = ExecutionContext::new(
                instance.id.clone(),
                step.node_id.clone(),
                step.node_type,
                instance.input.clone(),
            );
            self.inner
                .scheduler
                .enqueue(self.step_context(runtime, step, base));
        }
        self.inner.scheduler.mark_progress(&instance.id);
    }

    // ---- lifecycle controls ----

    /// Starts an `INITIATED` instance.
    ///
    /// A definition that fails planning leaves the instance `FAILED` and the
    /// error is returned to the caller.
    pub async fn start_instance(&self, instance_id: &str) -> Result<()> {
        let lock = self.lock_for(instance_id);
        let _guard = lock.lock().await;

        let mut instance = self.inner.instances.get(instance_id).await?;
        if instance.status != InstanceStatus::Initiated {
            return Err(invalid(&instance, "start"));
        }

        let runtime = match self.prepare_runtime(&instance).await {
            Ok(runtime) => runtime,
            Err(e) => {
                error!("Instance {} cannot start: {}", instance_id, e);
                instance.finish(InstanceStatus::Failed, Some(e.to_string()));
                self.inner.instances.update(&instance).await?;
                return Err(e);
            }
        };

        instance.execution_plan = Some(runtime.plan.as_ref().clone());
        instance.status = InstanceStatus::Running;
        instance.start_date = Some(Utc::now());
        instance.touch();
        self.inner.instances.update(&instance).await?;

        self.seed_roots(&instance, &runtime);
        info!(
            "Started instance {} ({} steps, estimated {} ms)",
            instance_id,
            runtime.plan.len(),
            runtime.plan.critical_path_duration()
        );
        Ok(())
    }

    /// Pauses a `RUNNING` instance. Active contexts go back to the pending
    /// queue; work already in flight may still finish and be applied.
    pub async fn pause_instance(&self, instance_id: &str, reason: Option<String>) -> Result<()> {
        let lock = self.lock_for(instance_id);
        let _guard = lock.lock().await;

        let mut instance = self.inner.instances.get(instance_id).await?;
        if instance.status != InstanceStatus::Running {
            return Err(invalid(&instance, "pause"));
        }

        let moved = self.inner.scheduler.requeue_active(instance_id);
        instance.status = InstanceStatus::Paused;
        instance.pause_reason = reason;
        instance.touch();
        self.inner.instances.update(&instance).await?;

        info!(
            "Paused instance {} ({} active contexts requeued)",
            instance_id,
            moved.len()
        );
        self.notify(InstanceEvent::new(
            InstanceEventKind::Paused,
            instance_id,
            format!("Workflow instance {} has been paused", instance_id),
        ));
        Ok(())
    }

    /// Resumes a `PAUSED` instance; queued contexts run on the next tick.
    pub async fn resume_instance(&self, instance_id: &str) -> Result<()> {
        let lock = self.lock_for(instance_id);
        let _guard = lock.lock().await;

        let mut instance = self.inner.instances.get(instance_id).await?;
        if instance.status != InstanceStatus::Paused {
            return Err(invalid(&instance, "resume"));
        }

        instance.status = InstanceStatus::Running;
        instance.pause_reason = None;
        instance.touch();
        self.inner.instances.update(&instance).await?;
        self.inner.scheduler.mark_progress(instance_id);

        info!("Resumed instance {}", instance_id);
        self.notify(InstanceEvent::new(
            InstanceEventKind::Resumed,
            instance_id,
            format!("Workflow instance {} has been resumed", instance_id),
        ));

        // everything may have finished while paused
        self.check_completion_locked(&mut instance).await
    }

    /// Cancels a non-terminal instance, dropping its queued and active work.
    pub async fn cancel_instance(&self, instance_id: &str, reason: Option<String>) -> Result<()> {
        let lock = self.lock_for(instance_id);
        let _guard = lock.lock().await;

        let mut instance = self.inner.instances.get(instance_id).await?;
        if instance.status.is_terminal() {
            return Err(invalid(&instance, "cancel"));
        }

        let reason = reason.unwrap_or_else(|| "Cancelled by request".to_string());
        self.stop_locked(&mut instance, InstanceStatus::Cancelled, Some(reason.clone()))
            .await?;

        self.notify(
            InstanceEvent::new(
                InstanceEventKind::Cancelled,
                instance_id,
                format!("Workflow instance {} has been cancelled", instance_id),
            )
            .with_data("reason", reason),
        );
        Ok(())
    }

    /// Re-opens a `FAILED` instance.
    ///
    /// With `node_id` only that node is reset; otherwise every failed node
    /// and every node cancelled alongside the failure. If nothing was
    /// reset the instance restarts from its root nodes.
    pub async fn retry_instance(&self, instance_id: &str, node_id: Option<&str>) -> Result<()> {
        let lock = self.lock_for(instance_id);
        let _guard = lock.lock().await;

        let mut instance = self.inner.instances.get(instance_id).await?;
        if instance.status != InstanceStatus::Failed {
            return Err(invalid(&instance, "retry"));
        }

        let runtime = self.prepare_runtime(&instance).await?;
        let rows = self.inner.states.list(instance_id).await?;

        let targets: Vec<NodeState> = match node_id {
            Some(node) => {
                let row = rows
                    .into_iter()
                    .find(|r| r.node_id == node)
                    .ok_or_else(|| EngineError::node(node, "node has not run in this instance"))?;
                vec![row]
            }
            None => rows
                .into_iter()
                .filter(|r| matches!(r.status, NodeStatus::Failed | NodeStatus::Cancelled))
                .collect(),
        };

        if targets.is_empty() {
            self.inner.scheduler.drop_instance(instance_id, false);
            for mut row in self.inner.states.list(instance_id).await? {
                row.reset();
                self.inner.states.upsert(&row).await?;
            }
            self.seed_roots(&instance, &runtime);
        } else {
            self.inner.scheduler.drop_instance(instance_id, true);
            for mut row in targets {
                let Some(step) = runtime.plan.step(&row.node_id) else {
                    continue;
                };
                let base = ExecutionContext::new(
                    instance_id,
                    row.node_id.clone(),
                    step.node_type,
                    row.input.clone(),
                );
                row.reset();
                self.inner.states.upsert(&row).await?;
                self.inner
                    .scheduler
                    .enqueue(self.step_context(&runtime, step, base));
            }
            self.inner.scheduler.mark_progress(instance_id);
        }

        instance.retry_count += 1;
        instance.status = InstanceStatus::Running;
        instance.end_date = None;
        instance.failure_reason = None;
        instance.execution_plan = Some(runtime.plan.as_ref().clone());
        instance.touch();
        self.inner.instances.update(&instance).await?;

        info!(
            "Retrying instance {} (retry #{}, scope: {})",
            instance_id,
            instance.retry_count,
            node_id.unwrap_or("all failed nodes")
        );
        Ok(())
    }

    /// Current status, node lists and full history of an instance.
    pub async fn get_execution_status(&self, instance_id: &str) -> Result<ExecutionStatus> {
        let instance = self.inner.instances.get(instance_id).await?;
        let rows = self.inner.states.list(instance_id).await?;
        let activity = self.inner.scheduler.activity(instance_id);

        let nodes_with = |status: NodeStatus| -> Vec<String> {
            rows.iter()
                .filter(|r| r.status == status)
                .map(|r| r.node_id.clone())
                .collect()
        };
        let completed_nodes = nodes_with(NodeStatus::Completed);
        let failed_nodes = nodes_with(NodeStatus::Failed);

        let progress = match (&instance.execution_plan, instance.status) {
            (_, InstanceStatus::Completed) => 100.0,
            (Some(plan), _) if !plan.is_empty() => {
                completed_nodes.len() as f64 / plan.len() as f64 * 100.0
            }
            _ => instance.progress_percentage,
        };

        let estimated_completion = match (instance.status, instance.start_date) {
            (InstanceStatus::Running, Some(start)) if progress > 0.0 => {
                let elapsed_ms = (Utc::now() - start).num_milliseconds().max(0) as f64;
                let total_ms = elapsed_ms / progress * 100.0;
                Some(start + chrono::Duration::milliseconds(total_ms as i64))
            }
            _ => None,
        };

        Ok(ExecutionStatus {
            instance_id: instance.id.clone(),
            status: instance.status,
            progress,
            current_step: activity.active.first().cloned(),
            active_nodes: activity.active,
            completed_nodes,
            failed_nodes,
            estimated_completion,
            failure_reason: instance.failure_reason.clone(),
            retry_count: instance.retry_count,
            history: self.inner.scheduler.history(instance_id).records().to_vec(),
        })
    }

    /// The plan stored on the instance once it has started.
    pub async fn get_execution_plan(&self, instance_id: &str) -> Result<Option<ExecutionPlan>> {
        Ok(self.inner.instances.get(instance_id).await?.execution_plan)
    }

    // ---- dispatcher ----

    /// One dispatcher pass. Returns the number of contexts launched.
    pub async fn dispatch_tick(&self) -> Result<usize> {
        let candidates = self.inner.scheduler.pending_snapshot();
        if candidates.is_empty() {
            return Ok(0);
        }

        let max_active = self.inner.config.max_active.max(1);
        let mut statuses: HashMap<String, Option<InstanceStatus>> = HashMap::new();
        let mut dispatched = 0;

        for ctx in candidates {
            if self.inner.scheduler.active_count() >= max_active {
                debug!("Active limit {} reached, deferring remaining work", max_active);
                break;
            }

            let status = match statuses.get(&ctx.instance_id) {
                Some(status) => *status,
                None => {
                    let status = match self.inner.instances.get(&ctx.instance_id).await {
                        Ok(instance) => Some(instance.status),
                        Err(EngineError::InstanceNotFound(_)) => None,
                        Err(e) => return Err(e),
                    };
                    statuses.insert(ctx.instance_id.clone(), status);
                    status
                }
            };

            match status {
                Some(InstanceStatus::Running) => {}
                Some(_) => continue,
                None => {
                    warn!("Dropping queued work of unknown instance {}", ctx.instance_id);
                    self.inner.scheduler.drop_instance(&ctx.instance_id, false);
                    continue;
                }
            }

            let runtime = self.runtime(&ctx.instance_id).await?;
            let key = ctx.key();

            if !self
                .dependencies_met(&ctx.instance_id, runtime.plan.dependencies(&ctx.node_id))
                .await?
            {
                let checks = self.inner.scheduler.note_not_ready(&key);
                if checks > self.inner.config.merge_recheck_limit {
                    self.fail_with_deadlock(&ctx.instance_id, vec![ctx.node_id.clone()])
                        .await?;
                    statuses.insert(ctx.instance_id.clone(), Some(InstanceStatus::Failed));
                }
                continue;
            }

            if let Some((ctx, generation, cancel)) = self.inner.scheduler.activate(&key, max_active) {
                debug!("Dispatching node '{}' of instance {}", ctx.node_id, ctx.instance_id);
                let engine = self.clone();
                tokio::spawn(async move {
                    engine.run_node(ctx, generation, cancel).await;
                });
                dispatched += 1;
            }
        }

        Ok(dispatched)
    }

    async fn dependencies_met(&self, instance_id: &str, dependencies: &[String]) -> Result<bool> {
        for dep in dependencies {
            let completed = self
                .inner
                .states
                .get(instance_id, dep)
                .await?
                .map(|s| s.status == NodeStatus::Completed)
                .unwrap_or(false);
            if !completed {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn run_node(self, ctx: ExecutionContext, generation: u64, cancel: CancellationToken) {
        let key = ctx.key();
        if let Err(e) = self.execute_attempt(ctx, generation, cancel).await {
            error!(
                "Node '{}' of instance {} could not be processed: {}",
                key.1, key.0, e
            );
            self.inner.scheduler.deactivate(&key, generation);
        }
    }

    async fn execute_attempt(
        &self,
        ctx: ExecutionContext,
        generation: u64,
        cancel: CancellationToken,
    ) -> Result<()> {
        let key = ctx.key();
        let runtime = self.runtime(&ctx.instance_id).await?;

        {
            let lock = self.lock_for(&ctx.instance_id);
            let _guard = lock.lock().await;

            if !self.inner.scheduler.is_current(&key, generation) {
                debug!("Attempt of '{}' superseded before start", ctx.node_id);
                self.inner.scheduler.deactivate(&key, generation);
                return Ok(());
            }

            let instance = self.inner.instances.get(&ctx.instance_id).await?;
            if instance.status != InstanceStatus::Running {
                self.inner.scheduler.deactivate(&key, generation);
                return Ok(());
            }

            let mut state = self
                .inner
                .states
                .get(&ctx.instance_id, &ctx.node_id)
                .await?
                .unwrap_or_else(|| NodeState::new(&ctx.instance_id, &ctx.node_id, ctx.node_type));
            state.mark_running(ctx.input.clone(), ctx.retry_count);
            self.inner.states.upsert(&state).await?;
        }

        info!(
            "Node '{}' ({}) started for instance {} (attempt {})",
            ctx.node_id,
            ctx.node_type,
            ctx.instance_id,
            ctx.retry_count + 1
        );

        let started = Instant::now();
        let outcome = tokio::select! {
            _ = cancel.cancelled() => None,
            result = self.inner.executor.execute(&runtime.definition, &ctx) => Some(result),
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Some(result) => self.apply_result(ctx, generation, result, duration_ms).await,
            None => {
                debug!(
                    "Node '{}' of instance {} cancelled in flight",
                    ctx.node_id, ctx.instance_id
                );
                Ok(())
            }
        }
    }

    fn record(&self, ctx: &ExecutionContext, result: &std::result::Result<Value, String>, duration_ms: u64) {
        let (success, output, error) = match result {
            Ok(output) => (true, Some(output.clone()), None),
            Err(e) => (false, None, Some(e.clone())),
        };
        self.inner.scheduler.record(
            &ctx.instance_id,
            ExecutionRecord {
                node_id: ctx.node_id.clone(),
                node_type: ctx.node_type,
                attempt: ctx.retry_count + 1,
                success,
                output,
                error,
                started_at: ctx.started_at,
                finished_at: Utc::now(),
                duration_ms,
            },
        );
    }

    async fn apply_result(
        &self,
        ctx: ExecutionContext,
        generation: u64,
        result: Result<ExecutionResult>,
        duration_ms: u64,
    ) -> Result<()> {
        let key = ctx.key();
        let lock = self.lock_for(&ctx.instance_id);
        let _guard = lock.lock().await;

        if !self.inner.scheduler.finish(&key, generation) {
            debug!("Discarding stale result of node '{}'", ctx.node_id);
            return Ok(());
        }

        let mut instance = self.inner.instances.get(&ctx.instance_id).await?;
        if instance.status.is_terminal() {
            debug!(
                "Discarding result of node '{}': instance {} is {}",
                ctx.node_id, instance.id, instance.status
            );
            return Ok(());
        }

        let runtime = self.runtime(&ctx.instance_id).await?;
        let result = match result {
            Ok(result) => result.with_duration(duration_ms),
            Err(e) => {
                return self
                    .handle_failure_locked(&mut instance, &runtime, ctx, e, duration_ms)
                    .await
            }
        };

        let mut state = self
            .inner
            .states
            .get(&ctx.instance_id, &ctx.node_id)
            .await?
            .unwrap_or_else(|| NodeState::new(&ctx.instance_id, &ctx.node_id, ctx.node_type));
        state.mark_completed(result.output.clone(), duration_ms);
        self.inner.states.upsert(&state).await?;
        self.record(&ctx, &Ok(result.output.clone()), duration_ms);

        info!(
            "Node '{}' completed for instance {} in {} ms",
            ctx.node_id, ctx.instance_id, duration_ms
        );

        if result.completes_instance {
            return self.complete_locked(&mut instance).await;
        }

        for next in &result.next_nodes {
            self.enqueue_successor(&runtime, &ctx, next, result.forward.clone());
        }

        self.refresh_progress(&mut instance, &runtime).await?;
        self.check_completion_locked(&mut instance).await
    }

    fn enqueue_successor(
        &self,
        runtime: &InstanceRuntime,
        parent: &ExecutionContext,
        node_id: &str,
        forward: Value,
    ) {
        let Some(step) = runtime.plan.step(node_id) else {
            warn!("Successor '{}' of '{}' is not in the plan", node_id, parent.node_id);
            return;
        };

        let input = if step.node_type == NodeType::Merge {
            let key = (parent.instance_id.clone(), node_id.to_string());
            match self.inner.scheduler.arrive(
                &key,
                step.dependencies.len(),
                &parent.node_id,
                forward,
            ) {
                Some(combined) => combined,
                None => {
                    debug!(
                        "Merge '{}' waiting for remaining branches after '{}'",
                        node_id, parent.node_id
                    );
                    return;
                }
            }
        } else {
            forward
        };

        let base = parent.successor(node_id, step.node_type, input);
        self.inner
            .scheduler
            .enqueue(self.step_context(runtime, step, base));
    }

    async fn handle_failure_locked(
        &self,
        instance: &mut WorkflowInstance,
        runtime: &InstanceRuntime,
        ctx: ExecutionContext,
        err: EngineError,
        duration_ms: u64,
    ) -> Result<()> {
        let message = match err {
            EngineError::NodeExecution { message, .. } => message,
            other => other.to_string(),
        };

        let mut state = self
            .inner
            .states
            .get(&ctx.instance_id, &ctx.node_id)
            .await?
            .unwrap_or_else(|| NodeState::new(&ctx.instance_id, &ctx.node_id, ctx.node_type));
        state.mark_failed(message.clone(), duration_ms);
        self.inner.states.upsert(&state).await?;
        self.record(&ctx, &Err(message.clone()), duration_ms);

        if ctx.has_retries_left() {
            let policy = runtime
                .plan
                .step(&ctx.node_id)
                .map(|s| s.retry_policy)
                .unwrap_or_else(|| self.inner.config.retry_defaults());

            let mut retry = ctx.clone();
            retry.retry_count += 1;
            let delay = policy.delay_for(retry.retry_count);

            warn!(
                "Node '{}' of instance {} failed (attempt {}/{}): {}. Retrying in {:?}",
                ctx.node_id,
                ctx.instance_id,
                ctx.retry_count + 1,
                ctx.max_retries + 1,
                message,
                delay
            );

            let generation = self.inner.scheduler.delay(&ctx.key());
            let token = self.inner.scheduler.instance_token(&ctx.instance_id);
            let engine = self.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = token.cancelled() => {}
                    _ = tokio::time::sleep(delay) => {
                        engine.inner.scheduler.release_delayed(retry, generation);
                    }
                }
            });

            instance.touch();
            return self.inner.instances.update(instance).await;
        }

        let reason = format!(
            "Node {} failed after {} retries: {}",
            ctx.node_id, ctx.max_retries, message
        );
        error!("Instance {}: {}", instance.id, reason);
        self.fail_locked(instance, reason).await
    }

    // ---- terminal transitions ----

    /// Drops scheduled work, cancels rows still running and finishes the
    /// instance with `status`.
    async fn stop_locked(
        &self,
        instance: &mut WorkflowInstance,
        status: InstanceStatus,
        reason: Option<String>,
    ) -> Result<()> {
        // failed instances may be retried; keep merge arrivals for that
        let dropped = self
            .inner
            .scheduler
            .drop_instance(&instance.id, status == InstanceStatus::Failed);

        for mut row in self.inner.states.list(&instance.id).await? {
            if row.status == NodeStatus::Running {
                row.mark_cancelled();
                self.inner.states.upsert(&row).await?;
            }
        }

        instance.finish(status, reason);
        self.inner.instances.update(instance).await?;

        // rebuilt on demand if the instance is retried
        self.runtimes().remove(&instance.id);
        if status != InstanceStatus::Failed {
            self.inner
                .locks
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&instance.id);
        }

        info!(
            "Instance {} is {} ({} queued and {} active contexts dropped)",
            instance.id,
            status,
            dropped.pending,
            dropped.active.len()
        );
        Ok(())
    }

    async fn complete_locked(&self, instance: &mut WorkflowInstance) -> Result<()> {
        self.stop_locked(instance, InstanceStatus::Completed, None).await?;
        self.notify(InstanceEvent::new(
            InstanceEventKind::Completed,
            &instance.id,
            format!(
                "Workflow instance {} has been completed successfully",
                instance.id
            ),
        ));
        Ok(())
    }

    async fn fail_locked(&self, instance: &mut WorkflowInstance, reason: String) -> Result<()> {
        self.stop_locked(instance, InstanceStatus::Failed, Some(reason.clone()))
            .await?;
        self.notify(
            InstanceEvent::new(
                InstanceEventKind::Failed,
                &instance.id,
                format!("Workflow instance {} has failed: {}", instance.id, reason),
            )
            .with_data("error", reason),
        );
        Ok(())
    }

    async fn fail_with_deadlock(&self, instance_id: &str, node_ids: Vec<String>) -> Result<()> {
        let lock = self.lock_for(instance_id);
        let _guard = lock.lock().await;

        let mut instance = self.inner.instances.get(instance_id).await?;
        if instance.status != InstanceStatus::Running {
            return Ok(());
        }
        let reason = EngineError::DependencyDeadlock { node_ids }.to_string();
        warn!("Instance {}: {}", instance_id, reason);
        self.fail_locked(&mut instance, reason).await
    }

    /// Settles a quiescent `RUNNING` instance.
    ///
    /// With nothing active or waiting on a backoff: a dispatchable pending
    /// context means work remains; pending contexts or half-filled merge
    /// barriers that can never become ready mean a dependency deadlock;
    /// otherwise the instance completes, or fails if a node is `FAILED`.
    async fn check_completion_locked(&self, instance: &mut WorkflowInstance) -> Result<()> {
        if instance.status != InstanceStatus::Running {
            return Ok(());
        }

        let activity = self.inner.scheduler.activity(&instance.id);
        if activity.is_busy() {
            return Ok(());
        }

        let rows = self.inner.states.list(&instance.id).await?;
        let completed: HashSet<&str> = rows
            .iter()
            .filter(|r| r.status == NodeStatus::Completed)
            .map(|r| r.node_id.as_str())
            .collect();
        let runtime = self.runtime(&instance.id).await?;

        let mut stuck = Vec::new();
        for ctx in &activity.pending {
            let ready = runtime
                .plan
                .dependencies(&ctx.node_id)
                .iter()
                .all(|d| completed.contains(d.as_str()));
            if ready {
                return Ok(());
            }
            stuck.push(ctx.node_id.clone());
        }
        stuck.extend(activity.waiting_merges);

        if !stuck.is_empty() {
            stuck.sort();
            let reason = EngineError::DependencyDeadlock { node_ids: stuck }.to_string();
            warn!("Instance {}: {}", instance.id, reason);
            return self.fail_locked(instance, reason).await;
        }

        let failed: Vec<&str> = rows
            .iter()
            .filter(|r| r.status == NodeStatus::Failed)
            .map(|r| r.node_id.as_str())
            .collect();

        if failed.is_empty() {
            self.complete_locked(instance).await
        } else {
            let reason = format!("Nodes {} failed", failed.join(", "));
            self.fail_locked(instance, reason).await
        }
    }

    async fn refresh_progress(
        &self,
        instance: &mut WorkflowInstance,
        runtime: &InstanceRuntime,
    ) -> Result<()> {
        let completed = self
            .inner
            .states
            .list(&instance.id)
            .await?
            .iter()
            .filter(|r| r.status == NodeStatus::Completed)
            .count();

        if !runtime.plan.is_empty() {
            instance.progress_percentage = completed as f64 / runtime.plan.len() as f64 * 100.0;
        }
        instance.touch();
        self.inner.instances.update(instance).await
    }

    // ---- monitor ----

    /// One monitor pass: timeouts, long-running warnings, progress, stall
    /// detection, completion, resource sampling.
    pub async fn monitor_tick(&self) -> Result<()> {
        let warn_after = self.inner.config.long_running_warn();

        for info in self.inner.scheduler.active_entries() {
            match info.timeout {
                Some(timeout) if info.elapsed > timeout => self.expire_node(&info, timeout).await?,
                _ if info.elapsed > warn_after => warn!(
                    "Node '{}' of instance {} has been running for {:?}",
                    info.key.1, info.key.0, info.elapsed
                ),
                _ => {}
            }
        }

        for listed in self.inner.instances.list_by_status(InstanceStatus::Running).await? {
            let lock = self.lock_for(&listed.id);
            let _guard = lock.lock().await;

            let mut instance = self.inner.instances.get(&listed.id).await?;
            if instance.status != InstanceStatus::Running {
                continue;
            }

            let runtime = self.runtime(&instance.id).await?;
            self.refresh_progress(&mut instance, &runtime).await?;

            if let (Some(limit), Some(idle)) = (
                self.inner.config.stall_timeout(),
                self.inner.scheduler.idle_for(&instance.id),
            ) {
                if idle > limit {
                    let reason = format!(
                        "Instance stalled: no node activity for {} ms",
                        idle.as_millis()
                    );
                    warn!("Instance {}: {}", instance.id, reason);
                    self.fail_locked(&mut instance, reason).await?;
                    continue;
                }
            }

            self.check_completion_locked(&mut instance).await?;
        }

        let active = self.inner.scheduler.active_count();
        self.inner
            .resources
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .sample(active);
        Ok(())
    }

    /// Treats an overdue attempt as a node failure.
    async fn expire_node(&self, info: &ActiveInfo, timeout: Duration) -> Result<()> {
        let (instance_id, node_id) = &info.key;
        let lock = self.lock_for(instance_id);
        let _guard = lock.lock().await;

        let Some(ctx) = self.inner.scheduler.expire(&info.key, info.generation) else {
            return Ok(());
        };

        let mut instance = self.inner.instances.get(instance_id).await?;
        if instance.status.is_terminal() {
            return Ok(());
        }

        warn!(
            "Node '{}' of instance {} timed out after {:?}",
            node_id, instance_id, info.elapsed
        );
        let runtime = self.runtime(instance_id).await?;
        let err = EngineError::Timeout {
            node_id: node_id.clone(),
            timeout_ms: timeout.as_millis() as u64,
        };
        self.handle_failure_locked(
            &mut instance,
            &runtime,
            ctx,
            err,
            info.elapsed.as_millis() as u64,
        )
        .await
    }

    // ---- loops ----

    /// Spawns the dispatcher and monitor loops.
    pub fn spawn(&self) -> EngineHandle {
        let shutdown = CancellationToken::new();

        let engine = self.clone();
        let token = shutdown.clone();
        let dispatcher = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(engine.inner.config.dispatch_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = engine.dispatch_tick().await {
                            error!("Dispatcher tick failed: {}", e);
                        }
                    }
                }
            }
            debug!("Dispatcher loop stopped");
        });

        let engine = self.clone();
        let token = shutdown.clone();
        let monitor = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(engine.inner.config.monitor_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = engine.monitor_tick().await {
                            error!("Monitor tick failed: {}", e);
                        }
                    }
                }
            }
            debug!("Monitor loop stopped");
        });

        info!(
            "Engine loops started (dispatch every {:?}, monitor every {:?}, max {} active)",
            self.inner.config.dispatch_interval(),
            self.inner.config.monitor_interval(),
            self.inner.config.max_active
        );

        EngineHandle {
            shutdown,
            dispatcher,
            monitor,
        }
    }

    /// Polls until the instance is terminal or `timeout` elapses, and
    /// returns the latest record either way.
    pub async fn wait_until_terminal(
        &self,
        instance_id: &str,
        timeout: Duration,
    ) -> Result<WorkflowInstance> {
        let deadline = Instant::now() + timeout;
        let poll = self
            .inner
            .config
            .dispatch_interval()
            .min(Duration::from_millis(50));

        loop {
            let instance = self.inner.instances.get(instance_id).await?;
            if instance.status.is_terminal() || Instant::now() >= deadline {
                return Ok(instance);
            }
            tokio::time::sleep(poll).await;
        }
    }

    pub fn resource_summary(&self) -> String {
        self.inner
            .resources
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_summary()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::delegates::scripted::{Behavior, BrokenSink, RecordingSink, ScriptedDelegates};
    use crate::workflow::{BackoffStrategy, Edge};
    use serde_json::json;

    const WAIT: Duration = Duration::from_secs(5);

    fn test_config() -> EngineConfig {
        EngineConfig {
            dispatch_interval_ms: 2,
            monitor_interval_ms: 10,
            max_active: 64,
            merge_recheck_limit: 1_000,
            stall_timeout_ms: 0,
            long_running_warn_ms: 60_000,
            default_max_retries: 0,
            default_retry_delay_ms: 1,
            default_backoff: BackoffStrategy::Linear,
        }
    }

    struct Harness {
        engine: Engine,
        delegates: Arc<ScriptedDelegates>,
        sink: Arc<RecordingSink>,
    }

    fn harness_with(config: EngineConfig, delegates: ScriptedDelegates) -> Harness {
        let delegates = Arc::new(delegates);
        let sink = Arc::new(RecordingSink::default());
        let engine = Engine::builder(config)
            .delegates(delegates.clone())
            .notifier(sink.clone())
            .build();
        Harness {
            engine,
            delegates,
            sink,
        }
    }

    fn harness(delegates: ScriptedDelegates) -> Harness {
        harness_with(test_config(), delegates)
    }

    impl Harness {
        async fn run(&self, definition: WorkflowDefinition, input: Value) -> (String, WorkflowInstance) {
            let id = definition.id.clone();
            self.engine.register_definition(definition).await.unwrap();
            let handle = self.engine.spawn();
            let instance_id = self.engine.execute_workflow(&id, input).await.unwrap();
            let instance = self.engine.wait_until_terminal(&instance_id, WAIT).await.unwrap();
            handle.shutdown().await;
            (instance_id, instance)
        }

        async fn row(&self, instance_id: &str, node_id: &str) -> Option<NodeState> {
            self.engine.inner.states.get(instance_id, node_id).await.unwrap()
        }

        async fn wait_for_calls(&self, node_id: &str, calls: u32) {
            let deadline = Instant::now() + WAIT;
            while self.delegates.calls(node_id) < calls && Instant::now() < deadline {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        }

        async fn wait_for_events(&self, count: usize) -> Vec<InstanceEventKind> {
            let deadline = Instant::now() + WAIT;
            while self.sink.kinds().len() < count && Instant::now() < deadline {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
            self.sink.kinds()
        }
    }

    fn linear() -> WorkflowDefinition {
        WorkflowDefinition::new("linear")
            .with_node(Node::start("start"))
            .with_node(Node::task("a", TaskKind::Verification))
            .with_node(Node::end("end"))
            .with_edge(Edge::new("start", "a"))
            .with_edge(Edge::new("a", "end"))
    }

    fn fan_in() -> WorkflowDefinition {
        WorkflowDefinition::new("fan_in")
            .with_node(Node::start("start"))
            .with_node(Node::parallel("fork"))
            .with_node(Node::task("a", TaskKind::Verification))
            .with_node(Node::task("b", TaskKind::EvidenceCollection))
            .with_node(Node::merge("join"))
            .with_node(Node::end("end"))
            .with_edge(Edge::new("start", "fork"))
            .with_edge(Edge::new("fork", "a"))
            .with_edge(Edge::new("fork", "b"))
            .with_edge(Edge::new("a", "join"))
            .with_edge(Edge::new("b", "join"))
            .with_edge(Edge::new("join", "end"))
    }

    #[tokio::test]
    async fn test_linear_workflow_completes() {
        let h = harness(ScriptedDelegates::new(Behavior::Succeed));
        let (id, instance) = h.run(linear(), json!({"milestoneId": "M-1"})).await;

        assert_eq!(instance.status, InstanceStatus::Completed);
        assert_eq!(instance.progress_percentage, 100.0);
        for node in ["start", "a", "end"] {
            assert_eq!(h.row(&id, node).await.unwrap().status, NodeStatus::Completed);
        }

        let status = h.engine.get_execution_status(&id).await.unwrap();
        assert_eq!(status.progress, 100.0);
        assert!(status.active_nodes.is_empty());
        assert_eq!(status.completed_nodes.len(), 3);
        assert_eq!(status.history.len(), 3);
        assert!(status.history.iter().all(|r| r.success));
        assert!(status.estimated_completion.is_none());
        assert_eq!(status.history[1].output.as_ref().unwrap()["verificationId"], json!("a-1"));

        assert_eq!(h.wait_for_events(1).await, vec![InstanceEventKind::Completed]);
    }

    #[tokio::test]
    async fn test_merge_fires_once_after_all_branches() {
        let delegates = ScriptedDelegates::new(Behavior::Succeed)
            .with("a", Behavior::Delay(Duration::from_millis(20)))
            .with("b", Behavior::Delay(Duration::from_millis(60)));
        let h = harness(delegates);
        let definition = fan_in();
        let (id, instance) = h.run(definition.clone(), json!({})).await;

        assert_eq!(instance.status, InstanceStatus::Completed);

        let history = h.engine.get_execution_status(&id).await.unwrap().history;
        assert_eq!(history.iter().filter(|r| r.node_id == "join").count(), 1);

        // every node started only after all of its predecessors finished
        for edge in &definition.edges {
            let from = h.row(&id, &edge.from).await.unwrap();
            let to = h.row(&id, &edge.to).await.unwrap();
            assert!(
                to.start_date.unwrap() >= from.end_date.unwrap(),
                "{} started before {} finished",
                edge.to,
                edge.from
            );
        }
    }

    #[tokio::test]
    async fn test_parallel_fans_out_to_every_successor() {
        let definition = WorkflowDefinition::new("fan_out")
            .with_node(Node::start("start"))
            .with_node(Node::parallel("fork"))
            .with_node(Node::task("a", TaskKind::Verification))
            .with_node(Node::task("b", TaskKind::Escalation))
            .with_node(Node::task("c", TaskKind::Notification))
            .with_edge(Edge::new("start", "fork"))
            .with_edge(Edge::new("fork", "a"))
            .with_edge(Edge::new("fork", "b"))
            .with_edge(Edge::new("fork", "c"));

        let h = harness(ScriptedDelegates::new(Behavior::Delay(Duration::from_millis(10))));
        let (id, instance) = h.run(definition, json!({})).await;

        // no end node: completes once nothing is left to run
        assert_eq!(instance.status, InstanceStatus::Completed);
        for node in ["a", "b", "c"] {
            assert_eq!(h.delegates.calls(node), 1);
            assert_eq!(h.row(&id, node).await.unwrap().status, NodeStatus::Completed);
        }
    }

    #[tokio::test]
    async fn test_single_active_context_per_node() {
        // `c` has two plain predecessors, so it is enqueued twice
        let definition = WorkflowDefinition::new("join_task")
            .with_node(Node::start("start"))
            .with_node(Node::parallel("fork"))
            .with_node(Node::task("a", TaskKind::Verification))
            .with_node(Node::task("b", TaskKind::Verification))
            .with_node(Node::task("c", TaskKind::Approval))
            .with_edge(Edge::new("start", "fork"))
            .with_edge(Edge::new("fork", "a"))
            .with_edge(Edge::new("fork", "b"))
            .with_edge(Edge::new("a", "c"))
            .with_edge(Edge::new("b", "c"));

        let delegates = ScriptedDelegates::new(Behavior::Delay(Duration::from_millis(5)))
            .with("c", Behavior::Delay(Duration::from_millis(40)));
        let h = harness(delegates);
        let (_, instance) = h.run(definition, json!({})).await;

        assert_eq!(instance.status, InstanceStatus::Completed);
        assert_eq!(h.delegates.calls("c"), 1);
        assert_eq!(h.delegates.max_in_flight("c"), 1);
    }

    #[tokio::test]
    async fn test_concurrent_ticks_dispatch_once() {
        let h = harness(ScriptedDelegates::new(Behavior::Succeed));
        h.engine.register_definition(linear()).await.unwrap();
        let id = h.engine.execute_workflow("linear", json!({})).await.unwrap();

        let (first, second) = tokio::join!(h.engine.dispatch_tick(), h.engine.dispatch_tick());
        assert_eq!(first.unwrap() + second.unwrap(), 1);

        let status = h.engine.get_execution_status(&id).await.unwrap();
        assert_eq!(status.status, InstanceStatus::Running);
    }

    #[tokio::test]
    async fn test_retries_exhausted_fails_instance() {
        let definition = WorkflowDefinition::new("retrying")
            .with_node(Node::start("start"))
            .with_node(Node::task("a", TaskKind::Verification).with_retry(2, BackoffStrategy::Linear, 1))
            .with_node(Node::end("end"))
            .with_edge(Edge::new("start", "a"))
            .with_edge(Edge::new("a", "end"));

        let h = harness(ScriptedDelegates::new(Behavior::Succeed).with("a", Behavior::Fail));
        let (id, instance) = h.run(definition, json!({})).await;

        assert_eq!(instance.status, InstanceStatus::Failed);
        let reason = instance.failure_reason.unwrap();
        assert!(reason.contains("Node a failed after 2 retries"), "{}", reason);

        assert_eq!(h.delegates.calls("a"), 3);
        assert_eq!(h.row(&id, "a").await.unwrap().status, NodeStatus::Failed);
        assert!(h.row(&id, "end").await.is_none());

        let status = h.engine.get_execution_status(&id).await.unwrap();
        assert_eq!(status.failed_nodes, vec!["a"]);
        let attempts: Vec<u32> = status
            .history
            .iter()
            .filter(|r| r.node_id == "a")
            .map(|r| r.attempt)
            .collect();
        assert_eq!(attempts, vec![1, 2, 3]);

        let events = h.wait_for_events(1).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(events, vec![InstanceEventKind::Failed]);
        assert_eq!(h.sink.kinds(), vec![InstanceEventKind::Failed]);
    }

    #[tokio::test]
    async fn test_pause_and_resume_while_task_running() {
        let h = harness(
            ScriptedDelegates::new(Behavior::Succeed)
                .with("a", Behavior::Delay(Duration::from_millis(100))),
        );
        h.engine.register_definition(linear()).await.unwrap();
        let handle = h.engine.spawn();
        let id = h.engine.execute_workflow("linear", json!({})).await.unwrap();

        h.wait_for_calls("a", 1).await;
        h.engine.pause_instance(&id, Some("audit".to_string())).await.unwrap();

        let paused = h.engine.get_execution_status(&id).await.unwrap();
        assert_eq!(paused.status, InstanceStatus::Paused);
        assert!(paused.active_nodes.is_empty());

        // in-flight task finishes, successors wait for resume
        tokio::time::sleep(Duration::from_millis(200)).await;
        let still_paused = h.engine.get_execution_status(&id).await.unwrap();
        assert_eq!(still_paused.status, InstanceStatus::Paused);
        assert!(still_paused.completed_nodes.contains(&"a".to_string()));
        assert!(h.row(&id, "end").await.is_none());

        h.engine.resume_instance(&id).await.unwrap();
        let instance = h.engine.wait_until_terminal(&id, WAIT).await.unwrap();
        handle.shutdown().await;

        assert_eq!(instance.status, InstanceStatus::Completed);
        assert_eq!(h.delegates.calls("a"), 1);
        assert_eq!(
            h.wait_for_events(3).await,
            vec![
                InstanceEventKind::Paused,
                InstanceEventKind::Resumed,
                InstanceEventKind::Completed
            ]
        );
    }

    #[tokio::test]
    async fn test_resume_right_after_pause_keeps_one_attempt() {
        let h = harness(
            ScriptedDelegates::new(Behavior::Succeed)
                .with("a", Behavior::Delay(Duration::from_millis(150))),
        );
        h.engine.register_definition(linear()).await.unwrap();
        let handle = h.engine.spawn();
        let id = h.engine.execute_workflow("linear", json!({})).await.unwrap();

        h.wait_for_calls("a", 1).await;
        h.engine.pause_instance(&id, None).await.unwrap();
        h.engine.resume_instance(&id).await.unwrap();

        // the requeued context waits for the attempt still in flight
        tokio::time::sleep(Duration::from_millis(30)).await;
        let running = h.engine.get_execution_status(&id).await.unwrap();
        assert_eq!(running.status, InstanceStatus::Running);
        assert_eq!(h.delegates.calls("a"), 1);

        let instance = h.engine.wait_until_terminal(&id, WAIT).await.unwrap();
        handle.shutdown().await;

        assert_eq!(instance.status, InstanceStatus::Completed);
        assert_eq!(h.delegates.calls("a"), 1);
        assert_eq!(h.delegates.max_in_flight("a"), 1);
        let history = h.engine.get_execution_status(&id).await.unwrap().history;
        assert_eq!(history.iter().filter(|r| r.node_id == "a").count(), 1);
    }

    #[tokio::test]
    async fn test_join_waits_past_recheck_limit_for_slow_branch() {
        let definition = WorkflowDefinition::new("slow_join")
            .with_node(Node::start("start"))
            .with_node(Node::parallel("fork"))
            .with_node(Node::task("a", TaskKind::Verification))
            .with_node(Node::task("b", TaskKind::EvidenceCollection))
            .with_node(Node::task("c", TaskKind::Approval))
            .with_edge(Edge::new("start", "fork"))
            .with_edge(Edge::new("fork", "a"))
            .with_edge(Edge::new("fork", "b"))
            .with_edge(Edge::new("a", "c"))
            .with_edge(Edge::new("b", "c"));

        let mut config = test_config();
        config.merge_recheck_limit = 20;
        let delegates = ScriptedDelegates::new(Behavior::Succeed)
            .with("b", Behavior::Delay(Duration::from_millis(300)));
        let h = harness_with(config, delegates);
        let (id, instance) = h.run(definition, json!({})).await;

        // ~150 dispatcher ticks pass while `b` runs
        assert_eq!(instance.status, InstanceStatus::Completed, "{:?}", instance.failure_reason);
        assert_eq!(h.delegates.calls("c"), 1);
        assert_eq!(h.row(&id, "c").await.unwrap().status, NodeStatus::Completed);
    }

    #[tokio::test]
    async fn test_terminal_instance_releases_runtime_and_lock() {
        let h = harness(ScriptedDelegates::new(Behavior::Succeed));
        let (id, instance) = h.run(linear(), json!({})).await;
        assert_eq!(instance.status, InstanceStatus::Completed);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!h.engine.runtimes().contains_key(&id));
        assert!(!h
            .engine
            .inner
            .locks
            .lock()
            .unwrap()
            .contains_key(&id));
    }

    #[tokio::test]
    async fn test_decision_follows_true_edge() {
        let definition = WorkflowDefinition::new("decide")
            .with_node(Node::start("start"))
            .with_node(Node::decision("check", "amount > 100"))
            .with_node(Node::task("escalate", TaskKind::Escalation))
            .with_node(Node::task("notify", TaskKind::Notification))
            .with_node(Node::end("end_high"))
            .with_node(Node::end("end_low"))
            .with_edge(Edge::new("start", "check"))
            .with_edge(Edge::when("check", "escalate", true))
            .with_edge(Edge::when("check", "notify", false))
            .with_edge(Edge::new("escalate", "end_high"))
            .with_edge(Edge::new("notify", "end_low"));

        let h = harness(ScriptedDelegates::new(Behavior::Succeed));
        let (id, instance) = h.run(definition, json!({"amount": 150})).await;

        assert_eq!(instance.status, InstanceStatus::Completed);
        assert_eq!(h.delegates.calls("escalate"), 1);
        assert_eq!(h.delegates.calls("notify"), 0);
        assert!(h.row(&id, "notify").await.is_none());

        let check = h.row(&id, "check").await.unwrap();
        assert_eq!(check.output.unwrap()["decision"], json!(true));
    }

    #[tokio::test]
    async fn test_cancel_is_terminal() {
        let h = harness(
            ScriptedDelegates::new(Behavior::Succeed)
                .with("a", Behavior::Delay(Duration::from_secs(10))),
        );
        h.engine.register_definition(linear()).await.unwrap();
        let handle = h.engine.spawn();
        let id = h.engine.execute_workflow("linear", json!({})).await.unwrap();

        h.wait_for_calls("a", 1).await;
        h.engine.cancel_instance(&id, None).await.unwrap();

        let status = h.engine.get_execution_status(&id).await.unwrap();
        assert_eq!(status.status, InstanceStatus::Cancelled);
        assert_eq!(h.row(&id, "a").await.unwrap().status, NodeStatus::Cancelled);

        let before: Vec<_> = h
            .engine
            .inner
            .states
            .list(&id)
            .await
            .unwrap()
            .into_iter()
            .map(|r| (r.node_id, r.status))
            .collect();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let after: Vec<_> = h
            .engine
            .inner
            .states
            .list(&id)
            .await
            .unwrap()
            .into_iter()
            .map(|r| (r.node_id, r.status))
            .collect();
        assert_eq!(before, after);
        assert_eq!(h.delegates.max_in_flight("a"), 1);

        assert!(matches!(
            h.engine.cancel_instance(&id, None).await,
            Err(EngineError::InvalidTransition { operation: "cancel", .. })
        ));
        assert!(matches!(
            h.engine.pause_instance(&id, None).await,
            Err(EngineError::InvalidTransition { .. })
        ));
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_retry_reopens_failed_instance() {
        let h = harness(ScriptedDelegates::new(Behavior::Succeed).with("a", Behavior::FailTimes(1)));
        let (id, instance) = h.run(linear(), json!({})).await;
        assert_eq!(instance.status, InstanceStatus::Failed);

        assert!(h.engine.retry_instance(&id, Some("ghost")).await.is_err());

        let handle = h.engine.spawn();
        h.engine.retry_instance(&id, Some("a")).await.unwrap();
        let instance = h.engine.wait_until_terminal(&id, WAIT).await.unwrap();
        handle.shutdown().await;

        assert_eq!(instance.status, InstanceStatus::Completed);
        assert_eq!(instance.retry_count, 1);
        assert!(instance.failure_reason.is_none());
        assert_eq!(h.delegates.calls("a"), 2);

        assert!(matches!(
            h.engine.retry_instance(&id, None).await,
            Err(EngineError::InvalidTransition { operation: "retry", .. })
        ));
    }

    #[tokio::test]
    async fn test_retry_after_parallel_failure_rejoins_merge() {
        let h = harness(ScriptedDelegates::new(Behavior::Succeed).with("a", Behavior::FailTimes(1)));
        let (id, instance) = h.run(fan_in(), json!({})).await;
        assert_eq!(instance.status, InstanceStatus::Failed);

        // `b` either finished and arrived at the merge or was cancelled
        // with the instance; both are picked up again
        let handle = h.engine.spawn();
        h.engine.retry_instance(&id, None).await.unwrap();
        let instance = h.engine.wait_until_terminal(&id, WAIT).await.unwrap();
        handle.shutdown().await;

        assert_eq!(instance.status, InstanceStatus::Completed);
        assert_eq!(h.delegates.calls("a"), 2);
        assert_eq!(h.row(&id, "join").await.unwrap().status, NodeStatus::Completed);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failure() {
        let definition = WorkflowDefinition::new("slow")
            .with_node(Node::start("start"))
            .with_node(Node::task("a", TaskKind::Verification).with_timeout(30))
            .with_node(Node::end("end"))
            .with_edge(Edge::new("start", "a"))
            .with_edge(Edge::new("a", "end"));

        let h = harness(
            ScriptedDelegates::new(Behavior::Succeed)
                .with("a", Behavior::Delay(Duration::from_secs(10))),
        );
        let (id, instance) = h.run(definition, json!({})).await;

        assert_eq!(instance.status, InstanceStatus::Failed);
        assert!(instance.failure_reason.unwrap().contains("timed out"));
        let row = h.row(&id, "a").await.unwrap();
        assert_eq!(row.status, NodeStatus::Failed);
        assert!(row.error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_unsatisfiable_merge_is_deadlock() {
        let definition = WorkflowDefinition::new("deadlock")
            .with_node(Node::start("start"))
            .with_node(Node::decision("check", "amount > 100"))
            .with_node(Node::task("high", TaskKind::Escalation))
            .with_node(Node::task("low", TaskKind::Notification))
            .with_node(Node::merge("join"))
            .with_node(Node::end("end"))
            .with_edge(Edge::new("start", "check"))
            .with_edge(Edge::when("check", "high", true))
            .with_edge(Edge::when("check", "low", false))
            .with_edge(Edge::new("high", "join"))
            .with_edge(Edge::new("low", "join"))
            .with_edge(Edge::new("join", "end"));

        let h = harness(ScriptedDelegates::new(Behavior::Succeed));
        let (id, instance) = h.run(definition, json!({"amount": 150})).await;

        assert_eq!(instance.status, InstanceStatus::Failed);
        let reason = instance.failure_reason.unwrap();
        assert!(reason.contains("Dependency deadlock"), "{}", reason);
        assert!(reason.contains("join"));
        assert!(h.row(&id, "join").await.is_none());
    }

    #[tokio::test]
    async fn test_stall_timeout_fails_idle_instance() {
        let config = EngineConfig {
            stall_timeout_ms: 40,
            ..test_config()
        };
        let h = harness_with(
            config,
            ScriptedDelegates::new(Behavior::Succeed)
                .with("a", Behavior::Delay(Duration::from_secs(10))),
        );
        let (_, instance) = h.run(linear(), json!({})).await;

        assert_eq!(instance.status, InstanceStatus::Failed);
        assert!(instance.failure_reason.unwrap().contains("stalled"));
    }

    #[tokio::test]
    async fn test_lifecycle_guards() {
        let h = harness(ScriptedDelegates::new(Behavior::Succeed));
        h.engine.register_definition(linear()).await.unwrap();
        let id = h.engine.create_instance("linear", json!({})).await.unwrap();

        assert!(matches!(
            h.engine.resume_instance(&id).await,
            Err(EngineError::InvalidTransition { operation: "resume", .. })
        ));
        h.engine.start_instance(&id).await.unwrap();
        assert!(matches!(
            h.engine.start_instance(&id).await,
            Err(EngineError::InvalidTransition { operation: "start", .. })
        ));
        assert!(matches!(
            h.engine.create_instance("missing", json!({})).await,
            Err(EngineError::DefinitionNotFound(_))
        ));
        assert!(matches!(
            h.engine.get_execution_status("nope").await,
            Err(EngineError::InstanceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_definition_rejected() {
        let h = harness(ScriptedDelegates::new(Behavior::Succeed));
        let broken = linear().with_edge(Edge::new("a", "ghost"));
        assert!(matches!(
            h.engine.register_definition(broken).await,
            Err(EngineError::DefinitionInvalid(_))
        ));
    }

    #[tokio::test]
    async fn test_notification_failure_does_not_block() {
        let engine = Engine::builder(test_config())
            .delegates(Arc::new(ScriptedDelegates::new(Behavior::Succeed)))
            .notifier(Arc::new(BrokenSink))
            .build();
        engine.register_definition(linear()).await.unwrap();

        let handle = engine.spawn();
        let id = engine.execute_workflow("linear", json!({})).await.unwrap();
        let instance = engine.wait_until_terminal(&id, WAIT).await.unwrap();
        handle.shutdown().await;

        assert_eq!(instance.status, InstanceStatus::Completed);
    }

    #[tokio::test]
    async fn test_estimated_completion_while_running() {
        let h = harness(
            ScriptedDelegates::new(Behavior::Succeed)
                .with("a", Behavior::Delay(Duration::from_secs(10))),
        );
        h.engine.register_definition(linear()).await.unwrap();
        let handle = h.engine.spawn();
        let id = h.engine.execute_workflow("linear", json!({})).await.unwrap();
        h.wait_for_calls("a", 1).await;

        let status = h.engine.get_execution_status(&id).await.unwrap();
        assert_eq!(status.status, InstanceStatus::Running);
        assert_eq!(status.current_step.as_deref(), Some("a"));
        assert_eq!(status.active_nodes, vec!["a"]);
        assert!(status.progress > 0.0 && status.progress < 100.0);
        assert!(status.estimated_completion.is_some());

        h.engine.cancel_instance(&id, None).await.unwrap();
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_demo_approval_definition() {
        let definition = crate::workflow::parser::parse_definition(
            include_str!("../../demos/approval.yaml"),
            crate::workflow::parser::DefinitionFormat::Yaml,
        )
        .unwrap();

        let h = harness(ScriptedDelegates::new(Behavior::Succeed));
        let (id, instance) = h
            .run(definition, json!({"milestoneId": "M-42", "amount": 25000, "preApproved": false}))
            .await;

        assert_eq!(instance.status, InstanceStatus::Completed);
        let status = h.engine.get_execution_status(&id).await.unwrap();
        for node in ["evidence", "notify_owner", "join", "escalate", "approve", "approved"] {
            assert!(status.completed_nodes.contains(&node.to_string()), "{} missing", node);
        }
        assert!(h.row(&id, "auto_approved").await.is_none());

        let join = h.row(&id, "join").await.unwrap();
        assert!(join.input.get("evidenceId").is_some());
        assert_eq!(join.input["recipients"], json!(["owner@example.com"]));
    }

    #[tokio::test]
    async fn test_data_flows_to_decision_through_tasks() {
        let definition = WorkflowDefinition::new("flow")
            .with_node(Node::start("start"))
            .with_node(Node::task("verify", TaskKind::Verification))
            .with_node(Node::decision("check", "amount >= 1000 && status == 'PENDING'"))
            .with_node(Node::end("big"))
            .with_node(Node::end("small"))
            .with_edge(Edge::new("start", "verify"))
            .with_edge(Edge::new("verify", "check"))
            .with_edge(Edge::when("check", "big", true))
            .with_edge(Edge::when("check", "small", false));

        let h = harness(ScriptedDelegates::new(Behavior::Succeed));
        let (id, instance) = h.run(definition, json!({"amount": 2500})).await;

        assert_eq!(instance.status, InstanceStatus::Completed);
        assert!(h.row(&id, "big").await.is_some());
        assert!(h.row(&id, "small").await.is_none());

        let check = h.row(&id, "check").await.unwrap();
        assert_eq!(check.input["verificationId"], json!("verify-1"));
        assert_eq!(check.node_type, NodeType::Decision);
    }
}
