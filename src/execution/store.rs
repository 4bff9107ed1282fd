//! Repositories
//!
//! Persistence seams for definitions, instances and per-node state rows.
//! The engine only talks to these traits; the in-memory implementations
//! are used by the CLI and the tests.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::{EngineError, Result};
use crate::workflow::{InstanceStatus, NodeState, WorkflowDefinition, WorkflowInstance};

#[async_trait]
pub trait DefinitionRepository: Send + Sync {
    /// Fails with `DefinitionNotFound` for unknown ids.
    async fn get_definition(&self, id: &str) -> Result<WorkflowDefinition>;

    async fn save_definition(&self, definition: WorkflowDefinition) -> Result<()>;
}

#[async_trait]
pub trait InstanceRepository: Send + Sync {
    async fn create(&self, instance: WorkflowInstance) -> Result<()>;

    /// Fails with `InstanceNotFound` for unknown ids.
    async fn get(&self, instance_id: &str) -> Result<WorkflowInstance>;

    /// Replaces the stored record.
    async fn update(&self, instance: &WorkflowInstance) -> Result<()>;

    async fn list_by_status(&self, status: InstanceStatus) -> Result<Vec<WorkflowInstance>>;
}

#[async_trait]
pub trait StateRepository: Send + Sync {
    async fn get(&self, instance_id: &str, node_id: &str) -> Result<Option<NodeState>>;

    /// Creates or replaces the row for `(state.instance_id, state.node_id)`.
    async fn upsert(&self, state: &NodeState) -> Result<()>;

    async fn list(&self, instance_id: &str) -> Result<Vec<NodeState>>;
}

#[derive(Default)]
pub struct InMemoryDefinitions {
    definitions: RwLock<HashMap<String, WorkflowDefinition>>,
}

impl InMemoryDefinitions {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DefinitionRepository for InMemoryDefinitions {
    async fn get_definition(&self, id: &str) -> Result<WorkflowDefinition> {
        self.definitions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::DefinitionNotFound(id.to_string()))
    }

    async fn save_definition(&self, definition: WorkflowDefinition) -> Result<()> {
        self.definitions
            .write()
            .await
            .insert(definition.id.clone(), definition);
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryInstances {
    instances: RwLock<HashMap<String, WorkflowInstance>>,
}

impl InMemoryInstances {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl InstanceRepository for InMemoryInstances {
    async fn create(&self, instance: WorkflowInstance) -> Result<()> {
        let mut instances = self.instances.write().await;
        if instances.contains_key(&instance.id) {
            return Err(EngineError::Store(format!(
                "instance '{}' already exists",
                instance.id
            )));
        }
        instances.insert(instance.id.clone(), instance);
        Ok(())
    }

    async fn get(&self, instance_id: &str) -> Result<WorkflowInstance> {
        self.instances
            .read()
            .await
            .get(instance_id)
            .cloned()
            .ok_or_else(|| EngineError::InstanceNotFound(instance_id.to_string()))
    }

    async fn update(&self, instance: &WorkflowInstance) -> Result<()> {
        let mut instances = self.instances.write().await;
        match instances.get_mut(&instance.id) {
            Some(stored) => {
                *stored = instance.clone();
                Ok(())
            }
            None => Err(EngineError::InstanceNotFound(instance.id.clone())),
        }
    }

    async fn list_by_status(&self, status: InstanceStatus) -> Result<Vec<WorkflowInstance>> {
        Ok(self
            .instances
            .read()
            .await
            .values()
            .filter(|i| i.status == status)
            .cloned()
            .collect())
    }
}

#[derive(Default)]
pub struct InMemoryStates {
    states: RwLock<HashMap<(String, String), NodeState>>,
}

impl InMemoryStates {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateRepository for InMemoryStates {
    async fn get(&self, instance_id: &str, node_id: &str) -> Result<Option<NodeState>> {
        Ok(self
            .states
            .read()
            .await
            .get(&(instance_id.to_string(), node_id.to_string()))
            .cloned())
    }

    async fn upsert(&self, state: &NodeState) -> Result<()> {
        self.states.write().await.insert(
            (state.instance_id.clone(), state.node_id.clone()),
            state.clone(),
        );
        Ok(())
    }

    async fn list(&self, instance_id: &str) -> Result<Vec<NodeState>> {
        let mut rows: Vec<NodeState> = self
            .states
            .read()
            .await
            .values()
            .filter(|s| s.instance_id == instance_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.start_date.cmp(&b.start_date).then(a.node_id.cmp(&b.node_id)));
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{Node, NodeStatus, NodeType};
    use serde_json::json;

    #[tokio::test]
    async fn test_definitions_roundtrip() {
        let repo = InMemoryDefinitions::new();
        let def = WorkflowDefinition::new("wf").with_node(Node::start("start"));
        repo.save_definition(def).await.unwrap();

        assert_eq!(repo.get_definition("wf").await.unwrap().nodes.len(), 1);
        assert!(matches!(
            repo.get_definition("nope").await,
            Err(EngineError::DefinitionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_instances() {
        let repo = InMemoryInstances::new();
        let mut instance = WorkflowInstance::with_id("i1", "wf", json!({}));
        repo.create(instance.clone()).await.unwrap();
        assert!(repo.create(instance.clone()).await.is_err());

        instance.status = InstanceStatus::Running;
        repo.update(&instance).await.unwrap();
        assert_eq!(repo.get("i1").await.unwrap().status, InstanceStatus::Running);
        assert_eq!(repo.list_by_status(InstanceStatus::Running).await.unwrap().len(), 1);
        assert!(repo.list_by_status(InstanceStatus::Paused).await.unwrap().is_empty());

        let ghost = WorkflowInstance::with_id("ghost", "wf", json!({}));
        assert!(matches!(
            repo.update(&ghost).await,
            Err(EngineError::InstanceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_states_scoped_by_instance() {
        let repo = InMemoryStates::new();
        let mut a = NodeState::new("i1", "a", NodeType::Task);
        a.mark_running(json!({}), 0);
        repo.upsert(&a).await.unwrap();
        repo.upsert(&NodeState::new("i2", "a", NodeType::Task)).await.unwrap();

        a.mark_completed(json!({"ok": true}), 5);
        repo.upsert(&a).await.unwrap();

        let rows = repo.list("i1").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, NodeStatus::Completed);
        assert!(repo.get("i2", "a").await.unwrap().is_some());
        assert!(repo.get("i3", "a").await.unwrap().is_none());
    }
}
