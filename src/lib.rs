//! MilestoneFlow - Workflow Execution Engine
//!
//! Executes directed workflow graphs that model milestone processes:
//! verification, evidence collection, escalation, notification and
//! approval tasks joined by decisions, parallel fan-outs and merges.
//! Instances can be paused, resumed, cancelled and retried while a
//! dispatcher loop runs ready nodes and a monitor loop enforces timeouts.
//!
//! # Architecture
//!
//! The library is organized into three main modules:
//!
//! - [`workflow`]: Definitions, parsing, validation, planning and state
//! - [`execution`]: The engine, its scheduler and the node executors
//! - [`monitoring`]: Execution history and resource tracking
//!
//! # Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use milestone_flow::execution::{Engine, EngineConfig};
//! use milestone_flow::load_definition;
//!
//! #[tokio::main]
//! async fn main() -> milestone_flow::Result<()> {
//!     let definition = load_definition("approval.yaml")?;
//!     let definition_id = definition.id.clone();
//!
//!     let engine = Engine::builder(EngineConfig::default()).build();
//!     engine.register_definition(definition).await?;
//!     let handle = engine.spawn();
//!
//!     let id = engine
//!         .execute_workflow(&definition_id, serde_json::json!({"amount": 150}))
//!         .await?;
//!     engine.wait_until_terminal(&id, Duration::from_secs(60)).await?;
//!
//!     let status = engine.get_execution_status(&id).await?;
//!     println!("{}: {:.0}%", status.status, status.progress);
//!     handle.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod execution;
pub mod monitoring;
pub mod workflow;

// Re-export commonly used types
pub use error::{EngineError, Result};
pub use execution::engine::{Engine, ExecutionStatus};
pub use workflow::model::{Edge, Node, NodeType, WorkflowDefinition};
pub use workflow::parser::load_definition;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "MilestoneFlow";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_version() {
        assert!(!VERSION.is_empty());
        assert!(VERSION.contains('.'));
    }

    #[test]
    fn test_app_name() {
        assert_eq!(APP_NAME, "MilestoneFlow");
    }

    #[test]
    fn test_module_exports_node() {
        let node = Node::start("begin");
        assert_eq!(node.id, "begin");
        assert_eq!(node.node_type, NodeType::Start);
    }

    #[test]
    fn test_module_exports_definition() {
        let definition = WorkflowDefinition::new("empty");
        assert!(definition.is_empty());
    }
}
