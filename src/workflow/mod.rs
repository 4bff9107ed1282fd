//! Workflow Definition Module
//!
//! Data structures and utilities for defining, loading, validating and
//! planning workflow graphs.
//!
//! # Structure
//!
//! - [`model`]: Core data structures (Node, Edge, WorkflowDefinition)
//! - [`parser`]: YAML/JSON loading and saving
//! - [`validator`]: Structural validation and topological ordering
//! - [`planner`]: Execution plan building
//! - [`expression`]: Decision condition language
//! - [`state`]: Instance and per-node runtime state

pub mod expression;
pub mod model;
pub mod parser;
pub mod planner;
pub mod state;
pub mod validator;

pub use model::{BackoffStrategy, Edge, Node, NodeType, RetryPolicy, TaskKind, WorkflowDefinition};
pub use parser::{load_definition, save_definition};
pub use planner::{build_plan, ExecutionPlan, ExecutionStep};
pub use state::{InstanceStatus, NodeState, NodeStatus, WorkflowInstance};
pub use validator::validate_definition;
