//! Workflow Execution Module
//!
//! Runs workflow instances: dispatching ready nodes, executing them,
//! retrying failures and tracking lifecycle transitions.
//!
//! # Architecture
//!
//! - [`engine`]: Lifecycle operations plus the dispatcher and monitor loops
//! - [`scheduler`]: Pending/active/delayed queues and merge barriers
//! - [`nodes`]: Executors for each node type and the task registry
//! - [`context`]: Per-attempt execution context and results
//! - [`delegates`]: External business services and the notification sink
//! - [`store`]: Repository traits with in-memory implementations
//! - [`config`]: Engine tunables

pub mod config;
pub mod context;
pub mod delegates;
pub mod engine;
pub mod nodes;
pub mod scheduler;
pub mod store;

pub use config::EngineConfig;
pub use context::{ExecutionContext, ExecutionResult};
pub use delegates::{
    DelegateRecord, InstanceEvent, InstanceEventKind, LogNotificationSink, NotificationSink,
    SimulatedDelegates, TaskDelegates,
};
pub use engine::{Engine, EngineBuilder, EngineHandle, ExecutionStatus};
pub use nodes::{NodeExecutor, TaskHandler, TaskRegistry};
pub use store::{
    DefinitionRepository, InMemoryDefinitions, InMemoryInstances, InMemoryStates,
    InstanceRepository, StateRepository,
};
