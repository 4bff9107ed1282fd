//! Monitoring Module
//!
//! Execution history and process resource tracking.
//!
//! # Components
//!
//! - [`ExecutionTimeline`]: Per-instance attempt history and Gantt charts
//! - [`ResourceMonitor`]: CPU and memory usage of the engine process

pub mod resource;
pub mod timeline;

pub use resource::{ResourceMonitor, ResourceSample};
pub use timeline::{ExecutionRecord, ExecutionTimeline};
