//! Execution Timeline
//!
//! Per-instance execution history: one [`ExecutionRecord`] per node
//! attempt, used by the status query and for Gantt chart reports.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::workflow::NodeType;

/// Outcome of one node execution attempt.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRecord {
    pub node_id: String,
    pub node_type: NodeType,

    /// 1 for the first attempt, incremented per retry
    pub attempt: u32,
    pub success: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
}

/// Ordered execution history of one workflow instance.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ExecutionTimeline {
    records: Vec<ExecutionRecord>,
}

impl ExecutionTimeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records(records: Vec<ExecutionRecord>) -> Self {
        Self { records }
    }

    /// Appends a finished attempt.
    pub fn record(&mut self, record: ExecutionRecord) {
        self.records.push(record);
    }

    pub fn records(&self) -> &[ExecutionRecord] {
        &self.records
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Number of attempts recorded for a node.
    pub fn attempts(&self, node_id: &str) -> usize {
        self.records.iter().filter(|r| r.node_id == node_id).count()
    }

    /// Duration of the latest attempt per node in milliseconds.
    pub fn get_durations(&self) -> HashMap<String, u64> {
        self.records
            .iter()
            .map(|r| (r.node_id.clone(), r.duration_ms))
            .collect()
    }

    /// Wall-clock span from the first start to the last finish.
    pub fn span_ms(&self) -> u64 {
        let start = self.records.iter().map(|r| r.started_at).min();
        let end = self.records.iter().map(|r| r.finished_at).max();
        match (start, end) {
            (Some(start), Some(end)) => (end - start).num_milliseconds().max(0) as u64,
            _ => 0,
        }
    }

    /// Generates an ASCII Gantt chart representation.
    ///
    /// Each attempt is a bar placed relative to the first start; failed
    /// attempts are drawn with `x` instead of `#`.
    pub fn gantt_chart(&self) -> String {
        let mut output = String::from("\nExecution Timeline:\n\n");

        let Some(origin) = self.records.iter().map(|r| r.started_at).min() else {
            return output;
        };

        let total_time = self.span_ms().max(1);

        // Scale to 50 characters width
        let scale = 50.0 / total_time as f64;

        let mut sorted: Vec<&ExecutionRecord> = self.records.iter().collect();
        sorted.sort_by_key(|r| r.started_at);

        for record in sorted {
            let offset = (record.started_at - origin).num_milliseconds().max(0) as u64;
            let start_pos = (offset as f64 * scale) as usize;
            let width = (record.duration_ms as f64 * scale).max(1.0) as usize;

            let mark = if record.success { "#" } else { "x" };
            let mut bar = " ".repeat(start_pos);
            bar.push_str(&mark.repeat(width));

            output.push_str(&format!(
                "{:12} |{:<50}| ({} ms)\n",
                truncate(&record.node_id, 12),
                bar,
                record.duration_ms
            ));
        }

        output.push_str(&format!("\nTotal: {} ms\n", total_time));
        output
    }
}

/// Truncates a string to a maximum length.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        format!("{:width$}", s, width = max_len)
    } else {
        let head: String = s.chars().take(max_len - 3).collect();
        format!("{}...", head)
    }
}
