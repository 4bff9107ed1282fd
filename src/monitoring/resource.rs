//! Resource Usage Monitoring
//!
//! Samples CPU and memory of the engine process. The monitor loop takes
//! one sample per tick; the CLI prints the summary after a run.

use std::time::{Duration, Instant};

use log::{debug, warn};
use sysinfo::{get_current_pid, Pid, ProcessRefreshKind, System};

/// A single resource usage sample.
#[derive(Debug, Clone)]
pub struct ResourceSample {
    pub timestamp: Instant,
    /// CPU usage percentage (0-100+)
    pub cpu_usage: f32,
    /// Memory usage in megabytes
    pub memory_mb: u64,
    /// Node contexts running engine-wide when sampled
    pub active_nodes: usize,
}

/// Monitors resource usage of the engine process.
pub struct ResourceMonitor {
    system: System,
    process_id: Option<Pid>,
    samples: Vec<ResourceSample>,
    warmup_done: bool,
    last_sample: Option<Instant>,
    min_interval: Duration,
}

impl ResourceMonitor {
    pub fn new() -> Self {
        let process_id = match get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                warn!("Resource sampling disabled: {}", e);
                None
            }
        };

        Self {
            system: System::new(),
            process_id,
            samples: Vec::new(),
            warmup_done: false,
            last_sample: None,
            min_interval: Duration::from_millis(250),
        }
    }

    /// Sets the minimum interval between samples.
    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    /// Takes a sample tagged with the current number of active nodes.
    ///
    /// The first call only warms up CPU accounting. Later calls are
    /// rate-limited by `min_interval`.
    pub fn sample(&mut self, active_nodes: usize) {
        let Some(pid) = self.process_id else {
            return;
        };
        let now = Instant::now();
        let refresh_kind = ProcessRefreshKind::new().with_cpu().with_memory();

        if !self.warmup_done {
            self.system.refresh_processes_specifics(refresh_kind);
            self.warmup_done = true;
            self.last_sample = Some(now);
            return;
        }

        if let Some(last) = self.last_sample {
            if now.duration_since(last) < self.min_interval {
                return;
            }
        }

        self.system.refresh_processes_specifics(refresh_kind);
        self.last_sample = Some(now);

        if let Some(process) = self.system.process(pid) {
            let sample = ResourceSample {
                timestamp: now,
                cpu_usage: process.cpu_usage(),
                memory_mb: process.memory() / (1024 * 1024),
                active_nodes,
            };
            debug!(
                "Resource sample: cpu {:.1}%, mem {} MB, {} active nodes",
                sample.cpu_usage, sample.memory_mb, sample.active_nodes
            );
            self.samples.push(sample);
        }
    }

    /// Returns a human-readable summary of resource usage.
    pub fn get_summary(&self) -> String {
        if self.samples.is_empty() {
            return "No resource data collected".to_string();
        }

        format!(
            "Resource Usage:\n  Average CPU: {:.1}%\n  Peak Memory: {} MB\n  Peak Active Nodes: {}\n  Samples: {}",
            self.average_cpu(),
            self.peak_memory_mb(),
            self.peak_active_nodes(),
            self.samples.len()
        )
    }

    pub fn get_samples(&self) -> &[ResourceSample] {
        &self.samples
    }

    pub fn peak_memory_mb(&self) -> u64 {
        self.samples.iter().map(|s| s.memory_mb).max().unwrap_or(0)
    }

    pub fn peak_active_nodes(&self) -> usize {
        self.samples.iter().map(|s| s.active_nodes).max().unwrap_or(0)
    }

    pub fn average_cpu(&self) -> f32 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().map(|s| s.cpu_usage).sum::<f32>() / self.samples.len() as f32
    }
}

impl Default for ResourceMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_first_sample_is_warmup() {
        let mut monitor = ResourceMonitor::new();
        monitor.sample(0);
        assert!(monitor.get_samples().is_empty());
    }

    #[test]
    fn test_min_interval_rate_limits() {
        let mut monitor = ResourceMonitor::new().with_min_interval(Duration::from_millis(100));

        monitor.sample(0);
        monitor.sample(1);
        assert!(monitor.get_samples().is_empty());

        thread::sleep(Duration::from_millis(150));
        monitor.sample(3);
        assert_eq!(monitor.get_samples().len(), 1);
        assert_eq!(monitor.peak_active_nodes(), 3);
    }

    #[test]
    fn test_summary_format() {
        let mut monitor = ResourceMonitor::new().with_min_interval(Duration::from_millis(10));
        monitor.sample(0);
        thread::sleep(Duration::from_millis(20));
        monitor.sample(2);

        let summary = monitor.get_summary();
        assert!(summary.contains("Resource Usage"));
        assert!(summary.contains("Average CPU"));
        assert!(summary.contains("Peak Active Nodes: 2"));
        assert!(monitor.average_cpu() >= 0.0);
    }

    #[test]
    fn test_empty_monitor() {
        let monitor = ResourceMonitor::default();
        assert!(monitor.get_summary().contains("No resource data collected"));
        assert_eq!(monitor.peak_memory_mb(), 0);
        assert_eq!(monitor.average_cpu(), 0.0);
    }
}
