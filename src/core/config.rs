use crate::core::errors::{FlowError, Result};
use serde::{Deserialize, Serialize};

/// Named capacities for output queues
pub struct QueueSizes;

impl QueueSizes {
    pub const SMALL: usize = 5;
    pub const MEDIUM: usize = 10;
    pub const LARGE: usize = 50;
    /// Never locks in practice
    pub const UNLIMITED: usize = usize::MAX;
}

/// Defaults applied to newly built nodes and to the shared worker pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    /// Maximum number of in-flight invocations per node
    pub default_concurrency_limit: usize,
    /// Capacity of every queue behind a node output
    pub default_queue_capacity: usize,
    /// Whether outputs start in exclusive (shared queue) mode
    pub default_exclusive_mode: bool,
    /// Whether outputs drop values instead of waiting while locked
    pub default_discard_if_locked: bool,
    /// Core threads of the shared runtime
    pub worker_threads: usize,
    /// Upper bound on threads running node functions
    pub max_blocking_threads: usize,
    /// Name given to pool threads
    pub thread_name: String,
}

impl Default for FlowConfig {
    fn default() -> Self {
        let cpu_count = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);

        Self {
            default_concurrency_limit: 1,
            default_queue_capacity: QueueSizes::UNLIMITED,
            default_exclusive_mode: true,
            default_discard_if_locked: false,
            worker_threads: cpu_count,
            max_blocking_threads: 512,
            thread_name: "nodeflow-worker".to_string(),
        }
    }
}

impl FlowConfig {
    pub fn validate(&self) -> Result<()> {
        if self.default_concurrency_limit == 0 {
            return Err(FlowError::configuration_field(
                "default_concurrency_limit must be greater than 0",
                "default_concurrency_limit",
            ));
        }
        if self.default_queue_capacity == 0 {
            return Err(FlowError::configuration_field(
                "default_queue_capacity must be greater than 0",
                "default_queue_capacity",
            ));
        }
        if self.worker_threads == 0 {
            return Err(FlowError::configuration_field(
                "worker_threads must be greater than 0",
                "worker_threads",
            ));
        }
        if self.max_blocking_threads == 0 {
            return Err(FlowError::configuration_field(
                "max_blocking_threads must be greater than 0",
                "max_blocking_threads",
            ));
        }
        if self.thread_name.is_empty() {
            return Err(FlowError::configuration_field(
                "thread_name must not be empty",
                "thread_name",
            ));
        }
        Ok(())
    }

    /// Small bounded queues and a small pool, for tests and constrained hosts
    pub fn conservative() -> Self {
        Self {
            default_queue_capacity: QueueSizes::SMALL,
            worker_threads: 2,
            max_blocking_threads: 16,
            ..Self::default()
        }
    }

    /// Deep queues and a wide pool
    pub fn throughput() -> Self {
        Self {
            default_queue_capacity: QueueSizes::LARGE,
            max_blocking_threads: 1024,
            ..Self::default()
        }
    }

    pub fn from_yaml_str(source: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(source: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(source)?;
        config.validate()?;
        Ok(config)
    }
}
