//! Configuration types for gpuslice

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Reconcile loop configuration
    pub controller: ControllerConfig,
    /// Conflict retry configuration
    pub retry: RetryConfig,
    /// Marker names shared with the webhook and node agents
    pub labels: LabelConfig,
    /// Emulated node configuration
    pub emulator: EmulatorConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl DaemonConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> Result<Self, crate::SliceError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            crate::SliceError::Config(format!("Failed to read config file: {}", e))
        })?;
        toml::from_str(&content)
            .map_err(|e| crate::SliceError::Config(format!("Failed to parse config: {}", e)))
    }
}

/// Reconcile loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Number of concurrent reconcile workers
    pub workers: usize,
    /// Graceful-termination grace period in seconds
    pub grace_period_secs: u64,
    /// Delay before the first gate-clearing attempt in milliseconds
    pub ungate_delay_ms: u64,
    /// Requeue interval while waiting on the node agent in seconds
    pub agent_wait_secs: u64,
    /// Lower bound of the randomized no-capacity backoff in seconds
    pub no_capacity_min_secs: u64,
    /// Upper bound of the randomized no-capacity backoff in seconds
    pub no_capacity_max_secs: u64,
    /// Requeue interval for a stale boot id in seconds
    pub stale_boot_requeue_secs: u64,
    /// Requeue interval while node resources are unpublished in seconds
    pub unpublished_requeue_secs: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            grace_period_secs: 30,
            ungate_delay_ms: 1000,
            agent_wait_secs: 2,
            no_capacity_min_secs: 1,
            no_capacity_max_secs: 10,
            stale_boot_requeue_secs: 10,
            unpublished_requeue_secs: 5,
        }
    }
}

impl ControllerConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    pub fn ungate_delay(&self) -> Duration {
        Duration::from_millis(self.ungate_delay_ms)
    }

    pub fn agent_wait(&self) -> Duration {
        Duration::from_secs(self.agent_wait_secs)
    }

    pub fn stale_boot_requeue(&self) -> Duration {
        Duration::from_secs(self.stale_boot_requeue_secs)
    }

    pub fn unpublished_requeue(&self) -> Duration {
        Duration::from_secs(self.unpublished_requeue_secs)
    }
}

/// Bounded retry for optimistic-concurrency conflicts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry in milliseconds
    pub base_delay_ms: u64,
    /// Cap on the delay between retries in milliseconds
    pub max_delay_ms: u64,
    /// Fraction of the delay added as random jitter
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay_ms: 10,
            max_delay_ms: 500,
            jitter: 0.1,
        }
    }
}

/// Names of markers shared with the webhook, node agents and workloads
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LabelConfig {
    /// Scheduling gate placed on workloads by the webhook
    pub gate_name: String,
    /// Finalizer managed by the controller
    pub finalizer_name: String,
    /// Node-selector key used to pin a workload to its node
    pub node_selector_key: String,
    /// Node label that opts a node into slice management
    pub managed_label: String,
    /// Workload label set by the webhook on mutated workloads
    pub mutated_label: String,
    /// Substring identifying slice resource-limit keys
    pub resource_marker: String,
}

impl Default for LabelConfig {
    fn default() -> Self {
        Self {
            gate_name: "gpuslice.io/accelerator".to_string(),
            finalizer_name: "gpuslice.io/accelerator".to_string(),
            node_selector_key: "kubernetes.io/hostname".to_string(),
            managed_label: "gpuslice.io/managed".to_string(),
            mutated_label: "gpuslice.io/mutated".to_string(),
            resource_marker: "mig-".to_string(),
        }
    }
}

/// Emulated node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmulatorConfig {
    /// Number of emulated nodes
    pub nodes: u32,
    /// GPUs per emulated node
    pub gpus_per_node: u32,
    /// Reported GPU model
    pub gpu_model: String,
    /// Agent poll interval in milliseconds
    pub agent_interval_ms: u64,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            nodes: 2,
            gpus_per_node: 1,
            gpu_model: "NVIDIA A100-PCIE-40GB".to_string(),
            agent_interval_ms: 500,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
    /// Log format (json or text)
    pub format: String,
    /// Log file path (if any)
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
            file: None,
        }
    }
}
