//! Configuration structures for BatchDispatch
//!
//! A job is configured by a [`JobConfig`] with three optional sections. Files
//! are YAML; [`JobConfig::load`] additionally layers `BATCHDISPATCH_*`
//! environment variables on top so launchers can inject the process rank
//! without rewriting files (`BATCHDISPATCH_CLUSTER__RANK=3`).

use crate::error::{DispatchError, Result};
use crate::types::JobRange;
use batchdispatch_proto::DEFAULT_MAX_FRAME_BYTES;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Environment prefix used by [`JobConfig::load`]
pub const ENV_PREFIX: &str = "BATCHDISPATCH";

/// Top-level configuration for one job
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobConfig {
    /// Batch sizing and task-space options
    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// Process group membership
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Logging configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Dispatch options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Compute threads per process (0 = CPU count)
    #[serde(default)]
    pub threads: usize,

    /// Floor on batch size
    #[serde(default = "default_min_dispatch")]
    pub min_dispatch: usize,

    /// Ceiling on batch size
    #[serde(default = "default_max_dispatch")]
    pub max_dispatch: usize,

    /// Fixed batch size, overrides min/max
    #[serde(default)]
    pub exact_dispatch: Option<usize>,

    /// Rank 0 dispatches only and does not compute
    #[serde(default)]
    pub root_dispatch_only: bool,

    /// First task index to run (default 0)
    #[serde(default)]
    pub start_index: Option<usize>,

    /// One past the last task index to run (default: number of tasks)
    #[serde(default)]
    pub end_index: Option<usize>,

    /// Randomize task order before dispatch
    #[serde(default = "default_shuffle")]
    pub shuffle: bool,

    /// Seed for the shuffle, for reproducible dispatch order
    #[serde(default)]
    pub shuffle_seed: Option<u64>,

    /// Enable the deadlock watchdog
    #[serde(default)]
    pub deadlock_detect: bool,

    /// Seconds between deadlock checks
    #[serde(default = "default_deadlock_check_interval")]
    pub deadlock_check_interval_secs: u64,
}

/// Bounds used by the batch sizer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchConfig {
    pub min_per_dispatch: usize,
    pub max_per_dispatch: usize,
    pub exact_dispatch: Option<usize>,
}

/// Process group membership and transport
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// This process's rank
    #[serde(default)]
    pub rank: u32,

    /// Number of processes in the group
    #[serde(default = "default_size")]
    pub size: u32,

    /// Address rank 0 listens on and every other rank connects to
    #[serde(default = "default_root_address")]
    pub root_address: String,

    /// Connection attempts before a worker gives up on rank 0
    #[serde(default = "default_connect_retries")]
    pub connect_retries: u32,

    /// Delay between connection attempts in milliseconds
    #[serde(default = "default_connect_backoff")]
    pub connect_backoff_ms: u64,

    /// Largest accepted wire frame
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Emit JSON log lines instead of plain text
    #[serde(default)]
    pub structured_logging: bool,
}

/// Default value functions
fn default_min_dispatch() -> usize {
    5
}

fn default_max_dispatch() -> usize {
    100
}

fn default_shuffle() -> bool {
    true
}

fn default_deadlock_check_interval() -> u64 {
    10
}

fn default_size() -> u32 {
    1
}

fn default_root_address() -> String {
    "127.0.0.1:7420".to_string()
}

fn default_connect_retries() -> u32 {
    30
}

fn default_connect_backoff() -> u64 {
    1000
}

fn default_max_frame_bytes() -> usize {
    DEFAULT_MAX_FRAME_BYTES
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            threads: 0,
            min_dispatch: default_min_dispatch(),
            max_dispatch: default_max_dispatch(),
            exact_dispatch: None,
            root_dispatch_only: false,
            start_index: None,
            end_index: None,
            shuffle: default_shuffle(),
            shuffle_seed: None,
            deadlock_detect: false,
            deadlock_check_interval_secs: default_deadlock_check_interval(),
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            rank: 0,
            size: default_size(),
            root_address: default_root_address(),
            connect_retries: default_connect_retries(),
            connect_backoff_ms: default_connect_backoff(),
            max_frame_bytes: default_max_frame_bytes(),
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            structured_logging: false,
        }
    }
}

impl JobConfig {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            DispatchError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        let config: JobConfig = serde_yaml::from_str(&content).map_err(|e| {
            DispatchError::Config(format!(
                "Failed to parse config file {}: {}",
                path.display(),
                e
            ))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from an optional file with environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }

        let config: JobConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.dispatch.validate()?;
        self.cluster.validate()
    }
}

impl DispatchConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.batch_config().validate()?;

        if let (Some(start), Some(end)) = (self.start_index, self.end_index) {
            if start >= end {
                return Err(DispatchError::config(format!(
                    "start_index ({}) must be below end_index ({})",
                    start, end
                )));
            }
        }
        if self.deadlock_detect && self.deadlock_check_interval_secs == 0 {
            return Err(DispatchError::config(
                "deadlock_check_interval_secs must be positive",
            ));
        }
        Ok(())
    }

    /// Batch sizing bounds
    pub fn batch_config(&self) -> BatchConfig {
        BatchConfig {
            min_per_dispatch: self.min_dispatch,
            max_per_dispatch: self.max_dispatch,
            exact_dispatch: self.exact_dispatch,
        }
    }

    /// Resolve the dispatched range against the job's task count
    pub fn job_range(&self, num_tasks: usize) -> Result<JobRange> {
        JobRange::new(
            self.start_index.unwrap_or(0),
            self.end_index.unwrap_or(num_tasks),
            num_tasks,
        )
    }

    /// Compute threads, with 0 meaning one per CPU
    pub fn resolved_threads(&self) -> usize {
        if self.threads == 0 {
            num_cpus::get()
        } else {
            self.threads
        }
    }

    /// Get the deadlock check interval as Duration
    pub fn deadlock_check_interval(&self) -> Duration {
        Duration::from_secs(self.deadlock_check_interval_secs)
    }
}

impl BatchConfig {
    /// Bounds with no exact size
    pub fn new(min_per_dispatch: usize, max_per_dispatch: usize) -> Self {
        Self {
            min_per_dispatch,
            max_per_dispatch,
            exact_dispatch: None,
        }
    }

    /// Bounds with a fixed batch size
    pub fn exact(exact_dispatch: usize) -> Self {
        Self {
            exact_dispatch: Some(exact_dispatch),
            ..Self::default()
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.min_per_dispatch == 0 {
            return Err(DispatchError::config("min_dispatch must be at least 1"));
        }
        if self.max_per_dispatch < self.min_per_dispatch {
            return Err(DispatchError::config(format!(
                "max_dispatch ({}) must be >= min_dispatch ({})",
                self.max_per_dispatch, self.min_per_dispatch
            )));
        }
        if self.exact_dispatch == Some(0) {
            return Err(DispatchError::config("exact_dispatch must be positive"));
        }
        Ok(())
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self::new(default_min_dispatch(), default_max_dispatch())
    }
}

impl ClusterConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.size == 0 {
            return Err(DispatchError::config("Process group size must be at least 1"));
        }
        if self.rank >= self.size {
            return Err(DispatchError::config(format!(
                "Rank {} is outside a process group of size {}",
                self.rank, self.size
            )));
        }
        if self.size > 1 && self.root_address.is_empty() {
            return Err(DispatchError::config(
                "root_address is required for a multi-process group",
            ));
        }
        Ok(())
    }

    /// Get the connect backoff as Duration
    pub fn connect_backoff(&self) -> Duration {
        Duration::from_millis(self.connect_backoff_ms)
    }
}
