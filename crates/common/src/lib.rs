//! BatchDispatch common library
//!
//! This crate contains the types, configuration, errors and metrics shared by
//! the dispatcher and the per-process job runtime.

pub mod config;
pub mod error;
pub mod metrics;
pub mod types;

// Re-export commonly used types
pub use config::{BatchConfig, ClusterConfig, DispatchConfig, JobConfig, ObservabilityConfig};
pub use error::{DispatchError, Result};
pub use metrics::{DispatchMetrics, MetricsRegistry, WorkerMetrics};
pub use types::{Batch, JobRange, TaskIndex, WorkerId};
