//! Common error types for BatchDispatch
//!
//! Every failure in the system funnels into [`DispatchError`]. There is no
//! partial-failure mode: whatever the variant, the job is aborted. The variant
//! only decides the process exit code reported to the cluster scheduler.

use batchdispatch_proto::ProtoError;
use thiserror::Error;

/// Exit code for a job that completed normally
pub const EXIT_OK: i32 = 0;

/// Exit code for a failure during calculation, hooks or assembly
pub const EXIT_FAILURE: i32 = 1;

/// Exit code for invalid configuration, surfaced before any dispatch
pub const EXIT_CONFIG: i32 = 2;

/// Main error type for BatchDispatch
#[derive(Error, Debug)]
pub enum DispatchError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed or unexpected wire traffic
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtoError),

    /// Process group transport failures
    #[error("Transport error: {0}")]
    Transport(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Caller-supplied calculation or assembly failed
    #[error("Compute error: {0:#}")]
    Compute(anyhow::Error),

    /// Post-batch hook failed
    #[error("Post-batch hook error: {0:#}")]
    Hook(anyhow::Error),

    /// Another rank (or this one) aborted the process group
    #[error("Job aborted by rank {rank} with exit code {code}")]
    Aborted { rank: u32, code: i32 },

    /// Metrics registration errors
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<config::ConfigError> for DispatchError {
    fn from(err: config::ConfigError) -> Self {
        DispatchError::Config(err.to_string())
    }
}

impl From<serde_yaml::Error> for DispatchError {
    fn from(err: serde_yaml::Error) -> Self {
        DispatchError::Config(err.to_string())
    }
}

impl DispatchError {
    /// Process exit code for this failure
    pub fn exit_code(&self) -> i32 {
        match self {
            DispatchError::Config(_) => EXIT_CONFIG,
            DispatchError::Aborted { code, .. } if *code != EXIT_OK => *code,
            _ => EXIT_FAILURE,
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        DispatchError::Config(msg.into())
    }

    /// Create a protocol error for a message that violates the exchange order
    pub fn unexpected(msg: impl Into<String>) -> Self {
        DispatchError::Protocol(ProtoError::Malformed(msg.into()))
    }

    /// Create a transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        DispatchError::Transport(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        DispatchError::Internal(msg.into())
    }
}

/// Result type alias for BatchDispatch operations
pub type Result<T> = std::result::Result<T, DispatchError>;
