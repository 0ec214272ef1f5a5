//! BatchDispatch Worker
//!
//! Per-process job runtime: the process group transports, the dispatch
//! protocol between rank 0 and remote workers, and the coordinator that takes
//! one rank from start-up through compute, barrier and final assembly.

pub mod abort;
pub mod coordinator;
pub mod group;
pub mod protocol;
pub mod watchdog;

pub use abort::abort_and_exit;
pub use coordinator::{ComputeContext, DispatchMode, JobCoordinator, JobSummary, TaskCalculator};
pub use group::{AbortNotice, AbortSignal, LocalGroup, ProcessGroup, TcpGroup};
pub use protocol::{request_batch, serve, BatchSource};
pub use watchdog::DeadlockWatchdog;
