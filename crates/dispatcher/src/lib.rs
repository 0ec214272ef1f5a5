//! BatchDispatch Dispatcher
//!
//! Hands out numbered tasks to a fixed set of workers in adaptively sized
//! batches, and reports each completed batch to an optional post-batch hook.

pub mod dispatcher;
pub mod hook;
pub mod queue;
pub mod sizer;

pub use dispatcher::{Dispatcher, TaskOrder};
pub use hook::{AsyncPostBatchHook, FnHook, HookFailures, PostBatchHook};
pub use queue::TaskQueue;
pub use sizer::size_for;
