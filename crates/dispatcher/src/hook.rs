//! Post-batch hooks
//!
//! A hook learns about each batch once the worker that held it asks for more
//! work. [`FnHook`] runs inline, inside the dispatcher's critical section.
//! [`AsyncPostBatchHook`] hands each batch to its own thread pool and returns
//! immediately, so slow hook work (writing results, merging curves) does not
//! hold up dispatch.

use batchdispatch_common::error::{DispatchError, Result};
use batchdispatch_common::{Batch, TaskIndex, WorkerId};
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Callback invoked once per completed batch
pub trait PostBatchHook: Send + Sync {
    /// `batch` was handed to `worker` and that worker has since asked for more
    fn batch_processed(&self, batch: &[TaskIndex], worker: WorkerId) -> anyhow::Result<()>;

    /// Wait for outstanding hook work; called once after the main loop
    fn shutdown(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Synchronous hook backed by a closure
pub struct FnHook<F> {
    f: F,
}

impl<F> FnHook<F>
where
    F: Fn(&[TaskIndex], WorkerId) -> anyhow::Result<()> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> PostBatchHook for FnHook<F>
where
    F: Fn(&[TaskIndex], WorkerId) -> anyhow::Result<()> + Send + Sync,
{
    fn batch_processed(&self, batch: &[TaskIndex], worker: WorkerId) -> anyhow::Result<()> {
        (self.f)(batch, worker)
    }
}

/// One failed unit of asynchronous hook work
#[derive(Debug, Clone)]
pub struct HookFailure {
    pub worker: WorkerId,
    pub batch_len: usize,
    pub error: String,
}

/// Every failure raised by asynchronous hook units, reported at shutdown
#[derive(Error, Debug)]
#[error("{} post-batch hook unit(s) failed{}", .failures.len(), first_failure(.failures))]
pub struct HookFailures {
    pub failures: Vec<HookFailure>,
}

fn first_failure(failures: &[HookFailure]) -> String {
    match failures.first() {
        Some(first) => format!(
            "; first: worker {} ({} tasks): {}",
            first.worker, first.batch_len, first.error
        ),
        None => String::new(),
    }
}

/// Raised when batches arrive after [`PostBatchHook::shutdown`]
#[derive(Error, Debug)]
#[error("Asynchronous post-batch hook has been shut down")]
pub struct HookShutDown;

struct WorkUnit {
    batch: Batch,
    worker: WorkerId,
}

type Handler = dyn Fn(&[TaskIndex], WorkerId) -> anyhow::Result<()> + Send + Sync;

/// Hook that processes batches on a pool of background threads
///
/// With one thread, batches are handled strictly in the order they were
/// submitted. With more, they are handled concurrently in no particular order.
/// The pool is not finalised on its own: call [`PostBatchHook::shutdown`]
/// exactly once before relying on anything the handler wrote.
pub struct AsyncPostBatchHook {
    sender: Mutex<Option<Sender<WorkUnit>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    failures: Arc<Mutex<Vec<HookFailure>>>,
    submitted: AtomicU64,
    completed: Arc<AtomicU64>,
}

impl AsyncPostBatchHook {
    /// Start `num_threads` threads running `handler`; zero threads is a config error
    pub fn new<F>(num_threads: usize, handler: F) -> Result<Self>
    where
        F: Fn(&[TaskIndex], WorkerId) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        if num_threads == 0 {
            return Err(DispatchError::config(
                "Asynchronous post-batch hook needs at least one thread",
            ));
        }
        let (sender, receiver) = channel::unbounded::<WorkUnit>();
        let handler: Arc<Handler> = Arc::new(handler);
        let failures = Arc::new(Mutex::new(Vec::new()));
        let completed = Arc::new(AtomicU64::new(0));

        let threads = (0..num_threads)
            .map(|i| {
                let receiver = receiver.clone();
                let handler = handler.clone();
                let failures = failures.clone();
                let completed = completed.clone();
                std::thread::Builder::new()
                    .name(format!("post-batch-hook-{}", i))
                    .spawn(move || hook_loop(receiver, handler, failures, completed))
            })
            .collect::<std::io::Result<Vec<_>>>()?;

        debug!("Started asynchronous post-batch hook with {} threads", num_threads);

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            threads: Mutex::new(threads),
            failures,
            submitted: AtomicU64::new(0),
            completed,
        })
    }

    /// Batches submitted so far
    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Acquire)
    }

    /// Batches whose handler has returned (successfully or not)
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }

    /// Batches queued or running
    pub fn pending(&self) -> u64 {
        self.submitted().saturating_sub(self.completed())
    }
}

fn hook_loop(
    receiver: Receiver<WorkUnit>,
    handler: Arc<Handler>,
    failures: Arc<Mutex<Vec<HookFailure>>>,
    completed: Arc<AtomicU64>,
) {
    for unit in receiver.iter() {
        trace!(
            "Running post-batch hook for worker {} ({} tasks)",
            unit.worker,
            unit.batch.len()
        );

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler(&unit.batch, unit.worker)));
        let error = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(format!("{:#}", e)),
            Err(payload) => Some(panic_message(payload.as_ref())),
        };

        if let Some(error) = error {
            warn!(
                "Post-batch hook failed for worker {} ({} tasks): {}",
                unit.worker,
                unit.batch.len(),
                error
            );
            failures.lock().push(HookFailure {
                worker: unit.worker,
                batch_len: unit.batch.len(),
                error,
            });
        }
        completed.fetch_add(1, Ordering::AcqRel);
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("panicked: {}", msg)
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("panicked: {}", msg)
    } else {
        "panicked".to_string()
    }
}

impl PostBatchHook for AsyncPostBatchHook {
    fn batch_processed(&self, batch: &[TaskIndex], worker: WorkerId) -> anyhow::Result<()> {
        let sender = self.sender.lock();
        let sender = sender.as_ref().ok_or(HookShutDown)?;
        sender
            .send(WorkUnit {
                batch: batch.to_vec(),
                worker,
            })
            .map_err(|_| HookShutDown)?;
        self.submitted.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Stop accepting batches, wait for every queued unit, then report failures
    fn shutdown(&self) -> anyhow::Result<()> {
        let sender = self.sender.lock().take().ok_or(HookShutDown)?;
        drop(sender);

        debug!(
            "Waiting on {} pending post-batch hook units",
            self.pending()
        );

        let threads = std::mem::take(&mut *self.threads.lock());
        for thread in threads {
            if thread.join().is_err() {
                self.failures.lock().push(HookFailure {
                    worker: 0,
                    batch_len: 0,
                    error: "hook thread terminated abnormally".to_string(),
                });
            }
        }

        let failures = std::mem::take(&mut *self.failures.lock());
        if failures.is_empty() {
            debug!("Post-batch hook drained: {} batches", self.completed());
            Ok(())
        } else {
            Err(HookFailures { failures }.into())
        }
    }
}

impl Drop for AsyncPostBatchHook {
    fn drop(&mut self) {
        if self.sender.get_mut().is_some() {
            warn!(
                "Asynchronous post-batch hook dropped without shutdown, {} units may be lost",
                self.pending()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_fn_hook_delegates() {
        let hook = FnHook::new(|batch: &[TaskIndex], worker| {
            anyhow::ensure!(batch.len() == 2 && worker == 4, "unexpected call");
            Ok(())
        });
        assert!(hook.batch_processed(&[1, 2], 4).is_ok());
        assert!(hook.batch_processed(&[1], 4).is_err());
        assert!(hook.shutdown().is_ok());
    }

    #[test]
    fn test_single_thread_preserves_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = seen.clone();
        let hook = AsyncPostBatchHook::new(1, move |batch: &[TaskIndex], _| {
            // slow first unit must still finish first
            if batch[0] == 0 {
                std::thread::sleep(Duration::from_millis(20));
            }
            recorder.lock().push(batch[0]);
            Ok(())
        })
        .unwrap();

        for i in 0..50 {
            hook.batch_processed(&[i], 0).unwrap();
        }
        hook.shutdown().unwrap();

        assert_eq!(*seen.lock(), (0..50).collect::<Vec<TaskIndex>>());
    }

    #[test]
    fn test_shutdown_drains_every_unit_once() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = seen.clone();
        let hook = AsyncPostBatchHook::new(4, move |batch: &[TaskIndex], worker| {
            std::thread::sleep(Duration::from_millis(1));
            recorder.lock().push((worker, batch.to_vec()));
            Ok(())
        })
        .unwrap();

        for i in 0..200u32 {
            hook.batch_processed(&[i, i + 1000], i % 5).unwrap();
        }
        hook.shutdown().unwrap();

        assert_eq!(hook.submitted(), 200);
        assert_eq!(hook.completed(), 200);
        assert_eq!(hook.pending(), 0);

        let mut firsts: Vec<TaskIndex> = seen.lock().iter().map(|(_, b)| b[0]).collect();
        firsts.sort_unstable();
        assert_eq!(firsts, (0..200).collect::<Vec<_>>());
    }

    #[test]
    fn test_submit_does_not_block() {
        let (release_tx, release_rx) = channel::bounded::<()>(0);
        let hook = AsyncPostBatchHook::new(1, move |_: &[TaskIndex], _| {
            let _ = release_rx.recv();
            Ok(())
        })
        .unwrap();

        // the handler is parked, yet submissions return immediately
        for i in 0..10 {
            hook.batch_processed(&[i], 1).unwrap();
        }
        assert_eq!(hook.submitted(), 10);
        drop(release_tx);
        hook.shutdown().unwrap();
    }

    #[test]
    fn test_failures_aggregated() {
        let hook = AsyncPostBatchHook::new(2, |batch: &[TaskIndex], _| {
            if batch[0] % 10 == 0 {
                anyhow::bail!("cannot write batch starting at {}", batch[0]);
            }
            if batch[0] == 7 {
                panic!("corrupt curve");
            }
            Ok(())
        })
        .unwrap();

        for i in 0..30 {
            hook.batch_processed(&[i], 2).unwrap();
        }
        let err = hook.shutdown().unwrap_err();
        let failures = err.downcast_ref::<HookFailures>().unwrap();

        assert_eq!(failures.failures.len(), 4);
        assert!(failures
            .failures
            .iter()
            .any(|f| f.error.contains("panicked: corrupt curve")));
        assert_eq!(hook.completed(), 30);
    }

    #[test]
    fn test_zero_threads_rejected() {
        let result = AsyncPostBatchHook::new(0, |_: &[TaskIndex], _| Ok(()));
        assert!(matches!(result, Err(DispatchError::Config(_))));
    }

    #[test]
    fn test_failures_display_first() {
        let failures = HookFailures {
            failures: vec![
                HookFailure {
                    worker: 3,
                    batch_len: 8,
                    error: "disk full".to_string(),
                },
                HookFailure {
                    worker: 1,
                    batch_len: 2,
                    error: "disk full".to_string(),
                },
            ],
        };
        assert_eq!(
            failures.to_string(),
            "2 post-batch hook unit(s) failed; first: worker 3 (8 tasks): disk full"
        );
        let none = HookFailures { failures: Vec::new() };
        assert_eq!(none.to_string(), "0 post-batch hook unit(s) failed");
    }

    #[test]
    fn test_rejects_after_shutdown() {
        let hook = AsyncPostBatchHook::new(1, |_: &[TaskIndex], _| Ok(())).unwrap();
        hook.shutdown().unwrap();

        let err = hook.batch_processed(&[1], 0).unwrap_err();
        assert!(err.downcast_ref::<HookShutDown>().is_some());
        assert!(hook.shutdown().is_err());
    }
}
