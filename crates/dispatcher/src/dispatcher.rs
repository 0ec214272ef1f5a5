//! Batch dispatcher
//!
//! The dispatcher owns the task queue and the batch each worker currently
//! holds. All of that state sits behind a single mutex, so exactly one
//! [`Dispatcher::next_batch`] call mutates it at a time regardless of whether
//! the caller is the dispatcher's own service loop or a co-located worker.

use crate::hook::{panic_message, PostBatchHook};
use crate::queue::TaskQueue;
use crate::sizer::size_for;
use batchdispatch_common::error::{DispatchError, Result};
use batchdispatch_common::metrics::LatencyTimer;
use batchdispatch_common::{Batch, BatchConfig, DispatchMetrics, JobRange, TaskIndex, WorkerId};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Order in which the task queue is built
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOrder {
    /// Ascending stack; pops run from the end of the range down
    Sequential,

    /// Permuted once from OS entropy
    Shuffled,

    /// Permuted once from a fixed seed
    Seeded(u64),
}

impl TaskOrder {
    pub fn from_config(shuffle: bool, seed: Option<u64>) -> Self {
        match (shuffle, seed) {
            (false, _) => TaskOrder::Sequential,
            (true, Some(seed)) => TaskOrder::Seeded(seed),
            (true, None) => TaskOrder::Shuffled,
        }
    }
}

/// Mutable dispatch state, only touched under the dispatcher's lock
#[derive(Debug)]
struct DispatchState {
    queue: TaskQueue,
    outstanding: HashMap<WorkerId, Batch>,
}

/// Hands out batches of task indices to workers
pub struct Dispatcher {
    state: Mutex<DispatchState>,
    num_workers: usize,
    range: JobRange,
    config: BatchConfig,
    hook: Option<Arc<dyn PostBatchHook>>,
    metrics: Option<DispatchMetrics>,
}

impl Dispatcher {
    /// Create a dispatcher for `range`, sized for `num_workers` compute workers
    pub fn new(
        num_workers: usize,
        range: JobRange,
        config: BatchConfig,
        order: TaskOrder,
    ) -> Result<Self> {
        config.validate()?;
        if num_workers == 0 {
            return Err(DispatchError::config("Dispatcher needs at least one worker"));
        }

        let queue = match order {
            TaskOrder::Sequential => TaskQueue::ordered(range),
            TaskOrder::Shuffled => TaskQueue::shuffled(range, &mut rand::thread_rng()),
            TaskOrder::Seeded(seed) => TaskQueue::shuffled(range, &mut StdRng::seed_from_u64(seed)),
        };

        info!(
            "Dispatcher created: {} tasks in {}, {} workers, order={:?}, bounds={:?}",
            range.len(),
            range,
            num_workers,
            order,
            config
        );

        Ok(Self {
            state: Mutex::new(DispatchState {
                queue,
                outstanding: HashMap::new(),
            }),
            num_workers,
            range,
            config,
            hook: None,
            metrics: None,
        })
    }

    /// Report every completed batch to `hook`
    pub fn with_hook(mut self, hook: Arc<dyn PostBatchHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Record dispatch activity in `metrics`
    pub fn with_metrics(mut self, metrics: DispatchMetrics) -> Self {
        metrics.tasks_remaining.set(self.num_left() as i64);
        self.metrics = Some(metrics);
        self
    }

    /// Next batch for `worker`; an empty batch means there is no work left
    ///
    /// The worker's previous batch, if any, counts as completed by this call:
    /// it is reported to the hook (inside the lock) before new work is handed
    /// out. An empty result does not mark the worker done; that bookkeeping
    /// belongs to the caller.
    pub fn next_batch(&self, worker: WorkerId) -> Result<Batch> {
        let mut state = self.state.lock();

        if let Some(previous) = state.outstanding.remove(&worker) {
            self.batch_completed(&previous, worker)?;
        }

        let num_left = state.queue.len();
        debug!("getting batch with {} left (worker {})", num_left, worker);
        if num_left == 0 {
            return Ok(Batch::new());
        }

        let size = size_for(num_left, self.num_workers, &self.config);
        let batch = state.queue.pop_batch(size);
        debug!("returning batch of size: {}", batch.len());

        if let Some(metrics) = &self.metrics {
            metrics.batches_dispatched.inc();
            metrics.tasks_dispatched.inc_by(batch.len() as u64);
            metrics.tasks_remaining.set(state.queue.len() as i64);
            metrics.batch_size.observe(batch.len() as f64);
        }

        state.outstanding.insert(worker, batch.clone());
        Ok(batch)
    }

    fn batch_completed(&self, batch: &[TaskIndex], worker: WorkerId) -> Result<()> {
        let Some(hook) = &self.hook else {
            return Ok(());
        };

        // panics count as hook failures
        let call = || {
            panic::catch_unwind(AssertUnwindSafe(|| hook.batch_processed(batch, worker)))
                .unwrap_or_else(|payload| Err(anyhow::anyhow!("{}", panic_message(payload.as_ref()))))
        };
        let result = match &self.metrics {
            Some(metrics) => metrics.hook_duration.time(call),
            None => call(),
        };

        result.map_err(|e| {
            warn!("Post-batch hook failed for worker {}: {:#}", worker, e);
            if let Some(metrics) = &self.metrics {
                metrics.hook_failures.inc();
            }
            DispatchError::Hook(e)
        })
    }

    /// Tasks not yet dispatched
    pub fn num_left(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Workers currently holding a batch
    pub fn outstanding(&self) -> usize {
        self.state.lock().outstanding.len()
    }

    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    pub fn range(&self) -> JobRange {
        self.range
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("num_workers", &self.num_workers)
            .field("range", &self.range)
            .field("config", &self.config)
            .field("has_hook", &self.hook.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hook::FnHook;
    use batchdispatch_common::MetricsRegistry;
    use std::collections::BTreeSet;

    fn dispatcher(num_tasks: usize, workers: usize, config: BatchConfig) -> Dispatcher {
        Dispatcher::new(
            workers,
            JobRange::full(num_tasks).unwrap(),
            config,
            TaskOrder::Sequential,
        )
        .unwrap()
    }

    /// Round-robin every worker until all have received an empty batch
    fn drain(dispatcher: &Dispatcher, workers: u32) -> Vec<(WorkerId, Batch)> {
        let mut done = BTreeSet::new();
        let mut handed_out = Vec::new();
        while done.len() < workers as usize {
            for worker in 0..workers {
                if done.contains(&worker) {
                    continue;
                }
                let batch = dispatcher.next_batch(worker).unwrap();
                if batch.is_empty() {
                    done.insert(worker);
                } else {
                    handed_out.push((worker, batch));
                }
            }
        }
        handed_out
    }

    #[test]
    fn test_construction_validates() {
        let range = JobRange::full(10).unwrap();
        assert!(Dispatcher::new(0, range, BatchConfig::default(), TaskOrder::Sequential).is_err());
        assert!(Dispatcher::new(2, range, BatchConfig::new(0, 5), TaskOrder::Sequential).is_err());
        assert!(Dispatcher::new(2, range, BatchConfig::new(6, 5), TaskOrder::Sequential).is_err());
    }

    #[test]
    fn test_scenario_even_share() {
        let dispatcher = dispatcher(23, 3, BatchConfig::new(5, 100));

        let first = dispatcher.next_batch(0).unwrap();
        assert_eq!(first.len(), 8);
        assert_eq!(first, (15..23).rev().collect::<Vec<TaskIndex>>());

        // the share is recomputed from what is left: ceil(15/3) = 5, then the floor of 5
        assert_eq!(dispatcher.next_batch(1).unwrap().len(), 5);
        assert_eq!(dispatcher.next_batch(2).unwrap().len(), 5);
        assert_eq!(dispatcher.num_left(), 5);
        assert_eq!(dispatcher.next_batch(0).unwrap().len(), 5);
        assert_eq!(dispatcher.num_left(), 0);

        for worker in 0..3 {
            assert!(dispatcher.next_batch(worker).unwrap().is_empty());
        }
        assert_eq!(dispatcher.outstanding(), 0);
    }

    #[test]
    fn test_scenario_exact_dispatch() {
        let dispatcher = dispatcher(10, 4, BatchConfig::exact(3));

        let sizes: Vec<usize> = (0..4)
            .map(|worker| dispatcher.next_batch(worker).unwrap().len())
            .collect();
        assert_eq!(sizes, vec![3, 3, 3, 1]);

        for _ in 0..2 {
            for worker in 0..4 {
                assert!(dispatcher.next_batch(worker).unwrap().is_empty());
            }
        }
    }

    #[test]
    fn test_coverage_and_bounds() {
        for (num_tasks, workers, min, max) in [(1, 1, 1, 1), (97, 4, 5, 20), (500, 7, 3, 100), (64, 16, 1, 2)] {
            let dispatcher = dispatcher(num_tasks, workers, BatchConfig::new(min, max));
            let handed_out = drain(&dispatcher, workers as u32);

            let mut seen: Vec<TaskIndex> = handed_out.iter().flat_map(|(_, b)| b.clone()).collect();
            seen.sort_unstable();
            assert_eq!(seen, (0..num_tasks as TaskIndex).collect::<Vec<_>>());

            let (last, rest) = handed_out.split_last().unwrap();
            for (_, batch) in rest {
                assert!(batch.len() >= min && batch.len() <= max, "size {}", batch.len());
            }
            assert!(!last.1.is_empty() && last.1.len() <= max);
        }
    }

    #[test]
    fn test_monotonic_drain() {
        let dispatcher = dispatcher(200, 3, BatchConfig::new(4, 30));
        let mut previous = dispatcher.num_left();
        loop {
            let batch = dispatcher.next_batch(1).unwrap();
            let left = dispatcher.num_left();
            if batch.is_empty() {
                assert_eq!(left, 0);
                break;
            }
            assert!(left < previous);
            previous = left;
        }
        assert!(dispatcher.next_batch(1).unwrap().is_empty());
        assert_eq!(dispatcher.num_left(), 0);
    }

    #[test]
    fn test_sequential_order_is_repeatable() {
        let collect = || -> Vec<TaskIndex> {
            let dispatcher = dispatcher(12, 2, BatchConfig::new(1, 4));
            drain(&dispatcher, 2).into_iter().flat_map(|(_, b)| b).collect()
        };
        let order = collect();
        assert_eq!(order, (0..12).rev().collect::<Vec<TaskIndex>>());
        assert_eq!(order, collect());
    }

    #[test]
    fn test_shuffled_dispatch_covers_range() {
        let range = JobRange::new(10, 90, 100).unwrap();
        let dispatcher =
            Dispatcher::new(3, range, BatchConfig::new(2, 10), TaskOrder::Seeded(99)).unwrap();
        let mut seen: Vec<TaskIndex> = drain(&dispatcher, 3).into_iter().flat_map(|(_, b)| b).collect();
        seen.sort_unstable();
        assert_eq!(seen, (10..90).collect::<Vec<_>>());
    }

    #[test]
    fn test_hook_reports_previous_batch() {
        let seen = Arc::new(Mutex::new(Vec::<(WorkerId, Batch)>::new()));
        let recorder = seen.clone();
        let hook = FnHook::new(move |batch: &[TaskIndex], worker| {
            recorder.lock().push((worker, batch.to_vec()));
            Ok(())
        });
        let dispatcher = dispatcher(40, 1, BatchConfig::new(5, 5)).with_hook(Arc::new(hook));

        let first = dispatcher.next_batch(0).unwrap();
        assert!(seen.lock().is_empty(), "hook must wait for the next request");

        let second = dispatcher.next_batch(0).unwrap();
        assert_eq!(*seen.lock(), vec![(0, first)]);

        dispatcher.next_batch(0).unwrap();
        assert_eq!(seen.lock().last().unwrap(), &(0, second));
    }

    #[test]
    fn test_hook_tracks_workers_independently() {
        let seen = Arc::new(Mutex::new(Vec::<(WorkerId, Batch)>::new()));
        let recorder = seen.clone();
        let hook = FnHook::new(move |batch: &[TaskIndex], worker| {
            recorder.lock().push((worker, batch.to_vec()));
            Ok(())
        });
        let dispatcher = dispatcher(30, 2, BatchConfig::new(5, 5)).with_hook(Arc::new(hook));

        let a = dispatcher.next_batch(0).unwrap();
        let b = dispatcher.next_batch(1).unwrap();
        dispatcher.next_batch(1).unwrap();
        assert_eq!(*seen.lock(), vec![(1, b)]);

        dispatcher.next_batch(0).unwrap();
        assert_eq!(seen.lock()[1], (0, a));
    }

    #[test]
    fn test_hook_failure_propagates() {
        let hook = FnHook::new(|_: &[TaskIndex], _| Err(anyhow::anyhow!("write failed")));
        let metrics = MetricsRegistry::new().unwrap();
        let dispatcher = dispatcher(20, 1, BatchConfig::new(5, 5))
            .with_hook(Arc::new(hook))
            .with_metrics(metrics.dispatch.clone());

        dispatcher.next_batch(0).unwrap();
        let err = dispatcher.next_batch(0).unwrap_err();
        assert!(matches!(err, DispatchError::Hook(_)));
        assert_eq!(metrics.dispatch.hook_failures.get(), 1);
    }

    #[test]
    fn test_hook_panic_becomes_hook_error() {
        let hook = FnHook::new(|batch: &[TaskIndex], _| {
            if batch.contains(&12) {
                panic!("curve file truncated");
            }
            Ok(())
        });
        let metrics = MetricsRegistry::new().unwrap();
        let dispatcher = dispatcher(20, 1, BatchConfig::new(5, 5))
            .with_hook(Arc::new(hook))
            .with_metrics(metrics.dispatch.clone());

        // batches come off the top: 15..20, then 10..15 holds task 12
        dispatcher.next_batch(0).unwrap();
        dispatcher.next_batch(0).unwrap();
        let err = dispatcher.next_batch(0).unwrap_err();

        assert!(matches!(err, DispatchError::Hook(_)));
        assert!(err.to_string().contains("panicked: curve file truncated"));
        assert_eq!(metrics.dispatch.hook_failures.get(), 1);
        // the lock is still usable after the panic
        assert_eq!(dispatcher.num_left(), 10);
    }

    #[test]
    fn test_metrics_recorded() {
        let metrics = MetricsRegistry::new().unwrap();
        let dispatcher = dispatcher(23, 3, BatchConfig::new(5, 100)).with_metrics(metrics.dispatch.clone());
        assert_eq!(metrics.dispatch.tasks_remaining.get(), 23);

        drain(&dispatcher, 3);
        assert_eq!(metrics.dispatch.tasks_dispatched.get(), 23);
        assert_eq!(metrics.dispatch.batches_dispatched.get(), 4);
        assert_eq!(metrics.dispatch.tasks_remaining.get(), 0);
    }

    #[test]
    fn test_concurrent_callers() {
        let dispatcher = Arc::new(dispatcher(5000, 8, BatchConfig::new(1, 25)));
        let handles: Vec<_> = (0..8u32)
            .map(|worker| {
                let dispatcher = dispatcher.clone();
                std::thread::spawn(move || {
                    let mut mine = Vec::new();
                    loop {
                        let batch = dispatcher.next_batch(worker).unwrap();
                        if batch.is_empty() {
                            return mine;
                        }
                        mine.extend(batch);
                    }
                })
            })
            .collect();

        let mut seen: Vec<TaskIndex> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..5000).collect::<Vec<_>>());
    }
}
