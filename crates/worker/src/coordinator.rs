//! Job coordinator
//!
//! Drives one process through a job: rank 0 builds the dispatcher and either
//! serves remote workers in the background while computing itself, or only
//! serves. Every rank computes batches until it is handed an empty one, then
//! all ranks meet at the barrier and run final assembly. An abort raised by
//! any rank ends `run()` wherever it is.

use crate::group::ProcessGroup;
use crate::protocol::{self, BatchSource};
use crate::watchdog::DeadlockWatchdog;
use anyhow::anyhow;
use batchdispatch_common::error::{DispatchError, Result};
use batchdispatch_common::{DispatchConfig, JobRange, MetricsRegistry, TaskIndex, WorkerId};
use batchdispatch_dispatcher::{Dispatcher, PostBatchHook, TaskOrder};
use serde::Serialize;
use std::any::Any;
use std::ops::Range;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, Instrument, Span};

/// The work of a job, supplied by the caller
pub trait TaskCalculator: Send + Sync + 'static {
    /// Total number of tasks; indices run from 0 to `num_tasks() - 1`
    fn num_tasks(&self) -> usize;

    /// Compute every task in `batch`
    fn calculate_batch(&self, batch: &[TaskIndex], ctx: &ComputeContext) -> anyhow::Result<()>;

    /// Runs once per rank after the barrier
    fn final_assembly(&self, ctx: &ComputeContext) -> anyhow::Result<()>;
}

/// What a calculator knows about where it runs
#[derive(Clone)]
pub struct ComputeContext {
    rank: WorkerId,
    size: u32,
    pool: Arc<rayon::ThreadPool>,
}

impl ComputeContext {
    pub fn new(rank: WorkerId, size: u32, threads: usize) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(move |i| format!("compute-{}-{}", rank, i))
            .build()
            .map_err(|e| DispatchError::internal(format!("cannot build compute pool: {}", e)))?;

        Ok(Self {
            rank,
            size,
            pool: Arc::new(pool),
        })
    }

    pub fn rank(&self) -> WorkerId {
        self.rank
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    /// Thread pool for parallelism within a batch
    pub fn pool(&self) -> &rayon::ThreadPool {
        &self.pool
    }

    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }
}

impl std::fmt::Debug for ComputeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputeContext")
            .field("rank", &self.rank)
            .field("size", &self.size)
            .field("threads", &self.threads())
            .finish()
    }
}

/// How this process takes part in dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    /// Group of one: dispatch and compute in the same process, no wire traffic
    SingleNode,
    /// Rank 0 serving remote workers in the background while computing
    Threaded,
    /// Rank 0 serving remote workers only
    Synchronous,
    /// Any other rank, fetching work from rank 0
    Remote,
}

impl std::fmt::Display for DispatchMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DispatchMode::SingleNode => write!(f, "single-node"),
            DispatchMode::Threaded => write!(f, "threaded"),
            DispatchMode::Synchronous => write!(f, "synchronous"),
            DispatchMode::Remote => write!(f, "remote"),
        }
    }
}

/// Outcome of [`JobCoordinator::run`] for one rank
#[derive(Debug, Clone, Serialize)]
pub struct JobSummary {
    pub rank: WorkerId,
    pub size: u32,
    pub dispatch_mode: DispatchMode,
    pub range: JobRange,
    /// Batches calculated by this rank
    pub batches: u64,
    /// Tasks calculated by this rank
    pub tasks: u64,
    pub elapsed_ms: u64,
}

/// Runs one job on one rank of a process group
pub struct JobCoordinator<G, C> {
    group: Arc<G>,
    calculator: Arc<C>,
    config: DispatchConfig,
    hook: Option<Arc<dyn PostBatchHook>>,
    metrics: Arc<MetricsRegistry>,
}

impl<G: ProcessGroup, C: TaskCalculator> JobCoordinator<G, C> {
    pub fn new(group: Arc<G>, calculator: Arc<C>, config: DispatchConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            group,
            calculator,
            config,
            hook: None,
            metrics: Arc::new(MetricsRegistry::new()?),
        })
    }

    /// Hook for completed batches; only rank 0 uses it
    pub fn with_post_batch_hook(mut self, hook: Arc<dyn PostBatchHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn metrics(&self) -> &MetricsRegistry {
        &self.metrics
    }

    pub fn group(&self) -> &G {
        &self.group
    }

    pub fn mode(&self) -> DispatchMode {
        match (self.group.rank(), self.group.size()) {
            (_, 1) => DispatchMode::SingleNode,
            (0, _) if self.config.root_dispatch_only => DispatchMode::Synchronous,
            (0, _) => DispatchMode::Threaded,
            _ => DispatchMode::Remote,
        }
    }

    /// Workers the batch sizer divides the queue between
    pub fn compute_workers(&self) -> usize {
        let size = self.group.size() as usize;
        match self.mode() {
            DispatchMode::Synchronous => size - 1,
            _ => size,
        }
    }

    /// Run the job to completion or abort
    pub async fn run(&self) -> Result<JobSummary> {
        let span = info_span!("job", rank = self.group.rank(), size = self.group.size());
        let _watchdog = self.start_watchdog()?;
        async {
            tokio::select! {
                biased;
                notice = self.group.aborted() => {
                    error!("Job aborted by rank {} with code {}", notice.rank, notice.code);
                    Err(DispatchError::from(notice))
                }
                result = self.run_job() => result,
            }
        }
        .instrument(span)
        .await
    }

    fn start_watchdog(&self) -> Result<Option<DeadlockWatchdog>> {
        if !self.config.deadlock_detect {
            return Ok(None);
        }
        Ok(Some(DeadlockWatchdog::start(
            self.config.deadlock_check_interval(),
        )?))
    }

    async fn run_job(&self) -> Result<JobSummary> {
        let started = Instant::now();
        let rank = self.group.rank();
        let size = self.group.size();
        let mode = self.mode();
        let range = self.config.job_range(self.calculator.num_tasks())?;
        let ctx = ComputeContext::new(rank, size, self.config.resolved_threads())?;

        info!(
            "Starting job over {} ({} tasks), {} mode, {} compute threads",
            range,
            range.len(),
            mode,
            ctx.threads()
        );

        let (batches, tasks) = match mode {
            DispatchMode::SingleNode => {
                let dispatcher = self.build_dispatcher(range)?;
                self.compute_loop(BatchSource::Direct(&dispatcher), &ctx)
                    .await?
            }
            DispatchMode::Synchronous => {
                let dispatcher = self.build_dispatcher(range)?;
                protocol::serve(&*self.group, &dispatcher, 1..size).await?;
                (0, 0)
            }
            DispatchMode::Threaded => {
                let dispatcher = Arc::new(self.build_dispatcher(range)?);
                self.compute_while_serving(dispatcher, &ctx).await?
            }
            DispatchMode::Remote => {
                self.compute_loop(BatchSource::Remote(&*self.group), &ctx)
                    .await?
            }
        };

        info!("waiting on barrier");
        self.group.barrier().await?;

        if rank == 0 {
            if let Some(hook) = &self.hook {
                debug!("waiting for post batch hook to finish");
                let hook = hook.clone();
                run_blocking(move || hook.shutdown())
                    .await
                    .map_err(DispatchError::Hook)?;
            }
        }

        info!("doing final assembly");
        let calculator = self.calculator.clone();
        let assembly_ctx = ctx.clone();
        run_blocking(move || calculator.final_assembly(&assembly_ctx))
            .await
            .map_err(DispatchError::Compute)?;

        info!("DONE!");
        Ok(JobSummary {
            rank,
            size,
            dispatch_mode: mode,
            range,
            batches,
            tasks,
            elapsed_ms: started.elapsed().as_millis() as u64,
        })
    }

    fn build_dispatcher(&self, range: JobRange) -> Result<Dispatcher> {
        let order = TaskOrder::from_config(self.config.shuffle, self.config.shuffle_seed);
        let mut dispatcher = Dispatcher::new(
            self.compute_workers(),
            range,
            self.config.batch_config(),
            order,
        )?
        .with_metrics(self.metrics.dispatch.clone());

        if let Some(hook) = &self.hook {
            dispatcher = dispatcher.with_hook(hook.clone());
        }
        Ok(dispatcher)
    }

    /// Rank 0 in threaded mode: compute locally while a task serves the others
    async fn compute_while_serving(
        &self,
        dispatcher: Arc<Dispatcher>,
        ctx: &ComputeContext,
    ) -> Result<(u64, u64)> {
        let mut service =
            ServiceTask::spawn(self.group.clone(), dispatcher.clone(), 1..self.group.size());

        let compute = self.compute_loop(BatchSource::Direct(&dispatcher), ctx);
        tokio::pin!(compute);

        // a failed service must not wait for local compute to finish
        let counts = loop {
            tokio::select! {
                counts = &mut compute => break counts?,
                served = service.wait(), if service.is_running() => served?,
            }
        };

        service.wait().await?;
        Ok(counts)
    }

    async fn compute_loop(
        &self,
        source: BatchSource<'_, G>,
        ctx: &ComputeContext,
    ) -> Result<(u64, u64)> {
        let metrics = &self.metrics.worker;
        let mut batches = 0u64;
        let mut tasks = 0u64;

        loop {
            let waiting = Instant::now();
            let batch = source.next_batch(ctx.rank()).await?;
            metrics.batch_wait.observe(waiting.elapsed().as_secs_f64());
            if batch.is_empty() {
                break;
            }

            info!("calculating batch");
            let len = batch.len() as u64;
            let calculator = self.calculator.clone();
            let batch_ctx = ctx.clone();
            let calculating = Instant::now();
            run_blocking(move || calculator.calculate_batch(&batch, &batch_ctx))
                .await
                .map_err(DispatchError::Compute)?;

            metrics
                .calculate_duration
                .observe(calculating.elapsed().as_secs_f64());
            metrics.batches_calculated.inc();
            metrics.tasks_calculated.inc_by(len);
            batches += 1;
            tasks += len;
        }

        info!("Calculated {} batches ({} tasks)", batches, tasks);
        Ok((batches, tasks))
    }
}

/// Background dispatch service; aborted if dropped before it finishes
struct ServiceTask {
    handle: Option<JoinHandle<Result<usize>>>,
}

impl ServiceTask {
    fn spawn<G: ProcessGroup>(
        group: Arc<G>,
        dispatcher: Arc<Dispatcher>,
        workers: Range<WorkerId>,
    ) -> Self {
        let handle = tokio::spawn(
            async move { protocol::serve(&*group, &dispatcher, workers).await }
                .instrument(Span::current()),
        );
        Self {
            handle: Some(handle),
        }
    }

    fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    /// Wait for the service to finish; returns immediately once it has
    async fn wait(&mut self) -> Result<()> {
        let Some(handle) = self.handle.as_mut() else {
            return Ok(());
        };
        let outcome = handle.await;
        self.handle = None;
        match outcome {
            Ok(served) => served.map(|_| ()),
            Err(e) => Err(DispatchError::internal(format!(
                "dispatch service failed: {}",
                e
            ))),
        }
    }
}

impl Drop for ServiceTask {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

/// Run caller code on the blocking pool, turning a panic into an error
async fn run_blocking<F>(f: F) -> anyhow::Result<()>
where
    F: FnOnce() -> anyhow::Result<()> + Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result,
        Err(e) if e.is_panic() => Err(anyhow!("{}", panic_message(e.into_panic()))),
        Err(e) => Err(anyhow!("blocking task cancelled: {}", e)),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(msg) => format!("panicked: {}", msg),
        Err(payload) => match payload.downcast::<&str>() {
            Ok(msg) => format!("panicked: {}", msg),
            Err(_) => "panicked".to_string(),
        },
    }
}
