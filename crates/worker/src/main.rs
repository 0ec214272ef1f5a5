//! BatchDispatch Worker - Main Entry Point
//!
//! Joins the process group described by the configuration and runs a
//! synthetic checksum job through the dispatcher, printing the job summary as
//! JSON on exit.

use batchdispatch_common::error::{DispatchError, Result};
use batchdispatch_common::{JobConfig, MetricsRegistry, ObservabilityConfig, TaskIndex};
use batchdispatch_dispatcher::AsyncPostBatchHook;
use batchdispatch_worker::{
    abort_and_exit, ComputeContext, JobCoordinator, LocalGroup, ProcessGroup, TaskCalculator,
    TcpGroup,
};
use rayon::prelude::*;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_NUM_TASKS: usize = 1000;
const ROUNDS_PER_TASK: u32 = 10_000;

#[tokio::main]
async fn main() {
    let config_path = std::env::var_os("BATCHDISPATCH_CONFIG").map(PathBuf::from);
    let config = match JobConfig::load(config_path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Invalid configuration: {}", e);
            std::process::exit(e.exit_code());
        }
    };

    init_tracing(&config.observability);
    info!(
        "Starting BatchDispatch worker: rank {} of {}",
        config.cluster.rank, config.cluster.size
    );

    let calculator = match num_tasks() {
        Ok(num_tasks) => Arc::new(ChecksumCalculator::new(num_tasks)),
        Err(e) => {
            error!("{}", e);
            std::process::exit(e.exit_code());
        }
    };

    if config.cluster.size == 1 {
        run(Arc::new(LocalGroup::single()), calculator, config).await;
    } else {
        match TcpGroup::connect(&config.cluster).await {
            Ok(group) => run(Arc::new(group), calculator, config).await,
            Err(e) => {
                error!("Could not join the process group: {}", e);
                std::process::exit(e.exit_code());
            }
        }
    }
}

fn init_tracing(observability: &ObservabilityConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!(
            "batchdispatch_worker={0},batchdispatch_dispatcher={0}",
            observability.log_level
        )
        .into()
    });

    let registry = tracing_subscriber::registry().with(filter);
    if observability.structured_logging {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn num_tasks() -> Result<usize> {
    match std::env::var("BATCHDISPATCH_NUM_TASKS") {
        Ok(value) => value.parse().map_err(|_| {
            DispatchError::config(format!("BATCHDISPATCH_NUM_TASKS is not a count: {}", value))
        }),
        Err(_) => Ok(DEFAULT_NUM_TASKS),
    }
}

async fn run<G: ProcessGroup>(group: Arc<G>, calculator: Arc<ChecksumCalculator>, config: JobConfig) {
    let metrics = match MetricsRegistry::new() {
        Ok(metrics) => Arc::new(metrics),
        Err(e) => match abort_and_exit(&*group, &e).await {},
    };

    let coordinator = match JobCoordinator::new(group.clone(), calculator.clone(), config.dispatch)
    {
        Ok(coordinator) => coordinator.with_metrics(metrics.clone()),
        Err(e) => match abort_and_exit(&*group, &e).await {},
    };

    let coordinator = if group.is_root() {
        match progress_hook(calculator.num_tasks()) {
            Ok(hook) => coordinator.with_post_batch_hook(Arc::new(hook)),
            Err(e) => match abort_and_exit(&*group, &e).await {},
        }
    } else {
        coordinator
    };

    let summary = match coordinator.run().await {
        Ok(summary) => summary,
        Err(e) => match abort_and_exit(&*group, &e).await {},
    };

    if let Ok(exposition) = metrics.gather() {
        debug!("Job metrics:\n{}", exposition);
    }
    match serde_json::to_string(&summary) {
        Ok(json) => println!("{}", json),
        Err(e) => error!("Could not serialise job summary: {}", e),
    }
}

/// Logs overall progress as batches complete
fn progress_hook(num_tasks: usize) -> Result<AsyncPostBatchHook> {
    let completed = AtomicU64::new(0);
    AsyncPostBatchHook::new(1, move |batch: &[TaskIndex], worker| {
        let done = completed.fetch_add(batch.len() as u64, Ordering::Relaxed) + batch.len() as u64;
        debug!(
            "{} of {} tasks complete (last batch of {} from rank {})",
            done,
            num_tasks,
            batch.len(),
            worker
        );
        Ok(())
    })
}

/// Synthetic workload: hashes every task index and folds the results
struct ChecksumCalculator {
    num_tasks: usize,
    checksum: AtomicU64,
}

impl ChecksumCalculator {
    fn new(num_tasks: usize) -> Self {
        Self {
            num_tasks,
            checksum: AtomicU64::new(0),
        }
    }
}

fn task_hash(index: TaskIndex) -> u64 {
    let mut x = index as u64;
    for _ in 0..ROUNDS_PER_TASK {
        // splitmix64 step
        x = x.wrapping_add(0x9e37_79b9_7f4a_7c15);
        let mut z = x;
        z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
        x = z ^ (z >> 31);
    }
    x
}

impl TaskCalculator for ChecksumCalculator {
    fn num_tasks(&self) -> usize {
        self.num_tasks
    }

    fn calculate_batch(&self, batch: &[TaskIndex], ctx: &ComputeContext) -> anyhow::Result<()> {
        let folded = ctx
            .pool()
            .install(|| batch.par_iter().map(|&i| task_hash(i)).reduce(|| 0, |a, b| a ^ b));
        self.checksum.fetch_xor(folded, Ordering::AcqRel);
        Ok(())
    }

    fn final_assembly(&self, ctx: &ComputeContext) -> anyhow::Result<()> {
        info!(
            "Rank {} checksum: {:#018x}",
            ctx.rank(),
            self.checksum.load(Ordering::Acquire)
        );
        Ok(())
    }
}
