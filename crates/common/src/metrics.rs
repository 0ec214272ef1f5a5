//! Metrics collection for BatchDispatch
//!
//! Prometheus metrics for the dispatcher and the compute loop. Each job owns
//! its registry; nothing here is process-global, so several in-process ranks
//! (tests, loopback groups) never collide on metric registration.

use crate::error::Result;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Registry};
use std::sync::Arc;

/// Metrics registry for one job
#[derive(Debug, Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub dispatch: DispatchMetrics,
    pub worker: WorkerMetrics,
}

/// Dispatcher-side metrics (only populated on rank 0)
#[derive(Debug, Clone)]
pub struct DispatchMetrics {
    /// Non-empty batches handed out
    pub batches_dispatched: IntCounter,

    /// Task indices handed out
    pub tasks_dispatched: IntCounter,

    /// Tasks still in the queue
    pub tasks_remaining: IntGauge,

    /// Batch size distribution
    pub batch_size: Histogram,

    /// Time spent inside the post-batch hook
    pub hook_duration: Histogram,

    /// Post-batch hook failures
    pub hook_failures: IntCounter,
}

/// Compute-loop metrics
#[derive(Debug, Clone)]
pub struct WorkerMetrics {
    /// Batches calculated by this process
    pub batches_calculated: IntCounter,

    /// Tasks calculated by this process
    pub tasks_calculated: IntCounter,

    /// Calculation duration per batch
    pub calculate_duration: Histogram,

    /// Time spent waiting for the next batch
    pub batch_wait: Histogram,
}

impl MetricsRegistry {
    /// Create a new metrics registry
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new());

        // Dispatch metrics
        let batches_dispatched = IntCounter::new(
            "dispatch_batches_total",
            "Total number of non-empty batches dispatched",
        )?;

        let tasks_dispatched = IntCounter::new(
            "dispatch_tasks_total",
            "Total number of tasks dispatched",
        )?;

        let tasks_remaining = IntGauge::new(
            "dispatch_tasks_remaining",
            "Tasks not yet dispatched",
        )?;

        let batch_size = Histogram::with_opts(
            HistogramOpts::new("dispatch_batch_size", "Batch size distribution")
                .buckets(vec![1.0, 2.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 1000.0]),
        )?;

        let hook_duration = Histogram::with_opts(
            HistogramOpts::new(
                "dispatch_hook_duration_seconds",
                "Post-batch hook duration in seconds",
            )
            .buckets(vec![0.0001, 0.001, 0.01, 0.1, 0.5, 1.0, 5.0, 30.0]),
        )?;

        let hook_failures = IntCounter::new(
            "dispatch_hook_failures_total",
            "Total number of failed post-batch hook invocations",
        )?;

        // Worker metrics
        let batches_calculated = IntCounter::new(
            "worker_batches_calculated_total",
            "Total number of batches calculated",
        )?;

        let tasks_calculated = IntCounter::new(
            "worker_tasks_calculated_total",
            "Total number of tasks calculated",
        )?;

        let calculate_duration = Histogram::with_opts(
            HistogramOpts::new(
                "worker_calculate_duration_seconds",
                "Batch calculation duration in seconds",
            )
            .buckets(vec![0.01, 0.1, 1.0, 10.0, 60.0, 300.0, 1800.0, 7200.0]),
        )?;

        let batch_wait = Histogram::with_opts(
            HistogramOpts::new(
                "worker_batch_wait_seconds",
                "Time spent waiting for the next batch",
            )
            .buckets(vec![0.0001, 0.001, 0.01, 0.1, 1.0, 10.0]),
        )?;

        // Register all metrics
        registry.register(Box::new(batches_dispatched.clone()))?;
        registry.register(Box::new(tasks_dispatched.clone()))?;
        registry.register(Box::new(tasks_remaining.clone()))?;
        registry.register(Box::new(batch_size.clone()))?;
        registry.register(Box::new(hook_duration.clone()))?;
        registry.register(Box::new(hook_failures.clone()))?;

        registry.register(Box::new(batches_calculated.clone()))?;
        registry.register(Box::new(tasks_calculated.clone()))?;
        registry.register(Box::new(calculate_duration.clone()))?;
        registry.register(Box::new(batch_wait.clone()))?;

        let dispatch = DispatchMetrics {
            batches_dispatched,
            tasks_dispatched,
            tasks_remaining,
            batch_size,
            hook_duration,
            hook_failures,
        };

        let worker = WorkerMetrics {
            batches_calculated,
            tasks_calculated,
            calculate_duration,
            batch_wait,
        };

        Ok(MetricsRegistry {
            registry,
            dispatch,
            worker,
        })
    }

    /// Gather all metrics as text
    pub fn gather(&self) -> Result<String> {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer)
            .map_err(|e| crate::error::DispatchError::internal(format!("metrics text: {}", e)))
    }
}

/// Helper trait for measuring latency
pub trait LatencyTimer {
    /// Observe the duration of a closure
    fn time<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R;
}

impl LatencyTimer for Histogram {
    fn time<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let start = std::time::Instant::now();
        let result = f();
        self.observe(start.elapsed().as_secs_f64());
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registry() {
        let metrics = MetricsRegistry::new().unwrap();

        metrics.dispatch.batches_dispatched.inc();
        metrics.dispatch.tasks_remaining.set(10);
        metrics.worker.tasks_calculated.inc_by(8);

        let output = metrics.gather().unwrap();
        assert!(output.contains("dispatch_batches_total 1"));
        assert!(output.contains("dispatch_tasks_remaining 10"));
        assert!(output.contains("worker_tasks_calculated_total 8"));
    }

    #[test]
    fn test_registries_are_independent() {
        let a = MetricsRegistry::new().unwrap();
        let b = MetricsRegistry::new().unwrap();
        a.dispatch.tasks_dispatched.inc_by(5);
        assert_eq!(b.dispatch.tasks_dispatched.get(), 0);
    }

    #[test]
    fn test_latency_timer() {
        let metrics = MetricsRegistry::new().unwrap();
        let value = metrics.dispatch.hook_duration.time(|| 42);
        assert_eq!(value, 42);
        assert_eq!(metrics.dispatch.hook_duration.get_sample_count(), 1);
    }
}
