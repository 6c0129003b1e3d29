//! Prometheus metrics for dispatchers and work queues.

use crate::error::RuntimeError;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::time::Duration;

/// Collectors shared by every dispatcher of a process.
#[derive(Debug, Clone)]
pub struct RuntimeMetrics {
    registry: Registry,
    reconcile_total: IntCounterVec,
    reconcile_duration: HistogramVec,
    queue_depth: IntGaugeVec,
    retries_total: IntCounterVec,
    dropped_total: IntCounterVec,
}

impl RuntimeMetrics {
    /// Builds the collectors and registers them with `registry`.
    pub fn new(registry: &Registry) -> Result<Self, RuntimeError> {
        let reconcile_total = IntCounterVec::new(
            Opts::new(
                "reconcile_total",
                "Reconcile passes grouped by kind and result",
            ),
            &["kind", "result"],
        )?;
        let reconcile_duration = HistogramVec::new(
            HistogramOpts::new(
                "reconcile_duration_seconds",
                "Time spent in one reconcile pass",
            ),
            &["kind"],
        )?;
        let queue_depth = IntGaugeVec::new(
            Opts::new("workqueue_depth", "Keys waiting in the work queue"),
            &["kind"],
        )?;
        let retries_total = IntCounterVec::new(
            Opts::new("workqueue_retries_total", "Keys requeued after a failure"),
            &["kind"],
        )?;
        let dropped_total = IntCounterVec::new(
            Opts::new(
                "workqueue_dropped_total",
                "Keys dropped after exhausting their retries",
            ),
            &["kind"],
        )?;

        registry.register(Box::new(reconcile_total.clone()))?;
        registry.register(Box::new(reconcile_duration.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;
        registry.register(Box::new(retries_total.clone()))?;
        registry.register(Box::new(dropped_total.clone()))?;

        Ok(Self {
            registry: registry.clone(),
            reconcile_total,
            reconcile_duration,
            queue_depth,
            retries_total,
            dropped_total,
        })
    }

    /// Records the outcome and duration of one pass.
    pub fn observe_reconcile(&self, kind: &str, success: bool, elapsed: Duration) {
        let result = if success { "success" } else { "error" };
        self.reconcile_total.with_label_values(&[kind, result]).inc();
        self.reconcile_duration
            .with_label_values(&[kind])
            .observe(elapsed.as_secs_f64());
    }

    /// Sets the number of keys waiting for `kind`.
    pub fn set_queue_depth(&self, kind: &str, depth: usize) {
        self.queue_depth
            .with_label_values(&[kind])
            .set(i64::try_from(depth).unwrap_or(i64::MAX));
    }

    /// Counts one requeue after a failure.
    pub fn inc_retries(&self, kind: &str) {
        self.retries_total.with_label_values(&[kind]).inc();
    }

    /// Counts one key dropped after exhausting its retries.
    pub fn inc_dropped(&self, kind: &str) {
        self.dropped_total.with_label_values(&[kind]).inc();
    }

    /// Text exposition of everything in the registry.
    pub fn encode(&self) -> Result<String, RuntimeError> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}
