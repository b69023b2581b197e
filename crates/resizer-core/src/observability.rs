//! Prometheus metrics for the worker.
//!
//! Metrics live in their own `Registry` owned by `WorkerMetrics`, so tests and
//! multiple workers in one process do not collide.

use std::time::Duration;

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
    exponential_buckets,
};

use crate::app::circuit_breaker::CircuitState;

pub const STATUS_SUCCESS: &str = "success";
pub const STATUS_FAILED: &str = "failed";
pub const STATUS_MALFORMED: &str = "malformed";

pub struct WorkerMetrics {
    registry: Registry,

    /// Processed deliveries (by task type, status)
    processed: IntCounterVec,

    /// Wall time of successful processing (by task type)
    duration: HistogramVec,

    /// Deliveries sent around the retry cycle (by task type)
    retries: IntCounterVec,

    /// Deliveries parked in the dead queue (by task type)
    dropped: IntCounterVec,

    /// Upload or presign failures (by task type)
    upload_failures: IntCounterVec,

    /// 0 closed, 1 open, 2 half-open
    breaker_state: IntGauge,
}

impl WorkerMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let processed = IntCounterVec::new(
            Opts::new("task_processed_total", "Total processed tasks"),
            &["type", "status"],
        )?;
        let duration = HistogramVec::new(
            HistogramOpts::new(
                "task_processing_duration_seconds",
                "Task processing duration in seconds",
            )
            .buckets(exponential_buckets(0.1, 1.5, 5)?),
            &["type"],
        )?;
        let retries = IntCounterVec::new(
            Opts::new("task_retry_attempts_total", "Total task retry attempts"),
            &["type"],
        )?;
        let dropped = IntCounterVec::new(
            Opts::new("task_dropped_total", "Total tasks moved to the dead queue"),
            &["type"],
        )?;
        let upload_failures = IntCounterVec::new(
            Opts::new(
                "storage_upload_failures_total",
                "Total object storage upload failures",
            ),
            &["type"],
        )?;
        let breaker_state = IntGauge::new(
            "circuit_breaker_state",
            "Circuit breaker state (0 = closed, 1 = open, 2 = half-open)",
        )?;

        registry.register(Box::new(processed.clone()))?;
        registry.register(Box::new(duration.clone()))?;
        registry.register(Box::new(retries.clone()))?;
        registry.register(Box::new(dropped.clone()))?;
        registry.register(Box::new(upload_failures.clone()))?;
        registry.register(Box::new(breaker_state.clone()))?;

        Ok(Self {
            registry,
            processed,
            duration,
            retries,
            dropped,
            upload_failures,
            breaker_state,
        })
    }

    pub fn record_success(&self, task_type: &str, elapsed: Duration) {
        self.processed
            .with_label_values(&[task_type, STATUS_SUCCESS])
            .inc();
        self.duration
            .with_label_values(&[task_type])
            .observe(elapsed.as_secs_f64());
    }

    pub fn record_failure(&self, task_type: &str) {
        self.processed
            .with_label_values(&[task_type, STATUS_FAILED])
            .inc();
    }

    pub fn record_malformed(&self, task_type: &str) {
        self.processed
            .with_label_values(&[task_type, STATUS_MALFORMED])
            .inc();
    }

    pub fn record_retry(&self, task_type: &str) {
        self.retries.with_label_values(&[task_type]).inc();
    }

    pub fn record_dropped(&self, task_type: &str) {
        self.dropped.with_label_values(&[task_type]).inc();
    }

    pub fn record_upload_failure(&self, task_type: &str) {
        self.upload_failures.with_label_values(&[task_type]).inc();
    }

    pub fn set_breaker_state(&self, state: CircuitState) {
        self.breaker_state.set(state.as_metric_value());
    }

    pub fn processed(&self, task_type: &str, status: &str) -> u64 {
        self.processed.with_label_values(&[task_type, status]).get()
    }

    pub fn retries(&self, task_type: &str) -> u64 {
        self.retries.with_label_values(&[task_type]).get()
    }

    pub fn dropped(&self, task_type: &str) -> u64 {
        self.dropped.with_label_values(&[task_type]).get()
    }

    pub fn upload_failures(&self, task_type: &str) -> u64 {
        self.upload_failures.with_label_values(&[task_type]).get()
    }

    pub fn duration_samples(&self, task_type: &str) -> u64 {
        self.duration.with_label_values(&[task_type]).get_sample_count()
    }

    pub fn breaker_state(&self) -> i64 {
        self.breaker_state.get()
    }

    /// Gather all metrics and encode as Prometheus text format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
