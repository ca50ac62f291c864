//! Observability infrastructure for the autorange engine
//!
//! Provides:
//! - Prometheus metrics (sampling latency, watcher counts, apply outcomes)
//! - Structured JSON logging of watcher lifecycle events

use crate::models::LimitUpdate;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use tracing::{debug, info, warn};

/// Histogram buckets for a sampling pass (in seconds)
const SAMPLING_BUCKETS: &[f64] = &[
    0.0001, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0,
];

/// Histogram buckets for limit application, which may span several retries
const APPLY_BUCKETS: &[f64] = &[0.001, 0.01, 0.1, 0.5, 1.0, 5.0, 30.0, 60.0, 120.0, 300.0];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<AutoRangeMetricsInner> = OnceLock::new();

struct AutoRangeMetricsInner {
    sampling_latency_seconds: Histogram,
    apply_latency_seconds: Histogram,
    watchers_active: IntGauge,
    samples_processed: IntCounter,
    samples_dropped: IntCounter,
    sample_errors: IntCounter,
    windows_closed: IntCounterVec,
    limits_applied: IntCounter,
    apply_failures: IntCounter,
    workloads_exited: IntCounter,
}

impl AutoRangeMetricsInner {
    fn new() -> Self {
        Self {
            sampling_latency_seconds: register_histogram!(
                "autorange_sampling_latency_seconds",
                "Time spent sampling every watched workload once",
                SAMPLING_BUCKETS.to_vec()
            )
            .expect("Failed to register sampling_latency_seconds"),

            apply_latency_seconds: register_histogram!(
                "autorange_apply_latency_seconds",
                "Time spent applying final limits, retries included",
                APPLY_BUCKETS.to_vec()
            )
            .expect("Failed to register apply_latency_seconds"),

            watchers_active: register_int_gauge!(
                "autorange_watchers_active",
                "Number of watchers currently learning"
            )
            .expect("Failed to register watchers_active"),

            samples_processed: register_int_counter!(
                "autorange_samples_processed_total",
                "Samples processed by watchers"
            )
            .expect("Failed to register samples_processed"),

            samples_dropped: register_int_counter!(
                "autorange_samples_dropped_total",
                "Samples dropped because a watcher mailbox was full"
            )
            .expect("Failed to register samples_dropped"),

            sample_errors: register_int_counter!(
                "autorange_sample_errors_total",
                "Failed workload usage reads"
            )
            .expect("Failed to register sample_errors"),

            windows_closed: register_int_counter_vec!(
                "autorange_windows_closed_total",
                "Prediction windows closed, by resource category",
                &["category"]
            )
            .expect("Failed to register windows_closed"),

            limits_applied: register_int_counter!(
                "autorange_limits_applied_total",
                "Limit sets successfully applied to workloads"
            )
            .expect("Failed to register limits_applied"),

            apply_failures: register_int_counter!(
                "autorange_apply_failures_total",
                "Limit applications that exhausted every attempt"
            )
            .expect("Failed to register apply_failures"),

            workloads_exited: register_int_counter!(
                "autorange_workloads_exited_total",
                "Watchers stopped because their workload was no longer running"
            )
            .expect("Failed to register workloads_exited"),
        }
    }
}

/// Engine metrics for Prometheus exposition
///
/// This is a lightweight handle to the global metrics instance.
/// Multiple clones share the same underlying metrics.
#[derive(Clone)]
pub struct AutoRangeMetrics {
    _private: (),
}

impl Default for AutoRangeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl AutoRangeMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(AutoRangeMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &AutoRangeMetricsInner {
        GLOBAL_METRICS.get_or_init(AutoRangeMetricsInner::new)
    }

    pub fn observe_sampling_latency(&self, duration_secs: f64) {
        self.inner().sampling_latency_seconds.observe(duration_secs);
    }

    pub fn observe_apply_latency(&self, duration_secs: f64) {
        self.inner().apply_latency_seconds.observe(duration_secs);
    }

    pub fn set_watchers_active(&self, count: i64) {
        self.inner().watchers_active.set(count);
    }

    pub fn inc_samples_processed(&self) {
        self.inner().samples_processed.inc();
    }

    pub fn inc_samples_dropped(&self) {
        self.inner().samples_dropped.inc();
    }

    pub fn inc_sample_errors(&self) {
        self.inner().sample_errors.inc();
    }

    /// Count a closed window for `category` ("memory" or "cpu%")
    pub fn inc_windows_closed(&self, category: &str) {
        self.inner()
            .windows_closed
            .with_label_values(&[category])
            .inc();
    }

    pub fn inc_limits_applied(&self) {
        self.inner().limits_applied.inc();
    }

    pub fn inc_apply_failures(&self) {
        self.inner().apply_failures.inc();
    }

    pub fn inc_workloads_exited(&self) {
        self.inner().workloads_exited.inc();
    }
}

/// Structured logger for watcher lifecycle events
///
/// Every event carries an `event` field so log pipelines can filter on it.
#[derive(Clone)]
pub struct StructuredLogger {
    node_name: String,
}

impl StructuredLogger {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
        }
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    pub fn log_watch_started(&self, workload_id: &str, service: &str, categories: &[&str]) {
        info!(
            event = "watch_started",
            node = %self.node_name,
            workload_id = %workload_id,
            service = %service,
            categories = ?categories,
            "Started learning workload limits"
        );
    }

    pub fn log_window_closed(&self, workload_id: &str, category: &str, windows: usize) {
        debug!(
            event = "window_closed",
            node = %self.node_name,
            workload_id = %workload_id,
            category = %category,
            windows = windows,
            "Prediction window closed"
        );
    }

    pub fn log_prediction_converged(&self, workload_id: &str, ticks: u64) {
        info!(
            event = "prediction_converged",
            node = %self.node_name,
            workload_id = %workload_id,
            ticks = ticks,
            "All predictions converged"
        );
    }

    pub fn log_limits_applied(&self, workload_id: &str, update: &LimitUpdate, attempts: u32) {
        info!(
            event = "limits_applied",
            node = %self.node_name,
            workload_id = %workload_id,
            memory_limit_bytes = ?update.memory_limit_bytes,
            memory_reservation_bytes = ?update.memory_reservation_bytes,
            cpuset_cpus = ?update.cpuset_cpus,
            cpu_realtime_runtime_us = ?update.cpu_realtime_runtime_us,
            attempts = attempts,
            "Applied learned limits"
        );
    }

    pub fn log_apply_failed(&self, workload_id: &str, attempts: u32, error: &str) {
        warn!(
            event = "apply_failed",
            node = %self.node_name,
            workload_id = %workload_id,
            attempts = attempts,
            error = %error,
            "Failed to apply learned limits, workload left unchanged"
        );
    }

    pub fn log_workload_exited(&self, workload_id: &str, reason: &str) {
        info!(
            event = "workload_exited",
            node = %self.node_name,
            workload_id = %workload_id,
            reason = %reason,
            "Workload no longer running, watcher stopped"
        );
    }

    pub fn log_startup(&self, version: &str, workloads: usize) {
        info!(
            event = "agent_started",
            node = %self.node_name,
            agent_version = %version,
            workloads = workloads,
            "Autorange agent started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "agent_shutdown",
            node = %self.node_name,
            reason = %reason,
            "Autorange agent shutting down"
        );
    }
}
