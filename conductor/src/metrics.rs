//! Prometheus metrics for conductor.
//!
//! Compiled only with the `metrics` feature.
//!
//! # Metrics
//!
//! ## Counters
//! - `conductor_runs_launched_total` - Runs accepted by the engine and dispatched
//! - `conductor_runs_finished_total` - Runs that reached a terminal record status
//! - `conductor_stop_requests_total` - Stop requests that set a cancellation flag
//!
//! ## Gauges
//! - `conductor_active_workers` - Workers currently executing
//!
//! ## Histograms
//! - `conductor_run_duration_seconds` - Wall time from processing to terminal status
#![cfg(feature = "metrics")]

use prometheus::{exponential_buckets, CounterVec, GaugeVec, HistogramVec, Opts, Registry};
use std::sync::LazyLock;

/// Global Prometheus registry for conductor metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Labels: `job_name`.
pub static RUNS_LAUNCHED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "conductor_runs_launched_total",
        "Total number of runs launched",
    );
    CounterVec::new(opts, &["job_name"])
        .expect("conductor_runs_launched_total metric creation failed")
});

/// Labels: `job_name`, `status` (completed, failed, cancelled).
pub static RUNS_FINISHED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "conductor_runs_finished_total",
        "Total number of runs that finished",
    );
    CounterVec::new(opts, &["job_name", "status"])
        .expect("conductor_runs_finished_total metric creation failed")
});

/// Labels: `outcome` (flagged, noop, not_found).
pub static STOP_REQUESTS_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "conductor_stop_requests_total",
        "Total number of stop requests",
    );
    CounterVec::new(opts, &["outcome"])
        .expect("conductor_stop_requests_total metric creation failed")
});

/// Labels: `job_name`.
pub static ACTIVE_WORKERS: LazyLock<GaugeVec> = LazyLock::new(|| {
    let opts = Opts::new("conductor_active_workers", "Workers currently executing");
    GaugeVec::new(opts, &["job_name"]).expect("conductor_active_workers metric creation failed")
});

/// Labels: `job_name`, `status`.
pub static RUN_DURATION_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    let buckets = exponential_buckets(0.01, 2.0, 18).expect("bucket creation failed");
    let opts = prometheus::HistogramOpts::new(
        "conductor_run_duration_seconds",
        "Run execution duration in seconds",
    )
    .buckets(buckets);
    HistogramVec::new(opts, &["job_name", "status"])
        .expect("conductor_run_duration_seconds metric creation failed")
});

/// Register all metrics with [`REGISTRY`]. Idempotent.
pub fn init_metrics() -> anyhow::Result<()> {
    let registry = &*REGISTRY;

    for metric in [
        Box::new(RUNS_LAUNCHED_TOTAL.clone()) as Box<dyn prometheus::core::Collector>,
        Box::new(RUNS_FINISHED_TOTAL.clone()),
        Box::new(STOP_REQUESTS_TOTAL.clone()),
        Box::new(ACTIVE_WORKERS.clone()),
        Box::new(RUN_DURATION_SECONDS.clone()),
    ] {
        if let Err(e) = registry.register(metric) {
            let msg = e.to_string();
            if !msg.contains("Duplicate metrics collector registration attempted") {
                return Err(e.into());
            }
        }
    }

    Ok(())
}

pub fn record_run_launched(job_name: &str) {
    RUNS_LAUNCHED_TOTAL.with_label_values(&[job_name]).inc();
}

pub fn record_run_finished(job_name: &str, status: &str) {
    RUNS_FINISHED_TOTAL
        .with_label_values(&[job_name, status])
        .inc();
}

pub fn record_stop_request(outcome: &str) {
    STOP_REQUESTS_TOTAL.with_label_values(&[outcome]).inc();
}

pub fn worker_started(job_name: &str) {
    ACTIVE_WORKERS.with_label_values(&[job_name]).inc();
}

pub fn worker_finished(job_name: &str) {
    ACTIVE_WORKERS.with_label_values(&[job_name]).dec();
}

pub fn observe_run_duration(job_name: &str, status: &str, duration_secs: f64) {
    RUN_DURATION_SECONDS
        .with_label_values(&[job_name, status])
        .observe(duration_secs);
}

/// Gather all registered metrics in Prometheus text format.
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_initialization_is_idempotent() {
        init_metrics().expect("metrics initialization should succeed");
        init_metrics().expect("second initialization should succeed");
    }

    #[test]
    fn test_active_workers_gauge() {
        worker_started("gauge_job");
        worker_started("gauge_job");
        worker_finished("gauge_job");
        assert_eq!(ACTIVE_WORKERS.with_label_values(&["gauge_job"]).get(), 1.0);
        worker_finished("gauge_job");
    }

    #[test]
    fn test_gather_metrics() {
        init_metrics().expect("metrics initialization should succeed");

        record_run_launched("test_job");
        record_run_finished("test_job", "completed");
        record_stop_request("flagged");
        observe_run_duration("test_job", "completed", 0.5);

        let output = gather_metrics().expect("gather should succeed");
        assert!(output.contains("conductor_runs_launched_total"));
        assert!(output.contains("conductor_runs_finished_total"));
        assert!(output.contains("conductor_stop_requests_total"));
        assert!(output.contains("conductor_run_duration_seconds"));
    }
}
