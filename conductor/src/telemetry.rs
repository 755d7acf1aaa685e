//! Tracing and telemetry instrumentation for conductor.
//!
//! Span constructors for the launch, dispatch and stop paths, plus
//! `record_*` helpers that emit a structured event and, with the `metrics`
//! feature, update the matching Prometheus collector. Every helper works with
//! the feature disabled.
//!
//! # Example
//!
//! ```ignore
//! use conductor::telemetry::{dispatch_span, record_run_finished};
//!
//! let span = dispatch_span(run_id, "singleAsyncJob");
//! let _enter = span.enter();
//! // ... run the work
//! record_run_finished(run_id, "singleAsyncJob", "completed");
//! ```

use std::fmt::Display;
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{info_span, Instrument, Span};

/// Span covering one `launch` call.
#[must_use]
pub fn launch_span(job_name: impl AsRef<str>) -> Span {
    info_span!("conductor.launch", job_name = %job_name.as_ref())
}

/// Span covering the lifetime of one worker.
#[must_use]
pub fn dispatch_span(run_id: impl Display, job_name: impl AsRef<str>) -> Span {
    info_span!(
        "conductor.dispatch",
        run_id = %run_id,
        job_name = %job_name.as_ref(),
    )
}

/// Span covering one `stop` call.
#[must_use]
pub fn stop_span(run_id: impl Display) -> Span {
    info_span!("conductor.stop", run_id = %run_id)
}

/// Instrument a future with a dispatch span.
pub fn instrument_dispatch<F>(
    run_id: impl Display,
    job_name: impl AsRef<str>,
    future: F,
) -> impl Future<Output = F::Output>
where
    F: Future,
{
    future.instrument(dispatch_span(run_id, job_name))
}

pub fn record_run_launched(run_id: impl Display, job_name: impl AsRef<str>) {
    tracing::info!(
        run_id = %run_id,
        job_name = %job_name.as_ref(),
        "run launched"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_run_launched(job_name.as_ref());
}

/// Record the outcome of a stop request.
///
/// `outcome` is one of `flagged`, `noop` or `not_found`.
pub fn record_stop_request(run_id: impl Display, outcome: impl AsRef<str>) {
    tracing::info!(
        run_id = %run_id,
        outcome = %outcome.as_ref(),
        "stop request handled"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_stop_request(outcome.as_ref());
}

pub fn record_run_finished(run_id: impl Display, job_name: impl AsRef<str>, status: impl AsRef<str>) {
    tracing::info!(
        run_id = %run_id,
        job_name = %job_name.as_ref(),
        status = %status.as_ref(),
        "run finished"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_run_finished(job_name.as_ref(), status.as_ref());
}

/// Start timing a worker. The returned handle tracks the active-worker gauge
/// until passed to [`record_worker_end`].
pub fn record_worker_start(job_name: impl AsRef<str>) -> WorkerTimingHandle {
    #[cfg(feature = "metrics")]
    crate::metrics::worker_started(job_name.as_ref());

    WorkerTimingHandle {
        job_name: job_name.as_ref().to_string(),
        start: Instant::now(),
    }
}

/// Finish timing a worker and observe its duration.
pub fn record_worker_end(handle: WorkerTimingHandle, status: impl AsRef<str>) -> Duration {
    let duration = handle.start.elapsed();
    tracing::debug!(
        job_name = %handle.job_name,
        status = %status.as_ref(),
        duration_secs = duration.as_secs_f64(),
        "worker duration observed"
    );

    #[cfg(feature = "metrics")]
    {
        crate::metrics::worker_finished(&handle.job_name);
        crate::metrics::observe_run_duration(
            &handle.job_name,
            status.as_ref(),
            duration.as_secs_f64(),
        );
    }

    duration
}

/// Opaque timing handle returned by [`record_worker_start`].
#[derive(Debug)]
pub struct WorkerTimingHandle {
    job_name: String,
    start: Instant,
}

impl WorkerTimingHandle {
    #[must_use]
    pub fn job_name(&self) -> &str {
        &self.job_name
    }

    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}
