//! Metric instrument factories for deferq.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"deferq"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for deferq instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("deferq")
}

/// Counter: jobs submitted to the work queue and recorded in a run.
/// Labels: `runner`, `source` ("producer" | "worker" | "continuation").
pub fn jobs_enqueued() -> Counter<u64> {
    meter()
        .u64_counter("deferq.jobs.enqueued")
        .with_description("Number of jobs enqueued into runs")
        .build()
}

/// Counter: worker-context deferral outcomes.
/// Labels: `runner`, `outcome` ("resolved" | "requeued" | "missing").
pub fn deferrals() -> Counter<u64> {
    meter()
        .u64_counter("deferq.deferrals")
        .with_description("Number of deferred result attempts by outcome")
        .build()
}

/// Counter: failed lock acquisitions that were retried.
/// Labels: `key`.
pub fn lock_contention() -> Counter<u64> {
    meter()
        .u64_counter("deferq.lock.contention")
        .with_description("Number of lock acquisitions that timed out and were retried")
        .build()
}

/// Counter: work method failures.
/// Labels: `runner`, `handled` ("true" | "false").
pub fn work_errors() -> Counter<u64> {
    meter()
        .u64_counter("deferq.work.errors")
        .with_description("Number of work method failures")
        .build()
}

/// Histogram: job execution duration in milliseconds.
/// Labels: `runner`, `call`.
pub fn job_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("deferq.job.duration_ms")
        .with_description("Job execution duration in milliseconds")
        .with_unit("ms")
        .build()
}
