//! Job execution span helpers.

use tracing::Span;

use crate::model::{Call, Job, RunnerSpec};

/// Start a span for one dispatched unit of work.
///
/// The `job.outcome` field is declared empty and is filled by
/// [`record_outcome`].
pub fn start_job_span(receiver: &RunnerSpec, job: &Job, call: &Call) -> Span {
    tracing::info_span!(
        "job.execute",
        "runner.kind" = %receiver.kind,
        "runner.name" = %receiver.name,
        "job.id" = %job,
        "job.call" = call.name(),
        "job.outcome" = tracing::field::Empty,
    )
}

/// Record how the unit of work ended.
pub fn record_outcome(span: &Span, outcome: &str) {
    span.record("job.outcome", outcome);
    span.in_scope(|| {
        tracing::debug!(outcome, "job finished");
    });
}
