//! Structured lifecycle events for pipeline runs.
//!
//! Every event carries an `event` field (`pipeline.started`,
//! `job.state`, `step.finished`, ...) so JSON logs can be filtered by kind.

use std::path::Path;
use tracing::{info, warn};

use crate::job::{Job, JobState};
use crate::runner::StepResult;

/// Span covering one job; step and coverage events nest under it.
pub fn job_span(run_id: &str, job: &Job) -> tracing::Span {
    tracing::info_span!(
        "matrix_ci.job",
        run_id = %run_id,
        job = job.number,
        key = %job.key.short(),
        label = %job.label,
    )
}

pub fn pipeline_started(run_id: &str, name: &str, jobs: usize, max_parallel: usize) {
    info!(
        event = "pipeline.started",
        run_id = %run_id,
        pipeline = %name,
        jobs = jobs,
        max_parallel = max_parallel,
    );
}

pub fn job_state(job: &Job, state: JobState) {
    info!(event = "job.state", job = job.number, label = %job.label, state = %state);
}

pub fn step_finished(result: &StepResult) {
    if result.status.is_failure() {
        warn!(
            event = "step.finished",
            step = %result.step_name,
            category = %result.category,
            status = %result.status,
            exit_code = ?result.exit_code,
            duration_ms = result.duration_ms,
            allow_failure = result.allow_failure,
        );
    } else {
        info!(
            event = "step.finished",
            step = %result.step_name,
            category = %result.category,
            status = %result.status,
            duration_ms = result.duration_ms,
        );
    }
}

pub fn job_finished(job: &Job, state: JobState, duration_ms: u64) {
    info!(
        event = "job.finished",
        job = job.number,
        label = %job.label,
        state = %state,
        allow_failure = job.allow_failure,
        duration_ms = duration_ms,
    );
}

pub fn pipeline_finished(run_id: &str, state: &str, failed: usize, duration_ms: u64) {
    info!(
        event = "pipeline.finished",
        run_id = %run_id,
        state = %state,
        failed_jobs = failed,
        duration_ms = duration_ms,
    );
}

pub fn coverage_skipped(path: &Path, reason: &str) {
    warn!(event = "coverage.skipped", path = %path.display(), reason = %reason);
}

pub fn notification_failed(sink: &str, key: &str, error: &dyn std::fmt::Display) {
    warn!(event = "notify.failed", sink = %sink, key = %key, error = %error);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobSpec;

    #[test]
    fn test_job_span_create() {
        let job = Job::new(1, JobSpec::new().with_axis("os", "linux"), &[]);
        let span = job_span("run-1", &job);
        let _entered = span.enter();
        job_state(&job, JobState::Provisioning);
    }
}
