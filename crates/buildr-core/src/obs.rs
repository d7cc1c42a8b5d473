//! Structured lifecycle events for jobs, stages and container sessions.
//!
//! Every event is emitted at `info!` (teardown problems at `warn!`) with an
//! `event` field, so JSON log pipelines can filter on it.

use tracing::info;

use crate::result::BuildResult;

/// The `buildr.job` span. Instrument job futures with it so every log
/// line carries the job id.
pub fn job_span(job_id: &str) -> tracing::Span {
    tracing::info_span!("buildr.job", job_id = %job_id)
}

pub fn emit_job_started(job_id: &str, remote: bool) {
    info!(event = "job.started", job_id = %job_id, remote = remote);
}

pub fn emit_job_finished(job_id: &str, result: BuildResult, duration_ms: u64) {
    info!(
        event = "job.finished",
        job_id = %job_id,
        result = %result,
        duration_ms = duration_ms,
    );
}

pub fn emit_stage_started(stage: &str, scripts: usize) {
    info!(event = "stage.started", stage = %stage, scripts = scripts);
}

pub fn emit_stage_finished(stage: &str, passed: bool) {
    info!(event = "stage.finished", stage = %stage, passed = passed);
}

pub fn emit_session_opened(container_id: &str, image: &str) {
    info!(event = "session.opened", container_id = %container_id, image = %image);
}

pub fn emit_session_closed(container_id: &str, executions: usize) {
    info!(event = "session.closed", container_id = %container_id, executions = executions);
}

/// Teardown failed; the job's result is unaffected.
pub fn emit_teardown_error(container_id: &str, error: &dyn std::fmt::Display) {
    tracing::warn!(event = "session.teardown_error", container_id = %container_id, error = %error);
}
