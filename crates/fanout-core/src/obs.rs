//! Structured observability hooks for the pipeline lifecycle.
//!
//! This module provides:
//! - Run- and job-scoped tracing spans, attached to tasks with
//!   `tracing::Instrument`
//! - Emission functions for the lifecycle points an operator needs to see:
//!   version resolved, job start/finish, digest pushed, marker recorded,
//!   barrier reached, merge outcome
//!
//! Events are emitted at `info!` (failures at `warn!`/`error!`) with a stable
//! `event` field, so JSON logs can be filtered per lifecycle point.

use tracing::{error, info, warn};

/// Span tagged with the run id.
pub fn run_span(run_id: &str) -> tracing::Span {
    tracing::info_span!("fanout.run", run_id = %run_id)
}

/// Span tagged with the job's platform and triple.
pub fn job_span(platform: &str, triple: &str) -> tracing::Span {
    tracing::info_span!("fanout.job", platform = %platform, triple = %triple)
}

/// Emit event: run started with its version and declared target count.
pub fn emit_run_started(run_id: &str, version: &str, targets: usize) {
    info!(event = "run.started", run_id = %run_id, version = %version, targets = targets);
}

/// Emit event: version resolved from the trigger event.
pub fn emit_version_resolved(trigger: &str, version: &str) {
    info!(event = "version.resolved", trigger = %trigger, version = %version);
}

/// Emit event: a build job started.
pub fn emit_job_started(platform: &str, triple: &str) {
    info!(event = "job.started", platform = %platform, triple = %triple);
}

/// Emit event: a platform image was pushed by digest.
pub fn emit_digest_pushed(platform: &str, digest: &str) {
    info!(event = "job.digest_pushed", platform = %platform, digest = %digest);
}

/// Emit event: the digest marker was recorded; the job is complete.
pub fn emit_marker_recorded(platform: &str, marker: &str) {
    info!(event = "job.marker_recorded", platform = %platform, marker = %marker);
}

/// Emit event: a build job failed.
pub fn emit_job_failed(platform: &str, error: &dyn std::fmt::Display) {
    warn!(event = "job.failed", platform = %platform, error = %error);
}

/// Emit event: every job reached a terminal state.
pub fn emit_barrier_reached(succeeded: usize, failed: usize, waited_ms: u64) {
    info!(
        event = "barrier.reached",
        succeeded = succeeded,
        failed = failed,
        waited_ms = waited_ms,
    );
}

/// Emit event: the merge gate refused to publish.
pub fn emit_merge_rejected(expected: usize, found: usize) {
    error!(event = "merge.rejected", expected = expected, found = found);
}

/// Emit event: manifest list published.
pub fn emit_manifest_published(reference: &str, platforms: usize) {
    info!(event = "merge.published", reference = %reference, platforms = platforms);
}

/// Emit event: run finished.
pub fn emit_run_finished(run_id: &str, duration_ms: u64, success: bool) {
    info!(
        event = "run.finished",
        run_id = %run_id,
        duration_ms = duration_ms,
        success = success,
    );
}
