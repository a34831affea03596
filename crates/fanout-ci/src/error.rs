//! Error types for the build fan-out and merge phases.

use fanout_core::FanoutError;
use fanout_state::StorageError;
use thiserror::Error;

/// Failure to run one external step.
#[derive(Error, Debug)]
pub enum StepError {
    #[error("step {step} has an empty command")]
    EmptyCommand { step: String },

    #[error("step {step} could not start `{program}`: {source}")]
    Spawn {
        step: String,
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("step {step} timed out after {secs} seconds")]
    Timeout { step: String, secs: u64 },

    #[error("step {step} failed while waiting for output: {source}")]
    Wait {
        step: String,
        #[source]
        source: std::io::Error,
    },
}

/// Failures of a pipeline run.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("{target}: {step} failed: {detail}")]
    Build {
        target: String,
        step: String,
        detail: String,
    },

    #[error("{target}: image push failed: {detail}")]
    Push { target: String, detail: String },

    #[error("could not record digest {digest}: {detail}")]
    Collector { digest: String, detail: String },

    #[error("merge refused: found {found} of {expected} digests ({})", violations.join("; "))]
    MergeIncomplete {
        expected: usize,
        found: usize,
        violations: Vec<String>,
    },

    #[error("merge trigger already fired for run {run_id}")]
    AlreadyFired { run_id: String },

    #[error("manifest merge failed: {0}")]
    Merge(String),

    #[error("barrier not reached within {secs} seconds; pending: {}", pending.join(", "))]
    BarrierTimeout { secs: u64, pending: Vec<String> },

    #[error("run cancelled")]
    Cancelled,

    #[error(transparent)]
    Step(#[from] StepError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Domain(#[from] FanoutError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type CiResult<T> = std::result::Result<T, PipelineError>;
