//! Error types for fanout-state

use thiserror::Error;

/// Errors returned by the storage traits and their backends.
#[derive(Error, Debug)]
pub enum StorageError {
    /// A marker with this name was already recorded for the run.
    ///
    /// Markers are write-once; two jobs producing the same digest within a
    /// run indicates a nondeterministic build.
    #[error("marker already recorded for run {run_id}: {name}")]
    MarkerExists { run_id: String, name: String },

    /// Marker names must be non-empty lowercase hex with no path separators.
    #[error("invalid marker name: {name:?}")]
    InvalidMarkerName { name: String },

    /// Run ids are used as directory names and must be a single path segment.
    #[error("invalid run id: {run_id:?}")]
    InvalidRunId { run_id: String },

    /// A consumer expected at least one marker and found none.
    #[error("no markers found for run {run_id}")]
    EmptyCollection { run_id: String },

    /// Run not found in the ledger
    #[error("run not found: {run_id}")]
    RunNotFound { run_id: String },

    /// Run is not in the state the operation requires
    #[error("run {run_id} is {status}, expected {expected}")]
    InvalidRunState {
        run_id: String,
        status: String,
        expected: String,
    },

    /// Event sequence numbers must increase strictly within a run
    #[error("out-of-order event for run {run_id}: seq {seq} after {last}")]
    OutOfOrderEvent { run_id: String, seq: u64, last: u64 },

    /// Filesystem error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
