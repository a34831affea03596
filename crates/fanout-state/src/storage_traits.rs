//! Storage trait definitions for fanout
//!
//! These traits define the two storage abstractions a pipeline run needs:
//! - `DigestCollection`: run-scoped, append-only set of digest markers
//! - `RunLedger`: execution run persistence (events, summaries)
//!
//! All traits are async and backend-agnostic. In-memory implementations live
//! in the `memory` module, the filesystem collection in `fs`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// Run identity
// ---------------------------------------------------------------------------

/// Unique identifier for a pipeline run
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    /// Generate a new random RunId
    pub fn new() -> Self {
        RunId(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the id is usable as a single path segment.
    pub fn is_path_safe(&self) -> bool {
        !self.0.is_empty()
            && self.0 != "."
            && self.0 != ".."
            && self
                .0
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for RunId {
    fn from(s: &str) -> Self {
        RunId(s.to_string())
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// DigestCollection: write-once marker set per run
// ---------------------------------------------------------------------------

/// Check that `name` is a valid marker name: non-empty lowercase hex.
///
/// Markers are named by the digest payload only; an algorithm prefix such as
/// `sha256:` must already have been stripped.
pub fn validate_marker_name(name: &str) -> StorageResult<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c));
    if valid {
        Ok(())
    } else {
        Err(StorageError::InvalidMarkerName {
            name: name.to_string(),
        })
    }
}

/// Run-scoped collection of digest markers.
///
/// Guarantees:
/// - `put_marker` is write-once: a second put of the same name in the same
///   run fails with `StorageError::MarkerExists`.
/// - `list_markers` returns every recorded name for the run, sorted.
/// - Runs are isolated: markers of one run never appear in another's listing.
#[async_trait]
pub trait DigestCollection: Send + Sync {
    /// Record a zero-byte marker named `name` for `run_id`.
    async fn put_marker(&self, run_id: &RunId, name: &str) -> StorageResult<()>;

    /// List all marker names recorded for `run_id` (sorted, possibly empty).
    async fn list_markers(&self, run_id: &RunId) -> StorageResult<Vec<String>>;

    /// Like `list_markers`, but an empty listing is an error.
    async fn require_markers(&self, run_id: &RunId) -> StorageResult<Vec<String>> {
        let markers = self.list_markers(run_id).await?;
        if markers.is_empty() {
            return Err(StorageError::EmptyCollection {
                run_id: run_id.0.clone(),
            });
        }
        Ok(markers)
    }
}

// ---------------------------------------------------------------------------
// RunLedger: Execution Run Persistence
// ---------------------------------------------------------------------------

/// Metadata attached to a run at creation time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMetadata {
    /// Git SHA at time of run
    pub git_sha: Option<String>,
    /// Image repository the run publishes to
    pub image: String,
    /// Arbitrary key-value tags
    pub tags: serde_json::Value,
}

/// A single event in a pipeline run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEvent {
    /// Monotonic sequence number within the run
    pub seq: u64,
    /// Event kind (e.g. "job_started", "marker_recorded", "manifest_published")
    pub kind: String,
    /// Event payload
    pub payload: serde_json::Value,
    /// Timestamp
    pub timestamp: DateTime<Utc>,
}

/// Summary produced when a run reaches a terminal state
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunSummary {
    /// Total events recorded
    pub total_events: u64,
    /// Jobs that recorded a marker
    pub jobs_succeeded: u64,
    /// Jobs that failed, timed out or were aborted
    pub jobs_failed: u64,
    /// Published manifest reference (`image:version`), if any
    pub manifest: Option<String>,
    /// Duration in milliseconds
    pub duration_ms: u64,
    /// Whether the run succeeded
    pub success: bool,
}

/// Status of a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// Full run record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: RunId,
    /// Fingerprint of the build matrix the run was started with
    pub matrix_digest: String,
    pub metadata: RunMetadata,
    pub status: RunStatus,
    pub summary: Option<RunSummary>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Pipeline run ledger.
///
/// Guarantees:
/// - Events are ordered by strictly increasing `seq` within a run.
/// - A run transitions: Running → Completed | Failed | Cancelled (terminal).
/// - Terminal runs are immutable.
#[async_trait]
pub trait RunLedger: Send + Sync {
    /// Create a new run under `run_id`.
    async fn create_run(
        &self,
        run_id: &RunId,
        matrix_digest: &str,
        metadata: RunMetadata,
    ) -> StorageResult<()>;

    /// Append an event to an active run. Fails if the run is terminal.
    async fn append_event(&self, run_id: &RunId, event: RunEvent) -> StorageResult<()>;

    /// Mark a run as completed with a summary.
    async fn complete_run(&self, run_id: &RunId, summary: RunSummary) -> StorageResult<()>;

    /// Mark a run as failed with a summary.
    async fn fail_run(&self, run_id: &RunId, summary: RunSummary) -> StorageResult<()>;

    /// Mark a run as cancelled.
    async fn cancel_run(&self, run_id: &RunId, summary: RunSummary) -> StorageResult<()>;

    /// Retrieve a run record by ID.
    async fn get_run(&self, run_id: &RunId) -> StorageResult<RunRecord>;

    /// Retrieve all events for a run, ordered by seq.
    async fn get_events(&self, run_id: &RunId) -> StorageResult<Vec<RunEvent>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marker_name_accepts_lowercase_hex() {
        assert!(validate_marker_name("0123456789abcdef").is_ok());
    }

    #[test]
    fn marker_name_rejects_prefix_and_separators() {
        assert!(validate_marker_name("sha256:abcd").is_err());
        assert!(validate_marker_name("../abcd").is_err());
        assert!(validate_marker_name("ABCD").is_err());
        assert!(validate_marker_name("").is_err());
    }

    #[test]
    fn run_id_path_safety() {
        assert!(RunId::new().is_path_safe());
        assert!(RunId::from("gh-1234_5").is_path_safe());
        assert!(!RunId::from("..").is_path_safe());
        assert!(!RunId::from("a/b").is_path_safe());
        assert!(!RunId::from("").is_path_safe());
    }
}
