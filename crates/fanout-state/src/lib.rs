//! Fanout-State: storage layer for the fanout pipeline
//!
//! Holds everything a pipeline run persists:
//!
//! ## Layer 0 - Data/Persistence
//!
//! - `DigestCollection`: run-scoped, write-once digest markers. The set of
//!   markers for a run is the merge phase's only input besides the version.
//! - `RunLedger`: ordered lifecycle events and terminal status per run.
//!
//! Backends: `memory` (in-process) and `fs` (marker files on disk, shareable
//! between separately launched build and merge commands).

mod error;
pub mod fs;
pub mod memory;
pub mod storage_traits;

pub use error::StorageError;
pub use fs::FsDigestCollection;
pub use memory::{MemoryDigestCollection, MemoryRunLedger};
pub use storage_traits::{
    validate_marker_name, DigestCollection, RunEvent, RunId, RunLedger, RunMetadata, RunRecord,
    RunStatus, RunSummary, StorageResult,
};
