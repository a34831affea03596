//! Fanout CI - multi-architecture image pipeline
//!
//! Provides the run orchestrator that:
//! - Builds and pushes one image per build target, by digest only
//! - Records each pushed digest as a write-once marker
//! - Publishes one manifest list once every target has reported
//! - Records every run and its lifecycle events in a run ledger

pub mod builder;
pub mod collector;
pub mod config;
pub mod error;
pub mod fakes;
pub mod gate;
pub mod merge;
pub mod pipeline;
pub mod recorder;
pub mod runner;
pub mod spec;
pub mod stage;

// Re-export key types
pub use builder::{parse_metadata_digest, CommandTargetBuilder, TargetBuilder};
pub use collector::DigestCollector;
pub use config::{PipelineConfig, StepTimeouts, DEFAULT_IMAGE};
pub use error::{CiResult, PipelineError, StepError};
pub use gate::{CompleteDigestSet, GateVerdict, MergeGate};
pub use merge::{ImagetoolsMerger, ManifestMerger, MergeTrigger};
pub use pipeline::{
    execute_job, CancelHandle, JobOutcome, JobStatus, MultiArchPipeline, PipelineResult,
};
pub use recorder::RunRecorder;
pub use runner::{StepResult, StepRunner};
pub use spec::RunSpec;
pub use stage::{BuildStep, StepConfig};
