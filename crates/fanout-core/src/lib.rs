//! Fanout Core Library
//!
//! Domain types and shared plumbing for the multi-architecture image
//! pipeline: build targets, the resolved app version, image digests,
//! manifest lists, git helpers and the tracing/metrics setup.

pub mod domain;
pub mod git;
pub mod metrics;
pub mod obs;
pub mod telemetry;

pub use domain::{
    digest_reference, resolve_app_version, tagged_reference, AppVersion, BuildMatrix,
    BuildTarget, DigestAlgorithm, FanoutError, ImageDigest, MultiArchManifest, Result,
    TagDescriber, TriggerEvent, FALLBACK_VERSION, LATEST,
};

pub use git::{capture_head_sha, describe_tags, GitDescriber};

pub use metrics::METRICS;
pub use obs::{job_span, run_span};
pub use telemetry::init_tracing;

/// Fanout version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
