//! Domain models for fanout.
//!
//! Canonical definitions for the core entities:
//! - `BuildTarget` / `BuildMatrix`: what gets built, declared up front
//! - `AppVersion`: the tag a run publishes under, resolved once
//! - `ImageDigest`: what a push-by-digest returns for one platform
//! - `MultiArchManifest`: the published manifest list

pub mod digest;
pub mod error;
pub mod manifest;
pub mod target;
pub mod version;

// Re-export main types and errors
pub use digest::{DigestAlgorithm, ImageDigest};
pub use error::{FanoutError, Result};
pub use manifest::{digest_reference, tagged_reference, MultiArchManifest};
pub use target::{BuildMatrix, BuildTarget};
pub use version::{
    resolve_app_version, AppVersion, TagDescriber, TriggerEvent, FALLBACK_VERSION, LATEST,
};
