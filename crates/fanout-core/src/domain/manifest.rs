//! The published multi-architecture manifest list.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::digest::ImageDigest;
use crate::domain::version::AppVersion;

/// A manifest list referencing every platform digest of a run, published
/// under `image:version`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiArchManifest {
    /// Image repository, e.g. `ghcr.io/xline-kv/xline`.
    pub image: String,

    /// Tag the list is published under.
    pub version: AppVersion,

    /// Platform image digests, sorted.
    pub digests: Vec<ImageDigest>,

    /// Digest of the manifest list itself, when the merger reports it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub list_digest: Option<ImageDigest>,

    pub published_at: DateTime<Utc>,
}

impl MultiArchManifest {
    /// Human-facing reference, `image:version`.
    pub fn reference(&self) -> String {
        tagged_reference(&self.image, &self.version)
    }

    pub fn platform_count(&self) -> usize {
        self.digests.len()
    }
}

/// `image@<algo>:<hex>`, the immutable reference of one pushed image.
pub fn digest_reference(image: &str, digest: &ImageDigest) -> String {
    format!("{image}@{digest}")
}

/// `image:<version>`.
pub fn tagged_reference(image: &str, version: &AppVersion) -> String {
    format!("{image}:{version}")
}
