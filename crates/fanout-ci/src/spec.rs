//! Run specification and identity.

use std::time::Duration;

use fanout_core::{AppVersion, BuildMatrix, TriggerEvent};
use fanout_state::{RunId, RunMetadata};
use serde_json::json;
use sha2::{Digest, Sha256};

use crate::config::PipelineConfig;

/// Everything fixed before the first job starts.
#[derive(Debug, Clone)]
pub struct RunSpec {
    pub run_id: RunId,

    /// Resolved once; every job and the merge see this value.
    pub version: AppVersion,

    pub trigger: TriggerEvent,

    pub matrix: BuildMatrix,

    pub image: String,

    pub binaries: Vec<String>,

    /// Commit the run builds, when known.
    pub git_sha: Option<String>,

    /// Upper bound on the completion barrier.
    pub barrier_timeout: Duration,
}

impl RunSpec {
    pub fn from_config(
        config: &PipelineConfig,
        trigger: TriggerEvent,
        version: AppVersion,
    ) -> Self {
        Self {
            run_id: RunId::new(),
            version,
            trigger,
            matrix: config.targets.clone(),
            image: config.image.clone(),
            binaries: config.binaries.clone(),
            git_sha: None,
            barrier_timeout: Duration::from_secs(config.timeouts.barrier_secs),
        }
    }

    pub fn with_run_id(mut self, run_id: RunId) -> Self {
        self.run_id = run_id;
        self
    }

    pub fn with_git_sha(mut self, sha: impl Into<String>) -> Self {
        self.git_sha = Some(sha.into());
        self
    }

    pub fn with_barrier_timeout(mut self, timeout: Duration) -> Self {
        self.barrier_timeout = timeout;
        self
    }

    /// Deterministic digest of what the run builds: image, binaries and the
    /// ordered target matrix. Runs of the same build share it.
    pub fn build_digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.image.as_bytes());
        hasher.update(b"\0");
        for bin in &self.binaries {
            hasher.update(bin.as_bytes());
            hasher.update(b"\0");
        }
        hasher.update(self.matrix.fingerprint().as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn metadata(&self) -> RunMetadata {
        RunMetadata {
            git_sha: self.git_sha.clone(),
            image: self.image.clone(),
            tags: json!({
                "version": self.version,
                "trigger": self.trigger,
                "platforms": self.matrix.iter().map(|t| &t.platform_tag).collect::<Vec<_>>(),
                "binaries": &self.binaries,
            }),
        }
    }
}
