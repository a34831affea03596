//! Pipeline configuration loaded from TOML.
//!
//! Every field has a default, so an empty file (or no file) describes the
//! stock two-platform Linux build of `ghcr.io/xline-kv/xline`.

use std::path::{Path, PathBuf};

use fanout_core::BuildMatrix;
use serde::{Deserialize, Serialize};

use crate::error::{CiResult, PipelineError};

pub const DEFAULT_IMAGE: &str = "ghcr.io/xline-kv/xline";

/// Per-step timeouts in seconds. Zero disables the limit for that step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StepTimeouts {
    pub prepare_secs: u64,
    pub compile_secs: u64,
    pub image_secs: u64,
    pub merge_secs: u64,
    /// Upper bound on waiting for every job to reach a terminal state.
    pub barrier_secs: u64,
}

impl Default for StepTimeouts {
    fn default() -> Self {
        Self {
            prepare_secs: 600,
            compile_secs: 3600,
            image_secs: 1800,
            merge_secs: 600,
            barrier_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    /// Image repository every platform image and the manifest list go to.
    pub image: String,

    /// Binaries compiled per target and shipped in the image.
    pub binaries: Vec<String>,

    /// Source tree; relative paths below are resolved against it.
    pub workspace: PathBuf,

    /// Image build context. Binaries are staged at `<context>/<os>/<arch>/`.
    pub context_dir: PathBuf,

    /// Dockerfile, when not `<context>/Dockerfile`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dockerfile: Option<PathBuf>,

    /// Cargo target directory root; each triple gets its own subdirectory.
    pub target_dir: PathBuf,

    /// Digest markers and run reports.
    pub artifacts_dir: PathBuf,

    /// Cross-compilation driver.
    pub cross_program: String,

    /// Container CLI providing `buildx`.
    pub docker_program: String,

    pub timeouts: StepTimeouts,

    pub targets: BuildMatrix,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            image: DEFAULT_IMAGE.to_string(),
            binaries: vec!["xline".to_string(), "benchmark".to_string()],
            workspace: PathBuf::from("."),
            context_dir: PathBuf::from("ci/image"),
            dockerfile: None,
            target_dir: PathBuf::from("target/fanout"),
            artifacts_dir: PathBuf::from(".fanout"),
            cross_program: "cross".to_string(),
            docker_program: "docker".to_string(),
            timeouts: StepTimeouts::default(),
            targets: BuildMatrix::default_linux(),
        }
    }
}

impl PipelineConfig {
    /// Read and validate a TOML config file.
    pub fn load(path: &Path) -> CiResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> CiResult<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| PipelineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> CiResult<()> {
        let image = self.image.trim();
        if image.is_empty() || image.contains(char::is_whitespace) {
            return Err(PipelineError::Config(format!(
                "image {:?} is not a repository reference",
                self.image
            )));
        }
        if image.contains('@') || image.rsplit('/').next().is_some_and(|last| last.contains(':')) {
            return Err(PipelineError::Config(format!(
                "image {:?} must not carry a tag or digest",
                self.image
            )));
        }
        if self.binaries.is_empty() {
            return Err(PipelineError::Config("no binaries declared".to_string()));
        }
        for bin in &self.binaries {
            if bin.is_empty()
                || !bin
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'))
            {
                return Err(PipelineError::Config(format!("invalid binary name {bin:?}")));
            }
        }
        if self.cross_program.is_empty() || self.docker_program.is_empty() {
            return Err(PipelineError::Config("tool program names must be set".to_string()));
        }
        Ok(())
    }

    /// Resolve a configured path against the workspace.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.workspace.join(path)
        }
    }

    pub fn context_path(&self) -> PathBuf {
        self.resolve(&self.context_dir)
    }

    pub fn dockerfile_path(&self) -> PathBuf {
        match &self.dockerfile {
            Some(path) => self.resolve(path),
            None => self.context_path().join("Dockerfile"),
        }
    }

    pub fn target_path(&self) -> PathBuf {
        self.resolve(&self.target_dir)
    }

    pub fn artifacts_path(&self) -> PathBuf {
        self.resolve(&self.artifacts_dir)
    }
}
