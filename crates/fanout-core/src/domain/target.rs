//! Build targets and the static build matrix.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::domain::error::{FanoutError, Result};

/// One (OS, CPU architecture, compilation triple) combination to produce an
/// image for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BuildTarget {
    /// Container platform OS (`linux`).
    pub operating_system: String,

    /// Container platform architecture (`amd64`, `arm64`).
    pub cpu_architecture: String,

    /// Rust compilation triple (`x86_64-unknown-linux-gnu`).
    pub compilation_triple: String,

    /// Registry platform tag, `<os>/<arch>[/<variant>]`.
    pub platform_tag: String,

    /// Cross-build environment image, when the default for the triple is not wanted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_environment: Option<String>,
}

impl BuildTarget {
    /// Create a target whose platform tag is derived as `<os>/<arch>`.
    pub fn new(operating_system: &str, cpu_architecture: &str, compilation_triple: &str) -> Self {
        Self {
            operating_system: operating_system.to_string(),
            cpu_architecture: cpu_architecture.to_string(),
            compilation_triple: compilation_triple.to_string(),
            platform_tag: format!("{operating_system}/{cpu_architecture}"),
            build_environment: None,
        }
    }

    pub fn with_build_environment(mut self, image: impl Into<String>) -> Self {
        self.build_environment = Some(image.into());
        self
    }

    /// Job name used in logs and run events, e.g. `linux-amd64`.
    pub fn job_name(&self) -> String {
        self.platform_tag.replace('/', "-")
    }

    /// Check field shapes and that the platform tag agrees with OS and arch.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| {
            FanoutError::InvalidTarget(format!("{}: {reason}", self.compilation_triple))
        };

        for (field, value) in [
            ("operating_system", &self.operating_system),
            ("cpu_architecture", &self.cpu_architecture),
            ("compilation_triple", &self.compilation_triple),
        ] {
            if value.is_empty() {
                return Err(invalid(format!("{field} is empty")));
            }
            if !value
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            {
                return Err(invalid(format!("{field} {value:?} has unsupported characters")));
            }
        }

        let mut parts = self.platform_tag.split('/');
        let os = parts.next().unwrap_or_default();
        let arch = parts.next().unwrap_or_default();
        let variant = parts.next();
        if parts.next().is_some() || variant.is_some_and(str::is_empty) {
            return Err(invalid(format!("malformed platform tag {:?}", self.platform_tag)));
        }
        if os != self.operating_system || arch != self.cpu_architecture {
            return Err(invalid(format!(
                "platform tag {:?} does not match {}/{}",
                self.platform_tag, self.operating_system, self.cpu_architecture
            )));
        }
        Ok(())
    }
}

/// Ordered, validated list of build targets for one pipeline.
///
/// Invariants: non-empty; every target valid; compilation triples unique;
/// platform tags unique (so each triple determines exactly one platform).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct BuildMatrix(Vec<BuildTarget>);

impl BuildMatrix {
    pub fn new(targets: Vec<BuildTarget>) -> Result<Self> {
        if targets.is_empty() {
            return Err(FanoutError::InvalidMatrix("no build targets declared".to_string()));
        }

        let mut triples = HashSet::new();
        let mut platforms = HashSet::new();
        for target in &targets {
            target.validate()?;
            if !triples.insert(target.compilation_triple.as_str()) {
                return Err(FanoutError::InvalidMatrix(format!(
                    "duplicate compilation triple {}",
                    target.compilation_triple
                )));
            }
            if !platforms.insert(target.platform_tag.as_str()) {
                return Err(FanoutError::InvalidMatrix(format!(
                    "duplicate platform tag {}",
                    target.platform_tag
                )));
            }
        }
        Ok(Self(targets))
    }

    /// `linux/amd64` and `linux/arm64` GNU targets.
    pub fn default_linux() -> Self {
        Self(vec![
            BuildTarget::new("linux", "amd64", "x86_64-unknown-linux-gnu"),
            BuildTarget::new("linux", "arm64", "aarch64-unknown-linux-gnu"),
        ])
    }

    pub fn targets(&self) -> &[BuildTarget] {
        &self.0
    }

    pub fn iter(&self) -> impl Iterator<Item = &BuildTarget> {
        self.0.iter()
    }

    /// Number of declared targets; the merge phase requires this many digests.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Deterministic SHA-256 over the ordered (triple, platform) pairs.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for target in &self.0 {
            hasher.update(target.compilation_triple.as_bytes());
            hasher.update(b"=");
            hasher.update(target.platform_tag.as_bytes());
            hasher.update(b"\0");
        }
        hex::encode(hasher.finalize())
    }
}

impl<'de> Deserialize<'de> for BuildMatrix {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        let targets = Vec::<BuildTarget>::deserialize(deserializer)?;
        BuildMatrix::new(targets).map_err(serde::de::Error::custom)
    }
}
