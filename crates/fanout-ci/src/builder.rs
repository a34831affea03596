//! Per-target build: compile, stage, build and push one platform image.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use fanout_core::{AppVersion, BuildTarget, ImageDigest};
use tracing::{debug, info};

use crate::config::PipelineConfig;
use crate::error::{CiResult, PipelineError};
use crate::runner::{StepResult, StepRunner};
use crate::stage::{self, BuildStep, StepConfig, METADATA_DIGEST_KEY};

/// Produces the pushed image digest for one target.
///
/// Implementations must not tag anything; the only output is the digest.
#[async_trait]
pub trait TargetBuilder: Send + Sync {
    async fn build(&self, target: &BuildTarget, version: &AppVersion) -> CiResult<ImageDigest>;
}

/// Builder that shells out to `cross` and `docker buildx`.
pub struct CommandTargetBuilder {
    config: Arc<PipelineConfig>,
}

impl CommandTargetBuilder {
    pub fn new(config: Arc<PipelineConfig>) -> Self {
        Self { config }
    }

    async fn run(
        &self,
        target: &BuildTarget,
        kind: BuildStep,
        step: &StepConfig,
    ) -> CiResult<StepResult> {
        info!(step = kind.name(), command = %step.display_command(), "running step");
        let result = StepRunner::execute_step(step)
            .await
            .map_err(|e| step_failure(target, kind, e.to_string()))?;
        if !result.passed() {
            return Err(step_failure(
                target,
                kind,
                format!("exit code {}: {}", result.exit_code, result.stderr_tail()),
            ));
        }
        debug!(step = kind.name(), duration_ms = result.duration_ms, "step passed");
        Ok(result)
    }

    async fn stage_binaries(&self, target: &BuildTarget) -> CiResult<()> {
        let from = stage::release_dir(&self.config, target);
        let to = stage::staging_dir(&self.config, target);
        tokio::fs::create_dir_all(&to)
            .await
            .map_err(|e| step_failure(target, BuildStep::Stage, format!("{}: {e}", to.display())))?;

        for bin in &self.config.binaries {
            let src = from.join(bin);
            tokio::fs::copy(&src, to.join(bin)).await.map_err(|e| {
                step_failure(target, BuildStep::Stage, format!("{}: {e}", src.display()))
            })?;
        }
        debug!(dir = %to.display(), "binaries staged");
        Ok(())
    }
}

#[async_trait]
impl TargetBuilder for CommandTargetBuilder {
    async fn build(&self, target: &BuildTarget, version: &AppVersion) -> CiResult<ImageDigest> {
        let config = &self.config;

        self.run(target, BuildStep::Prepare, &stage::prepare_step(config, target))
            .await?;

        let target_dir = stage::triple_target_dir(config, target);
        tokio::fs::create_dir_all(&target_dir).await.map_err(|e| {
            step_failure(target, BuildStep::Compile, format!("{}: {e}", target_dir.display()))
        })?;
        self.run(target, BuildStep::Compile, &stage::compile_step(config, target))
            .await?;

        self.stage_binaries(target).await?;

        let metadata = stage::metadata_file(config, target);
        match tokio::fs::remove_file(&metadata).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(push_failure(target, format!("stale metadata file: {e}"))),
        }
        self.run(
            target,
            BuildStep::Image,
            &stage::image_step(config, target, version, &metadata),
        )
        .await?;

        read_pushed_digest(target, &metadata).await
    }
}

async fn read_pushed_digest(target: &BuildTarget, metadata: &Path) -> CiResult<ImageDigest> {
    let text = tokio::fs::read_to_string(metadata)
        .await
        .map_err(|e| push_failure(target, format!("metadata file {}: {e}", metadata.display())))?;
    parse_metadata_digest(&text).map_err(|detail| push_failure(target, detail))
}

/// Extract the pushed digest from a buildx `--metadata-file` document.
pub fn parse_metadata_digest(text: &str) -> Result<ImageDigest, String> {
    let doc: serde_json::Value =
        serde_json::from_str(text).map_err(|e| format!("metadata is not JSON: {e}"))?;
    let raw = doc
        .get(METADATA_DIGEST_KEY)
        .and_then(|v| v.as_str())
        .ok_or_else(|| format!("metadata has no {METADATA_DIGEST_KEY}"))?;
    ImageDigest::parse(raw).map_err(|e| e.to_string())
}

fn step_failure(target: &BuildTarget, kind: BuildStep, detail: String) -> PipelineError {
    if kind == BuildStep::Image {
        return push_failure(target, detail);
    }
    PipelineError::Build {
        target: target.platform_tag.clone(),
        step: kind.name().to_string(),
        detail,
    }
}

fn push_failure(target: &BuildTarget, detail: String) -> PipelineError {
    PipelineError::Push {
        target: target.platform_tag.clone(),
        detail,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEX: &str = "4f53cda18c2baa0c0354bb5f9a3ecbe5ed12ab4d8e11ba873c2f11161202b945";

    #[test]
    fn metadata_digest_extracted() {
        let text = serde_json::json!({
            "buildx.build.ref": "builder/builder0/abc",
            "containerimage.digest": format!("sha256:{HEX}"),
            "image.name": "ghcr.io/xline-kv/xline",
        })
        .to_string();
        assert_eq!(parse_metadata_digest(&text).unwrap().hex(), HEX);
    }

    #[test]
    fn metadata_without_digest_rejected() {
        assert!(parse_metadata_digest("{}").unwrap_err().contains(METADATA_DIGEST_KEY));
        assert!(parse_metadata_digest("not json").is_err());
        assert!(parse_metadata_digest(r#"{"containerimage.digest":"sha256:abc"}"#).is_err());
    }

    #[test]
    fn image_step_failures_are_push_errors() {
        let target = BuildTarget::new("linux", "amd64", "x86_64-unknown-linux-gnu");
        assert!(matches!(
            step_failure(&target, BuildStep::Image, "denied".to_string()),
            PipelineError::Push { .. }
        ));
        match step_failure(&target, BuildStep::Compile, "exit code 101".to_string()) {
            PipelineError::Build { target, step, .. } => {
                assert_eq!(target, "linux/amd64");
                assert_eq!(step, "compile");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_binaries_fail_staging() {
        let dir = tempfile::tempdir().unwrap();
        let config = PipelineConfig {
            workspace: dir.path().to_path_buf(),
            ..PipelineConfig::default()
        };
        let builder = CommandTargetBuilder::new(Arc::new(config));
        let target = BuildTarget::new("linux", "amd64", "x86_64-unknown-linux-gnu");
        let err = builder.stage_binaries(&target).await.unwrap_err();
        assert!(matches!(err, PipelineError::Build { ref step, .. } if step == "stage"));
    }
}
