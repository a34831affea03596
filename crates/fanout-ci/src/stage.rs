//! Per-target build steps and the commands they run.

use std::path::{Path, PathBuf};

use fanout_core::{AppVersion, BuildTarget};
use serde::{Deserialize, Serialize};

use crate::config::PipelineConfig;

/// Label carrying the run's version on every platform image.
pub const VERSION_LABEL: &str = "org.opencontainers.image.version";

/// Key of the pushed digest in the buildx metadata file.
pub const METADATA_DIGEST_KEY: &str = "containerimage.digest";

/// Steps a build job runs, in order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BuildStep {
    /// Make the cross-build environment available.
    Prepare,

    /// `cross build --release` for the target triple.
    Compile,

    /// Copy binaries into the image context.
    Stage,

    /// `docker buildx build` pushed by digest.
    Image,
}

impl BuildStep {
    pub fn name(&self) -> &'static str {
        match self {
            BuildStep::Prepare => "prepare",
            BuildStep::Compile => "compile",
            BuildStep::Stage => "stage",
            BuildStep::Image => "image",
        }
    }
}

/// One external command with its environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepConfig {
    pub name: String,

    /// Command to execute (first element is executable).
    pub command: Vec<String>,

    #[serde(default)]
    pub env: Vec<(String, String)>,

    #[serde(default)]
    pub workdir: Option<PathBuf>,

    /// Timeout in seconds, 0 for none.
    pub timeout_secs: u64,
}

impl StepConfig {
    pub fn custom(name: impl Into<String>, command: Vec<String>, timeout_secs: u64) -> Self {
        Self {
            name: name.into(),
            command,
            env: Vec::new(),
            workdir: None,
            timeout_secs,
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(dir.into());
        self
    }

    /// Command line as typed in a shell, for logs.
    pub fn display_command(&self) -> String {
        self.command.join(" ")
    }
}

fn args<const N: usize>(items: [&str; N]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// Environment variable `cross` reads to pick a custom image for a triple.
pub fn cross_image_env(triple: &str) -> String {
    format!(
        "CROSS_TARGET_{}_IMAGE",
        triple.to_ascii_uppercase().replace(['-', '.'], "_")
    )
}

/// Per-triple cargo target directory, so concurrent jobs never share one.
pub fn triple_target_dir(config: &PipelineConfig, target: &BuildTarget) -> PathBuf {
    config.target_path().join(&target.compilation_triple)
}

/// Where cargo leaves release binaries for the target.
pub fn release_dir(config: &PipelineConfig, target: &BuildTarget) -> PathBuf {
    triple_target_dir(config, target)
        .join(&target.compilation_triple)
        .join("release")
}

/// Directory inside the image context holding this target's binaries.
pub fn staging_dir(config: &PipelineConfig, target: &BuildTarget) -> PathBuf {
    config
        .context_path()
        .join(&target.operating_system)
        .join(&target.cpu_architecture)
}

/// buildx metadata file for this target's image build.
pub fn metadata_file(config: &PipelineConfig, target: &BuildTarget) -> PathBuf {
    triple_target_dir(config, target).join("image-metadata.json")
}

/// Acquire the build environment: pull the custom image when one is set,
/// otherwise check that the cross driver runs.
pub fn prepare_step(config: &PipelineConfig, target: &BuildTarget) -> StepConfig {
    let command = match &target.build_environment {
        Some(image) => vec![config.docker_program.clone(), "pull".to_string(), image.clone()],
        None => vec![config.cross_program.clone(), "--version".to_string()],
    };
    StepConfig::custom(BuildStep::Prepare.name(), command, config.timeouts.prepare_secs)
        .in_dir(&config.workspace)
}

pub fn compile_step(config: &PipelineConfig, target: &BuildTarget) -> StepConfig {
    let mut command = vec![config.cross_program.clone()];
    command.extend(args(["build", "--release", "--target"]));
    command.push(target.compilation_triple.clone());
    command.push("--target-dir".to_string());
    command.push(path_arg(&triple_target_dir(config, target)));
    for bin in &config.binaries {
        command.push("--bin".to_string());
        command.push(bin.clone());
    }

    let mut step =
        StepConfig::custom(BuildStep::Compile.name(), command, config.timeouts.compile_secs)
            .in_dir(&config.workspace);
    if let Some(image) = &target.build_environment {
        step = step.with_env(cross_image_env(&target.compilation_triple), image.clone());
    }
    step
}

/// Build the platform image and push it by digest only. No tag is applied;
/// the manifest list is the only tagged artifact of a run.
pub fn image_step(
    config: &PipelineConfig,
    target: &BuildTarget,
    version: &AppVersion,
    metadata: &Path,
) -> StepConfig {
    let mut command = vec![config.docker_program.clone()];
    command.extend(args(["buildx", "build", "--platform"]));
    command.push(target.platform_tag.clone());
    command.push("--file".to_string());
    command.push(path_arg(&config.dockerfile_path()));
    command.push("--label".to_string());
    command.push(format!("{VERSION_LABEL}={version}"));
    command.push("--output".to_string());
    command.push(format!(
        "type=image,name={},push-by-digest=true,name-canonical=true,push=true",
        config.image
    ));
    command.push("--metadata-file".to_string());
    command.push(path_arg(metadata));
    command.push(path_arg(&config.context_path()));

    StepConfig::custom(BuildStep::Image.name(), command, config.timeouts.image_secs)
        .in_dir(&config.workspace)
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn amd64() -> BuildTarget {
        BuildTarget::new("linux", "amd64", "x86_64-unknown-linux-gnu")
    }

    #[test]
    fn test_step_names() {
        assert_eq!(BuildStep::Prepare.name(), "prepare");
        assert_eq!(BuildStep::Compile.name(), "compile");
        assert_eq!(BuildStep::Stage.name(), "stage");
        assert_eq!(BuildStep::Image.name(), "image");
    }

    #[test]
    fn test_compile_builds_both_binaries_for_triple() {
        let config = PipelineConfig::default();
        let step = compile_step(&config, &amd64());
        let line = step.display_command();
        assert_eq!(step.command[0], "cross");
        assert!(line.contains("build --release --target x86_64-unknown-linux-gnu"));
        assert!(line.contains("--bin xline --bin benchmark"));
        assert!(line.contains("target/fanout/x86_64-unknown-linux-gnu"));
        assert!(step.env.is_empty());
    }

    #[test]
    fn test_custom_build_environment() {
        let config = PipelineConfig::default();
        let target = amd64().with_build_environment("ghcr.io/acme/cross:x86_64");
        let compile = compile_step(&config, &target);
        assert_eq!(
            compile.env,
            vec![(
                "CROSS_TARGET_X86_64_UNKNOWN_LINUX_GNU_IMAGE".to_string(),
                "ghcr.io/acme/cross:x86_64".to_string()
            )]
        );
        let prepare = prepare_step(&config, &target);
        assert_eq!(prepare.command, vec!["docker", "pull", "ghcr.io/acme/cross:x86_64"]);
    }

    #[test]
    fn test_image_step_pushes_by_digest_without_tag() {
        let config = PipelineConfig::default();
        let target = amd64();
        let version = AppVersion::new("v0.7.0").unwrap();
        let step = image_step(&config, &target, &version, &metadata_file(&config, &target));

        assert!(step.command.contains(&"linux/amd64".to_string()));
        assert!(step
            .command
            .iter()
            .any(|a| a.contains("push-by-digest=true")
                && a.contains("name=ghcr.io/xline-kv/xline")));
        assert!(step
            .command
            .contains(&"org.opencontainers.image.version=v0.7.0".to_string()));
        assert!(!step.command.iter().any(|a| a == "-t" || a == "--tag"));
        assert!(step.command.contains(&"--metadata-file".to_string()));
    }

    #[test]
    fn test_paths_are_disjoint_per_target() {
        let config = PipelineConfig::default();
        let arm = BuildTarget::new("linux", "arm64", "aarch64-unknown-linux-gnu");
        assert_ne!(release_dir(&config, &amd64()), release_dir(&config, &arm));
        assert_ne!(staging_dir(&config, &amd64()), staging_dir(&config, &arm));
        assert!(staging_dir(&config, &arm).ends_with("linux/arm64"));
    }
}
