//! Fanout - multi-architecture image build and publish
//!
//! The `fanout` command builds one container image per build target,
//! pushes each by digest, and publishes a single manifest list once every
//! target has reported.
//!
//! ## Commands
//!
//! - `run`: the whole pipeline in one process
//! - `resolve-version`: print the version a run would publish under
//! - `build`: build and record one target of an existing run
//! - `merge`: gate and publish the manifest list of an existing run
//! - `targets`: show the build matrix

mod report;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fanout_ci::{
    execute_job, CancelHandle, CommandTargetBuilder, DigestCollector, ImagetoolsMerger,
    MergeGate, MergeTrigger, MultiArchPipeline, PipelineConfig, RunSpec,
};
use fanout_core::{
    capture_head_sha, resolve_app_version, AppVersion, BuildTarget, GitDescriber, ImageDigest,
    TriggerEvent,
};
use fanout_state::{
    DigestCollection, FsDigestCollection, MemoryRunLedger, RunId, RunLedger,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn, Instrument, Level};

use crate::report::{append_output, write_json, RunArtifact};

/// Config file picked up from the working directory when `--config` is absent.
const DEFAULT_CONFIG_FILE: &str = "fanout.toml";

#[derive(Parser)]
#[command(name = "fanout")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Multi-architecture container image build and publish", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Pipeline config file (TOML)
    #[arg(long, global = true, env = "FANOUT_CONFIG")]
    config: Option<PathBuf>,

    /// Image repository, overriding the config file
    #[arg(long, global = true, env = "FANOUT_IMAGE")]
    image: Option<String>,

    /// Directory for digest markers and run reports, overriding the config file
    #[arg(long, global = true, env = "FANOUT_ARTIFACTS_DIR")]
    artifacts_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build every target, then publish the manifest list
    Run {
        /// What triggered the run: push or workflow_dispatch
        #[arg(long, env = "FANOUT_EVENT", default_value = "workflow_dispatch")]
        event: TriggerEvent,

        /// Write the run result as JSON to this file
        #[arg(long)]
        report: Option<PathBuf>,
    },

    /// Print the version a run would publish under
    ResolveVersion {
        #[arg(long, env = "FANOUT_EVENT", default_value = "workflow_dispatch")]
        event: TriggerEvent,

        /// Also append `app_version=<version>` to this file
        #[arg(long, env = "GITHUB_OUTPUT")]
        output_file: Option<PathBuf>,
    },

    /// Build one target and record its digest marker
    Build {
        /// Run the marker belongs to
        #[arg(long)]
        run_id: String,

        /// Platform tag of the target, e.g. linux/arm64
        #[arg(long)]
        platform: String,

        /// Version from `resolve-version`
        #[arg(long = "app-version")]
        app_version: AppVersion,
    },

    /// Check the run's markers and publish the manifest list
    Merge {
        #[arg(long)]
        run_id: String,

        /// Version from `resolve-version`
        #[arg(long = "app-version")]
        app_version: AppVersion,

        /// Digest a build job reported (repeatable); when given, the run's
        /// markers must be exactly these digests
        #[arg(long = "digest", value_name = "DIGEST")]
        digests: Vec<ImageDigest>,

        /// Only evaluate the gate; publish nothing
        #[arg(long)]
        dry_run: bool,
    },

    /// Show the build matrix
    Targets,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    fanout_core::init_tracing(cli.json, level);

    let config = load_config(
        cli.config.as_deref(),
        cli.image.as_deref(),
        cli.artifacts_dir.as_deref(),
    )?;

    match cli.command {
        Commands::Run { event, report } => cmd_run(config, event, report.as_deref()).await,
        Commands::ResolveVersion { event, output_file } => {
            cmd_resolve_version(&config, event, output_file.as_deref())
        }
        Commands::Build {
            run_id,
            platform,
            app_version,
        } => cmd_build(config, &run_id, &platform, &app_version).await,
        Commands::Merge {
            run_id,
            app_version,
            digests,
            dry_run,
        } => cmd_merge(&config, &run_id, &app_version, &digests, dry_run).await,
        Commands::Targets => cmd_targets(&config),
    }
}

/// Config file (explicit, or `fanout.toml` when present, or defaults) with
/// command-line overrides applied.
fn load_config(
    path: Option<&Path>,
    image: Option<&str>,
    artifacts_dir: Option<&Path>,
) -> Result<PipelineConfig> {
    let mut config = match path {
        Some(path) => PipelineConfig::load(path)
            .with_context(|| format!("Failed to load config {:?}", path))?,
        None if Path::new(DEFAULT_CONFIG_FILE).is_file() => {
            PipelineConfig::load(Path::new(DEFAULT_CONFIG_FILE))
                .context("Failed to load fanout.toml")?
        }
        None => PipelineConfig::default(),
    };

    if let Some(image) = image {
        config.image = image.to_string();
    }
    if let Some(dir) = artifacts_dir {
        config.artifacts_dir = dir.to_path_buf();
    }
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn resolve_version(config: &PipelineConfig, event: TriggerEvent) -> AppVersion {
    let version = resolve_app_version(event, &GitDescriber::new(&config.workspace));
    fanout_core::obs::emit_version_resolved(&event.to_string(), version.as_str());
    version
}

fn parse_run_id(raw: &str) -> Result<RunId> {
    let run_id = RunId::from(raw);
    if !run_id.is_path_safe() {
        anyhow::bail!("Invalid run id: {:?}", raw);
    }
    Ok(run_id)
}

fn find_target<'a>(config: &'a PipelineConfig, platform: &str) -> Result<&'a BuildTarget> {
    config
        .targets
        .iter()
        .find(|t| t.platform_tag == platform || t.compilation_triple == platform)
        .with_context(|| {
            let known: Vec<&str> = config.targets.iter().map(|t| t.platform_tag.as_str()).collect();
            format!("No target {} in the build matrix (have: {})", platform, known.join(", "))
        })
}

async fn open_collection(config: &PipelineConfig) -> Result<Arc<FsDigestCollection>> {
    let root = config.artifacts_path();
    let collection = FsDigestCollection::new(&root)
        .await
        .with_context(|| format!("Failed to open digest collection at {:?}", root))?;
    Ok(Arc::new(collection))
}

async fn cmd_run(config: PipelineConfig, event: TriggerEvent, report: Option<&Path>) -> Result<()> {
    let version = resolve_version(&config, event);
    let mut spec = RunSpec::from_config(&config, event, version);
    match capture_head_sha(&config.workspace) {
        Ok(sha) => spec = spec.with_git_sha(sha),
        Err(e) => warn!(error = %e, "Could not capture git SHA"),
    }

    println!("Building {} for {} target(s)", config.image, spec.matrix.len());
    println!("Version: {}", spec.version);
    println!("Run ID: {}", spec.run_id);
    println!();

    let config = Arc::new(config);
    let collection = open_collection(&config).await?;
    let ledger = Arc::new(MemoryRunLedger::new());
    let pipeline = MultiArchPipeline::new(
        Arc::new(CommandTargetBuilder::new(config.clone())),
        collection,
        Arc::new(ImagetoolsMerger::from_config(&config)),
        ledger.clone(),
    );

    let cancel = CancelHandle::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; cancelling in-flight jobs");
            on_interrupt.cancel();
        }
    });

    let result = pipeline
        .run(&spec, &cancel)
        .await
        .context("Pipeline failed to run")?;

    let artifact = RunArtifact {
        run: ledger.get_run(&spec.run_id).await?,
        events: ledger.get_events(&spec.run_id).await?,
    };
    let run_file = config
        .artifacts_path()
        .join(spec.run_id.as_str())
        .join("run.json");
    write_json(&run_file, &artifact)?;
    if let Some(path) = report {
        write_json(path, &result)?;
    }

    println!("Status: {}", if result.success { "✓ PASSED" } else { "✗ FAILED" });
    println!("Duration: {}ms", result.duration_ms);
    println!();
    for job in &result.jobs {
        let status = if job.succeeded() { "✓" } else { "✗" };
        match (&job.digest, &job.error) {
            (Some(digest), _) => println!(
                "  {} {} ({}ms) {}",
                status, job.platform, job.duration_ms, digest
            ),
            (None, Some(error)) => println!(
                "  {} {} ({}ms) {}",
                status, job.platform, job.duration_ms, error
            ),
            (None, None) => println!("  {} {} ({}ms)", status, job.platform, job.duration_ms),
        }
    }
    println!();
    println!(
        "Summary: {}/{} targets built",
        result.passed_count(),
        result.jobs.len()
    );

    if let Some(manifest) = &result.manifest {
        println!("Published: {}", manifest.reference());
        if let Some(list) = &manifest.list_digest {
            println!("Manifest list: {}", list);
        }
    }
    if let Some(error) = &result.error {
        println!("Not published: {}", error);
    }

    if result.success {
        println!("\n✓ All platforms published!");
        Ok(())
    } else if result.cancelled {
        anyhow::bail!("Run cancelled")
    } else {
        anyhow::bail!("Run failed")
    }
}

fn cmd_resolve_version(
    config: &PipelineConfig,
    event: TriggerEvent,
    output_file: Option<&Path>,
) -> Result<()> {
    let version = resolve_version(config, event);
    if let Some(path) = output_file {
        append_output(path, "app_version", version.as_str())?;
    }
    println!("{}", version);
    Ok(())
}

async fn cmd_build(
    config: PipelineConfig,
    run_id: &str,
    platform: &str,
    version: &AppVersion,
) -> Result<()> {
    let run_id = parse_run_id(run_id)?;
    let target = find_target(&config, platform)?.clone();
    let collection = open_collection(&config).await?;
    let collector = DigestCollector::new(collection);
    let builder = CommandTargetBuilder::new(Arc::new(config));

    info!(run_id = %run_id, platform = %target.platform_tag, version = %version, "Building target");
    let span = fanout_core::job_span(&target.platform_tag, &target.compilation_triple);
    let digest = execute_job(&builder, &collector, &run_id, &target, version)
        .instrument(span)
        .await
        .with_context(|| format!("Build of {} failed", target.platform_tag))?;

    println!("✓ {} {}", target.platform_tag, digest);
    println!("Marker: {}", digest.marker_name());
    Ok(())
}

async fn cmd_merge(
    config: &PipelineConfig,
    run_id: &str,
    version: &AppVersion,
    digests: &[ImageDigest],
    dry_run: bool,
) -> Result<()> {
    let run_id = parse_run_id(run_id)?;
    let collection = open_collection(config).await?;
    let declared = config.targets.len();
    let reported = (!digests.is_empty()).then_some(digests);

    let markers = collection.list_markers(&run_id).await?;
    let verdict = MergeGate::evaluate(declared, reported, &markers);
    println!("Run ID: {}", run_id);
    println!("Digests: {}/{}", verdict.found, verdict.expected);
    println!("Gate: {}", if verdict.passed { "✓ PASSED" } else { "✗ FAILED" });
    if !verdict.violations.is_empty() {
        println!("Violations:");
        for violation in &verdict.violations {
            println!("  - {}", violation);
        }
    }

    if !verdict.passed {
        anyhow::bail!("Merge refused: {}", verdict.message);
    }
    if dry_run {
        println!("\nDry run; nothing published");
        return Ok(());
    }

    let trigger = MergeTrigger::new(collection, Arc::new(ImagetoolsMerger::from_config(config)));
    let manifest = trigger
        .fire(&run_id, version, declared, reported)
        .await
        .context("Manifest merge failed")?;

    println!("\n✓ Published {} ({} platforms)", manifest.reference(), manifest.platform_count());
    if let Some(list) = &manifest.list_digest {
        println!("Manifest list: {}", list);
    }
    Ok(())
}

fn cmd_targets(config: &PipelineConfig) -> Result<()> {
    println!("Image: {}", config.image);
    println!("Binaries: {}", config.binaries.join(", "));
    println!();
    for target in config.targets.iter() {
        match &target.build_environment {
            Some(env) => println!(
                "  {:<14} {:<32} {}",
                target.platform_tag, target.compilation_triple, env
            ),
            None => println!("  {:<14} {}", target.platform_tag, target.compilation_triple),
        }
    }
    println!();
    println!("Matrix fingerprint: {}", config.targets.fingerprint());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run_with_event() {
        let cli = Cli::try_parse_from(["fanout", "--json", "run", "--event", "push"]).unwrap();
        assert!(cli.json);
        match cli.command {
            Commands::Run { event, report } => {
                assert_eq!(event, TriggerEvent::Push);
                assert!(report.is_none());
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_parse_build_rejects_bad_version() {
        let ok = Cli::try_parse_from([
            "fanout",
            "build",
            "--run-id",
            "r1",
            "--platform",
            "linux/arm64",
            "--app-version",
            "v1.2.3",
        ]);
        assert!(ok.is_ok());

        let bad = Cli::try_parse_from([
            "fanout",
            "build",
            "--run-id",
            "r1",
            "--platform",
            "linux/arm64",
            "--app-version",
            "release/1.0",
        ]);
        assert!(bad.is_err());
    }

    #[test]
    fn test_unknown_event_rejected() {
        assert!(Cli::try_parse_from(["fanout", "run", "--event", "schedule"]).is_err());
    }

    #[test]
    fn test_load_config_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fanout.toml");
        std::fs::write(&path, "binaries = [\"server\"]\n").unwrap();

        let config = load_config(
            Some(&path),
            Some("registry.example.com/server"),
            Some(Path::new("/tmp/fanout-artifacts")),
        )
        .unwrap();
        assert_eq!(config.binaries, vec!["server"]);
        assert_eq!(config.image, "registry.example.com/server");
        assert_eq!(config.artifacts_path(), PathBuf::from("/tmp/fanout-artifacts"));
    }

    #[test]
    fn test_load_config_rejects_bad_override() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fanout.toml");
        std::fs::write(&path, "").unwrap();
        assert!(load_config(Some(&path), Some("ghcr.io/a/b:v1"), None).is_err());
    }

    #[test]
    fn test_find_target_by_platform_or_triple() {
        let config = PipelineConfig::default();
        assert_eq!(
            find_target(&config, "linux/arm64").unwrap().compilation_triple,
            "aarch64-unknown-linux-gnu"
        );
        assert_eq!(
            find_target(&config, "x86_64-unknown-linux-gnu").unwrap().platform_tag,
            "linux/amd64"
        );
        let err = find_target(&config, "linux/riscv64").unwrap_err();
        assert!(err.to_string().contains("linux/amd64, linux/arm64"));
    }

    #[test]
    fn test_run_id_must_be_path_safe() {
        assert!(parse_run_id("0b6f9d1e").is_ok());
        assert!(parse_run_id("../x").is_err());
    }

    #[tokio::test]
    async fn test_merge_refuses_incomplete_collection() {
        let dir = tempfile::tempdir().unwrap();
        let config = PipelineConfig {
            artifacts_dir: dir.path().to_path_buf(),
            ..PipelineConfig::default()
        };
        let run_id = RunId::from("run-1");
        let collection = open_collection(&config).await.unwrap();
        let digest = fanout_core::ImageDigest::sha256_of(b"arm64");
        collection.put_marker(&run_id, digest.marker_name()).await.unwrap();

        let err = cmd_merge(&config, "run-1", &AppVersion::latest(), &[], false)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Merge refused"));
    }

    #[tokio::test]
    async fn test_merge_refuses_markers_jobs_did_not_report() {
        let dir = tempfile::tempdir().unwrap();
        let config = PipelineConfig {
            artifacts_dir: dir.path().to_path_buf(),
            ..PipelineConfig::default()
        };
        let run_id = RunId::from("run-1");
        let collection = open_collection(&config).await.unwrap();
        let arm64 = ImageDigest::sha256_of(b"arm64");
        let stale = ImageDigest::sha256_of(b"stale");
        for digest in [&arm64, &stale] {
            collection.put_marker(&run_id, digest.marker_name()).await.unwrap();
        }

        // Two markers for two targets: the count alone would pass.
        cmd_merge(&config, "run-1", &AppVersion::latest(), &[], true)
            .await
            .unwrap();

        let amd64 = ImageDigest::sha256_of(b"amd64");
        let reported = [amd64, arm64];
        let err = cmd_merge(&config, "run-1", &AppVersion::latest(), &reported, true)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Merge refused"));
    }

    #[test]
    fn test_parse_merge_digests() {
        let hex = "a".repeat(64);
        let digest = format!("sha256:{hex}");
        let cli = Cli::try_parse_from([
            "fanout",
            "merge",
            "--run-id",
            "r1",
            "--app-version",
            "latest",
            "--digest",
            digest.as_str(),
        ])
        .unwrap();
        match cli.command {
            Commands::Merge { digests, .. } => assert_eq!(digests[0].hex(), hex),
            _ => panic!("expected merge"),
        }
        let bad = Cli::try_parse_from([
            "fanout",
            "merge",
            "--run-id",
            "r1",
            "--app-version",
            "latest",
            "--digest",
            "abc",
        ]);
        assert!(bad.is_err());
    }
}
