//! Manifest list publication, fired once per run after the barrier.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use fanout_core::{
    digest_reference, obs, tagged_reference, AppVersion, ImageDigest, MultiArchManifest, METRICS,
};
use fanout_state::{DigestCollection, RunId, StorageError};
use tracing::{info, warn};

use crate::config::PipelineConfig;
use crate::error::{CiResult, PipelineError};
use crate::gate::{CompleteDigestSet, MergeGate};
use crate::runner::StepRunner;
use crate::stage::StepConfig;

/// Publishes a manifest list for a complete digest set.
#[async_trait]
pub trait ManifestMerger: Send + Sync {
    async fn merge(
        &self,
        version: &AppVersion,
        digests: &CompleteDigestSet,
    ) -> CiResult<MultiArchManifest>;
}

/// Merger backed by `docker buildx imagetools create`.
pub struct ImagetoolsMerger {
    image: String,
    docker_program: String,
    timeout_secs: u64,
}

impl ImagetoolsMerger {
    pub fn new(
        image: impl Into<String>,
        docker_program: impl Into<String>,
        timeout_secs: u64,
    ) -> Self {
        Self {
            image: image.into(),
            docker_program: docker_program.into(),
            timeout_secs,
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(
            config.image.clone(),
            config.docker_program.clone(),
            config.timeouts.merge_secs,
        )
    }

    /// `imagetools create` step tagging `image:version` over every digest.
    pub fn create_step(&self, version: &AppVersion, digests: &CompleteDigestSet) -> StepConfig {
        let mut command = vec![
            self.docker_program.clone(),
            "buildx".to_string(),
            "imagetools".to_string(),
            "create".to_string(),
            "--tag".to_string(),
            tagged_reference(&self.image, version),
        ];
        command.extend(
            digests
                .digests()
                .iter()
                .map(|d| digest_reference(&self.image, d)),
        );
        StepConfig::custom("merge", command, self.timeout_secs)
    }

    fn inspect_step(&self, version: &AppVersion) -> StepConfig {
        StepConfig::custom(
            "inspect",
            vec![
                self.docker_program.clone(),
                "buildx".to_string(),
                "imagetools".to_string(),
                "inspect".to_string(),
                tagged_reference(&self.image, version),
                "--format".to_string(),
                "{{json .Manifest}}".to_string(),
            ],
            self.timeout_secs,
        )
    }

    /// Digest of the published list. Best effort: the list is already
    /// published, so lookup failures only lose the reported digest.
    async fn list_digest(&self, version: &AppVersion) -> Option<ImageDigest> {
        let result = match StepRunner::execute_step(&self.inspect_step(version)).await {
            Ok(r) if r.passed() => r,
            Ok(r) => {
                warn!(exit_code = r.exit_code, "manifest list inspect failed");
                return None;
            }
            Err(e) => {
                warn!(error = %e, "manifest list inspect failed");
                return None;
            }
        };
        let doc: serde_json::Value = serde_json::from_str(result.stdout.trim()).ok()?;
        ImageDigest::parse(doc.get("digest")?.as_str()?).ok()
    }
}

#[async_trait]
impl ManifestMerger for ImagetoolsMerger {
    async fn merge(
        &self,
        version: &AppVersion,
        digests: &CompleteDigestSet,
    ) -> CiResult<MultiArchManifest> {
        let step = self.create_step(version, digests);
        info!(command = %step.display_command(), "creating manifest list");

        let result = StepRunner::execute_step(&step)
            .await
            .map_err(|e| PipelineError::Merge(e.to_string()))?;
        if !result.passed() {
            return Err(PipelineError::Merge(format!(
                "imagetools create exited with code {}: {}",
                result.exit_code,
                result.stderr_tail()
            )));
        }

        Ok(MultiArchManifest {
            image: self.image.clone(),
            version: version.clone(),
            digests: digests.digests().to_vec(),
            list_digest: self.list_digest(version).await,
            published_at: Utc::now(),
        })
    }
}

/// Fires the merge at most once for a run.
pub struct MergeTrigger {
    collection: Arc<dyn DigestCollection>,
    merger: Arc<dyn ManifestMerger>,
    fired: AtomicBool,
}

impl MergeTrigger {
    pub fn new(collection: Arc<dyn DigestCollection>, merger: Arc<dyn ManifestMerger>) -> Self {
        Self {
            collection,
            merger,
            fired: AtomicBool::new(false),
        }
    }

    /// Read the run's markers, check them against the declared target count
    /// (and the jobs' reported digests, when known) and publish
    /// `image:version` over them.
    ///
    /// The merger is never invoked when the gate refuses. A second call
    /// fails without touching the collection.
    pub async fn fire(
        &self,
        run_id: &RunId,
        version: &AppVersion,
        expected: usize,
        reported: Option<&[ImageDigest]>,
    ) -> CiResult<MultiArchManifest> {
        if self.fired.swap(true, Ordering::SeqCst) {
            return Err(PipelineError::AlreadyFired {
                run_id: run_id.to_string(),
            });
        }

        let gated = match self.collection.require_markers(run_id).await {
            Ok(markers) => {
                MergeGate::admit(expected, reported, &markers).map_err(|e| (e, markers.len()))
            }
            Err(e @ StorageError::EmptyCollection { .. }) => Err((
                PipelineError::MergeIncomplete {
                    expected,
                    found: 0,
                    violations: vec![e.to_string()],
                },
                0,
            )),
            Err(e) => return Err(e.into()),
        };
        let digests = match gated {
            Ok(set) => set,
            Err((e, found)) => {
                METRICS.inc_merges_rejected();
                obs::emit_merge_rejected(expected, found);
                return Err(e);
            }
        };

        let manifest = self.merger.merge(version, &digests).await?;
        METRICS.inc_manifests_published();
        obs::emit_manifest_published(&manifest.reference(), manifest.platform_count());
        Ok(manifest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::RecordingMerger;
    use fanout_state::MemoryDigestCollection;

    fn digest(seed: &str) -> ImageDigest {
        ImageDigest::sha256_of(seed.as_bytes())
    }

    async fn collection_with(run: &RunId, seeds: &[&str]) -> Arc<MemoryDigestCollection> {
        let collection = Arc::new(MemoryDigestCollection::new());
        for seed in seeds {
            collection
                .put_marker(run, digest(seed).marker_name())
                .await
                .unwrap();
        }
        collection
    }

    #[test]
    fn create_step_tags_list_over_every_digest() {
        let merger = ImagetoolsMerger::new("ghcr.io/xline-kv/xline", "docker", 60);
        let markers = vec![
            digest("amd64").hex().to_string(),
            digest("arm64").hex().to_string(),
        ];
        let set = MergeGate::admit(2, None, &markers).unwrap();
        let step = merger.create_step(&AppVersion::latest(), &set);

        assert_eq!(
            &step.command[..6],
            &["docker", "buildx", "imagetools", "create", "--tag", "ghcr.io/xline-kv/xline:latest"]
        );
        assert_eq!(step.command.len(), 8);
        for m in &markers {
            assert!(step
                .command
                .contains(&format!("ghcr.io/xline-kv/xline@sha256:{m}")));
        }
    }

    #[tokio::test]
    async fn fire_publishes_complete_set() {
        let run = RunId::from("run-1");
        let collection = collection_with(&run, &["amd64", "arm64"]).await;
        let merger = Arc::new(RecordingMerger::new("ghcr.io/xline-kv/xline"));
        let trigger = MergeTrigger::new(collection, merger.clone());

        let version = AppVersion::new("v0.7.0").unwrap();
        let manifest = trigger.fire(&run, &version, 2, None).await.unwrap();

        assert_eq!(manifest.reference(), "ghcr.io/xline-kv/xline:v0.7.0");
        assert_eq!(manifest.platform_count(), 2);
        assert_eq!(merger.invocations(), 1);
        assert_eq!(merger.versions(), vec![version]);
    }

    #[tokio::test]
    async fn fire_refuses_incomplete_set_without_merging() {
        let run = RunId::from("run-1");
        let collection = collection_with(&run, &["amd64"]).await;
        let merger = Arc::new(RecordingMerger::new("ghcr.io/xline-kv/xline"));
        let trigger = MergeTrigger::new(collection, merger.clone());

        let err = trigger.fire(&run, &AppVersion::latest(), 2, None).await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::MergeIncomplete {
                expected: 2,
                found: 1,
                ..
            }
        ));
        assert_eq!(merger.invocations(), 0);
    }

    #[tokio::test]
    async fn fire_refuses_empty_collection() {
        let run = RunId::from("run-1");
        let merger = Arc::new(RecordingMerger::new("ghcr.io/xline-kv/xline"));
        let trigger = MergeTrigger::new(Arc::new(MemoryDigestCollection::new()), merger.clone());

        let err = trigger.fire(&run, &AppVersion::latest(), 2, None).await.unwrap_err();
        match err {
            PipelineError::MergeIncomplete {
                expected,
                found,
                violations,
            } => {
                assert_eq!((expected, found), (2, 0));
                assert!(violations[0].contains("no markers found for run run-1"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(merger.invocations(), 0);
    }

    #[tokio::test]
    async fn fire_refuses_marker_no_job_reported() {
        let run = RunId::from("run-1");
        let collection = collection_with(&run, &["arm64", "stale"]).await;
        let merger = Arc::new(RecordingMerger::new("ghcr.io/xline-kv/xline"));
        let trigger = MergeTrigger::new(collection, merger.clone());

        let reported = vec![digest("amd64"), digest("arm64")];
        let err = trigger
            .fire(&run, &AppVersion::latest(), 2, Some(reported.as_slice()))
            .await
            .unwrap_err();
        match err {
            PipelineError::MergeIncomplete { violations, .. } => {
                assert!(violations.iter().any(|v| v.contains("not reported")));
                assert!(violations.iter().any(|v| v.contains("has no marker")));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(merger.invocations(), 0);
    }

    #[tokio::test]
    async fn fire_is_once_only() {
        let run = RunId::from("run-1");
        let collection = collection_with(&run, &["amd64", "arm64"]).await;
        let merger = Arc::new(RecordingMerger::new("ghcr.io/xline-kv/xline"));
        let trigger = MergeTrigger::new(collection, merger.clone());

        trigger.fire(&run, &AppVersion::latest(), 2, None).await.unwrap();
        let err = trigger.fire(&run, &AppVersion::latest(), 2, None).await.unwrap_err();
        assert!(matches!(err, PipelineError::AlreadyFired { .. }));
        assert_eq!(merger.invocations(), 1);
    }

    #[tokio::test]
    async fn merger_failure_surfaces() {
        let run = RunId::from("run-1");
        let collection = collection_with(&run, &["amd64"]).await;
        let merger = Arc::new(RecordingMerger::failing("ghcr.io/xline-kv/xline", "unauthorized"));
        let trigger = MergeTrigger::new(collection, merger.clone());

        let err = trigger.fire(&run, &AppVersion::latest(), 1, None).await.unwrap_err();
        assert!(matches!(err, PipelineError::Merge(ref m) if m.contains("unauthorized")));
        assert_eq!(merger.invocations(), 1);
    }
}
