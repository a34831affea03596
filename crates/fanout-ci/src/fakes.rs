//! In-process builder and merger for exercising the pipeline without
//! cross, docker or a registry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use fanout_core::{AppVersion, BuildTarget, ImageDigest, MultiArchManifest};

use crate::builder::TargetBuilder;
use crate::error::{CiResult, PipelineError};
use crate::gate::CompleteDigestSet;
use crate::merge::ManifestMerger;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Debug, Clone)]
enum Script {
    Succeed { delay: Duration },
    Fail { delay: Duration, detail: String },
    Hang,
}

/// Builder whose outcome per compilation triple is scripted up front.
/// Unscripted triples succeed immediately.
#[derive(Default)]
pub struct ScriptedBuilder {
    scripts: HashMap<String, Script>,
    calls: Mutex<Vec<(String, AppVersion)>>,
    finished: AtomicUsize,
}

impl ScriptedBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn succeed_after(mut self, triple: &str, delay: Duration) -> Self {
        self.scripts
            .insert(triple.to_string(), Script::Succeed { delay });
        self
    }

    pub fn fail(self, triple: &str, detail: &str) -> Self {
        self.fail_after(triple, Duration::ZERO, detail)
    }

    pub fn fail_after(mut self, triple: &str, delay: Duration, detail: &str) -> Self {
        self.scripts.insert(
            triple.to_string(),
            Script::Fail {
                delay,
                detail: detail.to_string(),
            },
        );
        self
    }

    /// Never completes; only an abort ends the job.
    pub fn hang(mut self, triple: &str) -> Self {
        self.scripts.insert(triple.to_string(), Script::Hang);
        self
    }

    /// Digest a successful build of `triple` reports.
    pub fn digest_for(triple: &str) -> ImageDigest {
        ImageDigest::sha256_of(triple.as_bytes())
    }

    /// (triple, version) of every build started.
    pub fn calls(&self) -> Vec<(String, AppVersion)> {
        lock(&self.calls).clone()
    }

    /// Builds that ran to completion, successfully or not.
    pub fn finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TargetBuilder for ScriptedBuilder {
    async fn build(&self, target: &BuildTarget, version: &AppVersion) -> CiResult<ImageDigest> {
        let triple = target.compilation_triple.as_str();
        lock(&self.calls).push((triple.to_string(), version.clone()));

        let script = self
            .scripts
            .get(triple)
            .cloned()
            .unwrap_or(Script::Succeed {
                delay: Duration::ZERO,
            });
        let result = match script {
            Script::Succeed { delay } => {
                tokio::time::sleep(delay).await;
                Ok(Self::digest_for(triple))
            }
            Script::Fail { delay, detail } => {
                tokio::time::sleep(delay).await;
                Err(PipelineError::Build {
                    target: target.platform_tag.clone(),
                    step: "compile".to_string(),
                    detail,
                })
            }
            Script::Hang => futures::future::pending::<CiResult<ImageDigest>>().await,
        };
        self.finished.fetch_add(1, Ordering::SeqCst);
        result
    }
}

/// Merger that records what it was asked to publish.
pub struct RecordingMerger {
    image: String,
    failure: Option<String>,
    published: Mutex<Vec<(AppVersion, Vec<ImageDigest>)>>,
}

impl RecordingMerger {
    pub fn new(image: &str) -> Self {
        Self {
            image: image.to_string(),
            failure: None,
            published: Mutex::new(Vec::new()),
        }
    }

    /// Merger that rejects every publish with `detail`.
    pub fn failing(image: &str, detail: &str) -> Self {
        Self {
            failure: Some(detail.to_string()),
            ..Self::new(image)
        }
    }

    pub fn invocations(&self) -> usize {
        lock(&self.published).len()
    }

    pub fn versions(&self) -> Vec<AppVersion> {
        lock(&self.published).iter().map(|(v, _)| v.clone()).collect()
    }

    /// Digests passed to the most recent invocation.
    pub fn last_digests(&self) -> Option<Vec<ImageDigest>> {
        lock(&self.published).last().map(|(_, d)| d.clone())
    }
}

#[async_trait]
impl ManifestMerger for RecordingMerger {
    async fn merge(
        &self,
        version: &AppVersion,
        digests: &CompleteDigestSet,
    ) -> CiResult<MultiArchManifest> {
        lock(&self.published).push((version.clone(), digests.digests().to_vec()));
        if let Some(detail) = &self.failure {
            return Err(PipelineError::Merge(detail.clone()));
        }
        Ok(MultiArchManifest {
            image: self.image.clone(),
            version: version.clone(),
            digests: digests.digests().to_vec(),
            list_digest: None,
            published_at: Utc::now(),
        })
    }
}
