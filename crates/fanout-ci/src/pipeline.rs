//! Run orchestration: fan-out, completion barrier, merge.

use std::sync::Arc;
use std::time::{Duration, Instant};

use fanout_core::{obs, AppVersion, BuildTarget, ImageDigest, MultiArchManifest, METRICS};
use fanout_state::{DigestCollection, RunId, RunLedger, RunSummary};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{info, warn, Instrument};

use crate::builder::TargetBuilder;
use crate::collector::DigestCollector;
use crate::error::{CiResult, PipelineError};
use crate::merge::{ManifestMerger, MergeTrigger};
use crate::recorder::RunRecorder;
use crate::spec::RunSpec;

/// Requests cancellation of a running pipeline. Clones share one flag.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Abort every in-flight job of the run. Idempotent.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once [`CancelHandle::cancel`] has been called.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                futures::future::pending::<()>().await;
            }
        }
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Terminal state of one build job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Image pushed and marker recorded.
    Succeeded,
    Failed,
    /// Still running when the barrier timed out.
    TimedOut,
    /// Still running when the run was cancelled.
    Aborted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobOutcome {
    pub platform: String,
    pub triple: String,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<ImageDigest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl JobOutcome {
    fn unfinished(target: &BuildTarget, status: JobStatus, error: &str) -> Self {
        Self {
            platform: target.platform_tag.clone(),
            triple: target.compilation_triple.clone(),
            status,
            digest: None,
            error: Some(error.to_string()),
            duration_ms: 0,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == JobStatus::Succeeded
    }
}

/// Result of a complete pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineResult {
    pub run_id: String,

    pub version: AppVersion,

    /// Every job succeeded and the manifest list was published.
    pub success: bool,

    pub cancelled: bool,

    /// One outcome per declared target, in matrix order.
    pub jobs: Vec<JobOutcome>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub manifest: Option<MultiArchManifest>,

    /// Why nothing was published: merge refusal or failure, barrier
    /// timeout, cancellation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    pub duration_ms: u64,

    pub build_digest: String,
}

impl PipelineResult {
    pub fn passed_count(&self) -> usize {
        self.jobs.iter().filter(|j| j.succeeded()).count()
    }

    pub fn failed_count(&self) -> usize {
        self.jobs.iter().filter(|j| !j.succeeded()).count()
    }
}

/// Build one target and record its marker. A job is complete only when this
/// returns `Ok`.
pub async fn execute_job(
    builder: &dyn TargetBuilder,
    collector: &DigestCollector,
    run_id: &RunId,
    target: &BuildTarget,
    version: &AppVersion,
) -> CiResult<ImageDigest> {
    let digest = builder.build(target, version).await?;
    obs::emit_digest_pushed(&target.platform_tag, &digest.to_string());
    collector.record(run_id, &target.platform_tag, &digest).await?;
    Ok(digest)
}

struct Job {
    idx: usize,
    target: BuildTarget,
    run_id: RunId,
    version: Arc<AppVersion>,
    builder: Arc<dyn TargetBuilder>,
    collector: Arc<DigestCollector>,
    recorder: Arc<RunRecorder>,
}

impl Job {
    async fn run(self) -> (usize, JobOutcome) {
        let start = Instant::now();
        let platform = self.target.platform_tag.as_str();
        obs::emit_job_started(platform, &self.target.compilation_triple);
        self.recorder
            .record_or_warn(
                "job_started",
                json!({
                    "platform": platform,
                    "triple": &self.target.compilation_triple,
                    "version": &*self.version,
                }),
            )
            .await;

        let result = execute_job(
            self.builder.as_ref(),
            &self.collector,
            &self.run_id,
            &self.target,
            &self.version,
        )
        .await;
        let duration_ms = start.elapsed().as_millis() as u64;

        let outcome = match result {
            Ok(digest) => {
                METRICS.inc_jobs_succeeded();
                self.recorder
                    .record_or_warn(
                        "marker_recorded",
                        json!({
                            "platform": platform,
                            "digest": &digest,
                            "marker": digest.marker_name(),
                            "version": &*self.version,
                        }),
                    )
                    .await;
                JobOutcome {
                    platform: platform.to_string(),
                    triple: self.target.compilation_triple.clone(),
                    status: JobStatus::Succeeded,
                    digest: Some(digest),
                    error: None,
                    duration_ms,
                }
            }
            Err(e) => {
                METRICS.inc_jobs_failed();
                obs::emit_job_failed(platform, &e);
                self.recorder
                    .record_or_warn(
                        "job_failed",
                        json!({
                            "platform": platform,
                            "status": JobStatus::Failed,
                            "error": e.to_string(),
                            "version": &*self.version,
                        }),
                    )
                    .await;
                JobOutcome {
                    platform: platform.to_string(),
                    triple: self.target.compilation_triple.clone(),
                    status: JobStatus::Failed,
                    digest: None,
                    error: Some(e.to_string()),
                    duration_ms,
                }
            }
        };
        (self.idx, outcome)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BarrierExit {
    Complete,
    TimedOut,
    Cancelled,
}

impl BarrierExit {
    fn as_str(&self) -> &'static str {
        match self {
            BarrierExit::Complete => "complete",
            BarrierExit::TimedOut => "timed_out",
            BarrierExit::Cancelled => "cancelled",
        }
    }
}

/// Join every job, or stop early on timeout or cancellation.
async fn wait_for_jobs(
    jobs: &mut JoinSet<(usize, JobOutcome)>,
    slots: &mut [Option<JobOutcome>],
    timeout: Duration,
    cancel: &CancelHandle,
) -> BarrierExit {
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);
    let cancelled = cancel.cancelled();
    tokio::pin!(cancelled);

    loop {
        tokio::select! {
            joined = jobs.join_next() => match joined {
                None => return BarrierExit::Complete,
                Some(Ok((idx, outcome))) => slots[idx] = Some(outcome),
                Some(Err(e)) => warn!(error = %e, "build job ended abnormally"),
            },
            _ = &mut deadline => return BarrierExit::TimedOut,
            _ = &mut cancelled => return BarrierExit::Cancelled,
        }
    }
}

/// Multi-architecture build pipeline.
pub struct MultiArchPipeline {
    builder: Arc<dyn TargetBuilder>,
    collection: Arc<dyn DigestCollection>,
    merger: Arc<dyn ManifestMerger>,
    ledger: Arc<dyn RunLedger>,
}

impl MultiArchPipeline {
    pub fn new(
        builder: Arc<dyn TargetBuilder>,
        collection: Arc<dyn DigestCollection>,
        merger: Arc<dyn ManifestMerger>,
        ledger: Arc<dyn RunLedger>,
    ) -> Self {
        Self {
            builder,
            collection,
            merger,
            ledger,
        }
    }

    /// Execute one run and record it in the ledger.
    ///
    /// One task per target builds and records its marker. The merge fires
    /// once, after every task reached a terminal state, and only if the
    /// barrier completed without timeout or cancellation and every job
    /// succeeded. The merge gate then requires the run's markers to be
    /// exactly the digests the jobs reported. Job and merge
    /// failures are reported in the result; `Err` means the ledger itself
    /// failed.
    ///
    /// The run is finalized as Completed (every job succeeded and the
    /// manifest was published), Cancelled or Failed.
    pub async fn run(&self, spec: &RunSpec, cancel: &CancelHandle) -> CiResult<PipelineResult> {
        let span = obs::run_span(spec.run_id.as_str());
        self.run_inner(spec, cancel).instrument(span).await
    }

    async fn run_inner(&self, spec: &RunSpec, cancel: &CancelHandle) -> CiResult<PipelineResult> {
        let start = Instant::now();
        let run_id = spec.run_id.clone();
        let build_digest = spec.build_digest();
        let declared = spec.matrix.len();

        let recorder = Arc::new(
            RunRecorder::start(
                self.ledger.clone(),
                run_id.clone(),
                &build_digest,
                spec.metadata(),
            )
            .await?,
        );

        obs::emit_run_started(run_id.as_str(), spec.version.as_str(), declared);
        recorder
            .record(
                "run_started",
                json!({
                    "image": &spec.image,
                    "targets": spec.matrix.iter().map(|t| &t.platform_tag).collect::<Vec<_>>(),
                }),
            )
            .await?;
        recorder
            .record(
                "version_resolved",
                json!({ "trigger": spec.trigger, "version": &spec.version }),
            )
            .await?;

        let version = Arc::new(spec.version.clone());
        let collector = Arc::new(DigestCollector::new(self.collection.clone()));
        let mut slots: Vec<Option<JobOutcome>> = (0..declared).map(|_| None).collect();

        let barrier_start = Instant::now();
        let exit = if cancel.is_cancelled() {
            BarrierExit::Cancelled
        } else {
            let mut jobs = JoinSet::new();
            for (idx, target) in spec.matrix.iter().enumerate() {
                let job = Job {
                    idx,
                    target: target.clone(),
                    run_id: run_id.clone(),
                    version: version.clone(),
                    builder: self.builder.clone(),
                    collector: collector.clone(),
                    recorder: recorder.clone(),
                };
                let span = obs::job_span(&target.platform_tag, &target.compilation_triple);
                jobs.spawn(job.run().instrument(span));
            }

            let exit = wait_for_jobs(&mut jobs, &mut slots, spec.barrier_timeout, cancel).await;
            if exit != BarrierExit::Complete {
                jobs.abort_all();
                while let Some(joined) = jobs.join_next().await {
                    if let Ok((idx, outcome)) = joined {
                        slots[idx] = Some(outcome);
                    }
                }
            }
            exit
        };

        let (missing_status, missing_reason) = match exit {
            BarrierExit::Complete => (JobStatus::Failed, "job ended without reporting"),
            BarrierExit::TimedOut => (JobStatus::TimedOut, "barrier timeout"),
            BarrierExit::Cancelled => (JobStatus::Aborted, "run cancelled"),
        };
        let mut jobs = Vec::with_capacity(declared);
        for (slot, target) in slots.into_iter().zip(spec.matrix.iter()) {
            let outcome = match slot {
                Some(outcome) => outcome,
                None => {
                    METRICS.inc_jobs_failed();
                    obs::emit_job_failed(&target.platform_tag, &missing_reason);
                    recorder
                        .record(
                            "job_failed",
                            json!({
                                "platform": &target.platform_tag,
                                "status": missing_status,
                                "error": missing_reason,
                                "version": &*version,
                            }),
                        )
                        .await?;
                    JobOutcome::unfinished(target, missing_status, missing_reason)
                }
            };
            jobs.push(outcome);
        }

        let succeeded = jobs.iter().filter(|j| j.succeeded()).count();
        let waited_ms = barrier_start.elapsed().as_millis() as u64;
        obs::emit_barrier_reached(succeeded, declared - succeeded, waited_ms);
        recorder
            .record(
                "barrier_reached",
                json!({
                    "succeeded": succeeded,
                    "failed": declared - succeeded,
                    "waited_ms": waited_ms,
                    "outcome": exit.as_str(),
                }),
            )
            .await?;

        // A cancel that lands after the last job still prevents the merge.
        let exit = if exit == BarrierExit::Complete && cancel.is_cancelled() {
            BarrierExit::Cancelled
        } else {
            exit
        };

        let (manifest, error) = match exit {
            BarrierExit::TimedOut => {
                let pending = jobs
                    .iter()
                    .filter(|j| j.status == JobStatus::TimedOut)
                    .map(|j| j.platform.clone())
                    .collect();
                let err = PipelineError::BarrierTimeout {
                    secs: spec.barrier_timeout.as_secs(),
                    pending,
                };
                warn!(error = %err, "barrier timed out; nothing published");
                (None, Some(err.to_string()))
            }
            BarrierExit::Cancelled => {
                info!("run cancelled; nothing published");
                (None, Some(PipelineError::Cancelled.to_string()))
            }
            BarrierExit::Complete if succeeded < declared => {
                let violations: Vec<String> = jobs
                    .iter()
                    .filter(|j| !j.succeeded())
                    .map(|j| format!("job for {} did not succeed", j.platform))
                    .collect();
                METRICS.inc_merges_rejected();
                obs::emit_merge_rejected(declared, succeeded);
                recorder
                    .record(
                        "merge_rejected",
                        json!({
                            "expected": declared,
                            "found": succeeded,
                            "violations": &violations,
                        }),
                    )
                    .await?;
                let err = PipelineError::MergeIncomplete {
                    expected: declared,
                    found: succeeded,
                    violations,
                };
                (None, Some(err.to_string()))
            }
            BarrierExit::Complete => {
                let reported: Vec<ImageDigest> =
                    jobs.iter().filter_map(|j| j.digest.clone()).collect();
                let trigger = MergeTrigger::new(self.collection.clone(), self.merger.clone());
                match trigger
                    .fire(&run_id, &version, declared, Some(reported.as_slice()))
                    .await
                {
                    Ok(manifest) => {
                        recorder
                            .record(
                                "manifest_published",
                                json!({
                                    "reference": manifest.reference(),
                                    "digests": &manifest.digests,
                                    "list_digest": &manifest.list_digest,
                                    "version": &manifest.version,
                                }),
                            )
                            .await?;
                        (Some(manifest), None)
                    }
                    Err(PipelineError::MergeIncomplete {
                        expected,
                        found,
                        violations,
                    }) => {
                        recorder
                            .record(
                                "merge_rejected",
                                json!({
                                    "expected": expected,
                                    "found": found,
                                    "violations": &violations,
                                }),
                            )
                            .await?;
                        let err = PipelineError::MergeIncomplete {
                            expected,
                            found,
                            violations,
                        };
                        (None, Some(err.to_string()))
                    }
                    Err(e) => {
                        warn!(error = %e, "manifest merge failed");
                        recorder
                            .record("merge_failed", json!({ "error": e.to_string() }))
                            .await?;
                        (None, Some(e.to_string()))
                    }
                }
            }
        };

        let cancelled = exit == BarrierExit::Cancelled;
        let success = !cancelled && succeeded == declared && manifest.is_some();
        let duration_ms = start.elapsed().as_millis() as u64;
        let summary = RunSummary {
            total_events: recorder.event_count().await,
            jobs_succeeded: succeeded as u64,
            jobs_failed: (declared - succeeded) as u64,
            manifest: manifest.as_ref().map(|m| m.reference()),
            duration_ms,
            success,
        };

        if success {
            recorder.finish_ok(summary).await?;
        } else if cancelled {
            recorder.finish_cancelled(summary).await?;
        } else {
            recorder.finish_err(summary).await?;
        }
        METRICS.flush();
        obs::emit_run_finished(run_id.as_str(), duration_ms, success);

        Ok(PipelineResult {
            run_id: run_id.to_string(),
            version: spec.version.clone(),
            success,
            cancelled,
            jobs,
            manifest,
            error,
            duration_ms,
            build_digest,
        })
    }
}
