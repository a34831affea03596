//! Run ledger adapter shared by the coordinator and its jobs.

use std::sync::Arc;

use chrono::Utc;
use fanout_state::{RunEvent, RunId, RunLedger, RunMetadata, RunSummary, StorageResult};
use tokio::sync::Mutex;
use tracing::warn;

/// Records run events with gap-free, strictly increasing sequence numbers.
///
/// Usage:
/// 1. [`RunRecorder::start`] creates the run.
/// 2. [`RunRecorder::record`] from any task; sequence assignment and append
///    happen under one lock, so concurrent jobs never append out of order.
/// 3. [`RunRecorder::finish_ok`], [`RunRecorder::finish_err`] or
///    [`RunRecorder::finish_cancelled`] finalize it.
pub struct RunRecorder {
    ledger: Arc<dyn RunLedger>,
    run_id: RunId,
    next_seq: Mutex<u64>,
}

impl RunRecorder {
    pub async fn start(
        ledger: Arc<dyn RunLedger>,
        run_id: RunId,
        matrix_digest: &str,
        metadata: RunMetadata,
    ) -> StorageResult<Self> {
        ledger.create_run(&run_id, matrix_digest, metadata).await?;
        Ok(Self {
            ledger,
            run_id,
            next_seq: Mutex::new(1),
        })
    }

    pub async fn record(&self, kind: &str, payload: serde_json::Value) -> StorageResult<()> {
        let mut next = self.next_seq.lock().await;
        let event = RunEvent {
            seq: *next,
            kind: kind.to_string(),
            payload,
            timestamp: Utc::now(),
        };
        self.ledger.append_event(&self.run_id, event).await?;
        *next += 1;
        Ok(())
    }

    /// Record from inside a job, where a ledger failure must not fail the build.
    pub async fn record_or_warn(&self, kind: &str, payload: serde_json::Value) {
        if let Err(e) = self.record(kind, payload).await {
            warn!(run_id = %self.run_id, kind = kind, error = %e, "failed to record run event");
        }
    }

    /// Number of events appended so far.
    pub async fn event_count(&self) -> u64 {
        *self.next_seq.lock().await - 1
    }

    pub async fn finish_ok(&self, summary: RunSummary) -> StorageResult<()> {
        self.ledger.complete_run(&self.run_id, summary).await
    }

    pub async fn finish_err(&self, summary: RunSummary) -> StorageResult<()> {
        self.ledger.fail_run(&self.run_id, summary).await
    }

    pub async fn finish_cancelled(&self, summary: RunSummary) -> StorageResult<()> {
        self.ledger.cancel_run(&self.run_id, summary).await
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fanout_state::{MemoryRunLedger, RunStatus};
    use serde_json::json;

    fn metadata() -> RunMetadata {
        RunMetadata {
            git_sha: None,
            image: "ghcr.io/xline-kv/xline".to_string(),
            tags: json!({}),
        }
    }

    #[tokio::test]
    async fn concurrent_records_stay_ordered() {
        let ledger = Arc::new(MemoryRunLedger::new());
        let recorder = Arc::new(
            RunRecorder::start(ledger.clone(), RunId::from("run-1"), "m", metadata())
                .await
                .unwrap(),
        );

        let mut handles = Vec::new();
        for i in 0..16 {
            let recorder = recorder.clone();
            handles.push(tokio::spawn(async move {
                recorder.record("job_started", json!({ "job": i })).await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }

        let events = ledger.get_events(&RunId::from("run-1")).await.unwrap();
        let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, (1..=16).collect::<Vec<_>>());
        assert_eq!(recorder.event_count().await, 16);
    }

    #[tokio::test]
    async fn finish_sets_terminal_status() {
        let ledger = Arc::new(MemoryRunLedger::new());
        let recorder = RunRecorder::start(ledger.clone(), RunId::from("run-2"), "m", metadata())
            .await
            .unwrap();
        recorder.record("run_started", json!({})).await.unwrap();
        recorder
            .finish_cancelled(RunSummary::default())
            .await
            .unwrap();

        let run = ledger.get_run(recorder.run_id()).await.unwrap();
        assert_eq!(run.status, RunStatus::Cancelled);
        assert!(recorder.record("late", json!({})).await.is_err());
    }
}
