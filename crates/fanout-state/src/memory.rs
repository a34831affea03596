//! In-memory storage backends
//!
//! `MemoryDigestCollection` and `MemoryRunLedger` satisfy the trait contracts
//! without touching the filesystem. Used by tests and by single-process runs
//! where the ledger only needs to outlive the run.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;

use crate::error::StorageError;
use crate::storage_traits::*;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ---------------------------------------------------------------------------
// MemoryDigestCollection
// ---------------------------------------------------------------------------

/// In-memory marker collection backed by a `HashMap<run, BTreeSet<name>>`.
#[derive(Debug, Default)]
pub struct MemoryDigestCollection {
    runs: Mutex<HashMap<RunId, BTreeSet<String>>>,
}

impl MemoryDigestCollection {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DigestCollection for MemoryDigestCollection {
    async fn put_marker(&self, run_id: &RunId, name: &str) -> StorageResult<()> {
        validate_marker_name(name)?;
        let mut runs = lock(&self.runs);
        let markers = runs.entry(run_id.clone()).or_default();
        if !markers.insert(name.to_string()) {
            return Err(StorageError::MarkerExists {
                run_id: run_id.0.clone(),
                name: name.to_string(),
            });
        }
        Ok(())
    }

    async fn list_markers(&self, run_id: &RunId) -> StorageResult<Vec<String>> {
        let runs = lock(&self.runs);
        Ok(runs
            .get(run_id)
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default())
    }
}

// ---------------------------------------------------------------------------
// MemoryRunLedger
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct RunState {
    record: RunRecord,
    events: Vec<RunEvent>,
}

impl RunState {
    fn ensure_running(&self) -> StorageResult<()> {
        if self.record.status != RunStatus::Running {
            return Err(StorageError::InvalidRunState {
                run_id: self.record.run_id.0.clone(),
                status: format!("{:?}", self.record.status),
                expected: "Running".to_string(),
            });
        }
        Ok(())
    }

    fn finish(&mut self, status: RunStatus, summary: RunSummary) -> StorageResult<()> {
        self.ensure_running()?;
        self.record.status = status;
        self.record.summary = Some(summary);
        self.record.completed_at = Some(Utc::now());
        Ok(())
    }
}

/// In-memory run ledger backed by a `HashMap<RunId, RunState>`.
#[derive(Debug, Default)]
pub struct MemoryRunLedger {
    runs: Mutex<HashMap<RunId, RunState>>,
}

impl MemoryRunLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_run<T>(
        &self,
        run_id: &RunId,
        f: impl FnOnce(&mut RunState) -> StorageResult<T>,
    ) -> StorageResult<T> {
        let mut runs = lock(&self.runs);
        let state = runs
            .get_mut(run_id)
            .ok_or_else(|| StorageError::RunNotFound {
                run_id: run_id.0.clone(),
            })?;
        f(state)
    }
}

#[async_trait]
impl RunLedger for MemoryRunLedger {
    async fn create_run(
        &self,
        run_id: &RunId,
        matrix_digest: &str,
        metadata: RunMetadata,
    ) -> StorageResult<()> {
        let mut runs = lock(&self.runs);
        if let Some(existing) = runs.get(run_id) {
            return Err(StorageError::InvalidRunState {
                run_id: run_id.0.clone(),
                status: format!("{:?}", existing.record.status),
                expected: "absent".to_string(),
            });
        }
        let record = RunRecord {
            run_id: run_id.clone(),
            matrix_digest: matrix_digest.to_string(),
            metadata,
            status: RunStatus::Running,
            summary: None,
            created_at: Utc::now(),
            completed_at: None,
        };
        runs.insert(
            run_id.clone(),
            RunState {
                record,
                events: Vec::new(),
            },
        );
        Ok(())
    }

    async fn append_event(&self, run_id: &RunId, event: RunEvent) -> StorageResult<()> {
        self.with_run(run_id, |state| {
            state.ensure_running()?;
            if let Some(last) = state.events.last() {
                if event.seq <= last.seq {
                    return Err(StorageError::OutOfOrderEvent {
                        run_id: run_id.0.clone(),
                        seq: event.seq,
                        last: last.seq,
                    });
                }
            }
            state.events.push(event);
            Ok(())
        })
    }

    async fn complete_run(&self, run_id: &RunId, summary: RunSummary) -> StorageResult<()> {
        self.with_run(run_id, |state| state.finish(RunStatus::Completed, summary))
    }

    async fn fail_run(&self, run_id: &RunId, summary: RunSummary) -> StorageResult<()> {
        self.with_run(run_id, |state| state.finish(RunStatus::Failed, summary))
    }

    async fn cancel_run(&self, run_id: &RunId, summary: RunSummary) -> StorageResult<()> {
        self.with_run(run_id, |state| state.finish(RunStatus::Cancelled, summary))
    }

    async fn get_run(&self, run_id: &RunId) -> StorageResult<RunRecord> {
        self.with_run(run_id, |state| Ok(state.record.clone()))
    }

    async fn get_events(&self, run_id: &RunId) -> StorageResult<Vec<RunEvent>> {
        self.with_run(run_id, |state| Ok(state.events.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn metadata() -> RunMetadata {
        RunMetadata {
            git_sha: None,
            image: "ghcr.io/example/app".to_string(),
            tags: json!({}),
        }
    }

    fn event(seq: u64, kind: &str) -> RunEvent {
        RunEvent {
            seq,
            kind: kind.to_string(),
            payload: json!({}),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn markers_are_write_once() {
        let store = MemoryDigestCollection::new();
        let run = RunId::from("run-a");
        store.put_marker(&run, "abc123").await.unwrap();
        let err = store.put_marker(&run, "abc123").await.unwrap_err();
        assert!(matches!(err, StorageError::MarkerExists { .. }));
        assert_eq!(store.list_markers(&run).await.unwrap(), vec!["abc123"]);
    }

    #[tokio::test]
    async fn markers_are_scoped_by_run() {
        let store = MemoryDigestCollection::new();
        store.put_marker(&RunId::from("a"), "aa").await.unwrap();
        store.put_marker(&RunId::from("b"), "bb").await.unwrap();
        assert_eq!(store.list_markers(&RunId::from("a")).await.unwrap(), vec!["aa"]);
        assert_eq!(store.list_markers(&RunId::from("b")).await.unwrap(), vec!["bb"]);
    }

    #[tokio::test]
    async fn require_markers_rejects_empty_run() {
        let store = MemoryDigestCollection::new();
        let err = store.require_markers(&RunId::from("empty")).await.unwrap_err();
        assert!(matches!(err, StorageError::EmptyCollection { .. }));
    }

    #[tokio::test]
    async fn prefixed_marker_is_rejected() {
        let store = MemoryDigestCollection::new();
        let err = store
            .put_marker(&RunId::from("r"), "sha256:abcd")
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidMarkerName { .. }));
    }

    #[tokio::test]
    async fn ledger_lifecycle() {
        let ledger = MemoryRunLedger::new();
        let run = RunId::new();
        ledger.create_run(&run, "m1", metadata()).await.unwrap();
        ledger.append_event(&run, event(1, "job_started")).await.unwrap();
        ledger.append_event(&run, event(2, "marker_recorded")).await.unwrap();
        ledger
            .complete_run(
                &run,
                RunSummary {
                    total_events: 2,
                    success: true,
                    ..RunSummary::default()
                },
            )
            .await
            .unwrap();

        let record = ledger.get_run(&run).await.unwrap();
        assert_eq!(record.status, RunStatus::Completed);
        assert!(record.completed_at.is_some());
        assert_eq!(ledger.get_events(&run).await.unwrap().len(), 2);

        let err = ledger.append_event(&run, event(3, "late")).await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidRunState { .. }));
    }

    #[tokio::test]
    async fn ledger_rejects_out_of_order_events() {
        let ledger = MemoryRunLedger::new();
        let run = RunId::new();
        ledger.create_run(&run, "m1", metadata()).await.unwrap();
        ledger.append_event(&run, event(2, "a")).await.unwrap();
        let err = ledger.append_event(&run, event(2, "b")).await.unwrap_err();
        assert!(matches!(err, StorageError::OutOfOrderEvent { .. }));
    }

    #[tokio::test]
    async fn ledger_rejects_duplicate_run() {
        let ledger = MemoryRunLedger::new();
        let run = RunId::from("dup");
        ledger.create_run(&run, "m1", metadata()).await.unwrap();
        assert!(ledger.create_run(&run, "m1", metadata()).await.is_err());
    }
}
