//! Global atomic counters for pipeline observability.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event at the end of a run.

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Lightweight atomic counters without allocation or locking.
pub struct Metrics {
    jobs_succeeded: AtomicU64,
    jobs_failed: AtomicU64,
    markers_recorded: AtomicU64,
    merges_rejected: AtomicU64,
    manifests_published: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            jobs_succeeded: AtomicU64::new(0),
            jobs_failed: AtomicU64::new(0),
            markers_recorded: AtomicU64::new(0),
            merges_rejected: AtomicU64::new(0),
            manifests_published: AtomicU64::new(0),
        }
    }

    pub fn inc_jobs_succeeded(&self) {
        self.jobs_succeeded.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "jobs_succeeded", "counter incremented");
    }

    pub fn inc_jobs_failed(&self) {
        self.jobs_failed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "jobs_failed", "counter incremented");
    }

    pub fn inc_markers_recorded(&self) {
        self.markers_recorded.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "markers_recorded", "counter incremented");
    }

    pub fn inc_merges_rejected(&self) {
        self.merges_rejected.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "merges_rejected", "counter incremented");
    }

    pub fn inc_manifests_published(&self) {
        self.manifests_published.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "manifests_published", "counter incremented");
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            jobs_succeeded = self.jobs_succeeded(),
            jobs_failed = self.jobs_failed(),
            markers_recorded = self.markers_recorded(),
            merges_rejected = self.merges_rejected(),
            manifests_published = self.manifests_published(),
        );
    }

    pub fn jobs_succeeded(&self) -> u64 {
        self.jobs_succeeded.load(Ordering::Relaxed)
    }

    pub fn jobs_failed(&self) -> u64 {
        self.jobs_failed.load(Ordering::Relaxed)
    }

    pub fn markers_recorded(&self) -> u64 {
        self.markers_recorded.load(Ordering::Relaxed)
    }

    pub fn merges_rejected(&self) -> u64 {
        self.merges_rejected.load(Ordering::Relaxed)
    }

    pub fn manifests_published(&self) -> u64 {
        self.manifests_published.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        self.jobs_succeeded.store(0, Ordering::Relaxed);
        self.jobs_failed.store(0, Ordering::Relaxed);
        self.markers_recorded.store(0, Ordering::Relaxed);
        self.merges_rejected.store(0, Ordering::Relaxed);
        self.manifests_published.store(0, Ordering::Relaxed);
    }
}
