//! Records pushed digests as write-once markers in the run's collection.

use std::sync::Arc;

use fanout_core::{obs, ImageDigest, METRICS};
use fanout_state::{DigestCollection, RunId};

use crate::error::{CiResult, PipelineError};

pub struct DigestCollector {
    collection: Arc<dyn DigestCollection>,
}

impl DigestCollector {
    pub fn new(collection: Arc<dyn DigestCollection>) -> Self {
        Self { collection }
    }

    /// Write the zero-byte marker for `digest`.
    ///
    /// The marker is named by the hex payload with the algorithm prefix
    /// stripped. A marker that already exists is an error: each digest is
    /// recorded by exactly one job. Once the write returns the job is
    /// complete; the merge gate checks that every reported digest is listed.
    pub async fn record(
        &self,
        run_id: &RunId,
        platform: &str,
        digest: &ImageDigest,
    ) -> CiResult<()> {
        let name = digest.marker_name();
        self.collection
            .put_marker(run_id, name)
            .await
            .map_err(|e| PipelineError::Collector {
                digest: digest.to_string(),
                detail: e.to_string(),
            })?;

        METRICS.inc_markers_recorded();
        obs::emit_marker_recorded(platform, name);
        Ok(())
    }
}
