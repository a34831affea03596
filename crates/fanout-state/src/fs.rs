use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tracing::debug;

use crate::error::StorageError;
use crate::storage_traits::{validate_marker_name, DigestCollection, RunId, StorageResult};

/// Filesystem-backed digest collection.
///
/// Layout: `<root>/<run_id>/digests/<hex>`, one zero-byte file per marker.
/// Write-once is enforced with `create_new`, so concurrent jobs writing
/// distinct digests never contend and a repeated digest is reported.
pub struct FsDigestCollection {
    root: PathBuf,
}

impl FsDigestCollection {
    /// Create a collection rooted at `root`. Creates the directory if needed.
    pub async fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn digests_dir(&self, run_id: &RunId) -> StorageResult<PathBuf> {
        if !run_id.is_path_safe() {
            return Err(StorageError::InvalidRunId {
                run_id: run_id.0.clone(),
            });
        }
        Ok(self.root.join(run_id.as_str()).join("digests"))
    }
}

#[async_trait]
impl DigestCollection for FsDigestCollection {
    async fn put_marker(&self, run_id: &RunId, name: &str) -> StorageResult<()> {
        validate_marker_name(name)?;
        let dir = self.digests_dir(run_id)?;
        fs::create_dir_all(&dir).await?;

        let path = dir.join(name);
        let file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
            .map_err(|e| {
                if e.kind() == ErrorKind::AlreadyExists {
                    StorageError::MarkerExists {
                        run_id: run_id.0.clone(),
                        name: name.to_string(),
                    }
                } else {
                    StorageError::Io(e)
                }
            })?;
        file.sync_all().await?;
        debug!(path = %path.display(), "marker written");
        Ok(())
    }

    async fn list_markers(&self, run_id: &RunId) -> StorageResult<Vec<String>> {
        let dir = self.digests_dir(run_id)?;
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut markers = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if validate_marker_name(&name).is_ok() {
                markers.push(name);
            } else {
                debug!(file = %name, "ignoring non-marker file");
            }
        }
        markers.sort();
        Ok(markers)
    }
}
