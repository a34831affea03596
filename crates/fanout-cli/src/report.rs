//! JSON artifacts written by the CLI.

use anyhow::{Context, Result};
use fanout_state::{RunEvent, RunRecord};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::Path;

/// Run record plus its full event log, persisted next to the markers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunArtifact {
    pub run: RunRecord,
    pub events: Vec<RunEvent>,
}

/// Write any serializable value as pretty JSON, creating parent directories.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).with_context(|| format!("create {:?}", parent))?;
    }
    let content = serde_json::to_string_pretty(value).context("serialize report")?;
    std::fs::write(path, content).with_context(|| format!("write {:?}", path))?;
    Ok(())
}

/// Append `key=value` to a step-output file (the `$GITHUB_OUTPUT` format).
pub fn append_output(path: &Path, key: &str, value: &str) -> Result<()> {
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open {:?}", path))?;
    writeln!(file, "{key}={value}").with_context(|| format!("write {:?}", path))?;
    Ok(())
}
