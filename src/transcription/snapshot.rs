//! Persistence of the resolver's winning configuration.
//!
//! The state file is a small JSON object written once by a successful
//! resolution and read only by operational tooling.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::PathBuf;

/// The winning `(source, modelId, device)` triple.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedConfiguration {
    /// Hub that served the model. Older state files call this `hub`.
    #[serde(alias = "hub")]
    pub source: String,

    #[serde(alias = "model_id")]
    pub model_id: String,

    pub device: String,
}

/// JSON file holding the last [`ResolvedConfiguration`].
#[derive(Debug, Clone)]
pub struct StateSnapshotStore {
    path: PathBuf,
}

impl StateSnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[cfg(test)]
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Replace the snapshot. The file is written next to its final location
    /// and renamed into place, so readers never see a partial document.
    pub fn write(&self, resolved: &ResolvedConfiguration) -> anyhow::Result<()> {
        let parent = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent)?;

        let body = serde_json::to_string_pretty(resolved)?;
        let mut staged = tempfile::NamedTempFile::new_in(&parent)?;
        staged.write_all(body.as_bytes())?;
        staged.write_all(b"\n")?;
        staged.persist(&self.path).map_err(|e| e.error)?;

        tracing::debug!(path = %self.path.display(), "Resolved configuration persisted");
        Ok(())
    }

    /// Read the snapshot back, `None` when no resolution has been recorded.
    #[cfg(test)]
    pub fn read(&self) -> anyhow::Result<Option<ResolvedConfiguration>> {
        match fs::read_to_string(&self.path) {
            Ok(body) => Ok(Some(serde_json::from_str(&body)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
