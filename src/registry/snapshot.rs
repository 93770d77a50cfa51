//! Recovery snapshot of pending tasks.
//!
//! The snapshot is a JSON array of task records. Writing goes through a
//! temporary sibling file that is renamed over the target, so a crash never
//! leaves a half-written snapshot behind.

use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::types::{Status, Task};

use super::TaskRegistry;

impl TaskRegistry {
    /// Write QUEUED, DOWNLOADING and STOPPED tasks to `path`
    ///
    /// When nothing is pending the file is deleted instead of holding `[]`.
    pub async fn snapshot_pending(&self, path: &Path) -> Result<usize> {
        let pending = self.pending();

        if pending.is_empty() {
            match tokio::fs::remove_file(path).await {
                Ok(()) => tracing::debug!(path = %path.display(), "Removed empty snapshot"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            return Ok(0);
        }

        let json = serde_json::to_vec_pretty(&pending)?;

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }

        let temp = temp_sibling(path);
        tokio::fs::write(&temp, &json).await?;
        if let Err(e) = tokio::fs::rename(&temp, path).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(e.into());
        }

        tracing::debug!(path = %path.display(), tasks = pending.len(), "Snapshot written");
        Ok(pending.len())
    }
}

/// Read a snapshot written by [`TaskRegistry::snapshot_pending`]
///
/// Best effort: a missing or malformed file yields an empty list and an
/// unreadable record is skipped. Tasks that were DOWNLOADING come back QUEUED
/// with zero progress, and records without a source reference are dropped.
pub async fn load_pending(path: &Path) -> Vec<Task> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Failed to read snapshot");
            return Vec::new();
        }
    };

    let records: Vec<serde_json::Value> = match serde_json::from_slice(&bytes) {
        Ok(records) => records,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Ignoring malformed snapshot");
            return Vec::new();
        }
    };

    // A bad record only costs itself
    records
        .into_iter()
        .enumerate()
        .filter_map(|(index, record)| match serde_json::from_value::<Task>(record) {
            Ok(task) => Some(task),
            Err(e) => {
                tracing::warn!(index, error = %e, "Dropping unreadable snapshot record");
                None
            }
        })
        .filter(|task| {
            let keep = !task.source_ref.trim().is_empty();
            if !keep {
                tracing::warn!(task_id = %task.id, "Dropping snapshot record without a source");
            }
            keep
        })
        .map(|mut task| {
            if task.status == Status::Downloading {
                task.status = Status::Queued;
                task.progress = 0.0;
            }
            task
        })
        .collect()
}

fn temp_sibling(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "snapshot".into());
    name.push(".tmp");
    path.with_file_name(name)
}
