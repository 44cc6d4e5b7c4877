// SPDX-License-Identifier: MIT

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use super::Checkpoint;
use crate::flow::error::CheckpointError;
use crate::flow::types::RunId;

/// Append-only checkpoint history, one sequence per run
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Append a checkpoint; its sequence must exceed every stored one for the run
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError>;

    async fn latest(&self, run_id: &RunId) -> Result<Option<Checkpoint>, CheckpointError>;

    /// All checkpoints of a run, oldest first
    async fn history(&self, run_id: &RunId) -> Result<Vec<Checkpoint>, CheckpointError>;

    async fn delete(&self, run_id: &RunId) -> Result<(), CheckpointError>;
}

fn conflict(checkpoint: &Checkpoint, last: u64) -> CheckpointError {
    CheckpointError::SequenceConflict {
        run_id: checkpoint.run_id.clone(),
        sequence: checkpoint.sequence,
        last,
    }
}

#[derive(Default)]
pub struct MemoryCheckpointStore {
    data: RwLock<HashMap<RunId, Vec<Checkpoint>>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let mut data = self.data.write().await;
        let history = data.entry(checkpoint.run_id.clone()).or_default();
        if let Some(last) = history.last() {
            if checkpoint.sequence <= last.sequence {
                return Err(conflict(checkpoint, last.sequence));
            }
        }
        history.push(checkpoint.clone());
        Ok(())
    }

    async fn latest(&self, run_id: &RunId) -> Result<Option<Checkpoint>, CheckpointError> {
        Ok(self
            .data
            .read()
            .await
            .get(run_id)
            .and_then(|h| h.last().cloned()))
    }

    async fn history(&self, run_id: &RunId) -> Result<Vec<Checkpoint>, CheckpointError> {
        Ok(self
            .data
            .read()
            .await
            .get(run_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn delete(&self, run_id: &RunId) -> Result<(), CheckpointError> {
        self.data.write().await.remove(run_id);
        Ok(())
    }
}

/// Stores each checkpoint as `<dir>/<run_id>/<sequence>.json`
///
/// Saves of one run are serialized per store, and a sequence file is only
/// ever created, never replaced: of two writers racing for the same sequence
/// (in one process or across stores sharing `dir`) exactly one succeeds and
/// the other gets [`CheckpointError::SequenceConflict`].
pub struct FileCheckpointStore {
    dir: PathBuf,
    locks: Mutex<HashMap<RunId, Arc<Mutex<()>>>>,
}

impl FileCheckpointStore {
    pub fn new(dir: impl AsRef<Path>) -> Result<Self, CheckpointError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            locks: Mutex::new(HashMap::new()),
        })
    }

    async fn run_lock(&self, run_id: &RunId) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .await
            .entry(run_id.clone())
            .or_default()
            .clone()
    }

    fn run_dir(&self, run_id: &RunId) -> Result<PathBuf, CheckpointError> {
        let id = run_id.as_str();
        if id.is_empty() || id == "." || id == ".." || id.contains(['/', '\\']) {
            return Err(CheckpointError::InvalidRunId(id.to_string()));
        }
        Ok(self.dir.join(id))
    }

    async fn read_history(&self, run_id: &RunId) -> Result<Vec<Checkpoint>, CheckpointError> {
        let run_dir = self.run_dir(run_id)?;
        let mut entries = match tokio::fs::read_dir(&run_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                paths.push(path);
            }
        }
        // Zero-padded names sort by sequence.
        paths.sort();

        let mut history = Vec::with_capacity(paths.len());
        for path in paths {
            let bytes = tokio::fs::read(&path).await?;
            let checkpoint = serde_json::from_slice::<Checkpoint>(&bytes)
                .map_err(|e| CheckpointError::Corrupted(format!("{}: {}", path.display(), e)))?;
            history.push(checkpoint);
        }
        Ok(history)
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let run_dir = self.run_dir(&checkpoint.run_id)?;
        let lock = self.run_lock(&checkpoint.run_id).await;
        let _guard = lock.lock().await;
        tokio::fs::create_dir_all(&run_dir).await?;

        if let Some(last) = self.read_history(&checkpoint.run_id).await?.last() {
            if checkpoint.sequence <= last.sequence {
                return Err(conflict(checkpoint, last.sequence));
            }
        }

        let bytes = serde_json::to_vec_pretty(checkpoint)?;
        let path = run_dir.join(format!("{:08}.json", checkpoint.sequence));
        let tmp = run_dir.join(format!(
            "{:08}.{}.tmp",
            checkpoint.sequence,
            uuid::Uuid::new_v4().simple()
        ));
        tokio::fs::write(&tmp, bytes).await?;

        // hard_link fails instead of replacing an existing target.
        let linked = tokio::fs::hard_link(&tmp, &path).await;
        if let Err(e) = tokio::fs::remove_file(&tmp).await {
            log::warn!("Could not remove {}: {}", tmp.display(), e);
        }
        match linked {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(conflict(checkpoint, checkpoint.sequence));
            }
            Err(e) => return Err(e.into()),
        }
        log::debug!(
            "Saved checkpoint {} for run {} to {}",
            checkpoint.sequence,
            checkpoint.run_id,
            path.display()
        );
        Ok(())
    }

    async fn latest(&self, run_id: &RunId) -> Result<Option<Checkpoint>, CheckpointError> {
        Ok(self.read_history(run_id).await?.pop())
    }

    async fn history(&self, run_id: &RunId) -> Result<Vec<Checkpoint>, CheckpointError> {
        self.read_history(run_id).await
    }

    async fn delete(&self, run_id: &RunId) -> Result<(), CheckpointError> {
        let run_dir = self.run_dir(run_id)?;
        self.locks.lock().await.remove(run_id);
        match tokio::fs::remove_dir_all(run_dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
