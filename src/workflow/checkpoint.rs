//! Durable run snapshots.
//!
//! A [`Checkpoint`] holds the whole [`WorkflowRun`] (completed steps, every
//! task with its result or error) plus the frontier computed after the last
//! committed step. Stores are keyed by run id; writes for the same run are
//! serialized.

use super::types::{RunId, WorkflowRun};
use crate::error::{Error, Result};
use crate::util::{blocking, write_atomic};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// Snapshot of a run's progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub run: WorkflowRun,
    /// Steps that were ready to execute when the snapshot was taken.
    pub frontier: Vec<String>,
    pub saved_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(run: &WorkflowRun, frontier: Vec<String>) -> Self {
        Self {
            run: run.clone(),
            frontier,
            saved_at: Utc::now(),
        }
    }

    pub fn run_id(&self) -> RunId {
        self.run.id
    }
}

/// Pluggable persistence backend for checkpoints.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Persist `checkpoint`, replacing any earlier one for the same run.
    async fn save(&self, checkpoint: &Checkpoint) -> Result<()>;

    /// Load the latest checkpoint for `run_id`.
    ///
    /// # Errors
    /// `Checkpoint` when nothing is stored or the snapshot is unreadable.
    async fn load(&self, run_id: &RunId) -> Result<Checkpoint>;

    async fn remove(&self, run_id: &RunId) -> Result<()>;

    /// Ids of every stored run.
    async fn list(&self) -> Result<Vec<RunId>>;
}

fn missing(run_id: &RunId) -> Error {
    Error::Checkpoint(format!("no checkpoint for run {}", run_id))
}

/// In-process store. Snapshots are kept serialized so that loading always
/// goes through the same encoding as a durable store.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    entries: Mutex<HashMap<RunId, String>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        let json = serde_json::to_string(checkpoint)
            .map_err(|e| Error::Checkpoint(format!("failed to encode checkpoint: {}", e)))?;
        self.entries.lock().await.insert(checkpoint.run_id(), json);
        Ok(())
    }

    async fn load(&self, run_id: &RunId) -> Result<Checkpoint> {
        let entries = self.entries.lock().await;
        let json = entries.get(run_id).ok_or_else(|| missing(run_id))?;
        serde_json::from_str(json)
            .map_err(|e| Error::Checkpoint(format!("corrupt checkpoint for run {}: {}", run_id, e)))
    }

    async fn remove(&self, run_id: &RunId) -> Result<()> {
        self.entries.lock().await.remove(run_id);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<RunId>> {
        let mut ids: Vec<RunId> = self.entries.lock().await.keys().copied().collect();
        ids.sort();
        Ok(ids)
    }
}

/// One pretty-printed JSON file per run: `<dir>/<run-id>.json`.
pub struct FileCheckpointStore {
    dir: PathBuf,
    locks: std::sync::Mutex<HashMap<RunId, Arc<Mutex<()>>>>,
}

impl FileCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            locks: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, run_id: &RunId) -> PathBuf {
        self.dir.join(format!("{}.json", run_id))
    }

    fn run_lock(&self, run_id: &RunId) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(locks.entry(*run_id).or_default())
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        let run_id = checkpoint.run_id();
        let lock = self.run_lock(&run_id);
        let _guard = lock.lock().await;

        let contents = serde_json::to_string_pretty(checkpoint)
            .map_err(|e| Error::Checkpoint(format!("failed to encode checkpoint: {}", e)))?;
        let path = self.path_for(&run_id);
        debug!(run_id = %run_id, path = %path.display(), "writing checkpoint");

        blocking(move || write_atomic(&path, contents.as_bytes()))
            .await
            .map_err(|e| Error::Checkpoint(format!("failed to write checkpoint for run {}: {}", run_id, e)))
    }

    async fn load(&self, run_id: &RunId) -> Result<Checkpoint> {
        let run_id = *run_id;
        let lock = self.run_lock(&run_id);
        let _guard = lock.lock().await;

        let path = self.path_for(&run_id);
        let contents = blocking(move || {
            if !path.exists() {
                return Err(missing(&run_id));
            }
            Ok(std::fs::read_to_string(&path)?)
        })
        .await
        .map_err(|e| match e {
            Error::Checkpoint(_) => e,
            other => Error::Checkpoint(format!("failed to read checkpoint for run {}: {}", run_id, other)),
        })?;

        serde_json::from_str(&contents)
            .map_err(|e| Error::Checkpoint(format!("corrupt checkpoint for run {}: {}", run_id, e)))
    }

    async fn remove(&self, run_id: &RunId) -> Result<()> {
        let path = self.path_for(run_id);
        blocking(move || {
            if path.exists() {
                std::fs::remove_file(&path)?;
            }
            Ok(())
        })
        .await
    }

    async fn list(&self) -> Result<Vec<RunId>> {
        let dir = self.dir.clone();
        blocking(move || {
            let mut ids = Vec::new();
            if !dir.exists() {
                return Ok(ids);
            }
            for entry in std::fs::read_dir(&dir)? {
                let path = entry?.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                if let Some(id) = path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .and_then(|s| s.parse::<RunId>().ok())
                {
                    ids.push(id);
                }
            }
            ids.sort();
            Ok(ids)
        })
        .await
    }
}
