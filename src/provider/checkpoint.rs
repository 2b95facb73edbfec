//! Checkpoint sinks
//!
//! Two [`CheckpointSink`] implementations: an in-memory map for tests and
//! ephemeral processes, and a JSON-file sink that writes one snapshot per
//! thread. The coordinator overwrites the snapshot at every stage
//! boundary, so the file always holds the latest state for a thread.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::ResearchError;
use crate::state::ResearchState;

use super::CheckpointSink;

/// In-memory checkpoint sink.
#[derive(Debug, Default)]
pub struct MemoryCheckpointSink {
    snapshots: RwLock<HashMap<String, ResearchState>>,
}

impl MemoryCheckpointSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored snapshots.
    pub async fn len(&self) -> usize {
        self.snapshots.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.snapshots.read().await.is_empty()
    }
}

#[async_trait]
impl CheckpointSink for MemoryCheckpointSink {
    async fn save(&self, thread_id: &str, state: &ResearchState) -> Result<(), ResearchError> {
        self.snapshots
            .write()
            .await
            .insert(thread_id.to_string(), state.clone());
        Ok(())
    }

    async fn load(&self, thread_id: &str) -> Result<Option<ResearchState>, ResearchError> {
        Ok(self.snapshots.read().await.get(thread_id).cloned())
    }
}

/// JSON-file checkpoint sink, one file per thread.
#[derive(Debug)]
pub struct FileCheckpointSink {
    dir: PathBuf,
}

impl FileCheckpointSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, thread_id: &str) -> PathBuf {
        // Thread ids may come from callers; keep only filename-safe chars.
        let safe: String = thread_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{safe}.json"))
    }
}

#[async_trait]
impl CheckpointSink for FileCheckpointSink {
    async fn save(&self, thread_id: &str, state: &ResearchState) -> Result<(), ResearchError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| ResearchError::Checkpoint(format!("create dir: {e}")))?;

        let json = serde_json::to_vec_pretty(state)
            .map_err(|e| ResearchError::Checkpoint(format!("serialize: {e}")))?;

        let path = self.path_for(thread_id);
        tokio::fs::write(&path, json)
            .await
            .map_err(|e| ResearchError::Checkpoint(format!("write {}: {e}", path.display())))?;

        debug!(thread_id, path = %path.display(), "checkpoint saved");
        Ok(())
    }

    async fn load(&self, thread_id: &str) -> Result<Option<ResearchState>, ResearchError> {
        let path = self.path_for(thread_id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(ResearchError::Checkpoint(format!(
                    "read {}: {e}",
                    path.display()
                )))
            }
        };

        let state = serde_json::from_slice(&bytes)
            .map_err(|e| ResearchError::Checkpoint(format!("deserialize: {e}")))?;
        Ok(Some(state))
    }
}
