//! Persistence layer for checkpoints and saved step outputs

#[cfg(feature = "sqlite")]
pub mod store;

#[cfg(feature = "sqlite")]
pub use store::SqliteCheckpointStore;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Checkpoint id of a run snapshot
pub fn run_checkpoint_id(run_id: impl std::fmt::Display) -> String {
    format!("run:{}", run_id)
}

/// Checkpoint id of a session handle
pub fn session_checkpoint_id(name: &str) -> String {
    format!("session:{}", name)
}

/// A step output written with `save_output`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredOutput {
    pub step_name: String,
    pub content: Value,
    pub saved_at: DateTime<Utc>,
}

/// Trait for checkpoint and output storage backends
#[async_trait::async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Save (or replace) a snapshot under an id
    async fn persist(&self, id: &str, snapshot: &Value) -> Result<()>;

    /// Load the latest snapshot for an id
    async fn load(&self, id: &str) -> Result<Option<Value>>;

    /// Append a step output
    async fn write_output(&self, step_name: &str, content: &Value) -> Result<()>;

    /// Outputs written for a step, oldest first
    async fn outputs(&self, step_name: &str) -> Result<Vec<StoredOutput>>;
}

/// In-memory store (for testing or ephemeral use)
pub struct InMemoryCheckpointStore {
    checkpoints: RwLock<HashMap<String, Value>>,
    outputs: RwLock<HashMap<String, Vec<StoredOutput>>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self {
            checkpoints: RwLock::new(HashMap::new()),
            outputs: RwLock::new(HashMap::new()),
        }
    }

    /// Ids of every stored checkpoint
    pub async fn checkpoint_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.checkpoints.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl Default for InMemoryCheckpointStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn persist(&self, id: &str, snapshot: &Value) -> Result<()> {
        self.checkpoints
            .write()
            .await
            .insert(id.to_string(), snapshot.clone());
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<Option<Value>> {
        Ok(self.checkpoints.read().await.get(id).cloned())
    }

    async fn write_output(&self, step_name: &str, content: &Value) -> Result<()> {
        self.outputs
            .write()
            .await
            .entry(step_name.to_string())
            .or_insert_with(Vec::new)
            .push(StoredOutput {
                step_name: step_name.to_string(),
                content: content.clone(),
                saved_at: Utc::now(),
            });
        Ok(())
    }

    async fn outputs(&self, step_name: &str) -> Result<Vec<StoredOutput>> {
        Ok(self
            .outputs
            .read()
            .await
            .get(step_name)
            .cloned()
            .unwrap_or_default())
    }
}
