//! Session registry - stable conversation identity per session name

use crate::persistence::{session_checkpoint_id, CheckpointStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A named conversation session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionHandle {
    pub session_id: String,
    pub name: String,
    /// Number of steps that used this session, including the current one
    pub turn_count: u32,
    pub checkpoint_frequency: u32,
    pub persisted: bool,
    pub created_at: DateTime<Utc>,
}

/// Per-step session settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    pub checkpoint_frequency: u32,
    pub persisted: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            checkpoint_frequency: 5,
            persisted: false,
        }
    }
}

/// Sessions of one run, shared by every context in the tree
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, SessionHandle>>,
    store: Option<Arc<dyn CheckpointStore>>,
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("has_store", &self.store.is_some())
            .finish_non_exhaustive()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            store: None,
        }
    }

    /// Registry that checkpoints handles through a store
    pub fn with_store(store: Arc<dyn CheckpointStore>) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            store: Some(store),
        }
    }

    /// Return the handle for `name`, creating it on first use
    ///
    /// Every call counts as one turn. Persistence failures are logged and
    /// never fail the call.
    pub async fn get_or_create(&self, name: &str, config: SessionConfig) -> SessionHandle {
        let handle = {
            let mut sessions = self.sessions.lock().await;
            match sessions.get_mut(name) {
                Some(existing) => {
                    existing.turn_count += 1;
                    existing.clone()
                }
                None => {
                    let handle = match self.restore(name, config).await {
                        Some(mut restored) => {
                            restored.turn_count += 1;
                            restored
                        }
                        None => {
                            let handle = SessionHandle {
                                session_id: Uuid::new_v4().to_string(),
                                name: name.to_string(),
                                turn_count: 1,
                                checkpoint_frequency: config.checkpoint_frequency.max(1),
                                persisted: config.persisted,
                                created_at: Utc::now(),
                            };
                            debug!("Created session {} ({})", name, handle.session_id);
                            handle
                        }
                    };
                    sessions.insert(name.to_string(), handle.clone());
                    handle
                }
            }
        };

        if handle.turn_count % handle.checkpoint_frequency.max(1) == 0 {
            self.checkpoint(&handle).await;
        }
        handle
    }

    /// Current handle without counting a turn
    pub async fn get(&self, name: &str) -> Option<SessionHandle> {
        self.sessions.lock().await.get(name).cloned()
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }

    async fn restore(&self, name: &str, config: SessionConfig) -> Option<SessionHandle> {
        if !config.persisted {
            return None;
        }
        let store = self.store.as_ref()?;
        match store.load(&session_checkpoint_id(name)).await {
            Ok(Some(snapshot)) => match serde_json::from_value::<SessionHandle>(snapshot) {
                Ok(handle) => {
                    info!("Restored session {} ({})", name, handle.session_id);
                    Some(handle)
                }
                Err(e) => {
                    warn!("Ignoring unreadable checkpoint for session {}: {}", name, e);
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!("Failed to load session {}: {:#}", name, e);
                None
            }
        }
    }

    async fn checkpoint(&self, handle: &SessionHandle) {
        let Some(store) = &self.store else {
            return;
        };
        let snapshot = match serde_json::to_value(handle) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("Failed to serialize session {}: {}", handle.name, e);
                return;
            }
        };
        match store.persist(&session_checkpoint_id(&handle.name), &snapshot).await {
            Ok(()) => debug!("Checkpointed session {} at turn {}", handle.name, handle.turn_count),
            Err(e) => warn!("Failed to checkpoint session {}: {:#}", handle.name, e),
        }
    }
}
