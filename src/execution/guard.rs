//! Recursion safety for nested pipelines

use crate::core::context::ExecutionContext;
use crate::error::EngineError;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;
use uuid::Uuid;

/// A nested invocation currently executing
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveInvocation {
    pub run_id: Uuid,
    pub pipeline_id: String,
    pub depth: usize,
    /// Ancestors followed by the invocation itself
    pub chain: Vec<String>,
    pub started_at: DateTime<Utc>,
}

/// Rejects cycles and over-deep nesting, and tracks live nested invocations
#[derive(Debug, Default)]
pub struct RecursionGuard {
    next_id: AtomicU64,
    active: Mutex<HashMap<u64, ActiveInvocation>>,
}

impl RecursionGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check whether `parent` may invoke `child_id`
    pub fn check(
        &self,
        parent: &ExecutionContext,
        child_id: &str,
        max_depth: usize,
    ) -> Result<(), EngineError> {
        let mut chain = parent.full_chain();
        chain.push(child_id.to_string());

        if parent.full_chain().iter().any(|id| id == child_id) {
            return Err(EngineError::CircularDependency { chain });
        }

        let depth = parent.nesting_depth() + 1;
        if depth > max_depth {
            return Err(EngineError::DepthExceeded {
                depth,
                max_depth,
                chain,
            });
        }
        Ok(())
    }

    /// Register a nested invocation until the returned scope is dropped
    pub fn enter(&self, child: &ExecutionContext) -> InvocationScope<'_> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let invocation = ActiveInvocation {
            run_id: child.handles().run_id(),
            pipeline_id: child.pipeline_id().to_string(),
            depth: child.nesting_depth(),
            chain: child.full_chain(),
            started_at: Utc::now(),
        };
        debug!(
            "Entering nested pipeline {} at depth {}",
            invocation.pipeline_id, invocation.depth
        );
        self.lock().insert(id, invocation);
        InvocationScope { guard: self, id }
    }

    /// Live nested invocations of one run
    pub fn active(&self, run_id: Uuid) -> Vec<ActiveInvocation> {
        let mut active: Vec<_> = self
            .lock()
            .values()
            .filter(|inv| inv.run_id == run_id)
            .cloned()
            .collect();
        active.sort_by_key(|inv| inv.depth);
        active
    }

    /// Live nested invocations across all runs
    pub fn active_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, ActiveInvocation>> {
        self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Registration of one nested invocation; released on drop
#[derive(Debug)]
pub struct InvocationScope<'g> {
    guard: &'g RecursionGuard,
    id: u64,
}

impl Drop for InvocationScope<'_> {
    fn drop(&mut self) {
        if let Some(invocation) = self.guard.lock().remove(&self.id) {
            debug!("Leaving nested pipeline {}", invocation.pipeline_id);
        }
    }
}
