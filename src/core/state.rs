//! Execution state models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Overall pipeline execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionStatus {
    /// Pipeline has not started
    Pending,
    /// Pipeline is currently running
    Running,
    /// Pipeline completed successfully
    Completed,
    /// Pipeline failed
    Failed,
    /// Pipeline was cancelled
    Cancelled,
}

/// Recorded outcome of one executed step
///
/// Results are immutable once recorded; later steps only read them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub step_name: String,

    pub success: bool,

    /// Structured output, addressed by `steps.<name>.result`
    pub output: Value,

    pub error: Option<String>,

    pub started_at: DateTime<Utc>,

    pub duration_ms: u64,

    /// Handler-specific details (error history, session id, batch counts, ...)
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl StepResult {
    /// Create a successful result
    pub fn success(
        step_name: impl Into<String>,
        output: Value,
        started_at: DateTime<Utc>,
        duration_ms: u64,
    ) -> Self {
        Self {
            step_name: step_name.into(),
            success: true,
            output,
            error: None,
            started_at,
            duration_ms,
            metadata: Map::new(),
        }
    }

    /// Create a failed result
    pub fn failure(
        step_name: impl Into<String>,
        error: impl Into<String>,
        started_at: DateTime<Utc>,
        duration_ms: u64,
    ) -> Self {
        Self {
            step_name: step_name.into(),
            success: false,
            output: Value::Null,
            error: Some(error.into()),
            started_at,
            duration_ms,
            metadata: Map::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata.extend(metadata);
        self
    }

    /// View used by the template resolver for `steps.<name>.*`
    pub fn to_template_value(&self) -> Value {
        serde_json::json!({
            "result": self.output,
            "success": self.success,
            "error": self.error,
            "duration_ms": self.duration_ms,
            "metadata": self.metadata,
        })
    }
}
