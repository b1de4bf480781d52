//! Engine error taxonomy

use crate::core::step::FallbackAction;
use crate::execution::robust::AttemptRecord;
use crate::provider::{ErrorClass, ProviderError};
use thiserror::Error;

/// Errors raised while executing a single step
#[derive(Debug, Error)]
pub enum EngineError {
    /// Bad step configuration; never retried
    #[error("Invalid configuration for step '{step}': {message}")]
    Validation { step: String, message: String },

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("Step timed out after {0} seconds")]
    StepTimeout(u64),

    #[error("Maximum nesting depth of {max_depth} exceeded at depth {depth} ({})", .chain.join(" -> "))]
    DepthExceeded {
        depth: usize,
        max_depth: usize,
        chain: Vec<String>,
    },

    #[error("Circular pipeline dependency: {}", .chain.join(" -> "))]
    CircularDependency { chain: Vec<String> },

    #[error("Step limit of {limit} exceeded ({})", .chain.join(" -> "))]
    ResourceExceeded { limit: usize, chain: Vec<String> },

    #[error("Output '{path}' not found in nested pipeline '{pipeline_id}'")]
    OutputNotFound { pipeline_id: String, path: String },

    #[error("Task '{task_id}' timed out after {timeout_ms}ms")]
    TaskTimeout { task_id: String, timeout_ms: u64 },

    #[error("Unresolved template reference '{0}'")]
    UnresolvedTemplate(String),

    #[error("Could not load pipeline '{source_ref}': {message}")]
    PipelineSource { source_ref: String, message: String },

    #[error("Nested pipeline '{pipeline_id}' failed")]
    NestedPipeline {
        pipeline_id: String,
        #[source]
        failure: Box<PipelineFailure>,
    },

    #[error("Step '{step}' failed after {} attempt(s) and fallback '{fallback}' did not recover: {last_error}", .history.len())]
    FallbackFailed {
        step: String,
        fallback: FallbackAction,
        last_error: String,
        history: Vec<AttemptRecord>,
    },

    #[error("Execution cancelled")]
    Cancelled,
}

impl EngineError {
    /// Failure class for retry decisions; anything that is not a provider
    /// or timeout problem is terminal
    pub fn class(&self) -> ErrorClass {
        match self {
            EngineError::Provider(e) => e.class(),
            EngineError::StepTimeout(_) | EngineError::TaskTimeout { .. } => ErrorClass::Timeout,
            _ => ErrorClass::Terminal,
        }
    }

    /// True for violations of the engine's safety limits, including ones
    /// raised inside a nested pipeline
    pub fn is_safety_violation(&self) -> bool {
        match self {
            EngineError::DepthExceeded { .. }
            | EngineError::CircularDependency { .. }
            | EngineError::ResourceExceeded { .. } => true,
            EngineError::NestedPipeline { failure, .. } => failure.error.is_safety_violation(),
            _ => false,
        }
    }

    /// True when the run was cancelled, here or inside a nested pipeline
    pub fn is_cancellation(&self) -> bool {
        match self {
            EngineError::Cancelled => true,
            EngineError::NestedPipeline { failure, .. } => failure.error.is_cancellation(),
            _ => false,
        }
    }

    /// True for errors that no retry or fallback may hide: configuration
    /// problems, missing required outputs, safety violations and cancellation
    pub fn is_fatal(&self) -> bool {
        match self {
            EngineError::Validation { .. }
            | EngineError::UnresolvedTemplate(_)
            | EngineError::PipelineSource { .. }
            | EngineError::OutputNotFound { .. } => true,
            EngineError::NestedPipeline { failure, .. } => failure.error.is_fatal(),
            other => other.is_safety_violation() || other.is_cancellation(),
        }
    }

    pub fn validation(step: impl Into<String>, message: impl Into<String>) -> Self {
        EngineError::Validation {
            step: step.into(),
            message: message.into(),
        }
    }
}

/// Terminal outcome of one pipeline invocation
#[derive(Debug, Error)]
#[error("Pipeline '{pipeline_id}' failed at step '{failing_step}': {error}")]
pub struct PipelineFailure {
    pub pipeline_id: String,
    pub failing_step: String,
    /// Pipeline ids from the root down to the failing invocation
    pub pipeline_chain: Vec<String>,
    #[source]
    pub error: EngineError,
}

impl PipelineFailure {
    /// Messages of this failure and every underlying cause, outermost first
    pub fn error_chain(&self) -> Vec<String> {
        let mut chain = vec![self.to_string()];
        let mut current: Option<&(dyn std::error::Error + 'static)> =
            std::error::Error::source(self);
        while let Some(err) = current {
            chain.push(err.to_string());
            current = err.source();
        }
        chain
    }

    /// The deepest failure, following nested pipeline wrappers
    pub fn innermost(&self) -> &PipelineFailure {
        match &self.error {
            EngineError::NestedPipeline { failure, .. } => failure.innermost(),
            _ => self,
        }
    }

    /// Step path from the root failing step down to the innermost one
    pub fn step_path(&self) -> Vec<String> {
        let mut path = vec![self.failing_step.clone()];
        if let EngineError::NestedPipeline { failure, .. } = &self.error {
            path.extend(failure.step_path());
        }
        path
    }
}
