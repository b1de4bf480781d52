//! pipewright - a nested LLM pipeline execution engine

pub mod cli;
pub mod core;
pub mod error;
pub mod execution;
pub mod persistence;
pub mod provider;

// Re-export commonly used types
pub use crate::core::{
    EngineConfig, ExecutionContext, ExecutionStatus, PipelineConfig, PipelineDefinition,
    StepDefinition, StepKind, StepResult,
};
pub use error::{EngineError, PipelineFailure};
pub use execution::{ExecutionEngine, ExecutionEvent, RunOptions, RunReport};
pub use persistence::{CheckpointStore, InMemoryCheckpointStore};
pub use provider::{CommandProvider, Provider, ProviderError, ProviderOptions, ProviderResponse};
