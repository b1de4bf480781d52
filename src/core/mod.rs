//! Core domain models for pipewright
//!
//! This module defines the fundamental data structures that represent
//! pipelines, steps, their configuration and the execution context they
//! run in.

pub mod condition;
pub mod config;
pub mod context;
pub mod pipeline;
pub mod state;
pub mod step;
pub mod template;

pub use config::{EngineConfig, PipelineConfig, WorkflowDefaults};
pub use context::*;
pub use pipeline::*;
pub use state::*;
pub use step::*;
pub use template::{Scope, TemplateResolver};
