//! Pipeline domain model

use crate::core::config::{PipelineConfig, WorkflowDefaults};
use crate::core::context::VarMap;
use crate::core::step::{InlinePipeline, StepDefinition};
use std::path::{Path, PathBuf};

/// A pipeline ready for execution
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineDefinition {
    /// Pipeline id; the `name` of a file-based pipeline
    pub id: String,

    pub description: Option<String>,

    /// Variables seeded into the root context
    pub variables: VarMap,

    /// Steps in declared order
    pub steps: Vec<StepDefinition>,

    pub defaults: WorkflowDefaults,

    /// Directory that relative nested file references resolve against
    pub source_dir: Option<PathBuf>,
}

impl PipelineDefinition {
    /// Create a pipeline from a bare step list
    pub fn new(id: impl Into<String>, steps: Vec<StepDefinition>) -> Self {
        Self {
            id: id.into(),
            description: None,
            variables: VarMap::new(),
            steps,
            defaults: WorkflowDefaults::default(),
            source_dir: None,
        }
    }

    /// Create a pipeline from configuration
    pub fn from_config(config: &PipelineConfig, source_dir: Option<&Path>) -> Self {
        Self {
            id: config.name.clone(),
            description: config.description.clone(),
            variables: config.variables.clone().into_iter().collect(),
            steps: config.steps.clone(),
            defaults: config.defaults.clone(),
            source_dir: source_dir.map(Path::to_path_buf),
        }
    }

    /// Pipeline declared inline in a step; `fallback_id` is used when it has no name
    pub fn from_inline(
        inline: &InlinePipeline,
        fallback_id: impl Into<String>,
        source_dir: Option<&Path>,
    ) -> Self {
        Self {
            id: inline.name.clone().unwrap_or_else(|| fallback_id.into()),
            description: None,
            variables: inline.variables.clone().into_iter().collect(),
            steps: inline.steps.clone(),
            defaults: WorkflowDefaults::default(),
            source_dir: source_dir.map(Path::to_path_buf),
        }
    }

    /// Load a pipeline file; its directory becomes the source directory
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let config = PipelineConfig::from_file(path)?;
        Ok(Self::from_config(&config, path.parent()))
    }

    pub fn with_variable(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.variables.insert(name.into(), value);
        self
    }

    pub fn with_source_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.source_dir = Some(dir.into());
        self
    }

    /// Get a step by name
    pub fn step(&self, name: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.name == name)
    }
}
