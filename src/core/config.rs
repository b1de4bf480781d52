//! Pipeline configuration from YAML and engine settings

use crate::core::context::{DEFAULT_MAX_NESTING_DEPTH, DEFAULT_MAX_TOTAL_STEPS};
use crate::core::pipeline::PipelineDefinition;
use crate::core::step::{FallbackAction, RetryConfig, StepDefinition, StepKind};
use crate::execution::circuit::CircuitBreakerConfig;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::Path;

/// Default batch parallelism
pub const DEFAULT_MAX_PARALLEL: usize = 4;

/// Default provider timeout (in seconds)
pub const DEFAULT_TIMEOUT_SECS: u64 = 300;

/// Top-level pipeline configuration loaded from YAML
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Pipeline name, also its id when used as a nested pipeline
    pub name: String,

    /// Pipeline version (optional)
    #[serde(default)]
    pub version: Option<String>,

    #[serde(default)]
    pub description: Option<String>,

    /// Initial global variables
    #[serde(default)]
    pub variables: HashMap<String, Value>,

    /// Workflow-wide defaults
    #[serde(default)]
    pub defaults: WorkflowDefaults,

    /// Pipeline steps, executed in order
    pub steps: Vec<StepDefinition>,
}

/// Workflow defaults declared in a pipeline file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefaults {
    #[serde(default)]
    pub max_nesting_depth: Option<usize>,

    #[serde(default)]
    pub max_total_steps: Option<usize>,

    /// Default batch parallelism
    #[serde(default)]
    pub max_parallel: Option<usize>,

    /// Default provider timeout (in seconds)
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    /// Retry config used by robust steps that declare none
    #[serde(default)]
    pub retry: Option<RetryConfig>,

    #[serde(default)]
    pub strict_templates: Option<bool>,
}

impl PipelineConfig {
    /// Load pipeline configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read pipeline file {}", path.display()))?;
        Self::from_yaml(&content)
            .with_context(|| format!("Invalid pipeline file {}", path.display()))
    }

    /// Parse pipeline configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: PipelineConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the pipeline configuration
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            anyhow::bail!("Pipeline name must not be empty");
        }
        if let Some(0) = self.defaults.max_parallel {
            anyhow::bail!("defaults.max_parallel must be at least 1");
        }
        validate_steps(&self.steps, &self.name)
    }

    /// Convert config to a pipeline definition; `source_dir` anchors relative
    /// file references of nested steps
    pub fn to_pipeline(&self, source_dir: Option<&Path>) -> PipelineDefinition {
        PipelineDefinition::from_config(self, source_dir)
    }
}

/// Validate one step list and everything nested in it
pub fn validate_steps(steps: &[StepDefinition], scope: &str) -> Result<()> {
    let mut seen = HashSet::new();
    for step in steps {
        if step.name.trim().is_empty() {
            anyhow::bail!("Step in '{}' has an empty name", scope);
        }
        if !seen.insert(step.name.as_str()) {
            anyhow::bail!("Duplicate step name '{}' in '{}'", step.name, scope);
        }
        validate_kind(&step.kind, &step.name, scope)?;
    }
    Ok(())
}

fn validate_kind(kind: &StepKind, step: &str, scope: &str) -> Result<()> {
    match kind {
        StepKind::Provider(p) => {
            if p.prompt.trim().is_empty() {
                anyhow::bail!("Step '{}' in '{}' has an empty prompt", step, scope);
            }
        }
        StepKind::NestedPipeline(nested) => {
            let source = nested
                .pipeline
                .source()
                .map_err(|e| anyhow::anyhow!("Step '{}' in '{}': {}", step, scope, e))?;
            for output in &nested.outputs {
                if output.path.trim().is_empty() {
                    anyhow::bail!("Step '{}' in '{}' has an output with an empty path", step, scope);
                }
            }
            if let Some(0) = nested.max_depth {
                anyhow::bail!("Step '{}' in '{}' has max_depth 0", step, scope);
            }
            if let crate::core::step::PipelineSource::Inline(inline) = source {
                let inner_scope = format!("{}/{}", scope, step);
                validate_steps(&inline.steps, &inner_scope)?;
            }
        }
        StepKind::Batch(batch) => {
            if let Some(0) = batch.max_parallel {
                anyhow::bail!("Batch step '{}' in '{}' needs max_parallel >= 1", step, scope);
            }
            if batch.tasks.is_empty() && batch.tasks_from.is_none() {
                anyhow::bail!("Batch step '{}' in '{}' declares no tasks", step, scope);
            }
            let mut ids = HashSet::new();
            for task in &batch.tasks {
                if !ids.insert(task.id.as_str()) {
                    anyhow::bail!("Batch step '{}' has duplicate task id '{}'", step, task.id);
                }
            }
            if batch.prompt.is_none() && batch.pipeline.is_none() {
                let promptless = batch
                    .tasks
                    .iter()
                    .find(|t| !t.payload.is_string() && t.payload.get("prompt").is_none());
                if let Some(task) = promptless {
                    anyhow::bail!(
                        "Batch step '{}' task '{}' has no prompt and the step declares none",
                        step,
                        task.id
                    );
                }
            }
            if let Some(pipeline) = &batch.pipeline {
                validate_kind(&StepKind::NestedPipeline((**pipeline).clone()), step, scope)?;
            }
        }
        StepKind::Robust(robust) => {
            if matches!(*robust.step, StepKind::Robust(_)) {
                anyhow::bail!("Robust step '{}' in '{}' wraps another robust step", step, scope);
            }
            let simplified = robust
                .retry
                .as_ref()
                .is_some_and(|r| r.fallback_action == FallbackAction::SimplifiedPrompt);
            if simplified && !robust.step.supports_simplified_prompt() {
                anyhow::bail!(
                    "Robust step '{}' in '{}' uses simplified_prompt around a {} step",
                    step,
                    scope,
                    robust.step.label()
                );
            }
            validate_kind(&robust.step, step, scope)?;
        }
        StepKind::Session(session) => {
            if session.session.trim().is_empty() {
                anyhow::bail!("Session step '{}' in '{}' has an empty session name", step, scope);
            }
            if session.checkpoint_frequency == 0 {
                anyhow::bail!("Session step '{}' needs checkpoint_frequency >= 1", step);
            }
        }
        StepKind::SetVariable(set) => {
            if set.variable.trim().is_empty() {
                anyhow::bail!("Step '{}' in '{}' sets a variable with an empty name", step, scope);
            }
        }
    }
    Ok(())
}

/// Engine-wide settings
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub max_nesting_depth: usize,
    pub max_total_steps: usize,
    pub default_retry: RetryConfig,
    pub default_max_parallel: usize,
    pub default_timeout_secs: u64,
    /// Unresolved template references fail the step instead of staying literal
    pub strict_templates: bool,
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_nesting_depth: DEFAULT_MAX_NESTING_DEPTH,
            max_total_steps: DEFAULT_MAX_TOTAL_STEPS,
            default_retry: RetryConfig::default(),
            default_max_parallel: DEFAULT_MAX_PARALLEL,
            default_timeout_secs: DEFAULT_TIMEOUT_SECS,
            strict_templates: false,
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Engine settings seeded from a pipeline's workflow defaults
    pub fn from_defaults(defaults: &WorkflowDefaults) -> Self {
        Self::default().merge_defaults(defaults)
    }

    /// Apply whatever the workflow defaults set
    pub fn merge_defaults(mut self, defaults: &WorkflowDefaults) -> Self {
        if let Some(depth) = defaults.max_nesting_depth {
            self.max_nesting_depth = depth;
        }
        if let Some(steps) = defaults.max_total_steps {
            self.max_total_steps = steps;
        }
        if let Some(parallel) = defaults.max_parallel {
            self.default_max_parallel = parallel.max(1);
        }
        if let Some(timeout) = defaults.timeout_secs {
            self.default_timeout_secs = timeout;
        }
        if let Some(retry) = &defaults.retry {
            self.default_retry = retry.clone();
        }
        if let Some(strict) = defaults.strict_templates {
            self.strict_templates = strict;
        }
        self
    }

    pub fn with_max_nesting_depth(mut self, depth: usize) -> Self {
        self.max_nesting_depth = depth;
        self
    }

    pub fn with_max_total_steps(mut self, steps: usize) -> Self {
        self.max_total_steps = steps;
        self
    }

    pub fn with_default_retry(mut self, retry: RetryConfig) -> Self {
        self.default_retry = retry;
        self
    }

    pub fn with_default_max_parallel(mut self, parallel: usize) -> Self {
        self.default_max_parallel = parallel.max(1);
        self
    }

    pub fn with_default_timeout_secs(mut self, secs: u64) -> Self {
        self.default_timeout_secs = secs;
        self
    }

    pub fn with_strict_templates(mut self, strict: bool) -> Self {
        self.strict_templates = strict;
        self
    }

    pub fn with_circuit_breaker(mut self, circuit_breaker: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = circuit_breaker;
        self
    }
}
