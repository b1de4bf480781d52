//! Step domain model

use crate::provider::{ErrorClass, ProviderOptions};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

/// A single declared step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Unique within its step list
    pub name: String,

    /// Optional step description
    #[serde(default)]
    pub description: Option<String>,

    /// Type-specific configuration, selected by the `type` key
    #[serde(flatten)]
    pub kind: StepKind,

    /// Template evaluated before the step runs; false skips it
    #[serde(default)]
    pub condition: Option<String>,

    /// Record a failure and keep going instead of halting the pipeline
    #[serde(default)]
    pub continue_on_error: bool,

    /// Write the step output through the output store
    #[serde(default)]
    pub save_output: bool,
}

impl StepDefinition {
    pub fn new(name: impl Into<String>, kind: StepKind) -> Self {
        Self {
            name: name.into(),
            description: None,
            kind,
            condition: None,
            continue_on_error: false,
            save_output: false,
        }
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    pub fn with_continue_on_error(mut self, continue_on_error: bool) -> Self {
        self.continue_on_error = continue_on_error;
        self
    }

    pub fn with_save_output(mut self, save_output: bool) -> Self {
        self.save_output = save_output;
        self
    }
}

/// Closed set of step kinds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    /// One provider call
    Provider(ProviderStep),
    /// A whole pipeline executed as one step
    NestedPipeline(NestedPipelineConfig),
    /// Independent sub-tasks with bounded parallelism
    Batch(BatchStep),
    /// Retry, fallback and circuit breaking around an inner step
    Robust(RobustStep),
    /// Provider call bound to a named conversation session
    Session(SessionStep),
    /// Assign a variable from a resolved template
    SetVariable(SetVariableStep),
}

impl StepKind {
    /// Short label used in logs and events
    pub fn label(&self) -> &'static str {
        match self {
            StepKind::Provider(_) => "provider",
            StepKind::NestedPipeline(_) => "nested_pipeline",
            StepKind::Batch(_) => "batch",
            StepKind::Robust(_) => "robust",
            StepKind::Session(_) => "session",
            StepKind::SetVariable(_) => "set_variable",
        }
    }

    /// Whether a `simplified_prompt` fallback can reduce this step's request
    pub fn supports_simplified_prompt(&self) -> bool {
        matches!(self, StepKind::Provider(_) | StepKind::Session(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderStep {
    /// Prompt template
    pub prompt: String,

    #[serde(default)]
    pub options: ProviderOptions,
}

impl ProviderStep {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            options: ProviderOptions::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetVariableStep {
    pub variable: String,
    /// Resolved with type preservation; strings inside objects are resolved too
    pub value: Value,
}

fn default_checkpoint_frequency() -> u32 {
    5
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStep {
    /// Session name (template)
    pub session: String,

    pub prompt: String,

    /// Persist the session handle every N turns
    #[serde(default = "default_checkpoint_frequency")]
    pub checkpoint_frequency: u32,

    /// Try to restore the handle from the checkpoint store on first use
    #[serde(default)]
    pub persisted: bool,

    #[serde(default)]
    pub options: ProviderOptions,
}

impl SessionStep {
    pub fn new(session: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            session: session.into(),
            prompt: prompt.into(),
            checkpoint_frequency: default_checkpoint_frequency(),
            persisted: false,
            options: ProviderOptions::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RobustStep {
    /// Falls back to the engine's default retry config
    #[serde(default)]
    pub retry: Option<RetryConfig>,

    /// The step being protected
    pub step: Box<StepKind>,
}

/// How the wait between attempts grows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// delay = base
    Fixed,
    /// delay = base * attempt
    Linear,
    /// delay = base * 2^(attempt - 1)
    Exponential,
}

impl BackoffStrategy {
    /// Delay after the given failed attempt (1-based)
    pub fn delay(&self, attempt: u32, base_delay_ms: u64) -> Duration {
        let attempt = attempt.max(1);
        let ms = match self {
            BackoffStrategy::Fixed => base_delay_ms,
            BackoffStrategy::Linear => base_delay_ms.saturating_mul(u64::from(attempt)),
            BackoffStrategy::Exponential => {
                base_delay_ms.saturating_mul(2u64.saturating_pow(attempt - 1))
            }
        };
        Duration::from_millis(ms)
    }
}

/// What to do once retries are exhausted or a terminal error occurs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackAction {
    /// `{degraded: true, partial: null, error}`; failed attempts leave no
    /// partial output behind
    GracefulDegradation,
    CachedResponse,
    /// One extra attempt with a truncated prompt; provider and session steps only
    SimplifiedPrompt,
    EmergencyResponse,
}

impl std::fmt::Display for FallbackAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FallbackAction::GracefulDegradation => "graceful_degradation",
            FallbackAction::CachedResponse => "cached_response",
            FallbackAction::SimplifiedPrompt => "simplified_prompt",
            FallbackAction::EmergencyResponse => "emergency_response",
        };
        f.write_str(name)
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff() -> BackoffStrategy {
    BackoffStrategy::Exponential
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_retry_conditions() -> Vec<ErrorClass> {
    vec![ErrorClass::Timeout, ErrorClass::RateLimit, ErrorClass::Transient]
}

fn default_fallback() -> FallbackAction {
    FallbackAction::GracefulDegradation
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_backoff")]
    pub backoff_strategy: BackoffStrategy,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Failure classes worth retrying
    #[serde(default = "default_retry_conditions")]
    pub retry_conditions: Vec<ErrorClass>,

    #[serde(default = "default_fallback")]
    pub fallback_action: FallbackAction,

    /// Value returned by `emergency_response`; a fixed notice when unset
    #[serde(default)]
    pub emergency_response: Option<Value>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_strategy: default_backoff(),
            base_delay_ms: default_base_delay_ms(),
            retry_conditions: default_retry_conditions(),
            fallback_action: default_fallback(),
            emergency_response: None,
        }
    }
}

impl RetryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_backoff(mut self, strategy: BackoffStrategy, base_delay_ms: u64) -> Self {
        self.backoff_strategy = strategy;
        self.base_delay_ms = base_delay_ms;
        self
    }

    pub fn with_retry_conditions(mut self, conditions: Vec<ErrorClass>) -> Self {
        self.retry_conditions = conditions;
        self
    }

    pub fn with_fallback(mut self, action: FallbackAction) -> Self {
        self.fallback_action = action;
        self
    }

    pub fn should_retry(&self, class: ErrorClass) -> bool {
        class != ErrorClass::Terminal && self.retry_conditions.contains(&class)
    }
}

/// One unit of work inside a batch step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchTask {
    pub id: String,

    /// Templated payload; a string is used as the prompt, an object may carry
    /// a `prompt` field
    #[serde(default)]
    pub payload: Value,
}

impl BatchTask {
    pub fn new(id: impl Into<String>, payload: Value) -> Self {
        Self {
            id: id.into(),
            payload,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchStep {
    #[serde(default)]
    pub tasks: Vec<BatchTask>,

    /// Template resolving to an array; each element becomes a task
    #[serde(default)]
    pub tasks_from: Option<String>,

    /// Prompt template applied per task, with `task.id` / `task.payload` in scope
    #[serde(default)]
    pub prompt: Option<String>,

    /// Run every task as this nested pipeline instead of a provider call
    #[serde(default)]
    pub pipeline: Option<Box<NestedPipelineConfig>>,

    #[serde(default)]
    pub options: ProviderOptions,

    /// Falls back to the engine default when unset
    #[serde(default)]
    pub max_parallel: Option<usize>,

    /// 0 disables the per-task timeout
    #[serde(default)]
    pub timeout_per_task_ms: u64,

    #[serde(default)]
    pub consolidate_results: bool,
}

impl BatchStep {
    pub fn new(tasks: Vec<BatchTask>) -> Self {
        Self {
            tasks,
            tasks_from: None,
            prompt: None,
            pipeline: None,
            options: ProviderOptions::default(),
            max_parallel: None,
            timeout_per_task_ms: 0,
            consolidate_results: false,
        }
    }

    pub fn config(&self, default_max_parallel: usize) -> BatchConfig {
        BatchConfig {
            max_parallel: self.max_parallel.unwrap_or(default_max_parallel).max(1),
            timeout_per_task_ms: self.timeout_per_task_ms,
            consolidate_results: self.consolidate_results,
        }
    }
}

/// Execution settings for the batch executor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchConfig {
    pub max_parallel: usize,
    pub timeout_per_task_ms: u64,
    pub consolidate_results: bool,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_parallel: 4,
            timeout_per_task_ms: 0,
            consolidate_results: false,
        }
    }
}

/// Where a nested pipeline comes from
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineSource {
    Inline(InlinePipeline),
    File(String),
    Registry(String),
}

impl PipelineSource {
    /// Human readable reference used in errors
    pub fn describe(&self) -> String {
        match self {
            PipelineSource::Inline(inline) => {
                format!("inline:{}", inline.name.as_deref().unwrap_or("<anonymous>"))
            }
            PipelineSource::File(path) => format!("file:{}", path),
            PipelineSource::Registry(name) => format!("registry:{}", name),
        }
    }
}

/// Pipeline declared directly inside a step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InlinePipeline {
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub variables: HashMap<String, Value>,

    pub steps: Vec<StepDefinition>,
}

/// YAML shape of a pipeline source: exactly one of the fields is set
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineSourceConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline: Option<InlinePipeline>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry: Option<String>,
}

impl PipelineSourceConfig {
    pub fn inline(pipeline: InlinePipeline) -> Self {
        Self {
            inline: Some(pipeline),
            ..Default::default()
        }
    }

    pub fn file(path: impl Into<String>) -> Self {
        Self {
            file: Some(path.into()),
            ..Default::default()
        }
    }

    pub fn registry(name: impl Into<String>) -> Self {
        Self {
            registry: Some(name.into()),
            ..Default::default()
        }
    }

    /// Convert to the domain enum
    pub fn source(&self) -> Result<PipelineSource, String> {
        match (&self.inline, &self.file, &self.registry) {
            (Some(inline), None, None) => Ok(PipelineSource::Inline(inline.clone())),
            (None, Some(path), None) => Ok(PipelineSource::File(path.clone())),
            (None, None, Some(name)) => Ok(PipelineSource::Registry(name.clone())),
            (None, None, None) => Err("pipeline source needs one of inline, file or registry".to_string()),
            _ => Err("pipeline source must set only one of inline, file or registry".to_string()),
        }
    }
}

/// Value extracted from a finished nested pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "OutputSpecConfig")]
pub struct OutputSpec {
    /// `<step>` or `<step>.<path>` (a `steps.<step>.result.` prefix is accepted)
    pub path: String,

    /// Key in the step output; defaults to the last path segment
    #[serde(default, rename = "as", skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,

    #[serde(default)]
    pub optional: bool,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OutputSpecConfig {
    Name(String),
    Full {
        path: String,
        #[serde(default, rename = "as")]
        alias: Option<String>,
        #[serde(default)]
        optional: bool,
    },
}

impl From<OutputSpecConfig> for OutputSpec {
    fn from(config: OutputSpecConfig) -> Self {
        match config {
            OutputSpecConfig::Name(path) => OutputSpec::new(path),
            OutputSpecConfig::Full {
                path,
                alias,
                optional,
            } => OutputSpec {
                path,
                alias,
                optional,
            },
        }
    }
}

impl OutputSpec {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            alias: None,
            optional: false,
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    /// Step name and the path inside its result
    pub fn target(&self) -> (String, Vec<String>) {
        let mut segments: Vec<String> = self.path.split('.').map(str::to_string).collect();
        if segments.first().map(String::as_str) == Some("steps") && segments.len() > 1 {
            segments.remove(0);
        }
        let step = segments.remove(0);
        if segments.first().map(String::as_str) == Some("result") {
            segments.remove(0);
        }
        (step, segments)
    }

    /// Output key for the extracted value
    pub fn key(&self) -> String {
        if let Some(alias) = &self.alias {
            return alias.clone();
        }
        let (step, path) = self.target();
        path.last().cloned().unwrap_or(step)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NestedPipelineConfig {
    pub pipeline: PipelineSourceConfig,

    /// Child variable name -> template resolved in the parent
    #[serde(default)]
    pub inputs: BTreeMap<String, Value>,

    /// Values to lift out of the child; all results when empty
    #[serde(default)]
    pub outputs: Vec<OutputSpec>,

    /// Share the parent's variables instead of starting isolated
    #[serde(default)]
    pub inherit_context: bool,

    /// Overrides the engine's maximum nesting depth
    #[serde(default)]
    pub max_depth: Option<usize>,
}

impl NestedPipelineConfig {
    pub fn new(pipeline: PipelineSourceConfig) -> Self {
        Self {
            pipeline,
            inputs: BTreeMap::new(),
            outputs: Vec::new(),
            inherit_context: false,
            max_depth: None,
        }
    }

    pub fn with_input(mut self, name: impl Into<String>, template: Value) -> Self {
        self.inputs.insert(name.into(), template);
        self
    }

    pub fn with_output(mut self, output: OutputSpec) -> Self {
        self.outputs.push(output);
        self
    }

    pub fn with_inherit_context(mut self, inherit: bool) -> Self {
        self.inherit_context = inherit;
        self
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = Some(max_depth);
        self
    }
}
