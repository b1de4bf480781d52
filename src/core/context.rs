//! Execution context - per-invocation state of a (possibly nested) pipeline run

use crate::core::state::StepResult;
use crate::error::EngineError;
use crate::execution::session::SessionRegistry;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Default ceiling on steps executed across a whole execution tree
pub const DEFAULT_MAX_TOTAL_STEPS: usize = 1000;

/// Default maximum nesting depth of pipelines
pub const DEFAULT_MAX_NESTING_DEPTH: usize = 10;

/// Variables visible to templates through `global_vars.<name>`
pub type VarMap = HashMap<String, Value>;

/// Cooperative cancellation signal shared by every context of a run
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Handles owned by the root invocation and referenced by every descendant
#[derive(Debug)]
pub struct RunHandles {
    run_id: Uuid,
    step_count: AtomicUsize,
    max_total_steps: usize,
    cancellation: CancellationFlag,
    sessions: SessionRegistry,
}

impl RunHandles {
    pub fn new(max_total_steps: usize) -> Self {
        Self::with_parts(max_total_steps, CancellationFlag::new(), SessionRegistry::new())
    }

    pub fn with_parts(
        max_total_steps: usize,
        cancellation: CancellationFlag,
        sessions: SessionRegistry,
    ) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            step_count: AtomicUsize::new(0),
            max_total_steps,
            cancellation,
            sessions,
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Steps counted so far across the whole tree
    pub fn step_count(&self) -> usize {
        self.step_count.load(Ordering::SeqCst)
    }

    pub fn max_total_steps(&self) -> usize {
        self.max_total_steps
    }

    /// Count one more step; `None` once the ceiling is reached.
    ///
    /// The counter never moves past the ceiling, even under concurrent callers.
    pub fn try_count_step(&self) -> Option<usize> {
        self.step_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < self.max_total_steps).then_some(n + 1)
            })
            .ok()
            .map(|previous| previous + 1)
    }

    pub fn cancellation(&self) -> &CancellationFlag {
        &self.cancellation
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }
}

/// State for one pipeline invocation
///
/// Contexts form a strict tree: a child only knows the ids of its ancestors
/// and parents never hold references to children.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pipeline_id: String,

    /// Results in execution order
    results: Vec<StepResult>,

    /// step name -> position in `results`
    result_index: HashMap<String, usize>,

    /// Steps whose condition evaluated to false
    skipped: Vec<String>,

    /// Shared with the parent when inherited; copied on first write
    global_vars: Arc<VarMap>,

    /// Invocation metadata exposed as `workflow.<path>`
    workflow: Map<String, Value>,

    /// Pipeline ids of all ancestors, root first
    ancestors: Vec<String>,

    nesting_depth: usize,

    /// Directory used to resolve file-based nested pipelines
    source_dir: Option<PathBuf>,

    handles: Arc<RunHandles>,
}

/// Create a root context with fresh run handles
pub fn create_root_context(pipeline_id: impl Into<String>) -> ExecutionContext {
    ExecutionContext::root(
        pipeline_id,
        Arc::new(RunHandles::new(DEFAULT_MAX_TOTAL_STEPS)),
    )
}

impl ExecutionContext {
    /// Create the root context of a run
    pub fn root(pipeline_id: impl Into<String>, handles: Arc<RunHandles>) -> Self {
        let pipeline_id = pipeline_id.into();
        let workflow = Self::workflow_view(&pipeline_id, 0, &[], &handles, Map::new());
        Self {
            pipeline_id,
            results: Vec::new(),
            result_index: HashMap::new(),
            skipped: Vec::new(),
            global_vars: Arc::new(VarMap::new()),
            workflow,
            ancestors: Vec::new(),
            nesting_depth: 0,
            source_dir: None,
            handles,
        }
    }

    /// Create the context of a nested invocation
    ///
    /// With `inherit` the child shares this context's variables (read-only,
    /// copy-on-write) and `inputs` are layered on top; otherwise it starts
    /// isolated with only `inputs`. Results always start empty.
    pub fn create_child_context(
        &self,
        pipeline_id: impl Into<String>,
        inherit: bool,
        inputs: VarMap,
        max_depth: usize,
    ) -> Result<Self, EngineError> {
        let pipeline_id = pipeline_id.into();
        let depth = self.nesting_depth + 1;
        let mut ancestors = self.ancestors.clone();
        ancestors.push(self.pipeline_id.clone());

        if depth > max_depth {
            let mut chain = ancestors;
            chain.push(pipeline_id);
            return Err(EngineError::DepthExceeded {
                depth,
                max_depth,
                chain,
            });
        }

        let input_view: Map<String, Value> = inputs
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let global_vars = if inherit {
            let mut shared = Arc::clone(&self.global_vars);
            if !inputs.is_empty() {
                Arc::make_mut(&mut shared).extend(inputs);
            }
            shared
        } else {
            Arc::new(inputs)
        };

        let workflow =
            Self::workflow_view(&pipeline_id, depth, &ancestors, &self.handles, input_view);

        Ok(Self {
            pipeline_id,
            results: Vec::new(),
            result_index: HashMap::new(),
            skipped: Vec::new(),
            global_vars,
            workflow,
            ancestors,
            nesting_depth: depth,
            source_dir: self.source_dir.clone(),
            handles: Arc::clone(&self.handles),
        })
    }

    fn workflow_view(
        pipeline_id: &str,
        depth: usize,
        ancestors: &[String],
        handles: &RunHandles,
        inputs: Map<String, Value>,
    ) -> Map<String, Value> {
        let mut view = Map::new();
        view.insert("id".to_string(), Value::String(pipeline_id.to_string()));
        view.insert("depth".to_string(), Value::from(depth));
        view.insert("run_id".to_string(), Value::String(handles.run_id().to_string()));
        view.insert(
            "chain".to_string(),
            Value::Array(ancestors.iter().cloned().map(Value::String).collect()),
        );
        view.insert("inputs".to_string(), Value::Object(inputs));
        view
    }

    pub fn pipeline_id(&self) -> &str {
        &self.pipeline_id
    }

    pub fn nesting_depth(&self) -> usize {
        self.nesting_depth
    }

    /// Pipeline ids of all ancestors, root first
    pub fn execution_chain(&self) -> &[String] {
        &self.ancestors
    }

    /// Ancestors followed by this invocation's own id
    pub fn full_chain(&self) -> Vec<String> {
        let mut chain = self.ancestors.clone();
        chain.push(self.pipeline_id.clone());
        chain
    }

    pub fn handles(&self) -> &Arc<RunHandles> {
        &self.handles
    }

    pub fn is_cancelled(&self) -> bool {
        self.handles.cancellation().is_cancelled()
    }

    /// Count a step against the run-wide ceiling
    pub fn count_step(&self) -> Result<usize, EngineError> {
        self.handles
            .try_count_step()
            .ok_or_else(|| EngineError::ResourceExceeded {
                limit: self.handles.max_total_steps(),
                chain: self.full_chain(),
            })
    }

    pub fn source_dir(&self) -> Option<&Path> {
        self.source_dir.as_deref()
    }

    pub fn set_source_dir(&mut self, dir: Option<PathBuf>) {
        self.source_dir = dir;
    }

    /// Record a step result; a later result for the same name replaces the
    /// earlier one in place
    pub fn record(&mut self, result: StepResult) {
        match self.result_index.get(&result.step_name) {
            Some(&idx) => self.results[idx] = result,
            None => {
                self.result_index
                    .insert(result.step_name.clone(), self.results.len());
                self.results.push(result);
            }
        }
    }

    pub fn result(&self, step_name: &str) -> Option<&StepResult> {
        self.result_index
            .get(step_name)
            .map(|&idx| &self.results[idx])
    }

    /// Results in execution order
    pub fn results(&self) -> &[StepResult] {
        &self.results
    }

    pub fn mark_skipped(&mut self, step_name: &str) {
        self.skipped.push(step_name.to_string());
    }

    pub fn skipped(&self) -> &[String] {
        &self.skipped
    }

    pub fn global_var(&self, name: &str) -> Option<&Value> {
        self.global_vars.get(name)
    }

    pub fn global_vars(&self) -> &VarMap {
        &self.global_vars
    }

    /// Set a variable; never visible to a parent that shares the map
    pub fn set_global_var(&mut self, name: impl Into<String>, value: Value) {
        Arc::make_mut(&mut self.global_vars).insert(name.into(), value);
    }

    /// True when both contexts read the same variable map
    pub fn shares_globals_with(&self, other: &ExecutionContext) -> bool {
        Arc::ptr_eq(&self.global_vars, &other.global_vars)
    }

    pub fn workflow(&self) -> &Map<String, Value> {
        &self.workflow
    }

    pub fn set_workflow_field(&mut self, key: impl Into<String>, value: Value) {
        self.workflow.insert(key.into(), value);
    }

    /// Serializable view of the context used for checkpoints
    pub fn snapshot(&self) -> Value {
        serde_json::json!({
            "pipeline_id": self.pipeline_id,
            "run_id": self.handles.run_id().to_string(),
            "nesting_depth": self.nesting_depth,
            "execution_chain": self.ancestors,
            "step_count_total": self.handles.step_count(),
            "global_vars": self.global_vars.as_ref(),
            "results": self.results,
            "skipped": self.skipped,
        })
    }
}
