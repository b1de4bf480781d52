//! Main execution engine - dispatches steps and composes nested pipelines

use crate::core::condition;
use crate::core::config::EngineConfig;
use crate::core::context::{CancellationFlag, ExecutionContext, RunHandles, VarMap};
use crate::core::pipeline::PipelineDefinition;
use crate::core::state::{ExecutionStatus, StepResult};
use crate::core::step::{
    BatchStep, BatchTask, FallbackAction, NestedPipelineConfig, ProviderStep, RobustStep,
    SessionStep, SetVariableStep, StepDefinition, StepKind,
};
use crate::core::template::{stringify, Scope, TemplateResolver};
use crate::error::{EngineError, PipelineFailure};
use crate::execution::batch::BatchExecutor;
use crate::execution::executor::{StepExecutor, StepOutcome};
use crate::execution::guard::RecursionGuard;
use crate::execution::nested::{extract_outputs, load_pipeline, PipelineRegistry};
use crate::execution::robust::{simplify_prompt, step_signature, AttemptMode, RobustnessController};
use crate::execution::session::{SessionConfig, SessionRegistry};
use crate::persistence::{run_checkpoint_id, CheckpointStore};
use crate::provider::{Provider, ProviderOptions};
use chrono::Utc;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::{json, Map, Value};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Events that can occur during pipeline execution
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionEvent {
    PipelineStarted {
        run_id: Uuid,
        pipeline_id: String,
        depth: usize,
        total_steps: usize,
    },
    StepStarted {
        pipeline_id: String,
        step_name: String,
        kind: &'static str,
        depth: usize,
    },
    StepSkipped {
        pipeline_id: String,
        step_name: String,
        depth: usize,
    },
    StepCompleted {
        pipeline_id: String,
        step_name: String,
        depth: usize,
        duration_ms: u64,
        degraded: bool,
    },
    StepFailed {
        pipeline_id: String,
        step_name: String,
        depth: usize,
        error: String,
        /// The pipeline keeps going because of `continue_on_error`
        continued: bool,
    },
    PipelineCompleted {
        run_id: Uuid,
        pipeline_id: String,
        depth: usize,
        status: ExecutionStatus,
    },
}

/// Type for event handlers
pub type EventHandler = Arc<dyn Fn(ExecutionEvent) + Send + Sync>;

/// Per-run options
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Variables layered over the pipeline's own
    pub variables: VarMap,

    /// Flag a caller can trip to stop the run before its next step
    pub cancellation: Option<CancellationFlag>,
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_variable(mut self, name: impl Into<String>, value: Value) -> Self {
        self.variables.insert(name.into(), value);
        self
    }

    pub fn with_cancellation(mut self, cancellation: CancellationFlag) -> Self {
        self.cancellation = Some(cancellation);
        self
    }
}

/// Outcome of a whole run
#[derive(Debug)]
pub struct RunReport {
    pub run_id: Uuid,
    pub pipeline_id: String,
    pub status: ExecutionStatus,
    /// Root-level results in execution order
    pub results: Vec<StepResult>,
    pub skipped: Vec<String>,
    pub global_vars: VarMap,
    /// Steps counted across the whole execution tree
    pub steps_executed: usize,
    pub duration_ms: u64,
    pub failure: Option<PipelineFailure>,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Completed
    }

    pub fn result(&self, step_name: &str) -> Option<&StepResult> {
        self.results.iter().find(|r| r.step_name == step_name)
    }
}

/// Main pipeline execution engine
pub struct ExecutionEngine<P> {
    executor: StepExecutor<P>,
    config: EngineConfig,
    resolver: TemplateResolver,
    guard: RecursionGuard,
    robustness: RobustnessController,
    registry: PipelineRegistry,
    store: Option<Arc<dyn CheckpointStore>>,
    event_handlers: Arc<Mutex<Vec<EventHandler>>>,
}

impl<P: Provider> ExecutionEngine<P> {
    pub fn new(provider: P) -> Self {
        Self::with_config(provider, EngineConfig::default())
    }

    pub fn with_config(provider: P, config: EngineConfig) -> Self {
        Self {
            executor: StepExecutor::new(provider),
            resolver: TemplateResolver::with_strict(config.strict_templates),
            guard: RecursionGuard::new(),
            robustness: RobustnessController::new(config.circuit_breaker.clone()),
            registry: PipelineRegistry::new(),
            store: None,
            event_handlers: Arc::new(Mutex::new(Vec::new())),
            config,
        }
    }

    /// Attach a checkpoint/output store
    pub fn with_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Make a pipeline available to `registry` sources
    pub fn with_pipeline(mut self, pipeline: PipelineDefinition) -> Self {
        self.register_pipeline(pipeline);
        self
    }

    pub fn register_pipeline(&mut self, pipeline: PipelineDefinition) {
        self.registry.register(pipeline);
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn guard(&self) -> &RecursionGuard {
        &self.guard
    }

    pub fn robustness(&self) -> &RobustnessController {
        &self.robustness
    }

    pub fn provider(&self) -> &P {
        self.executor.provider()
    }

    /// Add an event handler
    pub fn add_event_handler<F>(&self, handler: F)
    where
        F: Fn(ExecutionEvent) + Send + Sync + 'static,
    {
        self.lock_handlers().push(Arc::new(handler));
    }

    /// Emit an event to all handlers
    fn emit_event(&self, event: ExecutionEvent) {
        let handlers: Vec<EventHandler> = self.lock_handlers().clone();
        for handler in handlers {
            handler(event.clone());
        }
    }

    fn lock_handlers(&self) -> std::sync::MutexGuard<'_, Vec<EventHandler>> {
        self.event_handlers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Shared handles for a new run
    pub fn create_run_handles(&self, cancellation: CancellationFlag) -> Arc<RunHandles> {
        let sessions = match &self.store {
            Some(store) => SessionRegistry::with_store(Arc::clone(store)),
            None => SessionRegistry::new(),
        };
        Arc::new(RunHandles::with_parts(
            self.config.max_total_steps,
            cancellation,
            sessions,
        ))
    }

    /// Execute a pipeline from a fresh root context
    pub async fn run(&self, pipeline: &PipelineDefinition, options: RunOptions) -> RunReport {
        let started = Instant::now();
        let handles = self.create_run_handles(options.cancellation.unwrap_or_default());
        let run_id = handles.run_id();

        let mut context = ExecutionContext::root(pipeline.id.clone(), Arc::clone(&handles));
        context.set_source_dir(pipeline.source_dir.clone());
        for (name, value) in pipeline.variables.iter().chain(options.variables.iter()) {
            context.set_global_var(name.clone(), value.clone());
        }

        info!("Starting pipeline execution: {} ({})", pipeline.id, run_id);
        let outcome = self.execute_pipeline(&pipeline.steps, &mut context).await;

        let (status, failure) = match outcome {
            Ok(()) => (ExecutionStatus::Completed, None),
            Err(failure) if failure.error.is_cancellation() => {
                (ExecutionStatus::Cancelled, Some(failure))
            }
            Err(failure) => (ExecutionStatus::Failed, Some(failure)),
        };

        info!("Pipeline execution finished: {} - {:?}", pipeline.id, status);
        RunReport {
            run_id,
            pipeline_id: pipeline.id.clone(),
            status,
            results: context.results().to_vec(),
            skipped: context.skipped().to_vec(),
            global_vars: context.global_vars().clone(),
            steps_executed: handles.step_count(),
            duration_ms: started.elapsed().as_millis() as u64,
            failure,
        }
    }

    /// Execute a step list against a context
    ///
    /// Results are recorded in `context` in declared order. The first
    /// failure that is not tolerated halts the list.
    pub fn execute_pipeline<'a>(
        &'a self,
        steps: &'a [StepDefinition],
        context: &'a mut ExecutionContext,
    ) -> BoxFuture<'a, Result<(), PipelineFailure>> {
        async move {
            let run_id = context.handles().run_id();
            let depth = context.nesting_depth();
            self.emit_event(ExecutionEvent::PipelineStarted {
                run_id,
                pipeline_id: context.pipeline_id().to_string(),
                depth,
                total_steps: steps.len(),
            });

            let outcome = self.execute_steps(steps, context).await;

            let status = match &outcome {
                Ok(()) => ExecutionStatus::Completed,
                Err(failure) if failure.error.is_cancellation() => ExecutionStatus::Cancelled,
                Err(_) => ExecutionStatus::Failed,
            };
            self.emit_event(ExecutionEvent::PipelineCompleted {
                run_id,
                pipeline_id: context.pipeline_id().to_string(),
                depth,
                status,
            });
            outcome
        }
        .boxed()
    }

    async fn execute_steps(
        &self,
        steps: &[StepDefinition],
        context: &mut ExecutionContext,
    ) -> Result<(), PipelineFailure> {
        let depth = context.nesting_depth();

        for step in steps {
            if context.is_cancelled() {
                warn!("Run cancelled before step {}", step.name);
                return Err(Self::failure(context, &step.name, EngineError::Cancelled));
            }

            if let Some(cond) = &step.condition {
                if !condition::evaluate(cond, Scope::new(context)) {
                    info!("Skipping step {} (condition not met)", step.name);
                    context.mark_skipped(&step.name);
                    self.emit_event(ExecutionEvent::StepSkipped {
                        pipeline_id: context.pipeline_id().to_string(),
                        step_name: step.name.clone(),
                        depth,
                    });
                    continue;
                }
            }

            if let Err(e) = context.count_step() {
                error!("Step limit reached at step {}: {}", step.name, e);
                return Err(Self::failure(context, &step.name, e));
            }

            self.emit_event(ExecutionEvent::StepStarted {
                pipeline_id: context.pipeline_id().to_string(),
                step_name: step.name.clone(),
                kind: step.kind.label(),
                depth,
            });
            debug!("Dispatching {} step {}", step.kind.label(), step.name);

            let started_at = Utc::now();
            let started = Instant::now();
            let outcome = self
                .execute_kind(&step.name, &step.kind, context, AttemptMode::Normal)
                .await;
            let duration_ms = started.elapsed().as_millis() as u64;

            match outcome {
                Ok(outcome) => {
                    let degraded = outcome
                        .metadata
                        .get("degraded")
                        .and_then(Value::as_bool)
                        .unwrap_or(false);
                    if step.save_output {
                        self.save_output(&step.name, &outcome.output).await;
                    }
                    let StepOutcome {
                        output,
                        metadata,
                        assignment,
                    } = outcome;
                    context.record(
                        StepResult::success(&step.name, output, started_at, duration_ms)
                            .with_metadata(metadata),
                    );
                    if let Some((name, value)) = assignment {
                        context.set_global_var(name, value);
                    }
                    info!("Step {} completed in {}ms", step.name, duration_ms);
                    self.emit_event(ExecutionEvent::StepCompleted {
                        pipeline_id: context.pipeline_id().to_string(),
                        step_name: step.name.clone(),
                        depth,
                        duration_ms,
                        degraded,
                    });
                }
                Err(e) => {
                    let fatal = e.is_safety_violation() || e.is_cancellation();
                    let continued = step.continue_on_error && !fatal;
                    context.record(
                        StepResult::failure(&step.name, e.to_string(), started_at, duration_ms)
                            .with_metadata(Self::failure_metadata(&step.name, &e)),
                    );
                    self.emit_event(ExecutionEvent::StepFailed {
                        pipeline_id: context.pipeline_id().to_string(),
                        step_name: step.name.clone(),
                        depth,
                        error: e.to_string(),
                        continued,
                    });

                    if continued {
                        warn!("Step {} failed, continuing: {}", step.name, e);
                    } else {
                        error!("Step {} failed: {}", step.name, e);
                        self.checkpoint(context).await;
                        return Err(Self::failure(context, &step.name, e));
                    }
                }
            }

            self.checkpoint(context).await;
        }

        Ok(())
    }

    fn failure(context: &ExecutionContext, step_name: &str, error: EngineError) -> PipelineFailure {
        PipelineFailure {
            pipeline_id: context.pipeline_id().to_string(),
            failing_step: step_name.to_string(),
            pipeline_chain: context.full_chain(),
            error,
        }
    }

    fn failure_metadata(step_name: &str, error: &EngineError) -> Map<String, Value> {
        let mut metadata = Map::new();
        metadata.insert("error_class".to_string(), json!(error.class()));
        match error {
            EngineError::FallbackFailed { history, fallback, .. } => {
                metadata.insert(
                    "error_history".to_string(),
                    serde_json::to_value(history).unwrap_or(Value::Null),
                );
                metadata.insert("fallback_used".to_string(), json!(fallback.to_string()));
            }
            EngineError::NestedPipeline { failure, .. } => {
                metadata.insert("error_chain".to_string(), json!(failure.error_chain()));
                let mut path = vec![step_name.to_string()];
                path.extend(failure.step_path());
                metadata.insert("failing_path".to_string(), json!(path));
                metadata.insert(
                    "pipeline_chain".to_string(),
                    json!(failure.innermost().pipeline_chain),
                );
            }
            _ => {}
        }
        metadata
    }

    /// Dispatch one step kind; never mutates the invoking context
    fn execute_kind<'a>(
        &'a self,
        step_name: &'a str,
        kind: &'a StepKind,
        context: &'a ExecutionContext,
        mode: AttemptMode,
    ) -> BoxFuture<'a, Result<StepOutcome, EngineError>> {
        async move {
            match kind {
                StepKind::Provider(step) => self.run_provider(step_name, step, context, mode).await,
                StepKind::NestedPipeline(nested) => {
                    self.run_nested(step_name, nested, context, None).await
                }
                StepKind::Batch(batch) => self.run_batch(step_name, batch, context).await,
                StepKind::Robust(robust) => self.run_robust(step_name, robust, context).await,
                StepKind::Session(session) => {
                    self.run_session(step_name, session, context, mode).await
                }
                StepKind::SetVariable(set) => self.run_set_variable(set, context),
            }
        }
        .boxed()
    }

    fn resolve_options(
        &self,
        options: &ProviderOptions,
        scope: Scope<'_>,
    ) -> Result<ProviderOptions, EngineError> {
        let mut resolved = options.clone();
        if let Some(system) = &options.system_prompt {
            resolved.system_prompt = Some(self.resolver.resolve_string(system, scope)?);
        }
        if let Some(model) = &options.model {
            resolved.model = Some(self.resolver.resolve_string(model, scope)?);
        }
        Ok(resolved)
    }

    fn timeout_for(&self, options: &ProviderOptions) -> u64 {
        options.timeout_secs.unwrap_or(self.config.default_timeout_secs)
    }

    async fn run_provider(
        &self,
        step_name: &str,
        step: &ProviderStep,
        context: &ExecutionContext,
        mode: AttemptMode,
    ) -> Result<StepOutcome, EngineError> {
        let scope = Scope::new(context);
        let mut prompt = self.resolver.resolve_string(&step.prompt, scope)?;
        if mode == AttemptMode::Simplified {
            prompt = simplify_prompt(&prompt);
        }
        let options = self.resolve_options(&step.options, scope)?;
        let response = self
            .executor
            .call(step_name, &prompt, &options, self.timeout_for(&options))
            .await?;
        Ok(StepOutcome::from_response(response))
    }

    async fn run_session(
        &self,
        step_name: &str,
        step: &SessionStep,
        context: &ExecutionContext,
        mode: AttemptMode,
    ) -> Result<StepOutcome, EngineError> {
        let scope = Scope::new(context);
        let name = self.resolver.resolve_string(&step.session, scope)?;
        if name.trim().is_empty() {
            return Err(EngineError::validation(step_name, "session name resolved to an empty string"));
        }
        let mut prompt = self.resolver.resolve_string(&step.prompt, scope)?;
        if mode == AttemptMode::Simplified {
            prompt = simplify_prompt(&prompt);
        }

        let handle = context
            .handles()
            .sessions()
            .get_or_create(
                &name,
                SessionConfig {
                    checkpoint_frequency: step.checkpoint_frequency,
                    persisted: step.persisted,
                },
            )
            .await;
        debug!(
            "Step {} uses session {} ({}), turn {}",
            step_name, name, handle.session_id, handle.turn_count
        );

        let mut options = self.resolve_options(&step.options, scope)?;
        options.session_id = Some(handle.session_id.clone());
        let response = self
            .executor
            .call(step_name, &prompt, &options, self.timeout_for(&options))
            .await?;

        Ok(StepOutcome::from_response(response)
            .with_meta("session_id", json!(handle.session_id))
            .with_meta("session_name", json!(handle.name))
            .with_meta("turn_count", json!(handle.turn_count)))
    }

    fn run_set_variable(
        &self,
        step: &SetVariableStep,
        context: &ExecutionContext,
    ) -> Result<StepOutcome, EngineError> {
        let value = self.resolver.resolve_value(&step.value, Scope::new(context))?;
        Ok(StepOutcome::new(value.clone()).with_assignment(step.variable.clone(), value))
    }

    async fn run_robust(
        &self,
        step_name: &str,
        step: &RobustStep,
        context: &ExecutionContext,
    ) -> Result<StepOutcome, EngineError> {
        let config = step
            .retry
            .clone()
            .unwrap_or_else(|| self.config.default_retry.clone());
        let inner = step.step.as_ref();
        if config.fallback_action == FallbackAction::SimplifiedPrompt
            && !inner.supports_simplified_prompt()
        {
            return Err(EngineError::validation(
                step_name,
                format!("simplified_prompt cannot reduce a {} step", inner.label()),
            ));
        }
        let signature = step_signature(context.pipeline_id(), step_name);

        let robust = self
            .robustness
            .execute(step_name, &signature, &config, |mode| {
                self.execute_kind(step_name, inner, context, mode)
            })
            .await?;

        let metadata = robust.metadata();
        Ok(robust.outcome.with_metadata(metadata))
    }

    async fn run_nested(
        &self,
        step_name: &str,
        nested: &NestedPipelineConfig,
        parent: &ExecutionContext,
        locals: Option<&Map<String, Value>>,
    ) -> Result<StepOutcome, EngineError> {
        let source = nested
            .pipeline
            .source()
            .map_err(|message| EngineError::validation(step_name, message))?;
        let pipeline = load_pipeline(&source, parent, step_name, &self.registry)?;
        let max_depth = nested.max_depth.unwrap_or(self.config.max_nesting_depth);
        self.guard.check(parent, &pipeline.id, max_depth)?;

        let scope = match locals {
            Some(locals) => Scope::with_locals(parent, locals),
            None => Scope::new(parent),
        };
        let mut inputs = VarMap::new();
        for (name, value) in &pipeline.variables {
            if !(nested.inherit_context && parent.global_var(name).is_some()) {
                inputs.insert(name.clone(), value.clone());
            }
        }
        for (name, template) in &nested.inputs {
            inputs.insert(name.clone(), self.resolver.resolve_value(template, scope)?);
        }

        let mut child = parent.create_child_context(
            pipeline.id.clone(),
            nested.inherit_context,
            inputs,
            max_depth,
        )?;
        if pipeline.source_dir.is_some() {
            child.set_source_dir(pipeline.source_dir.clone());
        }

        let _scope = self.guard.enter(&child);
        info!(
            "Entering nested pipeline {} from {} (depth {})",
            pipeline.id,
            parent.pipeline_id(),
            child.nesting_depth()
        );

        match self.execute_pipeline(&pipeline.steps, &mut child).await {
            Ok(()) => {
                let output = extract_outputs(&child, &nested.outputs)?;
                info!("Nested pipeline {} completed", pipeline.id);
                Ok(StepOutcome::new(output)
                    .with_meta("pipeline_id", json!(pipeline.id))
                    .with_meta("nesting_depth", json!(child.nesting_depth()))
                    .with_meta("nested_steps", json!(child.results().len()))
                    .with_meta("nested_skipped", json!(child.skipped())))
            }
            Err(failure) => {
                warn!(
                    "Nested pipeline {} failed at step {}",
                    pipeline.id, failure.failing_step
                );
                Err(EngineError::NestedPipeline {
                    pipeline_id: pipeline.id.clone(),
                    failure: Box::new(failure),
                })
            }
        }
    }

    async fn run_batch(
        &self,
        step_name: &str,
        step: &BatchStep,
        context: &ExecutionContext,
    ) -> Result<StepOutcome, EngineError> {
        let tasks = self.batch_tasks(step_name, step, context)?;
        let config = step.config(self.config.default_max_parallel);

        let report = BatchExecutor::execute(
            &tasks,
            config,
            context.handles().cancellation(),
            |task| self.run_batch_task(step_name, step, context, task),
        )
        .await?;

        Ok(StepOutcome::new(report.to_output()).with_metadata(report.metadata()))
    }

    /// Declared tasks, or one task per element of `tasks_from`
    fn batch_tasks(
        &self,
        step_name: &str,
        step: &BatchStep,
        context: &ExecutionContext,
    ) -> Result<Vec<BatchTask>, EngineError> {
        let mut tasks = step.tasks.clone();
        if let Some(template) = &step.tasks_from {
            let items = match self.resolver.resolve(template, context)? {
                Value::Array(items) => items,
                other => {
                    return Err(EngineError::validation(
                        step_name,
                        format!("tasks_from must resolve to an array, got {}", other),
                    ))
                }
            };
            let offset = tasks.len();
            tasks.extend(items.into_iter().enumerate().map(|(i, item)| {
                let id = item
                    .get("id")
                    .map(stringify)
                    .unwrap_or_else(|| format!("task_{}", offset + i));
                BatchTask::new(id, item)
            }));
        }
        Ok(tasks)
    }

    async fn run_batch_task(
        &self,
        step_name: &str,
        step: &BatchStep,
        context: &ExecutionContext,
        task: BatchTask,
    ) -> Result<Value, EngineError> {
        let payload = self.resolver.resolve_value(&task.payload, Scope::new(context))?;
        let mut locals = Map::new();
        locals.insert(
            "task".to_string(),
            json!({"id": task.id, "payload": payload}),
        );

        if let Some(nested) = &step.pipeline {
            let outcome = self
                .run_nested(step_name, nested, context, Some(&locals))
                .await?;
            return Ok(outcome.output);
        }

        let scope = Scope::with_locals(context, &locals);
        let prompt = match (&step.prompt, &payload) {
            (Some(template), _) => self.resolver.resolve_string(template, scope)?,
            (None, Value::String(text)) => text.clone(),
            (None, other) => match other.get("prompt") {
                Some(prompt) => stringify(prompt),
                None => {
                    return Err(EngineError::validation(
                        step_name,
                        format!("task '{}' has no prompt", task.id),
                    ))
                }
            },
        };

        let options = self.resolve_options(&step.options, scope)?;
        let response = self
            .executor
            .call(
                &format!("{}[{}]", step_name, task.id),
                &prompt,
                &options,
                self.timeout_for(&options),
            )
            .await?;
        Ok(response.output)
    }

    async fn save_output(&self, step_name: &str, output: &Value) {
        match &self.store {
            Some(store) => {
                if let Err(e) = store.write_output(step_name, output).await {
                    warn!("Failed to save output of step {}: {:#}", step_name, e);
                }
            }
            None => debug!("No output store attached; output of {} not saved", step_name),
        }
    }

    /// Persist a run snapshot after each root-level step
    async fn checkpoint(&self, context: &ExecutionContext) {
        if context.nesting_depth() != 0 {
            return;
        }
        let Some(store) = &self.store else {
            return;
        };
        let id = run_checkpoint_id(context.handles().run_id());
        if let Err(e) = store.persist(&id, &context.snapshot()).await {
            warn!("Failed to checkpoint run {}: {:#}", id, e);
        }
    }
}
