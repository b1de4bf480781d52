//! Nested pipeline composition: source loading and output extraction

use crate::core::context::ExecutionContext;
use crate::core::pipeline::PipelineDefinition;
use crate::core::step::{OutputSpec, PipelineSource};
use crate::core::template::navigate;
use crate::error::EngineError;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Pipelines addressable by `registry` sources
#[derive(Debug, Clone, Default)]
pub struct PipelineRegistry {
    pipelines: HashMap<String, Arc<PipelineDefinition>>,
}

impl PipelineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pipeline under its id, replacing any previous one
    pub fn register(&mut self, pipeline: PipelineDefinition) {
        self.pipelines
            .insert(pipeline.id.clone(), Arc::new(pipeline));
    }

    pub fn get(&self, name: &str) -> Option<Arc<PipelineDefinition>> {
        self.pipelines.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.pipelines.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.pipelines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pipelines.is_empty()
    }
}

/// Turn a source into a runnable pipeline
///
/// Inline pipelines are named after their declared name or
/// `<parent>/<step>`; file paths resolve against the including pipeline's
/// directory.
pub fn load_pipeline(
    source: &PipelineSource,
    parent: &ExecutionContext,
    step_name: &str,
    registry: &PipelineRegistry,
) -> Result<Arc<PipelineDefinition>, EngineError> {
    match source {
        PipelineSource::Inline(inline) => Ok(Arc::new(PipelineDefinition::from_inline(
            inline,
            format!("{}/{}", parent.pipeline_id(), step_name),
            parent.source_dir(),
        ))),
        PipelineSource::File(path) => {
            let full_path = resolve_path(parent.source_dir(), path);
            debug!("Loading nested pipeline from {}", full_path.display());
            PipelineDefinition::from_file(&full_path)
                .map(Arc::new)
                .map_err(|e| EngineError::PipelineSource {
                    source_ref: source.describe(),
                    message: format!("{:#}", e),
                })
        }
        PipelineSource::Registry(name) => {
            registry
                .get(name)
                .ok_or_else(|| EngineError::PipelineSource {
                    source_ref: source.describe(),
                    message: format!(
                        "no pipeline named '{}' is registered (known: {})",
                        name,
                        registry.names().join(", ")
                    ),
                })
        }
    }
}

fn resolve_path(base: Option<&Path>, path: &str) -> PathBuf {
    let path = Path::new(path);
    match base {
        Some(base) if path.is_relative() => base.join(path),
        _ => path.to_path_buf(),
    }
}

/// Build the nested step's output from a finished child context
pub fn extract_outputs(
    child: &ExecutionContext,
    outputs: &[OutputSpec],
) -> Result<Value, EngineError> {
    let mut extracted = Map::new();

    if outputs.is_empty() {
        for result in child.results() {
            extracted.insert(result.step_name.clone(), result.output.clone());
        }
        return Ok(Value::Object(extracted));
    }

    for spec in outputs {
        let (step, path) = spec.target();
        let value = child
            .result(&step)
            .and_then(|result| navigate(&result.output, &path))
            .cloned();

        let value = match value {
            Some(value) => value,
            None if spec.optional => Value::Null,
            None => {
                return Err(EngineError::OutputNotFound {
                    pipeline_id: child.pipeline_id().to_string(),
                    path: spec.path.clone(),
                })
            }
        };
        extracted.insert(spec.key(), value);
    }

    Ok(Value::Object(extracted))
}
