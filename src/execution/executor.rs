//! Step executor - runs provider calls for individual steps

use crate::error::EngineError;
use crate::provider::{Provider, ProviderOptions, ProviderResponse};
use serde_json::{json, Map, Value};
use tokio::time::{timeout, Duration};
use tracing::{debug, error, info};

/// What a step handler produced
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutcome {
    /// Recorded as the step result
    pub output: Value,

    /// Merged into the step result metadata
    pub metadata: Map<String, Value>,

    /// Variable to set in the invoking context once the step is recorded
    pub assignment: Option<(String, Value)>,
}

impl StepOutcome {
    pub fn new(output: Value) -> Self {
        Self {
            output,
            metadata: Map::new(),
            assignment: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata.extend(metadata);
        self
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn with_assignment(mut self, name: impl Into<String>, value: Value) -> Self {
        self.assignment = Some((name.into(), value));
        self
    }

    /// Outcome of a provider call
    pub fn from_response(response: ProviderResponse) -> Self {
        let outcome = Self::new(response.output);
        match response.usage {
            Some(usage) => outcome.with_meta(
                "usage",
                json!({
                    "prompt_tokens": usage.prompt_tokens,
                    "completion_tokens": usage.completion_tokens,
                    "total_tokens": usage.total_tokens,
                }),
            ),
            None => outcome,
        }
    }
}

/// Executes provider calls with a timeout
pub struct StepExecutor<P> {
    provider: P,
}

impl<P: Provider> StepExecutor<P> {
    pub fn new(provider: P) -> Self {
        Self { provider }
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Call the provider with a fully resolved prompt
    pub async fn call(
        &self,
        step_name: &str,
        prompt: &str,
        options: &ProviderOptions,
        timeout_secs: u64,
    ) -> Result<ProviderResponse, EngineError> {
        info!("Executing step: {}", step_name);
        debug!("Effective prompt for step {}: {}", step_name, prompt);

        match timeout(
            Duration::from_secs(timeout_secs),
            self.provider.execute(prompt, options),
        )
        .await
        {
            Ok(Ok(response)) => {
                debug!("Provider response for step {}: {}", step_name, response.content);
                Ok(response)
            }
            Ok(Err(e)) => {
                error!("Provider error for step {}: {}", step_name, e);
                Err(e.into())
            }
            Err(_) => {
                error!("Timeout for step {} after {}s", step_name, timeout_secs);
                Err(EngineError::StepTimeout(timeout_secs))
            }
        }
    }
}
