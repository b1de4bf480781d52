//! Test utilities shared by the scenario tests

use async_trait::async_trait;
use pipewright::core::config::PipelineConfig;
use pipewright::core::{EngineConfig, ExecutionStatus, PipelineDefinition};
use pipewright::execution::{ExecutionEngine, RunOptions, RunReport};
use pipewright::provider::{Provider, ProviderError, ProviderOptions, ProviderResponse};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// One scripted provider reply
#[derive(Debug, Clone)]
pub enum Reply {
    Text(String),
    Json(Value),
    Fail(ProviderError),
}

impl Reply {
    pub fn text(text: impl Into<String>) -> Self {
        Reply::Text(text.into())
    }

    fn into_result(self) -> Result<ProviderResponse, ProviderError> {
        match self {
            Reply::Text(text) => Ok(ProviderResponse::from_text(text)),
            Reply::Json(value) => Ok(ProviderResponse::structured(value)),
            Reply::Fail(error) => Err(error),
        }
    }
}

struct Rule {
    pattern: String,
    replies: VecDeque<Reply>,
    delay: Option<Duration>,
}

/// A provider call as the mock saw it
#[derive(Debug, Clone)]
pub struct Call {
    pub prompt: String,
    pub options: ProviderOptions,
}

/// Provider returning scripted replies selected by prompt substring
///
/// The first rule whose pattern occurs in the prompt answers. A rule's last
/// reply repeats once the earlier ones are used up. Unmatched prompts are
/// echoed back as `echo: <prompt>`.
#[derive(Default)]
pub struct MockProvider {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<Call>>,
    default_delay: Option<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay applied to every call without a rule-specific delay
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.default_delay = Some(delay);
        self
    }

    pub fn on(self, pattern: &str, reply: Reply) -> Self {
        self.on_sequence(pattern, vec![reply])
    }

    pub fn on_sequence(self, pattern: &str, replies: Vec<Reply>) -> Self {
        self.push_rule(pattern, replies, None)
    }

    pub fn on_delayed(self, pattern: &str, delay: Duration, reply: Reply) -> Self {
        self.push_rule(pattern, vec![reply], Some(delay))
    }

    fn push_rule(self, pattern: &str, replies: Vec<Reply>, delay: Option<Duration>) -> Self {
        self.rules
            .lock()
            .unwrap()
            .push(Rule {
                pattern: pattern.to_string(),
                replies: replies.into(),
                delay,
            });
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn prompts(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.prompt).collect()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Number of calls whose prompt contains `pattern`
    pub fn calls_matching(&self, pattern: &str) -> usize {
        self.prompts().iter().filter(|p| p.contains(pattern)).count()
    }

    /// Highest number of calls observed in flight at once
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn next_reply(&self, prompt: &str) -> (Option<Reply>, Option<Duration>) {
        let mut rules = self.rules.lock().unwrap();
        match rules.iter_mut().find(|r| prompt.contains(&r.pattern)) {
            Some(rule) => {
                let reply = if rule.replies.len() > 1 {
                    rule.replies.pop_front()
                } else {
                    rule.replies.front().cloned()
                };
                (reply, rule.delay.or(self.default_delay))
            }
            None => (None, self.default_delay),
        }
    }
}

#[async_trait]
impl Provider for MockProvider {
    async fn execute(
        &self,
        prompt: &str,
        options: &ProviderOptions,
    ) -> Result<ProviderResponse, ProviderError> {
        self.calls.lock().unwrap().push(Call {
            prompt: prompt.to_string(),
            options: options.clone(),
        });
        let (reply, delay) = self.next_reply(prompt);

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match reply {
            Some(reply) => reply.into_result(),
            None => Ok(ProviderResponse::from_text(format!("echo: {}", prompt))),
        }
    }
}

/// Parse a pipeline from YAML
pub fn pipeline_from_yaml(yaml: &str) -> PipelineDefinition {
    PipelineConfig::from_yaml(yaml)
        .expect("Should parse YAML")
        .to_pipeline(None)
}

/// Engine over a shared mock so tests can inspect calls afterwards
pub fn engine_with(provider: &Arc<MockProvider>) -> ExecutionEngine<Arc<MockProvider>> {
    ExecutionEngine::new(Arc::clone(provider))
}

pub fn engine_with_config(
    provider: &Arc<MockProvider>,
    config: EngineConfig,
) -> ExecutionEngine<Arc<MockProvider>> {
    ExecutionEngine::with_config(Arc::clone(provider), config)
}

/// Run a YAML pipeline against a mock provider
pub async fn run_yaml(yaml: &str, provider: &Arc<MockProvider>) -> RunReport {
    engine_with(provider)
        .run(&pipeline_from_yaml(yaml), RunOptions::new())
        .await
}

pub fn assert_completed(report: &RunReport) {
    assert_eq!(
        report.status,
        ExecutionStatus::Completed,
        "Pipeline should complete, failure: {:?}",
        report.failure.as_ref().map(|f| f.error_chain())
    );
}

/// Recorded step names, in order
pub fn execution_order(report: &RunReport) -> Vec<&str> {
    report.results.iter().map(|r| r.step_name.as_str()).collect()
}

pub fn output<'a>(report: &'a RunReport, step: &str) -> &'a Value {
    &report
        .result(step)
        .unwrap_or_else(|| panic!("step {} has no result", step))
        .output
}

pub fn metadata<'a>(report: &'a RunReport, step: &str) -> &'a serde_json::Map<String, Value> {
    &report
        .result(step)
        .unwrap_or_else(|| panic!("step {} has no result", step))
        .metadata
}
