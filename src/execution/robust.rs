//! Robustness controller: retries with backoff, fallbacks and circuit breaking
//! around a single step's execution

use crate::core::step::{FallbackAction, RetryConfig};
use crate::error::EngineError;
use crate::execution::circuit::{CircuitBreaker, CircuitBreakerConfig};
use crate::execution::executor::StepOutcome;
use crate::provider::ErrorClass;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::future::Future;
use tokio::sync::RwLock;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Characters of the original prompt kept by a simplified attempt
pub const SIMPLIFIED_PROMPT_CHARS: usize = 500;

const SIMPLIFIED_PREFIX: &str =
    "Provide a brief, simplified response to the following request:\n\n";

/// How an attempt should shape its request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptMode {
    Normal,
    /// Reduced request used by the `simplified_prompt` fallback
    Simplified,
}

/// Reduce a prompt for a simplified attempt
pub fn simplify_prompt(prompt: &str) -> String {
    let truncated: String = prompt.chars().take(SIMPLIFIED_PROMPT_CHARS).collect();
    format!("{}{}", SIMPLIFIED_PREFIX, truncated)
}

/// Final state of one attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptState {
    Success,
    RetryableFailure,
    TerminalFailure,
}

/// One entry of a step's error history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// 1-based; the fallback attempt continues the numbering
    pub attempt: u32,
    pub state: AttemptState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_class: Option<ErrorClass>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Wait before the next attempt
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<u64>,
    pub duration_ms: u64,
    pub simplified: bool,
    pub timestamp: DateTime<Utc>,
}

/// Successful outcome of a protected execution
#[derive(Debug, Clone)]
pub struct RobustOutcome {
    pub outcome: StepOutcome,
    pub history: Vec<AttemptRecord>,
    /// Set when a fallback produced the value
    pub fallback: Option<FallbackAction>,
    pub degraded: bool,
    pub circuit_open: bool,
}

impl RobustOutcome {
    /// Step metadata describing how the value was obtained
    pub fn metadata(&self) -> Map<String, Value> {
        let mut metadata = Map::new();
        metadata.insert(
            "error_history".to_string(),
            serde_json::to_value(&self.history).unwrap_or(Value::Null),
        );
        metadata.insert("attempts".to_string(), json!(self.history.len()));
        metadata.insert("degraded".to_string(), json!(self.degraded));
        if let Some(fallback) = self.fallback {
            metadata.insert("fallback_used".to_string(), json!(fallback.to_string()));
        }
        if self.circuit_open {
            metadata.insert("circuit_open".to_string(), json!(true));
        }
        metadata
    }
}

/// Last successful output per step signature
#[derive(Debug, Default)]
pub struct ResponseCache {
    entries: RwLock<HashMap<String, Value>>,
}

impl ResponseCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, signature: &str) -> Option<Value> {
        self.entries.read().await.get(signature).cloned()
    }

    pub async fn store(&self, signature: &str, value: Value) {
        self.entries
            .write()
            .await
            .insert(signature.to_string(), value);
    }
}

/// Signature identifying a step for caching and circuit breaking
pub fn step_signature(pipeline_id: &str, step_name: &str) -> String {
    format!("{}::{}", pipeline_id, step_name)
}

fn default_emergency_response() -> Value {
    json!({
        "emergency": true,
        "message": "The service is temporarily unavailable. A safe default response was returned.",
    })
}

/// Retries, fallbacks and circuit breaking shared by every robust step of an engine
#[derive(Debug)]
pub struct RobustnessController {
    breaker: CircuitBreaker,
    cache: ResponseCache,
}

impl Default for RobustnessController {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

impl RobustnessController {
    pub fn new(circuit: CircuitBreakerConfig) -> Self {
        Self {
            breaker: CircuitBreaker::new(circuit),
            cache: ResponseCache::new(),
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    /// Execute `attempt` under the retry policy of `config`
    ///
    /// Fatal errors (configuration problems, missing outputs, safety
    /// violations, cancellation) are returned as-is; every other failure ends
    /// in the configured fallback.
    pub async fn execute<F, Fut>(
        &self,
        step_name: &str,
        signature: &str,
        config: &RetryConfig,
        mut attempt: F,
    ) -> Result<RobustOutcome, EngineError>
    where
        F: FnMut(AttemptMode) -> Fut,
        Fut: Future<Output = Result<StepOutcome, EngineError>>,
    {
        let mut history: Vec<AttemptRecord> = Vec::new();
        let mut last_error = String::new();
        let mut circuit_open = false;
        let max_attempts = config.max_retries.saturating_add(1);

        for number in 1..=max_attempts {
            let Some(permit) = self.breaker.allow(signature) else {
                warn!("Circuit open for step {}, skipping to fallback", step_name);
                circuit_open = true;
                if last_error.is_empty() {
                    last_error = format!("circuit open for '{}'", signature);
                }
                break;
            };

            debug!("Step {} attempt {}/{}", step_name, number, max_attempts);
            let started = Instant::now();
            match attempt(AttemptMode::Normal).await {
                Ok(outcome) => {
                    permit.record_success();
                    self.cache.store(signature, outcome.output.clone()).await;
                    history.push(AttemptRecord {
                        attempt: number,
                        state: AttemptState::Success,
                        error_class: None,
                        error: None,
                        delay_ms: None,
                        duration_ms: started.elapsed().as_millis() as u64,
                        simplified: false,
                        timestamp: Utc::now(),
                    });
                    if number > 1 {
                        info!("Step {} succeeded on attempt {}", step_name, number);
                    }
                    return Ok(RobustOutcome {
                        outcome,
                        history,
                        fallback: None,
                        degraded: false,
                        circuit_open: false,
                    });
                }
                Err(e) if e.is_fatal() => {
                    return Err(e);
                }
                Err(e) => {
                    permit.record_failure();
                    let class = e.class();
                    let retryable = config.should_retry(class) && number < max_attempts;
                    let delay = retryable
                        .then(|| config.backoff_strategy.delay(number, config.base_delay_ms));
                    last_error = e.to_string();

                    history.push(AttemptRecord {
                        attempt: number,
                        state: if retryable {
                            AttemptState::RetryableFailure
                        } else {
                            AttemptState::TerminalFailure
                        },
                        error_class: Some(class),
                        error: Some(last_error.clone()),
                        delay_ms: delay.map(|d| d.as_millis() as u64),
                        duration_ms: started.elapsed().as_millis() as u64,
                        simplified: false,
                        timestamp: Utc::now(),
                    });

                    match delay {
                        Some(delay) => {
                            warn!(
                                "Step {} attempt {} failed ({}): {}; retrying in {}ms",
                                step_name,
                                number,
                                class,
                                last_error,
                                delay.as_millis()
                            );
                            tokio::time::sleep(delay).await;
                        }
                        None => {
                            warn!(
                                "Step {} attempt {} failed ({}), no retries left: {}",
                                step_name, number, class, last_error
                            );
                            break;
                        }
                    }
                }
            }
        }

        self.fallback(step_name, signature, config, history, last_error, circuit_open, attempt)
            .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn fallback<F, Fut>(
        &self,
        step_name: &str,
        signature: &str,
        config: &RetryConfig,
        mut history: Vec<AttemptRecord>,
        last_error: String,
        circuit_open: bool,
        mut attempt: F,
    ) -> Result<RobustOutcome, EngineError>
    where
        F: FnMut(AttemptMode) -> Fut,
        Fut: Future<Output = Result<StepOutcome, EngineError>>,
    {
        let action = config.fallback_action;
        info!("Applying fallback '{}' for step {}", action, step_name);

        let outcome = match action {
            // No attempt produced a value, so there is never partial output
            FallbackAction::GracefulDegradation => Some(StepOutcome::new(json!({
                "degraded": true,
                "partial": Value::Null,
                "error": last_error,
            }))),
            FallbackAction::CachedResponse => self.cache.get(signature).await.map(StepOutcome::new),
            FallbackAction::EmergencyResponse => Some(StepOutcome::new(
                config
                    .emergency_response
                    .clone()
                    .unwrap_or_else(default_emergency_response),
            )),
            FallbackAction::SimplifiedPrompt => {
                let number = history.len() as u32 + 1;
                let started = Instant::now();
                let result = attempt(AttemptMode::Simplified).await;
                let record = |state, class, error| AttemptRecord {
                    attempt: number,
                    state,
                    error_class: class,
                    error,
                    delay_ms: None,
                    duration_ms: started.elapsed().as_millis() as u64,
                    simplified: true,
                    timestamp: Utc::now(),
                };
                match result {
                    Ok(outcome) => {
                        self.breaker.record_success(signature);
                        history.push(record(AttemptState::Success, None, None));
                        Some(outcome)
                    }
                    Err(e) if e.is_fatal() => {
                        return Err(e);
                    }
                    Err(e) => {
                        self.breaker.record_failure(signature);
                        history.push(record(
                            AttemptState::TerminalFailure,
                            Some(e.class()),
                            Some(e.to_string()),
                        ));
                        None
                    }
                }
            }
        };

        match outcome {
            Some(outcome) => Ok(RobustOutcome {
                outcome,
                history,
                fallback: Some(action),
                degraded: true,
                circuit_open,
            }),
            None => Err(EngineError::FallbackFailed {
                step: step_name.to_string(),
                fallback: action,
                last_error,
                history,
            }),
        }
    }
}
