//! Test: retries, backoff, fallbacks and circuit breaking

use crate::helpers::*;
use pipewright::core::{EngineConfig, ExecutionStatus};
use pipewright::error::EngineError;
use pipewright::execution::{CircuitBreakerConfig, RunOptions};
use pipewright::ProviderError;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::time::Instant;

fn history(report: &pipewright::RunReport, step: &str) -> Vec<Value> {
    metadata(report, step)["error_history"]
        .as_array()
        .cloned()
        .unwrap_or_default()
}

/// Exponential backoff from 100ms: four attempts, three waits, then fallback
#[tokio::test(start_paused = true)]
async fn test_exponential_backoff_then_degradation() {
    let yaml = r#"
name: "robust"
steps:
  - name: "fetch"
    type: robust
    retry:
      max_retries: 3
      backoff_strategy: exponential
      base_delay_ms: 100
      fallback_action: graceful_degradation
    step:
      type: provider
      prompt: "Fetch data"
"#;
    let provider = Arc::new(MockProvider::new().on("Fetch", Reply::Fail(ProviderError::Timeout(5))));

    let started = Instant::now();
    let report = run_yaml(yaml, &provider).await;
    let elapsed = started.elapsed().as_millis();

    assert_completed(&report);
    assert_eq!(provider.call_count(), 4);
    assert!(elapsed >= 700, "expected at least 700ms of backoff, got {}", elapsed);

    let attempts = history(&report, "fetch");
    assert_eq!(attempts.len(), 4);
    let delays: Vec<Value> = attempts.iter().map(|a| a["delay_ms"].clone()).collect();
    assert_eq!(delays, vec![json!(100), json!(200), json!(400), Value::Null]);
    assert!(attempts.iter().all(|a| a["error_class"] == json!("timeout")));

    let meta = metadata(&report, "fetch");
    assert_eq!(meta["degraded"], json!(true));
    assert_eq!(meta["fallback_used"], json!("graceful_degradation"));
    assert_eq!(output(&report, "fetch")["degraded"], json!(true));
}

/// Transient failures are retried until a success
#[tokio::test(start_paused = true)]
async fn test_retry_until_success() {
    let yaml = r#"
name: "robust"
steps:
  - name: "flaky"
    type: robust
    retry:
      max_retries: 3
      backoff_strategy: fixed
      base_delay_ms: 50
    step:
      type: provider
      prompt: "Flaky call"
"#;
    let provider = Arc::new(MockProvider::new().on_sequence(
        "Flaky",
        vec![
            Reply::Fail(ProviderError::Transient("502".into())),
            Reply::Fail(ProviderError::RateLimited("429".into())),
            Reply::text("finally"),
        ],
    ));

    let report = run_yaml(yaml, &provider).await;

    assert_completed(&report);
    assert_eq!(output(&report, "flaky"), &json!("finally"));
    let meta = metadata(&report, "flaky");
    assert_eq!(meta["attempts"], json!(3));
    assert_eq!(meta["degraded"], json!(false));
    assert!(meta.get("fallback_used").is_none());
}

/// Terminal errors skip retries and go straight to the fallback
#[tokio::test(start_paused = true)]
async fn test_terminal_error_uses_emergency_response() {
    let yaml = r#"
name: "robust"
steps:
  - name: "answer"
    type: robust
    retry:
      max_retries: 5
      base_delay_ms: 10
      fallback_action: emergency_response
      emergency_response:
        answer: "unknown"
    step:
      type: provider
      prompt: "Answer"
"#;
    let provider = Arc::new(
        MockProvider::new().on("Answer", Reply::Fail(ProviderError::Terminal("invalid".into()))),
    );

    let report = run_yaml(yaml, &provider).await;

    assert_completed(&report);
    assert_eq!(provider.call_count(), 1);
    assert_eq!(output(&report, "answer"), &json!({"answer": "unknown"}));
    assert_eq!(metadata(&report, "answer")["fallback_used"], json!("emergency_response"));
}

/// The last good output of the same step is served when it later fails
#[tokio::test(start_paused = true)]
async fn test_cached_response_fallback() {
    let yaml = r#"
name: "robust"
steps:
  - name: "lookup"
    type: robust
    retry:
      max_retries: 0
      fallback_action: cached_response
    step:
      type: provider
      prompt: "Lookup price"
"#;
    let provider = Arc::new(MockProvider::new().on_sequence(
        "Lookup",
        vec![
            Reply::text("42 EUR"),
            Reply::Fail(ProviderError::Terminal("down".into())),
        ],
    ));
    let engine = engine_with(&provider);
    let pipeline = pipeline_from_yaml(yaml);

    let first = engine.run(&pipeline, RunOptions::new()).await;
    assert_completed(&first);

    let second = engine.run(&pipeline, RunOptions::new()).await;
    assert_completed(&second);
    assert_eq!(output(&second, "lookup"), &json!("42 EUR"));
    assert_eq!(metadata(&second, "lookup")["fallback_used"], json!("cached_response"));
}

/// Without a cached value the fallback itself fails the step
#[tokio::test(start_paused = true)]
async fn test_cached_response_without_cache_fails() {
    let yaml = r#"
name: "robust"
steps:
  - name: "lookup"
    type: robust
    retry:
      max_retries: 1
      base_delay_ms: 10
      fallback_action: cached_response
    step:
      type: provider
      prompt: "Lookup price"
"#;
    let provider = Arc::new(
        MockProvider::new().on("Lookup", Reply::Fail(ProviderError::Transient("down".into()))),
    );

    let report = run_yaml(yaml, &provider).await;

    assert_eq!(report.status, ExecutionStatus::Failed);
    let failure = report.failure.as_ref().unwrap();
    match &failure.error {
        EngineError::FallbackFailed { step, history, .. } => {
            assert_eq!(step, "lookup");
            assert_eq!(history.len(), 2);
        }
        other => panic!("Expected FallbackFailed, got {:?}", other),
    }
    assert_eq!(history(&report, "lookup").len(), 2);
}

/// The simplified fallback makes one extra attempt with a reduced prompt
#[tokio::test(start_paused = true)]
async fn test_simplified_prompt_fallback() {
    let yaml = r#"
name: "robust"
steps:
  - name: "explain"
    type: robust
    retry:
      max_retries: 0
      fallback_action: simplified_prompt
    step:
      type: provider
      prompt: "Explain the borrow checker in depth"
"#;
    let provider = Arc::new(
        MockProvider::new()
            .on("simplified response", Reply::text("short answer"))
            .on("Explain", Reply::Fail(ProviderError::Terminal("too long".into()))),
    );

    let report = run_yaml(yaml, &provider).await;

    assert_completed(&report);
    assert_eq!(output(&report, "explain"), &json!("short answer"));
    let prompts = provider.prompts();
    assert_eq!(prompts.len(), 2);
    assert!(prompts[1].ends_with("Explain the borrow checker in depth"));

    let attempts = history(&report, "explain");
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[1]["simplified"], json!(true));
    assert_eq!(attempts[1]["state"], json!("success"));
}

/// An open circuit short-circuits to the fallback without calling the provider
#[tokio::test(start_paused = true)]
async fn test_open_circuit_skips_provider() {
    let yaml = r#"
name: "robust"
steps:
  - name: "call"
    type: robust
    retry:
      max_retries: 1
      backoff_strategy: fixed
      base_delay_ms: 10
    step:
      type: provider
      prompt: "Unstable"
"#;
    let config = EngineConfig::default().with_circuit_breaker(CircuitBreakerConfig {
        enabled: true,
        window_size: 2,
        failure_threshold: 0.5,
        min_calls: 2,
        cooldown_ms: 60_000,
    });
    let provider = Arc::new(
        MockProvider::new().on("Unstable", Reply::Fail(ProviderError::Transient("503".into()))),
    );
    let engine = engine_with_config(&provider, config);
    let pipeline = pipeline_from_yaml(yaml);

    let first = engine.run(&pipeline, RunOptions::new()).await;
    assert_completed(&first);
    assert_eq!(provider.call_count(), 2);

    let second = engine.run(&pipeline, RunOptions::new()).await;
    assert_completed(&second);
    assert_eq!(provider.call_count(), 2);
    let meta = metadata(&second, "call");
    assert_eq!(meta["circuit_open"], json!(true));
    assert_eq!(meta["degraded"], json!(true));
}

/// Safety violations inside a robust step are never retried
#[tokio::test(start_paused = true)]
async fn test_safety_violation_bypasses_retries() {
    let yaml = r#"
name: "loop"
steps:
  - name: "again"
    type: robust
    retry:
      max_retries: 3
      base_delay_ms: 10
    step:
      type: nested_pipeline
      pipeline:
        registry: "loop"
"#;
    let pipeline = pipeline_from_yaml(yaml);
    let provider = Arc::new(MockProvider::new());
    let engine = engine_with(&provider).with_pipeline(pipeline.clone());

    let report = engine.run(&pipeline, RunOptions::new()).await;

    assert_eq!(report.status, ExecutionStatus::Failed);
    let failure = report.failure.unwrap();
    assert!(matches!(failure.error, EngineError::CircularDependency { .. }));
    assert_eq!(report.steps_executed, 1);
}

/// Strict-mode template errors are not hidden by the fallback
#[tokio::test(start_paused = true)]
async fn test_unresolved_template_is_not_degraded() {
    let yaml = r#"
name: "robust"
steps:
  - name: "use_typo"
    type: robust
    retry:
      max_retries: 2
      base_delay_ms: 10
      fallback_action: graceful_degradation
    step:
      type: provider
      prompt: "Use {{ steps.typo.result }}"
"#;
    let provider = Arc::new(MockProvider::new());
    let report = engine_with_config(&provider, EngineConfig::default().with_strict_templates(true))
        .run(&pipeline_from_yaml(yaml), RunOptions::new())
        .await;

    assert_eq!(report.status, ExecutionStatus::Failed);
    assert_eq!(provider.call_count(), 0);
    let failure = report.failure.unwrap();
    assert_eq!(failure.failing_step, "use_typo");
    assert!(matches!(failure.error, EngineError::UnresolvedTemplate(_)));
}

/// A missing required nested output fails the step instead of degrading
#[tokio::test(start_paused = true)]
async fn test_missing_nested_output_is_not_degraded() {
    let yaml = r#"
name: "robust"
steps:
  - name: "delegate"
    type: robust
    retry:
      max_retries: 2
      base_delay_ms: 10
      fallback_action: emergency_response
    step:
      type: nested_pipeline
      pipeline:
        inline:
          steps:
            - name: "inner"
              type: provider
              prompt: "Inner work"
      outputs: ["nope"]
"#;
    let provider = Arc::new(MockProvider::new());
    let report = run_yaml(yaml, &provider).await;

    assert_eq!(report.status, ExecutionStatus::Failed);
    assert_eq!(provider.calls_matching("Inner work"), 1);
    assert!(matches!(
        report.failure.unwrap().error,
        EngineError::OutputNotFound { .. }
    ));
}

/// A probe attempt that ends in a safety violation releases the circuit
#[tokio::test(start_paused = true)]
async fn test_circuit_recovers_after_half_open_attempt_hits_step_ceiling() {
    let work = r#"
  - name: "work"
    type: robust
    retry:
      max_retries: 0
      fallback_action: graceful_degradation
    step:
      type: nested_pipeline
      pipeline:
        inline:
          steps:
            - name: "inner"
              type: provider
              prompt: "Work"
"#;
    let plain = pipeline_from_yaml(&format!("name: \"robust\"\nsteps:{}", work));
    let padded = pipeline_from_yaml(&format!(
        "name: \"robust\"\nsteps:\n  - name: \"pad\"\n    type: provider\n    prompt: \"Pad\"{}",
        work
    ));

    let config = EngineConfig::default()
        .with_max_total_steps(2)
        .with_circuit_breaker(CircuitBreakerConfig {
            enabled: true,
            window_size: 1,
            failure_threshold: 0.5,
            min_calls: 1,
            cooldown_ms: 20,
        });
    let provider = Arc::new(MockProvider::new().on_sequence(
        "Work",
        vec![
            Reply::Fail(ProviderError::Transient("503".into())),
            Reply::text("done"),
        ],
    ));
    let engine = engine_with_config(&provider, config);

    // Opens the circuit
    let first = engine.run(&plain, RunOptions::new()).await;
    assert_completed(&first);
    assert_eq!(metadata(&first, "work")["degraded"], json!(true));

    // The half-open probe runs into the step ceiling
    tokio::time::sleep(std::time::Duration::from_millis(30)).await;
    let second = engine.run(&padded, RunOptions::new()).await;
    assert_eq!(second.status, ExecutionStatus::Failed);
    assert!(matches!(
        second.failure.as_ref().unwrap().innermost().error,
        EngineError::ResourceExceeded { .. }
    ));

    // After a fresh cool-down the next probe goes through and closes the circuit
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    let third = engine.run(&plain, RunOptions::new()).await;
    assert_completed(&third);
    let meta = metadata(&third, "work");
    assert_eq!(meta["degraded"], json!(false));
    assert!(meta.get("circuit_open").is_none());
    assert_eq!(provider.calls_matching("Work"), 2);
}

/// simplified_prompt is rejected around steps that cannot shrink their request
#[test]
fn test_simplified_prompt_requires_prompt_step() {
    let yaml = r#"
name: "robust"
steps:
  - name: "delegate"
    type: robust
    retry:
      fallback_action: simplified_prompt
    step:
      type: nested_pipeline
      pipeline:
        registry: "other"
"#;
    let err = pipewright::PipelineConfig::from_yaml(yaml).unwrap_err();
    assert!(err.to_string().contains("simplified_prompt around a nested_pipeline step"));
}
