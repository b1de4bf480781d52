//! Test: sequential execution, conditions and variables

use crate::helpers::*;
use pipewright::core::ExecutionStatus;
use pipewright::execution::RunOptions;
use serde_json::json;
use std::sync::Arc;

/// Results keep declared order with one entry per executed step
#[tokio::test]
async fn test_results_follow_declared_order() {
    let yaml = r#"
name: "Test: Sequential"
steps:
  - name: "plan"
    type: provider
    prompt: "Create a plan"
  - name: "implement"
    type: provider
    prompt: "Implement {{ steps.plan.result }}"
  - name: "review"
    type: provider
    prompt: "Review {{ steps.implement.result }}"
"#;
    let provider = Arc::new(
        MockProvider::new()
            .on("Create a plan", Reply::text("the plan"))
            .on("Implement", Reply::text("the code")),
    );

    let report = run_yaml(yaml, &provider).await;

    assert_completed(&report);
    assert_eq!(execution_order(&report), vec!["plan", "implement", "review"]);
    assert_eq!(
        provider.prompts(),
        vec!["Create a plan", "Implement the plan", "Review the code"]
    );
    assert_eq!(output(&report, "review"), &json!("echo: Review the code"));
    assert_eq!(report.steps_executed, 3);
}

/// Skipped steps leave no result and do not count against the step limit
#[tokio::test]
async fn test_conditions_skip_steps() {
    let yaml = r#"
name: "Test: Conditions"
variables:
  mode: "fast"
steps:
  - name: "classify"
    type: provider
    prompt: "Classify"
  - name: "deep_dive"
    type: provider
    prompt: "Dig deeper"
    condition: "{{ steps.classify.result.complex }}"
  - name: "quick"
    type: provider
    prompt: "Quick answer"
    condition: "{{ global_vars.mode }} == fast"
  - name: "never"
    type: provider
    prompt: "Unreachable"
    condition: "{{ global_vars.missing }}"
"#;
    let provider = Arc::new(
        MockProvider::new().on("Classify", Reply::Json(json!({"complex": false}))),
    );

    let report = run_yaml(yaml, &provider).await;

    assert_completed(&report);
    assert_eq!(execution_order(&report), vec!["classify", "quick"]);
    assert_eq!(report.skipped, vec!["deep_dive", "never"]);
    assert_eq!(report.steps_executed, 2);
    assert_eq!(provider.calls_matching("Dig deeper"), 0);
}

/// set_variable assignments are visible to later steps, typed
#[tokio::test]
async fn test_set_variable_feeds_later_steps() {
    let yaml = r#"
name: "Test: Variables"
variables:
  language: "rust"
steps:
  - name: "analyze"
    type: provider
    prompt: "Analyze"
  - name: "remember_score"
    type: set_variable
    variable: "score"
    value: "{{ steps.analyze.result.score }}"
  - name: "summary"
    type: set_variable
    variable: "summary"
    value:
      language: "{{ global_vars.language }}"
      score: "{{ global_vars.score }}"
  - name: "report"
    type: provider
    prompt: "Score for {{ global_vars.language }} is {{ global_vars.score }}"
"#;
    let provider = Arc::new(MockProvider::new().on("Analyze", Reply::Json(json!({"score": 9}))));

    let report = run_yaml(yaml, &provider).await;

    assert_completed(&report);
    assert_eq!(report.global_vars["score"], json!(9));
    assert_eq!(
        report.global_vars["summary"],
        json!({"language": "rust", "score": 9})
    );
    assert_eq!(output(&report, "report"), &json!("echo: Score for rust is 9"));
}

/// Run options override pipeline variables
#[tokio::test]
async fn test_run_variables_override_pipeline_variables() {
    let yaml = r#"
name: "Test: Overrides"
variables:
  topic: "default"
steps:
  - name: "write"
    type: provider
    prompt: "Write about {{ global_vars.topic }}"
"#;
    let provider = Arc::new(MockProvider::new());
    let report = engine_with(&provider)
        .run(
            &pipeline_from_yaml(yaml),
            RunOptions::new().with_variable("topic", json!("lifetimes")),
        )
        .await;

    assert_completed(&report);
    assert_eq!(provider.prompts(), vec!["Write about lifetimes"]);
}

/// The workflow view exposes the run and pipeline identity
#[tokio::test]
async fn test_workflow_references() {
    let yaml = r#"
name: "identity"
steps:
  - name: "who"
    type: provider
    prompt: "I am {{ workflow.id }} at depth {{ workflow.depth }}"
"#;
    let provider = Arc::new(MockProvider::new());
    let report = run_yaml(yaml, &provider).await;

    assert_eq!(report.status, ExecutionStatus::Completed);
    assert_eq!(provider.prompts(), vec!["I am identity at depth 0"]);
}
