//! Test: template resolution across steps and contexts

use crate::helpers::*;
use pipewright::core::{EngineConfig, ExecutionStatus};
use pipewright::error::EngineError;
use pipewright::execution::RunOptions;
use serde_json::json;
use std::sync::Arc;

/// A single-expression template keeps the referenced value's type
#[tokio::test]
async fn test_single_expression_keeps_integer_type() {
    let yaml = r#"
name: "typed"
steps:
  - name: "a"
    type: provider
    prompt: "Count things"
  - name: "count"
    type: set_variable
    variable: "count"
    value: "{{steps.a.result.count}}"
"#;
    let provider = Arc::new(MockProvider::new().on("Count", Reply::text(r#"{"count": 42}"#)));

    let report = run_yaml(yaml, &provider).await;

    assert_completed(&report);
    assert_eq!(output(&report, "count"), &json!(42));
    assert!(report.global_vars["count"].is_i64());
}

/// Unresolved references stay literal unless templates are strict
#[tokio::test]
async fn test_unresolved_reference_permissive_and_strict() {
    let yaml = r#"
name: "unresolved"
steps:
  - name: "ask"
    type: provider
    prompt: "Use {{ global_vars.nope }} here"
"#;
    let provider = Arc::new(MockProvider::new());
    let report = run_yaml(yaml, &provider).await;
    assert_completed(&report);
    assert_eq!(provider.prompts(), vec!["Use {{ global_vars.nope }} here"]);

    let strict_provider = Arc::new(MockProvider::new());
    let report = engine_with_config(
        &strict_provider,
        EngineConfig::default().with_strict_templates(true),
    )
    .run(&pipeline_from_yaml(yaml), RunOptions::new())
    .await;

    assert_eq!(report.status, ExecutionStatus::Failed);
    let failure = report.failure.expect("strict run should fail");
    assert_eq!(failure.failing_step, "ask");
    assert!(matches!(
        failure.error,
        EngineError::UnresolvedTemplate(ref expr) if expr == "global_vars.nope"
    ));
    assert_eq!(strict_provider.call_count(), 0);
}

/// An isolated child cannot see parent-only variables; an inheriting one can
#[tokio::test]
async fn test_isolated_child_cannot_see_parent_variables() {
    let yaml = r#"
name: "parent"
variables:
  secret: "parent-only"
steps:
  - name: "isolated"
    type: nested_pipeline
    pipeline:
      inline:
        steps:
          - name: "peek"
            type: provider
            prompt: "Secret is {{ global_vars.secret }}"
    outputs: ["peek"]
  - name: "inheriting"
    type: nested_pipeline
    inherit_context: true
    pipeline:
      inline:
        steps:
          - name: "peek"
            type: provider
            prompt: "Inherited secret is {{ global_vars.secret }}"
    outputs: ["peek"]
"#;
    let provider = Arc::new(MockProvider::new());
    let report = run_yaml(yaml, &provider).await;

    assert_completed(&report);
    assert_eq!(
        provider.prompts(),
        vec![
            "Secret is {{ global_vars.secret }}",
            "Inherited secret is parent-only"
        ]
    );
}

/// Inputs are resolved in the parent and seeded typed into the child
#[tokio::test]
async fn test_inputs_are_typed_and_child_writes_stay_local() {
    let yaml = r#"
name: "parent"
variables:
  limits:
    max: 3
steps:
  - name: "child"
    type: nested_pipeline
    inherit_context: true
    inputs:
      budget: "{{ global_vars.limits.max }}"
    pipeline:
      inline:
        steps:
          - name: "overwrite"
            type: set_variable
            variable: "limits"
            value: "child value"
          - name: "echo_budget"
            type: set_variable
            variable: "seen"
            value: "{{ global_vars.budget }}"
    outputs:
      - path: "echo_budget"
        as: "budget"
"#;
    let provider = Arc::new(MockProvider::new());
    let report = run_yaml(yaml, &provider).await;

    assert_completed(&report);
    assert_eq!(output(&report, "child"), &json!({"budget": 3}));
    assert_eq!(report.global_vars["limits"], json!({"max": 3}));
    assert!(report.global_vars.get("seen").is_none());
}
