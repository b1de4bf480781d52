//! Test: batch steps with bounded parallelism

use crate::helpers::*;
use pipewright::core::{CancellationFlag, EngineConfig, ExecutionStatus};
use pipewright::error::EngineError;
use pipewright::execution::{ExecutionEvent, RunOptions};
use pipewright::ProviderError;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

/// Four tasks, two at a time; the slow one times out alone
#[tokio::test(start_paused = true)]
async fn test_bounded_batch_with_one_timeout() {
    let yaml = r#"
name: "batch"
steps:
  - name: "review_files"
    type: batch
    prompt: "Review {{ task.payload.file }}"
    max_parallel: 2
    timeout_per_task_ms: 100
    tasks:
      - id: "t0"
        payload: { file: "a.rs" }
      - id: "t1"
        payload: { file: "b.rs" }
      - id: "t2"
        payload: { file: "slow.rs" }
      - id: "t3"
        payload: { file: "d.rs" }
"#;
    let provider = Arc::new(
        MockProvider::new()
            .with_delay(Duration::from_millis(10))
            .on_delayed("slow.rs", Duration::from_millis(500), Reply::text("too late")),
    );

    let report = run_yaml(yaml, &provider).await;

    assert_completed(&report);
    assert!(provider.max_in_flight() <= 2);

    let results = output(&report, "review_files").as_array().unwrap().clone();
    let ids: Vec<_> = results.iter().map(|r| r["task_id"].clone()).collect();
    assert_eq!(ids, vec![json!("t0"), json!("t1"), json!("t2"), json!("t3")]);
    assert_eq!(results[0]["status"], json!("success"));
    assert_eq!(results[0]["output"], json!("echo: Review a.rs"));
    assert_eq!(results[2]["status"], json!("timeout"));
    assert_eq!(results[3]["status"], json!("success"));

    let meta = metadata(&report, "review_files");
    assert_eq!(meta["total_tasks"], json!(4));
    assert_eq!(meta["successful_tasks"], json!(3));
    assert_eq!(meta["timeout_tasks"], json!(1));
    assert_eq!(meta["failed_tasks"], json!(0));
    assert!(meta["performance_statistics"]["max_ms"].as_u64().unwrap() >= 10);
}

/// Task failures are isolated and the consolidated report lists them
#[tokio::test]
async fn test_consolidated_report() {
    let yaml = r#"
name: "batch"
steps:
  - name: "audit"
    type: batch
    prompt: "Audit {{ task.payload.path }}"
    consolidate_results: true
    tasks:
      - id: "lib"
        payload: { path: "src/lib.rs" }
      - id: "main"
        payload: { path: "src/main.rs" }
  - name: "summarize"
    type: provider
    prompt: "Summarize {{ steps.audit.result.summary.successful_tasks }} audits"
"#;
    let provider = Arc::new(
        MockProvider::new()
            .on("src/main.rs", Reply::Fail(ProviderError::Terminal("unreadable".into()))),
    );

    let report = run_yaml(yaml, &provider).await;

    assert_completed(&report);
    let audit = output(&report, "audit");
    assert_eq!(audit["summary"]["total_tasks"], json!(2));
    assert_eq!(audit["summary"]["failed_tasks"], json!(1));
    assert_eq!(
        audit["metadata"]["files_processed"],
        json!(["src/lib.rs", "src/main.rs"])
    );
    assert_eq!(audit["metadata"]["task_breakdown"]["failed"], json!(["main"]));
    let text = audit["consolidated_report"].as_str().unwrap();
    assert!(text.contains("## lib (success)"));
    assert!(text.contains("## main (error)"));
    assert_eq!(provider.prompts().last().unwrap(), "Summarize 1 audits");
}

/// Tasks can be generated from a resolved array
#[tokio::test]
async fn test_tasks_from_variable() {
    let yaml = r#"
name: "batch"
variables:
  jobs:
    - id: "first"
      prompt: "do first"
    - prompt: "do second"
steps:
  - name: "run_jobs"
    type: batch
    tasks_from: "{{ global_vars.jobs }}"
"#;
    let provider = Arc::new(MockProvider::new());
    let report = run_yaml(yaml, &provider).await;

    assert_completed(&report);
    let results = output(&report, "run_jobs").as_array().unwrap().clone();
    assert_eq!(results[0]["task_id"], json!("first"));
    assert_eq!(results[1]["task_id"], json!("task_1"));
    assert_eq!(results[1]["output"], json!("echo: do second"));
}

/// Each task may run a whole nested pipeline
#[tokio::test]
async fn test_tasks_run_nested_pipelines() {
    let yaml = r#"
name: "fanout"
steps:
  - name: "per_file"
    type: batch
    max_parallel: 3
    tasks:
      - id: "a"
        payload: { file: "a.rs" }
      - id: "b"
        payload: { file: "b.rs" }
    pipeline:
      pipeline:
        inline:
          name: "file_review"
          steps:
            - name: "analyze"
              type: provider
              prompt: "Analyze {{ global_vars.file }}"
            - name: "score"
              type: provider
              prompt: "Score {{ steps.analyze.result }}"
      inputs:
        file: "{{ task.payload.file }}"
      outputs: ["score"]
"#;
    let provider = Arc::new(MockProvider::new());
    let report = run_yaml(yaml, &provider).await;

    assert_completed(&report);
    let results = output(&report, "per_file").as_array().unwrap().clone();
    assert_eq!(
        results[0]["output"],
        json!({"score": "echo: Score echo: Analyze a.rs"})
    );
    assert_eq!(
        results[1]["output"],
        json!({"score": "echo: Score echo: Analyze b.rs"})
    );
    // batch step + two nested steps per task
    assert_eq!(report.steps_executed, 5);
}

/// Breaching the step ceiling inside a task fails the whole run
#[tokio::test]
async fn test_step_ceiling_inside_task_halts_run() {
    let yaml = r#"
name: "fanout"
steps:
  - name: "fan"
    type: batch
    tasks:
      - id: "a"
        payload: { file: "a.rs" }
      - id: "b"
        payload: { file: "b.rs" }
    pipeline:
      pipeline:
        inline:
          steps:
            - name: "read"
              type: provider
              prompt: "Read {{ global_vars.file }}"
            - name: "write"
              type: provider
              prompt: "Write {{ global_vars.file }}"
      inputs:
        file: "{{ task.payload.file }}"
  - name: "after"
    type: provider
    prompt: "After the batch"
"#;
    let provider = Arc::new(MockProvider::new());
    let report = engine_with_config(&provider, EngineConfig::default().with_max_total_steps(3))
        .run(&pipeline_from_yaml(yaml), RunOptions::new())
        .await;

    assert_eq!(report.status, ExecutionStatus::Failed);
    assert_eq!(report.steps_executed, 3);
    assert_eq!(provider.calls_matching("After"), 0);

    let failure = report.failure.as_ref().unwrap();
    assert_eq!(failure.failing_step, "fan");
    assert!(matches!(
        failure.innermost().error,
        EngineError::ResourceExceeded { limit: 3, .. }
    ));
    assert!(!report.result("fan").unwrap().success);
}

/// Cancelling before tasks start cancels the run rather than failing tasks
#[tokio::test]
async fn test_cancellation_before_tasks_start() {
    let yaml = r#"
name: "fanout"
steps:
  - name: "fan"
    type: batch
    prompt: "Handle {{ task.id }}"
    tasks:
      - id: "a"
      - id: "b"
"#;
    let provider = Arc::new(MockProvider::new());
    let engine = engine_with(&provider);
    let cancellation = CancellationFlag::new();
    let trigger = cancellation.clone();
    engine.add_event_handler(move |event| {
        if matches!(event, ExecutionEvent::StepStarted { ref step_name, .. } if step_name == "fan") {
            trigger.cancel();
        }
    });

    let report = engine
        .run(
            &pipeline_from_yaml(yaml),
            RunOptions::new().with_cancellation(cancellation),
        )
        .await;

    assert_eq!(report.status, ExecutionStatus::Cancelled);
    assert_eq!(provider.call_count(), 0);
    assert!(matches!(report.failure.unwrap().error, EngineError::Cancelled));
}
