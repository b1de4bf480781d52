//! Test: session identity across steps and runs

use crate::helpers::*;
use pipewright::execution::RunOptions;
use pipewright::persistence::{session_checkpoint_id, CheckpointStore, InMemoryCheckpointStore};
use serde_json::json;
use std::sync::Arc;

/// Steps naming the same session share its id; other names get their own
#[tokio::test]
async fn test_steps_share_named_sessions() {
    let yaml = r#"
name: "chat"
steps:
  - name: "hello"
    type: session
    session: "s1"
    prompt: "Hello"
  - name: "other"
    type: session
    session: "s2"
    prompt: "Unrelated"
  - name: "follow_up"
    type: session
    session: "s1"
    prompt: "And then?"
"#;
    let provider = Arc::new(MockProvider::new());
    let report = run_yaml(yaml, &provider).await;

    assert_completed(&report);
    let hello = metadata(&report, "hello");
    let other = metadata(&report, "other");
    let follow_up = metadata(&report, "follow_up");

    assert_eq!(hello["session_id"], follow_up["session_id"]);
    assert_ne!(hello["session_id"], other["session_id"]);
    assert_eq!(hello["turn_count"], json!(1));
    assert_eq!(follow_up["turn_count"], json!(2));
    assert_eq!(other["session_name"], json!("s2"));

    let sessions: Vec<_> = provider
        .calls()
        .into_iter()
        .map(|c| c.options.session_id)
        .collect();
    assert_eq!(sessions[0], sessions[2]);
    assert_eq!(
        sessions[0].as_deref(),
        hello["session_id"].as_str()
    );
}

/// Session names are templates
#[tokio::test]
async fn test_templated_session_name() {
    let yaml = r#"
name: "chat"
variables:
  user: "ada"
steps:
  - name: "greet"
    type: session
    session: "{{ global_vars.user }}-chat"
    prompt: "Hi {{ global_vars.user }}"
"#;
    let provider = Arc::new(MockProvider::new());
    let report = run_yaml(yaml, &provider).await;

    assert_completed(&report);
    assert_eq!(metadata(&report, "greet")["session_name"], json!("ada-chat"));
    assert_eq!(output(&report, "greet"), &json!("echo: Hi ada"));
}

/// Persisted sessions are restored by a later run
#[tokio::test]
async fn test_persisted_session_survives_runs() {
    let yaml = r#"
name: "chat"
steps:
  - name: "talk"
    type: session
    session: "support"
    prompt: "Help me"
    persisted: true
    checkpoint_frequency: 1
"#;
    let store = Arc::new(InMemoryCheckpointStore::new());
    let provider = Arc::new(MockProvider::new());
    let engine = engine_with(&provider).with_store(store.clone());
    let pipeline = pipeline_from_yaml(yaml);

    let first = engine.run(&pipeline, RunOptions::new()).await;
    let second = engine.run(&pipeline, RunOptions::new()).await;

    assert_completed(&first);
    assert_completed(&second);
    assert_eq!(
        metadata(&first, "talk")["session_id"],
        metadata(&second, "talk")["session_id"]
    );
    assert_eq!(metadata(&second, "talk")["turn_count"], json!(2));

    let saved = store
        .load(&session_checkpoint_id("support"))
        .await
        .unwrap()
        .expect("session should be checkpointed");
    assert_eq!(saved["turn_count"], json!(2));
}
