//! Test: per-query failure policy

use crate::helpers::*;
use sqlflow::core::record::Vars;
use sqlflow::core::value::Value;
use sqlflow::engine::EngineError;
use sqlflow::execution::{PipelineError, SqlTemplates};
use std::sync::Arc;

fn templates() -> SqlTemplates {
    SqlTemplates::new()
        .with_template("source.sql", "source")
        .with_template("apply.sql", "apply n={{ n }}")
        .with_template("sink.sql", "sink n={{ n }}")
        .with_template("broken.sql", "SELECT {{ UNDEFINED }}")
}

/// Three rows from a single poll; `apply` fails with `failure`
fn engine_failing_with(failure: fn() -> EngineError) -> Arc<MockEngine> {
    Arc::new(MockEngine::new(move |q| {
        if q == "source" {
            return Ok((1..=3).map(|n| row([("n", Value::UInt(n))])).collect());
        }
        if q.starts_with("apply") {
            return Err(failure());
        }
        Ok(Vec::new())
    }))
}

fn pipeline(apply: &str) -> String {
    format!(
        r#"
source:
  query: source.sql
  stop_after: 1

stages:
  - execute:
      queries: ["{}"]
  - execute:
      queries: [sink.sql]
"#,
        apply
    )
}

/// ignore-failure keeps the run alive against a permanently failing backend
#[tokio::test]
async fn test_ignore_failure_never_aborts() {
    let engine = engine_failing_with(|| exception(1000));

    let (result, metrics) = run_yaml(
        &pipeline("apply.sql#ignore-failure=true"),
        engine.clone(),
        templates(),
        Vars::new(),
    )
    .await;

    result.unwrap();
    assert_eq!(metrics.finalized(), 3);
    assert_eq!(engine.calls_starting_with("apply").len(), 3);
    // Record vars survive the ignored failure
    assert_eq!(
        engine.calls_starting_with("sink"),
        vec!["sink n=1", "sink n=2", "sink n=3"]
    );
}

#[tokio::test]
async fn test_listed_error_code_is_tolerated() {
    let engine = engine_failing_with(|| exception(60));

    let (result, metrics) = run_yaml(
        &pipeline("apply.sql#ignore-error-codes=60"),
        engine,
        templates(),
        Vars::new(),
    )
    .await;

    result.unwrap();
    assert_eq!(metrics.finalized(), 3);
}

#[tokio::test]
async fn test_other_error_code_aborts() {
    let engine = engine_failing_with(|| exception(81));

    let (result, metrics) = run_yaml(
        &pipeline("apply.sql#ignore-error-codes=60"),
        engine,
        templates(),
        Vars::new(),
    )
    .await;

    match result {
        Err(PipelineError::Query { name, source, .. }) => {
            assert_eq!(name, "apply.sql");
            assert_eq!(source.exception_code(), Some(81));
        }
        other => panic!("expected query error, got {:?}", other),
    }
    assert_eq!(metrics.finalized(), 0);
}

/// Error codes only match typed exceptions
#[tokio::test]
async fn test_error_codes_ignore_untyped_failures() {
    let engine = engine_failing_with(|| EngineError::Decode("truncated body".to_string()));

    let (result, _) = run_yaml(
        &pipeline("apply.sql#ignore-error-codes=60"),
        engine,
        templates(),
        Vars::new(),
    )
    .await;

    assert!(matches!(result, Err(PipelineError::Query { .. })));
}

#[tokio::test]
async fn test_error_message_redacts_sensitive_vars() {
    let engine = engine_failing_with(|| exception(81));
    let vars = row([
        ("DB_PASSWORD", Value::from("hunter2")),
        ("TABLE", Value::from("events")),
    ]);

    let (result, _) = run_yaml(&pipeline("apply.sql"), engine, templates(), vars).await;

    let message = result.unwrap_err().to_string();
    assert!(message.contains("apply.sql"), "{}", message);
    assert!(message.contains("******"), "{}", message);
    assert!(message.contains("events"), "{}", message);
    assert!(!message.contains("hunter2"), "{}", message);
}

/// Render errors are fatal whatever the failure policy
#[tokio::test]
async fn test_template_error_is_not_ignored() {
    let engine = engine_failing_with(|| exception(60));

    let (result, _) = run_yaml(
        &pipeline("broken.sql#ignore-failure=true"),
        engine,
        templates(),
        Vars::new(),
    )
    .await;

    assert!(matches!(
        result,
        Err(PipelineError::Template { ref name, .. }) if name == "broken.sql"
    ));
}
