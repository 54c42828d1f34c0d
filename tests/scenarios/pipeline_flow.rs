//! Test: end-to-end pipeline runs against a scripted engine

use crate::helpers::*;
use sqlflow::core::config::PipelineConfig;
use sqlflow::core::record::Vars;
use sqlflow::core::value::Value;
use sqlflow::engine::EngineError;
use sqlflow::execution::{run_pipeline, MetricsRegistry, PipelineError, SqlTemplates};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn templates() -> SqlTemplates {
    SqlTemplates::new()
        .with_template("init.sql", "init")
        .with_template("source.sql", "source after={{ after }}")
        .with_template("double.sql", "double n={{ n }} run={{ RUN_ID }}")
        .with_template("sink.sql", "sink n={{ n }} doubled={{ doubled }} task={{ TASK_ID }}")
        .with_template("stats.sql", "stats n={{ n }}")
}

/// Watermark source: rows 1..=5 after 0, nothing after that
fn handler(q: &str) -> Result<Vec<Vars>, EngineError> {
    if q == "init" {
        return Ok(vec![row([("after", Value::UInt(0))])]);
    }
    if q.starts_with("source") {
        if arg(q, "after") > 0 {
            return Ok(Vec::new());
        }
        return Ok((1..=5)
            .map(|n| row([("n", Value::UInt(n)), ("after", Value::UInt(n))]))
            .collect());
    }
    if q.starts_with("double") {
        let n = arg(q, "n");
        return Ok(vec![row([("n", Value::UInt(n)), ("doubled", Value::UInt(2 * n))])]);
    }
    if q.starts_with("stats") {
        let n = arg(q, "n");
        return Ok(vec![row([
            ("processed_rows", Value::UInt(n)),
            ("lag_seconds", Value::Float(n as f64 / 2.0)),
        ])]);
    }
    Ok(Vec::new())
}

/// Parallel stage followed by a sequencer restores source order
#[tokio::test]
async fn test_parallel_stage_then_sequence() {
    let yaml = r#"
init:
  queries: [init.sql]

source:
  query: source.sql
  stop_on_empty: true

stages:
  - execute:
      queries: [double.sql]
    workers: 4
    channel_size: 4
  - sequence: {}
  - debug:
      id: flow
  - execute:
      queries: [sink.sql]
"#;
    // Early rows take longest so parallel workers finish out of order
    let engine = Arc::new(MockEngine::new(handler).with_delay(|q| {
        if q.starts_with("double") {
            Duration::from_millis((6 - arg(q, "n")) * 20)
        } else {
            Duration::ZERO
        }
    }));

    let (result, metrics) = run_yaml(yaml, engine.clone(), templates(), Vars::new()).await;
    result.unwrap();

    assert_eq!(metrics.finalized(), 5);
    assert_eq!(
        engine.calls_starting_with("source"),
        vec!["source after=0", "source after=5"]
    );

    let mut doubled: Vec<u64> = engine
        .calls_starting_with("double")
        .iter()
        .map(|q| arg(q, "n"))
        .collect();
    doubled.sort();
    assert_eq!(doubled, vec![1, 2, 3, 4, 5]);

    assert_eq!(
        engine.calls_starting_with("sink"),
        vec![
            "sink n=1 doubled=2 task=0",
            "sink n=2 doubled=4 task=1",
            "sink n=3 doubled=6 task=2",
            "sink n=4 doubled=8 task=3",
            "sink n=5 doubled=10 task=4",
        ]
    );
}

/// Worker counts set in code cannot split a sequencer
#[tokio::test]
async fn test_sequence_stage_runs_single_worker() {
    let yaml = r#"
init:
  queries: [init.sql]
source:
  query: source.sql
  stop_on_empty: true
stages:
  - sequence: {}
  - execute:
      queries: [sink.sql]
"#;
    let mut conf = PipelineConfig::from_yaml(yaml).unwrap();
    conf.stages[0].workers = 4;

    let engine = Arc::new(MockEngine::new(handler));
    let templates = SqlTemplates::new()
        .with_template("init.sql", "init")
        .with_template("source.sql", "source after={{ after }}")
        .with_template("sink.sql", "sink n={{ n }}");
    let metrics = MetricsRegistry::new().unwrap();

    run_pipeline(
        engine.clone(),
        Arc::new(templates),
        Vars::new(),
        &conf,
        metrics.clone(),
        CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(metrics.finalized(), 5);
    assert_eq!(
        engine.calls_starting_with("sink"),
        vec!["sink n=1", "sink n=2", "sink n=3", "sink n=4", "sink n=5"]
    );
}

#[tokio::test]
async fn test_run_id_is_injected() {
    let yaml = r#"
init:
  queries: [init.sql]
source:
  query: source.sql
  stop_on_empty: true
stages:
  - execute:
      queries: [double.sql]
"#;
    let engine = Arc::new(MockEngine::new(handler));
    let (result, _) = run_yaml(yaml, engine.clone(), templates(), Vars::new()).await;
    result.unwrap();

    let runs: Vec<String> = engine
        .calls_starting_with("double")
        .iter()
        .filter_map(|q| q.split("run=").nth(1).map(str::to_string))
        .collect();
    assert_eq!(runs.len(), 5);
    assert!(uuid::Uuid::parse_str(&runs[0]).is_ok());
    assert!(runs.iter().all(|r| r == &runs[0]));
}

#[tokio::test]
async fn test_stop_after_bounds_polls() {
    let yaml = r#"
source:
  query: source.sql
  poll_interval_ms: 10
  stop_after: 3
stages:
  - sleep:
      duration_ms: 1
"#;
    // Source keeps returning rows: only stop_after ends the run
    let engine = Arc::new(MockEngine::new(|q| {
        if q.starts_with("source") {
            let after = arg(q, "after");
            return Ok(vec![
                row([("after", Value::UInt(after + 1))]),
                row([("after", Value::UInt(after + 2))]),
            ]);
        }
        Ok(Vec::new())
    }));
    let vars = row([("after", Value::UInt(0))]);

    let (result, metrics) = run_yaml(yaml, engine.clone(), templates(), vars).await;
    result.unwrap();

    assert_eq!(metrics.finalized(), 6);
    assert_eq!(
        engine.calls_starting_with("source"),
        vec!["source after=0", "source after=2", "source after=4"]
    );
}

#[tokio::test]
async fn test_metrics_stage_updates_user_metrics() {
    let yaml = r#"
init:
  queries: [init.sql]
source:
  query: source.sql
  stop_on_empty: true
stages:
  - metrics:
      query: stats.sql
      metrics:
        - name: processed_rows
          type: COUNTER
        - name: lag_seconds
          type: GAUGE
"#;
    let engine = Arc::new(MockEngine::new(handler));
    let (result, metrics) = run_yaml(yaml, engine, templates(), Vars::new()).await;
    result.unwrap();

    let rendered = metrics.render_prometheus();
    assert!(rendered.contains("processed_rows{stage=\"stage_0\"} 15"), "{}", rendered);
    assert!(rendered.contains("lag_seconds{stage=\"stage_0\"} 2.5"), "{}", rendered);
    assert_eq!(metrics.finalized(), 5);
}

#[tokio::test]
async fn test_metrics_stage_missing_column_fails() {
    let yaml = r#"
init:
  queries: [init.sql]
source:
  query: source.sql
  stop_on_empty: true
stages:
  - metrics:
      query: stats.sql
      metrics:
        - name: not_there
          type: COUNTER
"#;
    let engine = Arc::new(MockEngine::new(handler));
    let (result, _) = run_yaml(yaml, engine, templates(), Vars::new()).await;

    assert!(matches!(
        result,
        Err(PipelineError::QueryShape { ref name, .. }) if name == "stats.sql"
    ));
}

/// Cancelling the caller's token ends a run whose source never runs dry
#[tokio::test]
async fn test_external_cancellation_returns_ok() {
    let conf = PipelineConfig::from_yaml(
        r#"
source:
  query: source.sql
  poll_interval_ms: 20
stages:
  - sleep:
      duration_ms: 60000
"#,
    )
    .unwrap();
    let engine = Arc::new(MockEngine::new(|q| {
        if q.starts_with("source") {
            return Ok(vec![row([("after", Value::UInt(arg(q, "after") + 1))])]);
        }
        Ok(Vec::new())
    }));

    let cancel = CancellationToken::new();
    let canceller = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel.cancel();
        })
    };

    let result = tokio::time::timeout(
        Duration::from_secs(5),
        run_pipeline(
            engine,
            Arc::new(templates()),
            row([("after", Value::UInt(0))]),
            &conf,
            MetricsRegistry::new().unwrap(),
            cancel,
        ),
    )
    .await
    .expect("pipeline did not stop after cancellation");

    result.unwrap();
    canceller.await.unwrap();
}

/// A failing init query aborts before the source starts
#[tokio::test]
async fn test_init_failure_aborts_run() {
    let yaml = r#"
init:
  queries: [init.sql]
source:
  query: source.sql
stages:
  - sequence: {}
"#;
    let engine = Arc::new(MockEngine::new(|q| {
        if q == "init" {
            return Err(exception(60));
        }
        Ok(Vec::new())
    }));

    let (result, _) = run_yaml(yaml, engine.clone(), templates(), Vars::new()).await;

    assert!(matches!(result, Err(PipelineError::Query { ref name, .. }) if name == "init.sql"));
    assert!(engine.calls_starting_with("source").is_empty());
}
