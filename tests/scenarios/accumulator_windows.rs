//! Test: buffer stage window triggers

use crate::helpers::*;
use sqlflow::core::config::{BufferStageConfig, StageKind};
use sqlflow::core::query_ref::QueryRef;
use sqlflow::core::record::{Record, Vars};
use sqlflow::core::value::Value;
use sqlflow::engine::EngineError;
use sqlflow::execution::{PipelineError, SqlTemplates};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout, Instant};

fn templates() -> SqlTemplates {
    SqlTemplates::new()
        .with_template("merge.sql", "merge\n{{ LEFT | json }}\n{{ RIGHT | json }}")
        .with_template("size.sql", "size total={{ total }}")
        .with_template("cond.sql", "cond total={{ total }}")
        .with_template("enter.sql", "enter n={{ n }}")
        .with_template("leave.sql", "leave total={{ total }}")
}

/// Sums `n` into `total`; the condition closes the window at exactly 3
fn handler(query: &str) -> Result<Vec<Vars>, EngineError> {
    if let Some(body) = query.strip_prefix("merge\n") {
        let mut lines = body.lines();
        let left: serde_json::Value = serde_json::from_str(lines.next().unwrap()).unwrap();
        let right: serde_json::Value = serde_json::from_str(lines.next().unwrap()).unwrap();
        let total = left.get("total").and_then(|v| v.as_u64()).unwrap_or(0)
            + right["n"].as_u64().unwrap();
        return Ok(vec![row([("total", Value::UInt(total))])]);
    }
    if query.starts_with("size") {
        return Ok(vec![row([("size", Value::UInt(arg(query, "total")))])]);
    }
    if query.starts_with("cond") {
        let keep = u64::from(arg(query, "total") != 3);
        return Ok(vec![row([("value", Value::UInt(keep))])]);
    }
    Ok(Vec::new())
}

fn rec(seq: u64, n: u64) -> Record {
    Record::new(seq, row([("n", Value::UInt(n))]))
}

fn buffer(conf: BufferStageConfig) -> StageKind {
    StageKind::Buffer(BufferStageConfig {
        queries: vec![QueryRef::named("merge.sql")],
        ..conf
    })
}

fn spawn(kind: StageKind) -> (StageHarness, Arc<MockEngine>) {
    let engine = Arc::new(MockEngine::new(handler));
    (StageHarness::spawn(kind, engine.clone(), templates()), engine)
}

/// Three single records with max_size=3 yield one batch, only after the third
#[tokio::test(start_paused = true)]
async fn test_closes_at_max_size() {
    let (h, _) = spawn(buffer(BufferStageConfig {
        max_size: Some(3),
        ..Default::default()
    }));

    h.send(rec(0, 1)).await;
    h.send(rec(1, 2)).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.output.try_recv().is_err(), "batch emitted before max_size");

    h.send(rec(2, 3)).await;
    let batch = timeout(Duration::from_secs(1), h.output.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(batch.id(), "0_2");
    assert_eq!(batch.vars["total"], Value::UInt(6));

    let (result, rest) = h.finish().await;
    result.unwrap();
    assert!(rest.is_empty());
}

/// A lone record is flushed when the window deadline fires
#[tokio::test(start_paused = true)]
async fn test_closes_at_deadline() {
    let (h, _) = spawn(buffer(BufferStageConfig {
        max_duration_ms: Some(100),
        ..Default::default()
    }));

    let start = Instant::now();
    h.send(rec(0, 7)).await;

    let batch = timeout(Duration::from_millis(150), h.output.recv())
        .await
        .expect("no batch within 150ms")
        .unwrap();
    let waited = start.elapsed();

    assert!(waited >= Duration::from_millis(100), "flushed early: {:?}", waited);
    assert_eq!(batch.id(), "0");
    assert_eq!(batch.vars["total"], Value::UInt(7));

    let (result, rest) = h.finish().await;
    result.unwrap();
    assert!(rest.is_empty());
}

/// A condition returning 0 closes the window before max_size
#[tokio::test]
async fn test_closes_on_condition() {
    let (h, _) = spawn(buffer(BufferStageConfig {
        condition: Some(QueryRef::named("cond.sql")),
        max_size: Some(100),
        ..Default::default()
    }));

    h.send(rec(0, 1)).await;
    h.send(rec(1, 2)).await;
    h.send(rec(2, 5)).await;

    let (result, batches) = h.finish().await;
    result.unwrap();

    assert_eq!(batches.len(), 2);
    assert_eq!(batches[0].id(), "0_1");
    assert_eq!(batches[0].vars["total"], Value::UInt(3));
    // Drained when the inbound queue closed
    assert_eq!(batches[1].id(), "2");
    assert_eq!(batches[1].vars["total"], Value::UInt(5));
}

#[tokio::test]
async fn test_size_query_drives_max_size() {
    let (h, engine) = spawn(buffer(BufferStageConfig {
        size: Some(QueryRef::named("size.sql")),
        max_size: Some(5),
        ..Default::default()
    }));

    h.send(rec(0, 2)).await;
    h.send(rec(1, 2)).await;
    h.send(rec(2, 2)).await;

    let (result, batches) = h.finish().await;
    result.unwrap();

    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].id(), "0_2");
    assert_eq!(
        engine.calls_starting_with("size"),
        vec!["size total=2", "size total=4", "size total=6"]
    );
}

#[tokio::test]
async fn test_size_query_with_null_size_fails() {
    let engine = Arc::new(MockEngine::new(|q| {
        if q.starts_with("size") {
            return Ok(vec![row([("size", Value::Null)])]);
        }
        handler(q)
    }));
    let h = StageHarness::spawn(
        buffer(BufferStageConfig {
            size: Some(QueryRef::named("size.sql")),
            max_size: Some(5),
            ..Default::default()
        }),
        engine,
        templates(),
    );

    h.send(rec(0, 1)).await;
    let (result, batches) = h.finish().await;

    assert!(matches!(
        result,
        Err(PipelineError::QueryShape { ref name, .. }) if name == "size.sql"
    ));
    assert!(batches.is_empty());
}

#[tokio::test]
async fn test_enter_and_leave_queries() {
    let (h, engine) = spawn(buffer(BufferStageConfig {
        enter: Some(QueryRef::named("enter.sql")),
        leave: Some(QueryRef::named("leave.sql")),
        max_size: Some(2),
        ..Default::default()
    }));

    for (seq, n) in [(0, 1), (1, 2), (2, 3), (3, 4)] {
        h.send(rec(seq, n)).await;
    }

    let (result, batches) = h.finish().await;
    result.unwrap();

    assert_eq!(batches.len(), 2);
    assert_eq!(engine.calls_starting_with("enter"), vec!["enter n=1", "enter n=3"]);
    assert_eq!(
        engine.calls_starting_with("leave"),
        vec!["leave total=3", "leave total=7"]
    );
}

/// Closing the inbound queue flushes a partial batch
#[tokio::test]
async fn test_drains_open_batch_on_close() {
    let (h, _) = spawn(buffer(BufferStageConfig {
        max_size: Some(10),
        ..Default::default()
    }));

    h.send(rec(0, 1)).await;
    h.send(rec(1, 1)).await;

    let (result, batches) = h.finish().await;
    result.unwrap();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].id(), "0_1");
    assert_eq!(batches[0].vars["total"], Value::UInt(2));
}

#[tokio::test]
async fn test_cancel_stops_without_flushing() {
    let (h, _) = spawn(buffer(BufferStageConfig {
        max_size: Some(10),
        ..Default::default()
    }));

    h.send(rec(0, 1)).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    h.cancel.cancel();

    let (result, batches) = h.finish().await;
    result.unwrap();
    assert!(batches.is_empty());
}
