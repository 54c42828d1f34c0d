//! Test utilities: a scripted compute engine and pipeline runners

use async_trait::async_trait;
use parking_lot::Mutex;
use sqlflow::core::config::{PipelineConfig, Settings};
use sqlflow::core::record::{Record, Vars};
use sqlflow::core::value::Value;
use sqlflow::engine::{ComputeEngine, EngineError, QueryOutput};
use sqlflow::execution::query::QueryExecutor;
use sqlflow::execution::stage::{run_stage, StageContext};
use sqlflow::execution::{run_pipeline, MetricsRegistry, PipelineError, SqlTemplates};
use sqlflow::core::config::StageKind;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

type Handler = dyn Fn(&str) -> Result<Vec<Vars>, EngineError> + Send + Sync;
type Delay = dyn Fn(&str) -> Duration + Send + Sync;

/// Engine answering queries with a closure over the rendered SQL
pub struct MockEngine {
    handler: Box<Handler>,
    delay: Option<Box<Delay>>,
    calls: Mutex<Vec<String>>,
    failing_pings: AtomicUsize,
    stopped: CancellationToken,
}

impl MockEngine {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&str) -> Result<Vec<Vars>, EngineError> + Send + Sync + 'static,
    {
        Self {
            handler: Box::new(handler),
            delay: None,
            calls: Mutex::new(Vec::new()),
            failing_pings: AtomicUsize::new(0),
            stopped: CancellationToken::new(),
        }
    }

    /// Engine whose pings never succeed
    pub fn unreachable() -> Self {
        Self::new(|_| Ok(Vec::new())).with_failing_pings(usize::MAX)
    }

    /// Per-query latency, computed from the rendered SQL
    pub fn with_delay<F>(mut self, delay: F) -> Self
    where
        F: Fn(&str) -> Duration + Send + Sync + 'static,
    {
        self.delay = Some(Box::new(delay));
        self
    }

    /// Fail the first `n` pings
    pub fn with_failing_pings(self, n: usize) -> Self {
        self.failing_pings.store(n, Ordering::SeqCst);
        self
    }

    /// Every query received so far, in arrival order
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// Queries starting with `prefix`
    pub fn calls_starting_with(&self, prefix: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|q| q.starts_with(prefix))
            .collect()
    }
}

#[async_trait]
impl ComputeEngine for MockEngine {
    async fn start(&self) -> Result<(), EngineError> {
        Ok(())
    }

    async fn stop(&self) {
        self.stopped.cancel();
    }

    async fn wait(&self) -> Result<(), EngineError> {
        self.stopped.cancelled().await;
        Ok(())
    }

    async fn ping(&self) -> Result<(), EngineError> {
        let remaining = self.failing_pings.load(Ordering::SeqCst);
        if remaining == 0 {
            return Ok(());
        }
        if remaining != usize::MAX {
            self.failing_pings.fetch_sub(1, Ordering::SeqCst);
        }
        Err(EngineError::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "connection refused",
        )))
    }

    async fn query(&self, query: &str, _settings: &Settings) -> Result<QueryOutput, EngineError> {
        if let Some(delay) = &self.delay {
            tokio::time::sleep(delay(query)).await;
        }
        self.calls.lock().push(query.to_string());

        let rows = (self.handler)(query)?;
        Ok(QueryOutput {
            rows,
            ..Default::default()
        })
    }
}

/// Build a row from `(column, value)` pairs
pub fn row<const N: usize>(cols: [(&str, Value); N]) -> Vars {
    cols.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
}

/// Typed exception as the server would report it
pub fn exception(code: i32) -> EngineError {
    EngineError::Exception {
        code,
        message: format!("Code: {}. DB::Exception: scripted failure", code),
    }
}

/// Integer argument following `key=` in a rendered query
pub fn arg(query: &str, key: &str) -> u64 {
    let prefix = format!("{}=", key);
    query
        .split_whitespace()
        .find_map(|tok| tok.strip_prefix(prefix.as_str()))
        .and_then(|v| v.parse().ok())
        .unwrap_or_else(|| panic!("no {} in {:?}", key, query))
}

/// Run a pipeline from YAML against `engine`
pub async fn run_yaml(
    yaml: &str,
    engine: Arc<MockEngine>,
    templates: SqlTemplates,
    vars: Vars,
) -> (Result<(), PipelineError>, MetricsRegistry) {
    let conf = PipelineConfig::from_yaml(yaml).unwrap();
    let metrics = MetricsRegistry::new().unwrap();
    let result = run_pipeline(
        engine,
        Arc::new(templates),
        vars,
        &conf,
        metrics.clone(),
        CancellationToken::new(),
    )
    .await;
    (result, metrics)
}

/// A single stage worker wired to test-owned queues
pub struct StageHarness {
    pub input: async_channel::Sender<Record>,
    pub output: async_channel::Receiver<Record>,
    pub cancel: CancellationToken,
    pub task: JoinHandle<Result<(), PipelineError>>,
}

impl StageHarness {
    pub fn spawn(kind: StageKind, engine: Arc<MockEngine>, templates: SqlTemplates) -> Self {
        let (input, inbound) = async_channel::bounded(16);
        let (outbound, output) = async_channel::bounded(16);
        let cancel = CancellationToken::new();

        let executor = QueryExecutor::new(
            engine,
            Arc::new(templates),
            MetricsRegistry::new().unwrap(),
        );
        let ctx = StageContext::new(0, 0, executor, Arc::new(Vars::new()), cancel.clone());
        let task = tokio::spawn(async move { run_stage(ctx, &kind, inbound, outbound).await });

        Self {
            input,
            output,
            cancel,
            task,
        }
    }

    pub async fn send(&self, record: Record) {
        self.input.send(record).await.unwrap();
    }

    /// Close the input and collect everything the stage emits
    pub async fn finish(self) -> (Result<(), PipelineError>, Vec<Record>) {
        self.input.close();
        let result = self.task.await.unwrap();

        let mut records = Vec::new();
        while let Ok(record) = self.output.try_recv() {
            records.push(record);
        }
        (result, records)
    }
}
