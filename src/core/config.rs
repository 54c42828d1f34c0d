//! Pipeline configuration from YAML

use crate::core::query_ref::QueryRef;
use crate::core::record::Vars;
use crate::engine::{EngineConfig, StartupProbeConfig};
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Raw engine settings as written in YAML (`maxThreads: 4`, `max_threads: 4`, ...)
pub type SettingsConfig = HashMap<String, serde_yaml::Value>;

/// Normalized engine settings: snake_case keys, string values
pub type Settings = BTreeMap<String, String>;

/// Configuration errors detected before any record is processed
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("stage must set exactly one of execute, sequence, debug, sleep, buffer, metrics (found: {0})")]
    StageVariant(String),

    #[error("buffer stage must have at least 1 merge query")]
    EmptyBufferQueries,

    #[error("buffer stage needs max_size, max_duration_ms or condition to ever close a window")]
    UnboundedBuffer,

    #[error("execute stage must have at least 1 query")]
    EmptyExecuteQueries,

    #[error("pipeline must have at least 1 stage")]
    NoStages,
}

/// Top-level run file: the pipeline plus the engine it runs against
#[derive(Debug, Clone, Deserialize)]
pub struct RunConfig {
    #[serde(flatten)]
    pub pipeline: PipelineConfig,

    /// Compute engine (`local` or `remote`); defaults to a local server
    #[serde(default, with = "serde_yaml::with::singleton_map")]
    pub engine: EngineConfig,

    #[serde(default)]
    pub startup_probe: StartupProbeConfig,

    /// Address for the Prometheus `/metrics` endpoint (disabled when unset)
    #[serde(default)]
    pub prom_addr: Option<String>,
}

/// Pipeline topology: init queries, source, stages, finalizer
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub init: InitConfig,

    pub source: SourceConfig,

    #[serde(default)]
    pub stages: Vec<StageConfig>,

    #[serde(default)]
    pub finalizer: FinalizerConfig,
}

/// Queries run once before the source starts
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InitConfig {
    #[serde(default)]
    pub queries: Vec<QueryRef>,

    #[serde(default)]
    pub settings: SettingsConfig,
}

/// Polling source configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub query: QueryRef,

    /// Wait between polls (in milliseconds)
    #[serde(default)]
    pub poll_interval_ms: u64,

    /// Stop after this many non-empty polls (0 = never)
    #[serde(default)]
    pub stop_after: usize,

    /// Stop as soon as a poll returns no rows
    #[serde(default)]
    pub stop_on_empty: bool,

    #[serde(default)]
    pub settings: SettingsConfig,
}

impl SourceConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Terminal sink configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FinalizerConfig {}

/// One stage of the pipeline
#[derive(Debug, Clone, Deserialize)]
#[serde(try_from = "RawStageConfig")]
pub struct StageConfig {
    /// Capacity of the stage's outbound queue
    pub channel_size: usize,

    /// Number of parallel workers (always 1 for order-sensitive kinds)
    pub workers: usize,

    pub kind: StageKind,
}

/// The behavior of a stage; exactly one per stage
#[derive(Debug, Clone)]
pub enum StageKind {
    Execute(ExecuteStageConfig),
    Sequence(SequenceStageConfig),
    Debug(DebugStageConfig),
    Sleep(SleepStageConfig),
    Buffer(BufferStageConfig),
    Metrics(MetricsStageConfig),
}

impl StageKind {
    pub fn name(&self) -> &'static str {
        match self {
            StageKind::Execute(_) => "execute",
            StageKind::Sequence(_) => "sequence",
            StageKind::Debug(_) => "debug",
            StageKind::Sleep(_) => "sleep",
            StageKind::Buffer(_) => "buffer",
            StageKind::Metrics(_) => "metrics",
        }
    }

    /// Kinds whose correctness depends on seeing records in arrival order
    pub fn requires_single_worker(&self) -> bool {
        matches!(self, StageKind::Sequence(_) | StageKind::Buffer(_))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        match self {
            StageKind::Execute(conf) if conf.queries.is_empty() => {
                Err(ConfigError::EmptyExecuteQueries)
            }
            StageKind::Buffer(conf) => conf.validate(),
            _ => Ok(()),
        }
    }
}

impl StageConfig {
    pub fn new(kind: StageKind) -> Self {
        Self {
            channel_size: 1,
            workers: 1,
            kind,
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = if self.kind.requires_single_worker() {
            1
        } else {
            workers.max(1)
        };
        self
    }

    /// Workers actually spawned; order-sensitive kinds get one whatever `workers` says
    pub fn worker_count(&self) -> usize {
        if self.kind.requires_single_worker() {
            1
        } else {
            self.workers.max(1)
        }
    }

    pub fn with_channel_size(mut self, channel_size: usize) -> Self {
        self.channel_size = channel_size.max(1);
        self
    }
}

#[derive(Debug, Deserialize)]
struct RawStageConfig {
    #[serde(default)]
    channel_size: Option<usize>,
    #[serde(default)]
    workers: Option<usize>,
    #[serde(default)]
    execute: Option<ExecuteStageConfig>,
    #[serde(default)]
    sequence: Option<SequenceStageConfig>,
    #[serde(default)]
    debug: Option<DebugStageConfig>,
    #[serde(default)]
    sleep: Option<SleepStageConfig>,
    #[serde(default)]
    buffer: Option<BufferStageConfig>,
    #[serde(default)]
    metrics: Option<MetricsStageConfig>,
}

impl TryFrom<RawStageConfig> for StageConfig {
    type Error = ConfigError;

    fn try_from(raw: RawStageConfig) -> Result<Self, Self::Error> {
        let mut kinds: Vec<StageKind> = Vec::new();
        kinds.extend(raw.execute.map(StageKind::Execute));
        kinds.extend(raw.sequence.map(StageKind::Sequence));
        kinds.extend(raw.debug.map(StageKind::Debug));
        kinds.extend(raw.sleep.map(StageKind::Sleep));
        kinds.extend(raw.buffer.map(StageKind::Buffer));
        kinds.extend(raw.metrics.map(StageKind::Metrics));

        if kinds.len() != 1 {
            let found: Vec<&str> = kinds.iter().map(StageKind::name).collect();
            let found = if found.is_empty() {
                "none".to_string()
            } else {
                found.join(", ")
            };
            return Err(ConfigError::StageVariant(found));
        }

        let kind = kinds.remove(0);
        kind.validate()?;

        Ok(StageConfig::new(kind)
            .with_workers(raw.workers.unwrap_or(1))
            .with_channel_size(raw.channel_size.unwrap_or(1)))
    }
}

/// Stateless per-record query application
#[derive(Debug, Clone, Deserialize)]
pub struct ExecuteStageConfig {
    pub queries: Vec<QueryRef>,

    #[serde(default)]
    pub settings: SettingsConfig,
}

/// Restores sequence order after a parallel stage
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SequenceStageConfig {}

/// Prints every record as JSON
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DebugStageConfig {
    /// Prefix printed before each record
    #[serde(default)]
    pub id: Option<String>,

    #[serde(default)]
    pub pretty: bool,
}

/// Fixed delay pass-through
#[derive(Debug, Clone, Deserialize)]
pub struct SleepStageConfig {
    #[serde(default = "default_sleep_ms")]
    pub duration_ms: u64,
}

fn default_sleep_ms() -> u64 {
    1000
}

impl SleepStageConfig {
    pub fn duration(&self) -> Duration {
        if self.duration_ms == 0 {
            Duration::from_millis(default_sleep_ms())
        } else {
            Duration::from_millis(self.duration_ms)
        }
    }
}

/// Windowed accumulation of records into batches
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BufferStageConfig {
    /// Run when a window opens, with the first record's vars
    #[serde(default)]
    pub enter: Option<QueryRef>,

    /// Merge queries run with `LEFT` (batch) and `RIGHT` (record)
    #[serde(default)]
    pub queries: Vec<QueryRef>,

    /// Computes the batch size; must return one row with a `size` column
    #[serde(default)]
    pub size: Option<QueryRef>,

    /// Keeps the window open while it returns a non-zero `value`
    #[serde(default)]
    pub condition: Option<QueryRef>,

    /// Run when a window closes, with the merged vars
    #[serde(default)]
    pub leave: Option<QueryRef>,

    #[serde(default)]
    pub max_size: Option<u64>,

    #[serde(default)]
    pub max_duration_ms: Option<u64>,

    #[serde(default)]
    pub settings: SettingsConfig,
}

impl BufferStageConfig {
    pub fn max_duration(&self) -> Option<Duration> {
        self.max_duration_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queries.is_empty() {
            return Err(ConfigError::EmptyBufferQueries);
        }
        if self.max_size.unwrap_or(0) == 0
            && self.max_duration().is_none()
            && self.condition.is_none()
        {
            return Err(ConfigError::UnboundedBuffer);
        }
        Ok(())
    }
}

/// Extracts metric values from a query result
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsStageConfig {
    pub query: QueryRef,

    #[serde(default)]
    pub metrics: Vec<MetricConfig>,

    #[serde(default)]
    pub settings: SettingsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricConfig {
    pub name: String,

    #[serde(rename = "type")]
    pub kind: MetricType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MetricType {
    Counter,
    Gauge,
}

impl PipelineConfig {
    /// Parse pipeline configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: PipelineConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stages.is_empty() {
            return Err(ConfigError::NoStages);
        }
        for stage in &self.stages {
            stage.kind.validate()?;
        }
        Ok(())
    }
}

impl RunConfig {
    /// Load a run file, rendering it as a template with `vars` first
    pub fn from_file<P: AsRef<Path>>(path: P, vars: &Vars) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let rendered = crate::execution::template::render_str(&content, vars)
            .with_context(|| format!("Failed to render {}", path.display()))?;
        Self::from_yaml(&rendered)
    }

    /// Parse a run file from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: RunConfig = serde_yaml::from_str(yaml)?;
        config.pipeline.validate()?;
        Ok(config)
    }
}

/// Normalize settings: snake_case keys, scalar values rendered as strings
pub fn normalize_settings(settings: &SettingsConfig) -> Settings {
    settings
        .iter()
        .filter_map(|(k, v)| yaml_scalar_to_string(v).map(|v| (to_snake_case(k), v)))
        .collect()
}

fn yaml_scalar_to_string(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::Null => None,
        serde_yaml::Value::Bool(b) => Some(if *b { "1" } else { "0" }.to_string()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        serde_yaml::Value::String(s) => Some(s.clone()),
        other => serde_json::to_string(other).ok(),
    }
}

/// `maxThreads` / `MaxThreads` / `max-threads` -> `max_threads`
pub fn to_snake_case(s: &str) -> String {
    let chars: Vec<char> = s.chars().collect();
    let mut out = String::with_capacity(s.len() + 4);

    for (i, &c) in chars.iter().enumerate() {
        if c == '-' || c == ' ' {
            out.push('_');
        } else if c.is_uppercase() {
            let prev = if i > 0 { Some(chars[i - 1]) } else { None };
            let next = chars.get(i + 1).copied();
            let boundary = match prev {
                Some(p) if p.is_lowercase() || p.is_ascii_digit() => true,
                Some(p) if p.is_uppercase() => next.is_some_and(|n| n.is_lowercase()),
                _ => false,
            };
            if boundary && !out.ends_with('_') {
                out.push('_');
            }
            out.extend(c.to_lowercase());
        } else {
            out.push(c);
        }
    }

    out
}

pub fn to_screaming_snake_case(s: &str) -> String {
    to_snake_case(s).to_uppercase()
}
