//! Compute engine: the SQL backend every query runs against
//!
//! Two variants share the [`ComputeEngine`] contract:
//! - [`LocalEngine`] owns a `clickhouse server` subprocess and its working dir
//! - [`RemoteEngine`] owns a connection to an already running server

pub mod bundle;
pub mod client;
pub mod decode;
pub mod local;
pub mod probe;
pub mod remote;

use crate::core::config::Settings;
use crate::core::metadata::QueryMetadata;
use crate::core::record::Vars;
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub use client::ClickHouseClient;
pub use local::{LocalEngine, LocalEngineConfig};
pub use probe::{run_startup_probe, StartupProbeConfig};
pub use remote::{RemoteEngine, RemoteEngineConfig};

/// Errors raised by the engine layer
#[derive(Debug, Error)]
pub enum EngineError {
    /// The server rejected the query with a typed exception
    #[error("code {code}: {message}")]
    Exception { code: i32, message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to decode response: {0}")]
    Decode(String),

    #[error("invalid engine configuration: {0}")]
    Config(String),

    #[error("bundle {reference}: {reason}")]
    Bundle { reference: String, reason: String },

    #[error("engine is not started")]
    NotStarted,

    #[error("engine did not become ready within {0:?}")]
    StartupTimeout(Duration),

    #[error("engine exited with {status}: {stderr}")]
    Exited { status: String, stderr: String },

    #[error("cancelled")]
    Cancelled,
}

impl EngineError {
    /// Server error code, when the failure is a typed exception
    pub fn exception_code(&self) -> Option<i32> {
        match self {
            EngineError::Exception { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Rows plus execution counters of one query
#[derive(Debug, Clone, Default)]
pub struct QueryOutput {
    pub rows: Vec<Vars>,
    pub metadata: QueryMetadata,
}

/// Trait for compute engines - allows swapping the backend in tests
#[async_trait]
pub trait ComputeEngine: Send + Sync {
    /// Bring the backend up (spawn the process, open the session)
    async fn start(&self) -> Result<(), EngineError>;

    /// Ask the backend to shut down; safe to call more than once
    async fn stop(&self);

    /// Block until the backend process or session ends
    async fn wait(&self) -> Result<(), EngineError>;

    /// Lightweight liveness check
    async fn ping(&self) -> Result<(), EngineError>;

    /// Execute one query with per-call settings
    async fn query(&self, query: &str, settings: &Settings) -> Result<QueryOutput, EngineError>;
}

/// Which engine a run uses
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineConfig {
    Local(LocalEngineConfig),
    Remote(RemoteEngineConfig),
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig::Local(LocalEngineConfig::default())
    }
}

/// Construct the configured engine; `vars` feed bundle reference templates
pub async fn build_engine(
    conf: &EngineConfig,
    vars: &Vars,
) -> Result<Arc<dyn ComputeEngine>, EngineError> {
    match conf {
        EngineConfig::Local(conf) => Ok(Arc::new(LocalEngine::new(conf.clone(), vars).await?)),
        EngineConfig::Remote(conf) => Ok(Arc::new(RemoteEngine::new(conf)?)),
    }
}
