//! Engine backed by an already running server

use crate::core::config::{normalize_settings, Settings, SettingsConfig};
use crate::engine::{ClickHouseClient, ComputeEngine, EngineError, QueryOutput};
use async_trait::async_trait;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteEngineConfig {
    /// `http://[user[:password]@]host:port[/database]`
    pub dsn: String,

    /// Settings applied to every query
    #[serde(default)]
    pub settings: SettingsConfig,
}

/// Remote server session; `wait` returns once `stop` is called
pub struct RemoteEngine {
    client: ClickHouseClient,
    stopped: CancellationToken,
}

impl RemoteEngine {
    pub fn new(conf: &RemoteEngineConfig) -> Result<Self, EngineError> {
        let client = ClickHouseClient::from_dsn(&conf.dsn, normalize_settings(&conf.settings))?;
        Ok(Self {
            client,
            stopped: CancellationToken::new(),
        })
    }
}

#[async_trait]
impl ComputeEngine for RemoteEngine {
    async fn start(&self) -> Result<(), EngineError> {
        info!(endpoint = %self.client.endpoint(), "using remote engine");
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
        self.client.ping().await
    }

    async fn query(&self, query: &str, settings: &Settings) -> Result<QueryOutput, EngineError> {
        self.client.query(query, settings).await
    }
}
