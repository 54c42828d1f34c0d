//! Startup probe: bounded wait for an engine to accept queries

use crate::engine::{ComputeEngine, EngineError};
use serde::Deserialize;
use std::time::Duration;
use tokio::time::{sleep, sleep_until, timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Clone, Deserialize)]
pub struct StartupProbeConfig {
    /// Overall deadline (in milliseconds)
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Wait between two pings (in milliseconds)
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_max_delay_ms() -> u64 {
    20_000
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

impl Default for StartupProbeConfig {
    fn default() -> Self {
        Self {
            max_delay_ms: default_max_delay_ms(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl StartupProbeConfig {
    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Ping `engine` every `poll_interval` until it answers or `max_delay` elapses
///
/// A ping still in flight at the deadline is abandoned, so the probe never
/// outlives `max_delay`.
pub async fn run_startup_probe(
    engine: &dyn ComputeEngine,
    conf: &StartupProbeConfig,
    cancel: &CancellationToken,
) -> Result<(), EngineError> {
    let max_delay = conf.max_delay();
    let deadline = Instant::now() + max_delay;

    loop {
        debug!("probing engine");

        match timeout_at(deadline, engine.ping()).await {
            Ok(Ok(())) => {
                info!("engine is ready");
                return Ok(());
            }
            Ok(Err(e)) => debug!(error = %e, "engine not ready yet"),
            Err(_) => return Err(EngineError::StartupTimeout(max_delay)),
        }

        tokio::select! {
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            _ = sleep_until(deadline) => return Err(EngineError::StartupTimeout(max_delay)),
            _ = sleep(conf.poll_interval()) => {}
        }
    }
}
