//! Test: startup probe deadline and retry behavior

use crate::helpers::*;
use sqlflow::engine::{run_startup_probe, EngineError, StartupProbeConfig};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

fn probe_config() -> StartupProbeConfig {
    StartupProbeConfig {
        max_delay_ms: 1000,
        poll_interval_ms: 300,
    }
}

/// An engine that never answers fails after max_delay, within one poll interval
#[tokio::test(start_paused = true)]
async fn test_unreachable_engine_times_out() {
    let engine = MockEngine::unreachable();
    let start = Instant::now();

    let err = run_startup_probe(&engine, &probe_config(), &CancellationToken::new())
        .await
        .unwrap_err();

    let waited = start.elapsed();
    assert!(matches!(err, EngineError::StartupTimeout(d) if d == Duration::from_millis(1000)));
    assert!(waited >= Duration::from_millis(1000), "returned early: {:?}", waited);
    assert!(waited <= Duration::from_millis(1300), "returned late: {:?}", waited);
}

/// Pings are retried on the poll interval until one succeeds
#[tokio::test(start_paused = true)]
async fn test_engine_ready_after_retries() {
    let engine = MockEngine::new(|_| Ok(Vec::new())).with_failing_pings(2);
    let start = Instant::now();

    run_startup_probe(&engine, &probe_config(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(start.elapsed(), Duration::from_millis(600));
}

#[tokio::test(start_paused = true)]
async fn test_probe_is_cancellable() {
    let engine = MockEngine::unreachable();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = run_startup_probe(&engine, &probe_config(), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Cancelled));
}
