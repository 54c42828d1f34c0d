//! Polling source
//!
//! Each poll runs one query with the common vars plus the last row of the
//! previous non-empty poll, so a source can continue from a watermark.
//! Every returned row becomes a fresh atomic record.

use crate::core::config::{normalize_settings, SourceConfig};
use crate::core::record::{merge_vars, Record, Vars};
use crate::execution::error::PipelineError;
use crate::execution::query::{QueryExecutor, QueryScope};
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Metrics label for source queries
pub const SOURCE_LABEL: &str = "source";

/// Poll until exhausted or cancelled, sending records to `outbound`
///
/// Returns once `stop_on_empty` sees an empty poll, after `stop_after`
/// non-empty polls, or when the run is cancelled or downstream is gone.
pub async fn run_source(
    executor: &QueryExecutor,
    common: &Vars,
    conf: &SourceConfig,
    outbound: &async_channel::Sender<Record>,
    cancel: &CancellationToken,
) -> Result<(), PipelineError> {
    debug!("started");

    let scope = QueryScope::new(SOURCE_LABEL, normalize_settings(&conf.settings));
    let mut next_wait = Duration::ZERO;
    let mut next_sequence: u64 = 0;
    let mut last_row = Vars::new();
    let mut iterations = 0;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = sleep(next_wait) => {}
        }

        let vars = merge_vars([common, &last_row]);
        let out = executor.run_query(&scope, &conf.query, &vars).await?;
        next_wait = conf.poll_interval();

        let Some(last) = out.rows.last().cloned() else {
            if conf.stop_on_empty {
                debug!("empty poll, stopping");
                break;
            }
            continue;
        };

        for row in &out.rows {
            let record = Record::new(next_sequence, merge_vars([common, row]));

            let sent = tokio::select! {
                biased;
                _ = cancel.cancelled() => false,
                res = outbound.send(record) => res.is_ok(),
            };
            if !sent {
                debug!("stopped");
                return Ok(());
            }

            next_sequence += 1;
        }

        iterations += 1;
        last_row = last;

        if conf.stop_after > 0 && iterations >= conf.stop_after {
            debug!(iterations, "stop_after reached");
            break;
        }
    }

    debug!("stopped");
    Ok(())
}
