//! Terminal sink of the pipeline

use crate::core::record::Record;
use crate::execution::metrics::MetricsRegistry;
use crate::execution::stage::{next_record, Inbound};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Drain `inbound`, logging every record that made it through all stages
pub async fn run_finalizer(inbound: &Inbound, metrics: &MetricsRegistry, cancel: &CancellationToken) {
    debug!("started");

    while let Some(record) = next_record(inbound, cancel).await {
        finalize(&record, metrics);
    }

    debug!("stopped");
}

fn finalize(record: &Record, metrics: &MetricsRegistry) {
    info!(
        id = %record.id(),
        sequence_start = record.sequence_start,
        sequence_end = record.sequence_end,
        "record finalized"
    );
    metrics.inc_finalized();
}
