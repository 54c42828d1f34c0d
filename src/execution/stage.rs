//! Stage dispatch and the stateless stage kinds
//!
//! Every worker of a stage shares the inbound receiver and owns a clone of
//! the outbound sender. Queue operations and timers all race against the
//! run's cancellation token.

use crate::core::config::{
    normalize_settings, DebugStageConfig, ExecuteStageConfig, MetricType, MetricsStageConfig,
    SettingsConfig, SleepStageConfig, StageKind,
};
use crate::core::record::{merge_vars, Record, Vars};
use crate::core::value::Value;
use crate::execution::accumulator::run_buffer_stage;
use crate::execution::error::PipelineError;
use crate::execution::metrics::MetricsRegistry;
use crate::execution::query::{QueryExecutor, QueryScope};
use crate::execution::sequencer::run_sequence_stage;
use std::sync::Arc;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub type Inbound = async_channel::Receiver<Record>;
pub type Outbound = async_channel::Sender<Record>;

/// Variable holding the record identity during execute stages
pub const TASK_ID_VAR: &str = "TASK_ID";

/// Everything one stage worker needs
#[derive(Clone)]
pub struct StageContext {
    pub index: usize,
    pub worker: usize,
    /// Metrics label, `stage_<index>`
    pub label: String,
    pub executor: QueryExecutor,
    /// Vars shared by the whole run (initial vars, `RUN_ID`, init output)
    pub common: Arc<Vars>,
    pub cancel: CancellationToken,
}

impl StageContext {
    pub fn new(
        index: usize,
        worker: usize,
        executor: QueryExecutor,
        common: Arc<Vars>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            index,
            worker,
            label: format!("stage_{}", index),
            executor,
            common,
            cancel,
        }
    }

    pub fn metrics(&self) -> &MetricsRegistry {
        self.executor.metrics()
    }

    pub fn scope(&self, settings: &SettingsConfig) -> QueryScope {
        QueryScope::new(self.label.clone(), normalize_settings(settings))
    }
}

/// Receive the next record; `None` once the queue is closed and drained or the run is cancelled
pub async fn next_record(inbound: &Inbound, cancel: &CancellationToken) -> Option<Record> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        msg = inbound.recv() => msg.ok(),
    }
}

/// Send a record downstream; `false` when the run is cancelled or downstream is gone
pub async fn forward(ctx: &StageContext, outbound: &Outbound, record: Record) -> bool {
    let started = Instant::now();

    let sent = tokio::select! {
        biased;
        _ = ctx.cancel.cancelled() => false,
        res = outbound.send(record) => res.is_ok(),
    };

    if sent {
        ctx.metrics().observe_out_queue(&ctx.label, started.elapsed());
    }
    sent
}

/// Run one worker of a stage until its inbound queue is drained or the run is cancelled
pub async fn run_stage(
    ctx: StageContext,
    kind: &StageKind,
    inbound: Inbound,
    outbound: Outbound,
) -> Result<(), PipelineError> {
    debug!(kind = kind.name(), "started");

    let result = match kind {
        StageKind::Execute(conf) => run_execute_stage(&ctx, conf, &inbound, &outbound).await,
        StageKind::Sequence(_) => {
            run_sequence_stage(&ctx, &inbound, &outbound).await;
            Ok(())
        }
        StageKind::Debug(conf) => {
            run_debug_stage(&ctx, conf, &inbound, &outbound).await;
            Ok(())
        }
        StageKind::Sleep(conf) => {
            run_sleep_stage(&ctx, conf, &inbound, &outbound).await;
            Ok(())
        }
        StageKind::Buffer(conf) => run_buffer_stage(&ctx, conf, &inbound, &outbound).await,
        StageKind::Metrics(conf) => run_metrics_stage(&ctx, conf, &inbound, &outbound).await,
    };

    debug!("stopped");
    result
}

async fn run_execute_stage(
    ctx: &StageContext,
    conf: &ExecuteStageConfig,
    inbound: &Inbound,
    outbound: &Outbound,
) -> Result<(), PipelineError> {
    let scope = ctx.scope(&conf.settings);

    while let Some(record) = next_record(inbound, &ctx.cancel).await {
        let mut task_vars = Vars::new();
        task_vars.insert(TASK_ID_VAR.to_string(), Value::String(record.id()));
        let vars = merge_vars([&task_vars, &record.vars, ctx.common.as_ref()]);

        let out = ctx
            .executor
            .run_queries(&scope, &conf.queries, &vars)
            .await?;

        let record = Record {
            vars: out.output_vars(&record.vars),
            ..record
        };
        if !forward(ctx, outbound, record).await {
            break;
        }
    }

    Ok(())
}

async fn run_debug_stage(
    ctx: &StageContext,
    conf: &DebugStageConfig,
    inbound: &Inbound,
    outbound: &Outbound,
) {
    while let Some(record) = next_record(inbound, &ctx.cancel).await {
        let json = if conf.pretty {
            serde_json::to_string_pretty(&record)
        } else {
            serde_json::to_string(&record)
        }
        .unwrap_or_default();

        match &conf.id {
            Some(id) => println!("{} {}", id, json),
            None => println!("{}", json),
        }

        if !forward(ctx, outbound, record).await {
            break;
        }
    }
}

async fn run_sleep_stage(
    ctx: &StageContext,
    conf: &SleepStageConfig,
    inbound: &Inbound,
    outbound: &Outbound,
) {
    let duration = conf.duration();

    while let Some(record) = next_record(inbound, &ctx.cancel).await {
        tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => break,
            _ = sleep(duration) => {}
        }

        if !forward(ctx, outbound, record).await {
            break;
        }
    }
}

async fn run_metrics_stage(
    ctx: &StageContext,
    conf: &MetricsStageConfig,
    inbound: &Inbound,
    outbound: &Outbound,
) -> Result<(), PipelineError> {
    for metric in &conf.metrics {
        ctx.metrics().register_user_metric(&metric.name, metric.kind)?;
    }

    let scope = ctx.scope(&conf.settings);

    while let Some(record) = next_record(inbound, &ctx.cancel).await {
        let vars = merge_vars([&record.vars, ctx.common.as_ref()]);
        let out = ctx.executor.run_query(&scope, &conf.query, &vars).await?;

        let [row] = out.rows.as_slice() else {
            return Err(PipelineError::query_shape(
                &conf.query.name,
                format!("must return exactly 1 row: {} returned", out.rows.len()),
            ));
        };

        for metric in &conf.metrics {
            let value = row.get(&metric.name).ok_or_else(|| {
                PipelineError::query_shape(
                    &conf.query.name,
                    format!("has no `{}` column", metric.name),
                )
            })?;

            match metric.kind {
                MetricType::Counter => {
                    let v = value.as_i64().ok_or_else(|| {
                        PipelineError::query_shape(
                            &conf.query.name,
                            format!("column `{}` is not an integer: {:?}", metric.name, value),
                        )
                    })?;
                    ctx.metrics().inc_user_counter(&ctx.label, &metric.name, v)?;
                }
                MetricType::Gauge => {
                    let v = value.as_f64().ok_or_else(|| {
                        PipelineError::query_shape(
                            &conf.query.name,
                            format!("column `{}` is not a number: {:?}", metric.name, value),
                        )
                    })?;
                    ctx.metrics().set_user_gauge(&ctx.label, &metric.name, v)?;
                }
            }
        }

        if !forward(ctx, outbound, record).await {
            break;
        }
    }

    Ok(())
}
