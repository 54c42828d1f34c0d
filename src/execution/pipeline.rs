//! Pipeline orchestrator
//!
//! Wires `source -> stage 0 .. stage N -> finalizer` with bounded queues and
//! supervises every unit in one [`JoinSet`]. The first unit error cancels
//! the run and is returned once every unit has wound down.

use crate::core::config::{normalize_settings, InitConfig, PipelineConfig};
use crate::core::record::{Record, Vars};
use crate::core::value::Value;
use crate::engine::ComputeEngine;
use crate::execution::error::PipelineError;
use crate::execution::finalizer::run_finalizer;
use crate::execution::metrics::MetricsRegistry;
use crate::execution::query::{redact_sensitive_vars, QueryExecutor, QueryScope};
use crate::execution::source::run_source;
use crate::execution::stage::{run_stage, StageContext};
use crate::execution::template::TemplateRenderer;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, Instrument};
use uuid::Uuid;

/// Variable holding the unique id of a run
pub const RUN_ID_VAR: &str = "RUN_ID";

/// Capacity of the queue between the source and the first stage
pub const SOURCE_CHANNEL_SIZE: usize = 3;

type UnitResult = (String, Result<(), PipelineError>);

/// Run a pipeline to completion
///
/// Returns `Ok(())` once the source is exhausted and every record drained,
/// or as soon as `cancel` is cancelled by the caller.
pub async fn run_pipeline(
    engine: Arc<dyn ComputeEngine>,
    templates: Arc<dyn TemplateRenderer>,
    vars: Vars,
    conf: &PipelineConfig,
    metrics: MetricsRegistry,
    cancel: CancellationToken,
) -> Result<(), PipelineError> {
    conf.validate()?;

    let executor = QueryExecutor::new(engine, templates, metrics.clone());

    let mut common = vars;
    common.insert(RUN_ID_VAR.to_string(), Value::String(Uuid::new_v4().to_string()));
    let init_vars = run_init(&executor, &common, &conf.init).await?;
    common.extend(init_vars);
    info!(run_id = %common[RUN_ID_VAR], "pipeline initialized");

    let common = Arc::new(common);
    let cancel = cancel.child_token();
    let mut units: JoinSet<UnitResult> = JoinSet::new();

    let (source_tx, mut upstream) = async_channel::bounded::<Record>(SOURCE_CHANNEL_SIZE);
    {
        let executor = executor.clone();
        let common = common.clone();
        let conf = conf.source.clone();
        let cancel = cancel.clone();
        units.spawn(
            async move {
                let result = run_source(&executor, &common, &conf, &source_tx, &cancel).await;
                ("source".to_string(), result)
            }
            .instrument(info_span!("source")),
        );
    }

    for (i, stage) in conf.stages.iter().enumerate() {
        let (tx, rx) = async_channel::bounded::<Record>(stage.channel_size.max(1));

        for j in 0..stage.worker_count() {
            let ctx = StageContext::new(i, j, executor.clone(), common.clone(), cancel.clone());
            let kind = stage.kind.clone();
            let inbound = upstream.clone();
            let outbound = tx.clone();
            units.spawn(
                async move {
                    let result = run_stage(ctx, &kind, inbound, outbound).await;
                    (format!("stage {} worker {}", i, j), result)
                }
                .instrument(info_span!("stage", stage = i, worker = j)),
            );
        }

        upstream = rx;
    }

    {
        let metrics = metrics.clone();
        let cancel = cancel.clone();
        units.spawn(
            async move {
                run_finalizer(&upstream, &metrics, &cancel).await;
                ("finalizer".to_string(), Ok(()))
            }
            .instrument(info_span!("finalizer")),
        );
    }

    let result = supervise(&mut units, &cancel).await;
    info!(finalized = metrics.finalized(), "pipeline finished running");
    result
}

/// Run the init queries; returns their output row (empty when none)
async fn run_init(
    executor: &QueryExecutor,
    vars: &Vars,
    conf: &InitConfig,
) -> Result<Vars, PipelineError> {
    if conf.queries.is_empty() {
        return Ok(Vars::new());
    }

    let scope = QueryScope::new("init", normalize_settings(&conf.settings));
    let out = executor.run_queries(&scope, &conf.queries, vars).await?;
    let row = out.last_row().cloned().unwrap_or_default();

    info!(vars = ?redact_sensitive_vars(&row), "init vars");
    Ok(row)
}

/// Wait for every unit; the first failure cancels the others
async fn supervise(
    units: &mut JoinSet<UnitResult>,
    cancel: &CancellationToken,
) -> Result<(), PipelineError> {
    let mut first_error: Option<PipelineError> = None;

    while let Some(joined) = units.join_next().await {
        let (unit, result) = match joined {
            Ok(unit_result) => unit_result,
            Err(e) => (
                "pipeline".to_string(),
                Err(PipelineError::Task {
                    unit: "pipeline".to_string(),
                    message: e.to_string(),
                }),
            ),
        };

        match result {
            Ok(()) => debug!(unit = %unit, "unit finished"),
            Err(e) if first_error.is_none() => {
                error!(unit = %unit, error = %e, "unit failed");
                cancel.cancel();
                first_error = Some(e);
            }
            Err(e) => debug!(unit = %unit, error = %e, "unit failed after cancellation"),
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
