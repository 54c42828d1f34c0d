//! Windowed accumulation of records (the buffer stage)
//!
//! A window opens on the first record after an idle period and folds every
//! following record into the batch vars with the merge queries. It closes
//! when any trigger fires:
//!
//! - the batch size reaches `max_size`
//! - the condition query returns `value = 0`
//! - `max_duration_ms` elapses since the window opened
//! - the inbound queue closes
//!
//! A closed window is emitted downstream as one record spanning the
//! sequence range of everything it absorbed.

use crate::core::config::BufferStageConfig;
use crate::core::query_ref::QueryRef;
use crate::core::record::{merge_range, merge_vars, vars_to_value, Record, Vars};
use crate::execution::error::PipelineError;
use crate::execution::query::QueryScope;
use crate::execution::stage::{forward, Inbound, Outbound, StageContext};
use std::time::Duration;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info};

pub const LEFT_VAR: &str = "LEFT";
pub const RIGHT_VAR: &str = "RIGHT";

/// An open window
#[derive(Debug, Clone)]
pub struct Batch {
    pub vars: Vars,
    pub size: u64,
    deadline: Option<Instant>,
    sequence_start: u64,
    sequence_end: u64,
}

impl Batch {
    /// Open a window on `first`; the deadline is armed now
    pub fn open(first: &Record, max_duration: Option<Duration>) -> Self {
        Self {
            vars: Vars::new(),
            size: 0,
            deadline: max_duration.map(|d| Instant::now() + d),
            sequence_start: first.sequence_start,
            sequence_end: first.sequence_end,
        }
    }

    /// Widen the batch range to cover `record`
    pub fn include(&mut self, record: &Record) {
        let (start, end) = merge_range(self.range(), (record.sequence_start, record.sequence_end));
        self.sequence_start = start;
        self.sequence_end = end;
    }

    pub fn range(&self) -> (u64, u64) {
        (self.sequence_start, self.sequence_end)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// The record emitted when the window closes
    pub fn into_record(self) -> Record {
        Record::with_range(self.sequence_start, self.sequence_end, self.vars)
    }
}

enum Event {
    Cancelled,
    Deadline,
    Record(Record),
    Closed,
}

async fn deadline_elapsed(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Stage loop around [`Batch`]
pub async fn run_buffer_stage(
    ctx: &StageContext,
    conf: &BufferStageConfig,
    inbound: &Inbound,
    outbound: &Outbound,
) -> Result<(), PipelineError> {
    conf.validate()?;

    let acc = Accumulator {
        ctx,
        conf,
        scope: ctx.scope(&conf.settings),
        max_size: conf.max_size.filter(|n| *n > 0),
    };
    let mut batch: Option<Batch> = None;

    loop {
        let deadline = batch.as_ref().and_then(Batch::deadline);

        let event = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => Event::Cancelled,
            _ = deadline_elapsed(deadline) => Event::Deadline,
            msg = inbound.recv() => msg.map_or(Event::Closed, Event::Record),
        };

        let inbound_closed = match event {
            Event::Cancelled => return Ok(()),
            Event::Deadline => {
                debug!("window deadline reached");
                false
            }
            Event::Closed => true,
            Event::Record(record) => {
                let mut current = match batch.take() {
                    Some(b) => b,
                    None => acc.open(&record).await?,
                };

                let keep_open = acc.ingest(&mut current, &record).await?;
                batch = Some(current);
                if keep_open {
                    continue;
                }
                false
            }
        };

        if let Some(closing) = batch.take() {
            if !acc.flush(closing, outbound).await? {
                return Ok(());
            }
        }

        if inbound_closed {
            return Ok(());
        }
    }
}

struct Accumulator<'a> {
    ctx: &'a StageContext,
    conf: &'a BufferStageConfig,
    scope: QueryScope,
    max_size: Option<u64>,
}

impl Accumulator<'_> {
    async fn open(&self, first: &Record) -> Result<Batch, PipelineError> {
        debug!(id = %first.id(), "window opened");

        if let Some(enter) = &self.conf.enter {
            let vars = merge_vars([self.ctx.common.as_ref(), &first.vars]);
            self.ctx.executor.run_query(&self.scope, enter, &vars).await?;
        }

        Ok(Batch::open(first, self.conf.max_duration()))
    }

    /// Fold `record` into the batch; returns whether the window stays open
    async fn ingest(&self, batch: &mut Batch, record: &Record) -> Result<bool, PipelineError> {
        let mut sides = Vars::new();
        sides.insert(LEFT_VAR.to_string(), vars_to_value(&batch.vars));
        sides.insert(RIGHT_VAR.to_string(), record.vars_value());
        let vars = merge_vars([&sides, self.ctx.common.as_ref()]);

        let out = self
            .ctx
            .executor
            .run_queries(&self.scope, &self.conf.queries, &vars)
            .await?;
        batch.vars = out.output_vars(&batch.vars);
        batch.include(record);

        batch.size = match &self.conf.size {
            None => batch.size + 1,
            Some(query) => self.query_size(query, batch).await?,
        };

        if self.max_size.is_some_and(|max| batch.size >= max) {
            debug!(size = batch.size, "window reached max size");
            return Ok(false);
        }

        if let Some(condition) = &self.conf.condition {
            if !self.query_condition(condition, batch).await? {
                debug!(size = batch.size, "window condition is false");
                return Ok(false);
            }
        }

        Ok(true)
    }

    async fn query_size(&self, query: &QueryRef, batch: &Batch) -> Result<u64, PipelineError> {
        let vars = merge_vars([&batch.vars, self.ctx.common.as_ref()]);
        let out = self.ctx.executor.run_query(&self.scope, query, &vars).await?;

        let [row] = out.rows.as_slice() else {
            return Err(PipelineError::query_shape(
                &query.name,
                format!("must return exactly 1 row: {} returned", out.rows.len()),
            ));
        };

        let size = row
            .get("size")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| {
                PipelineError::query_shape(
                    &query.name,
                    format!(
                        "must return a `size` column holding an unsigned integer: returned {:?}",
                        row
                    ),
                )
            })?;

        debug!(size, "size query run");
        Ok(size)
    }

    async fn query_condition(&self, query: &QueryRef, batch: &Batch) -> Result<bool, PipelineError> {
        let vars = merge_vars([self.ctx.common.as_ref(), &batch.vars]);
        let out = self.ctx.executor.run_query(&self.scope, query, &vars).await?;

        let [row] = out.rows.as_slice() else {
            return Err(PipelineError::query_shape(
                &query.name,
                format!("must return exactly 1 row: {} returned", out.rows.len()),
            ));
        };

        let value = row
            .get("value")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| {
                PipelineError::query_shape(
                    &query.name,
                    format!("must return a `value` column holding an integer: returned {:?}", row),
                )
            })?;

        Ok(value > 0)
    }

    /// Run the leave query and emit the batch; `false` when downstream is gone
    async fn flush(&self, batch: Batch, outbound: &Outbound) -> Result<bool, PipelineError> {
        if let Some(leave) = &self.conf.leave {
            let vars = merge_vars([self.ctx.common.as_ref(), &batch.vars]);
            self.ctx.executor.run_query(&self.scope, leave, &vars).await?;
        }

        let size = batch.size;
        let record = batch.into_record();
        let id = record.id();

        let sent = forward(self.ctx, outbound, record).await;
        if sent {
            info!(id = %id, size, "yield batch");
        }
        Ok(sent)
    }
}
