//! Prometheus metrics for queries, stages and user-declared metrics

use crate::core::config::MetricType;
use crate::core::metadata::QueryMetadata;
use axum::{extract::State, routing::get, Router};
use parking_lot::Mutex;
use prometheus::{
    exponential_buckets, CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, IntCounter,
    Opts, Registry, TextEncoder,
};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error(transparent)]
    Prometheus(#[from] prometheus::Error),

    #[error("metric '{name}' is already registered as a {existing:?}")]
    TypeConflict { name: String, existing: MetricType },

    #[error("metric '{0}' is not registered")]
    Unknown(String),

    #[error("counter '{name}' cannot decrease (got {value})")]
    NegativeIncrement { name: String, value: i64 },
}

#[derive(Clone, Debug)]
pub struct MetricsRegistry {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    registry: Registry,
    query_execution_seconds: HistogramVec,
    query_elapsed_seconds: HistogramVec,
    query_rows: CounterVec,
    query_bytes: CounterVec,
    query_total_rows: CounterVec,
    query_wrote_rows: CounterVec,
    query_wrote_bytes: CounterVec,
    query_memory_peak_usage: GaugeVec,
    query_errors: CounterVec,
    stage_active: GaugeVec,
    stage_out_queue_seconds: HistogramVec,
    finalized_records: IntCounter,
    user: Mutex<HashMap<String, UserMetric>>,
}

#[derive(Debug, Clone)]
enum UserMetric {
    Counter(CounterVec),
    Gauge(GaugeVec),
}

impl MetricsRegistry {
    pub fn new() -> Result<Self, MetricsError> {
        Ok(Self {
            inner: Arc::new(MetricsInner::new()?),
        })
    }

    /// Record one query execution: wall time plus server-side counters
    pub fn record_query(&self, stage: &str, query: &str, execution_time: Duration, md: &QueryMetadata) {
        let labels = [stage, query];
        let inner = &self.inner;

        inner
            .query_execution_seconds
            .with_label_values(&labels)
            .observe(execution_time.as_secs_f64());
        inner
            .query_elapsed_seconds
            .with_label_values(&labels)
            .observe(md.elapsed.as_secs_f64());
        inner.query_rows.with_label_values(&labels).inc_by(md.rows as f64);
        inner.query_bytes.with_label_values(&labels).inc_by(md.bytes as f64);
        inner
            .query_total_rows
            .with_label_values(&labels)
            .inc_by(md.total_rows as f64);
        inner
            .query_wrote_rows
            .with_label_values(&labels)
            .inc_by(md.wrote_rows as f64);
        inner
            .query_wrote_bytes
            .with_label_values(&labels)
            .inc_by(md.wrote_bytes as f64);
        inner
            .query_memory_peak_usage
            .with_label_values(&labels)
            .set(md.memory_peak_usage as f64);
    }

    pub fn inc_query_errors(&self, stage: &str, query: &str, ignored: bool) {
        let ignored = if ignored { "true" } else { "false" };
        self.inner
            .query_errors
            .with_label_values(&[stage, query, ignored])
            .inc();
    }

    /// Mark a query of `stage` in flight until the guard drops
    pub fn stage_active(&self, stage: &str) -> ActiveGuard {
        let gauge = self.inner.stage_active.with_label_values(&[stage]);
        gauge.inc();
        ActiveGuard { gauge }
    }

    /// Time a record waited to be accepted by the next stage
    pub fn observe_out_queue(&self, stage: &str, waited: Duration) {
        self.inner
            .stage_out_queue_seconds
            .with_label_values(&[stage])
            .observe(waited.as_secs_f64());
    }

    pub fn inc_finalized(&self) {
        self.inner.finalized_records.inc();
    }

    pub fn finalized(&self) -> u64 {
        self.inner.finalized_records.get()
    }

    /// Declare a user metric; redeclaring with the same type is a no-op
    pub fn register_user_metric(&self, name: &str, kind: MetricType) -> Result<(), MetricsError> {
        let mut user = self.inner.user.lock();

        if let Some(existing) = user.get(name) {
            let existing_kind = match existing {
                UserMetric::Counter(_) => MetricType::Counter,
                UserMetric::Gauge(_) => MetricType::Gauge,
            };
            if existing_kind != kind {
                return Err(MetricsError::TypeConflict {
                    name: name.to_string(),
                    existing: existing_kind,
                });
            }
            return Ok(());
        }

        let help = format!("User metric {}", name);
        let metric = match kind {
            MetricType::Counter => {
                UserMetric::Counter(counter_vec(&self.inner.registry, name, &help, &["stage"])?)
            }
            MetricType::Gauge => {
                UserMetric::Gauge(gauge_vec(&self.inner.registry, name, &help, &["stage"])?)
            }
        };
        user.insert(name.to_string(), metric);
        Ok(())
    }

    pub fn inc_user_counter(&self, stage: &str, name: &str, value: i64) -> Result<(), MetricsError> {
        if value < 0 {
            return Err(MetricsError::NegativeIncrement {
                name: name.to_string(),
                value,
            });
        }
        match self.inner.user.lock().get(name) {
            Some(UserMetric::Counter(c)) => {
                c.with_label_values(&[stage]).inc_by(value as f64);
                Ok(())
            }
            Some(UserMetric::Gauge(_)) => Err(MetricsError::TypeConflict {
                name: name.to_string(),
                existing: MetricType::Gauge,
            }),
            None => Err(MetricsError::Unknown(name.to_string())),
        }
    }

    pub fn set_user_gauge(&self, stage: &str, name: &str, value: f64) -> Result<(), MetricsError> {
        match self.inner.user.lock().get(name) {
            Some(UserMetric::Gauge(g)) => {
                g.with_label_values(&[stage]).set(value);
                Ok(())
            }
            Some(UserMetric::Counter(_)) => Err(MetricsError::TypeConflict {
                name: name.to_string(),
                existing: MetricType::Counter,
            }),
            None => Err(MetricsError::Unknown(name.to_string())),
        }
    }

    pub fn render_prometheus(&self) -> String {
        let metric_families = self.inner.registry.gather();
        let mut out = Vec::new();
        let enc = TextEncoder::new();
        if enc.encode(&metric_families, &mut out).is_err() {
            return String::new();
        }
        String::from_utf8_lossy(&out).to_string()
    }
}

/// Decrements the stage `active` gauge on drop
pub struct ActiveGuard {
    gauge: prometheus::Gauge,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.gauge.dec();
    }
}

impl MetricsInner {
    fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();
        let query_labels = &["stage", "query"];

        let query_execution_seconds = histogram_vec(
            &registry,
            "sqlflow_query_execution_seconds",
            "Wall time of query executions",
            query_labels,
            exponential_buckets(0.1, 2.0, 10)?,
        )?;
        let query_elapsed_seconds = histogram_vec(
            &registry,
            "sqlflow_query_elapsed_seconds",
            "Server-side elapsed time of query executions",
            query_labels,
            exponential_buckets(0.1, 2.0, 10)?,
        )?;
        let query_rows = counter_vec(
            &registry,
            "sqlflow_query_rows_total",
            "Rows read by queries",
            query_labels,
        )?;
        let query_bytes = counter_vec(
            &registry,
            "sqlflow_query_bytes_total",
            "Bytes read by queries",
            query_labels,
        )?;
        let query_total_rows = counter_vec(
            &registry,
            "sqlflow_query_total_rows_total",
            "Total rows to read reported by queries",
            query_labels,
        )?;
        let query_wrote_rows = counter_vec(
            &registry,
            "sqlflow_query_wrote_rows_total",
            "Rows written by queries",
            query_labels,
        )?;
        let query_wrote_bytes = counter_vec(
            &registry,
            "sqlflow_query_wrote_bytes_total",
            "Bytes written by queries",
            query_labels,
        )?;
        let query_memory_peak_usage = gauge_vec(
            &registry,
            "sqlflow_query_memory_peak_usage_bytes",
            "Peak memory usage of the last execution",
            query_labels,
        )?;
        let query_errors = counter_vec(
            &registry,
            "sqlflow_query_errors_total",
            "Failed query executions",
            &["stage", "query", "ignored"],
        )?;

        let stage_active = gauge_vec(
            &registry,
            "sqlflow_stage_active",
            "Queries currently running per stage",
            &["stage"],
        )?;
        let stage_out_queue_seconds = histogram_vec(
            &registry,
            "sqlflow_stage_out_queue_seconds",
            "Time spent waiting on the outbound queue",
            &["stage"],
            exponential_buckets(0.005, 2.0, 20)?,
        )?;

        let finalized_records = IntCounter::new(
            "sqlflow_finalized_records_total",
            "Records that reached the finalizer",
        )?;
        registry.register(Box::new(finalized_records.clone()))?;

        Ok(Self {
            registry,
            query_execution_seconds,
            query_elapsed_seconds,
            query_rows,
            query_bytes,
            query_total_rows,
            query_wrote_rows,
            query_wrote_bytes,
            query_memory_peak_usage,
            query_errors,
            stage_active,
            stage_out_queue_seconds,
            finalized_records,
            user: Mutex::new(HashMap::new()),
        })
    }
}

fn counter_vec(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> Result<CounterVec, prometheus::Error> {
    let c = CounterVec::new(Opts::new(name, help), labels)?;
    registry.register(Box::new(c.clone()))?;
    Ok(c)
}

fn gauge_vec(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> Result<GaugeVec, prometheus::Error> {
    let g = GaugeVec::new(Opts::new(name, help), labels)?;
    registry.register(Box::new(g.clone()))?;
    Ok(g)
}

fn histogram_vec(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
    buckets: Vec<f64>,
) -> Result<HistogramVec, prometheus::Error> {
    let h = HistogramVec::new(HistogramOpts::new(name, help).buckets(buckets), labels)?;
    registry.register(Box::new(h.clone()))?;
    Ok(h)
}

/// Serve `GET /metrics` on `addr` until `cancel` fires
pub async fn serve_metrics(
    addr: SocketAddr,
    metrics: MetricsRegistry,
    cancel: CancellationToken,
) -> io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "serving metrics");
    serve_metrics_listener(listener, metrics, cancel).await
}

pub async fn serve_metrics_listener(
    listener: TcpListener,
    metrics: MetricsRegistry,
    cancel: CancellationToken,
) -> io::Result<()> {
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metrics);
    axum::serve(listener, app)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
        .map_err(io::Error::other)
}

async fn metrics_handler(State(metrics): State<MetricsRegistry>) -> String {
    metrics.render_prometheus()
}
