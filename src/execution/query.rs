//! Query executor: render, execute, apply the failure policy, record metrics

use crate::core::config::Settings;
use crate::core::metadata::QueryMetadata;
use crate::core::query_ref::QueryRef;
use crate::core::record::Vars;
use crate::engine::{ComputeEngine, EngineError, QueryOutput};
use crate::execution::error::PipelineError;
use crate::execution::metrics::MetricsRegistry;
use crate::execution::template::TemplateRenderer;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace, warn};

/// Value substituted for sensitive variables in error messages
pub const REDACTED: &str = "******";

const SENSITIVE_KEYWORDS: [&str; 4] = ["url", "pass", "secret", "key"];

/// Where a query runs from: metrics label plus per-stage engine settings
#[derive(Debug, Clone, Default)]
pub struct QueryScope {
    pub stage: String,
    pub settings: Settings,
}

impl QueryScope {
    pub fn new(stage: impl Into<String>, settings: Settings) -> Self {
        Self {
            stage: stage.into(),
            settings,
        }
    }
}

/// Result of running a list of queries
#[derive(Debug, Clone, Default)]
pub struct QueriesOutput {
    /// Rows of the last query that returned rows and does not ignore its output
    pub rows: Option<Vec<Vars>>,
    pub metadata: QueryMetadata,
}

impl QueriesOutput {
    /// Last output row, if any query produced one
    pub fn last_row(&self) -> Option<&Vars> {
        self.rows.as_ref().and_then(|rows| rows.last())
    }

    /// Vars to carry forward: the output row, or `fallback` when there is none
    pub fn output_vars(&self, fallback: &Vars) -> Vars {
        self.last_row().cloned().unwrap_or_else(|| fallback.clone())
    }
}

/// Shared entry point for every query the pipeline runs
#[derive(Clone)]
pub struct QueryExecutor {
    engine: Arc<dyn ComputeEngine>,
    templates: Arc<dyn TemplateRenderer>,
    metrics: MetricsRegistry,
}

impl QueryExecutor {
    pub fn new(
        engine: Arc<dyn ComputeEngine>,
        templates: Arc<dyn TemplateRenderer>,
        metrics: MetricsRegistry,
    ) -> Self {
        Self {
            engine,
            templates,
            metrics,
        }
    }

    pub fn metrics(&self) -> &MetricsRegistry {
        &self.metrics
    }

    /// Run one query
    ///
    /// A failure tolerated by the query's policy yields an empty result.
    pub async fn run_query(
        &self,
        scope: &QueryScope,
        query: &QueryRef,
        vars: &Vars,
    ) -> Result<QueryOutput, PipelineError> {
        let started = Instant::now();

        let text = self
            .templates
            .render(&query.name, vars)
            .map_err(|source| PipelineError::Template {
                name: query.name.clone(),
                source,
            })?;

        trace!(query = %query.name, sql = %text.replace('\n', " "), "rendered query");

        let result = {
            let _active = self.metrics.stage_active(&scope.stage);
            self.engine.query(&text, &scope.settings).await
        };

        let output = match result {
            Ok(output) => output,
            Err(e) if is_tolerated(query, &e) => {
                warn!(query = %query.name, error = %e, "ignoring query failure");
                self.metrics.inc_query_errors(&scope.stage, &query.name, true);
                QueryOutput::default()
            }
            Err(source) => {
                self.metrics.inc_query_errors(&scope.stage, &query.name, false);
                return Err(PipelineError::Query {
                    name: query.name.clone(),
                    vars: redacted_json(vars),
                    source,
                });
            }
        };

        let md = &output.metadata;
        debug!(
            query = %query.name,
            rows = md.rows,
            bytes = md.bytes,
            total_rows = md.total_rows,
            wrote_rows = md.wrote_rows,
            wrote_bytes = md.wrote_bytes,
            elapsed = ?md.elapsed,
            memory_peak_usage = md.memory_peak_usage,
            "summary"
        );

        self.metrics
            .record_query(&scope.stage, &query.name, started.elapsed(), md);

        Ok(output)
    }

    /// Run queries strictly in order with the same vars
    pub async fn run_queries(
        &self,
        scope: &QueryScope,
        queries: &[QueryRef],
        vars: &Vars,
    ) -> Result<QueriesOutput, PipelineError> {
        let mut out = QueriesOutput::default();

        for query in queries {
            let result = self.run_query(scope, query, vars).await?;
            if !result.rows.is_empty() && !query.ignore_output {
                out.rows = Some(result.rows);
            }
            out.metadata.merge(&result.metadata);
        }

        Ok(out)
    }
}

/// Whether `query`'s policy swallows `err`
pub fn is_tolerated(query: &QueryRef, err: &EngineError) -> bool {
    if query.ignore_failure {
        return true;
    }
    err.exception_code()
        .is_some_and(|code| query.tolerates_code(code))
}

/// Copy of `vars` as JSON with sensitive values masked
pub fn redact_sensitive_vars(vars: &Vars) -> BTreeMap<String, serde_json::Value> {
    vars.iter()
        .map(|(k, v)| {
            let value = if is_sensitive(k) {
                serde_json::Value::String(REDACTED.to_string())
            } else {
                v.to_json()
            };
            (k.clone(), value)
        })
        .collect()
}

fn is_sensitive(key: &str) -> bool {
    let key = key.to_lowercase();
    SENSITIVE_KEYWORDS.iter().any(|kw| key.contains(kw))
}

fn redacted_json(vars: &Vars) -> String {
    serde_json::to_string(&redact_sensitive_vars(vars)).unwrap_or_default()
}
