//! Pipeline error types

use crate::core::config::ConfigError;
use crate::engine::EngineError;
use crate::execution::metrics::MetricsError;
use crate::execution::template::TemplateError;
use thiserror::Error;

/// Errors that end a pipeline run
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A query returned a result whose shape its stage cannot use
    #[error("configuration error: query {name} {reason}")]
    QueryShape { name: String, reason: String },

    #[error("failed to render {name} template: {source}")]
    Template {
        name: String,
        #[source]
        source: TemplateError,
    },

    /// Query failure not covered by the query's failure policy
    #[error("failed to execute query {name}(vars={vars}): {source}")]
    Query {
        name: String,
        vars: String,
        #[source]
        source: EngineError,
    },

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Metrics(#[from] MetricsError),

    #[error("{unit} task failed: {message}")]
    Task { unit: String, message: String },
}

impl PipelineError {
    pub fn query_shape(name: &str, reason: impl Into<String>) -> Self {
        PipelineError::QueryShape {
            name: name.to_string(),
            reason: reason.into(),
        }
    }
}
