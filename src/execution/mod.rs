//! Pipeline execution: query running, stages and the orchestrator

pub mod accumulator;
pub mod error;
pub mod finalizer;
pub mod metrics;
pub mod pipeline;
pub mod query;
pub mod sequencer;
pub mod source;
pub mod stage;
pub mod template;

pub use accumulator::Batch;
pub use error::PipelineError;
pub use metrics::{serve_metrics, MetricsRegistry};
pub use pipeline::{run_pipeline, RUN_ID_VAR};
pub use query::{QueryExecutor, QueryScope};
pub use sequencer::Sequencer;
pub use template::{SqlTemplates, TemplateError, TemplateRenderer};
