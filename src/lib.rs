//! sqlflow - A SQL-driven streaming ETL runtime on top of ClickHouse

pub mod cli;
pub mod core;
pub mod engine;
pub mod execution;

// Re-export commonly used types
pub use core::{PipelineConfig, QueryRef, Record, RunConfig, Value, Vars};
pub use engine::{ComputeEngine, EngineConfig, EngineError};
pub use execution::{run_pipeline, MetricsRegistry, PipelineError, SqlTemplates, TemplateRenderer};
