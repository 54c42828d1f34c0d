//! Core domain models for sqlflow
//!
//! This module defines the records flowing through a pipeline, the typed
//! values they carry, and the run configuration.

pub mod config;
pub mod metadata;
pub mod query_ref;
pub mod record;
pub mod value;

pub use config::{PipelineConfig, RunConfig, StageConfig, StageKind};
pub use metadata::QueryMetadata;
pub use query_ref::QueryRef;
pub use record::{Record, Vars};
pub use value::Value;
