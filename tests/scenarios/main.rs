//! Scenario-based tests for sqlflow

mod helpers;

mod accumulator_windows;
mod error_policy;
mod pipeline_flow;
mod startup_probe;
