//! Command-line interface

pub mod commands;
pub mod output;

use clap::{Parser, Subcommand};
use commands::{RenderCommand, RunCommand, ValidateCommand};
use std::ffi::OsString;

/// SQL-driven streaming ETL on top of ClickHouse
#[derive(Debug, Parser, Clone)]
#[command(name = "sqlflow")]
#[command(version = "0.1.0")]
#[command(about = "A SQL-driven streaming ETL runtime on top of ClickHouse", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

/// Available commands
#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run a pipeline
    Run(RunCommand),

    /// Render query templates with the given vars
    Render(RenderCommand),

    /// Validate a run file
    Validate(ValidateCommand),
}

impl Cli {
    /// Parse CLI arguments from environment
    pub fn from_args() -> Self {
        Self::parse()
    }

    /// Parse CLI arguments from a slice
    pub fn try_parse_from<I, T>(itr: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        <Self as Parser>::try_parse_from(itr)
    }
}
