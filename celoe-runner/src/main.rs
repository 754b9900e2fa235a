//! Command line entry point for the celoeapi reporting ETL.
//!
//! Loads configuration, connects to the Moodle source and the reporting
//! target, and dispatches one engine operation per invocation. Scheduling is
//! left to cron or whatever runs this binary.

use anyhow::Result;
use celoe_telemetry::tracing::init_tracing;
use clap::Parser;

use crate::core::Args;

mod core;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let args = Args::parse();
    core::run(args).await
}
