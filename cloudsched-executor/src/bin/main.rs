//! Executor binary: run one test attempt for one flavor.
//!
//! The process exit code is the attempt's classified status code;
//! configuration problems abort with exit code 1 before any attempt
//! starts.

use std::path::PathBuf;
use std::process::exit;

use anyhow::Result;
use clap::Parser;
use cloudsched_executor::TestExecutor;
use tracing_subscriber::EnvFilter;

/// Execute one containerized cloud compatibility test.
#[derive(Parser)]
#[command(name = "cloudsched-executor")]
#[command(about = "Execute a containerized cloud compatibility test for one flavor")]
struct Cli {
    /// TOML configuration file
    #[arg(long, default_value = "./config.toml")]
    config: PathBuf,

    /// Instance type to test
    #[arg(long)]
    flavor: String,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let config = cloudsched_config::load_config(&cli.config)?;
    let executor = TestExecutor::new(&config)?;

    exit(executor.run(&cli.flavor));
}
