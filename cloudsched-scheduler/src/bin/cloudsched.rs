//! Scheduler binary: run a batch of containerized cloud tests.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use cloudsched_scheduler::TestScheduler;
use tracing_subscriber::EnvFilter;

/// Schedule containerized cloud compatibility tests.
#[derive(Parser)]
#[command(name = "cloudsched")]
#[command(about = "Schedule containerized cloud compatibility tests")]
struct Cli {
    /// TOML configuration file
    #[arg(long, default_value = "./config.toml")]
    config: PathBuf,

    /// TOML task list file
    #[arg(long, default_value = "./tasklist.toml")]
    tasklist: PathBuf,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let config = cloudsched_config::load_config(&cli.config)?;
    let scheduler = TestScheduler::new(&config, cli.config.clone(), cli.tasklist.clone())?;
    scheduler.run()?;

    Ok(())
}
