//! Update binary: write a one-shot patch beside the task list.
//!
//! The running scheduler consumes the patch on its next producer
//! tick. Refuses to overwrite a patch that has not been consumed yet.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use cloudsched_scheduler::patch::patch_path;
use cloudsched_scheduler::{PatchAction, PatchRecord};
use tracing_subscriber::EnvFilter;

/// Update tasks of the cloudsched scheduler by patching the task list.
#[derive(Parser)]
#[command(name = "cloudsched-update")]
#[command(about = "Update tasks of the cloudsched scheduler by patching the task list")]
struct Cli {
    /// TOML task list file
    #[arg(long, default_value = "./tasklist.toml")]
    tasklist: PathBuf,

    /// Flavor (task) in the task list
    #[arg(long)]
    flavor: String,

    /// The action to perform
    #[arg(long, value_parser = ["SCHEDULE", "WITHDRAW"])]
    action: Option<String>,

    /// The "remaining_retries_testcase" to update to
    #[arg(long)]
    remaining_retries_testcase: Option<u32>,

    /// The "remaining_retries_resource" to update to
    #[arg(long)]
    remaining_retries_resource: Option<u32>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let cli = Cli::parse();

    if !cli.tasklist.exists() {
        bail!(
            "cannot find the task list ({}) to be patched",
            cli.tasklist.display()
        );
    }

    let patch_file = patch_path(&cli.tasklist);
    if patch_file.exists() {
        bail!("patch file ({}) already exists", patch_file.display());
    }

    let action = cli.action.as_deref().map(|action| match action {
        "SCHEDULE" => PatchAction::Schedule,
        _ => PatchAction::Withdraw,
    });

    let record = PatchRecord {
        action,
        remaining_retries_testcase: cli.remaining_retries_testcase,
        remaining_retries_resource: cli.remaining_retries_resource,
    };

    if record.action.is_none()
        && record.remaining_retries_testcase.is_none()
        && record.remaining_retries_resource.is_none()
    {
        // Nothing to patch.
        return Ok(());
    }

    let patches = BTreeMap::from([(cli.flavor, record)]);
    let content = toml::to_string(&patches).context("failed to serialize the patch")?;
    std::fs::write(&patch_file, content)
        .with_context(|| format!("failed to dump the patch to {}", patch_file.display()))?;

    Ok(())
}
