//! Status binary: print the task list as a table.
//!
//! Read-only; safe to run beside a live scheduler.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{Local, NaiveDateTime};
use clap::Parser;
use cloudsched_scheduler::TaskRecord;
use tabled::settings::Style;
use tabled::{Table, Tabled};
use tracing_subscriber::EnvFilter;

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Show task status by reading the task list.
#[derive(Parser)]
#[command(name = "cloudsched-status")]
#[command(about = "Show task status of the cloudsched scheduler by reading the task list")]
struct Cli {
    /// TOML task list file
    #[arg(long, default_value = "./tasklist.toml")]
    tasklist: PathBuf,
}

#[derive(Tabled)]
struct StatusRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Flavor")]
    flavor: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "StatusCode")]
    status_code: String,
    #[tabled(rename = "RR(T/R)")]
    retries: String,
    #[tabled(rename = "RetryStatusCode")]
    retry_status_code: String,
    #[tabled(rename = "LogFile")]
    log_file: String,
    #[tabled(rename = "TimeUsed")]
    time_used: String,
}

fn status_row(index: usize, flavor: &str, record: &TaskRecord) -> StatusRow {
    let last_attempt = record.history.last();

    let status = record
        .status
        .map(|status| format!("{status:?}").to_uppercase())
        .unwrap_or_else(|| "None".to_string());
    let status_code = record
        .status_code
        .clone()
        .unwrap_or_else(|| "None".to_string());
    let retries = format!(
        "{}/{}",
        record
            .remaining_retries_testcase
            .map(|n| n.to_string())
            .unwrap_or_else(|| "None".to_string()),
        record
            .remaining_retries_resource
            .map(|n| n.to_string())
            .unwrap_or_else(|| "None".to_string()),
    );
    let retry_status_code = last_attempt
        .and_then(|attempt| attempt.status_code.clone())
        .unwrap_or_else(|| "None".to_string());
    let log_file = record
        .test_log
        .clone()
        .or_else(|| last_attempt.and_then(|attempt| attempt.test_log.clone()))
        .unwrap_or_else(|| "None".to_string());

    let time_used = if let Some(time_used) = &record.time_used {
        time_used.clone()
    } else if let Some(time_start) = &record.time_start {
        // Still running: elapsed since the recorded start.
        match NaiveDateTime::parse_from_str(time_start, TIME_FORMAT) {
            Ok(start) => {
                let elapsed = Local::now().naive_local() - start;
                format!("{:.2}", elapsed.num_milliseconds() as f64 / 1000.0)
            }
            Err(_) => "None".to_string(),
        }
    } else {
        last_attempt
            .and_then(|attempt| attempt.time_used.clone())
            .unwrap_or_else(|| "None".to_string())
    };

    StatusRow {
        index,
        flavor: flavor.to_string(),
        status,
        status_code,
        retries,
        retry_status_code,
        log_file,
        time_used,
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let cli = Cli::parse();

    let content = std::fs::read_to_string(&cli.tasklist)
        .with_context(|| format!("failed to load tasks from {}", cli.tasklist.display()))?;
    let tasks: BTreeMap<String, TaskRecord> = toml::from_str(&content)
        .with_context(|| format!("failed to load tasks from {}", cli.tasklist.display()))?;

    let rows: Vec<StatusRow> = tasks
        .iter()
        .enumerate()
        .map(|(index, (flavor, record))| status_row(index, flavor, record))
        .collect();

    let mut table = Table::new(rows);
    table.with(Style::psql());
    println!("{table}");

    Ok(())
}
