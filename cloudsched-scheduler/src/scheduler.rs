//! Producer/consumer scheduling
//!
//! The producer thread drains patch files and keeps the queue in sync
//! with the task list; the consumer thread feeds queued flavors to a
//! bounded pool of worker threads. Each worker runs one executor
//! attempt, classifies its exit code and routes the failure to the
//! matching retry budget.

use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::Local;
use cloudsched_config::{Config, SchedulerConfig};
use cloudsched_executor::codes;
use rand::seq::SliceRandom;
use rand::Rng;
use tracing::{debug, error, info};

use crate::error::{SchedulerError, SchedulerResult};
use crate::patch;
use crate::store::{RetryDefaults, TaskStore};
use crate::task::{RetryCounter, TaskStatus, TaskUpdate};

/// Producer audit cadence.
const PRODUCER_TICK: Duration = Duration::from_secs(1);

/// Consumer dispatch cadence.
const CONSUMER_TICK: Duration = Duration::from_secs(1);

/// The consumer starts after the producer has had a first tick.
const CONSUMER_START_DELAY: Duration = Duration::from_secs(2);

/// Grace period before the consumer declares the run finished.
const IDLE_EXIT_GRACE: Duration = Duration::from_secs(10);

/// Codes that retry on the resource budget: container-side test
/// error, disabled or occupied zones, and container pool failures.
pub const RESOURCE_RETRY_CODES: [i32; 6] = [12, 23, 24, 31, 32, 33];

/// Codes that retry on the testcase budget: flaky error cases.
pub const TESTCASE_RETRY_CODES: [i32; 1] = [15];

/// The retry budget a status code draws from, if any.
pub fn retry_counter_for(code: i32) -> Option<RetryCounter> {
    if RESOURCE_RETRY_CODES.contains(&code) {
        Some(RetryCounter::Resource)
    } else if TESTCASE_RETRY_CODES.contains(&code) {
        Some(RetryCounter::Testcase)
    } else {
        None
    }
}

struct WorkerContext {
    store: Arc<TaskStore>,
    config_path: PathBuf,
    log_path: PathBuf,
    dry_run: bool,
    dry_run_returns: Option<Vec<i32>>,
}

/// Long-lived scheduler owning the task list for one batch run.
pub struct TestScheduler {
    scheduler: SchedulerConfig,
    config_path: PathBuf,
    tasklist_path: PathBuf,
    store: Arc<TaskStore>,
    defaults: RetryDefaults,
}

impl TestScheduler {
    /// Load the task list and prepare the log directory.
    pub fn new(
        config: &Config,
        config_path: PathBuf,
        tasklist_path: PathBuf,
    ) -> SchedulerResult<Self> {
        config.scheduler.validate()?;
        std::fs::create_dir_all(&config.scheduler.log_path)?;

        let defaults = RetryDefaults {
            testcase: config.scheduler.max_retries_testcase,
            resource: config.scheduler.max_retries_resource,
        };
        let store = Arc::new(TaskStore::load(&tasklist_path, &defaults)?);

        Ok(Self {
            scheduler: config.scheduler.clone(),
            config_path,
            tasklist_path,
            store,
            defaults,
        })
    }

    /// Read-only handle to the task store.
    pub fn store(&self) -> Arc<TaskStore> {
        Arc::clone(&self.store)
    }

    /// Run producer and consumer until the batch drains.
    ///
    /// Returns when the consumer exits; the producer is abandoned with
    /// the process.
    pub fn run(self) -> SchedulerResult<()> {
        let producer = {
            let store = Arc::clone(&self.store);
            let tasklist = self.tasklist_path.clone();
            let defaults = self.defaults;
            thread::Builder::new()
                .name("producer".to_string())
                .spawn(move || producer_loop(&store, &tasklist, &defaults))?
        };

        let context = Arc::new(WorkerContext {
            store: Arc::clone(&self.store),
            config_path: self.config_path.clone(),
            log_path: self.scheduler.log_path.clone(),
            dry_run: self.scheduler.dry_run,
            dry_run_returns: self.scheduler.dry_run_returns.clone(),
        });
        let max_threads = self.scheduler.max_threads;
        let consumer = thread::Builder::new()
            .name("consumer".to_string())
            .spawn(move || consumer_loop(&context, max_threads))?;

        let result = consumer.join().map_err(|_| SchedulerError::ConsumerPanicked);
        drop(producer);
        result
    }
}

fn producer_loop(store: &TaskStore, tasklist: &std::path::Path, defaults: &RetryDefaults) {
    loop {
        thread::sleep(PRODUCER_TICK);

        let patches = patch::take_patch(tasklist);
        if let Err(e) = store.producer_tick(patches, defaults) {
            error!("producer: {e}");
        }
    }
}

fn consumer_loop(context: &Arc<WorkerContext>, max_threads: usize) {
    thread::sleep(CONSUMER_START_DELAY);

    let mut workers: Vec<thread::JoinHandle<()>> = Vec::new();

    loop {
        thread::sleep(CONSUMER_TICK);

        if workers.len() < max_threads {
            match context.store.pop_next() {
                Ok(Some(flavor)) => {
                    let context = Arc::clone(context);
                    let spawned = thread::Builder::new()
                        .name(format!("task-{flavor}"))
                        .spawn(move || run_task(&context, &flavor));
                    match spawned {
                        Ok(handle) => workers.push(handle),
                        Err(e) => error!("failed to spawn worker: {e}"),
                    }
                }
                Ok(None) => {}
                Err(e) => error!("consumer: {e}"),
            }
        }

        workers.retain(|worker| !worker.is_finished());

        let queued = context.store.queue_len().unwrap_or(0);
        debug!("tasks in queue: {queued}; running workers: {}", workers.len());

        if workers.is_empty() && queued == 0 {
            // Give the producer a chance to requeue retried tasks.
            thread::sleep(IDLE_EXIT_GRACE);
            if context.store.queue_len().unwrap_or(0) == 0 {
                info!("consumer exits since there are no more tasks to process");
                break;
            }
        }
    }
}

/// One worker: run one attempt and feed the outcome back.
fn run_task(context: &WorkerContext, flavor: &str) {
    let started = Local::now();
    let clock = Instant::now();
    let time_start = started.format("%Y-%m-%d %H:%M:%S").to_string();

    if let Err(e) = context.store.update(
        flavor,
        TaskUpdate {
            status: Some(TaskStatus::Running),
            time_start: Some(time_start.clone()),
            ..TaskUpdate::default()
        },
        None,
    ) {
        error!("task \"{flavor}\": {e}");
    }

    let log_name = format!("task_{}_{flavor}.log", started.format("%y%m%d%H%M%S"));
    info!("task \"{flavor}\" started at {time_start}");

    let return_code = if context.dry_run {
        dry_run_code(context, flavor)
    } else {
        match spawn_executor(context, flavor, &log_name) {
            Ok(code) => code,
            Err(e) => {
                error!("task \"{flavor}\": {e}");
                11
            }
        }
    };

    let time_stop = Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
    let time_used = format!("{:.2}", clock.elapsed().as_secs_f64());
    info!("task \"{flavor}\" finished at {time_stop} ({time_used} s)");

    let status_code = codes::symbol(return_code).to_string();
    let retry = retry_counter_for(return_code);

    if let Err(e) = context.store.update(
        flavor,
        TaskUpdate {
            status: Some(TaskStatus::Finished),
            return_code: Some(return_code),
            status_code: Some(status_code.clone()),
            time_stop: Some(time_stop),
            time_used: Some(time_used),
            test_log: Some(log_name),
            ..TaskUpdate::default()
        },
        retry,
    ) {
        error!("task \"{flavor}\": {e}");
    }

    info!("task \"{flavor}\" finished with status \"{status_code}\"");
}

/// Run the executor binary, capturing its output in the attempt log.
fn spawn_executor(
    context: &WorkerContext,
    flavor: &str,
    log_name: &str,
) -> SchedulerResult<i32> {
    let log_path = context.log_path.join(log_name);
    info!("saving log to \"{}\"", log_path.display());
    let log_file = std::fs::File::create(&log_path)?;
    let log_file_err = log_file.try_clone()?;

    let status = Command::new(executor_binary())
        .arg("--config")
        .arg(&context.config_path)
        .arg("--flavor")
        .arg(flavor)
        .stdout(Stdio::from(log_file))
        .stderr(Stdio::from(log_file_err))
        .status()?;

    // A signal-terminated executor counts as a general test error.
    Ok(status.code().unwrap_or(11))
}

/// The executor beside this binary, or from PATH as a fallback.
fn executor_binary() -> PathBuf {
    if let Ok(current) = std::env::current_exe() {
        let sibling = current.with_file_name("cloudsched-executor");
        if sibling.exists() {
            return sibling;
        }
    }
    PathBuf::from("cloudsched-executor")
}

/// Fabricate a return code for a dry run.
///
/// With a configured sequence, attempt n of a flavor takes entry
/// min(n, len - 1); otherwise a code is drawn from the full taxonomy
/// after a short sleep mimicking a real attempt.
fn dry_run_code(context: &WorkerContext, flavor: &str) -> i32 {
    if let Some(sequence) = &context.dry_run_returns {
        if !sequence.is_empty() {
            let attempt = context.store.attempts(flavor).unwrap_or(0);
            return sequence[attempt.min(sequence.len() - 1)];
        }
    }

    info!("DRY RUN: generating a return code randomly");
    let mut rng = rand::thread_rng();
    thread::sleep(Duration::from_millis(rng.gen_range(2000..5000)));
    codes::ALL_CODES
        .choose(&mut rng)
        .copied()
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_codes_route_to_resource_budget() {
        for code in RESOURCE_RETRY_CODES {
            assert_eq!(retry_counter_for(code), Some(RetryCounter::Resource));
        }
    }

    #[test]
    fn flaky_error_cases_route_to_testcase_budget() {
        assert_eq!(retry_counter_for(15), Some(RetryCounter::Testcase));
    }

    #[test]
    fn terminal_codes_do_not_retry() {
        for code in [0, 11, 13, 14, 16, 21, 22, 41] {
            assert_eq!(retry_counter_for(code), None, "code {code}");
        }
    }
}
