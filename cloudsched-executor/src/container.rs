//! Container pool management
//!
//! A fixed pool of container names backed by the podman runtime. A
//! name is free when no live container bears it; picking a name locks
//! it by starting a short-lived sleeper container of that exact name,
//! which turns the runtime's name uniqueness into the mutual exclusion
//! between concurrent pickers. The sleeper is killed right before the
//! real test takes the name over.

use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::Duration;

use cloudsched_config::ExecutorConfig;
use rand::seq::SliceRandom;
use rand::Rng;
use tracing::{debug, error, info};

use crate::error::{ExecutorError, ExecutorResult};

/// How long a sleeper container holds a name before expiring.
pub const DEFAULT_LOCK_SECONDS: u64 = 120;

/// Test runner helper invoked against a provisioned container.
const RUN_HELPER: &str = "./utils/run.sh";

/// Seconds to wait after killing a sleeper for resource release.
const UNLOCK_GRACE: Duration = Duration::from_secs(2);

/// Outcome of a container pick short of an exception.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerPick {
    /// A container was picked and locked
    Locked(String),
    /// Every pool entry is in use
    AllBusy,
    /// The lock sleeper could not be started
    LockFailed,
}

/// Fixed-size pool of named containers.
pub struct ContainerPool {
    image: String,
    container_path: PathBuf,
    pool: Vec<String>,
    dry_run: bool,
}

impl ContainerPool {
    /// Build the pool and verify the container image.
    pub fn new(config: &ExecutorConfig) -> ExecutorResult<Self> {
        let status = Command::new("podman")
            .arg("inspect")
            .arg(&config.container_image)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(|e| ExecutorError::Runtime(format!("podman inspect: {e}")))?;
        if !status.success() {
            return Err(ExecutorError::InvalidImage(config.container_image.clone()));
        }
        debug!("container image \"{}\" is valid", config.container_image);

        let pool = pool_names(&config.container_pool_name, config.container_pool_size);
        debug!("container pool: {pool:?}");

        std::fs::create_dir_all(&config.container_path)?;

        Ok(Self {
            image: config.container_image.clone(),
            container_path: config.container_path.clone(),
            pool,
            dry_run: config.dry_run,
        })
    }

    /// Names in the pool, in order.
    pub fn names(&self) -> &[String] {
        &self.pool
    }

    /// Whether no live container bears this name.
    fn is_available(&self, name: &str) -> bool {
        Command::new("podman")
            .args(["inspect", "--type", "container", name])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|status| !status.success())
            .unwrap_or(false)
    }

    /// Pick a free container and lock it for `lock_seconds`.
    pub fn pick(&self, lock_seconds: u64) -> ExecutorResult<ContainerPick> {
        let available: Vec<&String> = self
            .pool
            .iter()
            .filter(|name| self.is_available(name))
            .collect();

        if available.is_empty() {
            debug!("no idle container in the pool");
            return Ok(ContainerPick::AllBusy);
        }

        let name = available
            .choose(&mut rand::thread_rng())
            .copied()
            .cloned()
            .unwrap_or_else(|| available[0].clone());
        info!("picked container \"{name}\" from {available:?}");

        if lock_seconds > 0 && !self.lock(&name, lock_seconds)? {
            error!("failed to lock container \"{name}\"");
            return Ok(ContainerPick::LockFailed);
        }

        Ok(ContainerPick::Locked(name))
    }

    /// Reserve the name with a detached, self-removing sleeper.
    fn lock(&self, name: &str, lock_seconds: u64) -> ExecutorResult<bool> {
        debug!("locking container \"{name}\" for {lock_seconds}s");
        let status = Command::new("podman")
            .args(["run", "--name", name, "--rm", "-itd", &self.image])
            .arg("/usr/bin/sleep")
            .arg(lock_seconds.to_string())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(|e| ExecutorError::Runtime(format!("podman run: {e}")))?;
        Ok(status.success())
    }

    /// Kill the sleeper and wait for the runtime to release the name.
    fn unlock(&self, name: &str) {
        debug!("unlocking container \"{name}\"");
        let result = Command::new("podman")
            .args(["kill", name])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        if let Err(e) = result {
            error!("failed to unlock container \"{name}\": {e}");
        }
        std::thread::sleep(UNLOCK_GRACE);
    }

    /// Run the provisioned test in the container; returns the raw exit
    /// code of the test runner.
    pub fn run(
        &self,
        name: &str,
        flavor: &str,
        log_path: Option<&std::path::Path>,
    ) -> ExecutorResult<i32> {
        self.unlock(name);

        info!("running test against \"{flavor}\" from container \"{name}\"");

        if self.dry_run {
            info!("DRY RUN: generating a raw return code randomly");
            let mut rng = rand::thread_rng();
            std::thread::sleep(Duration::from_millis(rng.gen_range(2000..5000)));
            return Ok(rng.gen_range(0..=6));
        }

        let mut command = Command::new(RUN_HELPER);
        command
            .arg("-p")
            .arg(&self.container_path)
            .args(["-n", name, "-m", &self.image]);
        if let Some(log_path) = log_path {
            command.arg("-l").arg(log_path);
        }

        let status = command
            .status()
            .map_err(|e| ExecutorError::Runtime(format!("{RUN_HELPER}: {e}")))?;
        // A signal-terminated runner counts as a general test error.
        let code = status.code().unwrap_or(1);

        if code == 0 {
            info!("PASSED! test against \"{flavor}\" from container \"{name}\"");
        } else {
            info!("FAILED! test against \"{flavor}\" from container \"{name}\"");
        }

        Ok(code)
    }
}

/// Enumerate pool names: prefix plus zero-padded index.
///
/// The pad width is the decimal width of `size - 1`, so a pool of 32
/// named `ac` spans `ac00` through `ac31`.
pub fn pool_names(prefix: &str, size: usize) -> Vec<String> {
    let width = size.saturating_sub(1).to_string().len();
    (0..size)
        .map(|index| format!("{prefix}{index:0width$}"))
        .collect()
}
