//! Single-attempt test driver
//!
//! Drives one attempt of one flavor through the fixed pipeline:
//! resolve zone, acquire container, provision, run, classify. Every
//! step is caught; the attempt always yields a status code and never
//! propagates an error past this boundary.

use std::path::PathBuf;

use chrono::Local;
use cloudsched_config::Config;
use tracing::{error, info};

use crate::cloud::{ZonePick, ZoneResolver};
use crate::codes;
use crate::container::{ContainerPick, ContainerPool, DEFAULT_LOCK_SECONDS};
use crate::error::ExecutorResult;
use crate::provision::Provisioner;

/// Executes one containerized test attempt per flavor.
pub struct TestExecutor {
    cloud: ZoneResolver,
    pool: ContainerPool,
    provisioner: Provisioner,
    log_path: PathBuf,
}

impl TestExecutor {
    /// Build the executor; configuration problems abort construction.
    pub fn new(config: &Config) -> ExecutorResult<Self> {
        config.executor.validate()?;

        let log_path = config.scheduler.log_path.clone();
        std::fs::create_dir_all(&log_path)?;

        Ok(Self {
            cloud: ZoneResolver::new(&config.executor)?,
            pool: ContainerPool::new(&config.executor)?,
            provisioner: Provisioner::new(&config.executor)?,
            log_path,
        })
    }

    /// Run one attempt and return its classified status code.
    pub fn run(&self, flavor: &str) -> i32 {
        info!(
            "test started: {}",
            Local::now().format("%Y-%m-%d %H:%M:%S")
        );

        let code = self.attempt(flavor);

        info!(
            "test finished: {}",
            Local::now().format("%Y-%m-%d %H:%M:%S")
        );
        info!("exit code: {} ({})", code, codes::symbol(code));

        code
    }

    fn attempt(&self, flavor: &str) -> i32 {
        let azone = match self.cloud.pick_azone(flavor) {
            Ok(ZonePick::Zone(azone)) => azone,
            Ok(ZonePick::NoStock) => return 22,
            Ok(ZonePick::Disabled) => return 23,
            Ok(ZonePick::Occupied) => return 24,
            Err(e) => {
                error!("failed to get zone: {e}");
                return 21;
            }
        };

        let container = match self.pool.pick(DEFAULT_LOCK_SECONDS) {
            Ok(ContainerPick::Locked(container)) => container,
            Ok(ContainerPick::AllBusy) => return 32,
            Ok(ContainerPick::LockFailed) => return 33,
            Err(e) => {
                error!("failed to get container: {e}");
                return 31;
            }
        };

        if let Err(e) = self.provisioner.provision(&container, flavor, &azone) {
            error!("failed to provision data: {e}");
            return 41;
        }

        match self.pool.run(&container, flavor, Some(&self.log_path)) {
            Ok(0) => 0,
            Ok(raw) => raw + codes::TEST_CODE_OFFSET,
            Err(e) => {
                error!("failed to execute test: {e}");
                11
            }
        }
    }
}
