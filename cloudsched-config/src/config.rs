//! Configuration schema, loading and validation

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ConfigError, ConfigResult};

/// Top-level configuration shared by all cloudsched binaries
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Scheduler section (`[scheduler]`)
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Executor section (`[executor]`)
    #[serde(default)]
    pub executor: ExecutorConfig,
}

/// Settings consumed by the scheduler daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Directory receiving one log file per test attempt
    pub log_path: PathBuf,
    /// Fabricate return codes instead of spawning the executor
    pub dry_run: bool,
    /// Deterministic dry-run codes; attempt n of a flavor takes entry
    /// min(n, len - 1). Absent means codes are drawn randomly.
    pub dry_run_returns: Option<Vec<i32>>,
    /// Upper bound on concurrently running test attempts
    pub max_threads: usize,
    /// Initial testcase retry budget for new tasks
    pub max_retries_testcase: u32,
    /// Initial resource retry budget for new tasks
    pub max_retries_resource: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            log_path: PathBuf::from("./logs"),
            dry_run: false,
            dry_run_returns: None,
            max_threads: 4,
            max_retries_testcase: 2,
            max_retries_resource: 10,
        }
    }
}

/// Settings consumed by the per-task executor
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Container image the tests run in
    pub container_image: String,
    /// Host directory holding per-container data and results
    pub container_path: PathBuf,
    /// Name prefix of the container pool
    pub container_pool_name: String,
    /// Number of containers in the pool
    pub container_pool_size: usize,
    /// Fabricate a raw test code instead of invoking the test runner
    pub dry_run: bool,
    /// Fixed availability zone; bypasses the zone resolver entirely
    pub zone: Option<String>,
    /// Regions eligible for zone selection; "*" disables the filter
    pub enabled_regions: Vec<String>,
    /// Reserved instance-name prefix marking zones as occupied
    pub label_prefix: String,
    /// Test provisioning subsection (`[executor.test]`)
    pub test: TestConfig,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            container_image: String::new(),
            container_path: PathBuf::new(),
            container_pool_name: "ac".to_string(),
            container_pool_size: 32,
            dry_run: false,
            zone: None,
            enabled_regions: Vec::new(),
            label_prefix: "qeauto".to_string(),
            test: TestConfig::default(),
        }
    }
}

/// Test provisioning settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TestConfig {
    /// SSH identity file delivered into the container; must end ".pem"
    pub identity_file: Option<PathBuf>,
    /// Name of the cloud key pair matching the identity file
    pub ssh_keypair: Option<String>,
    /// Guest image the test instances boot from
    pub image_name: Option<String>,
    /// Optional dedicated-host identifier
    pub ddh_id: Option<String>,
    /// Provider name used in the generated fragment file names
    pub provider: Option<String>,
    /// Newline-separated test case list; blanks and "#" lines skipped
    pub testcases: Option<String>,
}

/// Load configuration from a TOML file
pub fn load_config(path: &Path) -> ConfigResult<Config> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("failed to read {}: {}", path.display(), e)))?;

    let config: Config = toml::from_str(&content)
        .map_err(|e| ConfigError::Parse(format!("failed to parse {}: {}", path.display(), e)))?;

    debug!(config = ?config, "loaded configuration from {}", path.display());

    Ok(config)
}

impl SchedulerConfig {
    /// Validate the scheduler section
    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_threads == 0 {
            return Err(ConfigError::Validation(
                "scheduler.max_threads must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl ExecutorConfig {
    /// Validate the executor section, including the test subsection
    pub fn validate(&self) -> ConfigResult<()> {
        if self.container_image.is_empty() {
            return Err(ConfigError::Validation(
                "executor.container_image is not specified".to_string(),
            ));
        }
        if self.container_path.as_os_str().is_empty() {
            return Err(ConfigError::Validation(
                "executor.container_path is not specified".to_string(),
            ));
        }
        if self.container_pool_size == 0 {
            return Err(ConfigError::Validation(
                "executor.container_pool_size must be at least 1".to_string(),
            ));
        }
        if self.zone.is_none() && self.enabled_regions.is_empty() {
            return Err(ConfigError::Validation(
                "executor.enabled_regions must be a non-empty list when no zone is fixed"
                    .to_string(),
            ));
        }
        self.test.validate()
    }
}

impl TestConfig {
    /// Validate the test subsection
    pub fn validate(&self) -> ConfigResult<()> {
        let identity_file = self.identity_file.as_deref().ok_or_else(|| {
            ConfigError::Validation(
                "the ssh identity file (test.identity_file) is not specified".to_string(),
            )
        })?;
        if !identity_file.is_file() {
            return Err(ConfigError::Validation(format!(
                "the ssh identity file ({}) cannot be found",
                identity_file.display()
            )));
        }
        if identity_file.extension().and_then(|e| e.to_str()) != Some("pem") {
            return Err(ConfigError::Validation(format!(
                "the ssh identity file ({}) must be suffixed with \".pem\"",
                identity_file.display()
            )));
        }

        if self.ssh_keypair.as_deref().unwrap_or("").is_empty() {
            return Err(ConfigError::Validation(
                "the keypair (test.ssh_keypair) is not specified".to_string(),
            ));
        }
        if self.image_name.as_deref().unwrap_or("").is_empty() {
            return Err(ConfigError::Validation(
                "the image name (test.image_name) is not specified".to_string(),
            ));
        }
        if self.provider.as_deref().unwrap_or("").is_empty() {
            return Err(ConfigError::Validation(
                "the provider (test.provider) is not specified".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_file(dir: &TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
        path
    }

    #[test]
    fn defaults_apply_to_empty_file() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "config.toml", "");

        let config = load_config(&path).unwrap();

        assert_eq!(config.scheduler.max_threads, 4);
        assert_eq!(config.scheduler.max_retries_testcase, 2);
        assert_eq!(config.scheduler.max_retries_resource, 10);
        assert!(!config.scheduler.dry_run);
        assert_eq!(config.executor.container_pool_name, "ac");
        assert_eq!(config.executor.container_pool_size, 32);
        assert_eq!(config.executor.label_prefix, "qeauto");
    }

    #[test]
    fn full_file_parses() {
        let dir = TempDir::new().unwrap();
        let path = write_file(
            &dir,
            "config.toml",
            r#"
[scheduler]
log_path = "/var/log/cloudsched"
dry_run = true
dry_run_returns = [24, 0]
max_threads = 8

[executor]
container_image = "quay.io/example/cloud-test:latest"
container_path = "/tmp/containers"
zone = "cn-hangzhou-b"
enabled_regions = ["cn-", "us-west"]

[executor.test]
ssh_keypair = "kp"
image_name = "img"
provider = "alibaba"
testcases = "case_one\ncase_two"
"#,
        );

        let config = load_config(&path).unwrap();

        assert!(config.scheduler.dry_run);
        assert_eq!(config.scheduler.dry_run_returns, Some(vec![24, 0]));
        assert_eq!(config.scheduler.max_threads, 8);
        assert_eq!(config.executor.zone.as_deref(), Some("cn-hangzhou-b"));
        assert_eq!(config.executor.enabled_regions.len(), 2);
        assert_eq!(config.executor.test.provider.as_deref(), Some("alibaba"));
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = load_config(Path::new("/nonexistent/config.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }

    #[test]
    fn identity_file_must_exist_and_be_pem() {
        let dir = TempDir::new().unwrap();
        let pem = write_file(&dir, "key.pem", "key material");
        let txt = write_file(&dir, "key.txt", "key material");

        let mut test = TestConfig {
            identity_file: Some(dir.path().join("absent.pem")),
            ssh_keypair: Some("kp".to_string()),
            image_name: Some("img".to_string()),
            provider: Some("alibaba".to_string()),
            ..TestConfig::default()
        };
        assert!(matches!(
            test.validate().unwrap_err(),
            ConfigError::Validation(_)
        ));

        test.identity_file = Some(txt);
        assert!(matches!(
            test.validate().unwrap_err(),
            ConfigError::Validation(_)
        ));

        test.identity_file = Some(pem);
        test.validate().unwrap();
    }

    #[test]
    fn executor_requires_regions_unless_zone_fixed() {
        let dir = TempDir::new().unwrap();
        let pem = write_file(&dir, "key.pem", "key material");

        let mut executor = ExecutorConfig {
            container_image: "img".to_string(),
            container_path: dir.path().to_path_buf(),
            test: TestConfig {
                identity_file: Some(pem),
                ssh_keypair: Some("kp".to_string()),
                image_name: Some("img".to_string()),
                provider: Some("alibaba".to_string()),
                ..TestConfig::default()
            },
            ..ExecutorConfig::default()
        };

        assert!(matches!(
            executor.validate().unwrap_err(),
            ConfigError::Validation(_)
        ));

        executor.zone = Some("cn-hangzhou-b".to_string());
        executor.validate().unwrap();

        executor.zone = None;
        executor.enabled_regions = vec!["cn-".to_string()];
        executor.validate().unwrap();
    }
}
