//! Per-container test input provisioning
//!
//! Materializes the data directory of a container before a test run:
//! template copies, identity key, the include list tying the three
//! provider fragments together, the common fragment (rewritten by an
//! external helper with cloud credentials), the flavors fragment and
//! the testcases fragment.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::process::Command;

use cloudsched_config::ExecutorConfig;
use serde::Deserialize;
use tracing::{debug, error, warn};

use crate::error::{ExecutorError, ExecutorResult};
use crate::flavor;

/// Directory holding the YAML templates copied into each container.
const TEMPLATE_PATH: &str = "./templates";

/// Helper rewriting the common fragment with credentials and identity.
const COMMON_DATA_HELPER: &str = "./utils/provision_common_data.sh";

/// Placeholder written when cloud credentials cannot be read.
const NULL_CREDENTIAL: &str = "Null";

/// Provisions test input for one container at a time.
pub struct Provisioner {
    container_path: PathBuf,
    identity_file: PathBuf,
    keypair: String,
    image_name: String,
    ddh_id: Option<String>,
    provider: String,
    testcases: String,
}

impl Provisioner {
    /// Build a provisioner from a validated executor configuration.
    pub fn new(config: &ExecutorConfig) -> ExecutorResult<Self> {
        config.validate()?;
        let test = &config.test;
        Ok(Self {
            container_path: config.container_path.clone(),
            identity_file: test.identity_file.clone().unwrap_or_default(),
            keypair: test.ssh_keypair.clone().unwrap_or_default(),
            image_name: test.image_name.clone().unwrap_or_default(),
            ddh_id: test.ddh_id.clone(),
            provider: test.provider.clone().unwrap_or_default(),
            testcases: test.testcases.clone().unwrap_or_default(),
        })
    }

    /// Provision the container's data directory for one attempt.
    pub fn provision(&self, container: &str, flavor_id: &str, azone: &str) -> ExecutorResult<()> {
        let data_path = self.container_path.join(container).join("data");
        let result_path = self.container_path.join(container).join("job-results");
        std::fs::create_dir_all(&data_path)?;
        std::fs::create_dir_all(&result_path)?;

        self.deliver_templates(&data_path)?;

        let include_file = data_path.join(format!("test_{}.yaml", self.provider));
        std::fs::write(&include_file, include_list(&self.provider))?;

        self.provision_common_data(&data_path, container, azone)?;

        let flavors_file = data_path.join(format!("{}_flavors.yaml", self.provider));
        debug!("updating \"{}\"", flavors_file.display());
        flavor::provision_flavor_data(&flavors_file, flavor_id)?;

        let testcases_file = data_path.join(format!("{}_testcases.yaml", self.provider));
        std::fs::write(&testcases_file, testcases_fragment(&self.testcases))?;

        Ok(())
    }

    /// Copy templates and the identity key into the data directory.
    fn deliver_templates(&self, data_path: &Path) -> ExecutorResult<()> {
        debug!("copying default data into {}", data_path.display());

        for entry in std::fs::read_dir(TEMPLATE_PATH)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("yaml") {
                if let Some(name) = path.file_name() {
                    std::fs::copy(&path, data_path.join(name))?;
                }
            }
        }

        // Drop stray keys from earlier attempts before placing ours.
        for entry in std::fs::read_dir(data_path)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("pem") {
                std::fs::remove_file(&path)?;
            }
        }

        let key_name = self
            .identity_file
            .file_name()
            .ok_or_else(|| ExecutorError::Provision("identity file has no name".to_string()))?;
        std::fs::copy(&self.identity_file, data_path.join(key_name))?;

        Ok(())
    }

    /// Rewrite the common fragment through the external helper.
    fn provision_common_data(
        &self,
        data_path: &Path,
        container: &str,
        azone: &str,
    ) -> ExecutorResult<()> {
        let file = data_path.join(format!("{}_common.yaml", self.provider));
        let (access_key_id, access_key_secret) = cloud_credentials();

        let mut command = Command::new(COMMON_DATA_HELPER);
        command
            .arg("-f")
            .arg(&file)
            .args(["-i", &access_key_id, "-s", &access_key_secret])
            .args(["-k", &self.keypair, "-z", azone, "-m", &self.image_name])
            .args(["-l", container]);
        if let Some(ddh_id) = &self.ddh_id {
            command.args(["-d", ddh_id]);
        }

        debug!("updating \"{}\" through {COMMON_DATA_HELPER}", file.display());
        let status = command
            .status()
            .map_err(|e| ExecutorError::Provision(format!("{COMMON_DATA_HELPER}: {e}")))?;
        if !status.success() {
            error!("failed to update \"{}\"", file.display());
            return Err(ExecutorError::Provision(format!(
                "{COMMON_DATA_HELPER} exited with {status}"
            )));
        }

        Ok(())
    }
}

/// The include list naming the three provider fragments.
pub fn include_list(provider: &str) -> String {
    let mut out = String::new();
    out.push_str("test:\n");
    let _ = writeln!(out, "    !include : {provider}_flavors.yaml");
    let _ = writeln!(out, "    !include : {provider}_testcases.yaml");
    let _ = writeln!(out, "    !include : {provider}_common.yaml");
    out
}

/// The testcases fragment: one case per line, blanks and comments out.
pub fn testcases_fragment(testcases: &str) -> String {
    let mut out = String::from("cases:\n");
    for line in testcases.lines() {
        let case = line.trim();
        if case.is_empty() || case.starts_with('#') {
            continue;
        }
        let _ = writeln!(out, "  {case}");
    }
    out
}

#[derive(Debug, Deserialize)]
struct CliProfile {
    #[serde(default)]
    access_key_id: String,
    #[serde(default)]
    access_key_secret: String,
}

#[derive(Debug, Deserialize)]
struct CliConfig {
    #[serde(default)]
    profiles: Vec<CliProfile>,
}

/// Credentials from the cloud CLI's own configuration file.
///
/// Failure to read them is not fatal; the fragments are written with
/// literal `Null` values and the test fails on its own terms later.
fn cloud_credentials() -> (String, String) {
    let config_path = dirs::home_dir().map(|home| home.join(".aliyun/config.json"));

    let profile = config_path.and_then(|path| {
        let content = std::fs::read_to_string(path).ok()?;
        let config: CliConfig = serde_json::from_str(&content).ok()?;
        config.profiles.into_iter().next()
    });

    match profile {
        Some(profile) => (profile.access_key_id, profile.access_key_secret),
        None => {
            warn!("unable to get cloud credentials from the CLI config");
            (NULL_CREDENTIAL.to_string(), NULL_CREDENTIAL.to_string())
        }
    }
}
