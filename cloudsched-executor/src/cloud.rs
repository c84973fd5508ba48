//! Availability zone resolution
//!
//! Answers "where can this flavor be launched right now". Stock data
//! comes from a cached flavor distribution file generated by an
//! external query helper; occupancy comes from the live instance
//! listing of the cloud CLI. Zones holding an instance whose name
//! bears the reserved label prefix are treated as occupied.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Command;
use std::time::Duration;

use cloudsched_config::ExecutorConfig;
use rand::seq::SliceRandom;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::error::{ExecutorError, ExecutorResult};

/// Cached flavor distribution shared by every executor on the host.
pub const DISTRIBUTION_FILE: &str = "/tmp/aliyun_flavor_distribution.txt";

/// Helper that (re)generates the distribution file.
const QUERY_FLAVORS_HELPER: &str = "./utils/query_flavors.sh";

/// Exit code of the query helper meaning "another instance is running".
const QUERY_ALREADY_RUNNING: i32 = 2;

/// Outcome of a zone pick short of an exception.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ZonePick {
    /// A usable zone was found
    Zone(String),
    /// Flavor is out of stock everywhere
    NoStock,
    /// Flavor is in stock only outside the enabled regions
    Disabled,
    /// Every eligible zone already holds a reserved instance
    Occupied,
}

/// Resolves an availability zone for a flavor.
pub struct ZoneResolver {
    zone_override: Option<String>,
    enabled_regions: Vec<String>,
    label_prefix: String,
    distribution: BTreeMap<String, Vec<String>>,
}

impl ZoneResolver {
    /// Build a resolver from the executor configuration.
    ///
    /// With a fixed `zone` the distribution file is never read and the
    /// cloud CLI is never invoked.
    pub fn new(config: &ExecutorConfig) -> ExecutorResult<Self> {
        if let Some(zone) = &config.zone {
            debug!("zone fixed by configuration: {zone}");
            return Ok(Self {
                zone_override: Some(zone.clone()),
                enabled_regions: Vec::new(),
                label_prefix: config.label_prefix.clone(),
                distribution: BTreeMap::new(),
            });
        }

        let distribution = load_distribution(Path::new(DISTRIBUTION_FILE))?;
        debug!("loaded distribution for {} flavor(s)", distribution.len());

        Ok(Self {
            zone_override: None,
            enabled_regions: config.enabled_regions.clone(),
            label_prefix: config.label_prefix.clone(),
            distribution,
        })
    }

    /// Pick an availability zone for the flavor.
    pub fn pick_azone(&self, flavor: &str) -> ExecutorResult<ZonePick> {
        if let Some(zone) = &self.zone_override {
            return Ok(ZonePick::Zone(zone.clone()));
        }

        let possible = self
            .distribution
            .get(flavor)
            .cloned()
            .unwrap_or_default();
        if possible.is_empty() {
            info!("flavor \"{flavor}\" is out of stock");
            return Ok(ZonePick::NoStock);
        }

        let eligible = eligible_azones(&possible, &self.enabled_regions);
        if eligible.is_empty() {
            info!(
                "flavor \"{flavor}\" is in stock but outside the enabled regions; \
                 possible zones: {possible:?}, enabled regions: {:?}",
                self.enabled_regions
            );
            return Ok(ZonePick::Disabled);
        }

        let occupied = self.occupied_azones(&eligible)?;
        let available: Vec<String> = eligible
            .iter()
            .filter(|z| !occupied.contains(z))
            .cloned()
            .collect();
        if available.is_empty() {
            info!(
                "all zones enabled for \"{flavor}\" are occupied; \
                 eligible: {eligible:?}, occupied: {occupied:?}"
            );
            return Ok(ZonePick::Occupied);
        }

        let zone = available
            .choose(&mut rand::thread_rng())
            .cloned()
            .unwrap_or_else(|| available[0].clone());
        info!("picked zone \"{zone}\" for flavor \"{flavor}\" from {available:?}");

        Ok(ZonePick::Zone(zone))
    }

    /// Zones in the given set currently holding a reserved instance.
    fn occupied_azones(&self, azones: &[String]) -> ExecutorResult<Vec<String>> {
        let regions = regions_of(azones);
        let endpoints = region_endpoints()?;
        let marker = format!("{}-instance-", self.label_prefix);

        let mut occupied = Vec::new();
        for region in &regions {
            let Some(endpoint) = endpoints.get(region) else {
                warn!("no endpoint known for region \"{region}\", skipping");
                continue;
            };
            let instances = match list_instances(region, endpoint) {
                Ok(instances) => instances,
                Err(e) => {
                    warn!("failed to list instances in \"{region}\": {e}");
                    continue;
                }
            };
            for instance in instances {
                if instance.instance_name.contains(&marker) {
                    occupied.push(instance.zone_id);
                }
            }
        }

        debug!("occupied zones: {occupied:?}");
        Ok(occupied)
    }
}

/// Parse the distribution file content (`zone,flavor` per line).
pub fn parse_distribution(content: &str) -> BTreeMap<String, Vec<String>> {
    let mut distribution: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Some((zone, flavor)) = line.split_once(',') else {
            continue;
        };
        distribution
            .entry(flavor.trim().to_string())
            .or_default()
            .push(zone.trim().to_string());
    }
    distribution
}

/// Filter zones down to the enabled regions.
///
/// A zone belongs to a region when the region string occurs in the
/// zone identifier. The sentinel "*" disables filtering.
pub fn eligible_azones(azones: &[String], enabled_regions: &[String]) -> Vec<String> {
    if enabled_regions.iter().any(|r| r == "*") {
        return azones.to_vec();
    }
    azones
        .iter()
        .filter(|zone| enabled_regions.iter().any(|region| zone.contains(region)))
        .cloned()
        .collect()
}

/// Distinct regions covering the given zones.
///
/// `cn-beijing-h` maps to `cn-beijing`; `us-west-1a` maps to
/// `us-west-1`.
pub fn regions_of(azones: &[String]) -> Vec<String> {
    let mut regions = Vec::new();
    for zone in azones {
        let region = region_of(zone);
        if !regions.contains(&region) {
            regions.push(region);
        }
    }
    regions
}

fn region_of(zone: &str) -> String {
    let bytes = zone.as_bytes();
    if bytes.len() >= 2 && bytes[bytes.len() - 2] == b'-' {
        zone[..zone.len() - 2].to_string()
    } else if !zone.is_empty() {
        zone[..zone.len() - 1].to_string()
    } else {
        String::new()
    }
}

fn load_distribution(path: &Path) -> ExecutorResult<BTreeMap<String, Vec<String>>> {
    if !path.exists() {
        info!("generating flavor distribution at {}", path.display());
        let status = Command::new(QUERY_FLAVORS_HELPER)
            .arg("-o")
            .arg(path)
            .status()
            .map_err(|e| {
                ExecutorError::Distribution(format!("{QUERY_FLAVORS_HELPER}: {e}"))
            })?;

        match status.code() {
            Some(0) => {}
            Some(QUERY_ALREADY_RUNNING) => {
                // Another executor is generating the file; give it time.
                debug!("another query helper is running, waiting 60s");
                std::thread::sleep(Duration::from_secs(60));
            }
            _ => {
                return Err(ExecutorError::Distribution(format!(
                    "{QUERY_FLAVORS_HELPER} exited with {status}"
                )));
            }
        }
    }

    let content = std::fs::read_to_string(path)?;
    Ok(parse_distribution(&content))
}

// ---------------------------------------------------------------------
// Cloud CLI plumbing
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct DescribeRegionsResponse {
    #[serde(rename = "Regions", default)]
    regions: RegionList,
}

#[derive(Debug, Default, Deserialize)]
struct RegionList {
    #[serde(rename = "Region", default)]
    region: Vec<RegionInfo>,
}

#[derive(Debug, Deserialize)]
struct RegionInfo {
    #[serde(rename = "RegionId", default)]
    region_id: String,
    #[serde(rename = "RegionEndpoint", default)]
    region_endpoint: String,
}

#[derive(Debug, Deserialize)]
struct DescribeInstancesResponse {
    #[serde(rename = "Instances", default)]
    instances: InstanceList,
}

#[derive(Debug, Default, Deserialize)]
struct InstanceList {
    #[serde(rename = "Instance", default)]
    instance: Vec<InstanceInfo>,
}

#[derive(Debug, Deserialize)]
struct InstanceInfo {
    #[serde(rename = "InstanceName", default)]
    instance_name: String,
    #[serde(rename = "ZoneId", default)]
    zone_id: String,
}

/// Run the cloud CLI and deserialize its JSON output.
pub(crate) fn aliyun<T: DeserializeOwned>(args: &[&str]) -> ExecutorResult<T> {
    debug!("aliyun {}", args.join(" "));
    let output = Command::new("aliyun").args(args).output()?;
    if !output.status.success() {
        return Err(ExecutorError::CloudCli(format!(
            "aliyun {} exited with {}",
            args.join(" "),
            output.status
        )));
    }
    Ok(serde_json::from_slice(&output.stdout)?)
}

/// Region id to API endpoint, from one `DescribeRegions` call.
fn region_endpoints() -> ExecutorResult<BTreeMap<String, String>> {
    let response: DescribeRegionsResponse = aliyun(&["ecs", "DescribeRegions"])?;
    Ok(response
        .regions
        .region
        .into_iter()
        .map(|r| (r.region_id, r.region_endpoint))
        .collect())
}

fn list_instances(region: &str, endpoint: &str) -> ExecutorResult<Vec<InstanceInfo>> {
    let response: DescribeInstancesResponse = aliyun(&[
        "--endpoint",
        endpoint,
        "ecs",
        "DescribeInstances",
        "--RegionId",
        region,
        "--PageSize",
        "50",
    ])?;
    Ok(response.instances.instance)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zones(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn distribution_parses_zone_flavor_lines() {
        let content = "cn-beijing-h,ecs.g7.large\n\
                       cn-hangzhou-b,ecs.g7.large\n\
                       \n\
                       us-west-1a,ecs.t5-lc2m1.nano\n";
        let distribution = parse_distribution(content);

        assert_eq!(
            distribution.get("ecs.g7.large"),
            Some(&zones(&["cn-beijing-h", "cn-hangzhou-b"]))
        );
        assert_eq!(
            distribution.get("ecs.t5-lc2m1.nano"),
            Some(&zones(&["us-west-1a"]))
        );
        assert!(distribution.get("ecs.g6.large").is_none());
    }

    #[test]
    fn malformed_distribution_lines_are_skipped() {
        let distribution = parse_distribution("not-a-pair\ncn-beijing-h,ecs.g7.large\n");
        assert_eq!(distribution.len(), 1);
    }

    #[test]
    fn wildcard_disables_region_filter() {
        let azones = zones(&["cn-beijing-h", "us-west-1a"]);
        let eligible = eligible_azones(&azones, &zones(&["*"]));
        assert_eq!(eligible, azones);
    }

    #[test]
    fn regions_filter_by_substring() {
        let azones = zones(&["cn-beijing-h", "cn-hangzhou-b", "us-west-1a"]);

        let eligible = eligible_azones(&azones, &zones(&["cn-"]));
        assert_eq!(eligible, zones(&["cn-beijing-h", "cn-hangzhou-b"]));

        let eligible = eligible_azones(&azones, &zones(&["us-west"]));
        assert_eq!(eligible, zones(&["us-west-1a"]));

        let eligible = eligible_azones(&azones, &zones(&["eu-"]));
        assert!(eligible.is_empty());
    }

    #[test]
    fn zone_to_region_strips_suffix() {
        assert_eq!(region_of("cn-beijing-h"), "cn-beijing");
        assert_eq!(region_of("us-west-1a"), "us-west-1");
        assert_eq!(region_of("cn-hangzhou-b"), "cn-hangzhou");
    }

    #[test]
    fn regions_of_deduplicates() {
        let azones = zones(&["cn-beijing-h", "cn-beijing-k", "us-west-1a"]);
        assert_eq!(regions_of(&azones), zones(&["cn-beijing", "us-west-1"]));
    }

    #[test]
    fn fixed_zone_bypasses_distribution() {
        let config = ExecutorConfig {
            zone: Some("cn-x-a".to_string()),
            ..ExecutorConfig::default()
        };
        let resolver = ZoneResolver::new(&config).unwrap();
        assert_eq!(
            resolver.pick_azone("ecs.g7.large").unwrap(),
            ZonePick::Zone("cn-x-a".to_string())
        );
    }
}
