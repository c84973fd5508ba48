//! Flavor data provisioning
//!
//! Queries the instance type spec through the cloud CLI and compiles
//! it into the flavors YAML fragment consumed by the test harness.

use std::fmt::Write as _;
use std::path::Path;

use serde::Deserialize;
use tracing::debug;

use crate::cloud::aliyun;
use crate::error::{ExecutorError, ExecutorResult};

/// Families whose local disks attach as NVMe devices.
const NVME_FAMILIES: [&str; 2] = ["ecs.i3", "ecs.g7se"];

/// Security-enhanced families reserving half their memory as encrypted.
const ENCRYPTED_MEMORY_FAMILIES: [&str; 3] = ["ecs.c7t", "ecs.g7t", "ecs.r7t"];

/// ARM families booting through UEFI.
const ARM_FAMILIES: [&str; 3] = ["ecs.g8y", "ecs.c8y", "ecs.r8y"];

#[derive(Debug, Deserialize)]
struct DescribeInstanceTypesResponse {
    #[serde(rename = "InstanceTypes", default)]
    instance_types: InstanceTypeList,
}

#[derive(Debug, Default, Deserialize)]
struct InstanceTypeList {
    #[serde(rename = "InstanceType", default)]
    instance_type: Vec<InstanceTypeSpec>,
}

/// Instance type spec as reported by `DescribeInstanceTypes`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InstanceTypeSpec {
    #[serde(default)]
    pub instance_type_id: String,
    #[serde(default)]
    pub instance_type_family: String,
    #[serde(default)]
    pub cpu_core_count: u32,
    #[serde(default)]
    pub memory_size: f64,
    #[serde(default)]
    pub eni_quantity: u32,
    #[serde(default)]
    pub disk_quantity: u32,
    #[serde(default)]
    pub local_storage_amount: Option<u32>,
    #[serde(default)]
    pub local_storage_capacity: Option<u64>,
    #[serde(default)]
    pub local_storage_category: Option<String>,
}

/// Flattened flavor attributes written into the YAML fragment.
#[derive(Debug, Clone, PartialEq)]
pub struct FlavorInfo {
    pub name: String,
    pub cpu: u32,
    pub memory: f64,
    pub nic_count: u32,
    pub disk_quantity: u32,
    pub disk_count: Option<u32>,
    pub disk_size: Option<u64>,
    pub disk_type: Option<&'static str>,
    pub boot_mode: Option<&'static str>,
    pub arch: Option<&'static str>,
}

/// Query the spec of a single flavor.
pub fn query_spec(flavor: &str) -> ExecutorResult<InstanceTypeSpec> {
    let response: DescribeInstanceTypesResponse = aliyun(&[
        "ecs",
        "DescribeInstanceTypes",
        "--InstanceTypes.1",
        flavor,
    ])?;

    response
        .instance_types
        .instance_type
        .into_iter()
        .find(|spec| spec.instance_type_id == flavor)
        .ok_or_else(|| ExecutorError::UnknownFlavor(flavor.to_string()))
}

/// Extract the harness-facing attributes from an instance type spec.
pub fn extract_info(spec: &InstanceTypeSpec) -> FlavorInfo {
    let mut info = FlavorInfo {
        name: spec.instance_type_id.clone(),
        cpu: spec.cpu_core_count,
        memory: spec.memory_size,
        nic_count: spec.eni_quantity,
        disk_quantity: spec.disk_quantity,
        disk_count: None,
        disk_size: None,
        disk_type: None,
        boot_mode: None,
        arch: None,
    };

    if let Some(amount) = spec.local_storage_amount {
        if amount > 0 {
            info.disk_count = Some(amount);
            info.disk_size = spec.local_storage_capacity;
            info.disk_type = match spec.local_storage_category.as_deref() {
                Some("local_ssd_pro") => Some("ssd"),
                Some("local_hdd_pro") => Some("hdd"),
                _ => None,
            };
            // Some families expose their local disks as NVMe devices.
            if NVME_FAMILIES.contains(&spec.instance_type_family.as_str()) {
                info.disk_type = Some("nvme");
            }
        }
    }

    // Security-enhanced families keep 50% of memory encrypted.
    if ENCRYPTED_MEMORY_FAMILIES.contains(&spec.instance_type_family.as_str()) {
        info.memory = (info.memory * 0.5).trunc();
    }

    if ARM_FAMILIES.contains(&spec.instance_type_family.as_str()) {
        info.boot_mode = Some("uefi");
        info.arch = Some("aarch64");
    }

    info
}

/// Compile the flavors YAML fragment.
pub fn compile_fragment(info: &FlavorInfo) -> String {
    let mut out = String::new();
    out.push_str("Flavor: !mux\n\n");
    let _ = writeln!(out, "  {}:", info.name);
    let _ = writeln!(out, "    name: {}", info.name);
    let _ = writeln!(out, "    cpu: {}", info.cpu);
    let _ = writeln!(out, "    memory: {}", info.memory);
    let _ = writeln!(out, "    nic_count: {}", info.nic_count);
    let _ = writeln!(out, "    disk_quantity: {}", info.disk_quantity);
    if let Some(disk_count) = info.disk_count {
        let _ = writeln!(out, "    disk_count: {disk_count}");
    }
    if let Some(disk_size) = info.disk_size {
        let _ = writeln!(out, "    disk_size: {disk_size}");
    }
    if let Some(disk_type) = info.disk_type {
        let _ = writeln!(out, "    disk_type: {disk_type}");
    }
    if let Some(boot_mode) = info.boot_mode {
        let _ = writeln!(out, "    boot_mode: {boot_mode}");
    }
    if let Some(arch) = info.arch {
        let _ = writeln!(out, "    arch: {arch}");
    }
    out
}

/// Provision the flavors YAML fragment for one flavor.
pub fn provision_flavor_data(file: &Path, flavor: &str) -> ExecutorResult<()> {
    let spec = query_spec(flavor)?;
    let info = extract_info(&spec);
    debug!("flavor info for \"{flavor}\": {info:?}");
    std::fs::write(file, compile_fragment(&info))?;
    Ok(())
}
