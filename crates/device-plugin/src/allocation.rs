//! Translates requested device ids into container device nodes, environment
//! variables and bind mounts.

use std::collections::HashMap;

use error_stack::Report;

use crate::config::ConfigError;
use crate::config::ConfigProvider;
use crate::device::device_path;
use crate::plugin::api::AllocateResponse;
use crate::plugin::api::ContainerAllocateRequest;
use crate::plugin::api::ContainerAllocateResponse;
use crate::plugin::api::DeviceSpec;
use crate::plugin::api::Mount;

pub const SIDEKICK_DEVICES_KEY: &str = "devices.sidekicks";
pub const ENV_VARS_KEY: &str = "environment.libs";
pub const LIB_MOUNTS_KEY: &str = "mounts.libs";
pub const BIN_MOUNTS_KEY: &str = "mounts.bins";

/// cgroup permissions granted on every device node: read, write, mknod
pub const DEVICE_PERMISSIONS: &str = "rwm";

/// Configuration derived grants added to every container allocation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AllocationRules {
    sidekick_devices: Vec<DeviceSpec>,
    envs: HashMap<String, String>,
    mounts: Vec<Mount>,
}

impl AllocationRules {
    /// Read the optional allocation keys; absent keys contribute nothing.
    ///
    /// # Errors
    ///
    /// - [`ConfigError::Parse`] if a present key holds a mapping instead of a string or list
    pub fn from_config(cfg: &ConfigProvider) -> Result<Self, Report<ConfigError>> {
        Ok(Self::from_strs(
            &cfg.string_or(SIDEKICK_DEVICES_KEY, "")?,
            &cfg.string_or(ENV_VARS_KEY, "")?,
            &cfg.string_or(LIB_MOUNTS_KEY, "")?,
            &cfg.string_or(BIN_MOUNTS_KEY, "")?,
        ))
    }

    /// Build rules from the raw comma separated setting values.
    pub fn from_strs(sidekicks: &str, env_vars: &str, lib_mounts: &str, bin_mounts: &str) -> Self {
        let mut mounts = parse_lib_mounts(lib_mounts);
        mounts.extend(parse_bin_mounts(bin_mounts));

        Self {
            sidekick_devices: parse_sidekicks(sidekicks),
            envs: parse_env_vars(env_vars),
            mounts,
        }
    }

    pub fn sidekick_devices(&self) -> &[DeviceSpec] {
        &self.sidekick_devices
    }

    pub fn envs(&self) -> &HashMap<String, String> {
        &self.envs
    }

    pub fn mounts(&self) -> &[Mount] {
        &self.mounts
    }
}

/// Plan the grant for each container request, preserving request order.
///
/// Sidekick devices come first, then one device node per requested id.
/// Requested ids are not checked against the catalog.
pub fn plan(requests: &[ContainerAllocateRequest], rules: &AllocationRules) -> AllocateResponse {
    let container_responses = requests
        .iter()
        .map(|request| {
            let mut devices = rules.sidekick_devices.clone();
            devices.extend(
                request
                    .devices_ids
                    .iter()
                    .map(|id| device_spec(&device_path(id))),
            );

            ContainerAllocateResponse {
                envs: rules.envs.clone(),
                mounts: rules.mounts.clone(),
                devices,
                annotations: HashMap::new(),
                cdi_devices: Vec::new(),
            }
        })
        .collect();

    AllocateResponse {
        container_responses,
    }
}

fn device_spec(path: &str) -> DeviceSpec {
    DeviceSpec {
        container_path: path.to_string(),
        host_path: path.to_string(),
        permissions: DEVICE_PERMISSIONS.to_string(),
    }
}

fn read_only_mount(host_path: &str, container_path: &str) -> Mount {
    Mount {
        container_path: container_path.to_string(),
        host_path: host_path.to_string(),
        read_only: true,
    }
}

fn entries(list: &str) -> impl Iterator<Item = &str> {
    list.split(',').map(str::trim).filter(|entry| !entry.is_empty())
}

fn parse_sidekicks(list: &str) -> Vec<DeviceSpec> {
    entries(list).map(device_spec).collect()
}

/// `KEY=VALUE` pairs; anything without exactly one `=` is dropped.
fn parse_env_vars(list: &str) -> HashMap<String, String> {
    entries(list)
        .filter_map(|pair| {
            let parts: Vec<&str> = pair.split('=').collect();
            match parts.as_slice() {
                [key, value] => Some((key.to_string(), value.to_string())),
                _ => None,
            }
        })
        .collect()
}

/// `host:container` or a bare path mounted at the same location.
fn parse_lib_mounts(list: &str) -> Vec<Mount> {
    entries(list)
        .map(|entry| {
            let parts: Vec<&str> = entry.split(':').collect();
            match parts.as_slice() {
                [host, container] => read_only_mount(host, container),
                _ => read_only_mount(entry, entry),
            }
        })
        .collect()
}

fn parse_bin_mounts(list: &str) -> Vec<Mount> {
    entries(list)
        .map(|entry| read_only_mount(entry, entry))
        .collect()
}
