use std::path::Path;
use std::sync::Arc;
use std::sync::LazyLock;
use std::sync::RwLock;

use error_stack::Report;
use error_stack::ResultExt;
use regex::Regex;
use thiserror::Error;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::config::ConfigProvider;
use crate::device::Device;
use crate::device::Health;

/// Prefix of accelerator device nodes; the device id follows it.
pub const DEVICE_PATH_PREFIX: &str = "/dev/nvidia";
/// Control device that is always advertised and always healthy.
pub const CONTROL_DEVICE_ID: &str = "0";
/// Configuration key holding the comma separated device paths.
pub const GPU_LIST_KEY: &str = "devices.gpus";

const DEVICE_FILE_PREFIX: &str = "nvidia";

static DEVICE_PATH_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^/dev/nvidia(?P<dev_id>\d+)$").expect("device path pattern is valid")
});

static DEVICE_FILE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^nvidia(?P<dev_id>\d+)$").expect("device file pattern is valid")
});

/// Catalog shared between the health coordinator (the only writer) and the RPC handlers.
pub type SharedCatalog = Arc<RwLock<DeviceCatalog>>;

/// Full device list as sent on a `ListAndWatch` stream.
pub type DeviceSnapshot = Arc<[Device]>;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("no device list configured")]
    Config,
    #[error("failed to scan device directory {path}")]
    DeviceDirectory { path: String },
}

/// Host path of the device node for `id`.
pub fn device_path(id: &str) -> String {
    format!("{DEVICE_PATH_PREFIX}{id}")
}

/// Ordered, id-unique list of advertised devices.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceCatalog {
    devices: Vec<Device>,
    /// Set when `"0"` was added as the control device rather than configured.
    control_appended: bool,
}

impl DeviceCatalog {
    /// Build the catalog from the `devices.gpus` configuration key.
    ///
    /// # Errors
    ///
    /// - [`CatalogError::Config`] if the key is absent
    pub fn from_config(cfg: &ConfigProvider) -> Result<Self, Report<CatalogError>> {
        let gpus = cfg
            .string(GPU_LIST_KEY)
            .change_context(CatalogError::Config)
            .attach_printable_lazy(|| format!("key '{GPU_LIST_KEY}' must hold a list of GPUs"))?;

        Ok(Self::from_paths(gpus.split(',')))
    }

    /// Build the catalog from device paths like `/dev/nvidia3`.
    ///
    /// Entries that do not match are skipped. The control device is appended.
    pub fn from_paths<'a>(paths: impl IntoIterator<Item = &'a str>) -> Self {
        let mut catalog = Self::default();
        for path in paths.into_iter().map(str::trim) {
            match capture_id(&DEVICE_PATH_PATTERN, path) {
                Some(id) => catalog.insert(Device::healthy(id)),
                None => warn!(
                    "Path '{}' does not match '{}'",
                    path,
                    DEVICE_PATH_PATTERN.as_str()
                ),
            }
        }
        catalog.with_control_device()
    }

    /// Build the catalog by scanning `dir` for `nvidia<N>` device nodes.
    ///
    /// Other `nvidia*` entries such as `nvidiactl` are skipped. The control device is appended.
    pub fn scan(dir: impl AsRef<Path>) -> Result<Self, Report<CatalogError>> {
        let dir = dir.as_ref();
        let entries = std::fs::read_dir(dir).change_context(CatalogError::DeviceDirectory {
            path: dir.display().to_string(),
        })?;

        let mut found = Vec::new();
        for entry in entries {
            let entry = entry.change_context(CatalogError::DeviceDirectory {
                path: dir.display().to_string(),
            })?;
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            if !name.starts_with(DEVICE_FILE_PREFIX) {
                continue;
            }
            match capture_id(&DEVICE_FILE_PATTERN, name) {
                Some(id) => found.push(id),
                None => debug!("File '{}' is not a GPU device node", name),
            }
        }
        // read_dir order is unspecified
        found.sort_by_key(|id| id.parse::<u64>().unwrap_or(u64::MAX));

        let mut catalog = Self::default();
        for id in found {
            catalog.insert(Device::healthy(id));
        }
        info!(
            "Found {} GPU device node(s) in {}",
            catalog.len(),
            dir.display()
        );
        Ok(catalog.with_control_device())
    }

    /// Whether a device with `id` is advertised.
    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    pub fn get(&self, id: &str) -> Option<&Device> {
        self.devices.iter().find(|d| d.id == id)
    }

    /// Whether `id` is the appended control device, which always stays healthy.
    ///
    /// A configured `/dev/nvidia0` is a regular GPU and does not count.
    pub fn is_control_device(&self, id: &str) -> bool {
        self.control_appended && id == CONTROL_DEVICE_ID
    }

    /// Mark a device unhealthy. There is no way back to healthy.
    ///
    /// Returns `false` if the id is unknown or names the appended control device.
    pub fn mark_unhealthy(&mut self, id: &str) -> bool {
        if self.is_control_device(id) {
            return false;
        }
        match self.devices.iter_mut().find(|d| d.id == id) {
            Some(device) => {
                device.health = Health::Unhealthy;
                true
            }
            None => false,
        }
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn snapshot(&self) -> DeviceSnapshot {
        self.devices.clone().into()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn into_shared(self) -> SharedCatalog {
        Arc::new(RwLock::new(self))
    }

    fn insert(&mut self, device: Device) {
        if self.contains(&device.id) {
            warn!("Skipping duplicate device id '{}'", device.id);
            return;
        }
        self.devices.push(device);
    }

    fn with_control_device(mut self) -> Self {
        if !self.contains(CONTROL_DEVICE_ID) {
            self.devices.push(Device::healthy(CONTROL_DEVICE_ID));
            self.control_appended = true;
        }
        self
    }
}

fn capture_id(pattern: &Regex, input: &str) -> Option<String> {
    pattern
        .captures(input)
        .and_then(|caps| caps.name("dev_id"))
        .map(|m| m.as_str().to_string())
}
