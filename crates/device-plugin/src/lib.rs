pub mod allocation;
pub mod config;
pub mod device;
pub mod logging;
pub mod plugin;

pub use allocation::AllocationRules;
pub use config::ConfigProvider;
pub use config::PluginSettings;
pub use device::DeviceCatalog;
pub use plugin::GpuDevicePlugin;
