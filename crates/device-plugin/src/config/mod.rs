pub mod cli;
pub mod provider;

use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

pub use cli::*;
pub use provider::*;

/// Directory where the kubelet expects device plugin sockets.
pub const DEFAULT_DEVICE_PLUGIN_DIR: &str = "/var/lib/kubelet/device-plugins/";
/// Socket file name of this plugin.
pub const DEFAULT_SOCKET_NAME: &str = "qnib-gpu.sock";
/// Socket file name of the kubelet registration service.
pub const KUBELET_SOCKET_NAME: &str = "kubelet.sock";
/// Extended resource advertised to the kubelet.
pub const DEFAULT_RESOURCE_NAME: &str = "qnib.org/gpu";
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Runtime settings of the plugin server, fixed for the lifetime of the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginSettings {
    /// unix socket the plugin serves on
    pub socket_path: PathBuf,
    /// kubelet registration socket
    pub kubelet_socket: PathBuf,
    pub resource_name: String,
    /// bound for the self-dial at startup and the registration dial
    pub dial_timeout: Duration,
    pub disable_health_checks: bool,
}

impl Default for PluginSettings {
    fn default() -> Self {
        Self::in_directory(DEFAULT_DEVICE_PLUGIN_DIR)
    }
}

impl PluginSettings {
    /// Default settings with both sockets placed in `dir`.
    pub fn in_directory(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            socket_path: dir.join(DEFAULT_SOCKET_NAME),
            kubelet_socket: dir.join(KUBELET_SOCKET_NAME),
            resource_name: DEFAULT_RESOURCE_NAME.to_string(),
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            disable_health_checks: false,
        }
    }

    /// Endpoint announced at registration: the base name of the plugin socket.
    pub fn endpoint(&self) -> String {
        self.socket_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

impl From<&PluginArgs> for PluginSettings {
    fn from(args: &PluginArgs) -> Self {
        Self {
            socket_path: args.device_plugin_dir.join(&args.socket_name),
            kubelet_socket: args.device_plugin_dir.join(&args.kubelet_socket_name),
            resource_name: args.resource_name.clone(),
            dial_timeout: Duration::from_secs(args.dial_timeout_secs.max(1)),
            disable_health_checks: args.disable_health_checks,
        }
    }
}
