use std::path::PathBuf;

use clap::Args;
use clap::Parser;
use clap::Subcommand;
use clap::ValueEnum;
use utils::version;

use crate::config::DEFAULT_DEVICE_PLUGIN_DIR;
use crate::config::DEFAULT_RESOURCE_NAME;
use crate::config::DEFAULT_SOCKET_NAME;
use crate::config::KUBELET_SOCKET_NAME;

#[derive(Parser)]
#[command(about, long_about, version = &**version::VERSION)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Serve the device plugin and register it with the kubelet
    Serve(Box<PluginArgs>),
    /// Print the devices that would be advertised
    #[command(name = "list-devices")]
    ListDevices(DiscoveryArgs),
}

/// How the advertised device list is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Discovery {
    /// Read `devices.gpus` from the configuration file
    Config,
    /// Scan the device directory for `nvidia<N>` entries
    Scan,
}

#[derive(Args, Clone, Debug)]
pub struct DiscoveryArgs {
    #[arg(
        long,
        env = "DEVICE_PLUGIN_CONFIG",
        value_hint = clap::ValueHint::FilePath,
        default_value = "/etc/gpu-device-plugin/config.yml",
        help = "Path of the plugin configuration file"
    )]
    pub config: PathBuf,

    #[arg(
        long,
        value_enum,
        env = "DEVICE_PLUGIN_DISCOVERY",
        default_value = "config",
        help = "Where the device list comes from"
    )]
    pub discovery: Discovery,

    #[arg(
        long,
        value_hint = clap::ValueHint::DirPath,
        default_value = "/dev",
        help = "Directory scanned for device nodes when discovery is 'scan'"
    )]
    pub device_dir: PathBuf,
}

#[derive(Args, Clone, Debug)]
pub struct PluginArgs {
    #[command(flatten)]
    pub discovery: DiscoveryArgs,

    #[arg(
        long,
        env = "DEVICE_PLUGIN_DIR",
        value_hint = clap::ValueHint::DirPath,
        default_value = DEFAULT_DEVICE_PLUGIN_DIR,
        help = "Kubelet device plugin directory holding the plugin and kubelet sockets"
    )]
    pub device_plugin_dir: PathBuf,

    #[arg(
        long,
        default_value = DEFAULT_SOCKET_NAME,
        help = "File name of the plugin socket inside the device plugin directory"
    )]
    pub socket_name: String,

    #[arg(
        long,
        default_value = KUBELET_SOCKET_NAME,
        help = "File name of the kubelet registration socket inside the device plugin directory"
    )]
    pub kubelet_socket_name: String,

    #[arg(
        long,
        env = "DEVICE_PLUGIN_RESOURCE_NAME",
        default_value = DEFAULT_RESOURCE_NAME,
        help = "Extended resource name advertised to the kubelet"
    )]
    pub resource_name: String,

    #[arg(
        long,
        default_value = "5",
        help = "Timeout in seconds for dialing the plugin and kubelet sockets"
    )]
    pub dial_timeout_secs: u64,

    #[arg(
        long,
        env = "DP_DISABLE_HEALTHCHECKS",
        default_value_t = false,
        action = clap::ArgAction::Set,
        help = "Disable the device health check task"
    )]
    pub disable_health_checks: bool,
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn serve_uses_defaults() {
        let cli = Cli::try_parse_from(["gpu-device-plugin", "serve"]).expect("should parse");

        let Commands::Serve(args) = cli.command else {
            panic!("expected serve command");
        };
        assert_eq!(args.socket_name, DEFAULT_SOCKET_NAME);
        assert_eq!(args.resource_name, DEFAULT_RESOURCE_NAME);
        assert_eq!(args.dial_timeout_secs, 5);
        assert_eq!(args.discovery.discovery, Discovery::Config);
    }

    #[test]
    fn list_devices_accepts_scan_mode() {
        let cli = Cli::try_parse_from([
            "gpu-device-plugin",
            "list-devices",
            "--discovery",
            "scan",
            "--device-dir",
            "/tmp/dev",
        ])
        .expect("should parse");

        let Commands::ListDevices(args) = cli.command else {
            panic!("expected list-devices command");
        };
        assert_eq!(args.discovery, Discovery::Scan);
        assert_eq!(args.device_dir, PathBuf::from("/tmp/dev"));
    }
}
