use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use error_stack::Report;
use gpu_device_plugin::config::Cli;
use gpu_device_plugin::config::Commands;
use gpu_device_plugin::config::ConfigError;
use gpu_device_plugin::config::Discovery;
use gpu_device_plugin::config::DiscoveryArgs;
use gpu_device_plugin::config::PluginArgs;
use gpu_device_plugin::logging;
use gpu_device_plugin::AllocationRules;
use gpu_device_plugin::ConfigProvider;
use gpu_device_plugin::DeviceCatalog;
use gpu_device_plugin::GpuDevicePlugin;
use gpu_device_plugin::PluginSettings;
use tokio::signal::unix::signal;
use tokio::signal::unix::SignalKind;
use utils::version;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let cli = Cli::parse();
    let _guard = logging::init();

    match cli.command {
        Commands::Serve(plugin_args) => run_serve(*plugin_args).await,
        Commands::ListDevices(discovery_args) => run_list_devices(&discovery_args),
    }
}

async fn run_serve(plugin_args: PluginArgs) -> Result<()> {
    tracing::info!("Starting GPU device plugin {}", &**version::VERSION);

    let (catalog, rules) = discover(&plugin_args.discovery)?;
    tracing::info!("Advertising {} device(s)", catalog.len());

    let mut plugin = GpuDevicePlugin::new(PluginSettings::from(&plugin_args), catalog, rules);
    plugin
        .serve()
        .await
        .map_err(|e| anyhow::anyhow!("failed to serve device plugin: {e:?}"))?;

    shutdown_signal().await?;
    tracing::info!("Shutdown signal received, stopping device plugin");

    plugin
        .stop()
        .await
        .map_err(|e| anyhow::anyhow!("failed to stop device plugin: {e:?}"))?;
    Ok(())
}

fn run_list_devices(discovery_args: &DiscoveryArgs) -> Result<()> {
    let (catalog, _) = discover(discovery_args)?;
    for device in catalog.devices() {
        println!("{}\t{}", device.id, device.health);
    }
    Ok(())
}

/// Build the device catalog and allocation rules.
///
/// Config discovery requires the configuration file. Scan discovery reads it
/// only for allocation rules and tolerates its absence.
fn discover(args: &DiscoveryArgs) -> Result<(DeviceCatalog, AllocationRules)> {
    let cfg = match ConfigProvider::load(&args.config) {
        Ok(cfg) => Some(cfg),
        Err(e)
            if args.discovery == Discovery::Scan
                && matches!(e.current_context(), ConfigError::MissingFile { .. }) =>
        {
            tracing::info!(
                "No plugin config at {}, using empty allocation rules",
                args.config.display()
            );
            None
        }
        Err(e) => return Err(report_to_anyhow(e)),
    };

    let rules = match &cfg {
        Some(cfg) => AllocationRules::from_config(cfg).map_err(report_to_anyhow)?,
        None => AllocationRules::default(),
    };

    let catalog = match (args.discovery, &cfg) {
        (Discovery::Config, Some(cfg)) => DeviceCatalog::from_config(cfg),
        _ => DeviceCatalog::scan(&args.device_dir),
    }
    .map_err(report_to_anyhow)?;

    Ok((catalog, rules))
}

fn report_to_anyhow<C: error_stack::Context>(report: Report<C>) -> anyhow::Error {
    anyhow::anyhow!("{report:?}")
}

async fn shutdown_signal() -> Result<()> {
    let mut terminate =
        signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("failed to listen for ctrl-c")?,
        _ = terminate.recv() => {}
    }
    Ok(())
}
