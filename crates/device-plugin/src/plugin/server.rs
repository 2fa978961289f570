use std::io;
use std::path::Path;
use std::sync::Arc;

use error_stack::Report;
use error_stack::ResultExt;
use tokio::net::UnixListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnixListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tonic::Request;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::api::device_plugin_server::DevicePluginServer;
use super::api::registration_client::RegistrationClient;
use super::api::DevicePluginOptions;
use super::api::RegisterRequest;
use super::service::DevicePluginService;
use super::uds::connect_uds;
use super::LifecycleState;
use super::PluginError;
use super::API_VERSION;
use crate::allocation::AllocationRules;
use crate::config::PluginSettings;
use crate::device::health;
use crate::device::Device;
use crate::device::DeviceCatalog;
use crate::device::DeviceSnapshot;
use crate::device::HealthMonitor;
use crate::device::HealthReporter;
use crate::device::SharedCatalog;

/// Capacity of the per-watcher update queue before a watcher counts as lagging.
const UPDATE_BROADCAST_CAPACITY: usize = 64;

/// Tasks of a started server, torn down together by [`GpuDevicePlugin::stop`].
#[derive(Debug)]
struct Running {
    shutdown: CancellationToken,
    server: JoinHandle<()>,
    coordinator: JoinHandle<()>,
    health_check: JoinHandle<()>,
}

/// GPU device plugin for the kubelet, served over a unix socket.
#[derive(Debug)]
pub struct GpuDevicePlugin {
    settings: PluginSettings,
    catalog: SharedCatalog,
    rules: Arc<AllocationRules>,
    health: HealthMonitor,
    updates: broadcast::Sender<DeviceSnapshot>,
    options: DevicePluginOptions,
    state: LifecycleState,
    running: Option<Running>,
}

impl GpuDevicePlugin {
    pub fn new(settings: PluginSettings, catalog: DeviceCatalog, rules: AllocationRules) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_BROADCAST_CAPACITY);
        Self {
            settings,
            catalog: catalog.into_shared(),
            rules: Arc::new(rules),
            health: HealthMonitor::default(),
            updates,
            options: DevicePluginOptions {
                pre_start_required: false,
                get_preferred_allocation_available: false,
            },
            state: LifecycleState::Created,
            running: None,
        }
    }

    pub fn settings(&self) -> &PluginSettings {
        &self.settings
    }

    pub fn lifecycle(&self) -> LifecycleState {
        self.state
    }

    /// Handle for pushing health transitions to connected watchers.
    pub fn health_reporter(&self) -> HealthReporter {
        self.health.reporter()
    }

    /// Current device list.
    pub fn devices(&self) -> Vec<Device> {
        self.catalog
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .devices()
            .to_vec()
    }

    /// Start the gRPC server on the plugin socket.
    ///
    /// Returns once the socket accepts connections. Starting a server that is
    /// already serving does nothing.
    ///
    /// # Errors
    ///
    /// - [`PluginError::Socket`] if a stale socket cannot be removed or binding fails
    /// - [`PluginError::Dial`] if the socket does not accept a connection in time
    pub async fn start(&mut self) -> Result<(), Report<PluginError>> {
        if self.running.is_some() {
            debug!("device plugin already serving");
            return Ok(());
        }

        self.state = LifecycleState::Starting;
        match self.launch().await {
            Ok(running) => {
                self.running = Some(running);
                self.state = LifecycleState::Serving;
                Ok(())
            }
            Err(e) => {
                self.state = LifecycleState::Failed;
                Err(e)
            }
        }
    }

    async fn launch(&self) -> Result<Running, Report<PluginError>> {
        let socket_path = &self.settings.socket_path;
        info!("start device plugin server: {}", socket_path.display());

        remove_socket(socket_path)?;
        let listener = UnixListener::bind(socket_path).change_context(PluginError::Socket {
            path: socket_path.display().to_string(),
        })?;

        let shutdown = CancellationToken::new();
        let service = DevicePluginService::new(
            self.catalog.clone(),
            self.updates.clone(),
            self.rules.clone(),
            self.options,
            shutdown.clone(),
        );

        info!("gRPC server is bound to: {}", socket_path.display());

        let server_token = shutdown.clone();
        let server = tokio::spawn(async move {
            let result = Server::builder()
                .add_service(DevicePluginServer::new(service))
                .serve_with_incoming_shutdown(UnixListenerStream::new(listener), async move {
                    server_token.cancelled().await;
                    info!("shutting down gRPC server");
                })
                .await;
            if let Err(e) = result {
                error!("device plugin gRPC server failed: {e}");
            }
        });

        // wait for the server to accept connections before declaring it started
        if let Err(e) = connect_uds(socket_path, self.settings.dial_timeout).await {
            shutdown.cancel();
            server.abort();
            if let Err(cleanup) = remove_socket(socket_path) {
                warn!("failed to remove plugin socket after failed start: {cleanup:?}");
            }
            return Err(e.attach_printable("device plugin socket is not accepting connections"));
        }

        let coordinator = self.health.spawn_coordinator(
            self.catalog.clone(),
            self.updates.clone(),
            shutdown.clone(),
        );
        let health_check = health::spawn_health_check(
            self.settings.disable_health_checks,
            self.health.reporter(),
            shutdown.clone(),
        );

        Ok(Running {
            shutdown,
            server,
            coordinator,
            health_check,
        })
    }

    /// Register this plugin's endpoint and resource name with the kubelet.
    ///
    /// # Errors
    ///
    /// - [`PluginError::Dial`] if the kubelet socket cannot be reached in time
    /// - [`PluginError::Registration`] if the kubelet rejects the request
    pub async fn register(&self) -> Result<(), Report<PluginError>> {
        let kubelet_socket = &self.settings.kubelet_socket;
        info!(
            "registering device plugin with kubelet: {}",
            kubelet_socket.display()
        );

        let channel = connect_uds(kubelet_socket, self.settings.dial_timeout).await?;
        let mut client = RegistrationClient::new(channel);

        let request = RegisterRequest {
            version: API_VERSION.to_string(),
            endpoint: self.settings.endpoint(),
            resource_name: self.settings.resource_name.clone(),
            options: Some(self.options),
        };

        client
            .register(Request::new(request))
            .await
            .change_context(PluginError::Registration {
                resource_name: self.settings.resource_name.clone(),
            })?;

        info!(
            resource = %self.settings.resource_name,
            "successfully registered device plugin with kubelet"
        );
        Ok(())
    }

    /// Start the server and register it with the kubelet.
    ///
    /// A failed registration stops the server again, so no listener is left behind,
    /// and leaves the plugin in [`LifecycleState::Failed`].
    ///
    /// # Errors
    ///
    /// - any error of [`Self::start`]
    /// - [`PluginError::Dial`] if the kubelet socket cannot be reached
    /// - [`PluginError::Registration`] if the kubelet rejects the plugin
    pub async fn serve(&mut self) -> Result<(), Report<PluginError>> {
        if let Err(e) = self.start().await {
            error!("Could not start device plugin: {e:?}");
            return Err(e);
        }
        info!(
            "Starting to serve on {}",
            self.settings.socket_path.display()
        );

        if let Err(e) = self.register().await {
            error!("Could not register device plugin: {e:?}");
            if let Err(stop_err) = self.stop().await {
                warn!("failed to stop device plugin after registration failure: {stop_err:?}");
            }
            self.state = LifecycleState::Failed;
            return Err(e);
        }
        info!("Registered device plugin with Kubelet");

        Ok(())
    }

    /// Stop serving, end all watch streams and remove the socket.
    ///
    /// Does nothing when the server is not running.
    pub async fn stop(&mut self) -> Result<(), Report<PluginError>> {
        let Some(mut running) = self.running.take() else {
            debug!("device plugin not running, nothing to stop");
            return Ok(());
        };

        self.state = LifecycleState::Stopping;
        running.shutdown.cancel();

        if tokio::time::timeout(self.settings.dial_timeout, &mut running.server)
            .await
            .is_err()
        {
            warn!("gRPC server did not shut down in time, aborting");
            running.server.abort();
        }
        running.coordinator.abort();
        running.health_check.abort();

        let removed = remove_socket(&self.settings.socket_path);
        self.state = LifecycleState::Stopped;
        info!("device plugin stopped");
        removed
    }
}

impl Drop for GpuDevicePlugin {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            running.shutdown.cancel();
            running.coordinator.abort();
            running.health_check.abort();
            if let Err(e) = remove_socket(&self.settings.socket_path) {
                warn!("failed to remove socket on drop: {e:?}");
            }
        }
    }
}

/// Remove the socket file, tolerating its absence.
fn remove_socket(path: &Path) -> Result<(), Report<PluginError>> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Report::new(e).change_context(PluginError::Socket {
            path: path.display().to_string(),
        })),
    }
}
