use std::pin::Pin;
use std::sync::Arc;
use std::sync::PoisonError;

use error_stack::Report;
use futures::Stream;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::Request;
use tonic::Response;
use tonic::Result as TonicResult;
use tonic::Status;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::api;
use super::api::device_plugin_server::DevicePlugin;
use super::api::AllocateRequest;
use super::api::AllocateResponse;
use super::api::DevicePluginOptions;
use super::api::Empty;
use super::api::ListAndWatchResponse;
use super::api::PreStartContainerRequest;
use super::api::PreStartContainerResponse;
use super::api::PreferredAllocationRequest;
use super::api::PreferredAllocationResponse;
use super::PluginError;
use crate::allocation;
use crate::allocation::AllocationRules;
use crate::device::Device;
use crate::device::DeviceSnapshot;
use crate::device::SharedCatalog;

const WATCH_STREAM_BUFFER: usize = 4;

type WatchItem = Result<ListAndWatchResponse, Status>;

/// DevicePlugin service implementation
///
/// Reads the shared catalog; health updates arrive through `updates`,
/// published by the health coordinator.
#[derive(Debug, Clone)]
pub struct DevicePluginService {
    catalog: SharedCatalog,
    updates: broadcast::Sender<DeviceSnapshot>,
    rules: Arc<AllocationRules>,
    options: DevicePluginOptions,
    /// stop signal shared with the server; ends every watch stream
    shutdown: CancellationToken,
}

impl DevicePluginService {
    pub fn new(
        catalog: SharedCatalog,
        updates: broadcast::Sender<DeviceSnapshot>,
        rules: Arc<AllocationRules>,
        options: DevicePluginOptions,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            catalog,
            updates,
            rules,
            options,
            shutdown,
        }
    }

    fn current_snapshot(&self) -> DeviceSnapshot {
        self.catalog
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .snapshot()
    }

    /// Initial device list and the subscription for later changes, taken
    /// atomically with respect to health transitions.
    fn subscribe(&self) -> (DeviceSnapshot, broadcast::Receiver<DeviceSnapshot>) {
        let catalog = self.catalog.read().unwrap_or_else(PoisonError::into_inner);
        (catalog.snapshot(), self.updates.subscribe())
    }
}

fn to_response(devices: &[Device]) -> ListAndWatchResponse {
    ListAndWatchResponse {
        devices: devices
            .iter()
            .map(|d| api::Device {
                id: d.id.clone(),
                health: d.health.to_string(),
                topology: None,
            })
            .collect(),
    }
}

async fn send_devices(
    tx: &mpsc::Sender<WatchItem>,
    devices: &[Device],
) -> Result<(), Report<PluginError>> {
    tx.send(Ok(to_response(devices)))
        .await
        .map_err(|_| Report::new(PluginError::StreamSend))
}

#[tonic::async_trait]
impl DevicePlugin for DevicePluginService {
    /// get device plugin options
    async fn get_device_plugin_options(
        &self,
        _request: Request<Empty>,
    ) -> TonicResult<Response<DevicePluginOptions>> {
        debug!("getting device plugin options");

        Ok(Response::new(self.options))
    }

    type ListAndWatchStream = Pin<Box<dyn Stream<Item = WatchItem> + Send>>;

    /// Send the device list, then resend it on every health transition until stopped.
    async fn list_and_watch(
        &self,
        _request: Request<Empty>,
    ) -> TonicResult<Response<Self::ListAndWatchStream>> {
        let (initial, mut updates) = self.subscribe();
        info!(devices = initial.len(), "starting to watch device list");

        let (tx, rx) = mpsc::channel(WATCH_STREAM_BUFFER);
        let shutdown = self.shutdown.clone();
        let service = self.clone();

        tokio::spawn(async move {
            if let Err(e) = send_devices(&tx, &initial).await {
                warn!("failed to send initial device list: {e:?}");
                return;
            }

            loop {
                let snapshot = tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("stop signal received, closing device watch");
                        break;
                    }
                    _ = tx.closed() => {
                        info!("device list watcher went away");
                        break;
                    }
                    update = updates.recv() => match update {
                        Ok(snapshot) => snapshot,
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "device watch lagged behind, resending current list");
                            service.current_snapshot()
                        }
                        Err(RecvError::Closed) => break,
                    },
                };

                if let Err(e) = send_devices(&tx, &snapshot).await {
                    warn!("{e:?}");
                    break;
                }
            }
            debug!("device watch task stopped");
        });

        let stream = ReceiverStream::new(rx);
        Ok(Response::new(Box::pin(stream) as Self::ListAndWatchStream))
    }

    /// get preferred device allocation
    async fn get_preferred_allocation(
        &self,
        request: Request<PreferredAllocationRequest>,
    ) -> TonicResult<Response<PreferredAllocationResponse>> {
        let req = request.into_inner();
        debug!("getting preferred device allocation: {:?}", req);
        let response = PreferredAllocationResponse {
            container_responses: vec![],
        };
        Ok(Response::new(response))
    }

    /// allocate devices to containers
    async fn allocate(
        &self,
        request: Request<AllocateRequest>,
    ) -> TonicResult<Response<AllocateResponse>> {
        let req = request.into_inner();
        info!(
            containers = req.container_requests.len(),
            "allocating devices"
        );

        {
            let catalog = self.catalog.read().unwrap_or_else(PoisonError::into_inner);
            for container_req in &req.container_requests {
                info!(
                    "allocating devices to container, device IDs: {:?}",
                    container_req.devices_ids
                );
                for id in &container_req.devices_ids {
                    if !catalog.contains(id) {
                        warn!(device_id = %id, "allocating device that is not advertised");
                    }
                }
            }
        }

        let response = allocation::plan(&req.container_requests, &self.rules);
        Ok(Response::new(response))
    }

    /// pre-start container
    async fn pre_start_container(
        &self,
        request: Request<PreStartContainerRequest>,
    ) -> TonicResult<Response<PreStartContainerResponse>> {
        let req = request.into_inner();
        debug!("pre-start container processing: {:?}", req);
        Ok(Response::new(PreStartContainerResponse {}))
    }
}
