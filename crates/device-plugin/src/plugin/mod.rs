//! Kubernetes device plugin server.
//!
//! [`GpuDevicePlugin`] owns the unix socket endpoint and its lifecycle,
//! [`DevicePluginService`] answers the device plugin RPCs.

#![allow(clippy::doc_markdown)]
pub mod api {
    #![allow(clippy::doc_overindented_list_items)]
    tonic::include_proto!("v1beta1");
}

mod server;
mod service;
mod uds;

pub use server::GpuDevicePlugin;
pub use service::DevicePluginService;
pub use uds::connect_uds;

/// Device plugin API version announced at registration.
pub const API_VERSION: &str = "v1beta1";

/// Errors of the plugin lifecycle.
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    #[error("socket error at {path}")]
    Socket { path: String },
    #[error("failed to dial {endpoint}")]
    Dial { endpoint: String },
    #[error("kubelet rejected registration of resource {resource_name}")]
    Registration { resource_name: String },
    #[error("device list watcher disconnected")]
    StreamSend,
}

/// Lifecycle of a [`GpuDevicePlugin`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum LifecycleState {
    #[display("created")]
    Created,
    #[display("starting")]
    Starting,
    #[display("serving")]
    Serving,
    #[display("stopping")]
    Stopping,
    #[display("stopped")]
    Stopped,
    #[display("failed")]
    Failed,
}
