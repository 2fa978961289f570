use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use gpu_device_plugin::plugin::api::device_plugin_client::DevicePluginClient;
use gpu_device_plugin::plugin::api::registration_server::Registration;
use gpu_device_plugin::plugin::api::registration_server::RegistrationServer;
use gpu_device_plugin::plugin::api::AllocateRequest;
use gpu_device_plugin::plugin::api::ContainerAllocateRequest;
use gpu_device_plugin::plugin::api::Empty;
use gpu_device_plugin::plugin::api::ListAndWatchResponse;
use gpu_device_plugin::plugin::api::PreStartContainerRequest;
use gpu_device_plugin::plugin::api::RegisterRequest;
use gpu_device_plugin::plugin::connect_uds;
use gpu_device_plugin::plugin::LifecycleState;
use gpu_device_plugin::plugin::PluginError;
use gpu_device_plugin::AllocationRules;
use gpu_device_plugin::DeviceCatalog;
use gpu_device_plugin::GpuDevicePlugin;
use gpu_device_plugin::PluginSettings;
use similar_asserts::assert_eq;
use tempfile::TempDir;
use test_log::test;
use tokio::net::UnixListener;
use tokio_stream::wrappers::UnixListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use tonic::Request;
use tonic::Response;
use tonic::Status;
use tonic::Streaming;

const TIMEOUT: Duration = Duration::from_secs(5);

fn settings(dir: &TempDir) -> PluginSettings {
    PluginSettings {
        dial_timeout: Duration::from_secs(2),
        ..PluginSettings::in_directory(dir.path())
    }
}

fn plugin(dir: &TempDir) -> GpuDevicePlugin {
    GpuDevicePlugin::new(
        settings(dir),
        DeviceCatalog::from_paths(["/dev/nvidia1", "/dev/nvidia2"]),
        AllocationRules::from_strs(
            "/dev/nvidiactl,/dev/nvidia-uvm",
            "NVIDIA_VISIBLE_DEVICES=all",
            "/usr/lib/nvidia:/usr/local/nvidia/lib64",
            "/usr/bin/nvidia-smi",
        ),
    )
}

async fn client(socket: &Path) -> DevicePluginClient<Channel> {
    let channel = connect_uds(socket, TIMEOUT)
        .await
        .expect("plugin socket should accept connections");
    DevicePluginClient::new(channel)
}

async fn next(stream: &mut Streaming<ListAndWatchResponse>) -> Option<ListAndWatchResponse> {
    match tokio::time::timeout(TIMEOUT, stream.message())
        .await
        .expect("stream should yield or end in time")
    {
        Ok(message) => message,
        // the server going away may surface as a transport error
        Err(_) => None,
    }
}

fn health(response: &ListAndWatchResponse, id: &str) -> String {
    response
        .devices
        .iter()
        .find(|d| d.id == id)
        .map(|d| d.health.clone())
        .unwrap_or_else(|| panic!("device {id} should be listed"))
}

/// Kubelet stand-in recording registrations.
#[derive(Clone, Default)]
struct FakeKubelet {
    requests: Arc<Mutex<Vec<RegisterRequest>>>,
    reject: bool,
}

#[tonic::async_trait]
impl Registration for FakeKubelet {
    async fn register(&self, request: Request<RegisterRequest>) -> Result<Response<Empty>, Status> {
        if self.reject {
            return Err(Status::invalid_argument("resource name already registered"));
        }
        self.requests
            .lock()
            .expect("lock")
            .push(request.into_inner());
        Ok(Response::new(Empty {}))
    }
}

fn spawn_kubelet(socket: &Path, kubelet: FakeKubelet) -> CancellationToken {
    let listener = UnixListener::bind(socket).expect("should bind kubelet socket");
    let token = CancellationToken::new();
    let shutdown = token.clone();
    tokio::spawn(async move {
        tonic::transport::Server::builder()
            .add_service(RegistrationServer::new(kubelet))
            .serve_with_incoming_shutdown(UnixListenerStream::new(listener), async move {
                shutdown.cancelled().await;
            })
            .await
    });
    token
}

#[test(tokio::test)]
async fn start_stop_start_on_same_socket() {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let mut plugin = plugin(&dir);
    let socket = plugin.settings().socket_path.clone();

    plugin.start().await.expect("first start should succeed");
    assert_eq!(plugin.lifecycle(), LifecycleState::Serving);
    assert!(socket.exists());

    plugin.stop().await.expect("stop should succeed");
    assert_eq!(plugin.lifecycle(), LifecycleState::Stopped);
    assert!(!socket.exists(), "stop removes the socket file");

    plugin.start().await.expect("restart on same path should succeed");
    assert_eq!(plugin.lifecycle(), LifecycleState::Serving);
    client(&socket).await;

    plugin.stop().await.expect("stop should succeed");
    plugin.stop().await.expect("second stop is a no-op");
    assert_eq!(plugin.lifecycle(), LifecycleState::Stopped);
}

#[test(tokio::test)]
async fn start_replaces_stale_socket_file() {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let mut plugin = plugin(&dir);
    std::fs::write(&plugin.settings().socket_path, b"stale").expect("should write stale file");

    plugin.start().await.expect("start should remove the stale file");

    plugin.stop().await.expect("stop should succeed");
}

#[test(tokio::test)]
async fn start_fails_when_socket_directory_is_missing() {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let mut plugin = GpuDevicePlugin::new(
        PluginSettings::in_directory(dir.path().join("missing")),
        DeviceCatalog::from_paths(["/dev/nvidia1"]),
        AllocationRules::default(),
    );

    let err = plugin.start().await.expect_err("cannot bind in a missing directory");

    assert!(matches!(err.current_context(), PluginError::Socket { .. }));
    assert_eq!(plugin.lifecycle(), LifecycleState::Failed);
}

#[test(tokio::test)]
async fn list_and_watch_reflects_health_transitions() {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let mut plugin = plugin(&dir);
    plugin.start().await.expect("should start");
    let reporter = plugin.health_reporter();

    let mut client = client(&plugin.settings().socket_path).await;
    let mut stream = client
        .list_and_watch(Empty {})
        .await
        .expect("should open watch stream")
        .into_inner();

    let initial = next(&mut stream).await.expect("initial device list");
    let ids: Vec<&str> = initial.devices.iter().map(|d| d.id.as_str()).collect();
    assert_eq!(ids, vec!["1", "2", "0"]);
    assert!(initial.devices.iter().all(|d| d.health == "Healthy"));

    reporter.report_unhealthy("2").await.expect("should report");
    let update = next(&mut stream).await.expect("update after transition");
    assert_eq!(health(&update, "2"), "Unhealthy");
    assert_eq!(health(&update, "1"), "Healthy");
    assert_eq!(health(&update, "0"), "Healthy");

    reporter.report_unhealthy("1").await.expect("should report");
    let update = next(&mut stream).await.expect("second update");
    assert_eq!(health(&update, "2"), "Unhealthy", "no way back to healthy");
    assert_eq!(health(&update, "1"), "Unhealthy");

    plugin.stop().await.expect("should stop");
    assert!(next(&mut stream).await.is_none(), "stop ends the watch stream");
}

#[test(tokio::test)]
async fn control_device_stays_healthy_on_the_stream() {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let mut plugin = plugin(&dir);
    plugin.start().await.expect("should start");
    let reporter = plugin.health_reporter();

    let mut client = client(&plugin.settings().socket_path).await;
    let mut stream = client
        .list_and_watch(Empty {})
        .await
        .expect("should open watch stream")
        .into_inner();
    next(&mut stream).await.expect("initial device list");

    reporter.report_unhealthy("0").await.expect("should report");
    reporter.report_unhealthy("1").await.expect("should report");

    let update = next(&mut stream).await.expect("update after transition");
    assert_eq!(health(&update, "0"), "Healthy");
    assert_eq!(health(&update, "1"), "Unhealthy");
    assert_eq!(
        plugin.devices().iter().find(|d| d.id == "0").map(|d| d.health.to_string()),
        Some("Healthy".to_string())
    );

    plugin.stop().await.expect("should stop");
}

#[test(tokio::test)]
async fn dropping_a_running_plugin_removes_its_socket() {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let mut plugin = plugin(&dir);
    let socket = plugin.settings().socket_path.clone();
    plugin.start().await.expect("should start");
    assert!(socket.exists());

    drop(plugin);

    assert!(!socket.exists(), "drop removes the socket file");
}

#[test(tokio::test)]
async fn every_watcher_receives_updates() {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let mut plugin = plugin(&dir);
    plugin.start().await.expect("should start");

    let mut first_client = client(&plugin.settings().socket_path).await;
    let mut second_client = client(&plugin.settings().socket_path).await;
    let mut first = first_client
        .list_and_watch(Empty {})
        .await
        .expect("first stream")
        .into_inner();
    let mut second = second_client
        .list_and_watch(Empty {})
        .await
        .expect("second stream")
        .into_inner();
    next(&mut first).await.expect("first initial list");
    next(&mut second).await.expect("second initial list");

    plugin
        .health_reporter()
        .report_unhealthy("1")
        .await
        .expect("should report");

    for stream in [&mut first, &mut second] {
        let update = next(stream).await.expect("update on every stream");
        assert_eq!(health(&update, "1"), "Unhealthy");
    }

    plugin.stop().await.expect("should stop");
}

#[test(tokio::test)]
async fn allocate_control_device_includes_sidekicks() {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let mut plugin = plugin(&dir);
    plugin.start().await.expect("should start");
    let mut client = client(&plugin.settings().socket_path).await;

    let response = client
        .allocate(AllocateRequest {
            container_requests: vec![ContainerAllocateRequest {
                devices_ids: vec!["0".to_string()],
            }],
        })
        .await
        .expect("allocate should succeed")
        .into_inner();

    assert_eq!(response.container_responses.len(), 1);
    let container = &response.container_responses[0];
    let paths: Vec<&str> = container
        .devices
        .iter()
        .map(|d| d.host_path.as_str())
        .collect();
    assert_eq!(
        paths,
        vec!["/dev/nvidiactl", "/dev/nvidia-uvm", "/dev/nvidia0"]
    );
    assert_eq!(
        container.envs.get("NVIDIA_VISIBLE_DEVICES").map(String::as_str),
        Some("all")
    );
    assert_eq!(container.mounts.len(), 2);
    assert_eq!(container.mounts[0].host_path, "/usr/lib/nvidia");
    assert_eq!(container.mounts[0].container_path, "/usr/local/nvidia/lib64");

    plugin.stop().await.expect("should stop");
}

#[test(tokio::test)]
async fn allocate_accepts_unknown_device_ids() {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let mut plugin = plugin(&dir);
    plugin.start().await.expect("should start");
    let mut client = client(&plugin.settings().socket_path).await;

    let response = client
        .allocate(AllocateRequest {
            container_requests: vec![
                ContainerAllocateRequest {
                    devices_ids: vec!["42".to_string()],
                },
                ContainerAllocateRequest {
                    devices_ids: vec!["1".to_string()],
                },
            ],
        })
        .await
        .expect("unknown ids are not rejected")
        .into_inner();

    assert_eq!(response.container_responses.len(), 2);
    assert_eq!(
        response.container_responses[0]
            .devices
            .last()
            .map(|d| d.host_path.as_str()),
        Some("/dev/nvidia42")
    );
    assert_eq!(
        response.container_responses[1]
            .devices
            .last()
            .map(|d| d.host_path.as_str()),
        Some("/dev/nvidia1")
    );

    plugin.stop().await.expect("should stop");
}

#[test(tokio::test)]
async fn options_and_pre_start_are_acknowledged() {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let mut plugin = plugin(&dir);
    plugin.start().await.expect("should start");
    let mut client = client(&plugin.settings().socket_path).await;

    let options = client
        .get_device_plugin_options(Empty {})
        .await
        .expect("options")
        .into_inner();
    assert!(!options.pre_start_required);
    assert!(!options.get_preferred_allocation_available);

    client
        .pre_start_container(PreStartContainerRequest {
            devices_ids: vec!["1".to_string()],
        })
        .await
        .expect("pre-start should succeed");

    plugin.stop().await.expect("should stop");
}

#[test(tokio::test)]
async fn serve_registers_with_kubelet() {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let mut plugin = plugin(&dir);
    let kubelet = FakeKubelet::default();
    let kubelet_stop = spawn_kubelet(&plugin.settings().kubelet_socket, kubelet.clone());

    plugin.serve().await.expect("serve should succeed");

    let requests = kubelet.requests.lock().expect("lock").clone();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].version, "v1beta1");
    assert_eq!(requests[0].endpoint, "qnib-gpu.sock");
    assert_eq!(requests[0].resource_name, "qnib.org/gpu");
    assert!(requests[0].options.is_some());
    assert_eq!(plugin.lifecycle(), LifecycleState::Serving);

    plugin.stop().await.expect("should stop");
    kubelet_stop.cancel();
}

#[test(tokio::test)]
async fn rejected_registration_rolls_back_start() {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let mut plugin = plugin(&dir);
    let kubelet = FakeKubelet {
        reject: true,
        ..FakeKubelet::default()
    };
    let kubelet_stop = spawn_kubelet(&plugin.settings().kubelet_socket, kubelet);

    let err = plugin.serve().await.expect_err("registration is rejected");

    assert!(matches!(
        err.current_context(),
        PluginError::Registration { resource_name } if resource_name == "qnib.org/gpu"
    ));
    assert_eq!(plugin.lifecycle(), LifecycleState::Failed);
    assert!(!plugin.settings().socket_path.exists(), "no dangling socket");
    kubelet_stop.cancel();
}

#[test(tokio::test)]
async fn missing_kubelet_fails_with_dial_error() {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let mut plugin = plugin(&dir);

    let err = plugin.serve().await.expect_err("no kubelet socket");

    assert!(matches!(err.current_context(), PluginError::Dial { .. }));
    assert_eq!(plugin.lifecycle(), LifecycleState::Failed);
    assert!(!plugin.settings().socket_path.exists(), "no dangling socket");
}
