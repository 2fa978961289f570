use std::path::Path;
use std::time::Duration;

use error_stack::Report;
use hyper_util::rt::TokioIo;
use tokio::net::UnixStream;
use tonic::transport::Channel;
use tonic::transport::Endpoint;
use tonic::transport::Uri;
use tower::service_fn;

use super::PluginError;

/// Open a gRPC channel over the unix socket at `socket_path`.
///
/// The whole connection attempt is bounded by `timeout`.
pub async fn connect_uds(
    socket_path: &Path,
    timeout: Duration,
) -> Result<Channel, Report<PluginError>> {
    let endpoint_name = socket_path.display().to_string();
    let socket_path = socket_path.to_path_buf();

    // The HTTP URL is a placeholder since the connector ignores it
    let endpoint = Endpoint::from_static("http://[::]:50051").connect_timeout(timeout);
    let connect = endpoint.connect_with_connector(service_fn(move |_: Uri| {
            let socket_path = socket_path.clone();
            async move {
                UnixStream::connect(socket_path)
                    .await
                    .map(TokioIo::new)
            }
        }));

    match tokio::time::timeout(timeout, connect).await {
        Ok(Ok(channel)) => Ok(channel),
        Ok(Err(e)) => Err(Report::new(e).change_context(PluginError::Dial {
            endpoint: endpoint_name,
        })),
        Err(elapsed) => Err(Report::new(elapsed)
            .change_context(PluginError::Dial {
                endpoint: endpoint_name,
            })
            .attach_printable(format!("no connection within {timeout:?}"))),
    }
}
