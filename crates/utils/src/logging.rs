//! provides logging helpers

use std::path::Path;

use tracing::Subscriber;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::RollingFileAppender;
use tracing_appender::rolling::Rotation;
use tracing_subscriber::fmt::layer;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

/// Environment variable selecting a log file instead of stderr.
pub const LOG_PATH_ENV_VAR: &str = "DEVICE_PLUGIN_LOG_PATH";

const DEFAULT_LOG_PREFIX: &str = "device-plugin.log";

/// Boxed fmt layer, either writing to stderr or to a rolling file.
pub type BoxedLayer<S> = Box<dyn Layer<S> + Send + Sync + 'static>;

/// Build the fmt layer shared by all binaries.
///
/// When `log_path` is set, events go to a daily rotated file in its parent
/// directory and the returned guard must be kept alive to flush them.
pub fn get_fmt_layer<S>(log_path: Option<String>) -> (BoxedLayer<S>, Option<WorkerGuard>)
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    let Some(log_path) = log_path else {
        let fmt_layer = layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .boxed();
        return (fmt_layer, None);
    };

    let log_path = Path::new(&log_path);
    let dir = log_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let prefix = log_path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(DEFAULT_LOG_PREFIX);

    match RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(prefix)
        .max_log_files(3)
        .build(dir)
    {
        Ok(appender) => {
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let fmt_layer = layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true)
                .boxed();
            (fmt_layer, Some(guard))
        }
        Err(e) => {
            eprintln!(
                "failed to create log file in {}: {e}, logging to stderr",
                dir.display()
            );
            let fmt_layer = layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .boxed();
            (fmt_layer, None)
        }
    }
}
