//! Device health transitions.
//!
//! Health is push-only: callers report a device as unhealthy through a
//! [`HealthReporter`], and a single coordinator task applies the transition
//! to the catalog and fans the new device list out to every `ListAndWatch`
//! stream. A device never becomes healthy again within a run.

use std::sync::Arc;
use std::sync::PoisonError;

use error_stack::Report;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::device::DeviceSnapshot;
use crate::device::SharedCatalog;

pub const DEFAULT_HEALTH_CHANNEL_CAPACITY: usize = 32;

#[derive(Debug, Error)]
pub enum HealthError {
    #[error("health monitor is gone, transition for device {device_id} dropped")]
    ChannelClosed { device_id: String },
}

/// A device moving from healthy to unhealthy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthTransition {
    pub device_id: String,
}

/// Owns the health transition channel.
///
/// The receiving half is held behind a lock so a restarted server can hand
/// it to a fresh coordinator; at most one coordinator consumes at a time.
#[derive(Debug)]
pub struct HealthMonitor {
    sender: mpsc::Sender<HealthTransition>,
    receiver: Arc<Mutex<mpsc::Receiver<HealthTransition>>>,
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new(DEFAULT_HEALTH_CHANNEL_CAPACITY)
    }
}

impl HealthMonitor {
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        Self {
            sender,
            receiver: Arc::new(Mutex::new(receiver)),
        }
    }

    pub fn reporter(&self) -> HealthReporter {
        HealthReporter {
            sender: self.sender.clone(),
        }
    }

    /// Spawn the task that applies transitions to `catalog` and publishes
    /// each resulting device list on `updates`, until `token` is cancelled.
    pub(crate) fn spawn_coordinator(
        &self,
        catalog: SharedCatalog,
        updates: broadcast::Sender<DeviceSnapshot>,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        let shared_receiver = self.receiver.clone();
        tokio::spawn(async move {
            let mut receiver = tokio::select! {
                _ = token.cancelled() => return,
                guard = shared_receiver.lock() => guard,
            };
            debug!("health coordinator started");

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    transition = receiver.recv() => match transition {
                        Some(transition) => apply_transition(&catalog, &updates, &transition),
                        None => break,
                    },
                }
            }
            debug!("health coordinator stopped");
        })
    }
}

/// Cloneable handle for reporting unhealthy devices.
#[derive(Debug, Clone)]
pub struct HealthReporter {
    sender: mpsc::Sender<HealthTransition>,
}

impl HealthReporter {
    /// Enqueue an unhealthy transition; waits while the channel buffer is full.
    pub async fn report_unhealthy(
        &self,
        device_id: impl Into<String>,
    ) -> Result<(), Report<HealthError>> {
        let device_id = device_id.into();
        self.sender
            .send(HealthTransition {
                device_id: device_id.clone(),
            })
            .await
            .map_err(|_| Report::new(HealthError::ChannelClosed { device_id }))
    }
}

fn apply_transition(
    catalog: &SharedCatalog,
    updates: &broadcast::Sender<DeviceSnapshot>,
    transition: &HealthTransition,
) {
    // publish while holding the write lock so that a new watcher either sees
    // this transition in its initial list or receives it as an update
    let mut catalog = catalog.write().unwrap_or_else(PoisonError::into_inner);
    if catalog.is_control_device(&transition.device_id) {
        info!(
            device_id = %transition.device_id,
            "control device stays healthy, transition ignored"
        );
        return;
    }
    if !catalog.mark_unhealthy(&transition.device_id) {
        warn!(
            device_id = %transition.device_id,
            "health transition for unknown device ignored"
        );
        return;
    }
    warn!(device_id = %transition.device_id, "device marked unhealthy");

    // no receivers just means no watcher is connected
    let _ = updates.send(catalog.snapshot());
}

/// Placeholder for active device probing, which is not implemented.
///
/// Runs until `token` is cancelled.
pub(crate) fn spawn_health_check(
    disabled: bool,
    _reporter: HealthReporter,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if disabled {
            info!("device health checks disabled");
        } else {
            debug!("no active device health probe configured");
        }
        token.cancelled().await;
    })
}
