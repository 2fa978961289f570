//! Devices advertised to the kubelet and their health.

pub mod catalog;
pub mod health;

pub use catalog::*;
pub use health::*;

/// Health of a device as reported over `ListAndWatch`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum Health {
    #[display("Healthy")]
    Healthy,
    #[display("Unhealthy")]
    Unhealthy,
}

/// A schedulable device, identified by the numeric suffix of its device node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub id: String,
    pub health: Health,
}

impl Device {
    pub fn healthy(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            health: Health::Healthy,
        }
    }
}
