//! Cluster autoscaler for Kubernetes nodes backed by Proxmox VMs
//!
//! This crate provides:
//! - Resource quantity conversion and utilization sampling
//! - Scale-up and scale-down decisions with node selection
//! - Cooldown gates and the unneeded-node grace timer
//! - VM provisioning and node removal state machines
//! - The control loop composing all of the above

pub mod cluster;
pub mod control;
pub mod cooldown;
pub mod decision;
pub mod error;
pub mod group;
pub mod hypervisor;
pub mod join;
pub mod models;
pub mod observability;
pub mod provisioner;
pub mod quantity;
pub mod removal;
pub mod retry;
pub mod settings;

#[cfg(test)]
pub(crate) mod testing;

pub use control::{Autoscaler, Backends, TickOutcome};
pub use error::{Result, ScalerError};
pub use models::*;
pub use observability::StructuredLogger;
pub use settings::AutoscalerSettings;
