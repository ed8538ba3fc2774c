//! Virtualization backend access
//!
//! `HypervisorApi` mirrors the handful of Proxmox VE endpoints the
//! autoscaler drives. `VmInventory` answers questions about the autoscaled
//! VM family on top of it.

mod inventory;
mod proxmox;
mod vm;

pub use inventory::{HostedVm, VmInventory};
pub use proxmox::{ProxmoxClient, ProxmoxCredentials};
pub use vm::{NetworkMode, NetworkModeKind, VirtualMachine, VmState};

use crate::error::Result;
use crate::models::{ExecStatus, VmConfigUpdate, VmPowerState, VmSummary};
use async_trait::async_trait;

/// Operations the autoscaler needs from the virtualization API
#[async_trait]
pub trait HypervisorApi: Send + Sync {
    /// Names of the hypervisor hosts in the cluster
    async fn list_hosts(&self) -> Result<Vec<String>>;

    /// VMs registered on `host`
    async fn list_vms(&self, host: &str) -> Result<Vec<VmSummary>>;

    /// Full clone of `template` into a new VM
    async fn clone_vm(&self, host: &str, template: u32, new_id: u32, name: &str) -> Result<()>;

    /// Apply cloud-init network settings and sizing
    async fn configure_vm(&self, host: &str, vmid: u32, update: &VmConfigUpdate) -> Result<()>;

    async fn start_vm(&self, host: &str, vmid: u32) -> Result<()>;

    /// Shut the VM down, forcing power-off if the guest does not comply
    async fn shutdown_vm(&self, host: &str, vmid: u32) -> Result<()>;

    async fn vm_power_state(&self, host: &str, vmid: u32) -> Result<VmPowerState>;

    async fn delete_vm(&self, host: &str, vmid: u32) -> Result<()>;

    /// Start `command` through the guest agent and return its pid
    async fn agent_exec(&self, host: &str, vmid: u32, command: &str) -> Result<u64>;

    async fn agent_exec_status(&self, host: &str, vmid: u32, pid: u64) -> Result<ExecStatus>;

    /// IPv4 addresses reported by the guest agent
    async fn agent_ipv4_addresses(&self, host: &str, vmid: u32) -> Result<Vec<String>>;
}
