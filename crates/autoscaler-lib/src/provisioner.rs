//! Creating a VM and joining it to the cluster
//!
//! `VmProvisioner::provision` walks a new VM through
//! clone, configure, start, boot polling, OS readiness, join and
//! registration. Failures before the join tear the VM down again; a
//! failed join leaves it running for inspection.

use crate::cluster::ClusterStateReader;
use crate::error::{Result, ScalerError};
use crate::group::NodeGroup;
use crate::hypervisor::{
    HypervisorApi, NetworkMode, NetworkModeKind, VirtualMachine, VmInventory, VmState,
};
use crate::join::JoinCommandSource;
use crate::models::{VmConfigUpdate, VmPowerState};
use crate::retry::poll_until;
use crate::settings::{NetworkSettings, PollingSettings};
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Substring of the join output that confirms success
pub const JOIN_CONFIRMATION: &str = "This node has joined the cluster";

/// Command whose output is `running` once the guest OS has booted
const OS_READY_COMMAND: &str = "systemctl is-system-running";

/// Address the new VM will use
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressLease {
    Dhcp,
    /// Static address in CIDR notation
    Static(String),
}

pub struct VmProvisioner {
    inventory: VmInventory,
    reader: ClusterStateReader,
    join: Arc<dyn JoinCommandSource>,
    network: NetworkSettings,
    polling: PollingSettings,
}

impl VmProvisioner {
    pub fn new(
        inventory: VmInventory,
        reader: ClusterStateReader,
        join: Arc<dyn JoinCommandSource>,
        network: NetworkSettings,
        polling: PollingSettings,
    ) -> Self {
        Self {
            inventory,
            reader,
            join,
            network,
            polling,
        }
    }

    fn api(&self) -> &Arc<dyn HypervisorApi> {
        self.inventory.api()
    }

    /// Pick the address for the next VM
    ///
    /// In dhcp mode nothing is allocated. Otherwise the lowest pool address
    /// not reported by an autoscaled VM's guest agent and not used by a
    /// group node is taken; `None` means the pool is exhausted.
    pub async fn allocate_address(&self, group: &NodeGroup) -> Result<Option<AddressLease>> {
        if self.network.mode == "dhcp" {
            return Ok(Some(AddressLease::Dhcp));
        }

        let pool = self.network.pool_addresses()?;
        let busy: HashSet<Ipv4Addr> = self
            .inventory
            .scaled_vm_addresses()
            .await?
            .iter()
            .chain(group.internal_ips.iter())
            .filter_map(|ip| ip.parse().ok())
            .collect();

        match pool.into_iter().find(|ip| !busy.contains(ip)) {
            Some(ip) => {
                info!(ip = %ip, "Found free ip address for new host");
                Ok(Some(AddressLease::Static(format!("{ip}/{}", self.network.ip_mask))))
            }
            None => {
                error!(pool = %self.network.ip_pool, "Free ip address for new host not found");
                Ok(None)
            }
        }
    }

    /// Create a VM, join it to the cluster and wait until it is a ready
    /// group member. Returns the new node's name.
    pub async fn provision(&self, group: &mut NodeGroup, lease: AddressLease) -> Result<String> {
        let scaled = self.inventory.scaled_vms().await?;
        let name = self.inventory.next_vm_name(&scaled);
        let (cores, memory_mb) = match scaled.first() {
            Some(sibling) => match (sibling.vm.cpus, sibling.vm.maxmem) {
                (Some(cpus), Some(maxmem)) => {
                    (cpus, (maxmem as f64 / 1024.0 / 1024.0).round() as u64)
                }
                _ => (group.capacity_cores, group.capacity_memory_mb),
            },
            None => (group.capacity_cores, group.capacity_memory_mb),
        };

        let template = self.inventory.template_vmid().await?;
        let vmid = self.inventory.free_vmid().await?;
        let host = self.inventory.placement_host().await?;
        let mut vm = VirtualMachine::new(name, vmid, host, cores, memory_mb);

        warn!(
            vm = %vm.name,
            vmid = vm.vmid,
            template,
            host = %vm.host,
            cores,
            memory_mb,
            "Creating vm"
        );

        if let Err(e) = self.boot(&mut vm, template, &lease).await {
            let cloned = vm.state() != VmState::Cloning;
            vm.fail();
            if cloned {
                self.teardown(&mut vm).await;
            }
            return Err(match e {
                ScalerError::ProvisionFailure { .. } => e,
                other => ScalerError::provision(&vm.name, other),
            });
        }

        if let Err(e) = self.join_cluster(&mut vm).await {
            vm.fail();
            return Err(e);
        }

        self.register(&vm, group).await?;
        vm.advance(VmState::Active)?;
        Ok(vm.name)
    }

    /// Clone, configure, start and wait for the guest OS
    async fn boot(&self, vm: &mut VirtualMachine, template: u32, lease: &AddressLease) -> Result<()> {
        vm.advance(VmState::Cloning)?;
        self.api()
            .clone_vm(&vm.host, template, vm.vmid, &vm.name)
            .await?;

        vm.advance(VmState::Configuring)?;
        let network = self.network_mode(lease)?;
        let update = VmConfigUpdate {
            ipconfig0: network.ipconfig(),
            nameserver: self.network.dns_server.clone(),
            cores: vm.cores,
            memory_mb: vm.memory_mb,
        };
        self.api().configure_vm(&vm.host, vm.vmid, &update).await?;
        vm.network = Some(network);

        vm.advance(VmState::Starting)?;
        warn!(vm = %vm.name, vmid = vm.vmid, host = %vm.host, "Starting vm");
        self.api().start_vm(&vm.host, vm.vmid).await?;

        vm.advance(VmState::BootPolling)?;
        self.wait_powered_on(vm).await?;
        warn!(vm = %vm.name, "Started vm");
        self.wait_os_ready(vm).await
    }

    fn network_mode(&self, lease: &AddressLease) -> Result<NetworkMode> {
        match (self.network.mode.parse::<NetworkModeKind>()?, lease) {
            (NetworkModeKind::Dhcp, _) => Ok(NetworkMode::Dhcp),
            (NetworkModeKind::Manual, AddressLease::Static(cidr)) => Ok(NetworkMode::Manual {
                cidr: cidr.clone(),
                gateway: self.network.gateway.clone(),
            }),
            (NetworkModeKind::Manual, AddressLease::Dhcp) => Err(ScalerError::Config(
                "manual network mode needs a static address".into(),
            )),
        }
    }

    async fn wait_powered_on(&self, vm: &VirtualMachine) -> Result<()> {
        let api = self.api();
        let (host, vmid) = (vm.host.as_str(), vm.vmid);
        poll_until(&format!("vm {} to start", vm.name), self.polling.vm_power, move || async move {
            let state = api.vm_power_state(host, vmid).await?;
            Ok((state != VmPowerState::Stopped).then_some(()))
        })
        .await
    }

    /// Poll the guest until systemd reports `running`
    ///
    /// An unreachable guest agent counts as not ready yet.
    pub async fn wait_os_ready(&self, vm: &VirtualMachine) -> Result<()> {
        let api = self.api();
        let (name, host, vmid) = (vm.name.as_str(), vm.host.as_str(), vm.vmid);
        poll_until(&format!("os on vm {name}"), self.polling.os_ready, move || async move {
            let pid = match api.agent_exec(host, vmid, OS_READY_COMMAND).await {
                Ok(pid) => pid,
                Err(e) => {
                    debug!(vm = %name, error = %e, "OS not started, waiting");
                    return Ok(None);
                }
            };
            let status = match api.agent_exec_status(host, vmid, pid).await {
                Ok(status) => status,
                Err(e) => {
                    warn!(vm = %name, error = %e, "Cannot read OS state");
                    return Ok(None);
                }
            };
            let state = status.out_data.trim_end();
            info!(vm = %name, state = %state, "OS state");
            Ok((state == "running").then_some(()))
        })
        .await
    }

    /// Run the join command in the guest and check its output
    async fn join_cluster(&self, vm: &mut VirtualMachine) -> Result<()> {
        let command = self.join.join_command().await?;
        let api = self.api();
        let (name, host, vmid) = (vm.name.clone(), vm.host.clone(), vm.vmid);

        vm.advance(VmState::Joining)?;
        let command_ref = command.as_str();
        let (name_ref, host_ref) = (name.as_str(), host.as_str());
        let pid = poll_until(
            &format!("guest agent on vm {name} to accept join"),
            self.polling.join_submit,
            move || async move {
                match api.agent_exec(host_ref, vmid, command_ref).await {
                    Ok(pid) => Ok(Some(pid)),
                    Err(e) => {
                        info!(vm = %name_ref, error = %e, "Waiting for guest agent to register joining process");
                        Ok(None)
                    }
                }
            },
        )
        .await?;

        vm.advance(VmState::JoinPolling)?;
        let status = poll_until(
            &format!("join process on vm {name}"),
            self.polling.join_status,
            move || async move {
                let status = api.agent_exec_status(host_ref, vmid, pid).await?;
                if !status.exited {
                    info!(vm = %name_ref, "Waiting for join process");
                }
                Ok(status.exited.then_some(status))
            },
        )
        .await?;

        if status.out_data.contains(JOIN_CONFIRMATION) {
            info!(vm = %name, "Node joined cluster");
            return Ok(());
        }

        error!(
            vm = %name,
            exit_code = ?status.exit_code,
            stdout = %status.out_data,
            stderr = %status.err_data,
            "Node cannot join the cluster"
        );
        Err(ScalerError::JoinFailure {
            vm: name,
            exit_code: status.exit_code,
            stdout: status.out_data,
            stderr: status.err_data,
        })
    }

    /// Wait for the node object, label it and wait until it is Ready
    async fn register(&self, vm: &VirtualMachine, group: &mut NodeGroup) -> Result<()> {
        let reader = &self.reader;
        let name = vm.name.as_str();

        poll_until(
            &format!("node {name} to register"),
            self.polling.node_register,
            move || async move { Ok(reader.node_exists(name).await?.then_some(())) },
        )
        .await?;

        reader.api().label_node(name, reader.label(), "true").await?;
        info!(node = %name, label = %reader.label(), "Labeled new node");

        poll_until(
            &format!("node {name} to become ready"),
            self.polling.node_ready,
            move || async move { Ok(reader.node_ready(name).await.then_some(())) },
        )
        .await?;

        group.refresh(reader).await
    }

    /// Best-effort shutdown and deletion of a partially provisioned VM
    async fn teardown(&self, vm: &mut VirtualMachine) {
        if vm.advance(VmState::ShuttingDown).is_err() {
            return;
        }
        warn!(vm = %vm.name, vmid = vm.vmid, host = %vm.host, "Tearing down partially provisioned vm");

        if let Err(e) = self.api().shutdown_vm(&vm.host, vm.vmid).await {
            warn!(vm = %vm.name, error = %e, "Shutdown during teardown failed");
        }
        let api = self.api();
        let (host, vmid) = (vm.host.as_str(), vm.vmid);
        let stopped = poll_until(&format!("vm {} to stop", vm.name), self.polling.vm_power, move || async move {
            let state = api.vm_power_state(host, vmid).await?;
            Ok((state != VmPowerState::Running).then_some(()))
        })
        .await;
        if let Err(e) = stopped {
            warn!(vm = %vm.name, error = %e, "VM did not stop during teardown");
        }

        match self.api().delete_vm(&vm.host, vm.vmid).await {
            Ok(()) => {
                let _ = vm.advance(VmState::Deleted);
            }
            Err(e) => warn!(vm = %vm.name, error = %e, "Delete during teardown failed"),
        }
    }
}
