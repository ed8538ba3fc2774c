//! Draining a node out of the cluster and deleting its VM

use crate::cluster::ClusterStateReader;
use crate::error::{Result, ScalerError};
use crate::group::NodeGroup;
use crate::hypervisor::{VirtualMachine, VmInventory, VmState};
use crate::models::VmPowerState;
use crate::retry::poll_until;
use crate::settings::PollSettings;
use tracing::{debug, info, warn};

/// Runs cordon, drain, node deletion, VM teardown and group refresh
///
/// Each step gates the next. On failure the node is left in whatever state
/// the last successful step produced.
pub struct NodeRemovalOrchestrator {
    reader: ClusterStateReader,
    inventory: VmInventory,
    vm_power: PollSettings,
}

impl NodeRemovalOrchestrator {
    pub fn new(reader: ClusterStateReader, inventory: VmInventory, vm_power: PollSettings) -> Self {
        Self {
            reader,
            inventory,
            vm_power,
        }
    }

    pub async fn remove(&self, node: &str, group: &mut NodeGroup) -> Result<()> {
        let api = self.reader.api();

        api.cordon_node(node)
            .await
            .map_err(|e| ScalerError::removal(node, "cordon", e))?;
        info!(node = %node, "Node cordoned");

        self.drain(node)
            .await
            .map_err(|e| ScalerError::removal(node, "drain", e))?;
        info!(node = %node, "Node drained");

        api.delete_node(node)
            .await
            .map_err(|e| ScalerError::removal(node, "delete node", e))?;
        info!(node = %node, "Node deleted from cluster");

        self.destroy_vm(node).await?;

        group
            .refresh(&self.reader)
            .await
            .map_err(|e| ScalerError::removal(node, "refresh group", e))
    }

    /// Evict every pod on `node` except those owned by a DaemonSet
    async fn drain(&self, node: &str) -> Result<()> {
        let api = self.reader.api();
        for pod in api.list_pods_on_node(node).await? {
            if pod.is_daemonset_owned() {
                debug!(node = %node, pod = %pod.name, "Skipping DaemonSet pod");
                continue;
            }
            api.evict_pod(&pod.namespace, &pod.name).await?;
            info!(node = %node, pod = %pod.name, namespace = %pod.namespace, "Evicted pod");
        }
        Ok(())
    }

    async fn destroy_vm(&self, node: &str) -> Result<()> {
        let hosted = self
            .inventory
            .find_vm(node)
            .await
            .map_err(|e| ScalerError::removal(node, "vm lookup", e))?
            .ok_or_else(|| ScalerError::removal(node, "vm lookup", "no autoscaled vm with this name"))?;

        let mut vm = VirtualMachine::existing(node, hosted.vm.vmid, hosted.host);
        let api = self.inventory.api();

        vm.advance(VmState::ShuttingDown)?;
        warn!(vm = %vm.name, vmid = vm.vmid, host = %vm.host, "Stopping vm");
        api.shutdown_vm(&vm.host, vm.vmid)
            .await
            .map_err(|e| ScalerError::removal(node, "vm shutdown", e))?;

        let (host, vmid) = (vm.host.as_str(), vm.vmid);
        poll_until(&format!("vm {node} to stop"), self.vm_power, move || async move {
            let state = api.vm_power_state(host, vmid).await?;
            Ok((state != VmPowerState::Running).then_some(()))
        })
        .await
        .map_err(|e| ScalerError::removal(node, "vm shutdown", e))?;
        warn!(vm = %vm.name, "Stopped vm");

        api.delete_vm(&vm.host, vm.vmid)
            .await
            .map_err(|e| ScalerError::removal(node, "vm delete", e))?;
        vm.advance(VmState::Deleted)?;
        warn!(vm = %vm.name, vmid = vm.vmid, host = %vm.host, "Deleted vm");
        Ok(())
    }
}
