//! Queries over the autoscaled VM family

use super::HypervisorApi;
use crate::error::{Result, ScalerError};
use crate::models::VmSummary;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

/// First VM id handed out by the hypervisor
const FIRST_VMID: u32 = 100;

/// A VM together with the host it lives on
#[derive(Debug, Clone, PartialEq)]
pub struct HostedVm {
    pub host: String,
    pub vm: VmSummary,
}

/// View of the hypervisor restricted to the autoscaler's VM family
#[derive(Clone)]
pub struct VmInventory {
    api: Arc<dyn HypervisorApi>,
    base_name: String,
    template_name: String,
}

impl VmInventory {
    pub fn new(
        api: Arc<dyn HypervisorApi>,
        base_name: impl Into<String>,
        template_name: impl Into<String>,
    ) -> Self {
        Self {
            api,
            base_name: base_name.into(),
            template_name: template_name.into(),
        }
    }

    pub fn api(&self) -> &Arc<dyn HypervisorApi> {
        &self.api
    }

    async fn all_vms(&self) -> Result<Vec<HostedVm>> {
        let mut result = Vec::new();
        for host in self.api.list_hosts().await? {
            for vm in self.api.list_vms(&host).await? {
                result.push(HostedVm {
                    host: host.clone(),
                    vm,
                });
            }
        }
        Ok(result)
    }

    fn is_family_member(&self, name: &str) -> bool {
        name.starts_with(&format!("{}-", self.base_name))
    }

    /// Every VM created by the autoscaler, across all hosts
    pub async fn scaled_vms(&self) -> Result<Vec<HostedVm>> {
        Ok(self
            .all_vms()
            .await?
            .into_iter()
            .filter(|hosted| self.is_family_member(&hosted.vm.name))
            .collect())
    }

    /// Id of the template VM
    pub async fn template_vmid(&self) -> Result<u32> {
        self.all_vms()
            .await?
            .into_iter()
            .find(|hosted| hosted.vm.name == self.template_name)
            .map(|hosted| hosted.vm.vmid)
            .ok_or_else(|| ScalerError::provision(&self.template_name, "template vm not found"))
    }

    /// Lowest VM id not used on any host
    pub async fn free_vmid(&self) -> Result<u32> {
        let busy: HashSet<u32> = self.all_vms().await?.iter().map(|h| h.vm.vmid).collect();
        let mut vmid = FIRST_VMID;
        while busy.contains(&vmid) {
            vmid += 1;
        }
        Ok(vmid)
    }

    /// Host for a new VM; the first one listed
    pub async fn placement_host(&self) -> Result<String> {
        self.api
            .list_hosts()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| ScalerError::Hypervisor("hypervisor reports no hosts".into()))
    }

    /// `<base>-<n>` with the lowest `n >= 1` not used by an existing VM
    pub fn next_vm_name(&self, existing: &[HostedVm]) -> String {
        let names: HashSet<&str> = existing.iter().map(|h| h.vm.name.as_str()).collect();
        let mut count = 1;
        loop {
            let candidate = format!("{}-{}", self.base_name, count);
            if !names.contains(candidate.as_str()) {
                return candidate;
            }
            count += 1;
        }
    }

    /// The autoscaled VM named `name`, if any
    pub async fn find_vm(&self, name: &str) -> Result<Option<HostedVm>> {
        Ok(self
            .scaled_vms()
            .await?
            .into_iter()
            .find(|hosted| hosted.vm.name == name))
    }

    /// IPv4 addresses reported by the guest agents of the family
    ///
    /// VMs whose agent does not answer are skipped.
    pub async fn scaled_vm_addresses(&self) -> Result<Vec<String>> {
        let mut addresses = Vec::new();
        for hosted in self.scaled_vms().await? {
            match self
                .api
                .agent_ipv4_addresses(&hosted.host, hosted.vm.vmid)
                .await
            {
                Ok(ips) => addresses.extend(ips),
                Err(e) => {
                    debug!(vm = %hosted.vm.name, error = %e, "Guest agent did not report addresses")
                }
            }
        }
        Ok(addresses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeHypervisor;

    fn inventory(hv: FakeHypervisor) -> VmInventory {
        VmInventory::new(Arc::new(hv), "autoscaler.node", "autoscaler.tmpl")
    }

    #[tokio::test]
    async fn test_name_and_id_allocation() {
        let hv = FakeHypervisor::new(&["pve1", "pve2"]);
        hv.add_vm("pve1", 100, "autoscaler.tmpl");
        hv.add_vm("pve1", 101, "autoscaler.node-1");
        hv.add_vm("pve2", 103, "autoscaler.node-3");
        hv.add_vm("pve2", 102, "database");
        let inventory = inventory(hv);

        let scaled = inventory.scaled_vms().await.unwrap();
        assert_eq!(scaled.len(), 2);
        assert_eq!(inventory.next_vm_name(&scaled), "autoscaler.node-2");
        assert_eq!(inventory.free_vmid().await.unwrap(), 104);
        assert_eq!(inventory.template_vmid().await.unwrap(), 100);
        assert_eq!(inventory.placement_host().await.unwrap(), "pve1");

        let found = inventory.find_vm("autoscaler.node-3").await.unwrap().unwrap();
        assert_eq!(found.host, "pve2");
        assert!(inventory.find_vm("database").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_first_name_and_missing_template() {
        let inventory = inventory(FakeHypervisor::new(&["pve1"]));
        assert_eq!(inventory.next_vm_name(&[]), "autoscaler.node-1");
        assert_eq!(inventory.free_vmid().await.unwrap(), 100);
        assert!(matches!(
            inventory.template_vmid().await,
            Err(ScalerError::ProvisionFailure { .. })
        ));
    }

    #[tokio::test]
    async fn test_addresses_skip_silent_agents() {
        let hv = FakeHypervisor::new(&["pve1"]);
        hv.add_vm("pve1", 101, "autoscaler.node-1");
        hv.add_vm("pve1", 102, "autoscaler.node-2");
        hv.set_addresses(101, &["10.99.0.13"]);
        let inventory = inventory(hv);

        assert_eq!(
            inventory.scaled_vm_addresses().await.unwrap(),
            vec!["10.99.0.13".to_string()]
        );
    }
}
