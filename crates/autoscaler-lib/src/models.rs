//! Core data models shared between the cluster, hypervisor and decision layers

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Raw CPU/memory quantities as reported by the orchestration API
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawResources {
    pub cpu: Option<String>,
    pub memory: Option<String>,
}

impl RawResources {
    pub fn new(cpu: impl Into<String>, memory: impl Into<String>) -> Self {
        Self {
            cpu: Some(cpu.into()),
            memory: Some(memory.into()),
        }
    }
}

/// Cluster node as seen by the autoscaler
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeInfo {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub ready: bool,
    pub internal_ips: Vec<String>,
    pub allocatable: RawResources,
    pub capacity: RawResources,
}

impl NodeInfo {
    /// True if the node carries `label` with value "true"
    pub fn has_group_label(&self, label: &str) -> bool {
        self.labels.get(label).map(|v| v == "true").unwrap_or(false)
    }
}

/// Condition attached to a pod's status
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PodCondition {
    pub reason: Option<String>,
    pub message: Option<String>,
}

/// Pod as seen by the autoscaler
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PodInfo {
    pub name: String,
    pub namespace: String,
    pub node_name: Option<String>,
    /// Kind of the first owner reference, if any
    pub owner_kind: Option<String>,
    pub conditions: Vec<PodCondition>,
}

impl PodInfo {
    pub fn is_daemonset_owned(&self) -> bool {
        self.owner_kind
            .as_deref()
            .map(|kind| kind.contains("DaemonSet"))
            .unwrap_or(false)
    }

    /// Returns the scheduler message if the pod is blocked on CPU or memory
    pub fn insufficient_resources_message(&self) -> Option<&str> {
        self.conditions.iter().find_map(|c| {
            let message = c.message.as_deref()?;
            let unschedulable = c.reason.as_deref() == Some("Unschedulable");
            let insufficient = message.contains("Insufficient cpu")
                || message.contains("Insufficient memory");
            (unschedulable && insufficient).then_some(message)
        })
    }
}

/// Raw usage reported by the metrics API for one node
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeMetrics {
    pub name: String,
    pub usage: RawResources,
}

/// Per-node utilization snapshot in millicores / MB
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UtilizationSample {
    pub node: String,
    pub cpu_used: i64,
    pub memory_used: i64,
    pub cpu_allocatable: i64,
    pub memory_allocatable: i64,
    pub cpu_available: i64,
    pub memory_available: i64,
    pub cpu_percent: f64,
    pub memory_percent: f64,
}

impl UtilizationSample {
    pub fn from_usage(
        node: impl Into<String>,
        cpu_used: i64,
        memory_used: i64,
        cpu_allocatable: i64,
        memory_allocatable: i64,
    ) -> Self {
        Self {
            node: node.into(),
            cpu_used,
            memory_used,
            cpu_allocatable,
            memory_allocatable,
            cpu_available: cpu_allocatable - cpu_used,
            memory_available: memory_allocatable - memory_used,
            cpu_percent: percent(cpu_used, cpu_allocatable),
            memory_percent: percent(memory_used, memory_allocatable),
        }
    }

    /// Worst-case sample used when a node's metrics cannot be read
    pub fn unavailable(node: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            cpu_used: 0,
            memory_used: 0,
            cpu_allocatable: 0,
            memory_allocatable: 0,
            cpu_available: 0,
            memory_available: 0,
            cpu_percent: 99.0,
            memory_percent: 99.0,
        }
    }
}

fn percent(used: i64, allocatable: i64) -> f64 {
    if allocatable <= 0 {
        return 100.0;
    }
    used as f64 / allocatable as f64 * 100.0
}

/// Summed usage of one pod's containers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodUtilization {
    pub pod: String,
    pub cpu: i64,
    pub memory: i64,
}

/// VM entry from a hypervisor host listing
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VmSummary {
    pub vmid: u32,
    /// Empty for VMs created without a name
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub cpus: Option<u32>,
    /// Maximum memory in bytes
    #[serde(default)]
    pub maxmem: Option<u64>,
}

/// Power state reported by the hypervisor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmPowerState {
    Running,
    Stopped,
    #[serde(other)]
    Unknown,
}

/// Result of polling a guest-agent process
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecStatus {
    pub exited: bool,
    pub exit_code: Option<i64>,
    pub out_data: String,
    pub err_data: String,
}

/// Guest network settings written through cloud-init
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmConfigUpdate {
    pub ipconfig0: String,
    pub nameserver: String,
    pub cores: u32,
    pub memory_mb: u64,
}
