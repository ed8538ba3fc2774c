//! In-memory fakes of the cluster and hypervisor APIs for unit tests

use crate::cluster::ClusterApi;
use crate::error::{Result, ScalerError};
use crate::hypervisor::HypervisorApi;
use crate::models::{
    ExecStatus, NodeInfo, NodeMetrics, PodCondition, PodInfo, RawResources, VmConfigUpdate,
    VmPowerState, VmSummary,
};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

pub const GROUP_LABEL: &str = "pxe-autoscaler/autoscaler-managed-node";

pub const JOIN_OUTPUT: &str =
    "This node has joined the cluster:\n* Certificate signing request was sent to apiserver\n";

#[derive(Default)]
struct ClusterState {
    nodes: Vec<NodeInfo>,
    usage: HashMap<String, RawResources>,
    failing_node_metrics: HashSet<String>,
    metrics_down: bool,
    pods: Vec<PodInfo>,
    pod_usage: HashMap<String, Vec<RawResources>>,
    expected_joins: HashSet<String>,
    failing: HashSet<&'static str>,
    calls: Vec<String>,
}

/// Cluster whose nodes, pods and metrics are set up by the test
#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<ClusterState>,
}

fn node(name: &str, labeled: bool, cpu: &str, memory: &str, ip: String) -> NodeInfo {
    let mut labels = std::collections::BTreeMap::new();
    if labeled {
        labels.insert(GROUP_LABEL.to_string(), "true".to_string());
    }
    NodeInfo {
        name: name.to_string(),
        labels,
        ready: true,
        internal_ips: vec![ip],
        allocatable: RawResources::new(cpu, memory),
        capacity: RawResources::new(cpu, memory),
    }
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ClusterState> {
        self.state.lock().unwrap()
    }

    fn check(&self, op: &'static str) -> Result<()> {
        if self.lock().failing.contains(op) {
            return Err(ScalerError::Cluster(format!("injected {op} failure")));
        }
        Ok(())
    }

    /// Ready group node with zero usage
    pub fn add_node(&self, name: &str, cpu: &str, memory: &str) {
        let mut state = self.lock();
        let ip = format!("10.0.0.{}", state.nodes.len() + 1);
        state.nodes.push(node(name, true, cpu, memory, ip));
        state
            .usage
            .insert(name.to_string(), RawResources::new("0", "0Mi"));
    }

    pub fn add_unlabeled_node(&self, name: &str) {
        let mut state = self.lock();
        let ip = format!("10.0.0.{}", state.nodes.len() + 1);
        state.nodes.push(node(name, false, "4", "8Gi", ip));
        state
            .usage
            .insert(name.to_string(), RawResources::new("0", "0Mi"));
    }

    pub fn set_ready(&self, name: &str, ready: bool) {
        if let Some(node) = self.lock().nodes.iter_mut().find(|n| n.name == name) {
            node.ready = ready;
        }
    }

    pub fn set_internal_ip(&self, name: &str, ip: &str) {
        if let Some(node) = self.lock().nodes.iter_mut().find(|n| n.name == name) {
            node.internal_ips = vec![ip.to_string()];
        }
    }

    pub fn set_usage(&self, name: &str, cpu: &str, memory: &str) {
        self.lock()
            .usage
            .insert(name.to_string(), RawResources::new(cpu, memory));
    }

    pub fn clear_usage(&self, name: &str) {
        self.lock().usage.remove(name);
    }

    pub fn fail_node_metrics(&self, name: &str) {
        self.lock().failing_node_metrics.insert(name.to_string());
    }

    pub fn fail_all_metrics(&self) {
        self.lock().metrics_down = true;
    }

    pub fn add_pod(&self, node: &str, name: &str, owner_kind: &str) {
        self.lock().pods.push(PodInfo {
            name: name.to_string(),
            namespace: "default".to_string(),
            node_name: Some(node.to_string()),
            owner_kind: Some(owner_kind.to_string()),
            conditions: Vec::new(),
        });
    }

    pub fn set_pod_usage(&self, pod: &str, containers: Vec<RawResources>) {
        self.lock().pod_usage.insert(pod.to_string(), containers);
    }

    pub fn add_pending_pod(&self, name: &str, message: &str) {
        self.lock().pods.push(PodInfo {
            name: name.to_string(),
            namespace: "default".to_string(),
            node_name: None,
            owner_kind: Some("ReplicaSet".to_string()),
            conditions: vec![PodCondition {
                reason: Some("Unschedulable".to_string()),
                message: Some(message.to_string()),
            }],
        });
    }

    /// Register `name` as a ready, unlabeled node the first time it is looked up
    pub fn expect_join(&self, name: &str) {
        self.lock().expected_joins.insert(name.to_string());
    }

    pub fn fail_operation(&self, op: &'static str) {
        self.lock().failing.insert(op);
    }

    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn node(&self, name: &str) -> Option<NodeInfo> {
        self.lock().nodes.iter().find(|n| n.name == name).cloned()
    }

    pub fn pods_on(&self, node: &str) -> Vec<String> {
        self.lock()
            .pods
            .iter()
            .filter(|p| p.node_name.as_deref() == Some(node))
            .map(|p| p.name.clone())
            .collect()
    }
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn list_nodes(&self) -> Result<Vec<NodeInfo>> {
        self.check("list_nodes")?;
        Ok(self.lock().nodes.clone())
    }

    async fn get_node(&self, name: &str) -> Result<Option<NodeInfo>> {
        self.check("get_node")?;
        let mut state = self.lock();
        if state.expected_joins.remove(name) {
            let ip = format!("10.0.0.{}", state.nodes.len() + 1);
            state.nodes.push(node(name, false, "4", "8Gi", ip));
            state
                .usage
                .insert(name.to_string(), RawResources::new("0", "0Mi"));
        }
        Ok(state.nodes.iter().find(|n| n.name == name).cloned())
    }

    async fn list_pods(&self) -> Result<Vec<PodInfo>> {
        self.check("list_pods")?;
        Ok(self.lock().pods.clone())
    }

    async fn list_pods_on_node(&self, node: &str) -> Result<Vec<PodInfo>> {
        self.check("list_pods")?;
        Ok(self
            .lock()
            .pods
            .iter()
            .filter(|p| p.node_name.as_deref() == Some(node))
            .cloned()
            .collect())
    }

    async fn node_metrics(&self, node: &str) -> Result<NodeMetrics> {
        let state = self.lock();
        let unavailable = || ScalerError::MetricsUnavailable {
            target: node.to_string(),
            reason: "metrics server unreachable".to_string(),
        };
        if state.metrics_down || state.failing_node_metrics.contains(node) {
            return Err(unavailable());
        }
        let usage = state.usage.get(node).cloned().ok_or_else(unavailable)?;
        Ok(NodeMetrics {
            name: node.to_string(),
            usage,
        })
    }

    async fn list_node_metrics(&self) -> Result<Vec<NodeMetrics>> {
        let state = self.lock();
        if state.metrics_down {
            return Err(ScalerError::MetricsUnavailable {
                target: "nodes".to_string(),
                reason: "metrics server unreachable".to_string(),
            });
        }
        Ok(state
            .nodes
            .iter()
            .filter(|n| !state.failing_node_metrics.contains(&n.name))
            .filter_map(|n| {
                state.usage.get(&n.name).map(|usage| NodeMetrics {
                    name: n.name.clone(),
                    usage: usage.clone(),
                })
            })
            .collect())
    }

    async fn pod_metrics(&self, _namespace: &str, pod: &str) -> Result<Vec<RawResources>> {
        let state = self.lock();
        if state.metrics_down {
            return Err(ScalerError::MetricsUnavailable {
                target: pod.to_string(),
                reason: "metrics server unreachable".to_string(),
            });
        }
        Ok(state.pod_usage.get(pod).cloned().unwrap_or_default())
    }

    async fn label_node(&self, node: &str, key: &str, value: &str) -> Result<()> {
        self.check("label")?;
        let mut state = self.lock();
        state.calls.push(format!("label:{node}"));
        if let Some(info) = state.nodes.iter_mut().find(|n| n.name == node) {
            info.labels.insert(key.to_string(), value.to_string());
        }
        Ok(())
    }

    async fn cordon_node(&self, node: &str) -> Result<()> {
        self.check("cordon")?;
        self.lock().calls.push(format!("cordon:{node}"));
        Ok(())
    }

    async fn evict_pod(&self, namespace: &str, pod: &str) -> Result<()> {
        self.check("evict")?;
        let mut state = self.lock();
        state.calls.push(format!("evict:{namespace}/{pod}"));
        state.pods.retain(|p| p.name != pod);
        Ok(())
    }

    async fn delete_node(&self, node: &str) -> Result<()> {
        self.check("delete_node")?;
        let mut state = self.lock();
        state.calls.push(format!("delete_node:{node}"));
        state.nodes.retain(|n| n.name != node);
        state.usage.remove(node);
        Ok(())
    }
}

struct VmRecord {
    host: String,
    summary: VmSummary,
    power: VmPowerState,
    addresses: Vec<String>,
    config: Option<VmConfigUpdate>,
}

struct ExecRecord {
    command: String,
    polls: u32,
}

struct HypervisorState {
    hosts: Vec<String>,
    vms: Vec<VmRecord>,
    execs: HashMap<u64, ExecRecord>,
    next_pid: u64,
    agent_failures_left: u32,
    join_polls_before_exit: u32,
    os_status: String,
    join_result: ExecStatus,
    keep_running_after_shutdown: bool,
    failing: HashSet<&'static str>,
    calls: Vec<String>,
}

/// Hypervisor whose hosts and VMs live in memory
///
/// Started VMs run immediately and their guest agent answers every command.
pub struct FakeHypervisor {
    state: Mutex<HypervisorState>,
}

impl FakeHypervisor {
    pub fn new(hosts: &[&str]) -> Self {
        Self {
            state: Mutex::new(HypervisorState {
                hosts: hosts.iter().map(|h| h.to_string()).collect(),
                vms: Vec::new(),
                execs: HashMap::new(),
                next_pid: 1,
                agent_failures_left: 0,
                join_polls_before_exit: 0,
                os_status: "running\n".to_string(),
                join_result: ExecStatus {
                    exited: true,
                    exit_code: Some(0),
                    out_data: JOIN_OUTPUT.to_string(),
                    err_data: String::new(),
                },
                keep_running_after_shutdown: false,
                failing: HashSet::new(),
                calls: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HypervisorState> {
        self.state.lock().unwrap()
    }

    fn check(&self, op: &'static str) -> Result<()> {
        if self.lock().failing.contains(op) {
            return Err(ScalerError::Hypervisor(format!("injected {op} failure")));
        }
        Ok(())
    }

    /// Running VM without sizing information
    pub fn add_vm(&self, host: &str, vmid: u32, name: &str) {
        self.add_sized_vm(host, vmid, name, None, None);
    }

    pub fn add_sized_vm(
        &self,
        host: &str,
        vmid: u32,
        name: &str,
        cpus: Option<u32>,
        maxmem: Option<u64>,
    ) {
        self.lock().vms.push(VmRecord {
            host: host.to_string(),
            summary: VmSummary {
                vmid,
                name: name.to_string(),
                status: "running".to_string(),
                cpus,
                maxmem,
            },
            power: VmPowerState::Running,
            addresses: Vec::new(),
            config: None,
        });
    }

    pub fn set_addresses(&self, vmid: u32, addresses: &[&str]) {
        if let Some(vm) = self.lock().vms.iter_mut().find(|v| v.summary.vmid == vmid) {
            vm.addresses = addresses.iter().map(|a| a.to_string()).collect();
        }
    }

    /// Reject the next `count` guest-agent exec requests
    pub fn agent_unavailable_for(&self, count: u32) {
        self.lock().agent_failures_left = count;
    }

    pub fn set_os_status(&self, status: &str) {
        self.lock().os_status = format!("{status}\n");
    }

    pub fn set_join_result(&self, exit_code: i64, stdout: &str, stderr: &str) {
        self.lock().join_result = ExecStatus {
            exited: true,
            exit_code: Some(exit_code),
            out_data: stdout.to_string(),
            err_data: stderr.to_string(),
        };
    }

    /// Report the join process as still running for `polls` status reads
    pub fn join_runs_for(&self, polls: u32) {
        self.lock().join_polls_before_exit = polls;
    }

    pub fn ignore_shutdown(&self) {
        self.lock().keep_running_after_shutdown = true;
    }

    pub fn fail_operation(&self, op: &'static str) {
        self.lock().failing.insert(op);
    }

    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn vm_names(&self) -> Vec<String> {
        self.lock().vms.iter().map(|v| v.summary.name.clone()).collect()
    }

    pub fn vm_config(&self, vmid: u32) -> Option<VmConfigUpdate> {
        self.lock()
            .vms
            .iter()
            .find(|v| v.summary.vmid == vmid)
            .and_then(|v| v.config.clone())
    }

    pub fn power_state(&self, vmid: u32) -> Option<VmPowerState> {
        self.lock()
            .vms
            .iter()
            .find(|v| v.summary.vmid == vmid)
            .map(|v| v.power.clone())
    }
}

fn missing(vmid: u32) -> ScalerError {
    ScalerError::Hypervisor(format!("vm {vmid} does not exist"))
}

#[async_trait]
impl HypervisorApi for FakeHypervisor {
    async fn list_hosts(&self) -> Result<Vec<String>> {
        self.check("list_hosts")?;
        Ok(self.lock().hosts.clone())
    }

    async fn list_vms(&self, host: &str) -> Result<Vec<VmSummary>> {
        Ok(self
            .lock()
            .vms
            .iter()
            .filter(|v| v.host == host)
            .map(|v| v.summary.clone())
            .collect())
    }

    async fn clone_vm(&self, host: &str, template: u32, new_id: u32, name: &str) -> Result<()> {
        self.check("clone")?;
        let mut state = self.lock();
        state.calls.push(format!("clone:{template}->{new_id}:{name}"));
        state.vms.push(VmRecord {
            host: host.to_string(),
            summary: VmSummary {
                vmid: new_id,
                name: name.to_string(),
                status: "stopped".to_string(),
                cpus: None,
                maxmem: None,
            },
            power: VmPowerState::Stopped,
            addresses: Vec::new(),
            config: None,
        });
        Ok(())
    }

    async fn configure_vm(&self, _host: &str, vmid: u32, update: &VmConfigUpdate) -> Result<()> {
        self.check("configure")?;
        let mut state = self.lock();
        state.calls.push(format!("configure:{vmid}"));
        let vm = state
            .vms
            .iter_mut()
            .find(|v| v.summary.vmid == vmid)
            .ok_or_else(|| missing(vmid))?;
        vm.summary.cpus = Some(update.cores);
        vm.summary.maxmem = Some(update.memory_mb * 1024 * 1024);
        vm.config = Some(update.clone());
        Ok(())
    }

    async fn start_vm(&self, _host: &str, vmid: u32) -> Result<()> {
        self.check("start")?;
        let mut state = self.lock();
        state.calls.push(format!("start:{vmid}"));
        let vm = state
            .vms
            .iter_mut()
            .find(|v| v.summary.vmid == vmid)
            .ok_or_else(|| missing(vmid))?;
        vm.power = VmPowerState::Running;
        vm.summary.status = "running".to_string();
        Ok(())
    }

    async fn shutdown_vm(&self, _host: &str, vmid: u32) -> Result<()> {
        self.check("shutdown")?;
        let mut state = self.lock();
        state.calls.push(format!("shutdown:{vmid}"));
        let keep_running = state.keep_running_after_shutdown;
        let vm = state
            .vms
            .iter_mut()
            .find(|v| v.summary.vmid == vmid)
            .ok_or_else(|| missing(vmid))?;
        if !keep_running {
            vm.power = VmPowerState::Stopped;
            vm.summary.status = "stopped".to_string();
        }
        Ok(())
    }

    async fn vm_power_state(&self, _host: &str, vmid: u32) -> Result<VmPowerState> {
        self.lock()
            .vms
            .iter()
            .find(|v| v.summary.vmid == vmid)
            .map(|v| v.power.clone())
            .ok_or_else(|| missing(vmid))
    }

    async fn delete_vm(&self, _host: &str, vmid: u32) -> Result<()> {
        self.check("delete_vm")?;
        let mut state = self.lock();
        state.calls.push(format!("delete_vm:{vmid}"));
        state.vms.retain(|v| v.summary.vmid != vmid);
        Ok(())
    }

    async fn agent_exec(&self, _host: &str, vmid: u32, command: &str) -> Result<u64> {
        let mut state = self.lock();
        if state.agent_failures_left > 0 {
            state.agent_failures_left -= 1;
            return Err(ScalerError::Hypervisor("QEMU guest agent is not running".into()));
        }
        let pid = state.next_pid;
        state.next_pid += 1;
        state.calls.push(format!("exec:{vmid}:{command}"));
        state.execs.insert(
            pid,
            ExecRecord {
                command: command.to_string(),
                polls: 0,
            },
        );
        Ok(pid)
    }

    async fn agent_exec_status(&self, _host: &str, _vmid: u32, pid: u64) -> Result<ExecStatus> {
        let mut state = self.lock();
        let os_status = state.os_status.clone();
        let join_result = state.join_result.clone();
        let polls_before_exit = state.join_polls_before_exit;
        let exec = state
            .execs
            .get_mut(&pid)
            .ok_or_else(|| ScalerError::Hypervisor(format!("no process with pid {pid}")))?;

        if exec.command == "systemctl is-system-running" {
            return Ok(ExecStatus {
                exited: true,
                exit_code: Some(0),
                out_data: os_status,
                err_data: String::new(),
            });
        }

        exec.polls += 1;
        if exec.polls <= polls_before_exit {
            return Ok(ExecStatus::default());
        }
        Ok(join_result)
    }

    async fn agent_ipv4_addresses(&self, _host: &str, vmid: u32) -> Result<Vec<String>> {
        let state = self.lock();
        let vm = state
            .vms
            .iter()
            .find(|v| v.summary.vmid == vmid)
            .ok_or_else(|| missing(vmid))?;
        if vm.addresses.is_empty() {
            return Err(ScalerError::Hypervisor("guest agent not running".into()));
        }
        Ok(vm.addresses.clone())
    }
}
