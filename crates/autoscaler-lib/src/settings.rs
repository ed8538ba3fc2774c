//! Autoscaler settings
//!
//! Plain serde types with defaults for every field; the binary layers a
//! config file and environment variables on top of them.

use crate::error::{Result, ScalerError};
use serde::Deserialize;
use std::net::Ipv4Addr;
use std::time::Duration;

/// Top-level autoscaler settings
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AutoscalerSettings {
    #[serde(default)]
    pub proxmox: ProxmoxSettings,
    #[serde(default)]
    pub network: NetworkSettings,
    #[serde(default)]
    pub group: GroupSettings,
    #[serde(default)]
    pub scaling: ScalingSettings,
    #[serde(default)]
    pub polling: PollingSettings,
    /// Shell command that prints a cluster join command
    #[serde(default = "default_join_command")]
    pub join_command: String,
}

/// Hypervisor connection and VM family settings
#[derive(Debug, Clone, Deserialize)]
pub struct ProxmoxSettings {
    #[serde(default = "default_pve_host")]
    pub host: String,
    #[serde(default = "default_pve_port")]
    pub port: u16,
    #[serde(default = "default_pve_user")]
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub verify_ssl: bool,
    /// Name of the preconfigured template VM
    #[serde(default = "default_template_vm")]
    pub template_vm: String,
    /// Base name of autoscaled VMs; instances are `<name>-1`, `<name>-2`, ...
    #[serde(default = "default_node_name")]
    pub node_name: String,
    #[serde(default = "default_cores")]
    pub default_cores: u32,
    #[serde(default = "default_memory_mb")]
    pub default_memory_mb: u64,
}

impl Default for ProxmoxSettings {
    fn default() -> Self {
        Self {
            host: default_pve_host(),
            port: default_pve_port(),
            user: default_pve_user(),
            password: String::new(),
            verify_ssl: false,
            template_vm: default_template_vm(),
            node_name: default_node_name(),
            default_cores: default_cores(),
            default_memory_mb: default_memory_mb(),
        }
    }
}

/// Guest network settings for new VMs
#[derive(Debug, Clone, Deserialize)]
pub struct NetworkSettings {
    /// `dhcp` or `manual`; checked when the VM is configured
    #[serde(default = "default_network_mode")]
    pub mode: String,
    /// Inclusive address range, `first-last`
    #[serde(default = "default_ip_pool")]
    pub ip_pool: String,
    #[serde(default = "default_ip_mask")]
    pub ip_mask: String,
    #[serde(default = "default_gateway")]
    pub gateway: String,
    #[serde(default = "default_dns_server")]
    pub dns_server: String,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            mode: default_network_mode(),
            ip_pool: default_ip_pool(),
            ip_mask: default_ip_mask(),
            gateway: default_gateway(),
            dns_server: default_dns_server(),
        }
    }
}

impl NetworkSettings {
    /// Expand the configured pool into individual addresses
    pub fn pool_addresses(&self) -> Result<Vec<Ipv4Addr>> {
        let (first, last) = self
            .ip_pool
            .split_once('-')
            .ok_or_else(|| ScalerError::Config(format!("ip pool {:?} is not first-last", self.ip_pool)))?;

        let parse = |s: &str| {
            s.trim()
                .parse::<Ipv4Addr>()
                .map_err(|e| ScalerError::Config(format!("ip pool address {s:?}: {e}")))
        };
        let (first, last) = (u32::from(parse(first)?), u32::from(parse(last)?));

        if first > last {
            return Err(ScalerError::Config(format!(
                "ip pool {:?} is reversed",
                self.ip_pool
            )));
        }

        Ok((first..=last).map(Ipv4Addr::from).collect())
    }
}

/// Node group membership and size bounds
#[derive(Debug, Clone, Deserialize)]
pub struct GroupSettings {
    #[serde(default = "default_group_label")]
    pub label: String,
    #[serde(default = "default_min_size")]
    pub min_size: usize,
    #[serde(default = "default_max_size")]
    pub max_size: usize,
}

impl Default for GroupSettings {
    fn default() -> Self {
        Self {
            label: default_group_label(),
            min_size: default_min_size(),
            max_size: default_max_size(),
        }
    }
}

/// Loop interval, cooldowns and the utilization threshold, in seconds / percent
#[derive(Debug, Clone, Deserialize)]
pub struct ScalingSettings {
    #[serde(default = "default_scan_interval")]
    pub scan_interval_secs: u64,
    #[serde(default = "default_scale_down_unneeded")]
    pub scale_down_unneeded_secs: u64,
    #[serde(default = "default_scale_down_delay")]
    pub scale_down_delay_secs: u64,
    #[serde(default = "default_scale_up_delay_after_add")]
    pub scale_up_delay_after_add_secs: u64,
    #[serde(default = "default_scale_down_delay_after_add")]
    pub scale_down_delay_after_add_secs: u64,
    #[serde(default = "default_scale_down_delay_after_error")]
    pub scale_down_delay_after_error_secs: u64,
    #[serde(default = "default_utilization_threshold")]
    pub scale_down_utilization_threshold: f64,
}

impl Default for ScalingSettings {
    fn default() -> Self {
        Self {
            scan_interval_secs: default_scan_interval(),
            scale_down_unneeded_secs: default_scale_down_unneeded(),
            scale_down_delay_secs: default_scale_down_delay(),
            scale_up_delay_after_add_secs: default_scale_up_delay_after_add(),
            scale_down_delay_after_add_secs: default_scale_down_delay_after_add(),
            scale_down_delay_after_error_secs: default_scale_down_delay_after_error(),
            scale_down_utilization_threshold: default_utilization_threshold(),
        }
    }
}

impl ScalingSettings {
    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs)
    }

    pub fn scale_down_unneeded(&self) -> Duration {
        Duration::from_secs(self.scale_down_unneeded_secs)
    }
}

/// One bounded polling wait
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct PollSettings {
    pub interval_secs: u64,
    pub max_attempts: u32,
}

impl PollSettings {
    pub const fn new(interval_secs: u64, max_attempts: u32) -> Self {
        Self {
            interval_secs,
            max_attempts,
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Bounds for every wait in the provisioning and removal state machines
#[derive(Debug, Clone, Deserialize)]
pub struct PollingSettings {
    #[serde(default = "default_vm_power_poll")]
    pub vm_power: PollSettings,
    #[serde(default = "default_os_ready_poll")]
    pub os_ready: PollSettings,
    #[serde(default = "default_join_submit_poll")]
    pub join_submit: PollSettings,
    #[serde(default = "default_join_status_poll")]
    pub join_status: PollSettings,
    #[serde(default = "default_node_register_poll")]
    pub node_register: PollSettings,
    #[serde(default = "default_node_ready_poll")]
    pub node_ready: PollSettings,
}

impl Default for PollingSettings {
    fn default() -> Self {
        Self {
            vm_power: default_vm_power_poll(),
            os_ready: default_os_ready_poll(),
            join_submit: default_join_submit_poll(),
            join_status: default_join_status_poll(),
            node_register: default_node_register_poll(),
            node_ready: default_node_ready_poll(),
        }
    }
}

impl AutoscalerSettings {
    /// Reject settings the control loop cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.group.min_size > self.group.max_size {
            return Err(ScalerError::Config(format!(
                "min_size {} exceeds max_size {}",
                self.group.min_size, self.group.max_size
            )));
        }

        let threshold = self.scaling.scale_down_utilization_threshold;
        if !(threshold > 0.0 && threshold <= 100.0) {
            return Err(ScalerError::Config(format!(
                "scale_down_utilization_threshold {threshold} must be in (0, 100]"
            )));
        }

        if self.scaling.scan_interval_secs == 0 {
            return Err(ScalerError::Config("scan_interval_secs must be positive".into()));
        }

        if self.group.label.is_empty() {
            return Err(ScalerError::Config("group label must not be empty".into()));
        }

        if self.network.mode == "manual" {
            self.network.pool_addresses()?;
        }

        Ok(())
    }
}

fn default_join_command() -> String {
    "kubeadm token create --print-join-command".to_string()
}

fn default_pve_host() -> String {
    "10.128.6.105".to_string()
}

fn default_pve_port() -> u16 {
    8006
}

fn default_pve_user() -> String {
    "root@pam".to_string()
}

fn default_template_vm() -> String {
    "autoscaler.tmpl".to_string()
}

fn default_node_name() -> String {
    "autoscaler.node".to_string()
}

fn default_cores() -> u32 {
    4
}

fn default_memory_mb() -> u64 {
    4096
}

fn default_network_mode() -> String {
    "manual".to_string()
}

fn default_ip_pool() -> String {
    "10.99.0.13-10.99.0.19".to_string()
}

fn default_ip_mask() -> String {
    "24".to_string()
}

fn default_gateway() -> String {
    "10.99.0.1".to_string()
}

fn default_dns_server() -> String {
    "10.128.4.20".to_string()
}

fn default_group_label() -> String {
    "pxe-autoscaler/autoscaler-managed-node".to_string()
}

fn default_min_size() -> usize {
    2
}

fn default_max_size() -> usize {
    5
}

fn default_scan_interval() -> u64 {
    15
}

fn default_scale_down_unneeded() -> u64 {
    600
}

fn default_scale_down_delay() -> u64 {
    600
}

fn default_scale_up_delay_after_add() -> u64 {
    300
}

fn default_scale_down_delay_after_add() -> u64 {
    600
}

fn default_scale_down_delay_after_error() -> u64 {
    600
}

fn default_utilization_threshold() -> f64 {
    50.0
}

fn default_vm_power_poll() -> PollSettings {
    PollSettings::new(2, 150)
}

fn default_os_ready_poll() -> PollSettings {
    PollSettings::new(1, 900)
}

fn default_join_submit_poll() -> PollSettings {
    PollSettings::new(3, 100)
}

fn default_join_status_poll() -> PollSettings {
    PollSettings::new(3, 200)
}

fn default_node_register_poll() -> PollSettings {
    PollSettings::new(2, 300)
}

fn default_node_ready_poll() -> PollSettings {
    PollSettings::new(2, 300)
}
