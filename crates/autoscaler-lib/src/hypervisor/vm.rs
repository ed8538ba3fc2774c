//! The VM backing one cluster node and its lifecycle

use crate::error::{Result, ScalerError};
use std::fmt;
use std::str::FromStr;
use tracing::debug;

/// Lifecycle of an autoscaled VM
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    Absent,
    Cloning,
    Configuring,
    Starting,
    BootPolling,
    Joining,
    JoinPolling,
    Active,
    ShuttingDown,
    Deleted,
    Failed,
}

impl VmState {
    /// Whether `next` is a legal successor of `self`
    pub fn can_transition_to(self, next: VmState) -> bool {
        use VmState::*;
        match (self, next) {
            (Deleted, _) => false,
            (_, Failed) => true,
            (Absent, Cloning)
            | (Cloning, Configuring)
            | (Configuring, Starting)
            | (Starting, BootPolling)
            | (BootPolling, Joining)
            | (Joining, JoinPolling)
            | (JoinPolling, Active)
            | (Active, ShuttingDown)
            | (ShuttingDown, Deleted) => true,
            // best-effort teardown of a partially provisioned or failed VM
            (Cloning | Configuring | Starting | BootPolling | Failed, ShuttingDown) => true,
            _ => false,
        }
    }
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Guest network configuration mode
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkMode {
    Dhcp,
    /// Static address in CIDR notation plus gateway
    Manual { cidr: String, gateway: String },
}

impl NetworkMode {
    /// Cloud-init `ipconfig0` value
    pub fn ipconfig(&self) -> String {
        match self {
            NetworkMode::Dhcp => "ip=dhcp".to_string(),
            NetworkMode::Manual { cidr, gateway } => format!("ip={cidr},gw={gateway}"),
        }
    }
}

/// Network mode name as written in the settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkModeKind {
    Dhcp,
    Manual,
}

impl FromStr for NetworkModeKind {
    type Err = ScalerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "dhcp" => Ok(NetworkModeKind::Dhcp),
            "manual" => Ok(NetworkModeKind::Manual),
            other => Err(ScalerError::Config(format!(
                "network mode {other:?} is not valid, expected dhcp or manual"
            ))),
        }
    }
}

/// Compute resource backing one cluster node
#[derive(Debug, Clone, PartialEq)]
pub struct VirtualMachine {
    pub name: String,
    pub vmid: u32,
    pub host: String,
    pub cores: u32,
    pub memory_mb: u64,
    pub network: Option<NetworkMode>,
    state: VmState,
}

impl VirtualMachine {
    pub fn new(name: impl Into<String>, vmid: u32, host: impl Into<String>, cores: u32, memory_mb: u64) -> Self {
        Self {
            name: name.into(),
            vmid,
            host: host.into(),
            cores,
            memory_mb,
            network: None,
            state: VmState::Absent,
        }
    }

    /// An existing VM discovered on `host`, assumed running
    pub fn existing(name: impl Into<String>, vmid: u32, host: impl Into<String>) -> Self {
        let mut vm = Self::new(name, vmid, host, 0, 0);
        vm.state = VmState::Active;
        vm
    }

    pub fn state(&self) -> VmState {
        self.state
    }

    /// Move to `next`, rejecting illegal transitions
    pub fn advance(&mut self, next: VmState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(ScalerError::provision(
                &self.name,
                format!("illegal state transition {} -> {}", self.state, next),
            ));
        }
        debug!(vm = %self.name, vmid = self.vmid, from = %self.state, to = %next, "VM state change");
        self.state = next;
        Ok(())
    }

    pub fn fail(&mut self) {
        if self.state != VmState::Deleted {
            debug!(vm = %self.name, vmid = self.vmid, from = %self.state, "VM failed");
            self.state = VmState::Failed;
        }
    }
}
