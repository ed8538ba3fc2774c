//! Error taxonomy for the autoscaler

use std::time::Duration;
use thiserror::Error;

/// Errors raised by the decision engine, provisioner and removal orchestrator
#[derive(Debug, Error)]
pub enum ScalerError {
    /// A resource quantity string did not match any supported unit
    #[error("invalid resource quantity: {0:?}")]
    InvalidQuantity(String),

    /// The metrics endpoint could not be read
    #[error("metrics unavailable for {target}: {reason}")]
    MetricsUnavailable { target: String, reason: String },

    /// The VM came up but the cluster join was not confirmed
    #[error("vm {vm} failed to join the cluster (exit code {exit_code:?})")]
    JoinFailure {
        vm: String,
        exit_code: Option<i64>,
        stdout: String,
        stderr: String,
    },

    /// Clone, configure or start of a VM failed
    #[error("provisioning of vm {vm} failed: {reason}")]
    ProvisionFailure { vm: String, reason: String },

    /// One step of the cordon/drain/delete/teardown sequence failed
    #[error("removal of node {node} failed during {step}: {reason}")]
    RemovalFailure {
        node: String,
        step: &'static str,
        reason: String,
    },

    /// A bounded poll ran out of attempts
    #[error("timed out waiting for {what} after {attempts} attempts ({interval:?} apart)")]
    Timeout {
        what: String,
        attempts: u32,
        interval: Duration,
    },

    #[error("cluster api error: {0}")]
    Cluster(String),

    #[error("kubernetes api error: {0}")]
    Kube(#[from] kube::Error),

    #[error("hypervisor api error: {0}")]
    Hypervisor(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ScalerError>;

impl ScalerError {
    /// Wrap any error as a removal failure for the given step
    pub fn removal(node: &str, step: &'static str, err: impl std::fmt::Display) -> Self {
        ScalerError::RemovalFailure {
            node: node.to_string(),
            step,
            reason: err.to_string(),
        }
    }

    /// Wrap any error as a provisioning failure
    pub fn provision(vm: &str, err: impl std::fmt::Display) -> Self {
        ScalerError::ProvisionFailure {
            vm: vm.to_string(),
            reason: err.to_string(),
        }
    }
}
