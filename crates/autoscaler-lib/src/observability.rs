//! Structured lifecycle events
//!
//! Every significant transition of the autoscaler is emitted as one
//! `tracing` event carrying an `event` field and the node-group label, so a
//! JSON log pipeline can follow scale operations without parsing messages.

use std::time::Duration;
use tracing::{error, info, warn};

/// Emits autoscaler lifecycle events for one node group
#[derive(Debug, Clone)]
pub struct StructuredLogger {
    group: String,
}

impl StructuredLogger {
    pub fn new(group: impl Into<String>) -> Self {
        Self {
            group: group.into(),
        }
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn log_startup(&self, version: &str, current_size: usize, min_size: usize, max_size: usize) {
        info!(
            event = "autoscaler_started",
            group = %self.group,
            version = %version,
            current_size,
            min_size,
            max_size,
            "Autoscaler started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "autoscaler_stopped",
            group = %self.group,
            reason = %reason,
            "Autoscaler stopped"
        );
    }

    pub fn log_scale_up_started(&self, current_size: usize) {
        warn!(
            event = "scale_up_started",
            group = %self.group,
            current_size,
            "Scaling up cluster"
        );
    }

    pub fn log_scale_up_finished(&self, vm: Option<&str>, success: bool, current_size: usize) {
        if success {
            warn!(
                event = "scale_up_finished",
                group = %self.group,
                vm = ?vm,
                success,
                current_size,
                "Scaling up successful"
            );
        } else {
            error!(
                event = "scale_up_finished",
                group = %self.group,
                vm = ?vm,
                success,
                current_size,
                "Scaling up failed"
            );
        }
    }

    pub fn log_scale_down_started(&self, node: &str) {
        warn!(
            event = "scale_down_started",
            group = %self.group,
            node = %node,
            "Node was selected for removing"
        );
    }

    pub fn log_scale_down_finished(&self, node: &str, success: bool, current_size: usize) {
        if success {
            warn!(
                event = "scale_down_finished",
                group = %self.group,
                node = %node,
                success,
                current_size,
                "Scaling down successful"
            );
        } else {
            error!(
                event = "scale_down_finished",
                group = %self.group,
                node = %node,
                success,
                current_size,
                "Cannot scale down cluster, node removal failed"
            );
        }
    }

    pub fn log_cooldown_armed(&self, gate: &str, delay: Duration) {
        info!(
            event = "cooldown_armed",
            group = %self.group,
            gate = %gate,
            delay_secs = delay.as_secs(),
            "Gate closed until delay passes"
        );
    }

    pub fn log_error_pause(&self, delay: Duration) {
        info!(
            event = "scale_down_error_pause",
            group = %self.group,
            delay_secs = delay.as_secs(),
            "Pausing after scale down error"
        );
    }

    pub fn log_unneeded_timer_started(&self, node: &str, delay: Duration) {
        info!(
            event = "unneeded_timer_started",
            group = %self.group,
            node = %node,
            delay_secs = delay.as_secs(),
            "Found redundant node, unneeded node timer started"
        );
    }

    pub fn log_unneeded_timer_cancelled(&self, reason: &str) {
        info!(
            event = "unneeded_timer_cancelled",
            group = %self.group,
            reason = %reason,
            "Unneeded node timer cancelled"
        );
    }
}
