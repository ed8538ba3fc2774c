//! The autoscaler control loop
//!
//! One task owns all decision state and runs a tick every scan interval.
//! Scale-up is always considered before scale-down, and at most one scale
//! operation is in flight at any time.

use crate::cluster::{ClusterApi, ClusterStateReader};
use crate::cooldown::{CooldownDelays, CooldownScheduler};
use crate::decision::ScaleDecisionEngine;
use crate::error::Result;
use crate::group::NodeGroup;
use crate::hypervisor::{HypervisorApi, VmInventory};
use crate::join::JoinCommandSource;
use crate::observability::StructuredLogger;
use crate::provisioner::VmProvisioner;
use crate::removal::NodeRemovalOrchestrator;
use crate::settings::AutoscalerSettings;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::interval;
use tracing::{debug, info, warn};

/// What a single tick did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    Idle,
    /// Scale-up was needed but no address was free
    ScaleUpSkipped,
    ScaledUp(String),
    ScaleUpFailed,
    ScaledDown(String),
    ScaleDownFailed(String),
}

/// External collaborators the autoscaler drives
#[derive(Clone)]
pub struct Backends {
    pub cluster: Arc<dyn ClusterApi>,
    pub hypervisor: Arc<dyn HypervisorApi>,
    pub join: Arc<dyn JoinCommandSource>,
}

pub struct Autoscaler {
    reader: ClusterStateReader,
    group: NodeGroup,
    engine: ScaleDecisionEngine,
    cooldown: CooldownScheduler,
    provisioner: VmProvisioner,
    removal: NodeRemovalOrchestrator,
    logger: StructuredLogger,
    scan_interval: Duration,
}

impl Autoscaler {
    /// Discover the node group and wire every component together
    pub async fn new(settings: &AutoscalerSettings, backends: Backends) -> Result<Self> {
        settings.validate()?;

        let logger = StructuredLogger::new(&settings.group.label);
        let reader = ClusterStateReader::new(backends.cluster, &settings.group.label);
        let inventory = VmInventory::new(
            backends.hypervisor,
            &settings.proxmox.node_name,
            &settings.proxmox.template_vm,
        );

        let group = NodeGroup::discover(&reader, settings).await?;
        let engine = ScaleDecisionEngine::new(
            reader.clone(),
            settings.scaling.scale_down_utilization_threshold,
            settings.scaling.scale_down_unneeded(),
            logger.clone(),
        );
        let provisioner = VmProvisioner::new(
            inventory.clone(),
            reader.clone(),
            backends.join,
            settings.network.clone(),
            settings.polling.clone(),
        );
        let removal =
            NodeRemovalOrchestrator::new(reader.clone(), inventory, settings.polling.vm_power);

        Ok(Self {
            reader,
            group,
            engine,
            cooldown: CooldownScheduler::new(CooldownDelays::from(&settings.scaling)),
            provisioner,
            removal,
            logger,
            scan_interval: settings.scaling.scan_interval(),
        })
    }

    pub fn group(&self) -> &NodeGroup {
        &self.group
    }

    pub fn cooldown(&self) -> &CooldownScheduler {
        &self.cooldown
    }

    /// Tick every scan interval until `shutdown` fires
    ///
    /// A tick in progress is dropped at its next await point once shutdown
    /// fires.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        self.logger.log_startup(
            env!("CARGO_PKG_VERSION"),
            self.group.current_size(),
            self.group.min_size,
            self.group.max_size,
        );
        info!(interval_secs = self.scan_interval.as_secs(), "Starting control loop");

        let mut ticker = interval(self.scan_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    tokio::select! {
                        outcome = self.tick() => {
                            debug!(outcome = ?outcome, size = self.group.current_size(), "Tick complete");
                        }
                        _ = shutdown.recv() => {
                            self.logger.log_shutdown("shutdown signal received during tick");
                            break;
                        }
                    }
                }
                _ = shutdown.recv() => {
                    self.logger.log_shutdown("shutdown signal received");
                    break;
                }
            }
        }
    }

    /// Evaluate scale-up, then scale-down, and act on the first that applies
    pub async fn tick(&mut self) -> TickOutcome {
        if self.cooldown.can_scale_up() {
            match self.engine.needs_scale_up(&self.group).await {
                Ok(true) => return self.scale_up().await,
                Ok(false) => {}
                Err(e) => warn!(error = %e, "Cannot evaluate scale up"),
            }
        }

        if self.cooldown.can_scale_down() && self.group.is_above_minimum() {
            match self.engine.scale_down_candidate(&self.group).await {
                Ok(Some(node)) => return self.scale_down(node).await,
                Ok(None) => {}
                Err(e) => warn!(error = %e, "Scale down decision aborted for this cycle"),
            }
        }

        TickOutcome::Idle
    }

    async fn scale_up(&mut self) -> TickOutcome {
        self.logger.log_scale_up_started(self.group.current_size());

        // nodes may have joined outside the autoscaler since the last refresh
        if let Err(e) = self.group.refresh(&self.reader).await {
            warn!(error = %e, "Cannot refresh node group before scale up");
            return TickOutcome::ScaleUpSkipped;
        }

        let lease = match self.provisioner.allocate_address(&self.group).await {
            Ok(Some(lease)) => lease,
            Ok(None) => return TickOutcome::ScaleUpSkipped,
            Err(e) => {
                warn!(error = %e, "Cannot allocate address for new node");
                return TickOutcome::ScaleUpSkipped;
            }
        };

        self.cooldown.begin_scale_up();
        let result = self.provisioner.provision(&mut self.group, lease).await;
        self.cooldown.finish_scale_up();

        let delays = self.cooldown.delays();
        self.logger.log_cooldown_armed("can_scale_up", delays.scale_up_after_add);
        self.logger
            .log_cooldown_armed("can_scale_down", delays.scale_down_after_add);

        match result {
            Ok(name) => {
                self.logger
                    .log_scale_up_finished(Some(&name), true, self.group.current_size());
                TickOutcome::ScaledUp(name)
            }
            Err(e) => {
                warn!(error = %e, "Scale up attempt failed");
                self.logger
                    .log_scale_up_finished(None, false, self.group.current_size());
                TickOutcome::ScaleUpFailed
            }
        }
    }

    async fn scale_down(&mut self, node: String) -> TickOutcome {
        self.logger.log_scale_down_started(&node);

        match self.removal.remove(&node, &mut self.group).await {
            Ok(()) => {
                self.cooldown.finish_scale_down();
                self.logger
                    .log_cooldown_armed("can_scale_down", self.cooldown.delays().scale_down);
                self.logger
                    .log_scale_down_finished(&node, true, self.group.current_size());
                TickOutcome::ScaledDown(node)
            }
            Err(e) => {
                warn!(node = %node, error = %e, "Scale down attempt failed");
                self.logger
                    .log_scale_down_finished(&node, false, self.group.current_size());
                let pause = self.cooldown.scale_down_error_pause();
                self.logger.log_error_pause(pause);
                tokio::time::sleep(pause).await;
                if let Err(e) = self.group.refresh(&self.reader).await {
                    warn!(error = %e, "Cannot refresh node group after failed scale down");
                }
                TickOutcome::ScaleDownFailed(node)
            }
        }
    }
}
