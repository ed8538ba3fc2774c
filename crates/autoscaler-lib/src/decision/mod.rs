//! Scale-up and scale-down decisions
//!
//! `ScaleDecisionEngine` answers the two questions the control loop asks
//! every tick. Scale-down runs through a fixed sequence of gates and stops
//! at the first one that fails:
//!
//! 1. no pod is pending on insufficient resources
//! 2. the least loaded node is below the utilization threshold on both axes
//! 3. the selection policy yields a candidate
//! 4. the candidate has stayed unneeded for the grace period
//! 5. the candidate's workload can be relocated
//!
//! The chosen node is returned to the caller rather than stored.

mod policy;


pub use policy::{relocation_feasible, select_removal_candidate, CandidateStats};

use crate::cluster::ClusterStateReader;
use crate::cooldown::UnneededNodeTimer;
use crate::error::Result;
use crate::group::NodeGroup;
use crate::observability::StructuredLogger;
use std::time::Duration;
use tracing::{info, warn};

pub struct ScaleDecisionEngine {
    reader: ClusterStateReader,
    threshold: f64,
    unneeded: UnneededNodeTimer,
    unneeded_delay: Duration,
    logger: StructuredLogger,
}

impl ScaleDecisionEngine {
    pub fn new(
        reader: ClusterStateReader,
        threshold: f64,
        unneeded_delay: Duration,
        logger: StructuredLogger,
    ) -> Self {
        Self {
            reader,
            threshold,
            unneeded: UnneededNodeTimer::new(unneeded_delay),
            unneeded_delay,
            logger,
        }
    }

    pub fn reader(&self) -> &ClusterStateReader {
        &self.reader
    }

    /// True while a candidate's grace period is counting down
    pub fn unneeded_timer_running(&self) -> bool {
        self.unneeded.is_running()
    }

    /// Below minimum always scales up; between minimum and maximum only
    /// admission pressure does
    pub async fn needs_scale_up(&self, group: &NodeGroup) -> Result<bool> {
        if group.current_size() < group.min_size {
            info!(
                current_size = group.current_size(),
                min_size = group.min_size,
                "Node group below minimum size"
            );
            return Ok(true);
        }
        if group.current_size() < group.max_size {
            return self.reader.has_unschedulable_pods().await;
        }
        warn!(max_size = group.max_size, "Autoscaler reached maximum size, cannot scale");
        Ok(false)
    }

    /// The node to remove this tick, if every scale-down gate passes
    pub async fn scale_down_candidate(&mut self, group: &NodeGroup) -> Result<Option<String>> {
        if self.reader.has_unschedulable_pods().await? {
            return Ok(None);
        }

        let samples = self.reader.group_utilization().await?;
        let min_cpu = samples.iter().map(|s| s.cpu_percent).reduce(f64::min);
        let min_mem = samples.iter().map(|s| s.memory_percent).reduce(f64::min);
        let (Some(min_cpu), Some(min_mem)) = (min_cpu, min_mem) else {
            self.cancel_unneeded("no utilization samples");
            return Ok(None);
        };
        if min_cpu >= self.threshold || min_mem >= self.threshold {
            info!(
                threshold = self.threshold,
                min_cpu_percent = min_cpu,
                min_memory_percent = min_mem,
                "Cannot scale down, nodes utilization above threshold"
            );
            self.cancel_unneeded("utilization above threshold");
            return Ok(None);
        }

        let mut stats = Vec::with_capacity(group.nodes.len());
        for node in &group.nodes {
            let sample = self.reader.node_utilization(node).await?;
            let has_workload = self.reader.is_running_workload(node).await?;
            stats.push(CandidateStats::new(
                node.as_str(),
                sample.cpu_percent,
                sample.memory_percent,
                has_workload,
            ));
        }
        let Some(candidate) = select_removal_candidate(&stats) else {
            info!("Node for scale down not selected");
            self.cancel_unneeded("no candidate");
            return Ok(None);
        };

        if !self.unneeded.take_elapsed() {
            if self.unneeded.start_if_idle() {
                self.logger
                    .log_unneeded_timer_started(&candidate, self.unneeded_delay);
            }
            return Ok(None);
        }

        if samples.len() == 1 {
            if self.reader.is_running_workload(&candidate).await? {
                info!(node = %candidate, "Cannot scale down last autoscaler node with running pods");
                return Ok(None);
            }
            return Ok(Some(candidate));
        }

        let pods = self.reader.pod_utilizations(&candidate).await?;
        if relocation_feasible(&candidate, &samples, &pods) {
            Ok(Some(candidate))
        } else {
            Ok(None)
        }
    }

    fn cancel_unneeded(&mut self, reason: &str) {
        if self.unneeded.is_running() {
            self.logger.log_unneeded_timer_cancelled(reason);
        }
        self.unneeded.cancel();
    }
}
