//! The labeled node group managed by the autoscaler

use crate::cluster::ClusterStateReader;
use crate::error::Result;
use crate::models::NodeInfo;
use crate::quantity::{convert_cpu_opt, convert_memory_opt};
use crate::settings::AutoscalerSettings;
use tracing::info;

/// Ready nodes carrying the management label
///
/// Size is always recomputed from a live listing, never adjusted by hand.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeGroup {
    pub label: String,
    pub nodes: Vec<String>,
    pub internal_ips: Vec<String>,
    pub min_size: usize,
    pub max_size: usize,
    /// Cores of one node, sampled from the first node at discovery
    pub capacity_cores: u32,
    /// Memory of one node in MB, rounded to whole GiB
    pub capacity_memory_mb: u64,
}

impl NodeGroup {
    /// Build the group from the current cluster state
    pub async fn discover(reader: &ClusterStateReader, settings: &AutoscalerSettings) -> Result<Self> {
        let nodes = reader.ready_group_nodes().await?;
        for node in &nodes {
            info!(node = %node.name, "Node with state Ready");
        }

        let (capacity_cores, capacity_memory_mb) = match nodes.first() {
            Some(first) => sample_capacity(first)?,
            None => (
                settings.proxmox.default_cores,
                settings.proxmox.default_memory_mb,
            ),
        };

        let mut group = Self {
            label: reader.label().to_string(),
            nodes: Vec::new(),
            internal_ips: Vec::new(),
            min_size: settings.group.min_size,
            max_size: settings.group.max_size,
            capacity_cores,
            capacity_memory_mb,
        };
        group.apply(nodes);
        Ok(group)
    }

    /// Re-list the group after a topology change
    pub async fn refresh(&mut self, reader: &ClusterStateReader) -> Result<()> {
        let nodes = reader.ready_group_nodes().await?;
        self.apply(nodes);
        Ok(())
    }

    fn apply(&mut self, nodes: Vec<NodeInfo>) {
        self.internal_ips = nodes
            .iter()
            .flat_map(|n| n.internal_ips.iter().cloned())
            .collect();
        self.nodes = nodes.into_iter().map(|n| n.name).collect();
    }

    pub fn current_size(&self) -> usize {
        self.nodes.len()
    }

    /// True if removing a node keeps the group at or above its minimum
    pub fn is_above_minimum(&self) -> bool {
        self.current_size() > self.min_size
    }
}

/// Cores and GiB-rounded memory (in MB) from a node's capacity
fn sample_capacity(node: &NodeInfo) -> Result<(u32, u64)> {
    let millicores = convert_cpu_opt(node.capacity.cpu.as_deref())?;
    let memory_mb = convert_memory_opt(node.capacity.memory.as_deref())?;

    let cores = (millicores / 1000).max(1) as u32;
    let gib = (memory_mb as f64 / 1024.0).round() as u64;
    Ok((cores, gib * 1024))
}
