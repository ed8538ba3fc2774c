//! Autoscaler-level queries over the cluster API

use super::ClusterApi;
use crate::error::{Result, ScalerError};
use crate::models::{NodeInfo, PodInfo, PodUtilization, UtilizationSample};
use crate::quantity::{convert_cpu_opt, convert_memory_opt};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Reads node, pod and metrics state for one labeled node group
#[derive(Clone)]
pub struct ClusterStateReader {
    api: Arc<dyn ClusterApi>,
    label: String,
}

impl ClusterStateReader {
    pub fn new(api: Arc<dyn ClusterApi>, label: impl Into<String>) -> Self {
        Self {
            api,
            label: label.into(),
        }
    }

    pub fn api(&self) -> &Arc<dyn ClusterApi> {
        &self.api
    }

    /// The management label identifying group members
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Ready nodes carrying the management label, in listing order
    pub async fn ready_group_nodes(&self) -> Result<Vec<NodeInfo>> {
        let nodes = self.api.list_nodes().await?;
        Ok(nodes
            .into_iter()
            .filter(|n| n.has_group_label(&self.label) && n.ready)
            .collect())
    }

    /// True if any pod is pending on insufficient CPU or memory
    pub async fn has_unschedulable_pods(&self) -> Result<bool> {
        let pods = self.api.list_pods().await?;
        for pod in &pods {
            if let Some(message) = pod.insufficient_resources_message() {
                warn!(pod = %pod.name, namespace = %pod.namespace, reason = %message, "Found unschedulable pod");
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Utilization of a single node
    ///
    /// Unreachable metrics degrade to 99%/99% so the node is never picked
    /// for removal; malformed quantities are still errors.
    pub async fn node_utilization(&self, node: &str) -> Result<UtilizationSample> {
        let metrics = match self.api.node_metrics(node).await {
            Ok(metrics) => metrics,
            Err(e) => {
                warn!(node = %node, error = %e, "Cannot get node utilization, ignoring node");
                return Ok(UtilizationSample::unavailable(node));
            }
        };

        let allocatable = match self.api.get_node(node).await {
            Ok(Some(info)) => info.allocatable,
            Ok(None) => {
                warn!(node = %node, "Node disappeared while reading utilization");
                return Ok(UtilizationSample::unavailable(node));
            }
            Err(e) => {
                warn!(node = %node, error = %e, "Cannot read node allocatable capacity");
                return Ok(UtilizationSample::unavailable(node));
            }
        };

        Ok(UtilizationSample::from_usage(
            node,
            convert_cpu_opt(metrics.usage.cpu.as_deref())?,
            convert_memory_opt(metrics.usage.memory.as_deref())?,
            convert_cpu_opt(allocatable.cpu.as_deref())?,
            convert_memory_opt(allocatable.memory.as_deref())?,
        ))
    }

    /// Utilization of every labeled node that reports metrics
    ///
    /// Fails with `MetricsUnavailable` if the metrics endpoint cannot be read.
    pub async fn group_utilization(&self) -> Result<Vec<UtilizationSample>> {
        let metrics = self.api.list_node_metrics().await.map_err(|e| match e {
            ScalerError::MetricsUnavailable { .. } => e,
            other => ScalerError::MetricsUnavailable {
                target: "nodes".to_string(),
                reason: other.to_string(),
            },
        })?;
        let usage: HashMap<String, _> = metrics.into_iter().map(|m| (m.name, m.usage)).collect();

        let mut samples = Vec::new();
        for node in self.api.list_nodes().await? {
            if !node.has_group_label(&self.label) {
                continue;
            }
            let Some(used) = usage.get(&node.name) else {
                continue;
            };
            samples.push(UtilizationSample::from_usage(
                node.name.as_str(),
                convert_cpu_opt(used.cpu.as_deref())?,
                convert_memory_opt(used.memory.as_deref())?,
                convert_cpu_opt(node.allocatable.cpu.as_deref())?,
                convert_memory_opt(node.allocatable.memory.as_deref())?,
            ));
        }
        Ok(samples)
    }

    /// Pods on `node` that are not owned by a DaemonSet
    pub async fn workload_pods(&self, node: &str) -> Result<Vec<PodInfo>> {
        let pods = self.api.list_pods_on_node(node).await?;
        Ok(pods.into_iter().filter(|p| !p.is_daemonset_owned()).collect())
    }

    /// True if `node` hosts any pod not owned by a DaemonSet
    pub async fn is_running_workload(&self, node: &str) -> Result<bool> {
        Ok(!self.workload_pods(node).await?.is_empty())
    }

    /// Summed container usage of every workload pod on `node`
    pub async fn pod_utilizations(&self, node: &str) -> Result<Vec<PodUtilization>> {
        let mut result = Vec::new();
        for pod in self.workload_pods(node).await? {
            let containers = self.api.pod_metrics(&pod.namespace, &pod.name).await?;
            let mut cpu = 0;
            let mut memory = 0;
            for usage in &containers {
                cpu += convert_cpu_opt(usage.cpu.as_deref())?;
                memory += convert_memory_opt(usage.memory.as_deref())?;
            }
            result.push(PodUtilization {
                pod: pod.name,
                cpu,
                memory,
            });
        }
        Ok(result)
    }

    pub async fn node_exists(&self, node: &str) -> Result<bool> {
        let exists = self.api.get_node(node).await?.is_some();
        if exists {
            info!(node = %node, "Node found in cluster");
        }
        Ok(exists)
    }

    /// Readiness of `node`; lookup failures count as not ready
    pub async fn node_ready(&self, node: &str) -> bool {
        match self.api.get_node(node).await {
            Ok(Some(info)) => info.ready,
            Ok(None) => false,
            Err(e) => {
                warn!(node = %node, error = %e, "Cannot read node status");
                false
            }
        }
    }
}
