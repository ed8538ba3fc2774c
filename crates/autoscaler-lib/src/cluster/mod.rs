//! Cluster state access
//!
//! `ClusterApi` is the thin seam over the orchestration API; it returns raw
//! quantity strings. `ClusterStateReader` layers the autoscaler's queries on
//! top of it and does the unit conversion.

mod kube_api;
mod reader;

pub use kube_api::KubeClusterApi;
pub use reader::ClusterStateReader;

use crate::error::Result;
use crate::models::{NodeInfo, NodeMetrics, PodInfo, RawResources};

pub use async_trait::async_trait;

/// Operations the autoscaler needs from the orchestration API
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// List every node in the cluster
    async fn list_nodes(&self) -> Result<Vec<NodeInfo>>;

    /// Fetch one node, `None` if it does not exist
    async fn get_node(&self, name: &str) -> Result<Option<NodeInfo>>;

    /// List pods in all namespaces
    async fn list_pods(&self) -> Result<Vec<PodInfo>>;

    /// List pods bound to `node`
    async fn list_pods_on_node(&self, node: &str) -> Result<Vec<PodInfo>>;

    /// Current usage of one node from the metrics API
    async fn node_metrics(&self, node: &str) -> Result<NodeMetrics>;

    /// Current usage of every node from the metrics API
    async fn list_node_metrics(&self) -> Result<Vec<NodeMetrics>>;

    /// Per-container usage of one pod
    async fn pod_metrics(&self, namespace: &str, pod: &str) -> Result<Vec<RawResources>>;

    async fn label_node(&self, node: &str, key: &str, value: &str) -> Result<()>;

    /// Mark the node unschedulable
    async fn cordon_node(&self, node: &str) -> Result<()>;

    async fn evict_pod(&self, namespace: &str, pod: &str) -> Result<()>;

    async fn delete_node(&self, node: &str) -> Result<()>;
}
