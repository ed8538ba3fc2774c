//! `ClusterApi` backed by the Kubernetes API server

use super::ClusterApi;
use crate::error::{Result, ScalerError};
use crate::models::{NodeInfo, NodeMetrics, PodCondition, PodInfo, RawResources};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Pod};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::{
    Api, ApiResource, DeleteParams, DynamicObject, EvictParams, ListParams, Patch, PatchParams,
};
use kube::Client;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tracing::debug;

const METRICS_GROUP: &str = "metrics.k8s.io";
const METRICS_VERSION: &str = "v1beta1";

fn metrics_resource(kind: &str, plural: &str) -> ApiResource {
    ApiResource {
        group: METRICS_GROUP.to_string(),
        version: METRICS_VERSION.to_string(),
        api_version: format!("{METRICS_GROUP}/{METRICS_VERSION}"),
        kind: kind.to_string(),
        plural: plural.to_string(),
    }
}

/// Kubernetes client for the autoscaler
#[derive(Clone)]
pub struct KubeClusterApi {
    client: Client,
}

impl KubeClusterApi {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Connect using in-cluster config, falling back to the local kubeconfig
    pub async fn try_default() -> Result<Self> {
        Ok(Self::new(Client::try_default().await?))
    }

    fn nodes(&self) -> Api<Node> {
        Api::all(self.client.clone())
    }

    fn node_metrics_api(&self) -> Api<DynamicObject> {
        Api::all_with(self.client.clone(), &metrics_resource("NodeMetrics", "nodes"))
    }
}

fn raw_resources(map: Option<&BTreeMap<String, Quantity>>) -> RawResources {
    RawResources {
        cpu: map.and_then(|m| m.get("cpu")).map(|q| q.0.clone()),
        memory: map.and_then(|m| m.get("memory")).map(|q| q.0.clone()),
    }
}

fn usage_from_json(usage: &Value) -> RawResources {
    RawResources {
        cpu: usage.get("cpu").and_then(Value::as_str).map(String::from),
        memory: usage.get("memory").and_then(Value::as_str).map(String::from),
    }
}

pub(crate) fn node_info(node: Node) -> NodeInfo {
    let status = node.status.unwrap_or_default();
    let ready = status
        .conditions
        .as_ref()
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false);
    let internal_ips = status
        .addresses
        .unwrap_or_default()
        .into_iter()
        .filter(|a| a.type_ == "InternalIP")
        .map(|a| a.address)
        .collect();

    NodeInfo {
        name: node.metadata.name.unwrap_or_default(),
        labels: node.metadata.labels.unwrap_or_default(),
        ready,
        internal_ips,
        allocatable: raw_resources(status.allocatable.as_ref()),
        capacity: raw_resources(status.capacity.as_ref()),
    }
}

pub(crate) fn pod_info(pod: Pod) -> PodInfo {
    let owner_kind = pod
        .metadata
        .owner_references
        .as_ref()
        .and_then(|owners| owners.first())
        .map(|owner| owner.kind.clone());
    let conditions = pod
        .status
        .and_then(|s| s.conditions)
        .unwrap_or_default()
        .into_iter()
        .map(|c| PodCondition {
            reason: c.reason,
            message: c.message,
        })
        .collect();

    PodInfo {
        name: pod.metadata.name.unwrap_or_default(),
        namespace: pod.metadata.namespace.unwrap_or_default(),
        node_name: pod.spec.and_then(|s| s.node_name),
        owner_kind,
        conditions,
    }
}

fn metrics_error(target: &str, err: kube::Error) -> ScalerError {
    ScalerError::MetricsUnavailable {
        target: target.to_string(),
        reason: err.to_string(),
    }
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn list_nodes(&self) -> Result<Vec<NodeInfo>> {
        let nodes = self.nodes().list(&ListParams::default()).await?;
        Ok(nodes.items.into_iter().map(node_info).collect())
    }

    async fn get_node(&self, name: &str) -> Result<Option<NodeInfo>> {
        Ok(self.nodes().get_opt(name).await?.map(node_info))
    }

    async fn list_pods(&self) -> Result<Vec<PodInfo>> {
        let pods: Api<Pod> = Api::all(self.client.clone());
        let list = pods.list(&ListParams::default()).await?;
        Ok(list.items.into_iter().map(pod_info).collect())
    }

    async fn list_pods_on_node(&self, node: &str) -> Result<Vec<PodInfo>> {
        let pods: Api<Pod> = Api::all(self.client.clone());
        let params = ListParams::default().fields(&format!("spec.nodeName={node}"));
        let list = pods.list(&params).await?;
        Ok(list.items.into_iter().map(pod_info).collect())
    }

    async fn node_metrics(&self, node: &str) -> Result<NodeMetrics> {
        let object = self
            .node_metrics_api()
            .get(node)
            .await
            .map_err(|e| metrics_error(node, e))?;

        Ok(NodeMetrics {
            name: node.to_string(),
            usage: usage_from_json(&object.data["usage"]),
        })
    }

    async fn list_node_metrics(&self) -> Result<Vec<NodeMetrics>> {
        let list = self
            .node_metrics_api()
            .list(&ListParams::default())
            .await
            .map_err(|e| metrics_error("nodes", e))?;

        Ok(list
            .items
            .into_iter()
            .map(|object| NodeMetrics {
                usage: usage_from_json(&object.data["usage"]),
                name: object.metadata.name.unwrap_or_default(),
            })
            .collect())
    }

    async fn pod_metrics(&self, namespace: &str, pod: &str) -> Result<Vec<RawResources>> {
        let api: Api<DynamicObject> = Api::namespaced_with(
            self.client.clone(),
            namespace,
            &metrics_resource("PodMetrics", "pods"),
        );
        let object = api
            .get(pod)
            .await
            .map_err(|e| metrics_error(&format!("{namespace}/{pod}"), e))?;

        Ok(object.data["containers"]
            .as_array()
            .map(|containers| {
                containers
                    .iter()
                    .map(|c| usage_from_json(&c["usage"]))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn label_node(&self, node: &str, key: &str, value: &str) -> Result<()> {
        let patch = json!({ "metadata": { "labels": { key: value } } });
        self.nodes()
            .patch(node, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        debug!(node = %node, label = %key, "Node labeled");
        Ok(())
    }

    async fn cordon_node(&self, node: &str) -> Result<()> {
        let patch = json!({ "spec": { "unschedulable": true } });
        self.nodes()
            .patch(node, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn evict_pod(&self, namespace: &str, pod: &str) -> Result<()> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        pods.evict(pod, &EvictParams::default()).await?;
        Ok(())
    }

    async fn delete_node(&self, node: &str) -> Result<()> {
        self.nodes().delete(node, &DeleteParams::default()).await?;
        Ok(())
    }
}
