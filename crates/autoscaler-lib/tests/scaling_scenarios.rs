use autoscaler_lib::cluster::{async_trait, ClusterApi, ClusterStateReader};
use autoscaler_lib::decision::{
    relocation_feasible, select_removal_candidate, CandidateStats, ScaleDecisionEngine,
};
use autoscaler_lib::group::NodeGroup;
use autoscaler_lib::quantity::{convert_cpu, convert_memory};
use autoscaler_lib::{
    AutoscalerSettings, NodeInfo, NodeMetrics, PodCondition, PodInfo, PodUtilization,
    RawResources, Result, ScalerError, StructuredLogger, UtilizationSample,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

const LABEL: &str = "pxe-autoscaler/autoscaler-managed-node";
const GRACE: Duration = Duration::from_secs(600);

/// Read-only cluster snapshot; mutating calls succeed without effect
#[derive(Default)]
struct SnapshotCluster {
    nodes: Vec<NodeInfo>,
    pods: Vec<PodInfo>,
    usage: HashMap<String, RawResources>,
    pod_usage: HashMap<String, RawResources>,
}

impl SnapshotCluster {
    fn node(mut self, name: &str, used_cpu: &str, used_memory: &str) -> Self {
        self.nodes.push(NodeInfo {
            name: name.to_string(),
            labels: BTreeMap::from([(LABEL.to_string(), "true".to_string())]),
            ready: true,
            internal_ips: vec![],
            allocatable: RawResources::new("4", "8Gi"),
            capacity: RawResources::new("4", "8Gi"),
        });
        self.usage
            .insert(name.to_string(), RawResources::new(used_cpu, used_memory));
        self
    }

    fn pod(mut self, node: &str, name: &str, owner_kind: &str, cpu: &str, memory: &str) -> Self {
        self.pods.push(PodInfo {
            name: name.to_string(),
            namespace: "default".to_string(),
            node_name: Some(node.to_string()),
            owner_kind: Some(owner_kind.to_string()),
            conditions: vec![],
        });
        self.pod_usage
            .insert(name.to_string(), RawResources::new(cpu, memory));
        self
    }

    fn pending(mut self, name: &str) -> Self {
        self.pods.push(PodInfo {
            name: name.to_string(),
            namespace: "default".to_string(),
            node_name: None,
            owner_kind: Some("ReplicaSet".to_string()),
            conditions: vec![PodCondition {
                reason: Some("Unschedulable".to_string()),
                message: Some("0/3 nodes are available: 3 Insufficient cpu.".to_string()),
            }],
        });
        self
    }
}

#[async_trait]
impl ClusterApi for SnapshotCluster {
    async fn list_nodes(&self) -> Result<Vec<NodeInfo>> {
        Ok(self.nodes.clone())
    }

    async fn get_node(&self, name: &str) -> Result<Option<NodeInfo>> {
        Ok(self.nodes.iter().find(|n| n.name == name).cloned())
    }

    async fn list_pods(&self) -> Result<Vec<PodInfo>> {
        Ok(self.pods.clone())
    }

    async fn list_pods_on_node(&self, node: &str) -> Result<Vec<PodInfo>> {
        Ok(self
            .pods
            .iter()
            .filter(|p| p.node_name.as_deref() == Some(node))
            .cloned()
            .collect())
    }

    async fn node_metrics(&self, node: &str) -> Result<NodeMetrics> {
        let usage = self
            .usage
            .get(node)
            .cloned()
            .ok_or_else(|| ScalerError::MetricsUnavailable {
                target: node.to_string(),
                reason: "not found".to_string(),
            })?;
        Ok(NodeMetrics {
            name: node.to_string(),
            usage,
        })
    }

    async fn list_node_metrics(&self) -> Result<Vec<NodeMetrics>> {
        Ok(self
            .usage
            .iter()
            .map(|(name, usage)| NodeMetrics {
                name: name.clone(),
                usage: usage.clone(),
            })
            .collect())
    }

    async fn pod_metrics(&self, _namespace: &str, pod: &str) -> Result<Vec<RawResources>> {
        Ok(self.pod_usage.get(pod).cloned().into_iter().collect())
    }

    async fn label_node(&self, _node: &str, _key: &str, _value: &str) -> Result<()> {
        Ok(())
    }

    async fn cordon_node(&self, _node: &str) -> Result<()> {
        Ok(())
    }

    async fn evict_pod(&self, _namespace: &str, _pod: &str) -> Result<()> {
        Ok(())
    }

    async fn delete_node(&self, _node: &str) -> Result<()> {
        Ok(())
    }
}

async fn engine_for(cluster: SnapshotCluster, min_size: usize) -> (ScaleDecisionEngine, NodeGroup) {
    let reader = ClusterStateReader::new(Arc::new(cluster), LABEL);
    let mut settings = AutoscalerSettings::default();
    settings.group.label = LABEL.to_string();
    settings.group.min_size = min_size;
    settings.group.max_size = 5;

    let group = NodeGroup::discover(&reader, &settings).await.unwrap();
    let engine = ScaleDecisionEngine::new(reader, 50.0, GRACE, StructuredLogger::new(LABEL));
    (engine, group)
}

async fn settle(d: Duration) {
    tokio::time::sleep(d).await;
    tokio::task::yield_now().await;
}

#[test]
fn test_quantities_normalize_to_millicores_and_mb() {
    assert_eq!(convert_cpu("250000000n").unwrap(), 250);
    assert_eq!(convert_cpu("2").unwrap(), 2000);
    assert_eq!(convert_memory("8Gi").unwrap(), 8192);
    assert_eq!(convert_memory("1048576Ki").unwrap(), 1024);
    assert_err!(convert_memory("12XB"));
}

#[test]
fn test_empty_node_is_preferred_over_least_loaded() {
    let stats = vec![
        CandidateStats::new("a", 5.0, 5.0, true),
        CandidateStats::new("b", 30.0, 40.0, false),
        CandidateStats::new("c", 10.0, 10.0, true),
    ];
    assert_eq!(select_removal_candidate(&stats), Some("b".to_string()));
}

#[test]
fn test_pod_too_large_for_any_remaining_node_blocks_relocation() {
    let samples = vec![
        UtilizationSample::from_usage("a", 3000, 2048, 4000, 8192),
        UtilizationSample::from_usage("b", 1000, 1024, 4000, 8192),
    ];
    let pods = vec![PodUtilization {
        pod: "batch".to_string(),
        cpu: 4000,
        memory: 512,
    }];
    assert!(!relocation_feasible("a", &samples, &pods));

    let small = vec![PodUtilization {
        pod: "web".to_string(),
        cpu: 500,
        memory: 512,
    }];
    assert!(relocation_feasible("a", &samples, &small));
}

#[tokio::test]
async fn test_group_below_minimum_needs_scale_up() {
    let cluster = SnapshotCluster::default()
        .node("autoscaler.node-1", "100m", "1Gi")
        .node("autoscaler.node-2", "100m", "1Gi");
    let (engine, group) = engine_for(cluster, 3).await;

    assert_eq!(group.current_size(), 2);
    assert!(assert_ok!(engine.needs_scale_up(&group).await));
}

#[tokio::test]
async fn test_admission_pressure_needs_scale_up_within_bounds() {
    let cluster = SnapshotCluster::default()
        .node("autoscaler.node-1", "3500m", "7Gi")
        .pending("web-7d9f");
    let (engine, group) = engine_for(cluster, 1).await;

    assert!(assert_ok!(engine.needs_scale_up(&group).await));
}

#[tokio::test(start_paused = true)]
async fn test_single_node_with_only_daemonsets_is_removed_after_grace() {
    let cluster = SnapshotCluster::default()
        .node("autoscaler.node-1", "100m", "512Mi")
        .pod("autoscaler.node-1", "kube-proxy", "DaemonSet", "10m", "32Mi");
    let (mut engine, group) = engine_for(cluster, 0).await;

    assert_eq!(assert_ok!(engine.scale_down_candidate(&group).await), None);
    assert!(engine.unneeded_timer_running());

    settle(GRACE + Duration::from_secs(1)).await;
    assert_eq!(
        assert_ok!(engine.scale_down_candidate(&group).await),
        Some("autoscaler.node-1".to_string())
    );
}

#[tokio::test(start_paused = true)]
async fn test_busy_group_never_starts_grace_period() {
    let cluster = SnapshotCluster::default()
        .node("autoscaler.node-1", "3", "6Gi")
        .node("autoscaler.node-2", "1", "6Gi");
    let (mut engine, group) = engine_for(cluster, 1).await;

    assert_eq!(assert_ok!(engine.scale_down_candidate(&group).await), None);
    assert!(!engine.unneeded_timer_running());
}
