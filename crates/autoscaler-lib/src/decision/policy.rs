//! Pure node-selection and relocation rules

use crate::models::{PodUtilization, UtilizationSample};
use tracing::{info, warn};

/// What the selection policy needs to know about one group node
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateStats {
    pub node: String,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    /// Hosts at least one pod not owned by a DaemonSet
    pub has_workload: bool,
}

impl CandidateStats {
    pub fn new(node: impl Into<String>, cpu_percent: f64, memory_percent: f64, has_workload: bool) -> Self {
        Self {
            node: node.into(),
            cpu_percent,
            memory_percent,
            has_workload,
        }
    }
}

/// Pick the node to remove
///
/// The last node without workload wins. Otherwise the least loaded node by
/// CPU% + memory% wins if it is also minimal on CPU or memory, else the
/// node minimal on CPU. All minimums use `<=`, so the last tie wins.
pub fn select_removal_candidate(nodes: &[CandidateStats]) -> Option<String> {
    let mut last_empty: Option<&str> = None;
    let (mut min_cpu, mut min_mem, mut min_all) = (None::<&str>, None::<&str>, None::<&str>);
    let (mut util_cpu, mut util_mem, mut util_all) = (100.0, 100.0, 200.0);

    for stats in nodes {
        if !stats.has_workload {
            last_empty = Some(&stats.node);
        }
        let combined = stats.cpu_percent + stats.memory_percent;
        if stats.cpu_percent <= util_cpu {
            util_cpu = stats.cpu_percent;
            min_cpu = Some(&stats.node);
        }
        if stats.memory_percent <= util_mem {
            util_mem = stats.memory_percent;
            min_mem = Some(&stats.node);
        }
        if combined <= util_all {
            util_all = combined;
            min_all = Some(&stats.node);
        }
    }

    if let Some(empty) = last_empty {
        return Some(empty.to_string());
    }
    if min_all.is_some() && (min_cpu == min_all || min_mem == min_all) {
        return min_all.map(str::to_string);
    }
    min_cpu.map(str::to_string)
}

/// Whether the candidate's workload fits on the remaining nodes
///
/// Each pod must fit strictly within the largest available CPU and the
/// largest available memory among the remaining nodes, and the summed
/// demand must stay strictly below the summed availability.
pub fn relocation_feasible(
    candidate: &str,
    samples: &[UtilizationSample],
    pods: &[PodUtilization],
) -> bool {
    let remaining: Vec<&UtilizationSample> =
        samples.iter().filter(|s| s.node != candidate).collect();

    let max_cpu = remaining.iter().map(|s| s.cpu_available).max();
    let max_mem = remaining.iter().map(|s| s.memory_available).max();

    let mut total_cpu = 0;
    let mut total_mem = 0;
    for pod in pods {
        if max_cpu.map_or(true, |available| available <= pod.cpu) {
            warn!(pod = %pod.pod, cpu = pod.cpu, "Cannot find node with enough cpu for pod");
            return false;
        }
        if max_mem.map_or(true, |available| available <= pod.memory) {
            warn!(pod = %pod.pod, memory = pod.memory, "Cannot find node with enough memory for pod");
            return false;
        }
        total_cpu += pod.cpu;
        total_mem += pod.memory;
    }

    let available_cpu: i64 = remaining.iter().map(|s| s.cpu_available).sum();
    let available_mem: i64 = remaining.iter().map(|s| s.memory_available).sum();
    if total_cpu >= available_cpu || total_mem >= available_mem {
        info!(
            node = %candidate,
            total_cpu,
            total_mem,
            available_cpu,
            available_mem,
            "Node group does not have resources for scheduling pods from node"
        );
        return false;
    }
    true
}
