//! Default capacity plugin
//!
//! Filters out clusters whose allocatable capacity cannot hold even one
//! replica, and scores survivors by free CPU, memory and accelerators,
//! normalized against the best candidate in the snapshot.

use skyshift_common::object::{Cluster, Job};
use skyshift_common::resources;

use super::{ScheduleContext, SchedulerPlugin, Verdict};

/// Capacity-based filter and score
pub struct DefaultPlugin;

/// Free-resource weight of one cluster: CPUs + memory (in GB-equivalents)
/// + 10x accelerators.
fn resource_weight(cluster: &Cluster) -> f64 {
    let alloc = &cluster.status.allocatable_capacity;
    let cpus = resources::total_of(alloc, resources::CPUS);
    let memory_gb = resources::total_of(alloc, resources::MEMORY) / 1024.0;
    let accels = resources::total_accelerators(alloc);
    cpus + memory_gb + 10.0 * accels
}

impl SchedulerPlugin for DefaultPlugin {
    fn name(&self) -> &'static str {
        "default"
    }

    fn filter(&self, job: &Job, cluster: &Cluster, _ctx: &ScheduleContext) -> Verdict {
        let fits_one = cluster
            .status
            .allocatable_capacity
            .values()
            .any(|node| resources::fits(node, &job.spec.resources));
        if fits_one {
            Verdict::Schedulable
        } else {
            Verdict::Unschedulable(format!(
                "cluster '{}' lacks capacity for one replica",
                cluster.metadata.name
            ))
        }
    }

    fn score_all(&self, _job: &Job, clusters: &[Cluster], _ctx: &ScheduleContext) -> Vec<u32> {
        let weights: Vec<f64> = clusters.iter().map(resource_weight).collect();
        let max = weights.iter().cloned().fold(0.0_f64, f64::max);
        if max <= 0.0 {
            return vec![0; clusters.len()];
        }
        weights
            .iter()
            .map(|w| ((w / max) * 100.0).round() as u32)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skyshift_common::object::{ManagerType, ObjectMeta};
    use std::collections::BTreeMap;

    fn cluster(name: &str, cpus: f64, memory: f64) -> Cluster {
        let mut c = Cluster::new(name, ManagerType::K8);
        c.metadata = ObjectMeta::named(name);
        let node = BTreeMap::from([
            ("cpus".to_string(), cpus),
            ("memory".to_string(), memory),
        ]);
        c.status.capacity.insert("node-0".to_string(), node.clone());
        c.status.allocatable_capacity.insert("node-0".to_string(), node);
        c
    }

    fn job(cpus: f64) -> Job {
        let mut job = Job::default();
        job.spec.resources.insert("cpus".to_string(), cpus);
        job
    }

    fn ctx() -> ScheduleContext {
        ScheduleContext {
            policies: vec![],
            composition: Default::default(),
        }
    }

    #[test]
    fn test_filter_requires_room_for_one_replica() {
        let plugin = DefaultPlugin;
        let small = cluster("small", 1.0, 1024.0);
        let big = cluster("big", 8.0, 16384.0);
        let job = job(2.0);

        assert!(!plugin.filter(&job, &small, &ctx()).is_schedulable());
        assert!(plugin.filter(&job, &big, &ctx()).is_schedulable());
    }

    #[test]
    fn test_scores_normalize_to_best_candidate() {
        let plugin = DefaultPlugin;
        let clusters = vec![cluster("half", 4.0, 8192.0), cluster("full", 8.0, 16384.0)];
        let scores = plugin.score_all(&job(1.0), &clusters, &ctx());
        assert_eq!(scores[1], 100);
        assert_eq!(scores[0], 50);
    }

    #[test]
    fn test_empty_capacity_scores_zero() {
        let plugin = DefaultPlugin;
        let clusters = vec![cluster("empty", 0.0, 0.0)];
        assert_eq!(plugin.score_all(&job(1.0), &clusters, &ctx()), vec![0]);
    }
}
