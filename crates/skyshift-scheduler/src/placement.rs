//! The placement computation: filter, score, spread
//!
//! Pure over its inputs: given the same job and cluster snapshot the
//! allocation is identical, with ties broken by score then lexicographic
//! cluster name.

use std::collections::BTreeMap;

use tracing::debug;

use skyshift_common::object::{Cluster, Job};
use skyshift_common::resources;
use skyshift_common::Result;

use crate::plugins::{
    build_plugins, FilterComposition, ScheduleContext, SchedulerPlugin, Verdict,
};

/// Outcome of one placement computation
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlacementOutcome {
    /// cluster name → replicas newly allocated there
    pub allocation: BTreeMap<String, u32>,
    /// Replicas that found no capacity
    pub unplaced: u32,
    /// Why clusters were rejected, for the Unschedulable condition
    pub rejections: Vec<String>,
}

impl PlacementOutcome {
    /// Whether every requested replica found a cluster
    pub fn complete(&self) -> bool {
        self.unplaced == 0
    }

    /// Whether nothing could be placed at all
    pub fn empty(&self) -> bool {
        self.allocation.is_empty()
    }
}

/// The filter → score → spread pipeline over one snapshot
pub struct Placer {
    plugins: Vec<Box<dyn SchedulerPlugin>>,
    composition: FilterComposition,
}

impl Placer {
    /// Build a placer from configured plugin names
    pub fn new(plugin_names: &[String], composition: FilterComposition) -> Result<Self> {
        Ok(Self {
            plugins: build_plugins(plugin_names)?,
            composition,
        })
    }

    /// Compute where `replicas` new replicas of `job` should go, given
    /// the READY clusters and the namespace's filter policies.
    pub fn place(
        &self,
        job: &Job,
        replicas: u32,
        clusters: &[Cluster],
        policies: Vec<skyshift_common::object::FilterPolicy>,
    ) -> PlacementOutcome {
        let ctx = ScheduleContext {
            policies,
            composition: self.composition,
        };

        // Filter pipeline: every plugin must accept the cluster.
        let mut rejections = Vec::new();
        let eligible: Vec<Cluster> = clusters
            .iter()
            .filter(|cluster| {
                for plugin in &self.plugins {
                    if let Verdict::Unschedulable(reason) = plugin.filter(job, cluster, &ctx) {
                        rejections.push(reason);
                        return false;
                    }
                }
                true
            })
            .cloned()
            .collect();

        if eligible.is_empty() {
            return PlacementOutcome {
                allocation: BTreeMap::new(),
                unplaced: replicas,
                rejections,
            };
        }

        // Score pipeline: every plugin contributes a factor in [0, 100]
        // and factors compose multiplicatively, so the preference weight
        // gates the capacity score instead of competing with it. The
        // neutral factor is 100.
        let mut factors = vec![100.0_f64; eligible.len()];
        for plugin in &self.plugins {
            let scores = plugin.score_all(job, &eligible, &ctx);
            for (factor, score) in factors.iter_mut().zip(scores) {
                *factor = *factor * f64::from(score) / 100.0;
            }
        }
        let totals: Vec<u32> = factors.iter().map(|f| f.round() as u32).collect();

        // Rank by score descending, name ascending for determinism.
        let mut ranked: Vec<(&Cluster, u32)> =
            eligible.iter().zip(totals.into_iter()).collect();
        ranked.sort_by(|(a, sa), (b, sb)| {
            sb.cmp(sa).then_with(|| a.metadata.name.cmp(&b.metadata.name))
        });
        debug!(
            job = %job.metadata.name,
            ranking = ?ranked
                .iter()
                .map(|(c, s)| (c.metadata.name.as_str(), *s))
                .collect::<Vec<_>>(),
            "ranked clusters"
        );

        // Spread: greedy fill, highest score first.
        let mut allocation = BTreeMap::new();
        let mut remaining = replicas;
        for (cluster, _) in &ranked {
            if remaining == 0 {
                break;
            }
            let capacity = resources::replica_capacity(
                &cluster.status.allocatable_capacity,
                &job.spec.resources,
            );
            let take = remaining.min(capacity);
            if take > 0 {
                allocation.insert(cluster.metadata.name.clone(), take);
                remaining -= take;
            }
        }

        PlacementOutcome {
            allocation,
            unplaced: remaining,
            rejections,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::default_plugin_names;
    use skyshift_common::object::{
        ClusterFilter, FilterPolicy, ManagerType, ObjectMeta, PreferenceSpec,
    };

    fn cluster(name: &str, cpus: f64, memory: f64) -> Cluster {
        let mut c = Cluster::new(name, ManagerType::K8);
        let node = BTreeMap::from([
            ("cpus".to_string(), cpus),
            ("memory".to_string(), memory),
        ]);
        c.status.capacity.insert("node-0".to_string(), node.clone());
        c.status.allocatable_capacity.insert("node-0".to_string(), node);
        c
    }

    fn labeled(mut c: Cluster, key: &str, value: &str) -> Cluster {
        c.metadata.labels.insert(key.to_string(), value.to_string());
        c
    }

    fn job(name: &str, replicas: u32, cpus: f64) -> Job {
        let mut job = Job {
            metadata: ObjectMeta::namespaced(name, "default"),
            ..Default::default()
        };
        job.spec.replicas = replicas;
        job.spec.resources.insert("cpus".to_string(), cpus);
        job
    }

    fn placer() -> Placer {
        Placer::new(&default_plugin_names(), FilterComposition::Or).unwrap()
    }

    #[test]
    fn test_single_cluster_placement() {
        // S1: one cluster with 2 CPUs, a 1-replica 1-CPU job lands on it.
        let outcome = placer().place(
            &job("j1", 1, 1.0),
            1,
            &[cluster("c1", 2.0, 8192.0)],
            vec![],
        );
        assert!(outcome.complete());
        assert_eq!(outcome.allocation, BTreeMap::from([("c1".to_string(), 1)]));
    }

    #[test]
    fn test_spread_across_equal_clusters_is_deterministic() {
        // S2: two 2-CPU clusters, 4 one-CPU replicas -> {c1: 2, c2: 2},
        // tie broken toward c1 regardless of input order.
        let clusters = vec![cluster("c2", 2.0, 8192.0), cluster("c1", 2.0, 8192.0)];
        let outcome = placer().place(&job("j2", 4, 1.0), 4, &clusters, vec![]);
        assert!(outcome.complete());
        assert_eq!(
            outcome.allocation,
            BTreeMap::from([("c1".to_string(), 2), ("c2".to_string(), 2)])
        );
    }

    #[test]
    fn test_filter_policy_beats_capacity() {
        // S3: policy excludes c2; the job lands on c1 even though c2 has
        // more free CPU.
        let mut policy = FilterPolicy {
            metadata: ObjectMeta::namespaced("deny-c2", "default"),
            ..Default::default()
        };
        policy
            .spec
            .labels_selector
            .insert("tier".to_string(), "batch".to_string());
        policy.spec.cluster_filter = ClusterFilter {
            include: vec![],
            exclude: vec!["c2".to_string()],
        };

        let mut j = job("j3", 1, 1.0);
        j.metadata
            .labels
            .insert("tier".to_string(), "batch".to_string());

        let clusters = vec![cluster("c1", 2.0, 4096.0), cluster("c2", 16.0, 65536.0)];
        let outcome = placer().place(&j, 1, &clusters, vec![policy]);
        assert_eq!(outcome.allocation, BTreeMap::from([("c1".to_string(), 1)]));
        assert!(!outcome.rejections.is_empty());
    }

    #[test]
    fn test_preference_weight_drives_choice() {
        // S4: c1 labeled purpose=dev with weight 100 wins over an
        // unlabeled c2.
        let mut j = job("j4", 1, 1.0);
        j.spec.placement.preferences.push(PreferenceSpec {
            name: "dev".to_string(),
            match_labels: BTreeMap::from([("purpose".to_string(), "dev".to_string())]),
            match_expressions: vec![],
            weight: 100,
        });

        let clusters = vec![
            labeled(cluster("c1", 2.0, 4096.0), "purpose", "dev"),
            cluster("c2", 4.0, 8192.0),
        ];
        let outcome = placer().place(&j, 1, &clusters, vec![]);
        assert_eq!(outcome.allocation, BTreeMap::from([("c1".to_string(), 1)]));
    }

    #[test]
    fn test_preference_factor_gates_the_capacity_score() {
        // Base scores 100 vs 60; normalized preference factors 25 vs 100
        // (weights 10 and 40). The product ranks the smaller cluster
        // first (25 vs 60); an additive or unnormalized combination
        // would rank the big cluster first (110 vs 100).
        let mut j = job("j", 1, 1.0);
        j.spec.placement.preferences = vec![
            PreferenceSpec {
                name: "big-pref".to_string(),
                match_labels: BTreeMap::from([("purpose".to_string(), "big".to_string())]),
                match_expressions: vec![],
                weight: 10,
            },
            PreferenceSpec {
                name: "small-pref".to_string(),
                match_labels: BTreeMap::from([("purpose".to_string(), "small".to_string())]),
                match_expressions: vec![],
                weight: 40,
            },
        ];

        let clusters = vec![
            labeled(cluster("big", 10.0, 0.0), "purpose", "big"),
            labeled(cluster("small", 6.0, 0.0), "purpose", "small"),
        ];
        let outcome = placer().place(&j, 1, &clusters, vec![]);
        assert_eq!(outcome.allocation, BTreeMap::from([("small".to_string(), 1)]));
    }

    #[test]
    fn test_partial_placement_reports_remainder() {
        let outcome = placer().place(
            &job("big", 5, 1.0),
            5,
            &[cluster("c1", 2.0, 8192.0)],
            vec![],
        );
        assert!(!outcome.complete());
        assert_eq!(outcome.allocation, BTreeMap::from([("c1".to_string(), 2)]));
        assert_eq!(outcome.unplaced, 3);
    }

    #[test]
    fn test_no_eligible_cluster() {
        let outcome = placer().place(
            &job("heavy", 1, 64.0),
            1,
            &[cluster("c1", 2.0, 8192.0)],
            vec![],
        );
        assert!(outcome.empty());
        assert_eq!(outcome.unplaced, 1);
        assert!(!outcome.rejections.is_empty());
    }

    #[test]
    fn test_same_snapshot_same_allocation() {
        // Determinism: repeated runs over one snapshot agree.
        let clusters = vec![
            cluster("b", 4.0, 8192.0),
            cluster("a", 4.0, 8192.0),
            cluster("c", 4.0, 8192.0),
        ];
        let j = job("j", 6, 1.0);
        let p = placer();
        let first = p.place(&j, 6, &clusters, vec![]);
        let second = p.place(&j, 6, &clusters, vec![]);
        assert_eq!(first, second);
    }
}
