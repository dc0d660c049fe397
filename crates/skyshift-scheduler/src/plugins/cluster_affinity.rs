//! Cluster affinity plugin
//!
//! Enforces placement policy: every FilterPolicy in the job's namespace
//! that governs the job must allow the cluster, and when the job carries
//! `placement.filters` the cluster must satisfy them (stanzas compose
//! disjunctively by default). Scoring grants each cluster the single
//! highest matching preference weight (`DEFAULT_MIN_WEIGHT` when none
//! match), normalized against the highest weight in the list so the
//! factor lands in [0, 100].

use skyshift_common::object::{Cluster, Job, DEFAULT_MIN_WEIGHT};

use super::{FilterComposition, ScheduleContext, SchedulerPlugin, Verdict};

/// Placement policy filter and preference score
pub struct ClusterAffinityPlugin;

impl SchedulerPlugin for ClusterAffinityPlugin {
    fn name(&self) -> &'static str {
        "cluster-affinity"
    }

    fn filter(&self, job: &Job, cluster: &Cluster, ctx: &ScheduleContext) -> Verdict {
        let cluster_name = &cluster.metadata.name;

        // Namespace-wide filter policies governing this job.
        for policy in &ctx.policies {
            if !policy.governs(&job.metadata.labels) {
                continue;
            }
            if !policy.spec.cluster_filter.allows(cluster_name) {
                return Verdict::Unschedulable(format!(
                    "cluster '{}' rejected by filter policy '{}'",
                    cluster_name, policy.metadata.name
                ));
            }
        }

        // The job's own placement filters.
        let filters = &job.spec.placement.filters;
        if filters.is_empty() {
            return Verdict::Schedulable;
        }
        let satisfied = match ctx.composition {
            FilterComposition::Or => filters.iter().any(|f| f.matches(&cluster.metadata.labels)),
            FilterComposition::And => filters.iter().all(|f| f.matches(&cluster.metadata.labels)),
        };
        if satisfied {
            Verdict::Schedulable
        } else {
            Verdict::Unschedulable(format!(
                "cluster '{}' does not satisfy placement filters",
                cluster_name
            ))
        }
    }

    fn score_all(&self, job: &Job, clusters: &[Cluster], _ctx: &ScheduleContext) -> Vec<u32> {
        let preferences = &job.spec.placement.preferences;
        // Weights normalize against the list's highest weight whether or
        // not any cluster matches it; with no preferences at all every
        // cluster gets the neutral factor.
        let highest = preferences
            .iter()
            .map(|pref| pref.weight)
            .max()
            .unwrap_or(DEFAULT_MIN_WEIGHT)
            .max(DEFAULT_MIN_WEIGHT);

        clusters
            .iter()
            .map(|cluster| {
                let matched = preferences
                    .iter()
                    .filter(|pref| pref.matches(&cluster.metadata.labels))
                    .map(|pref| pref.weight)
                    .max()
                    .unwrap_or(DEFAULT_MIN_WEIGHT);
                ((f64::from(matched) * 100.0) / f64::from(highest)).round() as u32
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skyshift_common::labels::{LabelOperator, MatchExpression};
    use skyshift_common::object::{
        ClusterFilter, FilterPolicy, FilterSpec, ManagerType, ObjectMeta, PreferenceSpec,
    };
    use std::collections::BTreeMap;

    fn cluster(name: &str, labels: &[(&str, &str)]) -> Cluster {
        let mut c = Cluster::new(name, ManagerType::K8);
        c.metadata.labels = labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        c
    }

    fn job_with_labels(labels: &[(&str, &str)]) -> Job {
        let mut job = Job {
            metadata: ObjectMeta::namespaced("j", "default"),
            ..Default::default()
        };
        job.metadata.labels = labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        job
    }

    fn ctx_with(policies: Vec<FilterPolicy>, composition: FilterComposition) -> ScheduleContext {
        ScheduleContext {
            policies,
            composition,
        }
    }

    fn excluding_policy(selector: &[(&str, &str)], exclude: &[&str]) -> FilterPolicy {
        let mut policy = FilterPolicy {
            metadata: ObjectMeta::namespaced("policy", "default"),
            ..Default::default()
        };
        policy.spec.labels_selector = selector
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        policy.spec.cluster_filter = ClusterFilter {
            include: vec![],
            exclude: exclude.iter().map(|s| s.to_string()).collect(),
        };
        policy
    }

    #[test]
    fn test_filter_policy_excludes_cluster() {
        let plugin = ClusterAffinityPlugin;
        let job = job_with_labels(&[("tier", "batch")]);
        let policy = excluding_policy(&[("tier", "batch")], &["c2"]);
        let ctx = ctx_with(vec![policy], FilterComposition::Or);

        assert!(plugin.filter(&job, &cluster("c1", &[]), &ctx).is_schedulable());
        assert!(!plugin.filter(&job, &cluster("c2", &[]), &ctx).is_schedulable());
    }

    #[test]
    fn test_policy_ignores_jobs_outside_selector() {
        let plugin = ClusterAffinityPlugin;
        let job = job_with_labels(&[("tier", "serving")]);
        let policy = excluding_policy(&[("tier", "batch")], &["c2"]);
        let ctx = ctx_with(vec![policy], FilterComposition::Or);

        assert!(plugin.filter(&job, &cluster("c2", &[]), &ctx).is_schedulable());
    }

    #[test]
    fn test_placement_filters_or_composition() {
        let plugin = ClusterAffinityPlugin;
        let mut job = job_with_labels(&[]);
        job.spec.placement.filters = vec![
            FilterSpec {
                name: "dev".to_string(),
                match_labels: BTreeMap::from([("purpose".to_string(), "dev".to_string())]),
                match_expressions: vec![],
            },
            FilterSpec {
                name: "west".to_string(),
                match_labels: BTreeMap::new(),
                match_expressions: vec![MatchExpression {
                    key: "region".to_string(),
                    operator: LabelOperator::In,
                    values: vec!["us-west".to_string()],
                }],
            },
        ];
        let ctx = ctx_with(vec![], FilterComposition::Or);

        // Matching either stanza is enough under OR...
        assert!(plugin
            .filter(&job, &cluster("c1", &[("purpose", "dev")]), &ctx)
            .is_schedulable());
        assert!(plugin
            .filter(&job, &cluster("c2", &[("region", "us-west")]), &ctx)
            .is_schedulable());
        assert!(!plugin.filter(&job, &cluster("c3", &[]), &ctx).is_schedulable());

        // ...but AND composition demands both.
        let strict = ctx_with(vec![], FilterComposition::And);
        assert!(!plugin
            .filter(&job, &cluster("c1", &[("purpose", "dev")]), &strict)
            .is_schedulable());
        assert!(plugin
            .filter(
                &job,
                &cluster("c4", &[("purpose", "dev"), ("region", "us-west")]),
                &strict
            )
            .is_schedulable());
    }

    #[test]
    fn test_preference_scores_highest_matching_weight() {
        let plugin = ClusterAffinityPlugin;
        let mut job = job_with_labels(&[]);
        job.spec.placement.preferences = vec![
            PreferenceSpec {
                name: "dev".to_string(),
                match_labels: BTreeMap::from([("purpose".to_string(), "dev".to_string())]),
                match_expressions: vec![],
                weight: 100,
            },
            PreferenceSpec {
                name: "dev-lower".to_string(),
                match_labels: BTreeMap::from([("purpose".to_string(), "dev".to_string())]),
                match_expressions: vec![],
                weight: 40,
            },
        ];
        let clusters = vec![
            cluster("labeled", &[("purpose", "dev")]),
            cluster("plain", &[]),
        ];
        let ctx = ctx_with(vec![], FilterComposition::Or);

        // Highest matching weight wins, no summation; unmatched get the floor.
        let scores = plugin.score_all(&job, &clusters, &ctx);
        assert_eq!(scores, vec![100, DEFAULT_MIN_WEIGHT]);
    }

    #[test]
    fn test_weights_normalize_against_the_lists_highest() {
        let plugin = ClusterAffinityPlugin;
        let mut job = job_with_labels(&[]);
        job.spec.placement.preferences = vec![
            PreferenceSpec {
                name: "dev".to_string(),
                match_labels: BTreeMap::from([("purpose".to_string(), "dev".to_string())]),
                match_expressions: vec![],
                weight: 10,
            },
            PreferenceSpec {
                name: "prod".to_string(),
                match_labels: BTreeMap::from([("purpose".to_string(), "prod".to_string())]),
                match_expressions: vec![],
                weight: 40,
            },
        ];
        let clusters = vec![
            cluster("dev", &[("purpose", "dev")]),
            cluster("prod", &[("purpose", "prod")]),
            cluster("plain", &[]),
        ];
        let ctx = ctx_with(vec![], FilterComposition::Or);

        // 10/40 and 40/40 scale into [0, 100]; raw weights would read
        // [10, 40, 1] here.
        let scores = plugin.score_all(&job, &clusters, &ctx);
        assert_eq!(scores, vec![25, 100, 3]);
    }

    #[test]
    fn test_no_preferences_yields_the_neutral_factor() {
        let plugin = ClusterAffinityPlugin;
        let job = job_with_labels(&[]);
        let clusters = vec![cluster("c1", &[]), cluster("c2", &[])];
        let ctx = ctx_with(vec![], FilterComposition::Or);
        // Without preferences the plugin must not skew the capacity score.
        assert_eq!(plugin.score_all(&job, &clusters, &ctx), vec![100, 100]);
    }
}
