//! FilterPolicy object
//!
//! A namespaced include/exclude list over clusters, applied to every job
//! in the namespace whose labels match the policy's selector.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::object::meta::{Condition, ObjectMeta};

/// Cluster include/exclude lists
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ClusterFilter {
    /// Clusters the job may run on; empty means all
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include: Vec<String>,
    /// Clusters the job may never run on
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude: Vec<String>,
}

impl ClusterFilter {
    /// Whether a cluster passes this filter
    pub fn allows(&self, cluster: &str) -> bool {
        if self.exclude.iter().any(|c| c == cluster) {
            return false;
        }
        self.include.is_empty() || self.include.iter().any(|c| c == cluster)
    }
}

/// Specification of a FilterPolicy
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct FilterPolicySpec {
    /// Cluster include/exclude lists
    #[serde(default)]
    pub cluster_filter: ClusterFilter,
    /// Jobs whose labels contain this selector are governed by the policy;
    /// an empty selector matches every job in the namespace
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels_selector: BTreeMap<String, String>,
}

impl FilterPolicySpec {
    pub fn validate(&self) -> Result<()> {
        if self.labels_selector.keys().any(|k| k.trim().is_empty()) {
            return Err(Error::invalid_field(
                "FilterPolicy",
                "spec.labels_selector",
                "label keys cannot be empty",
            ));
        }
        Ok(())
    }
}

/// FilterPolicy phases; a stored policy is always in force
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum FilterPolicyPhase {
    #[default]
    Active,
}

/// Status of a FilterPolicy
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct FilterPolicyStatus {
    #[serde(default)]
    pub status: FilterPolicyPhase,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/// FilterPolicy object
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct FilterPolicy {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: FilterPolicySpec,
    #[serde(default)]
    pub status: FilterPolicyStatus,
}

impl FilterPolicy {
    /// Whether this policy governs a job with the given labels
    pub fn governs(&self, job_labels: &BTreeMap<String, String>) -> bool {
        !self.spec.labels_selector.is_empty()
            && crate::labels::match_labels(job_labels, &self.spec.labels_selector)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exclude_wins_over_include() {
        let filter = ClusterFilter {
            include: vec!["c1".to_string(), "c2".to_string()],
            exclude: vec!["c2".to_string()],
        };
        assert!(filter.allows("c1"));
        assert!(!filter.allows("c2"));
        assert!(!filter.allows("c3"));
    }

    #[test]
    fn test_empty_include_allows_all_but_excluded() {
        let filter = ClusterFilter {
            include: vec![],
            exclude: vec!["c2".to_string()],
        };
        assert!(filter.allows("c1"));
        assert!(!filter.allows("c2"));
    }

    #[test]
    fn test_governs_requires_selector_subset() {
        let mut policy = FilterPolicy::default();
        policy
            .spec
            .labels_selector
            .insert("tier".to_string(), "batch".to_string());

        let matching = BTreeMap::from([
            ("tier".to_string(), "batch".to_string()),
            ("team".to_string(), "ml".to_string()),
        ]);
        let other = BTreeMap::from([("tier".to_string(), "serving".to_string())]);
        assert!(policy.governs(&matching));
        assert!(!policy.governs(&other));
    }
}
