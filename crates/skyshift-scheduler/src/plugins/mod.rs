//! Scheduler plugin pipeline
//!
//! Plugins are a registered set selectable by name in configuration.
//! Each plugin may filter (reject clusters a job cannot run on) and
//! score (rank the survivors). Each plugin's score is a factor in
//! [0, 100]; the pipeline composes factors multiplicatively, so the
//! preference weight scales the capacity score rather than adding to it.

pub mod cluster_affinity;
pub mod default_plugin;

use serde::{Deserialize, Serialize};

use skyshift_common::object::{Cluster, FilterPolicy, Job};
use skyshift_common::{Error, Result};

pub use cluster_affinity::ClusterAffinityPlugin;
pub use default_plugin::DefaultPlugin;

/// How the stanzas of `placement.filters` compose.
///
/// The documented intent is OR (a cluster passes when any stanza
/// matches); AND is available for configurations that relied on the
/// stricter reading.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FilterComposition {
    #[default]
    Or,
    And,
}

impl std::str::FromStr for FilterComposition {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "or" => Ok(Self::Or),
            "and" => Ok(Self::And),
            _ => Err(Error::invalid(
                "SchedulerConfig",
                format!("invalid filter composition '{s}', expected 'or' or 'and'"),
            )),
        }
    }
}

/// Read-only context shared by every plugin invocation for one job
pub struct ScheduleContext {
    /// Filter policies in the job's namespace
    pub policies: Vec<FilterPolicy>,
    /// Stanza composition for `placement.filters`
    pub composition: FilterComposition,
}

/// A filter plugin's answer for one cluster
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Verdict {
    /// The cluster may hold replicas of the job
    Schedulable,
    /// The cluster is rejected, with the reason
    Unschedulable(String),
}

impl Verdict {
    /// Whether the cluster survived the filter
    pub fn is_schedulable(&self) -> bool {
        matches!(self, Verdict::Schedulable)
    }
}

/// One stage of the filter/score pipeline.
///
/// Implementations are pure over their inputs: the same snapshot always
/// yields the same verdicts and scores.
pub trait SchedulerPlugin: Send + Sync {
    /// Registry name of the plugin
    fn name(&self) -> &'static str;

    /// Reject clusters the job cannot run on
    fn filter(&self, _job: &Job, _cluster: &Cluster, _ctx: &ScheduleContext) -> Verdict {
        Verdict::Schedulable
    }

    /// Score every candidate at once, each a factor in [0, 100] where
    /// 100 is neutral.
    ///
    /// Scoring the whole set lets plugins normalize against the best
    /// candidate without reaching outside the snapshot.
    fn score_all(&self, _job: &Job, clusters: &[Cluster], _ctx: &ScheduleContext) -> Vec<u32> {
        vec![100; clusters.len()]
    }
}

/// Build the plugin pipeline from configured names
pub fn build_plugins(names: &[String]) -> Result<Vec<Box<dyn SchedulerPlugin>>> {
    names
        .iter()
        .map(|name| match name.as_str() {
            "default" => Ok(Box::new(DefaultPlugin) as Box<dyn SchedulerPlugin>),
            "cluster-affinity" => {
                Ok(Box::new(ClusterAffinityPlugin) as Box<dyn SchedulerPlugin>)
            }
            other => Err(Error::invalid(
                "SchedulerConfig",
                format!("unknown scheduler plugin '{other}'"),
            )),
        })
        .collect()
}

/// The default pipeline: capacity filter/score plus placement policy
pub fn default_plugin_names() -> Vec<String> {
    vec!["default".to_string(), "cluster-affinity".to_string()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_resolves_known_plugins() {
        let plugins = build_plugins(&default_plugin_names()).unwrap();
        assert_eq!(plugins.len(), 2);
        assert_eq!(plugins[0].name(), "default");
        assert_eq!(plugins[1].name(), "cluster-affinity");
    }

    #[test]
    fn test_registry_rejects_unknown_plugin() {
        assert!(build_plugins(&["reflection".to_string()]).is_err());
    }

    #[test]
    fn test_filter_composition_parse() {
        assert_eq!("or".parse::<FilterComposition>().unwrap(), FilterComposition::Or);
        assert_eq!("AND".parse::<FilterComposition>().unwrap(), FilterComposition::And);
        assert!("xor".parse::<FilterComposition>().is_err());
    }
}
