//! Job object
//!
//! A Job is a group of identical container replicas spread across one or
//! more clusters. The scheduler writes the spread into
//! `status.replica_status`; skylets reconcile each cluster slice against
//! their backend and report per-replica states back.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::labels::MatchExpression;
use crate::object::meta::{push_condition, Condition, ObjectMeta};
use crate::resources::{self, ResourceMap};

/// Lowest preference weight, assigned to clusters no preference matches
pub const DEFAULT_MIN_WEIGHT: u32 = 1;
/// Highest preference weight
pub const DEFAULT_MAX_WEIGHT: u32 = 100;

/// Default container image for jobs that do not name one
pub const DEFAULT_IMAGE: &str = "ubuntu:latest";

/// Aggregate lifecycle of a job
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobPhase {
    /// Newly created, not yet examined by the scheduler
    #[default]
    Init,
    /// Every replica has a cluster slice
    Scheduled,
    /// Waiting for capacity (possibly with a partial placement)
    Pending,
    /// At least one replica is running
    Running,
    /// All replicas finished successfully
    Complete,
    /// The job failed
    Failed,
}

impl std::fmt::Display for JobPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Init => "INIT",
            Self::Scheduled => "SCHEDULED",
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Complete => "COMPLETE",
            Self::Failed => "FAILED",
        };
        write!(f, "{s}")
    }
}

/// State of the replicas within one cluster slice
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum ReplicaState {
    /// Slice assigned, nothing submitted yet
    Init,
    /// Submitted, waiting on the backend
    Pending,
    /// Running on the backend
    Running,
    /// Finished successfully
    Completed,
    /// Failed on the backend
    Failed,
    /// Evicted by the flow controller
    Evicted,
    /// Being removed
    Deleted,
}

impl std::fmt::Display for ReplicaState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Init => "INIT",
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Evicted => "EVICTED",
            Self::Deleted => "DELETED",
        };
        write!(f, "{s}")
    }
}

/// Restart policy applied per cluster slice
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub enum RestartPolicy {
    /// Restart on any exit
    #[default]
    Always,
    /// Never restart
    Never,
    /// Restart only on failure
    OnFailure,
}

/// Image pull behavior handed to the backend
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub enum ImagePullPolicy {
    /// Pull on every start
    Always,
    /// Pull only when absent locally
    #[default]
    IfNotPresent,
    /// Never pull
    Never,
}

/// A volume mounted into every replica
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct VolumeSpec {
    /// Path inside the container
    pub mount_path: String,
    /// Host path to bind, when the backend supports it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_path: Option<String>,
}

/// One filter stanza of a placement policy.
///
/// All `match_labels` AND all `match_expressions` must hold for the stanza
/// to match; stanzas within `placement.filters` compose disjunctively.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct FilterSpec {
    /// Stanza name, unique within the list
    pub name: String,
    /// Labels the cluster must carry
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub match_labels: BTreeMap<String, String>,
    /// Expressions the cluster's labels must satisfy
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_expressions: Vec<MatchExpression>,
}

impl FilterSpec {
    /// Evaluate this stanza against a cluster's labels
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        crate::labels::match_labels(labels, &self.match_labels)
            && crate::labels::match_expressions(labels, &self.match_expressions)
    }

    fn validate(&self, field: &str) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::invalid_field("Job", field, "stanza requires a `name`"));
        }
        if self.match_labels.is_empty() && self.match_expressions.is_empty() {
            return Err(Error::invalid_field(
                "Job",
                field,
                format!(
                    "stanza '{}' must contain at least one criterion (`match_labels` or `match_expressions`)",
                    self.name
                ),
            ));
        }
        if self.match_labels.keys().any(|k| k.trim().is_empty()) {
            return Err(Error::invalid_field("Job", field, "label keys cannot be empty"));
        }
        Ok(())
    }
}

/// One preference stanza: a filter plus a weight
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PreferenceSpec {
    /// Stanza name, unique within the list
    pub name: String,
    /// Labels the cluster must carry
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub match_labels: BTreeMap<String, String>,
    /// Expressions the cluster's labels must satisfy
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_expressions: Vec<MatchExpression>,
    /// Weight granted when the stanza matches, in [1, 100]
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    DEFAULT_MIN_WEIGHT
}

impl PreferenceSpec {
    /// Evaluate this stanza against a cluster's labels
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        crate::labels::match_labels(labels, &self.match_labels)
            && crate::labels::match_expressions(labels, &self.match_expressions)
    }
}

/// Placement policy: filters restrict, preferences rank
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Placement {
    /// Filter stanzas; a cluster must satisfy at least one (OR) when any exist
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filters: Vec<FilterSpec>,
    /// Preference stanzas; the highest matching weight wins
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub preferences: Vec<PreferenceSpec>,
}

impl Placement {
    fn validate(&self) -> Result<()> {
        let mut names = std::collections::BTreeSet::new();
        for filter in &self.filters {
            filter.validate("spec.placement.filters")?;
            if !names.insert(&filter.name) {
                return Err(Error::invalid_field(
                    "Job",
                    "spec.placement.filters",
                    format!("duplicate filter name '{}'", filter.name),
                ));
            }
        }
        let mut names = std::collections::BTreeSet::new();
        for pref in &self.preferences {
            if pref.name.trim().is_empty() {
                return Err(Error::invalid_field(
                    "Job",
                    "spec.placement.preferences",
                    "stanza requires a `name`",
                ));
            }
            if pref.match_labels.is_empty() && pref.match_expressions.is_empty() {
                return Err(Error::invalid_field(
                    "Job",
                    "spec.placement.preferences",
                    format!("stanza '{}' must contain at least one criterion", pref.name),
                ));
            }
            if !(DEFAULT_MIN_WEIGHT..=DEFAULT_MAX_WEIGHT).contains(&pref.weight) {
                return Err(Error::invalid_field(
                    "Job",
                    "spec.placement.preferences",
                    format!(
                        "preference weight must be within {DEFAULT_MIN_WEIGHT}-{DEFAULT_MAX_WEIGHT}"
                    ),
                ));
            }
            if !names.insert(&pref.name) {
                return Err(Error::invalid_field(
                    "Job",
                    "spec.placement.preferences",
                    format!("duplicate preference name '{}'", pref.name),
                ));
            }
        }
        Ok(())
    }
}

/// Specification of a Job
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct JobSpec {
    /// Container image
    #[serde(default = "default_image")]
    pub image: String,

    /// Image pull behavior
    #[serde(default)]
    pub image_pull_policy: ImagePullPolicy,

    /// Environment variables for every replica
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub envs: BTreeMap<String, String>,

    /// Ports every replica listens on
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<u16>,

    /// Resource request per replica
    #[serde(default = "resources::default_job_resources")]
    pub resources: ResourceMap,

    /// Command executed in the container
    #[serde(default)]
    pub run: String,

    /// Number of replicas across all clusters
    #[serde(default = "default_replicas")]
    pub replicas: u32,

    /// Restart policy per cluster slice
    #[serde(default)]
    pub restart_policy: RestartPolicy,

    /// Volumes keyed by volume name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub volumes: BTreeMap<String, VolumeSpec>,

    /// Placement filters and preferences
    #[serde(default)]
    pub placement: Placement,
}

fn default_image() -> String {
    DEFAULT_IMAGE.to_string()
}

fn default_replicas() -> u32 {
    1
}

impl Default for JobSpec {
    fn default() -> Self {
        Self {
            image: default_image(),
            image_pull_policy: ImagePullPolicy::default(),
            envs: BTreeMap::new(),
            ports: Vec::new(),
            resources: resources::default_job_resources(),
            run: String::new(),
            replicas: 1,
            restart_policy: RestartPolicy::default(),
            volumes: BTreeMap::new(),
            placement: Placement::default(),
        }
    }
}

impl JobSpec {
    /// Validate cross-field constraints
    pub fn validate(&self) -> Result<()> {
        if self.replicas == 0 {
            return Err(Error::invalid_field(
                "Job",
                "spec.replicas",
                "job must request at least one replica",
            ));
        }
        validate_image(&self.image)?;
        for port in &self.ports {
            if *port == 0 {
                return Err(Error::invalid_field("Job", "spec.ports", "invalid port: 0"));
            }
        }
        let mut has_accelerator = false;
        let mut has_gpu = false;
        for (name, value) in &self.resources {
            if !resources::is_valid_resource(name) {
                return Err(Error::invalid_field(
                    "Job",
                    "spec.resources",
                    format!("invalid resource type '{name}'"),
                ));
            }
            if *value < 0.0 {
                return Err(Error::invalid_field(
                    "Job",
                    "spec.resources",
                    format!("negative quantity for '{name}'"),
                ));
            }
            if resources::is_accelerator(name) && *value > 0.0 {
                has_accelerator = true;
            }
            if name == resources::GPUS && *value > 0.0 {
                has_gpu = true;
            }
        }
        if has_accelerator && has_gpu {
            return Err(Error::invalid_field(
                "Job",
                "spec.resources",
                "cannot request both generic GPUs and a specific accelerator type",
            ));
        }
        for (name, volume) in &self.volumes {
            if volume.mount_path.trim().is_empty() {
                return Err(Error::invalid_field(
                    "Job",
                    "spec.volumes",
                    format!("volume '{name}' requires a mount_path"),
                ));
            }
        }
        self.placement.validate()
    }
}

/// Check image shape: `[registry/]name[:tag|@sha256:digest]`
fn validate_image(image: &str) -> Result<()> {
    if image.is_empty() {
        return Err(Error::invalid_field("Job", "spec.image", "image cannot be empty"));
    }
    let valid = image.chars().all(|c| {
        c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '/' | ':' | '@')
    });
    if !valid || image.starts_with(':') || image.ends_with(':') {
        return Err(Error::invalid_field(
            "Job",
            "spec.image",
            format!("invalid image format '{image}', expected [repository/]image[:tag]"),
        ));
    }
    Ok(())
}

/// Per-cluster replica state counters
pub type ReplicaStatusMap = BTreeMap<String, BTreeMap<ReplicaState, u32>>;

/// Status of a Job
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct JobStatus {
    /// Aggregate lifecycle phase
    #[serde(default)]
    pub status: JobPhase,

    /// Phase transition timeline
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// cluster → replica state → count
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub replica_status: ReplicaStatusMap,

    /// cluster → backend job id
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub job_ids: BTreeMap<String, String>,
}

impl JobStatus {
    /// Transition the aggregate phase, recording a condition
    pub fn set_phase(&mut self, phase: JobPhase) {
        self.status = phase;
        push_condition(&mut self.conditions, Condition::new(phase.to_string()));
    }

    /// Transition with a reason and message (e.g. Unschedulable)
    pub fn set_phase_with(&mut self, phase: JobPhase, reason: &str, message: &str) {
        self.status = phase;
        push_condition(
            &mut self.conditions,
            Condition::new(phase.to_string()).reason(reason).message(message),
        );
    }

    /// Merge replica state counts across clusters
    pub fn aggregate(&self) -> BTreeMap<ReplicaState, u32> {
        let mut merged = BTreeMap::new();
        for slice in self.replica_status.values() {
            for (state, count) in slice {
                *merged.entry(*state).or_insert(0) += count;
            }
        }
        merged
    }

    /// Total replicas currently holding a live slice (evicted and deleted
    /// replicas no longer count against the job's spec)
    pub fn placed_replicas(&self) -> u32 {
        self.replica_status
            .values()
            .flat_map(|slice| slice.iter())
            .filter(|(state, _)| !matches!(state, ReplicaState::Evicted | ReplicaState::Deleted))
            .map(|(_, count)| *count)
            .sum()
    }

    /// Replica count of one cluster's slice, zero when absent
    pub fn slice_replicas(&self, cluster: &str) -> u32 {
        self.replica_status
            .get(cluster)
            .map(|slice| slice.values().sum())
            .unwrap_or(0)
    }
}

/// Job object
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Job {
    /// Standard object metadata
    #[serde(default)]
    pub metadata: ObjectMeta,
    /// Desired state
    #[serde(default)]
    pub spec: JobSpec,
    /// Observed state
    #[serde(default)]
    pub status: JobStatus,
}

impl Job {
    /// Clusters currently holding a slice of this job
    pub fn scheduled_clusters(&self) -> Vec<String> {
        self.status.replica_status.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_job() -> Job {
        Job {
            metadata: ObjectMeta::namespaced("train", "default"),
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults_are_injected() {
        let raw = r#"{"metadata":{"name":"train","namespace":"default"}}"#;
        let job: Job = serde_json::from_str(raw).unwrap();
        assert_eq!(job.spec.image, DEFAULT_IMAGE);
        assert_eq!(job.spec.replicas, 1);
        assert_eq!(job.spec.restart_policy, RestartPolicy::Always);
        assert_eq!(job.spec.resources["cpus"], 1.0);
        assert_eq!(job.status.status, JobPhase::Init);
    }

    #[test]
    fn test_zero_replicas_rejected() {
        let mut job = minimal_job();
        job.spec.replicas = 0;
        assert!(job.spec.validate().is_err());
    }

    #[test]
    fn test_gpu_and_accelerator_are_mutually_exclusive() {
        let mut job = minimal_job();
        job.spec.resources.insert("gpus".to_string(), 1.0);
        job.spec.resources.insert("V100".to_string(), 1.0);
        assert!(job.spec.validate().is_err());

        job.spec.resources.insert("gpus".to_string(), 0.0);
        assert!(job.spec.validate().is_ok());
    }

    #[test]
    fn test_filter_stanza_requires_criteria() {
        let mut job = minimal_job();
        job.spec.placement.filters.push(FilterSpec {
            name: "empty".to_string(),
            ..Default::default()
        });
        assert!(job.spec.validate().is_err());
    }

    #[test]
    fn test_duplicate_preference_names_rejected() {
        let mut job = minimal_job();
        let pref = PreferenceSpec {
            name: "dev".to_string(),
            match_labels: BTreeMap::from([("purpose".to_string(), "dev".to_string())]),
            match_expressions: Vec::new(),
            weight: 50,
        };
        job.spec.placement.preferences.push(pref.clone());
        job.spec.placement.preferences.push(pref);
        assert!(job.spec.validate().is_err());
    }

    #[test]
    fn test_preference_weight_range() {
        let mut job = minimal_job();
        job.spec.placement.preferences.push(PreferenceSpec {
            name: "dev".to_string(),
            match_labels: BTreeMap::from([("purpose".to_string(), "dev".to_string())]),
            match_expressions: Vec::new(),
            weight: 500,
        });
        assert!(job.spec.validate().is_err());
    }

    #[test]
    fn test_aggregate_merges_cluster_slices() {
        let mut job = minimal_job();
        job.status.replica_status.insert(
            "c1".to_string(),
            BTreeMap::from([(ReplicaState::Running, 2)]),
        );
        job.status.replica_status.insert(
            "c2".to_string(),
            BTreeMap::from([(ReplicaState::Running, 1), (ReplicaState::Pending, 1)]),
        );
        let agg = job.status.aggregate();
        assert_eq!(agg[&ReplicaState::Running], 3);
        assert_eq!(agg[&ReplicaState::Pending], 1);
        assert_eq!(job.status.placed_replicas(), 4);
    }

    #[test]
    fn test_evicted_replicas_do_not_count_as_placed() {
        let mut job = minimal_job();
        job.status.replica_status.insert(
            "c1".to_string(),
            BTreeMap::from([(ReplicaState::Evicted, 2)]),
        );
        assert_eq!(job.status.placed_replicas(), 0);
        assert_eq!(job.status.slice_replicas("c1"), 2);
    }

    #[test]
    fn test_replica_state_map_serializes_with_string_keys() {
        let slice: BTreeMap<ReplicaState, u32> = BTreeMap::from([(ReplicaState::Init, 2)]);
        let json = serde_json::to_string(&slice).unwrap();
        assert_eq!(json, r#"{"INIT":2}"#);
        let back: BTreeMap<ReplicaState, u32> = serde_json::from_str(&json).unwrap();
        assert_eq!(back[&ReplicaState::Init], 2);
    }

    #[test]
    fn test_restart_policy_wire_names() {
        assert_eq!(serde_json::to_string(&RestartPolicy::OnFailure).unwrap(), r#""OnFailure""#);
        assert_eq!(serde_json::to_string(&RestartPolicy::Always).unwrap(), r#""Always""#);
    }
}
