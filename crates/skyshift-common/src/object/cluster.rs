//! Cluster object
//!
//! A Cluster registers one underlying compute cluster (Kubernetes, Slurm
//! or Ray) with the control plane. Its status carries the capacity the
//! skylet's cluster controller reports.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::object::meta::{push_condition, Condition, ObjectMeta};
use crate::resources::NodeResourceMap;

/// Supported cluster manager backends
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub enum ManagerType {
    /// Kubernetes
    #[default]
    #[serde(rename = "k8")]
    K8,
    /// Slurm over slurmrestd
    #[serde(rename = "slurm")]
    Slurm,
    /// Ray over the Ray Jobs API
    #[serde(rename = "ray")]
    Ray,
}

impl std::fmt::Display for ManagerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::K8 => write!(f, "k8"),
            Self::Slurm => write!(f, "slurm"),
            Self::Ray => write!(f, "ray"),
        }
    }
}

impl std::str::FromStr for ManagerType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "k8" | "k8s" | "kubernetes" => Ok(Self::K8),
            "slurm" => Ok(Self::Slurm),
            "ray" => Ok(Self::Ray),
            _ => Err(Error::invalid_field(
                "Cluster",
                "spec.manager",
                format!("invalid manager type: {s}, expected one of: k8, slurm, ray"),
            )),
        }
    }
}

/// Cluster lifecycle states
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum ClusterState {
    /// Registered, not yet verified
    #[default]
    Init,
    /// Cloud nodes are being provisioned
    Provisioning,
    /// Healthy and accepting jobs
    Ready,
    /// Failed repeated health checks
    Error,
    /// Being torn down
    Deleting,
}

impl std::fmt::Display for ClusterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Init => "INIT",
            Self::Provisioning => "PROVISIONING",
            Self::Ready => "READY",
            Self::Error => "ERROR",
            Self::Deleting => "DELETING",
        };
        write!(f, "{s}")
    }
}

/// Specification for a Cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ClusterSpec {
    /// Which cluster manager drives this cluster
    #[serde(default)]
    pub manager: ManagerType,

    /// Path to the manager's config file (kubeconfig for Kubernetes)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_path: Option<String>,

    /// Manager-specific access parameters (endpoints, context names, tokens)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub access_config: BTreeMap<String, String>,

    /// Node count requested when provisioning
    #[serde(default = "default_num_nodes")]
    pub num_nodes: u32,

    /// CPU request per node when provisioning (e.g. "8" or "8+")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpus: Option<String>,

    /// Memory request per node in MB when provisioning (e.g. "32768" or "32768+")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,

    /// Disk size per node in MB when provisioning
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_size: Option<u32>,

    /// Accelerator request when provisioning (e.g. "V100:4")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accelerators: Option<String>,

    /// Ports to open on provisioned nodes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<u16>,

    /// Cloud to provision into (required when `provision` is set)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud: Option<String>,

    /// Cloud region
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,

    /// Whether the control plane provisions the cluster itself
    #[serde(default)]
    pub provision: bool,
}

fn default_num_nodes() -> u32 {
    1
}

impl ClusterSpec {
    /// Validate provisioning constraints and quantity shorthands
    pub fn validate(&self) -> Result<()> {
        if self.num_nodes == 0 {
            return Err(Error::invalid_field(
                "Cluster",
                "spec.num_nodes",
                "cluster must request at least one node",
            ));
        }
        if self.provision && self.cloud.is_none() {
            return Err(Error::invalid_field(
                "Cluster",
                "spec.cloud",
                "provisioned clusters must name a cloud",
            ));
        }
        for (field, value) in [("spec.cpus", &self.cpus), ("spec.memory", &self.memory)] {
            if let Some(v) = value {
                validate_quantity(field, v)?;
            }
        }
        for port in &self.ports {
            if *port == 0 {
                return Err(Error::invalid_field("Cluster", "spec.ports", "invalid port: 0"));
            }
        }
        Ok(())
    }
}

/// Validate a quantity shorthand: digits with an optional trailing `+`
fn validate_quantity(field: &str, value: &str) -> Result<()> {
    let digits = value.strip_suffix('+').unwrap_or(value);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::invalid_field(
            "Cluster",
            field,
            format!("invalid quantity '{value}', expected digits with optional trailing '+'"),
        ));
    }
    Ok(())
}

/// Status of a Cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ClusterStatus {
    /// Current lifecycle state
    #[serde(default)]
    pub status: ClusterState,

    /// Why the cluster entered ERROR, empty otherwise
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error_message: String,

    /// State transition timeline
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Total per-node capacity
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub capacity: NodeResourceMap,

    /// Per-node capacity still free for placement
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub allocatable_capacity: NodeResourceMap,

    /// Accelerator SKU per node, when any
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub accelerator_types: BTreeMap<String, String>,

    /// Whether the mesh peer is deployed and links can be created
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub network_enabled: bool,
}

impl ClusterStatus {
    /// Transition to `state`, recording a condition
    pub fn set_state(&mut self, state: ClusterState) {
        self.status = state;
        if state != ClusterState::Error {
            self.error_message.clear();
        }
        push_condition(&mut self.conditions, Condition::new(state.to_string()));
    }

    /// Transition to ERROR with a message
    pub fn set_error(&mut self, message: impl Into<String>) {
        self.status = ClusterState::Error;
        self.error_message = message.into();
        push_condition(
            &mut self.conditions,
            Condition::new(ClusterState::Error.to_string()).message(self.error_message.clone()),
        );
    }

    /// Validate the allocatable ≤ capacity invariant
    pub fn validate(&self) -> Result<()> {
        for (node, resources) in &self.allocatable_capacity {
            for (name, value) in resources {
                if *value < 0.0 {
                    return Err(Error::invalid_field(
                        "Cluster",
                        "status.allocatable_capacity",
                        format!("negative quantity for '{name}' on node '{node}'"),
                    ));
                }
                let cap = self
                    .capacity
                    .get(node)
                    .and_then(|n| n.get(name))
                    .copied()
                    .unwrap_or(0.0);
                if *value > cap {
                    return Err(Error::invalid_field(
                        "Cluster",
                        "status.allocatable_capacity",
                        format!("allocatable '{name}' on node '{node}' exceeds capacity"),
                    ));
                }
            }
        }
        for (node, resources) in &self.capacity {
            for (name, value) in resources {
                if !crate::resources::is_valid_resource(name) {
                    return Err(Error::invalid_field(
                        "Cluster",
                        "status.capacity",
                        format!("invalid resource type '{name}' for node '{node}'"),
                    ));
                }
                if *value < 0.0 {
                    return Err(Error::invalid_field(
                        "Cluster",
                        "status.capacity",
                        format!("negative quantity for '{name}' on node '{node}'"),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Cluster object
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Cluster {
    /// Standard object metadata
    #[serde(default)]
    pub metadata: ObjectMeta,
    /// Desired state
    #[serde(default)]
    pub spec: ClusterSpec,
    /// Observed state
    #[serde(default)]
    pub status: ClusterStatus,
}

impl Cluster {
    /// Create a cluster with the given name and manager
    pub fn new(name: impl Into<String>, manager: ManagerType) -> Self {
        Self {
            metadata: ObjectMeta::named(name),
            spec: ClusterSpec {
                manager,
                ..Default::default()
            },
            status: ClusterStatus::default(),
        }
    }

    /// Whether the scheduler may place replicas here
    pub fn is_ready(&self) -> bool {
        self.status.status == ClusterState::Ready
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manager_type_round_trip() {
        for (s, m) in [("k8", ManagerType::K8), ("slurm", ManagerType::Slurm), ("ray", ManagerType::Ray)] {
            assert_eq!(s.parse::<ManagerType>().unwrap(), m);
            assert_eq!(m.to_string(), s);
        }
        assert_eq!("kubernetes".parse::<ManagerType>().unwrap(), ManagerType::K8);
        assert!("mesos".parse::<ManagerType>().is_err());
    }

    #[test]
    fn test_provision_requires_cloud() {
        let mut spec = ClusterSpec {
            provision: true,
            ..Default::default()
        };
        assert!(spec.validate().is_err());
        spec.cloud = Some("aws".to_string());
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_quantity_shorthand() {
        let spec = ClusterSpec {
            cpus: Some("8+".to_string()),
            memory: Some("32768".to_string()),
            ..Default::default()
        };
        assert!(spec.validate().is_ok());

        let bad = ClusterSpec {
            cpus: Some("eight".to_string()),
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_allocatable_must_not_exceed_capacity() {
        let mut status = ClusterStatus::default();
        status.capacity.insert(
            "node-0".to_string(),
            BTreeMap::from([("cpus".to_string(), 4.0)]),
        );
        status.allocatable_capacity.insert(
            "node-0".to_string(),
            BTreeMap::from([("cpus".to_string(), 2.0)]),
        );
        assert!(status.validate().is_ok());

        status
            .allocatable_capacity
            .get_mut("node-0")
            .unwrap()
            .insert("cpus".to_string(), 8.0);
        assert!(status.validate().is_err());
    }

    #[test]
    fn test_set_error_records_condition() {
        let mut status = ClusterStatus::default();
        status.set_state(ClusterState::Ready);
        status.set_error("heartbeat failed 3 times");
        assert_eq!(status.status, ClusterState::Error);
        assert_eq!(status.conditions.last().unwrap().type_, "ERROR");

        status.set_state(ClusterState::Ready);
        assert!(status.error_message.is_empty());
    }

    #[test]
    fn test_unknown_fields_are_rejected() {
        let raw = r#"{"metadata":{"name":"c1"},"spec":{"manager":"k8","flavor":"large"}}"#;
        assert!(serde_json::from_str::<Cluster>(raw).is_err());
    }
}
