//! Service object
//!
//! A Service exposes a job's replicas under one name. The primary cluster
//! owns the externally visible endpoint; other clusters export their
//! replica endpoints to it through the mesh.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::object::meta::{Condition, ObjectMeta};

/// Service exposure modes, mirroring the Kubernetes service types
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub enum ServiceType {
    /// Virtual IP reachable inside the cluster
    #[default]
    ClusterIP,
    /// Exposed on a port of every node
    NodePort,
    /// Exposed through a cloud load balancer
    LoadBalancer,
    /// DNS alias to an external name
    ExternalName,
}

/// Transport protocols accepted on service ports
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub enum Protocol {
    #[default]
    TCP,
    UDP,
}

/// One exposed port
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ServicePort {
    /// Port the service listens on
    pub port: u16,
    /// Port the replicas listen on
    pub target_port: u16,
    /// Transport protocol
    #[serde(default)]
    pub protocol: Protocol,
    /// Node port, only valid for `NodePort` services
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_port: Option<u16>,
}

/// Specification of a Service
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ServiceSpec {
    /// Exposure mode
    #[serde(rename = "type", default)]
    pub type_: ServiceType,

    /// Selects the job replicas backing this service
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub selector: BTreeMap<String, String>,

    /// Exposed ports
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<ServicePort>,

    /// Cluster owning the service endpoint; "auto" resolves to the cluster
    /// holding the first replica slice of the selected job
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_cluster: Option<String>,
}

impl ServiceSpec {
    /// Validate port ranges and node-port usage
    pub fn validate(&self) -> Result<()> {
        for sp in &self.ports {
            if sp.port == 0 {
                return Err(Error::invalid_field("Service", "spec.ports", "invalid port: 0"));
            }
            if sp.target_port == 0 {
                return Err(Error::invalid_field(
                    "Service",
                    "spec.ports",
                    "invalid target port: 0",
                ));
            }
            if sp.node_port.is_some() && self.type_ != ServiceType::NodePort {
                return Err(Error::invalid_field(
                    "Service",
                    "spec.ports",
                    "node_port requires service type NodePort",
                ));
            }
        }
        Ok(())
    }

    /// Whether the primary cluster should be resolved automatically
    pub fn auto_primary(&self) -> bool {
        matches!(self.primary_cluster.as_deref(), None | Some("auto"))
    }
}

/// Status of a Service
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ServiceStatus {
    /// Externally reachable IP, when the backend assigned one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_ip: Option<String>,
    /// Cluster-internal virtual IP
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_ip: Option<String>,
    /// Reconciliation timeline
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/// Service object
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Service {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: ServiceSpec,
    #[serde(default)]
    pub status: ServiceStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_port_requires_node_port_type() {
        let spec = ServiceSpec {
            type_: ServiceType::ClusterIP,
            ports: vec![ServicePort {
                port: 80,
                target_port: 8080,
                protocol: Protocol::TCP,
                node_port: Some(30080),
            }],
            ..Default::default()
        };
        assert!(spec.validate().is_err());

        let spec = ServiceSpec {
            type_: ServiceType::NodePort,
            ..spec
        };
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_auto_primary() {
        let mut spec = ServiceSpec::default();
        assert!(spec.auto_primary());
        spec.primary_cluster = Some("auto".to_string());
        assert!(spec.auto_primary());
        spec.primary_cluster = Some("c1".to_string());
        assert!(!spec.auto_primary());
    }

    #[test]
    fn test_zero_port_rejected() {
        let spec = ServiceSpec {
            ports: vec![ServicePort {
                port: 0,
                target_port: 8080,
                protocol: Protocol::TCP,
                node_port: None,
            }],
            ..Default::default()
        };
        assert!(spec.validate().is_err());
    }
}
