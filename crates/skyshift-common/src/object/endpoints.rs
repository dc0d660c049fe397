//! Endpoints object
//!
//! Tracks, per cluster, how many ready replicas back a service and whether
//! they have been exposed to the primary cluster through the mesh.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::object::meta::{Condition, ObjectMeta};

/// Endpoint records for one cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct EndpointObject {
    /// Ready replica count on this cluster
    #[serde(default)]
    pub num_endpoints: u32,
    /// Whether these endpoints are exported to the primary cluster
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub exposed_to_cluster: bool,
}

/// Specification of an Endpoints object
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct EndpointsSpec {
    /// Selector matching the backing job replicas
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub selector: BTreeMap<String, String>,

    /// Per-cluster endpoint records
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub endpoints: BTreeMap<String, EndpointObject>,

    /// The cluster that owns the service's externally visible endpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_cluster: Option<String>,
}

impl EndpointsSpec {
    pub fn validate(&self) -> Result<()> {
        if self.endpoints.keys().any(|name| name.is_empty()) {
            return Err(Error::invalid_field(
                "Endpoints",
                "spec.endpoints",
                "cluster names must be non-empty",
            ));
        }
        if self.primary_cluster.as_deref() == Some("") {
            return Err(Error::invalid_field(
                "Endpoints",
                "spec.primary_cluster",
                "primary cluster cannot be an empty string",
            ));
        }
        Ok(())
    }
}

/// Status of an Endpoints object
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct EndpointsStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/// Endpoints object
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Endpoints {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: EndpointsSpec,
    #[serde(default)]
    pub status: EndpointsStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_cluster_name_rejected() {
        let mut spec = EndpointsSpec::default();
        spec.endpoints.insert(String::new(), EndpointObject::default());
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_round_trip() {
        let mut spec = EndpointsSpec::default();
        spec.endpoints.insert(
            "c1".to_string(),
            EndpointObject {
                num_endpoints: 3,
                exposed_to_cluster: true,
            },
        );
        spec.primary_cluster = Some("c1".to_string());
        let json = serde_json::to_string(&spec).unwrap();
        let back: EndpointsSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(back, spec);
    }
}
