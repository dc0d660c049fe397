//! Link object: a bidirectional mesh tunnel between two clusters

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::object::meta::{push_condition, Condition, ObjectMeta};

/// Link lifecycle phases
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum LinkPhase {
    /// Requested, not yet established
    #[default]
    Init,
    /// Tunnel established in both directions
    Active,
    /// Establishment failed
    Failed,
}

impl std::fmt::Display for LinkPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Init => "INIT",
            Self::Active => "ACTIVE",
            Self::Failed => "FAILED",
        };
        write!(f, "{s}")
    }
}

/// Specification of a Link
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct LinkSpec {
    /// Cluster initiating the tunnel
    pub source: String,
    /// Cluster accepting the tunnel
    pub target: String,
}

impl LinkSpec {
    pub fn validate(&self) -> Result<()> {
        if self.source.is_empty() || self.target.is_empty() {
            return Err(Error::invalid_field(
                "Link",
                "spec",
                "both source and target clusters are required",
            ));
        }
        if self.source == self.target {
            return Err(Error::invalid_field(
                "Link",
                "spec.target",
                "a link cannot connect a cluster to itself",
            ));
        }
        Ok(())
    }

    /// Whether this link touches the given cluster
    pub fn involves(&self, cluster: &str) -> bool {
        self.source == cluster || self.target == cluster
    }
}

/// Status of a Link
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct LinkStatus {
    #[serde(default)]
    pub phase: LinkPhase,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl LinkStatus {
    /// Transition the phase, recording a condition
    pub fn set_phase(&mut self, phase: LinkPhase) {
        self.phase = phase;
        push_condition(&mut self.conditions, Condition::new(phase.to_string()));
    }
}

/// Link object
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Link {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: LinkSpec,
    #[serde(default)]
    pub status: LinkStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_self_link_rejected() {
        let spec = LinkSpec {
            source: "c1".to_string(),
            target: "c1".to_string(),
        };
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_involves_either_end() {
        let spec = LinkSpec {
            source: "c1".to_string(),
            target: "c2".to_string(),
        };
        assert!(spec.involves("c1"));
        assert!(spec.involves("c2"));
        assert!(!spec.involves("c3"));
    }
}
