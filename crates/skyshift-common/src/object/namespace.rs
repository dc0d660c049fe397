//! Namespace object
//!
//! Deleting a namespace cascades: the store removes every namespaced
//! object keyed under it before removing the namespace itself.

use serde::{Deserialize, Serialize};

use crate::object::meta::{Condition, ObjectMeta};

/// Namespace lifecycle phases
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum NamespacePhase {
    #[default]
    Active,
    Terminating,
}

/// Status of a Namespace
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct NamespaceStatus {
    #[serde(default)]
    pub phase: NamespacePhase,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/// Namespace object
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Namespace {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub status: NamespaceStatus,
}

impl Namespace {
    /// Create a namespace with the given name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            metadata: ObjectMeta::named(name),
            status: NamespaceStatus::default(),
        }
    }
}
