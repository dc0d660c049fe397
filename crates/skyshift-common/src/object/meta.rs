//! Object metadata shared by every kind
//!
//! Names follow DNS-label rules; namespaced kinds default their namespace
//! to `default`. The resource version is stamped by the store from the KV
//! revision, so `-1` simply means "not yet persisted".

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Namespace used when a namespaced object does not name one
pub const DEFAULT_NAMESPACE: &str = "default";

/// Maximum object name length
pub const MAX_NAME_LEN: usize = 253;

/// Sentinel for an object that has not been persisted yet
pub const UNSET_RESOURCE_VERSION: i64 = -1;

fn unset_version() -> i64 {
    UNSET_RESOURCE_VERSION
}

fn is_unset_version(v: &i64) -> bool {
    *v == UNSET_RESOURCE_VERSION
}

/// Metadata of an object
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ObjectMeta {
    /// Object name, unique within its namespace bucket
    pub name: String,

    /// Namespace, present only on namespaced kinds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Free-form labels used for selection
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    /// Free-form annotations
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    /// KV revision of this object, monotonically increasing per object
    #[serde(default = "unset_version", skip_serializing_if = "is_unset_version")]
    pub resource_version: i64,

    /// When the object was first persisted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,
}

impl Default for ObjectMeta {
    fn default() -> Self {
        Self {
            name: String::new(),
            namespace: None,
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            resource_version: UNSET_RESOURCE_VERSION,
            creation_timestamp: None,
        }
    }
}

impl ObjectMeta {
    /// Create metadata with just a name
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Create metadata with a name and namespace
    pub fn namespaced(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: Some(namespace.into()),
            ..Default::default()
        }
    }

    /// The namespace, falling back to `default`
    pub fn namespace_or_default(&self) -> &str {
        self.namespace.as_deref().unwrap_or(DEFAULT_NAMESPACE)
    }

    /// Cache key for this object: `<namespace>/<name>` or `<name>`
    pub fn cache_key(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("{ns}/{}", self.name),
            None => self.name.clone(),
        }
    }

    /// Validate the name (and namespace, when present) against DNS-label rules
    pub fn validate(&self, kind: &str) -> Result<()> {
        validate_name(kind, &self.name)?;
        if let Some(ns) = &self.namespace {
            validate_name(kind, ns)
                .map_err(|_| Error::invalid_field(kind, "metadata.namespace", "invalid namespace name"))?;
        }
        Ok(())
    }
}

/// Validate a DNS-label style name: lowercase alphanumerics and `-`,
/// starting and ending alphanumeric, at most [`MAX_NAME_LEN`] characters.
pub fn validate_name(kind: &str, name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::invalid_field(kind, "metadata.name", "name cannot be empty"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(Error::invalid_field(
            kind,
            "metadata.name",
            format!("name exceeds {MAX_NAME_LEN} characters"),
        ));
    }
    let bytes = name.as_bytes();
    let alnum = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    if !alnum(bytes[0]) || !alnum(bytes[bytes.len() - 1]) {
        return Err(Error::invalid_field(
            kind,
            "metadata.name",
            "name must start and end with a lowercase alphanumeric character",
        ));
    }
    if !bytes.iter().all(|&b| alnum(b) || b == b'-') {
        return Err(Error::invalid_field(
            kind,
            "metadata.name",
            "name may contain only lowercase alphanumerics and '-'",
        ));
    }
    Ok(())
}

/// One entry in an object's condition timeline
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Condition {
    /// Condition type (e.g. "SCHEDULED", "Unschedulable")
    #[serde(rename = "type")]
    pub type_: String,

    /// Condition status, "True" unless stated otherwise
    #[serde(default = "default_condition_status")]
    pub status: String,

    /// Machine-readable reason for the last transition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Human-readable message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// When the condition last changed type
    pub last_transition: DateTime<Utc>,

    /// When the condition was last refreshed
    pub last_update: DateTime<Utc>,
}

fn default_condition_status() -> String {
    "True".to_string()
}

impl Condition {
    /// Create a condition of the given type, stamped now
    pub fn new(type_: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            type_: type_.into(),
            status: default_condition_status(),
            reason: None,
            message: None,
            last_transition: now,
            last_update: now,
        }
    }

    /// Set the reason and return self for chaining
    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Set the message and return self for chaining
    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Append `cond` to a condition timeline.
///
/// A repeat of the latest type only refreshes `last_update`; a new type is
/// appended, preserving the transition history.
pub fn push_condition(conditions: &mut Vec<Condition>, cond: Condition) {
    match conditions.last_mut() {
        Some(last) if last.type_ == cond.type_ => {
            last.last_update = cond.last_update;
            last.reason = cond.reason;
            last.message = cond.message;
        }
        _ => conditions.push(cond),
    }
}
