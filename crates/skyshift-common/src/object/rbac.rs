//! Role object and the action vocabulary for access decisions

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::object::meta::ObjectMeta;
use crate::object::Kind;

/// The closed set of actions a role may grant
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Get,
    List,
    Watch,
    Create,
    Update,
    Delete,
    Exec,
    Restart,
}

impl Action {
    /// The wire name of this action
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "get",
            Self::List => "list",
            Self::Watch => "watch",
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Exec => "exec",
            Self::Restart => "restart",
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One grant: actions over resource kinds.
///
/// `*` acts as a wildcard in both lists and must be the sole element when
/// present; resources are named by their plural form (`jobs`, `clusters`).
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Rule {
    /// Optional rule name for display
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// Resource plurals this rule covers
    #[serde(default)]
    pub resources: Vec<String>,
    /// Action names this rule grants
    #[serde(default)]
    pub actions: Vec<String>,
}

fn validate_wildcard_list(kind: &str, field: &str, values: &[String]) -> Result<()> {
    if values.iter().any(|v| v == "*") && values.len() != 1 {
        return Err(Error::invalid_field(
            kind,
            field,
            "'*' must be the only element when present",
        ));
    }
    Ok(())
}

impl Rule {
    pub fn validate(&self) -> Result<()> {
        validate_wildcard_list("Role", "rules.resources", &self.resources)?;
        validate_wildcard_list("Role", "rules.actions", &self.actions)?;
        for resource in &self.resources {
            if resource != "*" && Kind::from_plural(resource).is_none() {
                return Err(Error::invalid_field(
                    "Role",
                    "rules.resources",
                    format!("unknown resource '{resource}'"),
                ));
            }
        }
        for action in &self.actions {
            if action != "*" && serde_json::from_value::<Action>(serde_json::Value::String(action.clone())).is_err() {
                return Err(Error::invalid_field(
                    "Role",
                    "rules.actions",
                    format!("unknown action '{action}'"),
                ));
            }
        }
        Ok(())
    }

    /// Whether this rule grants `action` on `kind`
    pub fn grants(&self, action: Action, kind: Kind) -> bool {
        let action_ok = self
            .actions
            .iter()
            .any(|a| a == "*" || a == action.as_str());
        let resource_ok = self
            .resources
            .iter()
            .any(|r| r == "*" || r == kind.plural());
        action_ok && resource_ok
    }
}

/// Specification of a Role
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RoleSpec {
    /// Namespaces the role applies in; `*` grants all namespaces
    #[serde(default)]
    pub namespaces: Vec<String>,
    /// The grants themselves
    #[serde(default)]
    pub rules: Vec<Rule>,
    /// Users bound to this role
    #[serde(default)]
    pub users: Vec<String>,
}

impl RoleSpec {
    pub fn validate(&self) -> Result<()> {
        validate_wildcard_list("Role", "spec.namespaces", &self.namespaces)?;
        for rule in &self.rules {
            rule.validate()?;
        }
        Ok(())
    }

    /// Whether the role applies in `namespace` (global kinds pass `None`)
    pub fn covers_namespace(&self, namespace: Option<&str>) -> bool {
        match namespace {
            None => true,
            Some(ns) => self.namespaces.iter().any(|n| n == "*" || n == ns),
        }
    }
}

/// Role object
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Role {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: RoleSpec,
}

impl Role {
    /// The built-in role granting everything, bound to the bootstrap user
    pub fn admin(user: &str) -> Self {
        Self {
            metadata: ObjectMeta::named("admin-role"),
            spec: RoleSpec {
                namespaces: vec!["*".to_string()],
                rules: vec![Rule {
                    name: String::new(),
                    resources: vec!["*".to_string()],
                    actions: vec!["*".to_string()],
                }],
                users: vec![user.to_string()],
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wildcard_must_be_sole_element() {
        let rule = Rule {
            name: String::new(),
            resources: vec!["*".to_string(), "jobs".to_string()],
            actions: vec!["get".to_string()],
        };
        assert!(rule.validate().is_err());
    }

    #[test]
    fn test_unknown_resource_rejected() {
        let rule = Rule {
            name: String::new(),
            resources: vec!["widgets".to_string()],
            actions: vec!["get".to_string()],
        };
        assert!(rule.validate().is_err());
    }

    #[test]
    fn test_grants() {
        let rule = Rule {
            name: String::new(),
            resources: vec!["jobs".to_string(), "services".to_string()],
            actions: vec!["create".to_string(), "delete".to_string()],
        };
        assert!(rule.grants(Action::Create, Kind::Job));
        assert!(rule.grants(Action::Delete, Kind::Service));
        assert!(!rule.grants(Action::Create, Kind::Cluster));
        assert!(!rule.grants(Action::Get, Kind::Job));
    }

    #[test]
    fn test_admin_role_grants_everything() {
        let role = Role::admin("admin");
        assert!(role.spec.validate().is_ok());
        assert!(role.spec.covers_namespace(Some("anything")));
        assert!(role.spec.rules[0].grants(Action::Exec, Kind::Job));
        assert!(role.spec.rules[0].grants(Action::Watch, Kind::Cluster));
    }

    #[test]
    fn test_namespace_coverage() {
        let spec = RoleSpec {
            namespaces: vec!["team-a".to_string()],
            ..Default::default()
        };
        assert!(spec.covers_namespace(Some("team-a")));
        assert!(!spec.covers_namespace(Some("team-b")));
        // Global kinds are not namespace-scoped
        assert!(spec.covers_namespace(None));
    }
}
