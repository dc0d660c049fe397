//! Access decisions
//!
//! `allowed(subject, action, kind, namespace)` evaluates the union of
//! every role bound to the subject. A subject with no matching grant
//! receives `Unauthorized`; there is no partial answer.

use skyshift_common::object::{Action, Kind, Object, Role};
use skyshift_common::{Error, Result};
use skyshift_store::ObjectStore;

/// Evaluate roles from the store and fail with `Unauthorized` unless a
/// grant covers (subject, action, kind, namespace).
pub async fn authorize(
    store: &ObjectStore,
    subject: &str,
    action: Action,
    kind: Kind,
    namespace: Option<&str>,
) -> Result<()> {
    let roles = store.list(Kind::Role, None).await?;
    let roles: Vec<Role> = roles
        .into_iter()
        .filter_map(|obj| match obj {
            Object::Role(role) => Some(role),
            _ => None,
        })
        .collect();
    if allowed(&roles, subject, action, kind, namespace) {
        Ok(())
    } else {
        Err(Error::unauthorized(format!(
            "user '{subject}' may not {action} {}",
            kind.plural()
        )))
    }
}

/// Pure decision over a role set
pub fn allowed(
    roles: &[Role],
    subject: &str,
    action: Action,
    kind: Kind,
    namespace: Option<&str>,
) -> bool {
    // Namespace scoping only applies to namespaced kinds.
    let scope = if kind.namespaced() { namespace } else { None };
    roles
        .iter()
        .filter(|role| role.spec.users.iter().any(|u| u == subject))
        .filter(|role| role.spec.covers_namespace(scope))
        .any(|role| role.spec.rules.iter().any(|rule| rule.grants(action, kind)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use skyshift_common::object::{ObjectMeta, RoleSpec, Rule};

    fn role(name: &str, namespaces: &[&str], resources: &[&str], actions: &[&str], users: &[&str]) -> Role {
        Role {
            metadata: ObjectMeta::named(name),
            spec: RoleSpec {
                namespaces: namespaces.iter().map(|s| s.to_string()).collect(),
                rules: vec![Rule {
                    name: String::new(),
                    resources: resources.iter().map(|s| s.to_string()).collect(),
                    actions: actions.iter().map(|s| s.to_string()).collect(),
                }],
                users: users.iter().map(|s| s.to_string()).collect(),
            },
        }
    }

    #[test]
    fn test_no_role_binding_denies_everything() {
        let roles = [role("reader", &["*"], &["jobs"], &["get"], &["bob"])];
        assert!(!allowed(&roles, "mallory", Action::Get, Kind::Job, Some("default")));
        assert!(!allowed(&[], "anyone", Action::List, Kind::Cluster, None));
    }

    #[test]
    fn test_union_of_roles() {
        let roles = [
            role("job-reader", &["*"], &["jobs"], &["get", "list"], &["alice"]),
            role("job-writer", &["*"], &["jobs"], &["create", "delete"], &["alice"]),
        ];
        assert!(allowed(&roles, "alice", Action::Get, Kind::Job, Some("default")));
        assert!(allowed(&roles, "alice", Action::Create, Kind::Job, Some("default")));
        assert!(!allowed(&roles, "alice", Action::Exec, Kind::Job, Some("default")));
    }

    #[test]
    fn test_namespace_scoping() {
        let roles = [role("team-a", &["team-a"], &["jobs"], &["*"], &["carol"])];
        assert!(allowed(&roles, "carol", Action::Create, Kind::Job, Some("team-a")));
        assert!(!allowed(&roles, "carol", Action::Create, Kind::Job, Some("team-b")));
    }

    #[test]
    fn test_global_kinds_ignore_namespace_lists() {
        // A role scoped to one namespace can still grant global kinds.
        let roles = [role("ops", &["team-a"], &["clusters"], &["get"], &["dave"])];
        assert!(allowed(&roles, "dave", Action::Get, Kind::Cluster, None));
    }

    #[test]
    fn test_admin_wildcards() {
        let roles = [Role::admin("root")];
        assert!(allowed(&roles, "root", Action::Delete, Kind::Namespace, None));
        assert!(allowed(&roles, "root", Action::Exec, Kind::Job, Some("anything")));
        assert!(!allowed(&roles, "intruder", Action::Get, Kind::Job, Some("default")));
    }
}
