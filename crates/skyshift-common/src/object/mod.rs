//! The SkyShift object model
//!
//! Every kind shares the `metadata` / `spec` / `status` shape. The
//! [`Object`] enum is the single decode point: payloads carry a `kind`
//! tag, unknown kinds and unknown fields are rejected, and
//! [`Object::validate`] enforces each kind's invariants before anything
//! touches the store.

pub mod cluster;
pub mod endpoints;
pub mod filter_policy;
pub mod job;
pub mod link;
pub mod meta;
pub mod namespace;
pub mod rbac;
pub mod service;
pub mod user;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub use cluster::{Cluster, ClusterSpec, ClusterState, ClusterStatus, ManagerType};
pub use endpoints::{EndpointObject, Endpoints, EndpointsSpec, EndpointsStatus};
pub use filter_policy::{ClusterFilter, FilterPolicy, FilterPolicySpec, FilterPolicyStatus};
pub use job::{
    FilterSpec, ImagePullPolicy, Job, JobPhase, JobSpec, JobStatus, Placement, PreferenceSpec,
    ReplicaState, ReplicaStatusMap, RestartPolicy, VolumeSpec, DEFAULT_MAX_WEIGHT,
    DEFAULT_MIN_WEIGHT,
};
pub use link::{Link, LinkPhase, LinkSpec, LinkStatus};
pub use meta::{
    push_condition, validate_name, Condition, ObjectMeta, DEFAULT_NAMESPACE,
    UNSET_RESOURCE_VERSION,
};
pub use namespace::{Namespace, NamespacePhase, NamespaceStatus};
pub use rbac::{Action, Role, RoleSpec, Rule};
pub use service::{Protocol, Service, ServicePort, ServiceSpec, ServiceStatus, ServiceType};
pub use user::{User, UserSpec};

/// Every object kind the control plane stores
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Kind {
    Cluster,
    Job,
    Service,
    Endpoints,
    Link,
    FilterPolicy,
    Namespace,
    Role,
    User,
}

impl Kind {
    /// All kinds, in store iteration order
    pub const ALL: &'static [Kind] = &[
        Kind::Cluster,
        Kind::Job,
        Kind::Service,
        Kind::Endpoints,
        Kind::Link,
        Kind::FilterPolicy,
        Kind::Namespace,
        Kind::Role,
        Kind::User,
    ];

    /// The kind name as it appears in payloads (e.g. "FilterPolicy")
    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::Cluster => "Cluster",
            Kind::Job => "Job",
            Kind::Service => "Service",
            Kind::Endpoints => "Endpoints",
            Kind::Link => "Link",
            Kind::FilterPolicy => "FilterPolicy",
            Kind::Namespace => "Namespace",
            Kind::Role => "Role",
            Kind::User => "User",
        }
    }

    /// The plural form used in store keys, URLs and role rules
    pub fn plural(&self) -> &'static str {
        match self {
            Kind::Cluster => "clusters",
            Kind::Job => "jobs",
            Kind::Service => "services",
            Kind::Endpoints => "endpoints",
            Kind::Link => "links",
            Kind::FilterPolicy => "filterpolicies",
            Kind::Namespace => "namespaces",
            Kind::Role => "roles",
            Kind::User => "users",
        }
    }

    /// Resolve a plural form back to a kind
    pub fn from_plural(plural: &str) -> Option<Kind> {
        Kind::ALL.iter().copied().find(|k| k.plural() == plural)
    }

    /// Whether objects of this kind are scoped under a namespace
    pub fn namespaced(&self) -> bool {
        matches!(
            self,
            Kind::Job | Kind::Service | Kind::Endpoints | Kind::FilterPolicy
        )
    }

    /// All namespaced kinds
    pub fn namespaced_kinds() -> impl Iterator<Item = Kind> {
        Kind::ALL.iter().copied().filter(Kind::namespaced)
    }

    /// All global kinds
    pub fn global_kinds() -> impl Iterator<Item = Kind> {
        Kind::ALL.iter().copied().filter(|k| !k.namespaced())
    }
}

impl std::fmt::Display for Kind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Kind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Kind::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| Error::invalid("Object", format!("unknown kind '{s}'")))
    }
}

/// A stored object of any kind, tagged by `kind` on the wire
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(tag = "kind")]
pub enum Object {
    Cluster(Cluster),
    Job(Job),
    Service(Service),
    Endpoints(Endpoints),
    Link(Link),
    FilterPolicy(FilterPolicy),
    Namespace(Namespace),
    Role(Role),
    User(User),
}

macro_rules! with_object {
    ($value:expr, $inner:ident => $body:expr) => {
        match $value {
            Object::Cluster($inner) => $body,
            Object::Job($inner) => $body,
            Object::Service($inner) => $body,
            Object::Endpoints($inner) => $body,
            Object::Link($inner) => $body,
            Object::FilterPolicy($inner) => $body,
            Object::Namespace($inner) => $body,
            Object::Role($inner) => $body,
            Object::User($inner) => $body,
        }
    };
}

impl Object {
    /// The kind of this object
    pub fn kind(&self) -> Kind {
        match self {
            Object::Cluster(_) => Kind::Cluster,
            Object::Job(_) => Kind::Job,
            Object::Service(_) => Kind::Service,
            Object::Endpoints(_) => Kind::Endpoints,
            Object::Link(_) => Kind::Link,
            Object::FilterPolicy(_) => Kind::FilterPolicy,
            Object::Namespace(_) => Kind::Namespace,
            Object::Role(_) => Kind::Role,
            Object::User(_) => Kind::User,
        }
    }

    /// Shared metadata accessor
    pub fn metadata(&self) -> &ObjectMeta {
        with_object!(self, inner => &inner.metadata)
    }

    /// Shared mutable metadata accessor
    pub fn metadata_mut(&mut self) -> &mut ObjectMeta {
        with_object!(self, inner => &mut inner.metadata)
    }

    /// Object name
    pub fn name(&self) -> &str {
        &self.metadata().name
    }

    /// Object namespace, when namespaced
    pub fn namespace(&self) -> Option<&str> {
        self.metadata().namespace.as_deref()
    }

    /// Cache key: `<namespace>/<name>` or `<name>`
    pub fn cache_key(&self) -> String {
        self.metadata().cache_key()
    }

    /// Fill in defaults a fresh object is missing: the namespace on
    /// namespaced kinds and the creation timestamp.
    pub fn normalize(&mut self) {
        let namespaced = self.kind().namespaced();
        let meta = self.metadata_mut();
        if namespaced && meta.namespace.is_none() {
            meta.namespace = Some(DEFAULT_NAMESPACE.to_string());
        }
        if meta.creation_timestamp.is_none() {
            meta.creation_timestamp = Some(chrono::Utc::now());
        }
    }

    /// Validate metadata, namespace scoping and kind-specific invariants
    pub fn validate(&self) -> Result<()> {
        let kind = self.kind();
        self.metadata().validate(kind.as_str())?;
        if kind.namespaced() {
            if self.metadata().namespace.is_none() {
                return Err(Error::invalid_field(
                    kind.as_str(),
                    "metadata.namespace",
                    "namespaced objects require a namespace",
                ));
            }
        } else if self.metadata().namespace.is_some() {
            return Err(Error::invalid_field(
                kind.as_str(),
                "metadata.namespace",
                "global objects cannot carry a namespace",
            ));
        }
        match self {
            Object::Cluster(c) => {
                c.spec.validate()?;
                c.status.validate()
            }
            Object::Job(j) => j.spec.validate(),
            Object::Service(s) => s.spec.validate(),
            Object::Endpoints(e) => e.spec.validate(),
            Object::Link(l) => l.spec.validate(),
            Object::FilterPolicy(f) => f.spec.validate(),
            Object::Namespace(_) => Ok(()),
            Object::Role(r) => r.spec.validate(),
            Object::User(u) => u.spec.validate(),
        }
    }

    /// Decode and validate a JSON payload: the single decode point
    pub fn decode(payload: &[u8]) -> Result<Object> {
        let obj: Object = serde_json::from_slice(payload)
            .map_err(|e| Error::invalid("Object", e.to_string()))?;
        obj.validate()?;
        Ok(obj)
    }

    /// Canonical serialization: stable field ordering, optionals omitted
    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::fatal("codec", e.to_string()))
    }

    /// Replace this object's status with `other`'s, leaving spec untouched.
    ///
    /// Used by the status subresource path; mismatched kinds are a caller bug
    /// surfaced as `InvalidObject`.
    pub fn replace_status_from(&mut self, other: &Object) -> Result<()> {
        match (self, other) {
            (Object::Cluster(a), Object::Cluster(b)) => a.status = b.status.clone(),
            (Object::Job(a), Object::Job(b)) => a.status = b.status.clone(),
            (Object::Service(a), Object::Service(b)) => a.status = b.status.clone(),
            (Object::Endpoints(a), Object::Endpoints(b)) => a.status = b.status.clone(),
            (Object::Link(a), Object::Link(b)) => a.status = b.status.clone(),
            (Object::FilterPolicy(a), Object::FilterPolicy(b)) => a.status = b.status.clone(),
            (Object::Namespace(a), Object::Namespace(b)) => a.status = b.status.clone(),
            (Object::Role(_), Object::Role(_)) | (Object::User(_), Object::User(_)) => {}
            (a, b) => {
                return Err(Error::invalid(
                    a.kind().as_str(),
                    format!("status update kind mismatch: got {}", b.kind()),
                ))
            }
        }
        Ok(())
    }
}

/// Typed view over [`Object`] for clients that know the kind at compile time
pub trait ApiObject: Clone + Serialize + DeserializeOwned + Into<Object> {
    /// The kind this type represents
    const KIND: Kind;

    /// Shared metadata accessor
    fn metadata(&self) -> &ObjectMeta;

    /// Shared mutable metadata accessor
    fn metadata_mut(&mut self) -> &mut ObjectMeta;

    /// Downcast a dynamic object, failing on kind mismatch
    fn try_from_object(obj: Object) -> Result<Self>;
}

macro_rules! impl_api_object {
    ($type:ident) => {
        impl From<$type> for Object {
            fn from(value: $type) -> Object {
                Object::$type(value)
            }
        }

        impl ApiObject for $type {
            const KIND: Kind = Kind::$type;

            fn metadata(&self) -> &ObjectMeta {
                &self.metadata
            }

            fn metadata_mut(&mut self) -> &mut ObjectMeta {
                &mut self.metadata
            }

            fn try_from_object(obj: Object) -> Result<Self> {
                match obj {
                    Object::$type(inner) => Ok(inner),
                    other => Err(Error::invalid(
                        stringify!($type),
                        format!("expected {}, got {}", Kind::$type, other.kind()),
                    )),
                }
            }
        }
    };
}

impl_api_object!(Cluster);
impl_api_object!(Job);
impl_api_object!(Service);
impl_api_object!(Endpoints);
impl_api_object!(Link);
impl_api_object!(FilterPolicy);
impl_api_object!(Namespace);
impl_api_object!(Role);
impl_api_object!(User);

/// Watch event types delivered to informers
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum WatchEventType {
    /// New object
    Add,
    /// Existing object modified
    Update,
    /// Object removed
    Delete,
}

/// One watch event: a typed object plus what happened to it
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct WatchEvent {
    /// What happened
    pub event_type: WatchEventType,
    /// The object after the change (before it, for deletes)
    pub object: Object,
}

impl WatchEvent {
    pub fn new(event_type: WatchEventType, object: Object) -> Self {
        Self { event_type, object }
    }
}

/// List response envelope, e.g. `{"kind": "JobList", "objects": [...]}`
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct ObjectList {
    /// `<Kind>List`
    pub kind: String,
    /// The listed objects
    pub objects: Vec<Object>,
    /// Store revision this list was taken at; a watch resumed from
    /// `resource_version + 1` observes every later change
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<i64>,
}

impl ObjectList {
    pub fn new(kind: Kind, objects: Vec<Object>) -> Self {
        Self {
            kind: format!("{kind}List"),
            objects,
            resource_version: None,
        }
    }

    /// Attach the store revision the list was taken at
    pub fn at_version(mut self, version: i64) -> Self {
        self.resource_version = Some(version);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_plural_round_trip() {
        for kind in Kind::ALL {
            assert_eq!(Kind::from_plural(kind.plural()), Some(*kind));
        }
        assert_eq!(Kind::from_plural("widgets"), None);
    }

    #[test]
    fn test_decode_dispatches_on_kind_tag() {
        let raw = br#"{"kind":"Cluster","metadata":{"name":"c1"},"spec":{"manager":"slurm"}}"#;
        let obj = Object::decode(raw).unwrap();
        assert_eq!(obj.kind(), Kind::Cluster);
        match obj {
            Object::Cluster(c) => assert_eq!(c.spec.manager, ManagerType::Slurm),
            _ => panic!("expected Cluster"),
        }
    }

    #[test]
    fn test_decode_rejects_unknown_kind() {
        let raw = br#"{"kind":"Widget","metadata":{"name":"w1"}}"#;
        assert!(Object::decode(raw).is_err());
    }

    #[test]
    fn test_decode_rejects_unknown_fields() {
        let raw = br#"{"kind":"Job","metadata":{"name":"j1","namespace":"default"},"spec":{"replicas":1,"flavor":"large"}}"#;
        assert!(Object::decode(raw).is_err());
    }

    #[test]
    fn test_global_kind_rejects_namespace() {
        let raw = br#"{"kind":"Cluster","metadata":{"name":"c1","namespace":"default"}}"#;
        assert!(Object::decode(raw).is_err());
    }

    #[test]
    fn test_namespaced_kind_requires_namespace_after_normalize() {
        let raw = br#"{"kind":"Job","metadata":{"name":"j1"}}"#;
        // Without a namespace validation fails...
        assert!(Object::decode(raw).is_err());

        // ...but normalize injects the default namespace first.
        let mut obj: Object = serde_json::from_slice(raw.as_slice()).unwrap();
        obj.normalize();
        assert!(obj.validate().is_ok());
        assert_eq!(obj.namespace(), Some(DEFAULT_NAMESPACE));
        assert!(obj.metadata().creation_timestamp.is_some());
    }

    #[test]
    fn test_encode_round_trip_is_stable() {
        let raw = br#"{"kind":"Service","metadata":{"name":"svc","namespace":"default"},"spec":{"type":"ClusterIP","selector":{"app":"web"},"ports":[{"port":80,"target_port":8080}]}}"#;
        let obj = Object::decode(raw).unwrap();
        let first = obj.encode().unwrap();
        let second = Object::decode(&first).unwrap().encode().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_typed_downcast() {
        let obj = Object::Namespace(Namespace::new("team-a"));
        assert!(Job::try_from_object(obj.clone()).is_err());
        let ns = Namespace::try_from_object(obj).unwrap();
        assert_eq!(ns.metadata.name, "team-a");
    }

    #[test]
    fn test_replace_status_preserves_spec() {
        let mut stored = Object::decode(
            br#"{"kind":"Job","metadata":{"name":"j1","namespace":"default"},"spec":{"replicas":3}}"#,
        )
        .unwrap();
        let mut incoming = stored.clone();
        if let Object::Job(j) = &mut incoming {
            j.spec.replicas = 99; // spec changes on the status path are ignored
            j.status.set_phase(JobPhase::Scheduled);
        }
        stored.replace_status_from(&incoming).unwrap();
        match stored {
            Object::Job(j) => {
                assert_eq!(j.spec.replicas, 3);
                assert_eq!(j.status.status, JobPhase::Scheduled);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_watch_event_wire_format() {
        let event = WatchEvent::new(
            WatchEventType::Add,
            Object::Namespace(Namespace::new("team-a")),
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event_type"], "ADD");
        assert_eq!(json["object"]["kind"], "Namespace");
    }
}
