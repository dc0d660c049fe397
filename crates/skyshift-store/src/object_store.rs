//! Typed object storage over a KV driver
//!
//! Keyspace: `/registry/<plural>/<namespace?>/<name>`. Every read stamps
//! `metadata.resource_version` from the KV revision, so optimistic
//! updates compare against exactly what the driver saw. Status updates
//! take a distinct path that never touches the stored spec.

use std::pin::Pin;
use std::sync::Arc;

use futures::{Stream, StreamExt};
use tracing::warn;

use skyshift_common::object::{
    Kind, Object, WatchEvent, WatchEventType, UNSET_RESOURCE_VERSION,
};
use skyshift_common::{Error, Result};

use crate::kv::{KvEntry, KvStore};

/// Root of the object keyspace
pub const REGISTRY_PREFIX: &str = "/registry";

/// Ordered stream of decoded watch events
pub type ObjectWatchStream = Pin<Box<dyn Stream<Item = Result<WatchEvent>> + Send>>;

/// Kind-indexed, namespaced storage with per-object resource versions
/// and fan-out watch streams.
#[derive(Clone)]
pub struct ObjectStore {
    kv: Arc<dyn KvStore>,
}

/// Prefix covering a kind, optionally scoped to one namespace
pub fn kind_prefix(kind: Kind, namespace: Option<&str>) -> String {
    match namespace {
        Some(ns) if kind.namespaced() => format!("{REGISTRY_PREFIX}/{}/{ns}/", kind.plural()),
        _ => format!("{REGISTRY_PREFIX}/{}/", kind.plural()),
    }
}

/// Full key of one object; namespaced kinds require a namespace
pub fn object_key(kind: Kind, namespace: Option<&str>, name: &str) -> Result<String> {
    if kind.namespaced() {
        let ns = namespace.ok_or_else(|| {
            Error::invalid_field(
                kind.as_str(),
                "metadata.namespace",
                "namespaced objects require a namespace",
            )
        })?;
        Ok(format!("{REGISTRY_PREFIX}/{}/{ns}/{name}", kind.plural()))
    } else {
        Ok(format!("{REGISTRY_PREFIX}/{}/{name}", kind.plural()))
    }
}

fn decode_entry(entry: &KvEntry) -> Result<Object> {
    let mut obj = Object::decode(&entry.value)?;
    obj.metadata_mut().resource_version = entry.revision;
    Ok(obj)
}

/// Serialize with the resource version stripped; the stored payload's
/// version is always derived from the KV revision on read.
fn encode_for_store(obj: &Object) -> Result<Vec<u8>> {
    let mut clean = obj.clone();
    clean.metadata_mut().resource_version = UNSET_RESOURCE_VERSION;
    clean.encode()
}

impl ObjectStore {
    /// Create a store over the given driver
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    fn self_key(obj: &Object) -> Result<String> {
        object_key(obj.kind(), obj.namespace(), obj.name())
    }

    /// Persist a new object. Fails `AlreadyExists` on key collision.
    pub async fn create(&self, mut obj: Object) -> Result<Object> {
        obj.normalize();
        obj.validate()?;
        let key = Self::self_key(&obj)?;
        let revision = self.kv.put(&key, encode_for_store(&obj)?, Some(0)).await?;
        obj.metadata_mut().resource_version = revision;
        Ok(obj)
    }

    /// Replace an existing object.
    ///
    /// When the caller presents a resource version the write is a
    /// compare-and-swap; without one it overwrites, but the key must
    /// already exist.
    pub async fn update(&self, mut obj: Object) -> Result<Object> {
        obj.normalize();
        obj.validate()?;
        let key = Self::self_key(&obj)?;
        let expected = obj.metadata().resource_version;
        let revision = if expected == UNSET_RESOURCE_VERSION {
            if self.kv.get(&key).await?.is_none() {
                return Err(Error::not_found(&key));
            }
            self.kv.put(&key, encode_for_store(&obj)?, None).await?
        } else {
            self.kv
                .put(&key, encode_for_store(&obj)?, Some(expected))
                .await?
        };
        obj.metadata_mut().resource_version = revision;
        Ok(obj)
    }

    /// Replace only an object's status, leaving the stored spec as-is.
    ///
    /// Still bumps the resource version; callers retry on `Conflict`
    /// after rereading.
    pub async fn update_status(&self, obj: &Object) -> Result<Object> {
        let key = Self::self_key(obj)?;
        let entry = self
            .kv
            .get(&key)
            .await?
            .ok_or_else(|| Error::not_found(&key))?;
        let expected = obj.metadata().resource_version;
        if expected != UNSET_RESOURCE_VERSION && expected != entry.revision {
            return Err(Error::conflict(&key, expected));
        }
        let mut stored = decode_entry(&entry)?;
        stored.replace_status_from(obj)?;
        stored.validate()?;
        let revision = self
            .kv
            .put(&key, encode_for_store(&stored)?, Some(entry.revision))
            .await?;
        stored.metadata_mut().resource_version = revision;
        Ok(stored)
    }

    /// Fetch one object
    pub async fn get(&self, kind: Kind, namespace: Option<&str>, name: &str) -> Result<Object> {
        let key = object_key(kind, namespace, name)?;
        let entry = self
            .kv
            .get(&key)
            .await?
            .ok_or_else(|| Error::not_found(&key))?;
        decode_entry(&entry)
    }

    /// List a kind, optionally scoped to one namespace
    pub async fn list(&self, kind: Kind, namespace: Option<&str>) -> Result<Vec<Object>> {
        let entries = self.kv.range(&kind_prefix(kind, namespace)).await?;
        let mut objects = Vec::with_capacity(entries.len());
        for entry in &entries {
            match decode_entry(entry) {
                Ok(obj) => objects.push(obj),
                // A corrupt payload must not poison the whole list.
                Err(err) => warn!(key = %entry.key, error = %err, "skipping undecodable object"),
            }
        }
        Ok(objects)
    }

    /// List plus the revision to resume a watch from
    pub async fn list_and_version(
        &self,
        kind: Kind,
        namespace: Option<&str>,
    ) -> Result<(Vec<Object>, i64)> {
        let revision = self.kv.current_revision().await?;
        let objects = self.list(kind, namespace).await?;
        Ok((objects, revision))
    }

    /// Remove one object, returning its final state.
    ///
    /// Deleting a Namespace cascades to every namespaced object keyed
    /// under it before the namespace key itself is removed.
    pub async fn delete(&self, kind: Kind, namespace: Option<&str>, name: &str) -> Result<Object> {
        if kind == Kind::Namespace {
            self.cascade_namespace(name).await?;
        }
        let key = object_key(kind, namespace, name)?;
        let entry = self.kv.delete(&key, None).await?;
        decode_entry(&entry)
    }

    /// Remove every namespaced object living in `namespace`
    async fn cascade_namespace(&self, namespace: &str) -> Result<()> {
        for kind in Kind::namespaced_kinds() {
            let removed = self
                .kv
                .delete_prefix(&kind_prefix(kind, Some(namespace)))
                .await?;
            if !removed.is_empty() {
                warn!(
                    namespace = %namespace,
                    kind = %kind,
                    count = removed.len(),
                    "namespace cascade removed objects"
                );
            }
        }
        Ok(())
    }

    /// Watch a kind.
    ///
    /// Without `from_version` the stream opens with a synthetic ADD for
    /// every object currently in the store, then continues live. With a
    /// resume point it replays every event at or after it, failing
    /// `WatchGap` when the retention window has moved past it.
    pub async fn watch(
        &self,
        kind: Kind,
        namespace: Option<&str>,
        from_version: Option<i64>,
    ) -> Result<ObjectWatchStream> {
        let prefix = kind_prefix(kind, namespace);
        match from_version {
            Some(from) => {
                let raw = self.kv.watch(&prefix, Some(from)).await?;
                Ok(Box::pin(raw.filter_map(|item| async move {
                    map_kv_event(item)
                })))
            }
            None => {
                let (objects, revision) = self.list_and_version(kind, namespace).await?;
                let raw = self.kv.watch(&prefix, Some(revision + 1)).await?;
                let initial = objects
                    .into_iter()
                    .map(|obj| Ok(WatchEvent::new(WatchEventType::Add, obj)));
                Ok(Box::pin(
                    futures::stream::iter(initial)
                        .chain(raw.filter_map(|item| async move { map_kv_event(item) })),
                ))
            }
        }
    }
}

fn map_kv_event(item: Result<crate::kv::KvWatchEvent>) -> Option<Result<WatchEvent>> {
    match item {
        Ok(ev) => match Object::decode(&ev.value) {
            Ok(mut obj) => {
                obj.metadata_mut().resource_version = ev.revision;
                Some(Ok(WatchEvent::new(ev.event_type, obj)))
            }
            Err(err) => {
                warn!(key = %ev.key, error = %err, "dropping undecodable watch event");
                None
            }
        },
        Err(err) => Some(Err(err)),
    }
}
