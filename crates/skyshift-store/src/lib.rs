//! Storage core for the SkyShift control plane
//!
//! Two layers: [`kv`] is the transactional driver contract with etcd and
//! in-memory implementations; [`object_store`] is the typed, namespaced
//! object layer with optimistic concurrency and watch fan-out that the
//! API server and informers build on.

pub mod kv;
pub mod object_store;

pub use kv::{EtcdStore, KvEntry, KvStore, KvWatchEvent, KvWatchStream, MemoryStore};
pub use object_store::{kind_prefix, object_key, ObjectStore, ObjectWatchStream, REGISTRY_PREFIX};
