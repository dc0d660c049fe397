//! KV driver contract
//!
//! The driver guarantees per-key linearizability and ordered watch
//! delivery per prefix. Revisions are global and monotonically
//! increasing; the per-key version starts at 1 on first put, which is how
//! watch consumers distinguish ADD from UPDATE.

pub mod etcd;
pub mod memory;

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use skyshift_common::object::WatchEventType;
use skyshift_common::Result;

pub use etcd::EtcdStore;
pub use memory::MemoryStore;

/// One stored key-value pair
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KvEntry {
    /// Full key
    pub key: String,
    /// Opaque payload
    pub value: Vec<u8>,
    /// Global revision at which this value was written (or deleted)
    pub revision: i64,
    /// Per-key version, 1 on first put
    pub version: i64,
}

/// One watch event
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KvWatchEvent {
    /// ADD on first put, UPDATE on later puts, DELETE on removal
    pub event_type: WatchEventType,
    /// Full key
    pub key: String,
    /// The written value; the prior value for deletes
    pub value: Vec<u8>,
    /// Global revision of the change
    pub revision: i64,
}

/// Ordered stream of watch events for one prefix
pub type KvWatchStream = Pin<Box<dyn Stream<Item = Result<KvWatchEvent>> + Send>>;

/// Transactional get/put/delete/compare-and-swap with prefix range and watch.
///
/// `expected` on mutations drives optimistic concurrency:
/// - `None`: unconditional write
/// - `Some(0)`: create-only; fails `AlreadyExists` when the key exists
/// - `Some(rev)`: compare-and-swap; fails `Conflict` unless the key's
///   current revision equals `rev`, or `NotFound` when the key is gone
#[async_trait]
pub trait KvStore: Send + Sync + 'static {
    /// Read one key
    async fn get(&self, key: &str) -> Result<Option<KvEntry>>;

    /// Write one key, returning the new revision
    async fn put(&self, key: &str, value: Vec<u8>, expected: Option<i64>) -> Result<i64>;

    /// Remove one key, returning the prior entry stamped with the
    /// deletion revision
    async fn delete(&self, key: &str, expected: Option<i64>) -> Result<KvEntry>;

    /// Remove every key under a prefix, returning the prior entries
    async fn delete_prefix(&self, prefix: &str) -> Result<Vec<KvEntry>>;

    /// Read every key under a prefix
    async fn range(&self, prefix: &str) -> Result<Vec<KvEntry>>;

    /// The store's current global revision
    async fn current_revision(&self) -> Result<i64>;

    /// Watch a prefix. `from_revision` is the inclusive resume point;
    /// `None` starts at the next write. A resume point older than the
    /// retained history fails with `WatchGap` and the consumer must
    /// relist.
    async fn watch(&self, prefix: &str, from_revision: Option<i64>) -> Result<KvWatchStream>;
}
