//! In-process KV driver
//!
//! Single-node stand-in for etcd with the same revision semantics:
//! a global revision counter, per-key versions, CAS on mutation, and
//! prefix watches backed by a bounded replay buffer. Watchers that fall
//! behind the broadcast channel are disconnected and must reconnect with
//! a resume revision.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;

use skyshift_common::object::WatchEventType;
use skyshift_common::{Error, Result};

use super::{KvEntry, KvStore, KvWatchEvent, KvWatchStream};

/// Watch events retained for resume
const DEFAULT_REPLAY_CAPACITY: usize = 1024;

/// Broadcast channel depth; a consumer this far behind is disconnected
const BROADCAST_CAPACITY: usize = 1024;

#[derive(Clone)]
struct Stored {
    value: Vec<u8>,
    revision: i64,
    version: i64,
}

struct Inner {
    entries: BTreeMap<String, Stored>,
    revision: i64,
    replay: VecDeque<KvWatchEvent>,
    replay_capacity: usize,
    /// Highest revision evicted from the replay buffer; resumes at or
    /// below this point have gaps
    dropped_through: i64,
    tx: broadcast::Sender<KvWatchEvent>,
}

impl Inner {
    fn publish(&mut self, event: KvWatchEvent) {
        if self.replay.len() == self.replay_capacity {
            if let Some(evicted) = self.replay.pop_front() {
                self.dropped_through = evicted.revision;
            }
        }
        self.replay.push_back(event.clone());
        // No receivers is fine; replay covers late subscribers.
        let _ = self.tx.send(event);
    }
}

/// In-memory [`KvStore`] implementation
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create a store with the default replay capacity
    pub fn new() -> Self {
        Self::with_replay_capacity(DEFAULT_REPLAY_CAPACITY)
    }

    /// Create a store retaining `capacity` watch events for resume
    pub fn with_replay_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            inner: Arc::new(Mutex::new(Inner {
                entries: BTreeMap::new(),
                revision: 0,
                replay: VecDeque::new(),
                replay_capacity: capacity.max(1),
                dropped_through: 0,
                tx,
            })),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // Lock poisoning only happens if a writer panicked mid-mutation;
        // the store would be inconsistent either way.
        self.inner.lock().expect("memory store lock poisoned")
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<KvEntry>> {
        let inner = self.lock();
        Ok(inner.entries.get(key).map(|stored| KvEntry {
            key: key.to_string(),
            value: stored.value.clone(),
            revision: stored.revision,
            version: stored.version,
        }))
    }

    async fn put(&self, key: &str, value: Vec<u8>, expected: Option<i64>) -> Result<i64> {
        let mut inner = self.lock();
        let version = match (inner.entries.get(key), expected) {
            (Some(_), Some(0)) => return Err(Error::already_exists(key)),
            (Some(stored), Some(rev)) if stored.revision != rev => {
                return Err(Error::conflict(key, rev))
            }
            (Some(stored), _) => stored.version + 1,
            (None, Some(rev)) if rev > 0 => return Err(Error::not_found(key)),
            (None, _) => 1,
        };

        inner.revision += 1;
        let revision = inner.revision;
        inner.entries.insert(
            key.to_string(),
            Stored {
                value: value.clone(),
                revision,
                version,
            },
        );
        let event_type = if version == 1 {
            WatchEventType::Add
        } else {
            WatchEventType::Update
        };
        inner.publish(KvWatchEvent {
            event_type,
            key: key.to_string(),
            value,
            revision,
        });
        Ok(revision)
    }

    async fn delete(&self, key: &str, expected: Option<i64>) -> Result<KvEntry> {
        let mut inner = self.lock();
        let stored = match inner.entries.get(key) {
            None => return Err(Error::not_found(key)),
            Some(stored) => {
                if let Some(rev) = expected {
                    if stored.revision != rev {
                        return Err(Error::conflict(key, rev));
                    }
                }
                stored.clone()
            }
        };

        inner.entries.remove(key);
        inner.revision += 1;
        let revision = inner.revision;
        inner.publish(KvWatchEvent {
            event_type: WatchEventType::Delete,
            key: key.to_string(),
            value: stored.value.clone(),
            revision,
        });
        Ok(KvEntry {
            key: key.to_string(),
            value: stored.value,
            revision,
            version: stored.version,
        })
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<Vec<KvEntry>> {
        let mut inner = self.lock();
        let keys: Vec<String> = inner
            .entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect();

        let mut removed = Vec::with_capacity(keys.len());
        for key in keys {
            let stored = inner.entries.remove(&key).expect("key listed above");
            inner.revision += 1;
            let revision = inner.revision;
            inner.publish(KvWatchEvent {
                event_type: WatchEventType::Delete,
                key: key.clone(),
                value: stored.value.clone(),
                revision,
            });
            removed.push(KvEntry {
                key,
                value: stored.value,
                revision,
                version: stored.version,
            });
        }
        Ok(removed)
    }

    async fn range(&self, prefix: &str) -> Result<Vec<KvEntry>> {
        let inner = self.lock();
        Ok(inner
            .entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(key, stored)| KvEntry {
                key: key.clone(),
                value: stored.value.clone(),
                revision: stored.revision,
                version: stored.version,
            })
            .collect())
    }

    async fn current_revision(&self) -> Result<i64> {
        Ok(self.lock().revision)
    }

    async fn watch(&self, prefix: &str, from_revision: Option<i64>) -> Result<KvWatchStream> {
        let prefix = prefix.to_string();
        // Subscribe and snapshot the replay under one lock so no revision
        // can slip between the two.
        let (replayed, rx) = {
            let inner = self.lock();
            let replayed: Vec<KvWatchEvent> = match from_revision {
                Some(from) => {
                    if from <= inner.dropped_through {
                        return Err(Error::WatchGap {
                            prefix,
                            requested: from,
                        });
                    }
                    inner
                        .replay
                        .iter()
                        .filter(|ev| ev.revision >= from && ev.key.starts_with(&prefix))
                        .cloned()
                        .collect()
                }
                None => Vec::new(),
            };
            (replayed, inner.tx.subscribe())
        };

        let cutoff = replayed.last().map(|ev| ev.revision).unwrap_or(0);
        let live = BroadcastStream::new(rx).filter_map(move |item| {
            let prefix = prefix.clone();
            async move {
                match item {
                    Ok(ev) if ev.key.starts_with(&prefix) && ev.revision > cutoff => Some(Ok(ev)),
                    Ok(_) => None,
                    Err(BroadcastStreamRecvError::Lagged(missed)) => Some(Err(Error::transient(
                        "watch",
                        format!("consumer lagged by {missed} events; reconnect with resume"),
                    ))),
                }
            }
        });

        Ok(Box::pin(
            futures::stream::iter(replayed.into_iter().map(Ok)).chain(live),
        ))
    }
}
