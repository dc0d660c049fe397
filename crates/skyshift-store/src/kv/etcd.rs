//! etcd-backed KV driver
//!
//! Maps the driver contract onto etcd semantics: the global revision is
//! etcd's `mod_revision`, CAS runs as transactions over `mod_revision`
//! (or `version == 0` for create-only puts), and the per-key `version`
//! field distinguishes ADD from UPDATE on watch.

use async_trait::async_trait;
use etcd_client::{
    Client, Compare, CompareOp, DeleteOptions, EventType, GetOptions, Txn, TxnOp, TxnOpResponse,
    WatchOptions,
};
use futures::StreamExt;
use tracing::warn;

use skyshift_common::object::WatchEventType;
use skyshift_common::{Error, Result};

use super::{KvEntry, KvStore, KvWatchEvent, KvWatchStream};

fn etcd_err(err: etcd_client::Error) -> Error {
    Error::transient("etcd", err.to_string())
}

fn entry_from_kv(kv: &etcd_client::KeyValue) -> Result<KvEntry> {
    Ok(KvEntry {
        key: kv.key_str().map_err(etcd_err)?.to_string(),
        value: kv.value().to_vec(),
        revision: kv.mod_revision(),
        version: kv.version(),
    })
}

/// etcd-backed [`KvStore`] implementation
#[derive(Clone)]
pub struct EtcdStore {
    client: Client,
}

impl EtcdStore {
    /// Connect to the given etcd endpoints
    pub async fn connect(endpoints: &[String]) -> Result<Self> {
        let client = Client::connect(endpoints, None).await.map_err(etcd_err)?;
        Ok(Self { client })
    }

    /// Distinguish Conflict from NotFound after a failed CAS transaction
    async fn cas_failure(&self, key: &str, expected: i64) -> Error {
        let mut kv = self.client.kv_client();
        match kv.get(key, None).await {
            Ok(resp) if resp.kvs().is_empty() => Error::not_found(key),
            Ok(_) => Error::conflict(key, expected),
            Err(err) => etcd_err(err),
        }
    }
}

#[async_trait]
impl KvStore for EtcdStore {
    async fn get(&self, key: &str) -> Result<Option<KvEntry>> {
        let mut kv = self.client.kv_client();
        let resp = kv.get(key, None).await.map_err(etcd_err)?;
        resp.kvs().first().map(entry_from_kv).transpose()
    }

    async fn put(&self, key: &str, value: Vec<u8>, expected: Option<i64>) -> Result<i64> {
        let mut kv = self.client.kv_client();
        match expected {
            None => {
                let resp = kv.put(key, value, None).await.map_err(etcd_err)?;
                Ok(resp.header().map(|h| h.revision()).unwrap_or(0))
            }
            Some(0) => {
                let txn = Txn::new()
                    .when(vec![Compare::version(key, CompareOp::Equal, 0)])
                    .and_then(vec![TxnOp::put(key, value, None)]);
                let resp = kv.txn(txn).await.map_err(etcd_err)?;
                if !resp.succeeded() {
                    return Err(Error::already_exists(key));
                }
                Ok(resp.header().map(|h| h.revision()).unwrap_or(0))
            }
            Some(rev) => {
                let txn = Txn::new()
                    .when(vec![Compare::mod_revision(key, CompareOp::Equal, rev)])
                    .and_then(vec![TxnOp::put(key, value, None)]);
                let resp = kv.txn(txn).await.map_err(etcd_err)?;
                if !resp.succeeded() {
                    return Err(self.cas_failure(key, rev).await);
                }
                Ok(resp.header().map(|h| h.revision()).unwrap_or(0))
            }
        }
    }

    async fn delete(&self, key: &str, expected: Option<i64>) -> Result<KvEntry> {
        let mut kv = self.client.kv_client();
        if let Some(rev) = expected {
            let txn = Txn::new()
                .when(vec![Compare::mod_revision(key, CompareOp::Equal, rev)])
                .and_then(vec![TxnOp::delete(
                    key,
                    Some(DeleteOptions::new().with_prev_key()),
                )]);
            let resp = kv.txn(txn).await.map_err(etcd_err)?;
            if !resp.succeeded() {
                return Err(self.cas_failure(key, rev).await);
            }
            let revision = resp.header().map(|h| h.revision()).unwrap_or(0);
            for op in resp.op_responses() {
                if let TxnOpResponse::Delete(del) = op {
                    if let Some(prev) = del.prev_kvs().first() {
                        let mut entry = entry_from_kv(prev)?;
                        entry.revision = revision;
                        return Ok(entry);
                    }
                }
            }
            Err(Error::not_found(key))
        } else {
            let resp = kv
                .delete(key, Some(DeleteOptions::new().with_prev_key()))
                .await
                .map_err(etcd_err)?;
            if resp.deleted() == 0 {
                return Err(Error::not_found(key));
            }
            let revision = resp.header().map(|h| h.revision()).unwrap_or(0);
            let prev = resp
                .prev_kvs()
                .first()
                .ok_or_else(|| Error::not_found(key))?;
            let mut entry = entry_from_kv(prev)?;
            entry.revision = revision;
            Ok(entry)
        }
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<Vec<KvEntry>> {
        let mut kv = self.client.kv_client();
        let resp = kv
            .delete(
                prefix,
                Some(DeleteOptions::new().with_prefix().with_prev_key()),
            )
            .await
            .map_err(etcd_err)?;
        let revision = resp.header().map(|h| h.revision()).unwrap_or(0);
        resp.prev_kvs()
            .iter()
            .map(|kv| {
                let mut entry = entry_from_kv(kv)?;
                entry.revision = revision;
                Ok(entry)
            })
            .collect()
    }

    async fn range(&self, prefix: &str) -> Result<Vec<KvEntry>> {
        let mut kv = self.client.kv_client();
        let resp = kv
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await
            .map_err(etcd_err)?;
        resp.kvs().iter().map(entry_from_kv).collect()
    }

    async fn current_revision(&self) -> Result<i64> {
        let mut kv = self.client.kv_client();
        let resp = kv
            .get("\0", Some(GetOptions::new().with_count_only()))
            .await
            .map_err(etcd_err)?;
        Ok(resp.header().map(|h| h.revision()).unwrap_or(0))
    }

    async fn watch(&self, prefix: &str, from_revision: Option<i64>) -> Result<KvWatchStream> {
        let mut options = WatchOptions::new().with_prefix().with_prev_key();
        if let Some(rev) = from_revision {
            options = options.with_start_revision(rev);
        }
        let mut client = self.client.clone();
        let (_watcher, stream) = client
            .watch(prefix, Some(options))
            .await
            .map_err(etcd_err)?;

        let prefix = prefix.to_string();
        let events = futures::stream::unfold(
            (stream, _watcher, prefix),
            |(mut stream, watcher, prefix)| async move {
                loop {
                    match stream.message().await {
                        Ok(Some(resp)) => {
                            // etcd signals a compacted resume point by
                            // cancelling the watch.
                            if resp.canceled() {
                                let err = Error::WatchGap {
                                    prefix: prefix.clone(),
                                    requested: resp.compact_revision(),
                                };
                                return Some((vec![Err(err)], (stream, watcher, prefix)));
                            }
                            let mapped: Vec<Result<KvWatchEvent>> = resp
                                .events()
                                .iter()
                                .filter_map(map_event)
                                .map(Ok)
                                .collect();
                            if mapped.is_empty() {
                                continue;
                            }
                            return Some((mapped, (stream, watcher, prefix)));
                        }
                        Ok(None) => return None,
                        Err(err) => {
                            return Some((
                                vec![Err(etcd_err(err))],
                                (stream, watcher, prefix),
                            ))
                        }
                    }
                }
            },
        )
        .flat_map(futures::stream::iter);

        Ok(Box::pin(events))
    }
}

/// Translate one etcd event; PUT with `version == 1` is an ADD, deletes
/// carry the prior value.
fn map_event(event: &etcd_client::Event) -> Option<KvWatchEvent> {
    let kv = event.kv()?;
    let key = match kv.key_str() {
        Ok(key) => key.to_string(),
        Err(err) => {
            warn!(error = %err, "dropping watch event with non-utf8 key");
            return None;
        }
    };
    match event.event_type() {
        EventType::Put => Some(KvWatchEvent {
            event_type: if kv.version() == 1 {
                WatchEventType::Add
            } else {
                WatchEventType::Update
            },
            key,
            value: kv.value().to_vec(),
            revision: kv.mod_revision(),
        }),
        EventType::Delete => {
            let value = event.prev_kv().map(|p| p.value().to_vec()).unwrap_or_default();
            Some(KvWatchEvent {
                event_type: WatchEventType::Delete,
                key,
                value,
                revision: kv.mod_revision(),
            })
        }
    }
}
