//! Informer: cache-backed watch client
//!
//! Maintains the most-recent state of one kind in a local cache and
//! delivers Add/Update/Delete callbacks. On start it lists, then watches
//! from the list's revision. On disconnect it backs off and resumes from
//! its cursor; when the store signals a gap it relists and emits a
//! synthetic diff (adds for new keys, deletes for missing keys, updates
//! for version changes).

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use skyshift_common::object::{ApiObject, Kind, Object, WatchEvent, WatchEventType};
use skyshift_common::retry::BackoffPolicy;
use skyshift_common::{Error, Result};

use crate::client::ApiClient;

/// Callback for added objects
pub type AddHandler = Arc<dyn Fn(&Object) + Send + Sync>;
/// Callback for updated objects: (old, new)
pub type UpdateHandler = Arc<dyn Fn(&Object, &Object) + Send + Sync>;
/// Callback for deleted objects
pub type DeleteHandler = Arc<dyn Fn(&Object) + Send + Sync>;

/// Event callbacks an informer delivers.
///
/// Handlers run on the informer's receive loop and must not block; push
/// work onto a queue and return.
#[derive(Clone, Default)]
pub struct EventHandlers {
    on_add: Option<AddHandler>,
    on_update: Option<UpdateHandler>,
    on_delete: Option<DeleteHandler>,
}

impl EventHandlers {
    /// No callbacks; cache maintenance only
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the add callback and return self for chaining
    pub fn on_add(mut self, handler: impl Fn(&Object) + Send + Sync + 'static) -> Self {
        self.on_add = Some(Arc::new(handler));
        self
    }

    /// Set the update callback and return self for chaining
    pub fn on_update(mut self, handler: impl Fn(&Object, &Object) + Send + Sync + 'static) -> Self {
        self.on_update = Some(Arc::new(handler));
        self
    }

    /// Set the delete callback and return self for chaining
    pub fn on_delete(mut self, handler: impl Fn(&Object) + Send + Sync + 'static) -> Self {
        self.on_delete = Some(Arc::new(handler));
        self
    }
}

/// Shareable read handle over an informer's cache.
///
/// Readers get copies; the informer's receive loop is the single writer.
#[derive(Clone, Default)]
pub struct InformerCache {
    inner: Arc<RwLock<HashMap<String, Object>>>,
}

impl InformerCache {
    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Object>> {
        self.inner.read().expect("informer cache lock poisoned")
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Object>> {
        self.inner.write().expect("informer cache lock poisoned")
    }

    /// Copy of every cached object
    pub fn snapshot(&self) -> Vec<Object> {
        self.read().values().cloned().collect()
    }

    /// Copy of every cached object, downcast to `T`
    pub fn snapshot_of<T: ApiObject>(&self) -> Vec<T> {
        self.read()
            .values()
            .cloned()
            .filter_map(|obj| T::try_from_object(obj).ok())
            .collect()
    }

    /// Copy of one object by cache key (`<namespace>/<name>` or `<name>`)
    pub fn get(&self, key: &str) -> Option<Object> {
        self.read().get(key).cloned()
    }

    /// Number of cached objects
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}

/// A per-kind watch client maintaining a local cache
pub struct Informer {
    client: ApiClient,
    kind: Kind,
    namespace: Option<String>,
    cache: InformerCache,
    handlers: EventHandlers,
    backoff: BackoffPolicy,
}

impl Informer {
    /// Create an informer for `kind`; `namespace: None` covers all
    /// namespaces (and is the only choice for global kinds).
    pub fn new(client: ApiClient, kind: Kind, namespace: Option<String>) -> Self {
        Self {
            client,
            kind,
            namespace,
            cache: InformerCache::default(),
            handlers: EventHandlers::default(),
            backoff: BackoffPolicy::unbounded(),
        }
    }

    /// Attach event callbacks and return self for chaining
    pub fn with_handlers(mut self, handlers: EventHandlers) -> Self {
        self.handlers = handlers;
        self
    }

    /// A shareable handle to this informer's cache
    pub fn cache(&self) -> InformerCache {
        self.cache.clone()
    }

    /// Run until cancelled: list, watch, reconnect with backoff, relist
    /// on gaps.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut cursor: Option<i64> = None;
        let mut attempt = 0u32;
        info!(kind = %self.kind, namespace = ?self.namespace, "informer starting");

        while !cancel.is_cancelled() {
            match self.sync_once(&mut cursor, &cancel).await {
                Ok(()) => {
                    if cancel.is_cancelled() {
                        break;
                    }
                    // Stream ended cleanly; reconnect from the cursor.
                    attempt = 0;
                    debug!(kind = %self.kind, "watch stream ended, reconnecting");
                }
                Err(Error::WatchGap { .. }) => {
                    warn!(kind = %self.kind, "watch gap, relisting");
                    cursor = None;
                }
                Err(err) => {
                    attempt = attempt.saturating_add(1);
                    warn!(kind = %self.kind, error = %err, attempt, "informer disconnected");
                }
            }

            let delay = self.backoff.delay(attempt.min(7));
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        info!(kind = %self.kind, "informer stopped");
    }

    async fn sync_once(&self, cursor: &mut Option<i64>, cancel: &CancellationToken) -> Result<()> {
        if cursor.is_none() {
            let list = self.client.list(self.kind, self.namespace.as_deref()).await?;
            let version = list.resource_version.unwrap_or(0);
            self.reconcile_list(list.objects);
            *cursor = Some(version);
        }

        let from = cursor.map(|c| c + 1);
        let mut stream = self
            .client
            .watch(self.kind, self.namespace.as_deref(), from)
            .await?;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                item = stream.next() => match item {
                    Some(Ok(event)) => self.apply(event, cursor),
                    Some(Err(err)) => return Err(err),
                    None => return Ok(()),
                }
            }
        }
    }

    /// Replace the cache from a fresh list, emitting a synthetic diff
    fn reconcile_list(&self, objects: Vec<Object>) {
        let fresh: HashMap<String, Object> = objects
            .into_iter()
            .map(|obj| (obj.cache_key(), obj))
            .collect();

        let stale: Vec<(String, Object)> = {
            let cache = self.cache.read();
            cache
                .iter()
                .filter(|(key, _)| !fresh.contains_key(*key))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        };

        for (key, old) in stale {
            self.cache.write().remove(&key);
            if let Some(handler) = &self.handlers.on_delete {
                handler(&old);
            }
        }

        for (key, obj) in fresh {
            let old = self.cache.read().get(&key).cloned();
            match old {
                None => {
                    self.cache.write().insert(key, obj.clone());
                    if let Some(handler) = &self.handlers.on_add {
                        handler(&obj);
                    }
                }
                Some(old)
                    if old.metadata().resource_version != obj.metadata().resource_version =>
                {
                    self.cache.write().insert(key, obj.clone());
                    if let Some(handler) = &self.handlers.on_update {
                        handler(&old, &obj);
                    }
                }
                Some(_) => {}
            }
        }
    }

    /// Apply one watch event to the cache and advance the cursor
    fn apply(&self, event: WatchEvent, cursor: &mut Option<i64>) {
        let version = event.object.metadata().resource_version;
        if version > cursor.unwrap_or(0) {
            *cursor = Some(version);
        }
        let key = event.object.cache_key();
        match event.event_type {
            WatchEventType::Add | WatchEventType::Update => {
                let old = self.cache.read().get(&key).cloned();
                match old {
                    None => {
                        self.cache.write().insert(key, event.object.clone());
                        if let Some(handler) = &self.handlers.on_add {
                            handler(&event.object);
                        }
                    }
                    // Replays of events the cache already reflects are dropped.
                    Some(old) if old.metadata().resource_version == version => {}
                    Some(old) => {
                        self.cache.write().insert(key, event.object.clone());
                        if let Some(handler) = &self.handlers.on_update {
                            handler(&old, &event.object);
                        }
                    }
                }
            }
            WatchEventType::Delete => {
                if self.cache.write().remove(&key).is_some() {
                    if let Some(handler) = &self.handlers.on_delete {
                        handler(&event.object);
                    }
                }
            }
        }
    }
}
