//! Skylet manager
//!
//! Watches Cluster objects and keeps one skylet per cluster alive:
//! spawned on READY, torn down on DELETE or after a cluster lingers in
//! ERROR beyond the grace period. Skylets are isolated tasks: a crash
//! in one restarts only that skylet, with exponential backoff capped at
//! the configured attempt budget.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use skyshift_client::{ApiClient, EventHandlers, Informer};
use skyshift_common::object::{Cluster, ClusterState, Job, Kind, Object, ReplicaState};
use skyshift_common::retry::BackoffPolicy;
use skyshift_common::Result;

use crate::skylet::{run_skylet, SkyletConfig};
use crate::util::update_object_with;

/// How often the ERROR grace period is evaluated
const GRACE_CHECK_INTERVAL: Duration = Duration::from_secs(5);

enum ClusterEvent {
    Changed(Cluster),
    Deleted(Cluster),
}

struct SkyletHandle {
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

/// Lifecycle controller for skylets
pub struct SkyletManager {
    client: ApiClient,
    config: SkyletConfig,
    informer: Arc<Informer>,
    rx: mpsc::UnboundedReceiver<ClusterEvent>,
    skylets: Arc<DashMap<String, SkyletHandle>>,
    error_since: DashMap<String, Instant>,
}

impl SkyletManager {
    pub fn new(client: ApiClient, config: SkyletConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let informer = {
            let add_tx = tx.clone();
            let update_tx = tx.clone();
            let handlers = EventHandlers::new()
                .on_add(move |obj| {
                    if let Object::Cluster(cluster) = obj {
                        let _ = add_tx.send(ClusterEvent::Changed(cluster.clone()));
                    }
                })
                .on_update(move |_, new| {
                    if let Object::Cluster(cluster) = new {
                        let _ = update_tx.send(ClusterEvent::Changed(cluster.clone()));
                    }
                })
                .on_delete(move |obj| {
                    if let Object::Cluster(cluster) = obj {
                        let _ = tx.send(ClusterEvent::Deleted(cluster.clone()));
                    }
                });
            Arc::new(Informer::new(client.clone(), Kind::Cluster, None).with_handlers(handlers))
        };
        Self {
            client,
            config,
            informer,
            rx,
            skylets: Arc::new(DashMap::new()),
            error_since: DashMap::new(),
        }
    }

    /// Run until cancelled
    pub async fn run(mut self, cancel: CancellationToken) {
        info!("skylet manager starting");
        let informer = self.informer.clone();
        let informer_task = {
            let token = cancel.child_token();
            tokio::spawn(async move { informer.run(token).await })
        };

        let mut grace_tick = tokio::time::interval(GRACE_CHECK_INTERVAL);
        grace_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = self.rx.recv() => match event {
                    None => break,
                    Some(ClusterEvent::Changed(cluster)) => self.on_cluster_changed(cluster, &cancel),
                    Some(ClusterEvent::Deleted(cluster)) => {
                        let name = cluster.metadata.name.clone();
                        info!(cluster = %name, "cluster deleted, tearing down skylet");
                        self.stop_skylet(&name);
                        self.error_since.remove(&name);
                        let client = self.client.clone();
                        tokio::spawn(async move {
                            if let Err(err) = purge_cluster_slices(&client, &name).await {
                                error!(cluster = %name, error = %err, "slice purge failed");
                            }
                        });
                    }
                },
                _ = grace_tick.tick() => self.enforce_error_grace(),
            }
        }

        // Tear everything down before returning.
        let names: Vec<String> = self.skylets.iter().map(|e| e.key().clone()).collect();
        for name in names {
            self.stop_skylet(&name);
        }
        let _ = informer_task.await;
        info!("skylet manager stopped");
    }

    fn on_cluster_changed(&self, cluster: Cluster, cancel: &CancellationToken) {
        let name = cluster.metadata.name.clone();
        match cluster.status.status {
            ClusterState::Ready => {
                self.error_since.remove(&name);
                self.ensure_running(cluster, cancel);
            }
            ClusterState::Error => {
                self.error_since.entry(name).or_insert_with(Instant::now);
            }
            // INIT clusters get a skylet too: its cluster controller is
            // what verifies the cluster and drives it to READY.
            ClusterState::Init => self.ensure_running(cluster, cancel),
            ClusterState::Provisioning | ClusterState::Deleting => {}
        }
    }

    fn ensure_running(&self, cluster: Cluster, cancel: &CancellationToken) {
        let name = cluster.metadata.name.clone();
        if self.skylets.contains_key(&name) {
            return;
        }
        info!(cluster = %name, "launching skylet");
        let token = cancel.child_token();
        let task = tokio::spawn(run_supervised(
            cluster,
            self.client.clone(),
            self.config.clone(),
            token.clone(),
        ));
        self.skylets.insert(name, SkyletHandle { cancel: token, task });
    }

    fn stop_skylet(&self, name: &str) {
        if let Some((_, handle)) = self.skylets.remove(name) {
            handle.cancel.cancel();
            // Let the task drain in the background; a cancelled skylet
            // releases its manager handle before exiting.
            tokio::spawn(async move {
                let _ = handle.task.await;
            });
        }
    }

    fn enforce_error_grace(&self) {
        let expired: Vec<String> = self
            .error_since
            .iter()
            .filter(|entry| entry.value().elapsed() >= self.config.error_grace)
            .map(|entry| entry.key().clone())
            .collect();
        for name in expired {
            if self.skylets.contains_key(&name) {
                warn!(cluster = %name, "cluster in ERROR beyond grace period, stopping skylet");
                self.stop_skylet(&name);
            }
            self.error_since.remove(&name);
        }
    }
}

/// Run one skylet, restarting on failure with exponential backoff
async fn run_supervised(
    cluster: Cluster,
    client: ApiClient,
    config: SkyletConfig,
    cancel: CancellationToken,
) {
    let name = cluster.metadata.name.clone();
    let backoff = BackoffPolicy::unbounded();
    let mut attempts = 0u32;

    while !cancel.is_cancelled() {
        match run_skylet(cluster.clone(), client.clone(), config.clone(), cancel.child_token()).await
        {
            Ok(()) => return,
            Err(err) => {
                attempts += 1;
                if attempts > config.max_restarts {
                    error!(
                        cluster = %name,
                        error = %err,
                        attempts,
                        "skylet exceeded restart budget, giving up"
                    );
                    return;
                }
                let delay = backoff.delay(attempts - 1);
                warn!(
                    cluster = %name,
                    error = %err,
                    attempt = attempts,
                    delay_ms = delay.as_millis(),
                    "skylet crashed, restarting"
                );
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

/// A deleted cluster leaves no record behind: its slice in every job is
/// marked EVICTED (re-entering the scheduler) and its backend ids are
/// dropped.
pub async fn purge_cluster_slices(client: &ApiClient, cluster_name: &str) -> Result<()> {
    let jobs = client.list(Kind::Job, None).await?;
    for obj in jobs.objects {
        let Object::Job(job) = obj else { continue };
        if !job.status.replica_status.contains_key(cluster_name) {
            continue;
        }
        let namespace = job.metadata.namespace_or_default().to_string();
        let cluster = cluster_name.to_string();
        update_object_with::<Job, _>(client, Some(&namespace), &job.metadata.name, move |fresh| {
            let Some(slice) = fresh.status.replica_status.get_mut(&cluster) else {
                return false;
            };
            let total: u32 = slice
                .iter()
                .filter(|(state, _)| !matches!(state, ReplicaState::Evicted))
                .map(|(_, count)| *count)
                .sum();
            slice.clear();
            slice.insert(ReplicaState::Evicted, total);
            fresh.status.job_ids.remove(&cluster);
            true
        })
        .await?;
        info!(
            cluster = %cluster_name,
            job = %job.metadata.name,
            "purged slice of deleted cluster"
        );
    }
    Ok(())
}
