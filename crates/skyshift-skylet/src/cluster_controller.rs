//! Cluster controller
//!
//! Polls the compatibility layer's `describe()` on a fixed interval and
//! writes capacity, allocatable capacity and health back to the Cluster
//! object. Three consecutive failures mark the cluster ERROR; a
//! successful poll afterwards flips it back to READY.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use skyshift_client::ApiClient;
use skyshift_common::object::{Cluster, ClusterState};
use skyshift_common::Result;
use skyshift_manager::{ClusterManager, ClusterSnapshot};

use crate::util::update_object_with;

/// Default heartbeat interval
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(5);

/// Consecutive failures before the cluster is marked ERROR
pub const DEFAULT_RETRY_LIMIT: u32 = 3;

/// Tracks cluster health and capacity
pub struct ClusterController {
    cluster_name: String,
    client: ApiClient,
    manager: Arc<dyn ClusterManager>,
    heartbeat: Duration,
    retry_limit: u32,
}

impl ClusterController {
    pub fn new(
        cluster_name: String,
        client: ApiClient,
        manager: Arc<dyn ClusterManager>,
        heartbeat: Duration,
    ) -> Self {
        Self {
            cluster_name,
            client,
            manager,
            heartbeat,
            retry_limit: DEFAULT_RETRY_LIMIT,
        }
    }

    /// Poll until cancelled
    pub async fn run(&self, cancel: CancellationToken) {
        info!(cluster = %self.cluster_name, "cluster controller starting");
        let mut failures = 0u32;
        let mut interval = tokio::time::interval(self.heartbeat);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            match self.manager.describe().await {
                Ok(snapshot) => {
                    failures = 0;
                    if let Err(err) = self.report_healthy(snapshot).await {
                        warn!(cluster = %self.cluster_name, error = %err, "status write failed");
                    }
                }
                Err(err) => {
                    failures += 1;
                    warn!(
                        cluster = %self.cluster_name,
                        error = %err,
                        failures,
                        "cluster heartbeat failed"
                    );
                    if failures >= self.retry_limit {
                        if let Err(err) = self.report_unhealthy(&err.to_string()).await {
                            warn!(cluster = %self.cluster_name, error = %err, "status write failed");
                        }
                    }
                }
            }
        }
        info!(cluster = %self.cluster_name, "cluster controller stopped");
    }

    async fn report_healthy(&self, snapshot: ClusterSnapshot) -> Result<()> {
        debug!(cluster = %self.cluster_name, nodes = snapshot.capacity.len(), "heartbeat ok");
        update_object_with::<Cluster, _>(&self.client, None, &self.cluster_name, |cluster| {
            let changed = cluster.status.status != ClusterState::Ready
                || cluster.status.capacity != snapshot.capacity
                || cluster.status.allocatable_capacity != snapshot.allocatable
                || cluster.status.accelerator_types != snapshot.accelerator_types;
            if !changed {
                return false;
            }
            cluster.status.set_state(ClusterState::Ready);
            cluster.status.capacity = snapshot.capacity.clone();
            cluster.status.allocatable_capacity = snapshot.allocatable.clone();
            cluster.status.accelerator_types = snapshot.accelerator_types.clone();
            true
        })
        .await
        .map(|_| ())
    }

    /// Mark the cluster ERROR but keep polling: the connection may come
    /// back, and only the skylet manager tears skylets down.
    async fn report_unhealthy(&self, message: &str) -> Result<()> {
        let message = message.to_string();
        update_object_with::<Cluster, _>(&self.client, None, &self.cluster_name, move |cluster| {
            if cluster.status.status == ClusterState::Error {
                return false;
            }
            cluster.status.set_error(message.clone());
            true
        })
        .await
        .map(|_| ())
    }
}
