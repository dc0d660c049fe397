//! Network controller
//!
//! Manages this cluster's half of mesh links: creates and destroys
//! tunnels through the compatibility layer and drives the Link phase
//! INIT → ACTIVE/FAILED. The first active link flips the cluster's
//! `network_enabled` flag.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use skyshift_client::{ApiClient, EventHandlers, Informer};
use skyshift_common::object::{Cluster, Kind, Link, LinkPhase, Object};
use skyshift_common::Result;
use skyshift_manager::ClusterManager;

use crate::util::update_object_with;

enum LinkEvent {
    Changed(Link),
    Deleted(Link),
}

/// Manages mesh peering for one cluster
pub struct NetworkController {
    cluster_name: String,
    client: ApiClient,
    manager: Arc<dyn ClusterManager>,
    link_informer: Arc<Informer>,
    rx: mpsc::UnboundedReceiver<LinkEvent>,
}

impl NetworkController {
    pub fn new(
        cluster_name: String,
        client: ApiClient,
        manager: Arc<dyn ClusterManager>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let link_informer = {
            let name = cluster_name.clone();
            let add_tx = tx.clone();
            let update_tx = tx.clone();
            let add_name = name.clone();
            let update_name = name.clone();
            let handlers = EventHandlers::new()
                .on_add(move |obj| {
                    if let Object::Link(link) = obj {
                        if link.spec.involves(&add_name) {
                            let _ = add_tx.send(LinkEvent::Changed(link.clone()));
                        }
                    }
                })
                .on_update(move |_, new| {
                    if let Object::Link(link) = new {
                        if link.spec.involves(&update_name) {
                            let _ = update_tx.send(LinkEvent::Changed(link.clone()));
                        }
                    }
                })
                .on_delete(move |obj| {
                    if let Object::Link(link) = obj {
                        if link.spec.involves(&name) {
                            let _ = tx.send(LinkEvent::Deleted(link.clone()));
                        }
                    }
                });
            Arc::new(Informer::new(client.clone(), Kind::Link, None).with_handlers(handlers))
        };
        Self {
            cluster_name,
            client,
            manager,
            link_informer,
            rx,
        }
    }

    /// Run until cancelled
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(cluster = %self.cluster_name, "network controller starting");
        let informer = self.link_informer.clone();
        let informer_task = {
            let token = cancel.child_token();
            tokio::spawn(async move { informer.run(token).await })
        };

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = self.rx.recv() => match event {
                    None => break,
                    Some(LinkEvent::Changed(link)) => {
                        if link.status.phase == LinkPhase::Init {
                            if let Err(err) = self.establish(&link).await {
                                error!(link = %link.metadata.name, error = %err, "link setup failed");
                            }
                        }
                    }
                    Some(LinkEvent::Deleted(link)) => {
                        if let Err(err) = self.manager.delete_link(&link).await {
                            if !err.is_unsupported() {
                                warn!(link = %link.metadata.name, error = %err, "link teardown failed");
                            }
                        }
                    }
                },
            }
        }

        let _ = informer_task.await;
        info!(cluster = %self.cluster_name, "network controller stopped");
    }

    async fn establish(&self, link: &Link) -> Result<()> {
        let phase = match self.manager.create_link(link).await {
            Ok(()) => LinkPhase::Active,
            Err(err) => {
                warn!(
                    cluster = %self.cluster_name,
                    link = %link.metadata.name,
                    error = %err,
                    "link establishment failed"
                );
                LinkPhase::Failed
            }
        };

        update_object_with::<Link, _>(&self.client, None, &link.metadata.name, move |fresh| {
            if fresh.status.phase == phase {
                return false;
            }
            fresh.status.set_phase(phase);
            true
        })
        .await?;

        if phase == LinkPhase::Active {
            info!(
                cluster = %self.cluster_name,
                link = %link.metadata.name,
                "link active"
            );
            update_object_with::<Cluster, _>(&self.client, None, &self.cluster_name, |fresh| {
                if fresh.status.network_enabled {
                    return false;
                }
                fresh.status.network_enabled = true;
                true
            })
            .await?;
        }
        Ok(())
    }
}
