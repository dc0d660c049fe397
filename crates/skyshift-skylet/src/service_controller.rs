//! Service controller
//!
//! Reconciles Service objects onto this cluster: a service lands here
//! when it is the primary cluster or when its selector matches a job
//! holding replicas here. The assigned cluster IP flows back into the
//! service status.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use skyshift_client::{ApiClient, EventHandlers, Informer, InformerCache};
use skyshift_common::object::{Job, Kind, Object, Service};
use skyshift_common::labels::match_labels;
use skyshift_common::Result;
use skyshift_manager::ClusterManager;

use crate::util::update_object_with;

enum ServiceEvent {
    Changed(Service),
    Deleted(Service),
}

/// Whether a service belongs on `cluster`, given the jobs holding
/// replicas there.
pub fn service_relevant(service: &Service, cluster: &str, jobs: &[Job]) -> bool {
    if service.spec.primary_cluster.as_deref() == Some(cluster) {
        return true;
    }
    jobs.iter().any(|job| {
        job.status.replica_status.contains_key(cluster)
            && !service.spec.selector.is_empty()
            && match_labels(&job.metadata.labels, &service.spec.selector)
    })
}

/// Reconciles services for one cluster
pub struct ServiceController {
    cluster_name: String,
    client: ApiClient,
    manager: Arc<dyn ClusterManager>,
    service_informer: Arc<Informer>,
    job_informer: Arc<Informer>,
    job_cache: InformerCache,
    rx: mpsc::UnboundedReceiver<ServiceEvent>,
}

impl ServiceController {
    pub fn new(
        cluster_name: String,
        client: ApiClient,
        manager: Arc<dyn ClusterManager>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let service_informer = {
            let add_tx = tx.clone();
            let update_tx = tx.clone();
            let handlers = EventHandlers::new()
                .on_add(move |obj| {
                    if let Object::Service(service) = obj {
                        let _ = add_tx.send(ServiceEvent::Changed(service.clone()));
                    }
                })
                .on_update(move |_, new| {
                    if let Object::Service(service) = new {
                        let _ = update_tx.send(ServiceEvent::Changed(service.clone()));
                    }
                })
                .on_delete(move |obj| {
                    if let Object::Service(service) = obj {
                        let _ = tx.send(ServiceEvent::Deleted(service.clone()));
                    }
                });
            Arc::new(Informer::new(client.clone(), Kind::Service, None).with_handlers(handlers))
        };
        let job_informer = Arc::new(Informer::new(client.clone(), Kind::Job, None));
        let job_cache = job_informer.cache();
        Self {
            cluster_name,
            client,
            manager,
            service_informer,
            job_informer,
            job_cache,
            rx,
        }
    }

    /// Run until cancelled
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(cluster = %self.cluster_name, "service controller starting");
        let mut tasks = Vec::new();
        for informer in [self.service_informer.clone(), self.job_informer.clone()] {
            let token = cancel.child_token();
            tasks.push(tokio::spawn(async move { informer.run(token).await }));
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = self.rx.recv() => match event {
                    None => break,
                    Some(ServiceEvent::Changed(service)) => {
                        if let Err(err) = self.reconcile(&service).await {
                            error!(
                                service = %service.metadata.name,
                                error = %err,
                                "service reconciliation failed"
                            );
                        }
                    }
                    Some(ServiceEvent::Deleted(service)) => {
                        if let Err(err) = self.manager.delete_service(&service).await {
                            if !err.is_unsupported() {
                                warn!(
                                    service = %service.metadata.name,
                                    error = %err,
                                    "backend service delete failed"
                                );
                            }
                        }
                    }
                },
            }
        }

        for task in tasks {
            let _ = task.await;
        }
        info!(cluster = %self.cluster_name, "service controller stopped");
    }

    async fn reconcile(&self, service: &Service) -> Result<()> {
        let jobs = self.job_cache.snapshot_of::<Job>();
        if !service_relevant(service, &self.cluster_name, &jobs) {
            return Ok(());
        }

        let cluster_ip = match self.manager.submit_service(service).await {
            Ok(ip) => ip,
            Err(err) if err.is_unsupported() => {
                warn!(
                    cluster = %self.cluster_name,
                    service = %service.metadata.name,
                    "backend does not support services"
                );
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        info!(
            cluster = %self.cluster_name,
            service = %service.metadata.name,
            "service synced to backend"
        );

        // Only the primary cluster's IP is authoritative for status.
        if service.spec.primary_cluster.as_deref() == Some(self.cluster_name.as_str()) {
            if let Some(ip) = cluster_ip {
                let namespace = service.metadata.namespace_or_default().to_string();
                update_object_with::<Service, _>(
                    &self.client,
                    Some(&namespace),
                    &service.metadata.name,
                    move |fresh| {
                        if fresh.status.cluster_ip.as_deref() == Some(ip.as_str()) {
                            return false;
                        }
                        fresh.status.cluster_ip = Some(ip.clone());
                        true
                    },
                )
                .await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skyshift_common::object::{ObjectMeta, ReplicaState};

    fn service(selector: &[(&str, &str)], primary: Option<&str>) -> Service {
        let mut service = Service {
            metadata: ObjectMeta::namespaced("svc", "default"),
            ..Default::default()
        };
        service.spec.selector = selector
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        service.spec.primary_cluster = primary.map(String::from);
        service
    }

    fn job_on(cluster: &str, labels: &[(&str, &str)]) -> Job {
        let mut job = Job {
            metadata: ObjectMeta::namespaced("web", "default"),
            ..Default::default()
        };
        job.metadata.labels = labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        job.status
            .replica_status
            .entry(cluster.to_string())
            .or_default()
            .insert(ReplicaState::Running, 1);
        job
    }

    #[test]
    fn test_primary_cluster_is_always_relevant() {
        let svc = service(&[], Some("c1"));
        assert!(service_relevant(&svc, "c1", &[]));
        assert!(!service_relevant(&svc, "c2", &[]));
    }

    #[test]
    fn test_selector_matches_jobs_on_cluster() {
        let svc = service(&[("app", "web")], Some("other"));
        let jobs = [job_on("c1", &[("app", "web")])];
        assert!(service_relevant(&svc, "c1", &jobs));

        // Selector mismatch or wrong cluster: not relevant.
        let other_jobs = [job_on("c1", &[("app", "db")])];
        assert!(!service_relevant(&svc, "c1", &other_jobs));
        assert!(!service_relevant(&svc, "c2", &jobs));
    }

    #[test]
    fn test_empty_selector_only_follows_primary() {
        let svc = service(&[], None);
        let jobs = [job_on("c1", &[("app", "web")])];
        assert!(!service_relevant(&svc, "c1", &jobs));
    }
}
