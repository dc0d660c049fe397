//! Endpoints controller
//!
//! Tracks, per service, how many ready replicas this cluster
//! contributes, records them in the service's Endpoints object, and on
//! the primary cluster materializes the imported endpoint sets through
//! the compatibility layer.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use skyshift_client::{ApiClient, Informer, InformerCache};
use skyshift_common::labels::match_labels;
use skyshift_common::object::{
    ApiObject, EndpointObject, Endpoints, EndpointsSpec, Job, Kind, Object, ObjectMeta,
    ReplicaState, Service,
};
use skyshift_common::{Error, Result};
use skyshift_manager::ClusterManager;

use crate::util::update_object_with;

/// Reconciliation interval; endpoints follow poll results, not events
const SYNC_INTERVAL: Duration = Duration::from_secs(3);

/// Count ready replicas this cluster contributes to a service
pub fn ready_endpoints(service: &Service, cluster: &str, jobs: &[Job]) -> u32 {
    if service.spec.selector.is_empty() {
        return 0;
    }
    jobs.iter()
        .filter(|job| {
            job.metadata.namespace == service.metadata.namespace
                && match_labels(&job.metadata.labels, &service.spec.selector)
        })
        .filter_map(|job| job.status.replica_status.get(cluster))
        .map(|slice| slice.get(&ReplicaState::Running).copied().unwrap_or(0))
        .sum()
}

/// Reconciles endpoint records for one cluster
pub struct EndpointsController {
    cluster_name: String,
    client: ApiClient,
    manager: Arc<dyn ClusterManager>,
    service_informer: Arc<Informer>,
    job_informer: Arc<Informer>,
    service_cache: InformerCache,
    job_cache: InformerCache,
}

impl EndpointsController {
    pub fn new(
        cluster_name: String,
        client: ApiClient,
        manager: Arc<dyn ClusterManager>,
    ) -> Self {
        let service_informer = Arc::new(Informer::new(client.clone(), Kind::Service, None));
        let job_informer = Arc::new(Informer::new(client.clone(), Kind::Job, None));
        let service_cache = service_informer.cache();
        let job_cache = job_informer.cache();
        Self {
            cluster_name,
            client,
            manager,
            service_informer,
            job_informer,
            service_cache,
            job_cache,
        }
    }

    /// Run until cancelled
    pub async fn run(&self, cancel: CancellationToken) {
        info!(cluster = %self.cluster_name, "endpoints controller starting");
        let mut tasks = Vec::new();
        for informer in [self.service_informer.clone(), self.job_informer.clone()] {
            let token = cancel.child_token();
            tasks.push(tokio::spawn(async move { informer.run(token).await }));
        }

        let mut interval = tokio::time::interval(SYNC_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            for service in self.service_cache.snapshot_of::<Service>() {
                if let Err(err) = self.reconcile(&service).await {
                    error!(
                        service = %service.metadata.name,
                        error = %err,
                        "endpoints reconciliation failed"
                    );
                }
            }
        }

        for task in tasks {
            let _ = task.await;
        }
        info!(cluster = %self.cluster_name, "endpoints controller stopped");
    }

    async fn reconcile(&self, service: &Service) -> Result<()> {
        let jobs = self.job_cache.snapshot_of::<Job>();
        let count = ready_endpoints(service, &self.cluster_name, &jobs);
        let namespace = service.metadata.namespace_or_default().to_string();
        let name = service.metadata.name.clone();

        let endpoints = self
            .ensure_endpoints_object(service, &namespace, &name, count)
            .await?;

        // The primary cluster owns the imported endpoint sets.
        let is_primary = endpoints.spec.primary_cluster.as_deref()
            == Some(self.cluster_name.as_str());
        if is_primary {
            match self.manager.import_endpoints(&endpoints, service).await {
                Ok(()) => debug!(service = %name, "imported endpoint sets"),
                Err(err) if err.is_unsupported() => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Create or update the Endpoints object with this cluster's record
    async fn ensure_endpoints_object(
        &self,
        service: &Service,
        namespace: &str,
        name: &str,
        count: u32,
    ) -> Result<Endpoints> {
        let cluster = self.cluster_name.clone();
        let primary = resolve_primary(service);
        let exposed = count > 0;

        let existing = self.client.get_as::<Endpoints>(Some(namespace), name).await;
        match existing {
            Ok(_) => {
                update_object_with::<Endpoints, _>(&self.client, Some(namespace), name, move |fresh| {
                    let record = EndpointObject {
                        num_endpoints: count,
                        exposed_to_cluster: exposed,
                    };
                    let mut changed = false;
                    if fresh.spec.primary_cluster.is_none() && primary.is_some() {
                        fresh.spec.primary_cluster = primary.clone();
                        changed = true;
                    }
                    // `auto` resolves to the cluster holding the first
                    // slice with live endpoints.
                    if fresh.spec.primary_cluster.is_none() && count > 0 {
                        fresh.spec.primary_cluster = Some(cluster.clone());
                        changed = true;
                    }
                    if fresh.spec.endpoints.get(&cluster) != Some(&record) {
                        fresh.spec.endpoints.insert(cluster.clone(), record);
                        changed = true;
                    }
                    changed
                })
                .await
            }
            Err(err) if err.is_not_found() => {
                let endpoints = Endpoints {
                    metadata: ObjectMeta::namespaced(name, namespace),
                    spec: EndpointsSpec {
                        selector: service.spec.selector.clone(),
                        endpoints: [(
                            cluster,
                            EndpointObject {
                                num_endpoints: count,
                                exposed_to_cluster: exposed,
                            },
                        )]
                        .into_iter()
                        .collect(),
                        primary_cluster: primary,
                    },
                    status: Default::default(),
                };
                match self.client.create(&Object::Endpoints(endpoints.clone())).await {
                    Ok(created) => Endpoints::try_from_object(created),
                    // Another skylet created it first; reread and merge.
                    Err(Error::AlreadyExists { .. }) => {
                        warn!(service = %name, "endpoints object appeared concurrently");
                        self.client.get_as::<Endpoints>(Some(namespace), name).await
                    }
                    Err(err) => Err(err),
                }
            }
            Err(err) => Err(err),
        }
    }
}

/// Resolve `auto` to the cluster holding the service's first slice
fn resolve_primary(service: &Service) -> Option<String> {
    match service.spec.primary_cluster.as_deref() {
        Some("auto") | None => None,
        Some(name) => Some(name.to_string()),
    }
}
