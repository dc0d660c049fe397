//! The Skylet: a per-cluster supervisor
//!
//! Opens the compatibility layer once, then launches the cluster, job
//! and flow controllers: plus the service, endpoints and network
//! controllers on Kubernetes clusters. A controller exiting early is an
//! abnormal condition surfaced to the skylet manager, which applies the
//! restart policy.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use skyshift_client::ApiClient;
use skyshift_common::object::{Cluster, ManagerType};
use skyshift_common::{Error, Result};
use skyshift_manager::setup_cluster_manager;

use crate::cluster_controller::{ClusterController, DEFAULT_HEARTBEAT};
use crate::endpoints_controller::EndpointsController;
use crate::flow_controller::FlowController;
use crate::job_controller::{JobController, DEFAULT_POLL_INTERVAL};
use crate::network_controller::NetworkController;
use crate::service_controller::ServiceController;

/// Tunables shared by every skylet
#[derive(Clone, Debug)]
pub struct SkyletConfig {
    /// Cluster health/capacity poll interval
    pub heartbeat_interval: Duration,
    /// Backend job state poll interval
    pub job_poll_interval: Duration,
    /// Evict jobs pending longer than this; `None` waits forever
    pub wait_timeout: Option<Duration>,
    /// How long a cluster may sit in ERROR before its skylet is torn down
    pub error_grace: Duration,
    /// Restart attempts before a skylet is given up on
    pub max_restarts: u32,
}

impl Default for SkyletConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT,
            job_poll_interval: DEFAULT_POLL_INTERVAL,
            wait_timeout: None,
            error_grace: Duration::from_secs(60),
            max_restarts: 5,
        }
    }
}

/// Run one skylet until cancelled.
///
/// Returns `Err` when a controller dies unexpectedly; the manager's
/// supervision loop decides whether to restart. The compatibility-layer
/// handle is released before returning, so a recreate starts clean.
pub async fn run_skylet(
    cluster: Cluster,
    client: ApiClient,
    config: SkyletConfig,
    cancel: CancellationToken,
) -> Result<()> {
    let name = cluster.metadata.name.clone();
    let manager = setup_cluster_manager(&cluster).await?;
    info!(cluster = %name, manager = %cluster.spec.manager, "skylet starting");

    let mut tasks = tokio::task::JoinSet::new();

    {
        let controller = ClusterController::new(
            name.clone(),
            client.clone(),
            manager.clone(),
            config.heartbeat_interval,
        );
        let token = cancel.child_token();
        tasks.spawn(async move { controller.run(token).await });
    }
    {
        let controller = JobController::new(
            name.clone(),
            client.clone(),
            manager.clone(),
            config.job_poll_interval,
        );
        let token = cancel.child_token();
        tasks.spawn(async move { controller.run(token).await });
    }
    {
        let controller = FlowController::new(
            name.clone(),
            client.clone(),
            manager.clone(),
            config.wait_timeout,
        );
        let token = cancel.child_token();
        tasks.spawn(async move { controller.run(token).await });
    }

    // Service, endpoints and mesh reconciliation need a backend that can
    // express them.
    if cluster.spec.manager == ManagerType::K8 {
        {
            let controller =
                ServiceController::new(name.clone(), client.clone(), manager.clone());
            let token = cancel.child_token();
            tasks.spawn(async move { controller.run(token).await });
        }
        {
            let controller =
                EndpointsController::new(name.clone(), client.clone(), manager.clone());
            let token = cancel.child_token();
            tasks.spawn(async move { controller.run(token).await });
        }
        {
            let controller =
                NetworkController::new(name.clone(), client.clone(), manager.clone());
            let token = cancel.child_token();
            tasks.spawn(async move { controller.run(token).await });
        }
    }

    let outcome = loop {
        tokio::select! {
            _ = cancel.cancelled() => break Ok(()),
            joined = tasks.join_next() => match joined {
                None => break Ok(()),
                Some(Ok(())) if cancel.is_cancelled() => continue,
                Some(Ok(())) => {
                    error!(cluster = %name, "controller exited unexpectedly");
                    break Err(Error::fatal("skylet", "controller exited unexpectedly"));
                }
                Some(Err(join_err)) => {
                    error!(cluster = %name, error = %join_err, "controller panicked");
                    break Err(Error::fatal("skylet", join_err.to_string()));
                }
            }
        }
    };

    // Unblock every remaining controller and drain them before the
    // manager handle drops.
    cancel.cancel();
    while tasks.join_next().await.is_some() {}
    info!(cluster = %name, "skylet stopped");
    outcome
}
