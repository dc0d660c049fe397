//! The `ClusterManager` contract
//!
//! One implementation per cluster kind translates SkyShift's uniform
//! operations into the backend's native calls. A backend that cannot
//! satisfy an operation returns `Unsupported`, which callers record as a
//! condition on the affected object instead of failing the reconciler.

use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use skyshift_common::object::{
    Cluster, Endpoints, Job, Link, ManagerType, ReplicaState, Service,
};
use skyshift_common::resources::NodeResourceMap;
use skyshift_common::{Error, Result};

/// What `describe()` reports about a cluster
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ClusterSnapshot {
    /// Total per-node capacity
    pub capacity: NodeResourceMap,
    /// Per-node capacity free for placement
    pub allocatable: NodeResourceMap,
    /// Accelerator SKU per node, when any
    pub accelerator_types: BTreeMap<String, String>,
    /// Labels per node, used for placement-affinity surfaces
    pub node_labels: BTreeMap<String, BTreeMap<String, String>>,
}

/// Replica state counts reported by one backend poll
pub type ReplicaCounts = BTreeMap<ReplicaState, u32>;

/// A bidirectional byte stream attached to one task of a job
pub struct ExecSession {
    /// Writes reach the task's stdin
    pub stdin: Pin<Box<dyn AsyncWrite + Send>>,
    /// Reads drain the task's stdout/stderr
    pub stdout: Pin<Box<dyn AsyncRead + Send>>,
}

/// The uniform contract every backend implements.
///
/// Defaults answer `Unsupported` so a backend only implements what its
/// cluster manager can express.
#[async_trait]
pub trait ClusterManager: Send + Sync {
    /// The SkyShift cluster this manager drives
    fn cluster_name(&self) -> &str;

    /// Which backend this is
    fn manager_type(&self) -> ManagerType;

    /// Capacity, allocatable capacity, accelerators and node labels
    async fn describe(&self) -> Result<ClusterSnapshot>;

    /// Submit `replicas` replicas of the job; returns the backend job id
    async fn submit_job(&self, job: &Job, replicas: u32) -> Result<String>;

    /// Remove the job's workload from the backend
    async fn delete_job(&self, job: &Job) -> Result<()>;

    /// Report the current replica state counts for the job's slice
    async fn poll_job(&self, job: &Job) -> Result<ReplicaCounts>;

    /// Fetch logs for every replica of the job's slice
    async fn job_logs(&self, job: &Job) -> Result<Vec<String>>;

    /// Attach a bidirectional stream to one task of the job
    async fn exec(&self, _job: &Job, _command: Vec<String>, _tty: bool) -> Result<ExecSession> {
        Err(self.unsupported("exec"))
    }

    /// Create or update a service fronting the job's replicas; returns
    /// the cluster-internal IP when the backend assigned one
    async fn submit_service(&self, _service: &Service) -> Result<Option<String>> {
        Err(self.unsupported("submit_service"))
    }

    /// Remove a service
    async fn delete_service(&self, _service: &Service) -> Result<()> {
        Err(self.unsupported("delete_service"))
    }

    /// Names of services currently present on the backend
    async fn list_services(&self) -> Result<Vec<String>> {
        Err(self.unsupported("list_services"))
    }

    /// Materialize endpoints imported from another cluster
    async fn import_endpoints(&self, _endpoints: &Endpoints, _service: &Service) -> Result<()> {
        Err(self.unsupported("import_endpoints"))
    }

    /// Remove previously imported endpoints
    async fn unimport_endpoints(&self, _endpoints: &Endpoints) -> Result<()> {
        Err(self.unsupported("unimport_endpoints"))
    }

    /// Establish the cluster's half of a mesh link
    async fn create_link(&self, _link: &Link) -> Result<()> {
        Err(self.unsupported("create_link"))
    }

    /// Tear down the cluster's half of a mesh link
    async fn delete_link(&self, _link: &Link) -> Result<()> {
        Err(self.unsupported("delete_link"))
    }

    /// Uniform `Unsupported` error for this backend
    fn unsupported(&self, operation: &str) -> Error {
        Error::unsupported(self.manager_type().to_string(), operation)
    }
}

/// Build the manager matching a cluster's `spec.manager`
pub async fn setup_cluster_manager(cluster: &Cluster) -> Result<Arc<dyn ClusterManager>> {
    match cluster.spec.manager {
        ManagerType::K8 => Ok(Arc::new(
            crate::kubernetes::KubernetesManager::connect(cluster).await?,
        )),
        ManagerType::Slurm => Ok(Arc::new(crate::slurm::SlurmManager::from_cluster(cluster)?)),
        ManagerType::Ray => Ok(Arc::new(crate::ray::RayManager::from_cluster(cluster)?)),
    }
}

/// The backend job id recorded for this cluster, if any
pub fn backend_job_id<'a>(job: &'a Job, cluster_name: &str) -> Option<&'a str> {
    job.status.job_ids.get(cluster_name).map(String::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Stub;

    #[async_trait]
    impl ClusterManager for Stub {
        fn cluster_name(&self) -> &str {
            "stub"
        }

        fn manager_type(&self) -> ManagerType {
            ManagerType::Ray
        }

        async fn describe(&self) -> Result<ClusterSnapshot> {
            Ok(ClusterSnapshot::default())
        }

        async fn submit_job(&self, _job: &Job, _replicas: u32) -> Result<String> {
            Ok("id".to_string())
        }

        async fn delete_job(&self, _job: &Job) -> Result<()> {
            Ok(())
        }

        async fn poll_job(&self, _job: &Job) -> Result<ReplicaCounts> {
            Ok(ReplicaCounts::new())
        }

        async fn job_logs(&self, _job: &Job) -> Result<Vec<String>> {
            Ok(vec![])
        }
    }

    #[tokio::test]
    async fn test_default_operations_are_unsupported() {
        let stub = Stub;
        let link = Link::default();
        let err = stub.create_link(&link).await.unwrap_err();
        assert!(err.is_unsupported());
        assert!(err.to_string().contains("ray"));

        let svc = Service::default();
        assert!(stub.submit_service(&svc).await.unwrap_err().is_unsupported());
    }

    #[test]
    fn test_backend_job_id_lookup() {
        let mut job = Job::default();
        job.status
            .job_ids
            .insert("c1".to_string(), "raysubmit_123".to_string());
        assert_eq!(backend_job_id(&job, "c1"), Some("raysubmit_123"));
        assert_eq!(backend_job_id(&job, "c2"), None);
    }
}
