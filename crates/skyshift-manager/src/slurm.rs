//! Slurm compatibility layer over slurmrestd
//!
//! Jobs are wrapped in a generated batch script (a container-runtime
//! invocation when the job names an image, the raw command otherwise)
//! and submitted through the REST API. Polling maps Slurm job states
//! onto replica states. Exec and service operations are unsupported on
//! this backend.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use skyshift_common::config::SlurmConfig;
use skyshift_common::object::{Cluster, Job, ManagerType, ReplicaState};
use skyshift_common::resources::{self, ResourceMap};
use skyshift_common::{Error, Result};

use crate::manager::{backend_job_id, ClusterManager, ClusterSnapshot, ReplicaCounts};

fn slurm_err(err: reqwest::Error) -> Error {
    Error::transient("slurm", err.to_string())
}

/// slurmrestd `GET /nodes` response subset
#[derive(Debug, Deserialize)]
struct NodesResponse {
    #[serde(default)]
    nodes: Vec<SlurmNode>,
}

#[derive(Debug, Deserialize)]
struct SlurmNode {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    hostname: Option<String>,
    #[serde(default)]
    cpus: Option<u32>,
    #[serde(default)]
    idle_cpus: Option<u32>,
    /// Memory in MB
    #[serde(default)]
    real_memory: Option<u64>,
    #[serde(default)]
    free_memory: Option<u64>,
    /// Generic resources, e.g. "gpu:V100:4"
    #[serde(default)]
    gres: Option<String>,
}

/// slurmrestd `POST /job/submit` response subset
#[derive(Debug, Deserialize)]
struct SubmitResponse {
    #[serde(default)]
    job_id: Option<u64>,
}

/// slurmrestd `GET /job/{id}` response subset
#[derive(Debug, Deserialize)]
struct JobInfoResponse {
    #[serde(default)]
    jobs: Vec<SlurmJobInfo>,
}

#[derive(Debug, Deserialize)]
struct SlurmJobInfo {
    #[serde(default)]
    job_state: Option<String>,
}

/// Slurm-backed [`ClusterManager`] speaking to slurmrestd
pub struct SlurmManager {
    cluster_name: String,
    endpoint: String,
    openapi_version: String,
    user: String,
    auth_token: Option<String>,
    http: reqwest::Client,
}

impl SlurmManager {
    /// Build from the cluster's access config, falling back to the
    /// declarations in `~/.skyconf/slurm_config.yaml`.
    pub fn from_cluster(cluster: &Cluster) -> Result<Self> {
        let name = cluster.metadata.name.clone();
        let access = &cluster.spec.access_config;

        if let Some(endpoint) = access.get("endpoint") {
            return Ok(Self {
                cluster_name: name,
                endpoint: endpoint.trim_end_matches('/').to_string(),
                openapi_version: access
                    .get("openapi_version")
                    .cloned()
                    .unwrap_or_else(|| "v0.0.39".to_string()),
                user: access.get("user").cloned().unwrap_or_default(),
                auth_token: access.get("auth_token").cloned(),
                http: reqwest::Client::new(),
            });
        }

        let config = SlurmConfig::load()?;
        let declared = config.clusters.get(&name).ok_or_else(|| {
            Error::invalid(
                "Cluster",
                format!("slurm cluster '{name}' has no endpoint in access_config or slurm_config.yaml"),
            )
        })?;
        Ok(Self {
            cluster_name: name,
            endpoint: declared.endpoint.trim_end_matches('/').to_string(),
            openapi_version: declared.openapi_version.clone(),
            user: declared.user.clone(),
            auth_token: declared.auth_token.clone(),
            http: reqwest::Client::new(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/slurm/{}/{}", self.endpoint, self.openapi_version, path)
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .http
            .request(method, self.url(path))
            .header("X-SLURM-USER-NAME", &self.user);
        if let Some(token) = &self.auth_token {
            builder = builder.header("X-SLURM-USER-TOKEN", token);
        }
        builder
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let response = builder.send().await.map_err(slurm_err)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::transient(
                "slurm",
                format!("slurmrestd returned {status}: {body}"),
            ));
        }
        Ok(response)
    }

    /// Render the batch script a job runs under
    fn batch_script(job: &Job) -> String {
        if job.spec.image.is_empty() || job.spec.image == "none" {
            return format!("#!/bin/bash\n{}\n", job.spec.run);
        }
        let envs: String = job
            .spec
            .envs
            .iter()
            .map(|(k, v)| format!(" -e {k}={v}"))
            .collect();
        let command = if job.spec.run.is_empty() {
            String::new()
        } else {
            format!(" sh -c '{}'", job.spec.run)
        };
        format!(
            "#!/bin/bash\ndocker run --rm{envs} {image}{command}\n",
            image = job.spec.image
        )
    }

    fn map_state(state: &str) -> ReplicaState {
        match state {
            "PENDING" | "CONFIGURING" | "SUSPENDED" => ReplicaState::Pending,
            "RUNNING" | "COMPLETING" => ReplicaState::Running,
            "COMPLETED" => ReplicaState::Completed,
            "PREEMPTED" => ReplicaState::Evicted,
            // FAILED, CANCELLED, TIMEOUT, NODE_FAIL, OUT_OF_MEMORY, ...
            _ => ReplicaState::Failed,
        }
    }

    /// Parse a gres string like "gpu:V100:4" into (SKU, count)
    fn parse_gres(gres: &str) -> Option<(String, f64)> {
        let mut parts = gres.split(':');
        if parts.next()? != "gpu" {
            return None;
        }
        match (parts.next(), parts.next()) {
            (Some(sku), Some(count)) => Some((sku.to_uppercase(), count.parse().ok()?)),
            (Some(count), None) => Some(("gpus".to_string(), count.parse().ok()?)),
            _ => None,
        }
    }
}

#[async_trait]
impl ClusterManager for SlurmManager {
    fn cluster_name(&self) -> &str {
        &self.cluster_name
    }

    fn manager_type(&self) -> ManagerType {
        ManagerType::Slurm
    }

    async fn describe(&self) -> Result<ClusterSnapshot> {
        let response = self.send(self.request(reqwest::Method::GET, "nodes")).await?;
        let nodes: NodesResponse = response.json().await.map_err(slurm_err)?;

        let mut snapshot = ClusterSnapshot::default();
        for node in nodes.nodes {
            let Some(name) = node.name.or(node.hostname) else {
                continue;
            };
            let mut capacity = ResourceMap::from([
                (
                    resources::CPUS.to_string(),
                    f64::from(node.cpus.unwrap_or(0)),
                ),
                (
                    resources::MEMORY.to_string(),
                    node.real_memory.unwrap_or(0) as f64,
                ),
            ]);
            let mut allocatable = ResourceMap::from([
                (
                    resources::CPUS.to_string(),
                    f64::from(node.idle_cpus.unwrap_or(node.cpus.unwrap_or(0))),
                ),
                (
                    resources::MEMORY.to_string(),
                    node.free_memory.unwrap_or(node.real_memory.unwrap_or(0)) as f64,
                ),
            ]);
            if let Some((sku, count)) = node.gres.as_deref().and_then(Self::parse_gres) {
                if sku == "gpus" {
                    capacity.insert(resources::GPUS.to_string(), count);
                    allocatable.insert(resources::GPUS.to_string(), count);
                } else {
                    capacity.insert(sku.clone(), count);
                    allocatable.insert(sku.clone(), count);
                    snapshot.accelerator_types.insert(name.clone(), sku);
                }
            }
            snapshot.capacity.insert(name.clone(), capacity);
            snapshot.allocatable.insert(name, allocatable);
        }
        Ok(snapshot)
    }

    async fn submit_job(&self, job: &Job, replicas: u32) -> Result<String> {
        let cpus = job
            .spec
            .resources
            .get(resources::CPUS)
            .copied()
            .unwrap_or(1.0)
            .ceil() as u64;
        let memory_mb = job
            .spec
            .resources
            .get(resources::MEMORY)
            .copied()
            .unwrap_or(0.0)
            .ceil() as u64;

        let mut submit_job = serde_json::json!({
            "name": format!(
                "{}-{}",
                job.metadata.namespace_or_default(),
                job.metadata.name
            ),
            "tasks": replicas,
            "cpus_per_task": cpus.max(1),
            "current_working_directory": "/tmp",
            "environment": ["PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin"],
            "standard_output": format!(
                "/tmp/skyshift-{}-{}.out",
                job.metadata.namespace_or_default(),
                job.metadata.name
            ),
        });
        if memory_mb > 0 {
            submit_job["memory_per_node"] = serde_json::json!(memory_mb);
        }

        let body = serde_json::json!({
            "script": Self::batch_script(job),
            "job": submit_job,
        });
        debug!(job = %job.metadata.name, "submitting batch job to slurmrestd");
        let response = self
            .send(self.request(reqwest::Method::POST, "job/submit").json(&body))
            .await?;
        let submit: SubmitResponse = response.json().await.map_err(slurm_err)?;
        let job_id = submit.job_id.ok_or_else(|| {
            Error::transient("slurm", "submission response carried no job id")
        })?;
        Ok(job_id.to_string())
    }

    async fn delete_job(&self, job: &Job) -> Result<()> {
        let Some(job_id) = backend_job_id(job, &self.cluster_name) else {
            return Ok(());
        };
        let response = self
            .request(reqwest::Method::DELETE, &format!("job/{job_id}"))
            .send()
            .await
            .map_err(slurm_err)?;
        // Cancelling an already-finished job is fine.
        if !response.status().is_success() && response.status().as_u16() != 404 {
            return Err(Error::transient(
                "slurm",
                format!("cancel returned {}", response.status()),
            ));
        }
        Ok(())
    }

    async fn poll_job(&self, job: &Job) -> Result<ReplicaCounts> {
        let Some(job_id) = backend_job_id(job, &self.cluster_name) else {
            return Ok(ReplicaCounts::new());
        };
        let response = self
            .send(self.request(reqwest::Method::GET, &format!("job/{job_id}")))
            .await?;
        let info: JobInfoResponse = response.json().await.map_err(slurm_err)?;
        let state = info
            .jobs
            .first()
            .and_then(|j| j.job_state.as_deref())
            .unwrap_or("PENDING");

        // Slurm reports one state for the whole allocation; the slice
        // moves as a unit.
        let replicas = job.status.slice_replicas(&self.cluster_name).max(1);
        Ok(BTreeMap::from([(Self::map_state(state), replicas)]))
    }

    async fn job_logs(&self, _job: &Job) -> Result<Vec<String>> {
        // Stdout files live on the cluster's shared filesystem, which
        // slurmrestd does not expose.
        Err(self.unsupported("job_logs"))
    }
}
