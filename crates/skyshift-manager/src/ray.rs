//! Ray compatibility layer
//!
//! Talks to the Ray Jobs API on the head node's dashboard port. Jobs run
//! as containerized entrypoints; state comes from the Jobs API and logs
//! from its log endpoint. Services and links are unsupported on this
//! backend.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Deserialize;

use skyshift_common::object::{Cluster, Job, ManagerType, ReplicaState};
use skyshift_common::resources::{self, ResourceMap};
use skyshift_common::{Error, Result};

use crate::manager::{backend_job_id, ClusterManager, ClusterSnapshot, ReplicaCounts};

/// Ray dashboard / Jobs API port
pub const RAY_JOBS_PORT: u16 = 8265;
/// Ray GCS port on the head node
pub const RAY_NODES_PORT: u16 = 6379;
/// Ray client server port
pub const RAY_CLIENT_PORT: u16 = 10001;

fn ray_err(err: reqwest::Error) -> Error {
    Error::transient("ray", err.to_string())
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    submission_id: String,
}

#[derive(Debug, Deserialize)]
struct JobDetails {
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LogsResponse {
    #[serde(default)]
    logs: String,
}

#[derive(Debug, Deserialize)]
struct NodeSummary {
    #[serde(default)]
    data: NodeSummaryData,
}

#[derive(Debug, Default, Deserialize)]
struct NodeSummaryData {
    #[serde(default)]
    summary: Vec<RayNode>,
}

#[derive(Debug, Deserialize)]
struct RayNode {
    #[serde(default)]
    ip: Option<String>,
    #[serde(default)]
    raylet: RayletInfo,
}

#[derive(Debug, Default, Deserialize)]
struct RayletInfo {
    #[serde(default)]
    state: Option<String>,
    #[serde(default, rename = "resourcesTotal")]
    resources_total: BTreeMap<String, f64>,
}

/// Ray-backed [`ClusterManager`]
pub struct RayManager {
    cluster_name: String,
    endpoint: String,
    http: reqwest::Client,
}

impl RayManager {
    /// Build from the cluster's access config (`head` host, optional
    /// `jobs_port`)
    pub fn from_cluster(cluster: &Cluster) -> Result<Self> {
        let access = &cluster.spec.access_config;
        let endpoint = match access.get("endpoint") {
            Some(endpoint) => endpoint.trim_end_matches('/').to_string(),
            None => {
                let head = access.get("head").ok_or_else(|| {
                    Error::invalid(
                        "Cluster",
                        "ray clusters require access_config.head or access_config.endpoint",
                    )
                })?;
                let port = access
                    .get("jobs_port")
                    .and_then(|p| p.parse::<u16>().ok())
                    .unwrap_or(RAY_JOBS_PORT);
                format!("http://{head}:{port}")
            }
        };
        Ok(Self {
            cluster_name: cluster.metadata.name.clone(),
            endpoint,
            http: reqwest::Client::new(),
        })
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let response = builder.send().await.map_err(ray_err)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::transient(
                "ray",
                format!("jobs api returned {status}: {body}"),
            ));
        }
        Ok(response)
    }

    /// The docker-run entrypoint a job submits as
    fn entrypoint(job: &Job) -> String {
        if job.spec.image.is_empty() || job.spec.image == "none" {
            return job.spec.run.clone();
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
        format!("docker run --rm{envs} {}{command}", job.spec.image)
    }

    fn map_status(status: &str) -> ReplicaState {
        match status {
            "PENDING" => ReplicaState::Pending,
            "RUNNING" => ReplicaState::Running,
            "SUCCEEDED" => ReplicaState::Completed,
            "STOPPED" => ReplicaState::Deleted,
            _ => ReplicaState::Failed,
        }
    }
}

#[async_trait]
impl ClusterManager for RayManager {
    fn cluster_name(&self) -> &str {
        &self.cluster_name
    }

    fn manager_type(&self) -> ManagerType {
        ManagerType::Ray
    }

    async fn describe(&self) -> Result<ClusterSnapshot> {
        let response = self
            .send(
                self.http
                    .get(format!("{}/nodes", self.endpoint))
                    .query(&[("view", "summary")]),
            )
            .await?;
        let summary: NodeSummary = response.json().await.map_err(ray_err)?;

        let mut snapshot = ClusterSnapshot::default();
        for (index, node) in summary.data.summary.into_iter().enumerate() {
            if node.raylet.state.as_deref() == Some("DEAD") {
                continue;
            }
            let name = node.ip.unwrap_or_else(|| format!("ray-node-{index}"));
            let mut map = ResourceMap::new();
            for (resource, value) in node.raylet.resources_total {
                match resource.as_str() {
                    "CPU" => {
                        map.insert(resources::CPUS.to_string(), value);
                    }
                    // Ray reports memory in bytes.
                    "memory" => {
                        map.insert(resources::MEMORY.to_string(), value / (1024.0 * 1024.0));
                    }
                    "GPU" => {
                        map.insert(resources::GPUS.to_string(), value);
                    }
                    _ => {}
                }
            }
            snapshot.capacity.insert(name.clone(), map.clone());
            // The Jobs API does not expose per-node free resources; the
            // job controller's poll results keep placement honest.
            snapshot.allocatable.insert(name, map);
        }
        Ok(snapshot)
    }

    async fn submit_job(&self, job: &Job, replicas: u32) -> Result<String> {
        let cpus = job
            .spec
            .resources
            .get(resources::CPUS)
            .copied()
            .unwrap_or(1.0);
        let body = serde_json::json!({
            "entrypoint": Self::entrypoint(job),
            "entrypoint_num_cpus": cpus * f64::from(replicas),
            "metadata": {
                "skyshift_job": job.metadata.name,
                "skyshift_namespace": job.metadata.namespace_or_default(),
            },
        });
        let response = self
            .send(self.http.post(format!("{}/api/jobs/", self.endpoint)).json(&body))
            .await?;
        let submit: SubmitResponse = response.json().await.map_err(ray_err)?;
        Ok(submit.submission_id)
    }

    async fn delete_job(&self, job: &Job) -> Result<()> {
        let Some(job_id) = backend_job_id(job, &self.cluster_name) else {
            return Ok(());
        };
        // Stop first; deleting a running job is rejected.
        let _ = self
            .http
            .post(format!("{}/api/jobs/{}/stop", self.endpoint, job_id))
            .send()
            .await;
        let response = self
            .http
            .delete(format!("{}/api/jobs/{}", self.endpoint, job_id))
            .send()
            .await
            .map_err(ray_err)?;
        if !response.status().is_success() && response.status().as_u16() != 404 {
            return Err(Error::transient(
                "ray",
                format!("job delete returned {}", response.status()),
            ));
        }
        Ok(())
    }

    async fn poll_job(&self, job: &Job) -> Result<ReplicaCounts> {
        let Some(job_id) = backend_job_id(job, &self.cluster_name) else {
            return Ok(ReplicaCounts::new());
        };
        let response = self
            .send(self.http.get(format!("{}/api/jobs/{}", self.endpoint, job_id)))
            .await?;
        let details: JobDetails = response.json().await.map_err(ray_err)?;
        let state = Self::map_status(details.status.as_deref().unwrap_or("PENDING"));
        let replicas = job.status.slice_replicas(&self.cluster_name).max(1);
        Ok(BTreeMap::from([(state, replicas)]))
    }

    async fn job_logs(&self, job: &Job) -> Result<Vec<String>> {
        let Some(job_id) = backend_job_id(job, &self.cluster_name) else {
            return Ok(Vec::new());
        };
        let response = self
            .send(
                self.http
                    .get(format!("{}/api/jobs/{}/logs", self.endpoint, job_id)),
            )
            .await?;
        let logs: LogsResponse = response.json().await.map_err(ray_err)?;
        Ok(logs.logs.lines().map(String::from).collect())
    }
}
