//! Kubernetes compatibility layer
//!
//! Renders jobs as Deployments (when `replicas > 1` with `Always`
//! restart) or bare Pods, derives allocatable capacity from node status
//! minus the requests of non-terminal pods, and maps services and
//! endpoint imports onto their native counterparts. Mesh link operations
//! call out to an external link controller when one is configured.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, HostPathVolumeSource, Node, Pod, PodSpec,
    PodTemplateSpec, ResourceRequirements, Service as KubeService,
    ServicePort as KubeServicePort, ServiceSpec as KubeServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::api::discovery::v1::{Endpoint, EndpointConditions, EndpointPort, EndpointSlice};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta as KubeMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{AttachParams, DeleteParams, ListParams, LogParams, Patch, PatchParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client, Config};
use tracing::{debug, warn};

use skyshift_common::object::{
    Cluster, Endpoints, ImagePullPolicy, Job, Link, ManagerType, ReplicaState, RestartPolicy,
    Service, ServiceType,
};
use skyshift_common::resources::{self, NodeResourceMap, ResourceMap};
use skyshift_common::{Error, Result};

use crate::manager::{backend_job_id, ClusterManager, ClusterSnapshot, ExecSession, ReplicaCounts};
use crate::quantity::{parse_count, parse_cpu, parse_memory_mb};

/// Label carrying the SkyShift job name
pub const JOB_LABEL: &str = "skyshift.io/job";
/// Label carrying the SkyShift namespace
pub const NAMESPACE_LABEL: &str = "skyshift.io/namespace";
/// Label marking objects this control plane owns
pub const MANAGED_LABEL: &str = "skyshift.io/managed";

/// Node labels that reveal the accelerator SKU
const ACCELERATOR_NODE_LABELS: &[&str] =
    &["nvidia.com/gpu.product", "cloud.google.com/gke-accelerator"];

fn k8s_err(err: kube::Error) -> Error {
    Error::transient("kubernetes", err.to_string())
}

/// Kubernetes-backed [`ClusterManager`]
pub struct KubernetesManager {
    cluster_name: String,
    client: Client,
    /// Kubernetes namespace all SkyShift workloads land in
    namespace: String,
    /// Optional external mesh controller for link operations
    link_controller: Option<String>,
    http: reqwest::Client,
}

impl KubernetesManager {
    /// Connect using the cluster's kubeconfig (or the ambient config)
    pub async fn connect(cluster: &Cluster) -> Result<Self> {
        let config = match &cluster.spec.config_path {
            Some(path) => {
                let kubeconfig = Kubeconfig::read_from(path)
                    .map_err(|e| Error::transient("kubernetes", e.to_string()))?;
                let options = KubeConfigOptions {
                    context: cluster.spec.access_config.get("context").cloned(),
                    ..Default::default()
                };
                Config::from_custom_kubeconfig(kubeconfig, &options)
                    .await
                    .map_err(|e| Error::transient("kubernetes", e.to_string()))?
            }
            None => Config::infer()
                .await
                .map_err(|e| Error::transient("kubernetes", e.to_string()))?,
        };
        let client = Client::try_from(config).map_err(k8s_err)?;
        Ok(Self {
            cluster_name: cluster.metadata.name.clone(),
            client,
            namespace: cluster
                .spec
                .access_config
                .get("namespace")
                .cloned()
                .unwrap_or_else(|| "default".to_string()),
            link_controller: cluster.spec.access_config.get("link_controller").cloned(),
            http: reqwest::Client::new(),
        })
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn deployments(&self) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn services(&self) -> Api<KubeService> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn endpoint_slices(&self) -> Api<EndpointSlice> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    /// Workload name for a job: unique across SkyShift namespaces
    fn workload_name(job: &Job) -> String {
        format!("{}-{}", job.metadata.namespace_or_default(), job.metadata.name)
    }

    fn job_selector(job: &Job) -> String {
        format!(
            "{JOB_LABEL}={},{NAMESPACE_LABEL}={}",
            job.metadata.name,
            job.metadata.namespace_or_default()
        )
    }

    fn job_labels(job: &Job) -> BTreeMap<String, String> {
        BTreeMap::from([
            (JOB_LABEL.to_string(), job.metadata.name.clone()),
            (
                NAMESPACE_LABEL.to_string(),
                job.metadata.namespace_or_default().to_string(),
            ),
            (MANAGED_LABEL.to_string(), "true".to_string()),
        ])
    }

    fn pod_spec(job: &Job, restart_policy: &str) -> PodSpec {
        let mut volumes = Vec::new();
        let mut mounts = Vec::new();
        for (name, volume) in &job.spec.volumes {
            mounts.push(VolumeMount {
                name: name.clone(),
                mount_path: volume.mount_path.clone(),
                ..Default::default()
            });
            volumes.push(Volume {
                name: name.clone(),
                host_path: volume.host_path.as_ref().map(|path| HostPathVolumeSource {
                    path: path.clone(),
                    type_: None,
                }),
                ..Default::default()
            });
        }

        let container = Container {
            name: "task".to_string(),
            image: Some(job.spec.image.clone()),
            image_pull_policy: Some(
                match job.spec.image_pull_policy {
                    ImagePullPolicy::Always => "Always",
                    ImagePullPolicy::IfNotPresent => "IfNotPresent",
                    ImagePullPolicy::Never => "Never",
                }
                .to_string(),
            ),
            command: if job.spec.run.is_empty() {
                None
            } else {
                Some(vec![
                    "sh".to_string(),
                    "-c".to_string(),
                    job.spec.run.clone(),
                ])
            },
            env: Some(
                job.spec
                    .envs
                    .iter()
                    .map(|(name, value)| EnvVar {
                        name: name.clone(),
                        value: Some(value.clone()),
                        value_from: None,
                    })
                    .collect(),
            ),
            ports: Some(
                job.spec
                    .ports
                    .iter()
                    .map(|port| ContainerPort {
                        container_port: i32::from(*port),
                        ..Default::default()
                    })
                    .collect(),
            ),
            resources: Some(Self::resource_requirements(&job.spec.resources)),
            volume_mounts: if mounts.is_empty() { None } else { Some(mounts) },
            ..Default::default()
        };

        PodSpec {
            containers: vec![container],
            restart_policy: Some(restart_policy.to_string()),
            volumes: if volumes.is_empty() { None } else { Some(volumes) },
            ..Default::default()
        }
    }

    fn resource_requirements(request: &ResourceMap) -> ResourceRequirements {
        let mut quantities = BTreeMap::new();
        let cpus = request.get(resources::CPUS).copied().unwrap_or(0.0);
        if cpus > 0.0 {
            quantities.insert("cpu".to_string(), Quantity(format!("{cpus}")));
        }
        let memory = request.get(resources::MEMORY).copied().unwrap_or(0.0);
        if memory > 0.0 {
            quantities.insert("memory".to_string(), Quantity(format!("{}Mi", memory as i64)));
        }
        let mut gpus = request.get(resources::GPUS).copied().unwrap_or(0.0);
        for sku in resources::ACCELERATORS {
            gpus += request.get(*sku).copied().unwrap_or(0.0);
        }
        if gpus > 0.0 {
            quantities.insert(
                "nvidia.com/gpu".to_string(),
                Quantity(format!("{}", gpus as i64)),
            );
        }
        ResourceRequirements {
            limits: Some(quantities.clone()),
            requests: Some(quantities),
            ..Default::default()
        }
    }

    /// Sum of a pod's container requests, in SkyShift units
    fn pod_requests(pod: &Pod) -> ResourceMap {
        let mut total = ResourceMap::new();
        let Some(spec) = &pod.spec else {
            return total;
        };
        for container in &spec.containers {
            let Some(requests) = container
                .resources
                .as_ref()
                .and_then(|r| r.requests.as_ref())
            else {
                continue;
            };
            for (name, quantity) in requests {
                let (key, value) = match name.as_str() {
                    "cpu" => (resources::CPUS, parse_cpu(&quantity.0)),
                    "memory" => (resources::MEMORY, parse_memory_mb(&quantity.0)),
                    "nvidia.com/gpu" => (resources::GPUS, parse_count(&quantity.0)),
                    "ephemeral-storage" => (resources::DISK, parse_memory_mb(&quantity.0)),
                    _ => continue,
                };
                match value {
                    Ok(v) => *total.entry(key.to_string()).or_insert(0.0) += v,
                    Err(err) => {
                        warn!(error = %err, resource = %name, "skipping unparsable pod request")
                    }
                }
            }
        }
        total
    }

    fn node_resources(quantities: &BTreeMap<String, Quantity>) -> ResourceMap {
        let mut map = ResourceMap::new();
        for (name, quantity) in quantities {
            let (key, value) = match name.as_str() {
                "cpu" => (resources::CPUS, parse_cpu(&quantity.0)),
                "memory" => (resources::MEMORY, parse_memory_mb(&quantity.0)),
                "nvidia.com/gpu" => (resources::GPUS, parse_count(&quantity.0)),
                "ephemeral-storage" => (resources::DISK, parse_memory_mb(&quantity.0)),
                _ => continue,
            };
            match value {
                Ok(v) => {
                    map.insert(key.to_string(), v);
                }
                Err(err) => warn!(error = %err, resource = %name, "skipping node quantity"),
            }
        }
        map
    }

    fn uses_deployment(job: &Job, replicas: u32) -> bool {
        replicas > 1 && job.spec.restart_policy == RestartPolicy::Always
    }
}

#[async_trait]
impl ClusterManager for KubernetesManager {
    fn cluster_name(&self) -> &str {
        &self.cluster_name
    }

    fn manager_type(&self) -> ManagerType {
        ManagerType::K8
    }

    async fn describe(&self) -> Result<ClusterSnapshot> {
        let nodes = Api::<Node>::all(self.client.clone())
            .list(&ListParams::default())
            .await
            .map_err(k8s_err)?;
        let pods = Api::<Pod>::all(self.client.clone())
            .list(&ListParams::default())
            .await
            .map_err(k8s_err)?;

        let mut snapshot = ClusterSnapshot::default();
        for node in &nodes {
            let Some(name) = node.metadata.name.clone() else {
                continue;
            };
            let Some(status) = &node.status else { continue };

            let capacity = status
                .capacity
                .as_ref()
                .map(Self::node_resources)
                .unwrap_or_default();
            let mut allocatable = status
                .allocatable
                .as_ref()
                .map(Self::node_resources)
                .unwrap_or_else(|| capacity.clone());

            // Subtract requests of every non-terminal pod on the node.
            for pod in &pods {
                let on_node = pod
                    .spec
                    .as_ref()
                    .and_then(|s| s.node_name.as_deref())
                    == Some(name.as_str());
                if !on_node {
                    continue;
                }
                let phase = pod
                    .status
                    .as_ref()
                    .and_then(|s| s.phase.as_deref())
                    .unwrap_or("Pending");
                if matches!(phase, "Succeeded" | "Failed") {
                    continue;
                }
                resources::subtract(&mut allocatable, &Self::pod_requests(pod));
            }

            if let Some(labels) = &node.metadata.labels {
                for label in ACCELERATOR_NODE_LABELS {
                    if let Some(sku) = labels.get(*label) {
                        snapshot
                            .accelerator_types
                            .insert(name.clone(), sku.clone());
                        break;
                    }
                }
                snapshot
                    .node_labels
                    .insert(name.clone(), labels.clone().into_iter().collect());
            }
            snapshot.capacity.insert(name.clone(), capacity);
            snapshot.allocatable.insert(name, allocatable);
        }
        enforce_allocatable_bound(&mut snapshot.allocatable, &snapshot.capacity);
        Ok(snapshot)
    }

    async fn submit_job(&self, job: &Job, replicas: u32) -> Result<String> {
        let workload = Self::workload_name(job);
        let labels = Self::job_labels(job);

        if Self::uses_deployment(job, replicas) {
            let deployment = Deployment {
                metadata: KubeMeta {
                    name: Some(workload.clone()),
                    namespace: Some(self.namespace.clone()),
                    labels: Some(labels.clone()),
                    ..Default::default()
                },
                spec: Some(DeploymentSpec {
                    replicas: Some(replicas as i32),
                    selector: LabelSelector {
                        match_labels: Some(labels.clone()),
                        ..Default::default()
                    },
                    template: PodTemplateSpec {
                        metadata: Some(KubeMeta {
                            labels: Some(labels.clone()),
                            ..Default::default()
                        }),
                        spec: Some(Self::pod_spec(job, "Always")),
                    },
                    ..Default::default()
                }),
                status: None,
            };
            match self
                .deployments()
                .create(&PostParams::default(), &deployment)
                .await
            {
                Ok(_) => {}
                Err(kube::Error::Api(ae)) if ae.code == 409 => {
                    // Resize an existing deployment instead of failing.
                    let patch = serde_json::json!({"spec": {"replicas": replicas}});
                    self.deployments()
                        .patch(&workload, &PatchParams::default(), &Patch::Merge(&patch))
                        .await
                        .map_err(k8s_err)?;
                }
                Err(err) => return Err(k8s_err(err)),
            }
            return Ok(workload);
        }

        let restart = match job.spec.restart_policy {
            RestartPolicy::Always => "Always",
            RestartPolicy::Never => "Never",
            RestartPolicy::OnFailure => "OnFailure",
        };
        for index in 0..replicas {
            let pod = Pod {
                metadata: KubeMeta {
                    name: Some(format!("{workload}-{index}")),
                    namespace: Some(self.namespace.clone()),
                    labels: Some(labels.clone()),
                    ..Default::default()
                },
                spec: Some(Self::pod_spec(job, restart)),
                status: None,
            };
            match self.pods().create(&PostParams::default(), &pod).await {
                Ok(_) => {}
                // Re-submission after a partial failure is idempotent.
                Err(kube::Error::Api(ae)) if ae.code == 409 => {
                    debug!(pod = %format!("{workload}-{index}"), "pod already present");
                }
                Err(err) => return Err(k8s_err(err)),
            }
        }
        Ok(workload)
    }

    async fn delete_job(&self, job: &Job) -> Result<()> {
        let workload = Self::workload_name(job);
        match self
            .deployments()
            .delete(&workload, &DeleteParams::default())
            .await
        {
            Ok(_) => {}
            Err(kube::Error::Api(ae)) if ae.code == 404 => {}
            Err(err) => return Err(k8s_err(err)),
        }
        self.pods()
            .delete_collection(
                &DeleteParams::default(),
                &ListParams::default().labels(&Self::job_selector(job)),
            )
            .await
            .map_err(k8s_err)?;
        Ok(())
    }

    async fn poll_job(&self, job: &Job) -> Result<ReplicaCounts> {
        let pods = self
            .pods()
            .list(&ListParams::default().labels(&Self::job_selector(job)))
            .await
            .map_err(k8s_err)?;

        let mut counts = ReplicaCounts::new();
        for pod in &pods {
            let phase = pod
                .status
                .as_ref()
                .and_then(|s| s.phase.as_deref())
                .unwrap_or("Pending");
            let state = match phase {
                "Pending" => ReplicaState::Pending,
                "Running" => ReplicaState::Running,
                "Succeeded" => ReplicaState::Completed,
                "Failed" => ReplicaState::Failed,
                _ => ReplicaState::Failed,
            };
            *counts.entry(state).or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn job_logs(&self, job: &Job) -> Result<Vec<String>> {
        let pods = self
            .pods()
            .list(&ListParams::default().labels(&Self::job_selector(job)))
            .await
            .map_err(k8s_err)?;

        let mut logs = Vec::new();
        for pod in &pods {
            let Some(name) = pod.metadata.name.as_deref() else {
                continue;
            };
            match self.pods().logs(name, &LogParams::default()).await {
                Ok(text) => logs.push(text),
                Err(err) => warn!(pod = %name, error = %err, "failed to fetch pod logs"),
            }
        }
        Ok(logs)
    }

    async fn exec(&self, job: &Job, command: Vec<String>, tty: bool) -> Result<ExecSession> {
        let pods = self
            .pods()
            .list(&ListParams::default().labels(&Self::job_selector(job)))
            .await
            .map_err(k8s_err)?;
        let pod_name = pods
            .iter()
            .find_map(|p| p.metadata.name.clone())
            .ok_or_else(|| {
                Error::not_found(format!("no pods for job '{}'", job.metadata.name))
            })?;

        let params = AttachParams::default()
            .stdin(true)
            .stdout(true)
            .stderr(false)
            .tty(tty);
        let mut attached = self
            .pods()
            .exec(&pod_name, command, &params)
            .await
            .map_err(k8s_err)?;
        let stdin = attached
            .stdin()
            .ok_or_else(|| Error::transient("kubernetes", "exec stdin unavailable"))?;
        let stdout = attached
            .stdout()
            .ok_or_else(|| Error::transient("kubernetes", "exec stdout unavailable"))?;
        Ok(ExecSession {
            stdin: Box::pin(stdin),
            stdout: Box::pin(stdout),
        })
    }

    async fn submit_service(&self, service: &Service) -> Result<Option<String>> {
        let kube_service = KubeService {
            metadata: KubeMeta {
                name: Some(service.metadata.name.clone()),
                namespace: Some(self.namespace.clone()),
                labels: Some(BTreeMap::from([(
                    MANAGED_LABEL.to_string(),
                    "true".to_string(),
                )])),
                ..Default::default()
            },
            spec: Some(KubeServiceSpec {
                type_: Some(
                    match service.spec.type_ {
                        ServiceType::ClusterIP => "ClusterIP",
                        ServiceType::NodePort => "NodePort",
                        ServiceType::LoadBalancer => "LoadBalancer",
                        ServiceType::ExternalName => "ExternalName",
                    }
                    .to_string(),
                ),
                selector: Some(service.spec.selector.clone().into_iter().collect()),
                ports: Some(
                    service
                        .spec
                        .ports
                        .iter()
                        .map(|port| KubeServicePort {
                            port: i32::from(port.port),
                            target_port: Some(IntOrString::Int(i32::from(port.target_port))),
                            node_port: port.node_port.map(i32::from),
                            protocol: Some(
                                match port.protocol {
                                    skyshift_common::object::Protocol::TCP => "TCP",
                                    skyshift_common::object::Protocol::UDP => "UDP",
                                }
                                .to_string(),
                            ),
                            ..Default::default()
                        })
                        .collect(),
                ),
                ..Default::default()
            }),
            status: None,
        };

        let applied = match self
            .services()
            .create(&PostParams::default(), &kube_service)
            .await
        {
            Ok(created) => created,
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                let patch = serde_json::to_value(&kube_service)
                    .map_err(|e| Error::fatal("kubernetes", e.to_string()))?;
                self.services()
                    .patch(
                        &service.metadata.name,
                        &PatchParams::default(),
                        &Patch::Merge(&patch),
                    )
                    .await
                    .map_err(k8s_err)?
            }
            Err(err) => return Err(k8s_err(err)),
        };
        Ok(applied.spec.and_then(|s| s.cluster_ip))
    }

    async fn delete_service(&self, service: &Service) -> Result<()> {
        match self
            .services()
            .delete(&service.metadata.name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(err) => Err(k8s_err(err)),
        }
    }

    async fn list_services(&self) -> Result<Vec<String>> {
        let services = self
            .services()
            .list(&ListParams::default().labels(&format!("{MANAGED_LABEL}=true")))
            .await
            .map_err(k8s_err)?;
        Ok(services
            .iter()
            .filter_map(|s| s.metadata.name.clone())
            .collect())
    }

    async fn import_endpoints(&self, endpoints: &Endpoints, service: &Service) -> Result<()> {
        for (cluster, record) in &endpoints.spec.endpoints {
            if cluster == &self.cluster_name || !record.exposed_to_cluster {
                continue;
            }
            let slice_name = format!("{}-{}", endpoints.metadata.name, cluster);
            let address = format!(
                "{}-{}.{}.svc.cluster.local",
                endpoints.metadata.name, cluster, self.namespace
            );
            let slice = EndpointSlice {
                address_type: "FQDN".to_string(),
                metadata: KubeMeta {
                    name: Some(slice_name.clone()),
                    namespace: Some(self.namespace.clone()),
                    labels: Some(BTreeMap::from([
                        (
                            "kubernetes.io/service-name".to_string(),
                            endpoints.metadata.name.clone(),
                        ),
                        (MANAGED_LABEL.to_string(), "true".to_string()),
                    ])),
                    ..Default::default()
                },
                endpoints: vec![Endpoint {
                    addresses: vec![address],
                    conditions: Some(EndpointConditions {
                        ready: Some(record.num_endpoints > 0),
                        ..Default::default()
                    }),
                    ..Default::default()
                }],
                ports: Some(
                    service
                        .spec
                        .ports
                        .iter()
                        .map(|port| EndpointPort {
                            port: Some(i32::from(port.target_port)),
                            ..Default::default()
                        })
                        .collect(),
                ),
            };
            match self
                .endpoint_slices()
                .create(&PostParams::default(), &slice)
                .await
            {
                Ok(_) => {}
                Err(kube::Error::Api(ae)) if ae.code == 409 => {
                    let patch = serde_json::to_value(&slice)
                        .map_err(|e| Error::fatal("kubernetes", e.to_string()))?;
                    self.endpoint_slices()
                        .patch(&slice_name, &PatchParams::default(), &Patch::Merge(&patch))
                        .await
                        .map_err(k8s_err)?;
                }
                Err(err) => return Err(k8s_err(err)),
            }
        }
        Ok(())
    }

    async fn unimport_endpoints(&self, endpoints: &Endpoints) -> Result<()> {
        let selector = format!(
            "kubernetes.io/service-name={},{MANAGED_LABEL}=true",
            endpoints.metadata.name
        );
        self.endpoint_slices()
            .delete_collection(
                &DeleteParams::default(),
                &ListParams::default().labels(&selector),
            )
            .await
            .map_err(k8s_err)?;
        Ok(())
    }

    async fn create_link(&self, link: &Link) -> Result<()> {
        let Some(controller) = &self.link_controller else {
            return Err(self.unsupported("create_link"));
        };
        let body = serde_json::json!({
            "name": link.metadata.name,
            "source": link.spec.source,
            "target": link.spec.target,
        });
        let response = self
            .http
            .post(format!("{controller}/links"))
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::transient("link-controller", e.to_string()))?;
        if !response.status().is_success() {
            return Err(Error::transient(
                "link-controller",
                format!("link create returned {}", response.status()),
            ));
        }
        Ok(())
    }

    async fn delete_link(&self, link: &Link) -> Result<()> {
        let Some(controller) = &self.link_controller else {
            return Err(self.unsupported("delete_link"));
        };
        let response = self
            .http
            .delete(format!("{controller}/links/{}", link.metadata.name))
            .send()
            .await
            .map_err(|e| Error::transient("link-controller", e.to_string()))?;
        if !response.status().is_success() && response.status().as_u16() != 404 {
            return Err(Error::transient(
                "link-controller",
                format!("link delete returned {}", response.status()),
            ));
        }
        Ok(())
    }
}

/// Clamp allocatable at capacity so a scrape race never reports more
/// free than total.
fn enforce_allocatable_bound(allocatable: &mut NodeResourceMap, capacity: &NodeResourceMap) {
    for (node, free) in allocatable.iter_mut() {
        if let Some(total) = capacity.get(node) {
            for (name, value) in free.iter_mut() {
                let cap = total.get(name).copied().unwrap_or(*value);
                if *value > cap {
                    *value = cap;
                }
                if *value < 0.0 {
                    *value = 0.0;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skyshift_common::object::ObjectMeta;

    fn job(name: &str, replicas: u32, restart: RestartPolicy) -> Job {
        let mut job = Job {
            metadata: ObjectMeta::namespaced(name, "default"),
            ..Default::default()
        };
        job.spec.replicas = replicas;
        job.spec.restart_policy = restart;
        job
    }

    #[test]
    fn test_deployment_only_for_replicated_always_jobs() {
        assert!(KubernetesManager::uses_deployment(
            &job("a", 3, RestartPolicy::Always),
            3
        ));
        assert!(!KubernetesManager::uses_deployment(
            &job("b", 1, RestartPolicy::Always),
            1
        ));
        assert!(!KubernetesManager::uses_deployment(
            &job("c", 3, RestartPolicy::Never),
            3
        ));
    }

    #[test]
    fn test_workload_name_scopes_by_namespace() {
        let job = job("train", 1, RestartPolicy::Never);
        assert_eq!(KubernetesManager::workload_name(&job), "default-train");
        assert_eq!(
            KubernetesManager::job_selector(&job),
            "skyshift.io/job=train,skyshift.io/namespace=default"
        );
    }

    #[test]
    fn test_pod_spec_renders_command_env_and_resources() {
        let mut j = job("train", 1, RestartPolicy::Never);
        j.spec.run = "python train.py".to_string();
        j.spec.envs.insert("EPOCHS".to_string(), "10".to_string());
        j.spec.resources.insert("cpus".to_string(), 2.0);
        j.spec.resources.insert("memory".to_string(), 1024.0);

        let spec = KubernetesManager::pod_spec(&j, "Never");
        let container = &spec.containers[0];
        assert_eq!(
            container.command.as_ref().unwrap(),
            &vec!["sh".to_string(), "-c".to_string(), "python train.py".to_string()]
        );
        assert_eq!(container.env.as_ref().unwrap()[0].name, "EPOCHS");

        let requests = container
            .resources
            .as_ref()
            .unwrap()
            .requests
            .as_ref()
            .unwrap();
        assert_eq!(requests["cpu"].0, "2");
        assert_eq!(requests["memory"].0, "1024Mi");
        assert_eq!(spec.restart_policy.as_deref(), Some("Never"));
    }

    #[test]
    fn test_allocatable_never_exceeds_capacity() {
        let mut allocatable = NodeResourceMap::from([(
            "node-0".to_string(),
            ResourceMap::from([("cpus".to_string(), 8.0)]),
        )]);
        let capacity = NodeResourceMap::from([(
            "node-0".to_string(),
            ResourceMap::from([("cpus".to_string(), 4.0)]),
        )]);
        enforce_allocatable_bound(&mut allocatable, &capacity);
        assert_eq!(allocatable["node-0"]["cpus"], 4.0);
    }
}
