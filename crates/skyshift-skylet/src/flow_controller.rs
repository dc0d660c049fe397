//! Flow controller
//!
//! The active reconciler: compares a job's desired slice on this cluster
//! against what has been submitted, submits missing work, removes
//! deleted work, and evicts jobs that either violate a changed
//! FilterPolicy or sat in PENDING beyond the configured wait timeout.
//! Reconciliation is idempotent: a second pass over the same observed
//! state issues no backend operations.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use skyshift_client::{ApiClient, EventHandlers, Informer, InformerCache};
use skyshift_common::object::{FilterPolicy, Job, Kind, Object, ReplicaState};
use skyshift_common::Result;
use skyshift_manager::ClusterManager;

use crate::util::update_object_with;

/// How often eviction timeouts are checked
const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Work items delivered by the informers
enum FlowEvent {
    JobChanged(Job),
    JobDeleted(Job),
    PolicyChanged(FilterPolicy),
}

/// What one reconciliation pass decided to do
#[derive(Clone, Debug, PartialEq, Eq)]
enum SlicePlan {
    /// Observed state already matches desired state
    Nothing,
    /// Submit this many replicas to the backend
    Submit(u32),
}

/// Decide whether a job's slice on `cluster` needs a submission.
///
/// A slice needs work when it exists, carries INIT replicas, and either
/// has no backend id yet (fresh placement or a resubmission request) or
/// grew while running (partial placement filled in later).
fn plan_slice(job: &Job, cluster: &str) -> SlicePlan {
    let Some(slice) = job.status.replica_status.get(cluster) else {
        return SlicePlan::Nothing;
    };
    let init = slice.get(&ReplicaState::Init).copied().unwrap_or(0);
    if init == 0 {
        return SlicePlan::Nothing;
    }
    let total: u32 = slice.values().sum();
    SlicePlan::Submit(total)
}

/// Whether a pending-only slice has exceeded the wait timeout
fn should_evict(
    slice: &std::collections::BTreeMap<ReplicaState, u32>,
    pending_since: Option<Instant>,
    timeout: Option<Duration>,
) -> bool {
    let Some(timeout) = timeout else {
        return false;
    };
    let pending = slice.get(&ReplicaState::Pending).copied().unwrap_or(0);
    let running = slice.get(&ReplicaState::Running).copied().unwrap_or(0);
    if pending == 0 || running > 0 {
        return false;
    }
    pending_since
        .map(|since| since.elapsed() >= timeout)
        .unwrap_or(false)
}

/// Determines the flow of jobs in and out of one cluster
pub struct FlowController {
    cluster_name: String,
    client: ApiClient,
    manager: Arc<dyn ClusterManager>,
    job_informer: Arc<Informer>,
    policy_informer: Arc<Informer>,
    job_cache: InformerCache,
    rx: mpsc::UnboundedReceiver<FlowEvent>,
    wait_timeout: Option<Duration>,
}

impl FlowController {
    pub fn new(
        cluster_name: String,
        client: ApiClient,
        manager: Arc<dyn ClusterManager>,
        wait_timeout: Option<Duration>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();

        let job_informer = {
            let name = cluster_name.clone();
            let add_tx = tx.clone();
            let update_tx = tx.clone();
            let delete_tx = tx.clone();
            let relevant = move |obj: &Object, cluster: &str| match obj {
                Object::Job(job) => job
                    .status
                    .replica_status
                    .contains_key(cluster)
                    .then(|| job.clone()),
                _ => None,
            };
            let (add_name, update_name, delete_name) = (name.clone(), name.clone(), name);
            let add_relevant = relevant.clone();
            let update_relevant = relevant.clone();
            let handlers = EventHandlers::new()
                .on_add(move |obj| {
                    if let Some(job) = add_relevant(obj, &add_name) {
                        let _ = add_tx.send(FlowEvent::JobChanged(job));
                    }
                })
                .on_update(move |_, new| {
                    if let Some(job) = update_relevant(new, &update_name) {
                        let _ = update_tx.send(FlowEvent::JobChanged(job));
                    }
                })
                .on_delete(move |obj| {
                    if let Some(job) = relevant(obj, &delete_name) {
                        let _ = delete_tx.send(FlowEvent::JobDeleted(job));
                    }
                });
            Arc::new(Informer::new(client.clone(), Kind::Job, None).with_handlers(handlers))
        };

        let policy_informer = {
            let add_tx = tx.clone();
            let update_tx = tx;
            let handlers = EventHandlers::new()
                .on_add(move |obj| {
                    if let Object::FilterPolicy(policy) = obj {
                        let _ = add_tx.send(FlowEvent::PolicyChanged(policy.clone()));
                    }
                })
                .on_update(move |_, new| {
                    if let Object::FilterPolicy(policy) = new {
                        let _ = update_tx.send(FlowEvent::PolicyChanged(policy.clone()));
                    }
                });
            Arc::new(
                Informer::new(client.clone(), Kind::FilterPolicy, None).with_handlers(handlers),
            )
        };

        let job_cache = job_informer.cache();
        Self {
            cluster_name,
            client,
            manager,
            job_informer,
            policy_informer,
            job_cache,
            rx,
            wait_timeout,
        }
    }

    /// Run until cancelled
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(cluster = %self.cluster_name, "flow controller starting");
        let mut tasks = Vec::new();
        for informer in [self.job_informer.clone(), self.policy_informer.clone()] {
            let token = cancel.child_token();
            tasks.push(tokio::spawn(async move { informer.run(token).await }));
        }

        let mut pending_since: HashMap<String, Instant> = HashMap::new();
        let mut tick = tokio::time::interval(TICK_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = self.rx.recv() => match event {
                    None => break,
                    Some(FlowEvent::JobChanged(job)) => {
                        if let Err(err) = self.reconcile_job(&job, &mut pending_since).await {
                            error!(
                                cluster = %self.cluster_name,
                                job = %job.metadata.name,
                                error = %err,
                                "job reconciliation failed"
                            );
                        }
                    }
                    Some(FlowEvent::JobDeleted(job)) => {
                        pending_since.remove(&job.metadata.cache_key());
                        if let Err(err) = self.manager.delete_job(&job).await {
                            warn!(
                                cluster = %self.cluster_name,
                                job = %job.metadata.name,
                                error = %err,
                                "backend delete failed"
                            );
                        }
                    }
                    Some(FlowEvent::PolicyChanged(policy)) => {
                        self.enforce_policy(&policy, &mut pending_since).await;
                    }
                },
                _ = tick.tick() => {
                    self.check_wait_timeouts(&mut pending_since).await;
                }
            }
        }

        for task in tasks {
            let _ = task.await;
        }
        info!(cluster = %self.cluster_name, "flow controller stopped");
    }

    /// Submit the slice's INIT replicas, recording the backend id
    async fn reconcile_job(
        &self,
        job: &Job,
        pending_since: &mut HashMap<String, Instant>,
    ) -> Result<()> {
        let replicas = match plan_slice(job, &self.cluster_name) {
            SlicePlan::Nothing => return Ok(()),
            SlicePlan::Submit(replicas) => replicas,
        };

        let namespace = job.metadata.namespace_or_default().to_string();
        let name = job.metadata.name.clone();
        match self.manager.submit_job(job, replicas).await {
            Ok(backend_id) => {
                info!(
                    cluster = %self.cluster_name,
                    job = %name,
                    replicas,
                    backend_id = %backend_id,
                    "submitted job slice"
                );
                let cluster = self.cluster_name.clone();
                update_object_with::<Job, _>(&self.client, Some(&namespace), &name, move |fresh| {
                    let Some(slice) = fresh.status.replica_status.get_mut(&cluster) else {
                        return false;
                    };
                    let init = slice.remove(&ReplicaState::Init).unwrap_or(0);
                    if init == 0 && fresh.status.job_ids.contains_key(&cluster) {
                        return false;
                    }
                    *slice.entry(ReplicaState::Pending).or_insert(0) += init;
                    fresh
                        .status
                        .job_ids
                        .insert(cluster.clone(), backend_id.clone());
                    true
                })
                .await?;
                pending_since.insert(job.metadata.cache_key(), Instant::now());
                Ok(())
            }
            Err(err) => {
                warn!(
                    cluster = %self.cluster_name,
                    job = %name,
                    error = %err,
                    "submission failed, marking slice FAILED"
                );
                let cluster = self.cluster_name.clone();
                update_object_with::<Job, _>(&self.client, Some(&namespace), &name, move |fresh| {
                    let Some(slice) = fresh.status.replica_status.get_mut(&cluster) else {
                        return false;
                    };
                    let total: u32 = slice.values().sum();
                    slice.clear();
                    slice.insert(ReplicaState::Failed, total);
                    true
                })
                .await?;
                Err(err)
            }
        }
    }

    /// Evict governed jobs from a cluster a policy no longer allows
    async fn enforce_policy(
        &self,
        policy: &FilterPolicy,
        pending_since: &mut HashMap<String, Instant>,
    ) {
        if policy.spec.cluster_filter.allows(&self.cluster_name) {
            return;
        }
        for job in self.job_cache.snapshot_of::<Job>() {
            let governed = policy.metadata.namespace == job.metadata.namespace
                && policy.governs(&job.metadata.labels);
            if !governed || !job.status.replica_status.contains_key(&self.cluster_name) {
                continue;
            }
            info!(
                cluster = %self.cluster_name,
                job = %job.metadata.name,
                policy = %policy.metadata.name,
                "evicting job excluded by filter policy"
            );
            if let Err(err) = self.evict(&job).await {
                error!(job = %job.metadata.name, error = %err, "eviction failed");
            }
            pending_since.remove(&job.metadata.cache_key());
        }
    }

    /// Evict jobs whose first replica sat in PENDING beyond the timeout
    async fn check_wait_timeouts(&self, pending_since: &mut HashMap<String, Instant>) {
        if self.wait_timeout.is_none() {
            return;
        }
        for job in self.job_cache.snapshot_of::<Job>() {
            let Some(slice) = job.status.replica_status.get(&self.cluster_name) else {
                continue;
            };
            let key = job.metadata.cache_key();
            if !job.status.job_ids.contains_key(&self.cluster_name) {
                pending_since.remove(&key);
                continue;
            }
            if should_evict(slice, pending_since.get(&key).copied(), self.wait_timeout) {
                info!(
                    cluster = %self.cluster_name,
                    job = %job.metadata.name,
                    "evicting job stuck in PENDING beyond wait timeout"
                );
                if let Err(err) = self.evict(&job).await {
                    error!(job = %job.metadata.name, error = %err, "eviction failed");
                }
                pending_since.remove(&key);
            }
        }
    }

    /// Remove the job from the backend and mark its slice EVICTED so the
    /// scheduler re-places it.
    async fn evict(&self, job: &Job) -> Result<()> {
        if let Err(err) = self.manager.delete_job(job).await {
            debug!(job = %job.metadata.name, error = %err, "backend delete during eviction");
        }
        let cluster = self.cluster_name.clone();
        let namespace = job.metadata.namespace_or_default().to_string();
        update_object_with::<Job, _>(&self.client, Some(&namespace), &job.metadata.name, move |fresh| {
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
        .await
        .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skyshift_common::object::{ManagerType, ObjectMeta};
    use skyshift_manager::{ClusterSnapshot, ReplicaCounts};
    use std::collections::BTreeMap;

    mockall::mock! {
        Manager {}

        #[async_trait::async_trait]
        impl ClusterManager for Manager {
            fn cluster_name(&self) -> &str;
            fn manager_type(&self) -> ManagerType;
            async fn describe(&self) -> skyshift_common::Result<ClusterSnapshot>;
            async fn submit_job(&self, job: &Job, replicas: u32) -> skyshift_common::Result<String>;
            async fn delete_job(&self, job: &Job) -> skyshift_common::Result<()>;
            async fn poll_job(&self, job: &Job) -> skyshift_common::Result<ReplicaCounts>;
            async fn job_logs(&self, job: &Job) -> skyshift_common::Result<Vec<String>>;
        }
    }

    fn controller_with(manager: MockManager) -> FlowController {
        FlowController::new(
            "c1".to_string(),
            ApiClient::new("http://127.0.0.1:1"),
            Arc::new(manager),
            None,
        )
    }

    #[tokio::test]
    async fn test_reconcile_skips_backend_when_slice_already_submitted() {
        // No expectations registered: any backend call would panic the
        // mock. Running the reconciler twice over already-submitted
        // state must issue no operations.
        let controller = controller_with(MockManager::new());
        let job = job_with_slice(&[(ReplicaState::Pending, 2)], Some("id-1"));
        let mut pending = HashMap::new();
        controller.reconcile_job(&job, &mut pending).await.unwrap();
        controller.reconcile_job(&job, &mut pending).await.unwrap();
    }

    #[tokio::test]
    async fn test_reconcile_submits_init_slice_exactly_once_per_pass() {
        let mut manager = MockManager::new();
        manager
            .expect_submit_job()
            .times(1)
            .returning(|_, _| Ok("backend-1".to_string()));
        let controller = controller_with(manager);

        let job = job_with_slice(&[(ReplicaState::Init, 2)], None);
        let mut pending = HashMap::new();
        // The status write fails (no API server behind the client), but
        // the backend submission must have happened exactly once.
        let _ = controller.reconcile_job(&job, &mut pending).await;
    }

    fn job_with_slice(states: &[(ReplicaState, u32)], backend_id: Option<&str>) -> Job {
        let mut job = Job {
            metadata: ObjectMeta::namespaced("j", "default"),
            ..Default::default()
        };
        job.status
            .replica_status
            .insert("c1".to_string(), states.iter().copied().collect());
        if let Some(id) = backend_id {
            job.status.job_ids.insert("c1".to_string(), id.to_string());
        }
        job
    }

    #[test]
    fn test_plan_submits_init_replicas() {
        let job = job_with_slice(&[(ReplicaState::Init, 3)], None);
        assert_eq!(plan_slice(&job, "c1"), SlicePlan::Submit(3));
    }

    #[test]
    fn test_plan_is_idempotent_after_submission() {
        // Same observed state twice: the second pass plans nothing, so no
        // backend operation is issued.
        let job = job_with_slice(&[(ReplicaState::Pending, 3)], Some("id-1"));
        assert_eq!(plan_slice(&job, "c1"), SlicePlan::Nothing);

        let running = job_with_slice(&[(ReplicaState::Running, 3)], Some("id-1"));
        assert_eq!(plan_slice(&running, "c1"), SlicePlan::Nothing);
    }

    #[test]
    fn test_plan_resubmits_grown_slice() {
        // Partial placement later filled in: 2 running plus 1 fresh INIT.
        let job = job_with_slice(
            &[(ReplicaState::Running, 2), (ReplicaState::Init, 1)],
            Some("id-1"),
        );
        assert_eq!(plan_slice(&job, "c1"), SlicePlan::Submit(3));
    }

    #[test]
    fn test_plan_ignores_other_clusters() {
        let job = job_with_slice(&[(ReplicaState::Init, 2)], None);
        assert_eq!(plan_slice(&job, "c2"), SlicePlan::Nothing);
    }

    #[test]
    fn test_should_evict_requires_timeout_and_pending() {
        let pending: BTreeMap<ReplicaState, u32> =
            BTreeMap::from([(ReplicaState::Pending, 2)]);
        let long_ago = Instant::now() - Duration::from_secs(120);

        // Unbounded by default: never evict.
        assert!(!should_evict(&pending, Some(long_ago), None));
        // Past the timeout: evict.
        assert!(should_evict(
            &pending,
            Some(long_ago),
            Some(Duration::from_secs(60))
        ));
        // Fresh pending: wait.
        assert!(!should_evict(
            &pending,
            Some(Instant::now()),
            Some(Duration::from_secs(60))
        ));
        // Any running replica disqualifies eviction.
        let mixed: BTreeMap<ReplicaState, u32> = BTreeMap::from([
            (ReplicaState::Pending, 1),
            (ReplicaState::Running, 1),
        ]);
        assert!(!should_evict(
            &mixed,
            Some(long_ago),
            Some(Duration::from_secs(60))
        ));
    }
}
