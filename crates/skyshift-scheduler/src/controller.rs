//! Scheduler controller
//!
//! Subscribes to Job, Cluster and FilterPolicy informers, drains a FIFO
//! queue with a single worker, and commits placements optimistically.
//! Jobs that could not be (fully) placed sit on a waitlist that is
//! rechecked whenever a cluster's allocatable capacity grows.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use skyshift_client::{ApiClient, EventHandlers, Informer, InformerCache};
use skyshift_common::object::{
    Cluster, FilterPolicy, Job, JobPhase, Kind, Object, ReplicaState,
};
use skyshift_common::resources::{self, NodeResourceMap};
use skyshift_common::{Error, Result};

use crate::placement::{Placer, PlacementOutcome};
use crate::plugins::{default_plugin_names, FilterComposition};
use crate::queue::{JobQueue, JobRef};

/// Scheduler configuration
#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    /// Plugin pipeline, by registry name
    pub plugins: Vec<String>,
    /// How `placement.filters` stanzas compose
    pub filter_composition: FilterComposition,
    /// Bound on reread-and-retry rounds after a commit conflict
    pub commit_attempts: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            plugins: default_plugin_names(),
            filter_composition: FilterComposition::Or,
            commit_attempts: 5,
        }
    }
}

/// Cross-cluster job scheduler
pub struct SchedulerController {
    client: ApiClient,
    placer: Placer,
    config: SchedulerConfig,
    queue: Arc<JobQueue>,
    waitlist: Arc<Mutex<BTreeSet<JobRef>>>,
    job_informer: Arc<Informer>,
    cluster_informer: Arc<Informer>,
    policy_informer: Arc<Informer>,
    cluster_cache: InformerCache,
    policy_cache: InformerCache,
}

impl SchedulerController {
    /// Build the controller and wire its informer callbacks
    pub fn new(client: ApiClient, config: SchedulerConfig) -> Result<Self> {
        let placer = Placer::new(&config.plugins, config.filter_composition)?;
        let queue = Arc::new(JobQueue::new());
        let waitlist = Arc::new(Mutex::new(BTreeSet::new()));

        // Job events: fresh jobs and spec changes enqueue; evictions
        // re-enqueue with the evicted slice cleared on the next pass.
        let job_informer = {
            let add_queue = queue.clone();
            let update_queue = queue.clone();
            let handlers = EventHandlers::new()
                .on_add(move |obj| {
                    if let Object::Job(job) = obj {
                        if job.status.replica_status.is_empty() {
                            add_queue.push(job_ref(job));
                        }
                    }
                })
                .on_update(move |old, new| {
                    let (Object::Job(old), Object::Job(new)) = (old, new) else {
                        return;
                    };
                    if spec_requires_rescheduling(old, new) || has_evictions(new) {
                        update_queue.push(job_ref(new));
                    }
                });
            Arc::new(
                Informer::new(client.clone(), Kind::Job, None).with_handlers(handlers),
            )
        };

        // Cluster events: an allocatable increase wakes the waitlist.
        let cluster_informer = {
            let prev_alloc: Arc<Mutex<HashMap<String, NodeResourceMap>>> =
                Arc::new(Mutex::new(HashMap::new()));
            let add_state = (queue.clone(), waitlist.clone(), prev_alloc.clone());
            let update_state = (queue.clone(), waitlist.clone(), prev_alloc);

            let on_cluster = move |state: &(
                Arc<JobQueue>,
                Arc<Mutex<BTreeSet<JobRef>>>,
                Arc<Mutex<HashMap<String, NodeResourceMap>>>,
            ),
                                   obj: &Object| {
                let Object::Cluster(cluster) = obj else { return };
                let (queue, waitlist, prev_alloc) = state;
                let name = cluster.metadata.name.clone();
                let current = cluster.status.allocatable_capacity.clone();
                let grew = {
                    let mut prev = prev_alloc.lock().expect("alloc lock poisoned");
                    let grew = match prev.get(&name) {
                        None => !current.is_empty(),
                        Some(before) => allocatable_grew(before, &current),
                    };
                    prev.insert(name, current);
                    grew
                };
                if grew {
                    let waiting: Vec<JobRef> = {
                        let mut list = waitlist.lock().expect("waitlist lock poisoned");
                        std::mem::take(&mut *list).into_iter().collect()
                    };
                    for job in waiting {
                        debug!(job = %job, "capacity increased, re-queueing waitlisted job");
                        queue.push(job);
                    }
                }
            };

            let add_fn = on_cluster.clone();
            let handlers = EventHandlers::new()
                .on_add(move |obj| add_fn(&add_state, obj))
                .on_update(move |_, new| on_cluster(&update_state, new));
            Arc::new(
                Informer::new(client.clone(), Kind::Cluster, None).with_handlers(handlers),
            )
        };

        let policy_informer =
            Arc::new(Informer::new(client.clone(), Kind::FilterPolicy, None));

        let cluster_cache = cluster_informer.cache();
        let policy_cache = policy_informer.cache();

        Ok(Self {
            client,
            placer,
            config,
            queue,
            waitlist,
            job_informer,
            cluster_informer,
            policy_informer,
            cluster_cache,
            policy_cache,
        })
    }

    /// Run informers and the single scheduling worker until cancelled
    pub async fn run(&self, cancel: CancellationToken) {
        info!("scheduler starting");
        let mut tasks = Vec::new();
        for informer in [
            self.job_informer.clone(),
            self.cluster_informer.clone(),
            self.policy_informer.clone(),
        ] {
            let token = cancel.child_token();
            tasks.push(tokio::spawn(async move { informer.run(token).await }));
        }

        while let Some(job) = self.queue.pop(&cancel).await {
            if let Err(err) = self.schedule_one(&job).await {
                if err.is_not_found() {
                    debug!(job = %job, "job vanished before scheduling");
                } else {
                    error!(job = %job, error = %err, "scheduling pass failed");
                }
            }
        }

        for task in tasks {
            let _ = task.await;
        }
        info!("scheduler stopped");
    }

    /// One scheduling pass for one job; conflicts reread and restart the
    /// job's iteration, never the whole queue.
    async fn schedule_one(&self, job_ref: &JobRef) -> Result<()> {
        let mut obj = self
            .client
            .get(Kind::Job, Some(&job_ref.namespace), &job_ref.name)
            .await?;

        for _attempt in 0..self.config.commit_attempts {
            let Object::Job(mut job) = obj.clone() else {
                return Err(Error::fatal("scheduler", "job informer delivered non-job"));
            };

            clear_evicted_slices(&mut job);
            let placed = job.status.placed_replicas();
            let remaining = job.spec.replicas.saturating_sub(placed);

            if remaining == 0 {
                if job.status.status != JobPhase::Scheduled && placed == job.spec.replicas {
                    job.status.set_phase(JobPhase::Scheduled);
                } else {
                    return Ok(());
                }
            } else {
                let clusters: Vec<Cluster> = self
                    .cluster_cache
                    .snapshot_of::<Cluster>()
                    .into_iter()
                    .filter(Cluster::is_ready)
                    .collect();
                let policies: Vec<FilterPolicy> = self
                    .policy_cache
                    .snapshot_of::<FilterPolicy>()
                    .into_iter()
                    .filter(|p| p.metadata.namespace.as_deref() == Some(&job_ref.namespace))
                    .collect();

                let outcome = self.placer.place(&job, remaining, &clusters, policies);
                self.apply_outcome(&mut job, &outcome, job_ref);
            }

            match self.client.update(&Object::Job(job)).await {
                Ok(_) => return Ok(()),
                Err(err) if err.is_conflict() => {
                    debug!(job = %job_ref, "commit conflict, rereading");
                    obj = self
                        .client
                        .get(Kind::Job, Some(&job_ref.namespace), &job_ref.name)
                        .await?;
                }
                Err(err) => return Err(err),
            }
        }

        warn!(job = %job_ref, "giving up after repeated commit conflicts, re-queueing");
        self.queue.push(job_ref.clone());
        Ok(())
    }

    /// Fold a placement outcome into the job's status
    fn apply_outcome(&self, job: &mut Job, outcome: &PlacementOutcome, job_ref: &JobRef) {
        if outcome.empty() && job.status.placed_replicas() == 0 {
            let message = summarize_rejections(&outcome.rejections);
            info!(job = %job_ref, reason = %message, "job is unschedulable");
            job.status
                .set_phase_with(JobPhase::Pending, "Unschedulable", &message);
            self.waitlist
                .lock()
                .expect("waitlist lock poisoned")
                .insert(job_ref.clone());
            return;
        }

        merge_allocation(job, &outcome.allocation);
        if outcome.complete() && job.status.placed_replicas() == job.spec.replicas {
            info!(job = %job_ref, allocation = ?outcome.allocation, "job scheduled");
            job.status.set_phase(JobPhase::Scheduled);
            self.waitlist
                .lock()
                .expect("waitlist lock poisoned")
                .remove(job_ref);
        } else {
            info!(
                job = %job_ref,
                allocation = ?outcome.allocation,
                unplaced = outcome.unplaced,
                "partial placement, remainder waits for capacity"
            );
            job.status.set_phase_with(
                JobPhase::Pending,
                "PartiallyScheduled",
                &format!("{} replica(s) waiting for capacity", outcome.unplaced),
            );
            self.waitlist
                .lock()
                .expect("waitlist lock poisoned")
                .insert(job_ref.clone());
        }
    }
}

fn job_ref(job: &Job) -> JobRef {
    JobRef::new(job.metadata.namespace_or_default(), job.metadata.name.clone())
}

/// Spec changes that invalidate an existing placement
fn spec_requires_rescheduling(old: &Job, new: &Job) -> bool {
    old.spec.placement != new.spec.placement
        || old.spec.resources != new.spec.resources
        || old.spec.replicas != new.spec.replicas
}

/// Whether any cluster slice reports evicted replicas
fn has_evictions(job: &Job) -> bool {
    job.status
        .aggregate()
        .get(&ReplicaState::Evicted)
        .copied()
        .unwrap_or(0)
        > 0
}

/// Drop evicted counts (and empty slices) so the pass below re-places them
fn clear_evicted_slices(job: &mut Job) {
    let mut emptied = Vec::new();
    for (cluster, slice) in job.status.replica_status.iter_mut() {
        slice.remove(&ReplicaState::Evicted);
        if slice.is_empty() {
            emptied.push(cluster.clone());
        }
    }
    for cluster in emptied {
        job.status.replica_status.remove(&cluster);
        job.status.job_ids.remove(&cluster);
    }
}

/// Add newly allocated replicas to the job's slices as INIT counts
fn merge_allocation(job: &mut Job, allocation: &std::collections::BTreeMap<String, u32>) {
    for (cluster, count) in allocation {
        let slice = job
            .status
            .replica_status
            .entry(cluster.clone())
            .or_default();
        *slice.entry(ReplicaState::Init).or_insert(0) += count;
    }
}

/// Any capacity dimension strictly above its previous total
fn allocatable_grew(before: &NodeResourceMap, after: &NodeResourceMap) -> bool {
    let names: BTreeSet<&String> = after
        .values()
        .flat_map(|node| node.keys())
        .collect();
    names.into_iter().any(|name| {
        resources::total_of(after, name) > resources::total_of(before, name)
    })
}

fn summarize_rejections(rejections: &[String]) -> String {
    if rejections.is_empty() {
        return "no cluster in READY state".to_string();
    }
    let mut message = rejections.join("; ");
    const LIMIT: usize = 512;
    if message.len() > LIMIT {
        message.truncate(LIMIT);
        message.push_str("...");
    }
    message
}
