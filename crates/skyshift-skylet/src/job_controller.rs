//! Job controller
//!
//! Polls the backend for every job holding a slice on this cluster and
//! writes the observed replica states back. Restart policy is applied
//! per slice: `Never` freezes terminal slices, `OnFailure` hands the
//! slice back to the flow controller for resubmission, and `Always`
//! marks unexpectedly exited replicas EVICTED so the scheduler re-places
//! them.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use skyshift_client::{ApiClient, Informer, InformerCache};
use skyshift_common::object::{Job, JobPhase, JobStatus, Kind, ReplicaState, RestartPolicy};
use skyshift_common::Result;
use skyshift_manager::{ClusterManager, ReplicaCounts};

use crate::util::update_object_with;

/// Default backend poll interval
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(3);

/// Tracks the state of running jobs on one cluster
pub struct JobController {
    cluster_name: String,
    client: ApiClient,
    manager: Arc<dyn ClusterManager>,
    poll_interval: Duration,
    informer: Arc<Informer>,
    cache: InformerCache,
}

impl JobController {
    pub fn new(
        cluster_name: String,
        client: ApiClient,
        manager: Arc<dyn ClusterManager>,
        poll_interval: Duration,
    ) -> Self {
        let informer = Arc::new(Informer::new(client.clone(), Kind::Job, None));
        let cache = informer.cache();
        Self {
            cluster_name,
            client,
            manager,
            poll_interval,
            informer,
            cache,
        }
    }

    /// Poll until cancelled
    pub async fn run(&self, cancel: CancellationToken) {
        info!(cluster = %self.cluster_name, "job controller starting");
        let informer = self.informer.clone();
        let informer_task = {
            let token = cancel.child_token();
            tokio::spawn(async move { informer.run(token).await })
        };

        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            self.poll_once().await;
        }

        let _ = informer_task.await;
        info!(cluster = %self.cluster_name, "job controller stopped");
    }

    async fn poll_once(&self) {
        for job in self.cache.snapshot_of::<Job>() {
            if !job.status.job_ids.contains_key(&self.cluster_name) {
                continue;
            }
            match self.manager.poll_job(&job).await {
                Ok(counts) => {
                    if let Err(err) = self.reconcile_slice(&job, counts).await {
                        warn!(
                            cluster = %self.cluster_name,
                            job = %job.metadata.name,
                            error = %err,
                            "slice update failed"
                        );
                    }
                }
                Err(err) => {
                    debug!(
                        cluster = %self.cluster_name,
                        job = %job.metadata.name,
                        error = %err,
                        "backend poll failed"
                    );
                }
            }
        }
    }

    /// Write observed counts back, applying the restart policy
    async fn reconcile_slice(&self, job: &Job, observed: ReplicaCounts) -> Result<()> {
        let cluster = self.cluster_name.clone();
        let namespace = job.metadata.namespace_or_default().to_string();
        let name = job.metadata.name.clone();

        update_object_with::<Job, _>(&self.client, Some(&namespace), &name, move |fresh| {
            let Some(current) = fresh.status.replica_status.get(&cluster) else {
                // The slice vanished (evicted or purged) since the poll.
                return false;
            };
            let desired = apply_restart_policy(
                fresh.spec.restart_policy,
                current,
                &observed,
            );
            let wrote = match desired {
                SliceAction::Unchanged => false,
                SliceAction::Record(counts) => {
                    if *current == counts {
                        false
                    } else {
                        fresh.status.replica_status.insert(cluster.clone(), counts);
                        true
                    }
                }
                SliceAction::Resubmit(replicas) => {
                    // Hand the slice back to the flow controller.
                    fresh.status.job_ids.remove(&cluster);
                    fresh.status.replica_status.insert(
                        cluster.clone(),
                        BTreeMap::from([(ReplicaState::Init, replicas)]),
                    );
                    true
                }
            };

            // Fold the new slice states into the aggregate phase.
            let phase_changed = match derive_phase(&fresh.status, fresh.spec.replicas) {
                Some(phase) if fresh.status.status != phase => {
                    fresh.status.set_phase(phase);
                    true
                }
                _ => false,
            };
            wrote || phase_changed
        })
        .await
        .map(|_| ())
    }
}

/// Derive the aggregate phase from per-cluster slice states.
///
/// Returns `None` when the observation does not justify a transition
/// (scheduling-time phases stay with the scheduler).
fn derive_phase(status: &JobStatus, replicas: u32) -> Option<JobPhase> {
    let aggregate = status.aggregate();
    let count = |state: ReplicaState| aggregate.get(&state).copied().unwrap_or(0);

    if count(ReplicaState::Completed) >= replicas {
        return Some(JobPhase::Complete);
    }
    if count(ReplicaState::Running) > 0 {
        return Some(JobPhase::Running);
    }
    let live = count(ReplicaState::Init) + count(ReplicaState::Pending);
    if count(ReplicaState::Failed) > 0 && live == 0 {
        return Some(JobPhase::Failed);
    }
    None
}

/// What to do with a slice after one observation
#[derive(Clone, Debug, PartialEq, Eq)]
enum SliceAction {
    /// Nothing to write
    Unchanged,
    /// Record these counts as the slice state
    Record(BTreeMap<ReplicaState, u32>),
    /// Clear the backend id and reset the slice for resubmission
    Resubmit(u32),
}

/// Fold the restart policy into one observation of a slice
fn apply_restart_policy(
    policy: RestartPolicy,
    current: &BTreeMap<ReplicaState, u32>,
    observed: &ReplicaCounts,
) -> SliceAction {
    let failed = observed.get(&ReplicaState::Failed).copied().unwrap_or(0);
    let completed = observed.get(&ReplicaState::Completed).copied().unwrap_or(0);
    let total: u32 = current.values().sum();

    match policy {
        RestartPolicy::Never => {
            // Terminal slices freeze at their final counts.
            SliceAction::Record(observed.clone())
        }
        RestartPolicy::OnFailure if failed > 0 => SliceAction::Resubmit(total),
        RestartPolicy::OnFailure => SliceAction::Record(observed.clone()),
        RestartPolicy::Always if failed > 0 || completed > 0 => {
            // Exits are unexpected under Always; the exited replicas
            // re-enter the scheduler as EVICTED.
            let mut counts = observed.clone();
            counts.remove(&ReplicaState::Failed);
            counts.remove(&ReplicaState::Completed);
            *counts.entry(ReplicaState::Evicted).or_insert(0) += failed + completed;
            SliceAction::Record(counts)
        }
        RestartPolicy::Always => SliceAction::Record(observed.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counts(pairs: &[(ReplicaState, u32)]) -> BTreeMap<ReplicaState, u32> {
        pairs.iter().copied().collect()
    }

    #[test]
    fn test_never_records_terminal_states() {
        let action = apply_restart_policy(
            RestartPolicy::Never,
            &counts(&[(ReplicaState::Running, 2)]),
            &counts(&[(ReplicaState::Completed, 1), (ReplicaState::Failed, 1)]),
        );
        assert_eq!(
            action,
            SliceAction::Record(counts(&[
                (ReplicaState::Completed, 1),
                (ReplicaState::Failed, 1)
            ]))
        );
    }

    #[test]
    fn test_on_failure_resubmits_whole_slice() {
        let action = apply_restart_policy(
            RestartPolicy::OnFailure,
            &counts(&[(ReplicaState::Running, 1), (ReplicaState::Failed, 1)]),
            &counts(&[(ReplicaState::Running, 1), (ReplicaState::Failed, 1)]),
        );
        assert_eq!(action, SliceAction::Resubmit(2));
    }

    #[test]
    fn test_on_failure_without_failures_records() {
        let observed = counts(&[(ReplicaState::Running, 2)]);
        let action = apply_restart_policy(
            RestartPolicy::OnFailure,
            &counts(&[(ReplicaState::Pending, 2)]),
            &observed,
        );
        assert_eq!(action, SliceAction::Record(observed));
    }

    #[test]
    fn test_derive_phase_transitions() {
        let mut status = JobStatus::default();
        status
            .replica_status
            .insert("c1".to_string(), counts(&[(ReplicaState::Running, 1)]));
        assert_eq!(derive_phase(&status, 2), Some(JobPhase::Running));

        status
            .replica_status
            .insert("c1".to_string(), counts(&[(ReplicaState::Completed, 2)]));
        assert_eq!(derive_phase(&status, 2), Some(JobPhase::Complete));

        status
            .replica_status
            .insert("c1".to_string(), counts(&[(ReplicaState::Failed, 2)]));
        assert_eq!(derive_phase(&status, 2), Some(JobPhase::Failed));

        // Pending replicas keep the failure verdict open.
        status.replica_status.insert(
            "c1".to_string(),
            counts(&[(ReplicaState::Failed, 1), (ReplicaState::Pending, 1)]),
        );
        assert_eq!(derive_phase(&status, 2), None);
    }

    #[test]
    fn test_always_converts_exits_to_evictions() {
        let action = apply_restart_policy(
            RestartPolicy::Always,
            &counts(&[(ReplicaState::Running, 3)]),
            &counts(&[(ReplicaState::Running, 1), (ReplicaState::Completed, 2)]),
        );
        assert_eq!(
            action,
            SliceAction::Record(counts(&[
                (ReplicaState::Running, 1),
                (ReplicaState::Evicted, 2)
            ]))
        );
    }
}
