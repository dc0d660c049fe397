//! Store-level property checks
//!
//! Exercises the guarantees the rest of the control plane leans on:
//! exactly-one-winner optimistic updates under real concurrency, gapless
//! ordered watch resume, and replica-conservation bookkeeping across a
//! simulated schedule/report cycle.

use std::sync::Arc;

use futures::StreamExt;
use skyshift_common::object::{
    Job, JobPhase, Kind, Object, ObjectMeta, ReplicaState, WatchEventType,
};
use skyshift_store::{MemoryStore, ObjectStore};

fn store() -> ObjectStore {
    ObjectStore::new(Arc::new(MemoryStore::new()))
}

fn job(name: &str) -> Object {
    Object::Job(Job {
        metadata: ObjectMeta::namespaced(name, "default"),
        ..Default::default()
    })
}

#[tokio::test]
async fn test_concurrent_updates_exactly_one_wins() {
    let store = store();
    let created = store.create(job("contested")).await.unwrap();

    // Ten writers race from the same observed version.
    let mut handles = Vec::new();
    for index in 0..10u32 {
        let store = store.clone();
        let mut attempt = created.clone();
        handles.push(tokio::spawn(async move {
            if let Object::Job(j) = &mut attempt {
                j.spec.replicas = index + 1;
            }
            store.update(attempt).await
        }));
    }

    let mut winners = 0;
    let mut conflicts = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => winners += 1,
            Err(err) if err.is_conflict() => conflicts += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(winners, 1);
    assert_eq!(conflicts, 9);
}

#[tokio::test]
async fn test_watch_resume_observes_every_version_in_order() {
    let store = store();

    // Create one object and update it repeatedly: versions v1 < ... < vn.
    let mut obj = store.create(job("history")).await.unwrap();
    let mut versions = vec![obj.metadata().resource_version];
    for _ in 0..5 {
        obj = store.update(obj).await.unwrap();
        versions.push(obj.metadata().resource_version);
    }

    // A watcher that saw only v2 resumes from v3 and must observe
    // everything in (v2, vn], in order, with no duplicates.
    let resume_from = versions[1] + 1;
    let mut watch = store
        .watch(Kind::Job, Some("default"), Some(resume_from))
        .await
        .unwrap();

    let mut observed = Vec::new();
    for _ in versions.iter().filter(|v| **v >= resume_from) {
        let event = watch.next().await.unwrap().unwrap();
        observed.push(event.object.metadata().resource_version);
    }
    assert_eq!(observed, versions[2..].to_vec());
}

#[tokio::test]
async fn test_watch_interleaves_kinds_without_cross_talk() {
    let store = store();
    let mut jobs_watch = store.watch(Kind::Job, Some("default"), None).await.unwrap();

    store.create(job("mine")).await.unwrap();
    store
        .create(Object::Namespace(skyshift_common::object::Namespace::new(
            "other",
        )))
        .await
        .unwrap();
    store.create(job("mine-too")).await.unwrap();

    // Only job events arrive on the job watch, in creation order.
    let first = jobs_watch.next().await.unwrap().unwrap();
    let second = jobs_watch.next().await.unwrap().unwrap();
    assert_eq!(first.object.name(), "mine");
    assert_eq!(second.object.name(), "mine-too");
    assert_eq!(second.event_type, WatchEventType::Add);
}

#[tokio::test]
async fn test_replica_conservation_across_status_updates() {
    let store = store();
    let mut created = store.create(job("spread")).await.unwrap();
    if let Object::Job(j) = &mut created {
        j.spec.replicas = 4;
    }
    let stored = store.update(created).await.unwrap();

    // The scheduler commits a spread over two clusters.
    let mut scheduled = stored.clone();
    if let Object::Job(j) = &mut scheduled {
        j.status
            .replica_status
            .entry("c1".to_string())
            .or_default()
            .insert(ReplicaState::Init, 2);
        j.status
            .replica_status
            .entry("c2".to_string())
            .or_default()
            .insert(ReplicaState::Init, 2);
        j.status.set_phase(JobPhase::Scheduled);
    }
    let committed = store.update_status(&scheduled).await.unwrap();

    // A skylet reports one slice moving to RUNNING; totals still match
    // spec.replicas.
    let mut reported = committed.clone();
    if let Object::Job(j) = &mut reported {
        j.status.replica_status.insert(
            "c1".to_string(),
            [(ReplicaState::Running, 2)].into_iter().collect(),
        );
    }
    let after = store.update_status(&reported).await.unwrap();

    let Object::Job(final_job) = after else { panic!("expected job") };
    let placed: u32 = final_job.status.placed_replicas();
    assert_eq!(placed, final_job.spec.replicas);
    assert_eq!(final_job.status.status, JobPhase::Scheduled);
    // And the spec was never writable through the status path.
    assert_eq!(final_job.spec.replicas, 4);
}
